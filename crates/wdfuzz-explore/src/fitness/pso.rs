//! Generational particle swarm optimizer.
//!
//! Minimises the evaluator's score inside a box. Each particle keeps its own
//! best position; velocities are pulled toward the particle best and the
//! swarm best with random weights, clamped to a fraction of the box width.
//! The swarm persists across `evolve` calls.

use rand::Rng;
use rand_chacha::ChaCha8Rng;
use tracing::debug;

use super::{Evaluator, Optimizer, Problem};
use crate::error::OptimizerError;
use crate::rng::{seeded_rng, RngStream};

/// Tuning constants of the swarm.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SwarmParams {
    pub inertia: f64,
    pub cognitive: f64,
    pub social: f64,
    /// Maximum speed as a fraction of the bound width.
    pub max_velocity: f64,
}

impl Default for SwarmParams {
    fn default() -> Self {
        Self {
            inertia: 0.7298,
            cognitive: 1.496_18,
            social: 1.496_18,
            max_velocity: 0.5,
        }
    }
}

#[derive(Debug, Clone)]
struct Particle {
    position: Vec<f64>,
    velocity: Vec<f64>,
    best_position: Vec<f64>,
    best_score: f64,
}

#[derive(Debug, Clone)]
struct Swarm {
    particles: Vec<Particle>,
    best_position: Vec<f64>,
    best_score: f64,
    generation: u64,
}

pub struct ParticleSwarm {
    population: usize,
    generations: u32,
    params: SwarmParams,
    rng: ChaCha8Rng,
    swarm: Option<Swarm>,
}

impl std::fmt::Debug for ParticleSwarm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ParticleSwarm")
            .field("population", &self.population)
            .field("generations", &self.generations)
            .field("params", &self.params)
            .finish_non_exhaustive()
    }
}

fn score_of(raw: f64) -> f64 {
    if raw.is_nan() {
        f64::INFINITY
    } else {
        raw
    }
}

impl ParticleSwarm {
    pub fn new(population: usize, generations: u32, seed: u64) -> Self {
        Self {
            population: population.max(1),
            generations,
            params: SwarmParams::default(),
            rng: seeded_rng(seed, RngStream::Optimizer),
            swarm: None,
        }
    }

    pub fn with_params(mut self, params: SwarmParams) -> Self {
        self.params = params;
        self
    }

    /// Best score seen so far, if any particle has been evaluated.
    pub fn best_score(&self) -> Option<f64> {
        self.swarm.as_ref().map(|s| s.best_score)
    }

    fn initialise(
        &mut self,
        problem: &Problem,
        evaluator: &mut dyn Evaluator,
    ) -> Result<Swarm, OptimizerError> {
        let vmax = self.params.max_velocity * problem.width();
        let mut particles = Vec::with_capacity(self.population);
        let mut best: Option<(Vec<f64>, f64)> = None;

        for _ in 0..self.population {
            let position: Vec<f64> = (0..problem.dimension)
                .map(|_| self.rng.gen_range(problem.lower..=problem.upper))
                .collect();
            let velocity: Vec<f64> = (0..problem.dimension)
                .map(|_| self.rng.gen_range(-vmax..=vmax))
                .collect();
            let score = score_of(evaluator.evaluate(&position)?);
            if best.as_ref().map_or(true, |(_, b)| score < *b) {
                best = Some((position.clone(), score));
            }
            particles.push(Particle {
                best_position: position.clone(),
                position,
                velocity,
                best_score: score,
            });
        }

        let (best_position, best_score) = best.unwrap_or((Vec::new(), f64::INFINITY));
        Ok(Swarm {
            particles,
            best_position,
            best_score,
            generation: 0,
        })
    }

    fn step(
        &mut self,
        swarm: &mut Swarm,
        problem: &Problem,
        evaluator: &mut dyn Evaluator,
    ) -> Result<(), OptimizerError> {
        let p = self.params;
        let vmax = p.max_velocity * problem.width();

        for particle in &mut swarm.particles {
            for d in 0..problem.dimension {
                let r1: f64 = self.rng.gen();
                let r2: f64 = self.rng.gen();
                let v = p.inertia * particle.velocity[d]
                    + p.cognitive * r1 * (particle.best_position[d] - particle.position[d])
                    + p.social * r2 * (swarm.best_position[d] - particle.position[d]);
                particle.velocity[d] = v.clamp(-vmax, vmax);
                particle.position[d] =
                    (particle.position[d] + particle.velocity[d]).clamp(problem.lower, problem.upper);
            }
        }

        for particle in &mut swarm.particles {
            let score = score_of(evaluator.evaluate(&particle.position)?);
            if score < particle.best_score {
                particle.best_score = score;
                particle.best_position.clone_from(&particle.position);
            }
            if score < swarm.best_score {
                swarm.best_score = score;
                swarm.best_position.clone_from(&particle.position);
            }
        }

        swarm.generation += 1;
        let mean_speed = swarm
            .particles
            .iter()
            .flat_map(|pt| pt.velocity.iter())
            .map(|v| v.abs())
            .sum::<f64>()
            / (swarm.particles.len() * problem.dimension).max(1) as f64;
        debug!(
            generation = swarm.generation,
            gbest = swarm.best_score,
            mean_speed,
            "swarm generation"
        );
        Ok(())
    }
}

impl Optimizer for ParticleSwarm {
    fn name(&self) -> &str {
        "particle-swarm"
    }

    fn set_seed(&mut self, seed: u64) {
        self.rng = seeded_rng(seed, RngStream::Optimizer);
    }

    fn evolve(
        &mut self,
        problem: &Problem,
        evaluator: &mut dyn Evaluator,
    ) -> Result<(), OptimizerError> {
        let mut swarm = match self.swarm.take() {
            Some(swarm) => swarm,
            None => self.initialise(problem, evaluator)?,
        };
        for _ in 0..self.generations {
            // Keep progress if the evaluator disconnects mid-generation.
            if let Err(e) = self.step(&mut swarm, problem, evaluator) {
                self.swarm = Some(swarm);
                return Err(e);
            }
        }
        self.swarm = Some(swarm);
        Ok(())
    }
}
