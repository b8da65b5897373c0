//! Adaptive fitness engine.
//!
//! A population-based [`Optimizer`] runs on its own thread and asks for the
//! fitness of one candidate probability vector at a time. Each request is a
//! rendezvous: the optimizer thread publishes the candidate, hands it over on
//! a zero-capacity channel and blocks until [`FitnessEngine::iteration`]
//! supplies the score observed over one fuzzing campaign. `iteration` in turn
//! returns only once the optimizer has published the next candidate.
//!
//! ```text
//! Idle -> PopulationReady -> AwaitingFitness -> Advancing -> AwaitingFitness -> ...
//! ```

pub mod pso;
pub mod session;

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam::channel::{bounded, Receiver, Sender};
use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::config::FuzzingConfig;
use crate::error::{OptimizerError, SessionError};
use crate::limits::{ResourceChecker, StopConditions, StopReason};
use crate::probability::ProbabilityTable;

pub use pso::{ParticleSwarm, SwarmParams};
pub use session::{FuzzingSession, SESSION_VERSION};

/// Box bounds of every probability the optimizer proposes.
pub const PROBABILITY_BOUNDS: (f64, f64) = (0.0, 0.2);

/// Search space handed to an [`Optimizer`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Problem {
    pub dimension: usize,
    pub lower: f64,
    pub upper: f64,
}

impl Problem {
    pub fn width(&self) -> f64 {
        self.upper - self.lower
    }
}

/// Scores candidates for an optimizer. Lower is better.
pub trait Evaluator {
    fn evaluate(&mut self, candidate: &[f64]) -> Result<f64, OptimizerError>;
}

/// A global optimization algorithm driving candidate evaluation.
pub trait Optimizer: Send {
    fn name(&self) -> &str;

    fn set_seed(&mut self, seed: u64);

    /// Run a batch of generations. Returns an error as soon as the
    /// evaluator does.
    fn evolve(&mut self, problem: &Problem, evaluator: &mut dyn Evaluator)
        -> Result<(), OptimizerError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FitnessState {
    /// Not started.
    Idle,
    /// The first candidate has been published.
    PopulationReady,
    /// A candidate is live; waiting for the campaign's fitness.
    AwaitingFitness,
    /// A fitness value is being handed to the optimizer.
    Advancing,
    /// The optimizer is gone. Iterations are still counted.
    Stopped,
}

pub type StopCallback = Box<dyn Fn(StopReason) + Send + Sync>;
pub type IterationCallback = Box<dyn Fn(u32, &[f64]) + Send + Sync>;

struct OptimizerLink {
    fitness_tx: Sender<f64>,
    candidate_rx: Receiver<Vec<f64>>,
}

/// Optimizer-thread side of the rendezvous.
struct FitnessBridge {
    fitness_rx: Receiver<f64>,
    candidate_tx: Sender<Vec<f64>>,
    table: Arc<ProbabilityTable>,
    session: Arc<Mutex<FuzzingSession>>,
    /// Fitness values of already completed iterations, fed back first.
    replay: VecDeque<f64>,
    /// -1 turns the maximised campaign fitness into a minimised score.
    sign: f64,
}

impl Evaluator for FitnessBridge {
    fn evaluate(&mut self, candidate: &[f64]) -> Result<f64, OptimizerError> {
        if let Some(fitness) = self.replay.pop_front() {
            return Ok(fitness * self.sign);
        }

        self.table.publish(candidate.to_vec());
        self.session.lock().individual = candidate.to_vec();
        self.candidate_tx
            .send(candidate.to_vec())
            .map_err(|_| OptimizerError::Disconnected)?;

        let fitness = self
            .fitness_rx
            .recv()
            .map_err(|_| OptimizerError::Disconnected)?;
        self.session.lock().record(candidate, fitness);
        Ok(fitness * self.sign)
    }
}

pub struct FitnessEngine {
    config: FuzzingConfig,
    individual_len: usize,
    table: Arc<ProbabilityTable>,
    session: Arc<Mutex<FuzzingSession>>,
    state: Mutex<FitnessState>,
    link: Mutex<Option<OptimizerLink>>,
    thread: Mutex<Option<JoinHandle<()>>>,
    optimizer: Mutex<Option<Box<dyn Optimizer>>>,
    checker: ResourceChecker,
    save_lock: Arc<Mutex<()>>,
    on_stop: Option<StopCallback>,
    on_iteration: Option<IterationCallback>,
}

impl std::fmt::Debug for FitnessEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FitnessEngine")
            .field("individual_len", &self.individual_len)
            .field("state", &self.state())
            .field("iterations", &self.iterations())
            .finish_non_exhaustive()
    }
}

impl FitnessEngine {
    /// An idle engine with one probability slot per entry of the state
    /// model's layer budget.
    pub fn new(config: &FuzzingConfig, individual_len: usize) -> Self {
        let default_p = config.default_mutation_probability;
        Self {
            config: config.clone(),
            individual_len,
            table: Arc::new(ProbabilityTable::new(
                individual_len,
                default_p,
                config.enable_optimization,
            )),
            session: Arc::new(Mutex::new(FuzzingSession::new(
                config.population_size,
                config.random_seed,
                vec![default_p; individual_len],
            ))),
            state: Mutex::new(FitnessState::Idle),
            link: Mutex::new(None),
            thread: Mutex::new(None),
            optimizer: Mutex::new(None),
            checker: ResourceChecker::new(StopConditions::from_config(config)),
            save_lock: Arc::new(Mutex::new(())),
            on_stop: None,
            on_iteration: None,
        }
    }

    /// Use `optimizer` instead of the built-in particle swarm.
    pub fn with_optimizer(self, optimizer: Box<dyn Optimizer>) -> Self {
        *self.optimizer.lock() = Some(optimizer);
        self
    }

    pub fn on_stop(&mut self, callback: impl Fn(StopReason) + Send + Sync + 'static) {
        self.on_stop = Some(Box::new(callback));
    }

    /// Called after every iteration with the iteration count and live individual.
    pub fn on_iteration(&mut self, callback: impl Fn(u32, &[f64]) + Send + Sync + 'static) {
        self.on_iteration = Some(Box::new(callback));
    }

    pub fn probabilities(&self) -> Arc<ProbabilityTable> {
        Arc::clone(&self.table)
    }

    pub fn individual(&self) -> Arc<Vec<f64>> {
        self.table.snapshot()
    }

    pub fn individual_len(&self) -> usize {
        self.individual_len
    }

    pub fn state(&self) -> FitnessState {
        *self.state.lock()
    }

    pub fn iterations(&self) -> u32 {
        self.session.lock().iteration
    }

    pub fn current_fitness(&self) -> f64 {
        self.session.lock().current_fitness
    }

    pub fn session(&self) -> FuzzingSession {
        self.session.lock().clone()
    }

    pub fn is_optimizing(&self) -> bool {
        self.config.enable_optimization
    }

    /// Load the session at `path` and check it fits this engine.
    pub fn load_compatible(&self, path: &Path) -> Result<FuzzingSession, SessionError> {
        let stored = FuzzingSession::load(path)?;
        stored.check_compatible(self.config.population_size, self.individual_len)?;
        Ok(stored)
    }

    /// Bring the engine to `AwaitingFitness`.
    ///
    /// With optimization enabled this restores the session if configured,
    /// spawns the optimizer thread and blocks until its first candidate is
    /// live. Otherwise the default probabilities stay in place.
    pub fn start(&self) -> Result<(), OptimizerError> {
        if self.state() != FitnessState::Idle {
            return Err(OptimizerError::InvalidState("already started"));
        }

        if !self.config.enable_optimization {
            *self.state.lock() = FitnessState::AwaitingFitness;
            info!(
                size = self.individual_len,
                probability = self.config.default_mutation_probability,
                "optimization disabled, using default probabilities"
            );
            return Ok(());
        }

        let mut seed = self.config.random_seed;
        let mut replay = VecDeque::new();
        if self.config.restore_session {
            match self.load_compatible(&self.config.session_path) {
                Ok(stored) => {
                    if stored.random_seed != seed {
                        warn!(
                            expected = seed,
                            found = stored.random_seed,
                            "session random seed differs, using the stored seed"
                        );
                        seed = stored.random_seed;
                    }
                    replay = stored.history.iter().map(|(_, f)| *f).collect();
                    info!(
                        iterations = stored.iteration,
                        fitness = stored.current_fitness,
                        path = %self.config.session_path.display(),
                        "session restored"
                    );
                    *self.session.lock() = stored;
                }
                Err(e) => warn!(error = %e, "session not restored, starting a new one"),
            }
        }

        let mut optimizer = self.optimizer.lock().take().unwrap_or_else(|| {
            Box::new(ParticleSwarm::new(
                self.config.population_size as usize,
                self.config.generations,
                seed,
            ))
        });
        optimizer.set_seed(seed);

        let (fitness_tx, fitness_rx) = bounded(0);
        let (candidate_tx, candidate_rx) = bounded(0);
        let mut bridge = FitnessBridge {
            fitness_rx,
            candidate_tx,
            table: Arc::clone(&self.table),
            session: Arc::clone(&self.session),
            replay,
            sign: -1.0,
        };
        let problem = Problem {
            dimension: self.individual_len,
            lower: PROBABILITY_BOUNDS.0,
            upper: PROBABILITY_BOUNDS.1,
        };

        info!(
            optimizer = optimizer.name(),
            size = self.individual_len,
            population = self.config.population_size,
            seed,
            "starting optimizer"
        );
        let handle = std::thread::Builder::new()
            .name("optimizer".into())
            .spawn(move || loop {
                match optimizer.evolve(&problem, &mut bridge) {
                    Ok(()) => debug!("optimizer batch complete"),
                    Err(OptimizerError::Disconnected) | Err(OptimizerError::Stopped) => break,
                    Err(e) => {
                        error!(error = %e, "optimizer failed, keeping the current individual");
                        break;
                    }
                }
            })
            .map_err(|e| OptimizerError::Algorithm(e.to_string()))?;
        *self.thread.lock() = Some(handle);

        match candidate_rx.recv() {
            Ok(_) => {
                *self.state.lock() = FitnessState::PopulationReady;
                debug!("initial population ready");
            }
            Err(_) => {
                *self.state.lock() = FitnessState::Stopped;
                return Err(OptimizerError::Stopped);
            }
        }

        *self.link.lock() = Some(OptimizerLink {
            fitness_tx,
            candidate_rx,
        });
        *self.state.lock() = FitnessState::AwaitingFitness;
        Ok(())
    }

    /// End one campaign iteration with `fitness`.
    ///
    /// Returns the stop condition hit by this iteration, if any; the stop
    /// callback has already been invoked for it.
    pub fn iteration(&self, fitness: f64) -> Result<Option<StopReason>, OptimizerError> {
        match self.state() {
            FitnessState::Idle | FitnessState::PopulationReady => {
                return Err(OptimizerError::InvalidState("not started"))
            }
            FitnessState::Advancing => return Err(OptimizerError::InvalidState("advancing")),
            FitnessState::AwaitingFitness | FitnessState::Stopped => {}
        }

        let mut link = self.link.lock();
        match link.as_ref() {
            Some(l) => {
                *self.state.lock() = FitnessState::Advancing;
                let advanced = l.fitness_tx.send(fitness).is_ok() && l.candidate_rx.recv().is_ok();
                if advanced {
                    *self.state.lock() = FitnessState::AwaitingFitness;
                    if self.config.save_session {
                        self.save_in_background();
                    }
                } else {
                    warn!("optimizer stopped, keeping the current individual");
                    link.take();
                    *self.state.lock() = FitnessState::Stopped;
                    self.session.lock().record(&self.table.snapshot(), fitness);
                }
            }
            None => {
                let mut session = self.session.lock();
                session.iteration += 1;
                session.current_fitness = fitness;
            }
        }
        drop(link);

        let iterations = self.iterations();
        let individual = self.table.snapshot();
        info!(iteration = iterations, fitness, "campaign iteration");
        if let Some(cb) = &self.on_iteration {
            cb(iterations, &individual);
        }

        let reason = self.checker.check(iterations as u64);
        if let Some(reason) = reason {
            info!(?reason, iterations, "stop condition reached");
            if let Some(cb) = &self.on_stop {
                cb(reason);
            }
        }
        Ok(reason)
    }

    /// Check the stop conditions without ending an iteration.
    pub fn stop_condition(&self) -> Option<StopReason> {
        self.checker.check(self.iterations() as u64)
    }

    /// Write the session now.
    pub fn save_session(&self) -> Result<(), SessionError> {
        let _guard = self.save_lock.lock();
        let snapshot = self.session();
        snapshot.save(&self.config.session_path)?;
        debug!(path = %self.config.session_path.display(), "session saved");
        Ok(())
    }

    fn save_in_background(&self) {
        let snapshot = self.session();
        let path = self.config.session_path.clone();
        let lock = Arc::clone(&self.save_lock);
        let spawned = std::thread::Builder::new()
            .name("session-save".into())
            .spawn(move || {
                let _guard = lock.lock();
                match snapshot.save(&path) {
                    Ok(()) => debug!(path = %path.display(), "session saved"),
                    Err(e) => warn!(error = %e, "session save failed"),
                }
            });
        if let Err(e) = spawned {
            warn!(error = %e, "could not spawn session writer");
        }
    }

    /// Release the optimizer thread and wait for it to exit.
    pub fn shutdown(&self) {
        let had_link = self.link.lock().take().is_some();
        if let Some(handle) = self.thread.lock().take() {
            if handle.join().is_err() {
                error!("optimizer thread panicked");
            }
        }
        if had_link && self.config.save_session {
            if let Err(e) = self.save_session() {
                warn!(error = %e, "final session save failed");
            }
        }
        *self.state.lock() = FitnessState::Stopped;
    }
}

impl Drop for FitnessEngine {
    fn drop(&mut self) {
        if self.link.get_mut().is_some() || self.thread.get_mut().is_some() {
            self.shutdown();
        }
    }
}
