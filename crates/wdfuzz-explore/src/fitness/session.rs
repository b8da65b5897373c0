//! Persisted optimizer session.
//!
//! Stored as gzip-compressed CBOR and written through a temporary file in
//! the destination directory, so a crash mid-save never leaves a truncated
//! session behind.

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;

use crate::error::SessionError;

pub const SESSION_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FuzzingSession {
    pub version: u32,
    /// Campaign iterations whose fitness has been consumed.
    pub iteration: u32,
    pub current_fitness: f64,
    pub population_size: u32,
    pub random_seed: u64,
    /// Candidate currently driving mutation.
    pub individual: Vec<f64>,
    /// Every evaluated candidate with the fitness it scored, in order.
    pub history: Vec<(Vec<f64>, f64)>,
}

impl FuzzingSession {
    pub fn new(population_size: u32, random_seed: u64, individual: Vec<f64>) -> Self {
        Self {
            version: SESSION_VERSION,
            iteration: 0,
            current_fitness: 0.0,
            population_size,
            random_seed,
            individual,
            history: Vec::new(),
        }
    }

    /// Account one consumed fitness value for `candidate`.
    pub fn record(&mut self, candidate: &[f64], fitness: f64) {
        self.iteration += 1;
        self.current_fitness = fitness;
        self.history.push((candidate.to_vec(), fitness));
    }

    /// Length of the stored individual vectors.
    pub fn individual_len(&self) -> usize {
        self.history
            .first()
            .map_or(self.individual.len(), |(x, _)| x.len())
    }

    /// Reject a session that does not fit the running configuration.
    /// A different random seed is not an error.
    pub fn check_compatible(
        &self,
        population_size: u32,
        individual_len: usize,
    ) -> Result<(), SessionError> {
        if self.population_size != population_size {
            return Err(SessionError::Mismatch {
                what: "population size",
                expected: population_size as u64,
                found: self.population_size as u64,
            });
        }
        if self.individual_len() != individual_len {
            return Err(SessionError::Mismatch {
                what: "individual length",
                expected: individual_len as u64,
                found: self.individual_len() as u64,
            });
        }
        Ok(())
    }

    pub fn save(&self, path: &Path) -> Result<(), SessionError> {
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(dir)?;

        let tmp = NamedTempFile::new_in(dir)?;
        let mut encoder = GzEncoder::new(BufWriter::new(tmp), Compression::default());
        ciborium::into_writer(self, &mut encoder)
            .map_err(|e| SessionError::Encode(e.to_string()))?;
        let tmp = encoder
            .finish()?
            .into_inner()
            .map_err(|e| SessionError::Io(e.into_error()))?;
        tmp.persist(path).map_err(|e| SessionError::Io(e.error))?;
        Ok(())
    }

    pub fn load(path: &Path) -> Result<Self, SessionError> {
        let file = File::open(path)?;
        let decoder = GzDecoder::new(BufReader::new(file));
        let session: Self =
            ciborium::from_reader(decoder).map_err(|e| SessionError::Decode(e.to_string()))?;
        if session.version != SESSION_VERSION {
            return Err(SessionError::Version(session.version));
        }
        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> FuzzingSession {
        let mut s = FuzzingSession::new(5, 42, vec![0.1, 0.2, 0.05]);
        s.record(&[0.1, 0.2, 0.05], 3.0);
        s.record(&[0.0, 0.15, 0.2], 7.5);
        s.individual = vec![0.01, 0.02, 0.03];
        s
    }

    #[test]
    fn test_record_tracks_iteration() {
        let s = sample();
        assert_eq!(s.iteration, 2);
        assert_eq!(s.current_fitness, 7.5);
        assert_eq!(s.history.len(), 2);
    }

    #[test]
    fn test_compatibility_checks() {
        let s = sample();
        assert!(s.check_compatible(5, 3).is_ok());
        assert!(matches!(
            s.check_compatible(4, 3),
            Err(SessionError::Mismatch {
                what: "population size",
                ..
            })
        ));
        assert!(matches!(
            s.check_compatible(5, 4),
            Err(SessionError::Mismatch {
                what: "individual length",
                ..
            })
        ));
    }

    #[test]
    fn test_save_overwrites_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("session.cbor.gz");
        let mut s = sample();
        s.save(&path).unwrap();
        s.record(&[0.2, 0.2, 0.2], 1.0);
        s.save(&path).unwrap();
        assert_eq!(FuzzingSession::load(&path).unwrap(), s);
        // Only the session itself remains in the directory.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_load_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad");
        std::fs::write(&path, b"not gzip").unwrap();
        assert!(FuzzingSession::load(&path).is_err());
        assert!(matches!(
            FuzzingSession::load(&dir.path().join("missing")),
            Err(SessionError::Io(_))
        ));
    }
}
