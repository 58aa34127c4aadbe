//! Keyed storage for episodes and their steps.
//!
//! One JSON document per episode under `eidos/`, replaced atomically on each
//! update. Records are written once and never mutated afterward except for
//! outcome fields filled in on validation/consolidation.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::error::EidosError;
use crate::persist;

use super::{Episode, Step};

/// An episode together with its steps, as persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpisodeRecord {
    pub episode: Episode,
    pub steps: Vec<Step>,
}

/// Directory-backed store, one file per episode id.
pub struct EidosStore {
    dir: PathBuf,
}

impl EidosStore {
    pub fn open(dir: PathBuf) -> Result<Self, EidosError> {
        std::fs::create_dir_all(&dir).map_err(|e| EidosError::Persist {
            path: dir.display().to_string(),
            source: e,
        })?;
        Ok(Self { dir })
    }

    fn path_for(&self, episode_id: &str) -> PathBuf {
        self.dir.join(format!("{episode_id}.json"))
    }

    /// Atomically write an episode record.
    pub fn save(&self, record: &EpisodeRecord) -> Result<(), EidosError> {
        let path = self.path_for(&record.episode.id);
        persist::write_json_atomic(&path, record).map_err(|e| EidosError::Persist {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Load one episode record.
    pub fn load(&self, episode_id: &str) -> Result<Option<EpisodeRecord>, EidosError> {
        let path = self.path_for(episode_id);
        persist::read_json(&path).map_err(|e| EidosError::Persist {
            path: path.display().to_string(),
            source: e,
        })
    }

    /// Load every stored episode record. Malformed files are skipped.
    pub fn load_all(&self) -> Vec<EpisodeRecord> {
        let entries = match std::fs::read_dir(&self.dir) {
            Ok(e) => e,
            Err(_) => return Vec::new(),
        };
        let mut records: Vec<EpisodeRecord> = entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().is_some_and(|ext| ext == "json"))
            .filter_map(|p| persist::read_json::<EpisodeRecord>(&p).ok().flatten())
            .collect();
        records.sort_by(|a, b| a.episode.started_ms.cmp(&b.episode.started_ms));
        records
    }

    /// All completed steps across terminal episodes, oldest first.
    /// This is the distillation engine's input.
    pub fn completed_steps(&self) -> Vec<Step> {
        self.load_all()
            .into_iter()
            .filter(|r| r.episode.is_terminal())
            .flat_map(|r| r.steps)
            .filter(|s| s.is_complete())
            .collect()
    }

    /// Count of stored episodes.
    pub fn episode_count(&self) -> usize {
        std::fs::read_dir(&self.dir)
            .map(|rd| {
                rd.filter_map(|e| e.ok())
                    .filter(|e| e.path().extension().is_some_and(|ext| ext == "json"))
                    .count()
            })
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Tuneables;
    use crate::eidos::{Budget, EpisodeOutcome};

    fn record(id_seed: u64, terminal: bool) -> EpisodeRecord {
        let mut episode = Episode::new(
            "s1",
            "goal",
            Budget::from_tuneables(&Tuneables::default()),
            id_seed,
        );
        if terminal {
            episode.outcome = EpisodeOutcome::Success;
        }
        EpisodeRecord {
            episode,
            steps: Vec::new(),
        }
    }

    #[test]
    fn save_and_load_round_trip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EidosStore::open(dir.path().to_path_buf()).unwrap();
        let rec = record(1_000, false);
        store.save(&rec).unwrap();
        let back = store.load(&rec.episode.id).unwrap().unwrap();
        assert_eq!(back.episode.id, rec.episode.id);
        assert_eq!(back.episode.goal, "goal");
    }

    #[test]
    fn load_all_sorts_by_start_time() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EidosStore::open(dir.path().to_path_buf()).unwrap();
        let newer = record(2_000, true);
        let older = record(1_000, true);
        store.save(&newer).unwrap();
        store.save(&older).unwrap();
        let all = store.load_all();
        assert_eq!(all.len(), 2);
        assert!(all[0].episode.started_ms <= all[1].episode.started_ms);
    }

    #[test]
    fn completed_steps_only_from_terminal_episodes() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EidosStore::open(dir.path().to_path_buf()).unwrap();
        store.save(&record(1_000, false)).unwrap();
        store.save(&record(2_000, true)).unwrap();
        // Neither record carries steps, so the list is empty, but only the
        // terminal episode was even considered.
        assert!(store.completed_steps().is_empty());
        assert_eq!(store.episode_count(), 2);
    }

    #[test]
    fn missing_episode_loads_as_none() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = EidosStore::open(dir.path().to_path_buf()).unwrap();
        assert!(store.load("ep-absent").unwrap().is_none());
    }
}
