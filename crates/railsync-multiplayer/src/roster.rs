//! Saving and restoring the player roster with a game save.
//!
//! Only the dispatcher's registry is persisted. Connections are not: every
//! live player comes back as a lost player, so the owner gets the usual grace
//! window to reconnect to the restored train.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::registry::{LostPlayer, OnlinePlayer, OnlineTrains, PlayerStatus};
use crate::sim::{Simulation, TrainNumber, WorldLocation};

/// Errors while reading or writing a roster file.
#[derive(Debug, thiserror::Error)]
pub enum RosterError {
    #[error("roster I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("roster encoding error: {0}")]
    Encoding(#[from] postcard::Error),
}

/// One saved player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RosterRecord {
    pub username: String,
    pub train: Option<TrainNumber>,
    pub lead_car: Option<String>,
    pub status: PlayerStatus,
    pub created_at: f64,
    pub quit_at: Option<f64>,
    pub protected: bool,
    /// Set for players that were already lost when saved.
    pub lost_at: Option<f64>,
    pub last_rear: WorldLocation,
}

/// Saved registry contents.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Roster {
    pub records: Vec<RosterRecord>,
}

impl Roster {
    /// Snapshot live and lost players.
    pub fn capture(registry: &OnlineTrains, sim: &Simulation) -> Self {
        let live = registry.players().map(|player| {
            let last_rear = player
                .train
                .and_then(|number| sim.train(number))
                .map(|train| train.rear_location)
                .unwrap_or_default();
            record(player, None, last_rear)
        });
        let lost = registry
            .lost_players()
            .map(|lost| record(&lost.player, Some(lost.lost_at), lost.last_rear));
        Self {
            records: live.chain(lost).collect(),
        }
    }

    /// Put every saved player into `registry` as lost at `now`, or at its
    /// original loss time when it was already lost.
    pub fn restore_into(self, registry: &mut OnlineTrains, now: f64) {
        for record in self.records {
            let mut player = OnlinePlayer::new(record.username, record.train, record.created_at);
            player.lead_car = record.lead_car;
            player.status = PlayerStatus::Quit;
            player.quit_at = Some(record.quit_at.unwrap_or(now));
            player.protected = record.protected;
            registry.restore_lost(LostPlayer {
                player,
                lost_at: record.lost_at.unwrap_or(now),
                last_rear: record.last_rear,
            });
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, RosterError> {
        Ok(postcard::to_allocvec(self)?)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, RosterError> {
        Ok(postcard::from_bytes(bytes)?)
    }

    /// Write the roster to `path`.
    pub fn save(&self, path: &Path) -> Result<(), RosterError> {
        let bytes = self.to_bytes()?;
        fs::write(path, bytes).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::info!(path = %path.display(), players = self.records.len(), "roster saved");
        Ok(())
    }

    /// Read a roster from `path`.
    pub fn load(path: &Path) -> Result<Self, RosterError> {
        let bytes = fs::read(path).map_err(|source| RosterError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_bytes(&bytes)
    }
}

fn record(player: &OnlinePlayer, lost_at: Option<f64>, last_rear: WorldLocation) -> RosterRecord {
    RosterRecord {
        username: player.username.clone(),
        train: player.train,
        lead_car: player.lead_car.clone(),
        status: player.status,
        created_at: player.created_at,
        quit_at: player.quit_at,
        protected: player.protected,
        lost_at,
        last_rear,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{CarKind, Train, TrainCar};

    fn populated() -> (OnlineTrains, Simulation) {
        let mut sim = Simulation::new();
        let mut train = Train::new(7, "anna's");
        train.cars.push(TrainCar::new("e1", "loco.ron", CarKind::Wagon, 20.0));
        train.rear_location = WorldLocation::new(1, 2, 10.0, 0.0, 5.0);
        sim.add_train(train);

        let mut registry = OnlineTrains::new();
        let mut anna = OnlinePlayer::new("anna", Some(7), 3.0);
        anna.lead_car = Some("e1".into());
        registry.add_player(anna);
        registry.add_player(OnlinePlayer::new("bob", Some(9), 4.0));
        registry.mark_lost("bob", 50.0, WorldLocation::new(0, 0, 1.0, 0.0, 1.0));
        (registry, sim)
    }

    #[test]
    fn test_capture_and_restore_as_lost() {
        let (registry, sim) = populated();
        let roster = Roster::capture(&registry, &sim);
        assert_eq!(roster.records.len(), 2);

        let mut restored = OnlineTrains::new();
        roster.restore_into(&mut restored, 100.0);
        assert_eq!(restored.player_count(), 0);
        assert!(restored.is_lost("anna"));
        assert!(restored.is_lost("bob"));

        let anna = restored.take_lost("anna").unwrap();
        assert_eq!(anna.lost_at, 100.0);
        assert_eq!(anna.last_rear, WorldLocation::new(1, 2, 10.0, 0.0, 5.0));
        assert_eq!(anna.player.lead_car.as_deref(), Some("e1"));

        let bob = restored.take_lost("bob").unwrap();
        assert_eq!(bob.lost_at, 50.0);
    }

    #[test]
    fn test_save_and_load_file() {
        let (registry, sim) = populated();
        let roster = Roster::capture(&registry, &sim);
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("roster.bin");

        roster.save(&path).unwrap();
        let loaded = Roster::load(&path).unwrap();
        assert_eq!(loaded, roster);
    }

    #[test]
    fn test_load_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = Roster::load(&dir.path().join("nope.bin")).unwrap_err();
        assert!(matches!(err, RosterError::Io { .. }));
    }
}
