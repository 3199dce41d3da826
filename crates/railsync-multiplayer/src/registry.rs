//! Who drives what: remote players, their trains, and online locomotives.
//!
//! The registry never owns a [`Train`](crate::sim::Train). Players refer to
//! their train by number; the simulation arena owns the train itself.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use railsync_net::ConnectionId;

use crate::sim::{TrainNumber, WorldLocation};

/// Lifecycle of an [`OnlinePlayer`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PlayerStatus {
    /// Connected and driving.
    #[default]
    Valid,
    /// Disconnected; kept while the grace window runs.
    Quit,
    /// Gone for good.
    Removed,
}

/// A remote participant.
#[derive(Debug, Clone, PartialEq)]
pub struct OnlinePlayer {
    /// Unique key.
    pub username: String,
    /// Train currently driven.
    pub train: Option<TrainNumber>,
    /// Car id of the cab the player sits in.
    pub lead_car: Option<String>,
    /// Dispatcher-side connection; `None` on clients and for the dispatcher's
    /// own player as seen by clients.
    pub connection: Option<ConnectionId>,
    /// Game clock when the player joined.
    pub created_at: f64,
    /// Game clock when the player disconnected.
    pub quit_at: Option<f64>,
    pub status: PlayerStatus,
    /// Survives the next removal attempt; set when a same-named player
    /// reconnects while an old removal may still be queued.
    pub protected: bool,
}

impl OnlinePlayer {
    /// A freshly joined player.
    pub fn new(username: impl Into<String>, train: Option<TrainNumber>, created_at: f64) -> Self {
        Self {
            username: username.into(),
            train,
            lead_car: None,
            connection: None,
            created_at,
            quit_at: None,
            status: PlayerStatus::Valid,
            protected: false,
        }
    }
}

/// A disconnected player waiting for a reconnect.
#[derive(Debug, Clone, PartialEq)]
pub struct LostPlayer {
    pub player: OnlinePlayer,
    /// Game clock at disconnect.
    pub lost_at: f64,
    /// Rear of the player's train at disconnect.
    pub last_rear: WorldLocation,
}

/// A locomotive currently driven by a remote user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnlineLocomotive {
    pub username: String,
    pub train: TrainNumber,
    /// Position of the car within its train.
    pub car_position: usize,
}

/// Registry of remote players and online locomotives.
#[derive(Debug, Default)]
pub struct OnlineTrains {
    players: BTreeMap<String, OnlinePlayer>,
    lost: BTreeMap<String, LostPlayer>,
    locos: Vec<OnlineLocomotive>,
}

impl OnlineTrains {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a player.
    pub fn add_player(&mut self, player: OnlinePlayer) {
        tracing::debug!(user = %player.username, train = ?player.train, "player registered");
        self.players.insert(player.username.clone(), player);
    }

    /// Remove a player entry.
    pub fn remove_player(&mut self, username: &str) -> Option<OnlinePlayer> {
        self.players.remove(username)
    }

    pub fn find_player(&self, username: &str) -> Option<&OnlinePlayer> {
        self.players.get(username)
    }

    pub fn find_player_mut(&mut self, username: &str) -> Option<&mut OnlinePlayer> {
        self.players.get_mut(username)
    }

    /// All live players in name order.
    pub fn players(&self) -> impl Iterator<Item = &OnlinePlayer> {
        self.players.values()
    }

    pub fn players_mut(&mut self) -> impl Iterator<Item = &mut OnlinePlayer> {
        self.players.values_mut()
    }

    pub fn player_count(&self) -> usize {
        self.players.len()
    }

    /// The first player driving `train`.
    pub fn player_for_train(&self, train: TrainNumber) -> Option<&OnlinePlayer> {
        self.players.values().find(|player| player.train == Some(train))
    }

    /// Names of every valid player driving `train`.
    pub fn drivers_of(&self, train: TrainNumber) -> Vec<&str> {
        self.players
            .values()
            .filter(|player| player.train == Some(train) && player.status == PlayerStatus::Valid)
            .map(|player| player.username.as_str())
            .collect()
    }

    /// The player behind a dispatcher-side connection.
    pub fn player_by_connection(&self, connection: ConnectionId) -> Option<&OnlinePlayer> {
        self.players
            .values()
            .find(|player| player.connection == Some(connection))
    }

    /// Point every player on `from` at `to`.
    pub fn retarget_train(&mut self, from: TrainNumber, to: TrainNumber) {
        for player in self.players.values_mut() {
            if player.train == Some(from) {
                player.train = Some(to);
            }
        }
        for loco in &mut self.locos {
            if loco.train == from {
                loco.train = to;
            }
        }
    }

    // -- lost players -------------------------------------------------------

    /// Move a live player into the lost set. Returns `false` for an unknown
    /// name.
    pub fn mark_lost(&mut self, username: &str, now: f64, last_rear: WorldLocation) -> bool {
        let Some(mut player) = self.players.remove(username) else {
            return false;
        };
        player.status = PlayerStatus::Quit;
        player.quit_at = Some(now);
        player.connection = None;
        self.lost.insert(
            username.to_string(),
            LostPlayer {
                player,
                lost_at: now,
                last_rear,
            },
        );
        true
    }

    /// Take a lost player out of the set, typically on reconnect.
    pub fn take_lost(&mut self, username: &str) -> Option<LostPlayer> {
        self.lost.remove(username)
    }

    pub fn is_lost(&self, username: &str) -> bool {
        self.lost.contains_key(username)
    }

    /// Lost players in name order.
    pub fn lost_players(&self) -> impl Iterator<Item = &LostPlayer> {
        self.lost.values()
    }

    /// Forget every lost player whose disconnect is at least `grace` seconds
    /// old and hand them back for removal.
    pub fn expire_lost(&mut self, now: f64, grace: f64) -> Vec<LostPlayer> {
        let expired: Vec<String> = self
            .lost
            .iter()
            .filter(|(_, lost)| now - lost.lost_at >= grace)
            .map(|(name, _)| name.clone())
            .collect();
        expired
            .iter()
            .filter_map(|name| self.lost.remove(name))
            .map(|mut lost| {
                lost.player.status = PlayerStatus::Removed;
                lost
            })
            .collect()
    }

    /// Re-insert a lost player, used when restoring a saved roster.
    pub fn restore_lost(&mut self, lost: LostPlayer) {
        self.lost.insert(lost.player.username.clone(), lost);
    }

    // -- online locomotives -------------------------------------------------

    /// Record a remotely driven locomotive; duplicates are ignored.
    pub fn add_online_loco(&mut self, loco: OnlineLocomotive) {
        if !self.locos.contains(&loco) {
            self.locos.push(loco);
        }
    }

    /// Forget one locomotive entry.
    pub fn remove_online_loco(&mut self, loco: &OnlineLocomotive) {
        self.locos.retain(|entry| entry != loco);
    }

    /// Forget every locomotive driven by `username`.
    pub fn remove_online_locos_of(&mut self, username: &str) {
        self.locos.retain(|loco| loco.username != username);
    }

    /// Forget every locomotive of `train`.
    pub fn remove_online_locos_of_train(&mut self, train: TrainNumber) {
        self.locos.retain(|loco| loco.train != train);
    }

    pub fn is_online_loco(&self, train: TrainNumber, car_position: usize) -> bool {
        self.locos
            .iter()
            .any(|loco| loco.train == train && loco.car_position == car_position)
    }

    pub fn online_locos(&self) -> &[OnlineLocomotive] {
        &self.locos
    }

    /// Drop everything, e.g. after falling back to single-player.
    pub fn clear(&mut self) {
        self.players.clear();
        self.lost.clear();
        self.locos.clear();
    }
}
