//! Player join, leave, and reconnect.
//!
//! The dispatcher admits a joining player after checking protocol version,
//! route, and name, then builds the player's train from the announced consist
//! and sends the newcomer the rest of the world. A player whose link drops is
//! kept as lost for a grace window; reconnecting inside the window with the
//! train still far from the announced position gives the old train back.

use railsync_net::ConnectionId;

use crate::consist;
use crate::error::SessionError;
use crate::messages::{
    ConsistRecord, ControlKind, ControlLevel, ControlMessage, Message, PlayerState, Quit,
    RemoveTrain, SwitchState, TrainUpdate,
};
use crate::registry::{LostPlayer, OnlineLocomotive, OnlinePlayer, PlayerStatus};
use crate::session::{Outgoing, Recipient, Role, Session, SessionEvent, SessionState};
use crate::sim::{ControlMode, SimError, Train, TrainNumber};

// ---------------------------------------------------------------------------
// JoinError
// ---------------------------------------------------------------------------

/// Why a join was refused.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum JoinError {
    #[error("protocol version {remote} does not match {local}")]
    VersionMismatch { local: u32, remote: u32 },

    #[error("route {remote:#x} does not match {local:#x}")]
    RouteMismatch { local: u64, remote: u64 },

    #[error("user name {0} is already in use")]
    NameCollision(String),

    #[error("train could not be placed: {0}")]
    Placement(#[source] SimError),
}

impl JoinError {
    fn control_kind(&self) -> ControlKind {
        match self {
            JoinError::VersionMismatch { .. } => ControlKind::VersionMismatch,
            JoinError::RouteMismatch { .. } => ControlKind::RouteMismatch,
            JoinError::NameCollision(_) => ControlKind::SameNameError,
            JoinError::Placement(_) => ControlKind::PlacementError,
        }
    }
}

// ---------------------------------------------------------------------------
// Join
// ---------------------------------------------------------------------------

impl Session {
    pub(crate) fn handle_player_state(&mut self, from: ConnectionId, join: PlayerState) -> Result<(), SessionError> {
        if self.is_dispatcher() {
            self.admit_player(from, join)
        } else {
            self.learn_player(join)
        }
    }

    /// Dispatcher: validate a join and bring the player into the session.
    fn admit_player(&mut self, from: ConnectionId, join: PlayerState) -> Result<(), SessionError> {
        if let Err(refusal) = self.check_join(from, &join) {
            return match refusal {
                None => Ok(()),
                Some(error) => Err(self.refuse(from, &join.user, error)),
            };
        }

        let lost = self.registry.take_lost(&join.user);
        let reattach = lost.as_ref().and_then(|lost| {
            let number = lost.player.train?;
            let moved = lost.last_rear.distance_squared(&join.consist.rear);
            // someone may have taken the train over while its driver was away
            let unclaimed = self.registry.drivers_of(number).is_empty() && self.local_train != Some(number);
            (moved > self.config.reattach_distance_sq && unclaimed && self.sim.contains_train(number))
                .then_some(number)
        });

        let consist = match (lost, reattach) {
            (Some(lost), Some(number)) => self.reattach_player(from, lost, number, &join)?,
            (Some(lost), None) => {
                tracing::info!(user = %join.user, "lost player rejoined without its old train, starting fresh");
                self.retire_player(lost.player);
                self.create_player_train(from, &join)?
            }
            (None, _) => self.create_player_train(from, &join)?,
        };
        let number = consist.number;
        if self.pending.players_to_remove.contains(&join.user)
            && let Some(player) = self.registry.find_player_mut(&join.user)
        {
            player.protected = true;
        }

        let announce = PlayerState {
            user: join.user.clone(),
            code: join.code,
            protocol_version: self.config.protocol_version,
            route_hash: self.route_hash,
            consist,
            speed: join.speed,
        };
        self.send(Recipient::All, Message::PlayerState(announce));
        self.send_world_to(from, &join.user);

        tracing::info!(user = %join.user, train = number, connection = from.0, "player joined");
        self.events.push(SessionEvent::PlayerJoined {
            user: join.user,
            train: number,
        });
        Ok(())
    }

    /// `Err(None)` means ignore silently; `Err(Some(_))` means refuse.
    fn check_join(&mut self, from: ConnectionId, join: &PlayerState) -> Result<(), Option<JoinError>> {
        if join.protocol_version != self.config.protocol_version {
            return Err(Some(JoinError::VersionMismatch {
                local: self.config.protocol_version,
                remote: join.protocol_version,
            }));
        }
        if join.route_hash != self.route_hash {
            return Err(Some(JoinError::RouteMismatch {
                local: self.route_hash,
                remote: join.route_hash,
            }));
        }
        if join.user == self.local_user {
            return Err(Some(JoinError::NameCollision(join.user.clone())));
        }
        let Some(existing) = self.registry.find_player(&join.user) else {
            return Ok(());
        };
        if existing.connection == Some(from) {
            tracing::debug!(user = %join.user, "repeated join ignored");
            return Err(None);
        }
        if existing.status == PlayerStatus::Valid {
            return Err(Some(JoinError::NameCollision(join.user.clone())));
        }
        // The old entry is leaving; the new one must survive its queued removal.
        if let Some(old) = self.registry.remove_player(&join.user) {
            tracing::info!(user = %join.user, "replacing a departing player of the same name");
            self.retire_player(old);
        }
        Ok(())
    }

    /// Tell the joiner why it was refused and close its link.
    fn refuse(&mut self, from: ConnectionId, user: &str, error: JoinError) -> SessionError {
        tracing::warn!(user, connection = from.0, %error, "join refused");
        let control = ControlMessage {
            level: ControlLevel::Error,
            kind: error.control_kind(),
            recipient: Some(user.to_string()),
            text: error.to_string(),
        };
        self.send(Recipient::Connection(from), Message::Control(control));
        self.outbox.push(Outgoing::Close(Recipient::Connection(from)));
        error.into()
    }

    /// Give a reconnecting player its old train back.
    fn reattach_player(
        &mut self,
        from: ConnectionId,
        lost: LostPlayer,
        number: TrainNumber,
        join: &PlayerState,
    ) -> Result<ConsistRecord, SessionError> {
        self.sim.reattach_train(number)?;
        let mut player = lost.player;
        player.connection = Some(from);
        player.status = PlayerStatus::Valid;
        player.quit_at = None;
        player.protected = true;
        if join.consist.lead_car.is_some() {
            player.lead_car = join.consist.lead_car.clone();
        }
        let lead = player.lead_car.clone();
        self.registry.add_player(player);
        self.refresh_control_modes(&[number]);
        self.queue_online_loco(&join.user, number, lead.as_deref());

        let train = self.sim.train(number).ok_or(SimError::UnknownTrain(number))?;
        tracing::info!(user = %join.user, train = number, "lost player re-attached to old train");
        Ok(ConsistRecord::from_train(train))
    }

    /// Build, place, and queue a joiner's train, and register the player.
    fn create_player_train(&mut self, from: ConnectionId, join: &PlayerState) -> Result<ConsistRecord, SessionError> {
        let requested = join.consist.number;
        let number = if requested != 0 && !self.sim.contains_train(requested) && !self.pending.has_train(requested) {
            requested
        } else {
            self.next_free_number()
        };
        let mut record = join.consist.clone();
        record.number = number;

        let mut train = consist::build_train(&self.catalog, &record, format!("{} train", join.user));
        train.speed_mps = join.speed;
        train.control_mode = ControlMode::RemotePlayer;
        if let Err(e) = self.sim.place(&mut train) {
            let error = JoinError::Placement(e);
            tracing::warn!(user = %join.user, train = number, %error, "join train rejected");
            let warning = ControlMessage {
                level: ControlLevel::Warning,
                kind: ControlKind::PlacementError,
                recipient: Some(join.user.clone()),
                text: error.to_string(),
            };
            self.send(Recipient::Connection(from), Message::Control(warning));
            return Err(error.into());
        }

        let record = ConsistRecord::from_train(&train);
        let lead = train.lead_car_id().map(str::to_string);
        let lead_position = train.lead_locomotive;
        self.pending.add_train(train);

        let mut player = OnlinePlayer::new(join.user.clone(), Some(number), self.clock.now());
        player.connection = Some(from);
        player.lead_car = lead;
        self.registry.add_player(player);
        if let Some(car_position) = lead_position {
            self.pending.add_loco(OnlineLocomotive {
                username: join.user.clone(),
                train: number,
                car_position,
            });
        }
        Ok(record)
    }

    fn queue_online_loco(&mut self, user: &str, number: TrainNumber, lead: Option<&str>) {
        let position = self
            .sim
            .train(number)
            .and_then(|train| lead.and_then(|id| train.find_car(id)).or(train.lead_locomotive));
        if let Some(car_position) = position {
            self.pending.add_loco(OnlineLocomotive {
                username: user.to_string(),
                train: number,
                car_position,
            });
        }
    }

    /// The consist of `number`, whether in the arena or still queued.
    fn consist_of(&self, number: TrainNumber) -> Option<ConsistRecord> {
        self.sim
            .train(number)
            .or_else(|| self.pending.train(number))
            .map(ConsistRecord::from_train)
    }

    /// Dispatcher: bring a newcomer up to date.
    fn send_world_to(&mut self, to: ConnectionId, joiner: &str) {
        let mut players = Vec::new();
        if let Some(consist) = self.local_train.and_then(|number| self.consist_of(number)) {
            players.push((self.local_user.clone(), consist));
        }
        for player in self.registry.players() {
            if player.username == joiner {
                continue;
            }
            if let Some(consist) = player.train.and_then(|number| self.consist_of(number)) {
                players.push((player.username.clone(), consist));
            }
        }
        for (user, consist) in players {
            let state = PlayerState {
                user,
                code: String::new(),
                protocol_version: self.config.protocol_version,
                route_hash: self.route_hash,
                consist,
                speed: 0.0,
            };
            self.send(Recipient::Connection(to), Message::PlayerState(state));
        }

        let unowned: Vec<_> = self
            .sim
            .trains()
            .filter(|train| self.local_train != Some(train.number))
            .filter(|train| self.registry.player_for_train(train.number).is_none())
            .map(|train| self.train_record(train))
            .collect();
        if !unowned.is_empty() {
            self.send(Recipient::Connection(to), Message::TrainUpdate(TrainUpdate { trains: unowned }));
        }

        let switches = SwitchState {
            switches: self.sim.switch_states(),
        };
        self.send(Recipient::Connection(to), Message::SwitchState(switches));
        let signals = self.signal_state();
        self.send(Recipient::Connection(to), Message::SignalState(signals));
    }

    /// Client: the dispatcher announced a player.
    fn learn_player(&mut self, announce: PlayerState) -> Result<(), SessionError> {
        let number = announce.consist.number;
        if announce.user == self.local_user {
            if let Some(old) = self.local_train
                && old != number
            {
                if self.sim.contains_train(number) {
                    tracing::warn!(train = number, "dropping stale train before renumbering");
                    self.sim.remove_train(number);
                }
                self.sim.renumber_train(old, number)?;
                self.local_train = Some(number);
                tracing::info!(from = old, to = number, "local train renumbered by dispatcher");
            }
            return Ok(());
        }
        if self.registry.find_player(&announce.user).is_some() {
            tracing::debug!(user = %announce.user, "player already known");
            return Ok(());
        }

        if let Some(train) = self.sim.train_mut(number) {
            train.control_mode = ControlMode::RemotePlayer;
        } else if !self.pending.has_train(number) {
            let mut train = consist::build_train(&self.catalog, &announce.consist, format!("{} train", announce.user));
            train.speed_mps = announce.speed;
            train.control_mode = ControlMode::RemotePlayer;
            self.sim.place(&mut train).map_err(JoinError::Placement)?;
            self.pending.add_train(train);
        }

        let mut player = OnlinePlayer::new(announce.user.clone(), Some(number), self.clock.now());
        player.lead_car = announce.consist.lead_car.clone();
        let lead = player.lead_car.clone();
        self.registry.add_player(player);
        match self.sim.train(number).or_else(|| self.pending.train(number)) {
            Some(train) => {
                let position = lead.as_deref().and_then(|id| train.find_car(id)).or(train.lead_locomotive);
                if let Some(car_position) = position {
                    self.pending.add_loco(OnlineLocomotive {
                        username: announce.user.clone(),
                        train: number,
                        car_position,
                    });
                }
            }
            None => tracing::debug!(train = number, "announced train not known yet"),
        }

        tracing::info!(user = %announce.user, train = number, "player appeared");
        self.events.push(SessionEvent::PlayerJoined {
            user: announce.user,
            train: number,
        });
        Ok(())
    }

    // -----------------------------------------------------------------------
    // Leave
    // -----------------------------------------------------------------------

    pub(crate) fn handle_quit(&mut self, from: ConnectionId, quit: Quit) {
        if quit.user == self.local_user {
            return;
        }
        let now = self.clock.now();
        let Some(player) = self.registry.find_player_mut(&quit.user) else {
            tracing::debug!(user = %quit.user, "quit from unknown player");
            return;
        };
        player.status = PlayerStatus::Quit;
        player.quit_at = Some(now);
        tracing::info!(user = %quit.user, "player quit");
        self.pending.remove_player(quit.user.clone());
        self.relay(from, Message::Quit(quit));
    }

    /// Dispatcher: a client link closed without a quit.
    pub fn on_peer_disconnected(&mut self, connection: ConnectionId) {
        let Some(player) = self.registry.player_by_connection(connection) else {
            return;
        };
        if player.status != PlayerStatus::Valid {
            return;
        }
        let user = player.username.clone();
        let train = player.train;
        let last_rear = train
            .and_then(|number| self.sim.train(number))
            .map(|train| train.rear_location)
            .unwrap_or_default();

        let now = self.clock.now();
        self.registry.mark_lost(&user, now, last_rear);
        self.registry.remove_online_locos_of(&user);
        if let Some(number) = train {
            self.refresh_control_modes(&[number]);
        }
        tracing::info!(user = %user, train = ?train, connection = connection.0, "player lost, keeping train");
        self.events.push(SessionEvent::PlayerLost { user });
    }

    /// Client: the dispatcher link is gone.
    pub fn on_link_lost(&mut self, reason: impl Into<String>) {
        if matches!(self.state, SessionState::Client | SessionState::Connecting) {
            self.fall_back_to_single_player(reason);
        }
    }

    /// Continue alone: remote trains become static, the local train stays.
    pub fn fall_back_to_single_player(&mut self, reason: impl Into<String>) {
        let reason = reason.into();
        let was_connected = self.role() == Role::Client;
        tracing::warn!(%reason, "falling back to single-player");
        self.state = SessionState::Disconnected;
        self.release_remote_trains();
        if was_connected {
            self.outbox.push(Outgoing::Close(Recipient::Dispatcher));
        }
        self.events.push(SessionEvent::FellBackToSinglePlayer { reason });
    }

    /// Forget lost players whose grace window ran out.
    pub(crate) fn expire_lost_players(&mut self, now: f64) {
        for lost in self.registry.expire_lost(now, self.config.lost_player_grace) {
            tracing::info!(
                user = %lost.player.username,
                lost_for = now - lost.lost_at,
                "grace window expired"
            );
            self.retire_player(lost.player);
        }
    }

    /// Carry out queued player removals. Protected players survive one pass.
    pub(crate) fn process_player_removals(&mut self) {
        while let Some(user) = self.pending.players_to_remove.pop_front() {
            match self.registry.find_player(&user) {
                None => continue,
                Some(player) if player.protected => {
                    tracing::debug!(user = %user, "protected player kept");
                    continue;
                }
                Some(_) => {}
            }
            if let Some(player) = self.registry.remove_player(&user) {
                self.retire_player(player);
            }
        }
        for player in self.registry.players_mut() {
            player.protected = false;
        }
    }

    /// Clean up after a player that left the registry: its locomotives, and
    /// its train unless somebody else still drives it.
    pub(crate) fn retire_player(&mut self, player: OnlinePlayer) {
        let user = player.username;
        self.registry.remove_online_locos_of(&user);
        self.chat.forget(&user);
        if let Some(number) = player.train {
            let shared = !self.registry.drivers_of(number).is_empty();
            if shared || self.local_train == Some(number) {
                tracing::debug!(user = %user, train = number, "train kept for remaining driver");
            } else if let Some(train) = self.sim.remove_train(number) {
                self.registry.remove_online_locos_of_train(number);
                tracing::info!(user = %user, train = number, cars = train.cars.len(), "train removed with player");
                if self.is_dispatcher() {
                    let remove = RemoveTrain { numbers: vec![number] };
                    self.send(Recipient::All, Message::RemoveTrain(remove));
                }
            }
        }
        self.events.push(SessionEvent::PlayerLeft { user });
    }
}

/// Train a client starts a session with when it has none of its own.
pub fn spawn_consist(number: TrainNumber, user: &str, cars: Vec<crate::sim::TrainCar>) -> Train {
    let mut train = Train::new(number, format!("{user} train"));
    train.cars = cars;
    train.recompute_lead(None);
    train
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorCategory;
    use crate::messages::{ControlRequest, TrainControl};
    use crate::session::tests::{client, consist, dispatcher, join_request, sent};
    use crate::sim::WorldLocation;

    const ANNA: ConnectionId = ConnectionId(1);
    const BOB: ConnectionId = ConnectionId(2);

    fn admitted(session: &mut Session, connection: ConnectionId, user: &str, number: TrainNumber) {
        session
            .handle(connection, Message::PlayerState(join_request(user, number, WorldLocation::default())))
            .unwrap();
        session.tick(session.now());
        session.take_outbox();
        session.take_events();
    }

    // 1. test_join_is_announced_and_world_is_sent
    #[test]
    fn test_join_is_announced_and_world_is_sent() {
        let mut session = dispatcher();
        session.sim_mut().add_train(consist(30, "ai", WorldLocation::default()));
        admitted(&mut session, BOB, "bob", 6);

        session
            .handle(ANNA, Message::PlayerState(join_request("anna", 5, WorldLocation::default())))
            .unwrap();
        let out = sent(&mut session);

        assert!(matches!(
            &out[0],
            (Recipient::All, Message::PlayerState(p)) if p.user == "anna" && p.consist.number == 5
        ));
        let to_anna: Vec<_> = out
            .iter()
            .filter(|(to, _)| *to == Recipient::Connection(ANNA))
            .map(|(_, m)| m)
            .collect();
        let announced: Vec<_> = to_anna
            .iter()
            .filter_map(|m| match m {
                Message::PlayerState(p) => Some(p.user.as_str()),
                _ => None,
            })
            .collect();
        assert_eq!(announced, vec!["disp", "bob"]);
        assert!(to_anna.iter().any(|m| matches!(
            m,
            Message::TrainUpdate(u) if u.trains.len() == 1 && u.trains[0].consist.number == 30
        )));
        assert!(to_anna.iter().any(|m| matches!(m, Message::SwitchState(_))));
        assert!(to_anna.iter().any(|m| matches!(m, Message::SignalState(_))));

        let player = session.registry().find_player("anna").unwrap();
        assert_eq!(player.connection, Some(ANNA));
        assert_eq!(player.train, Some(5));

        session.tick(session.now());
        assert_eq!(session.sim().train(5).unwrap().control_mode, ControlMode::RemotePlayer);
        assert!(session.registry().is_online_loco(5, 0));
    }

    // 2. test_taken_number_is_reallocated
    #[test]
    fn test_taken_number_is_reallocated() {
        let mut session = dispatcher();
        session
            .handle(ANNA, Message::PlayerState(join_request("anna", 1, WorldLocation::default())))
            .unwrap();
        let out = sent(&mut session);
        assert!(matches!(&out[0], (Recipient::All, Message::PlayerState(p)) if p.consist.number == 2));
        assert_eq!(session.registry().find_player("anna").unwrap().train, Some(2));
    }

    // 3. test_repeated_join_is_idempotent
    #[test]
    fn test_repeated_join_is_idempotent() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        let trains = session.sim().train_count();

        session
            .handle(ANNA, Message::PlayerState(join_request("anna", 5, WorldLocation::default())))
            .unwrap();
        session.tick(session.now());
        assert!(session.take_outbox().is_empty());
        assert_eq!(session.sim().train_count(), trains);
    }

    // 4. test_same_name_on_other_connection_is_refused
    #[test]
    fn test_same_name_on_other_connection_is_refused() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);

        let err = session
            .handle(BOB, Message::PlayerState(join_request("anna", 7, WorldLocation::default())))
            .unwrap_err();
        assert_eq!(err.category(), Some(ErrorCategory::NameCollision));
        let out = session.take_outbox();
        assert!(matches!(
            &out[0],
            Outgoing::Send { recipient: Recipient::Connection(BOB), message: Message::Control(c) }
                if c.kind == ControlKind::SameNameError && c.level == ControlLevel::Error
        ));
        assert_eq!(out[1], Outgoing::Close(Recipient::Connection(BOB)));
        assert_eq!(session.registry().find_player("anna").unwrap().connection, Some(ANNA));
    }

    #[test]
    fn test_dispatcher_name_is_refused() {
        let mut session = dispatcher();
        let err = session
            .handle(ANNA, Message::PlayerState(join_request("disp", 5, WorldLocation::default())))
            .unwrap_err();
        assert_eq!(err.category(), Some(ErrorCategory::NameCollision));
    }

    // 5. test_version_and_route_mismatch_are_refused
    #[test]
    fn test_version_and_route_mismatch_are_refused() {
        let mut session = dispatcher();
        let mut join = join_request("anna", 5, WorldLocation::default());
        join.protocol_version = 99;
        let err = session.handle(ANNA, Message::PlayerState(join)).unwrap_err();
        assert!(err.is_fatal());
        assert_eq!(err.category(), Some(ErrorCategory::VersionMismatch));

        let mut join = join_request("anna", 5, WorldLocation::default());
        join.route_hash ^= 1;
        let err = session.handle(ANNA, Message::PlayerState(join)).unwrap_err();
        assert_eq!(err.category(), Some(ErrorCategory::RouteMismatch));
        assert!(session.registry().find_player("anna").is_none());
    }

    #[test]
    fn test_unplaceable_train_is_rejected() {
        let mut session = dispatcher();
        session.sim_mut().add_route_tile(0, 0);
        let join = join_request("anna", 5, WorldLocation::new(40, 40, 0.0, 0.0, 0.0));
        let err = session.handle(ANNA, Message::PlayerState(join)).unwrap_err();
        assert_eq!(err.category(), Some(ErrorCategory::InconsistentTrainState));
        assert!(session.registry().find_player("anna").is_none());
        let out = sent(&mut session);
        assert!(matches!(
            &out[0],
            (Recipient::Connection(ANNA), Message::Control(c)) if c.kind == ControlKind::PlacementError
        ));
    }

    // 6. test_reconnect_far_from_old_train_reattaches
    #[test]
    fn test_reconnect_far_from_old_train_reattaches() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        session.on_peer_disconnected(ANNA);
        assert!(session.registry().is_lost("anna"));
        assert!(session.sim().contains_train(5));

        session.tick(100.0);
        let far = WorldLocation::new(0, 0, 1500.0, 0.0, 0.0);
        session
            .handle(BOB, Message::PlayerState(join_request("anna", 9, far)))
            .unwrap();
        let out = sent(&mut session);
        assert!(matches!(&out[0], (Recipient::All, Message::PlayerState(p)) if p.consist.number == 5));
        let player = session.registry().find_player("anna").unwrap();
        assert_eq!(player.train, Some(5));
        assert_eq!(player.connection, Some(BOB));
        assert!(player.protected);
        assert!(!session.registry().is_lost("anna"));

        session.tick(101.0);
        assert!(!session.sim().contains_train(9));
        assert!(!session.registry().find_player("anna").unwrap().protected);
    }

    // 7. test_reconnect_near_old_train_starts_fresh
    #[test]
    fn test_reconnect_near_old_train_starts_fresh() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        session.on_peer_disconnected(ANNA);

        let near = WorldLocation::new(0, 0, 500.0, 0.0, 500.0);
        session
            .handle(BOB, Message::PlayerState(join_request("anna", 5, near)))
            .unwrap();
        assert!(!session.registry().is_lost("anna"));
        let out = sent(&mut session);
        let announced = out
            .iter()
            .find_map(|(_, m)| match m {
                Message::PlayerState(p) if p.user == "anna" => Some(p.consist.number),
                _ => None,
            })
            .unwrap();
        assert!(out.iter().any(|(to, m)| *to == Recipient::All
            && matches!(m, Message::RemoveTrain(r) if r.numbers == vec![5])));

        session.tick(session.now());
        assert_eq!(session.registry().find_player("anna").unwrap().train, Some(announced));
        assert_eq!(session.sim().train(announced).unwrap().rear_location, near);
    }

    #[test]
    fn test_reconnect_does_not_reclaim_a_taken_train() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        admitted(&mut session, BOB, "bob", 6);
        session.on_peer_disconnected(BOB);

        let request = TrainControl {
            user: "anna".into(),
            request: ControlRequest::Request,
            number: 6,
            lead_car: Some("bob - 0".into()),
        };
        session.handle(ANNA, Message::TrainControl(request)).unwrap();
        assert_eq!(session.registry().drivers_of(6), vec!["anna"]);
        session.take_outbox();

        let far = WorldLocation::new(0, 0, 1500.0, 0.0, 0.0);
        session
            .handle(ConnectionId(3), Message::PlayerState(join_request("bob", 6, far)))
            .unwrap();
        let announced = sent(&mut session)
            .into_iter()
            .find_map(|(_, m)| match m {
                Message::PlayerState(p) if p.user == "bob" => Some(p.consist.number),
                _ => None,
            })
            .unwrap();

        assert_ne!(announced, 6);
        assert!(!session.registry().is_lost("bob"));
        assert_eq!(session.registry().drivers_of(6), vec!["anna"]);
        assert!(session.sim().contains_train(6));
        session.tick(session.now());
        assert_eq!(session.registry().find_player("bob").unwrap().train, Some(announced));
    }

    // 8. test_lost_player_expires_after_grace
    #[test]
    fn test_lost_player_expires_after_grace() {
        let mut session = dispatcher();
        session.tick(0.0);
        admitted(&mut session, ANNA, "anna", 5);
        session.on_peer_disconnected(ANNA);
        assert!(session
            .take_events()
            .contains(&SessionEvent::PlayerLost { user: "anna".into() }));

        session.tick(599.0);
        assert!(session.registry().is_lost("anna"));
        assert!(session.sim().contains_train(5));

        session.tick(600.0);
        assert!(!session.registry().is_lost("anna"));
        assert!(!session.sim().contains_train(5));
        assert!(session
            .take_events()
            .contains(&SessionEvent::PlayerLeft { user: "anna".into() }));
    }

    // 9. test_quit_removes_player_and_train
    #[test]
    fn test_quit_removes_player_and_train() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        admitted(&mut session, BOB, "bob", 6);

        session.handle(ANNA, Message::Quit(Quit { user: "anna".into() })).unwrap();
        let out = sent(&mut session);
        assert!(matches!(&out[0], (Recipient::AllExcept(ANNA), Message::Quit(_))));

        // The link closes before the next tick; no grace window for a quit.
        session.on_peer_disconnected(ANNA);
        assert!(!session.registry().is_lost("anna"));

        session.tick(session.now());
        assert!(session.registry().find_player("anna").is_none());
        assert!(!session.sim().contains_train(5));
        assert!(session.sim().contains_train(6));
    }

    #[test]
    fn test_quit_from_stale_connection_is_ignored() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        session.handle(BOB, Message::Quit(Quit { user: "anna".into() })).unwrap();
        session.tick(session.now());
        assert!(session.registry().find_player("anna").is_some());
    }

    // 10. test_shared_train_survives_one_leaving_driver
    #[test]
    fn test_shared_train_survives_one_leaving_driver() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        admitted(&mut session, BOB, "bob", 6);
        session.registry.find_player_mut("bob").unwrap().train = Some(5);

        session.handle(ANNA, Message::Quit(Quit { user: "anna".into() })).unwrap();
        session.tick(session.now());
        assert!(session.sim().contains_train(5));
    }

    #[test]
    fn test_rejoin_while_quit_is_queued() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);

        session.handle(ANNA, Message::Quit(Quit { user: "anna".into() })).unwrap();
        session
            .handle(BOB, Message::PlayerState(join_request("anna", 5, WorldLocation::default())))
            .unwrap();
        session.tick(session.now());

        let player = session.registry().find_player("anna").unwrap();
        assert_eq!(player.connection, Some(BOB));
        let train = player.train.unwrap();
        assert!(session.sim().contains_train(train));
    }

    // 11. test_client_adopts_assigned_number
    #[test]
    fn test_client_adopts_assigned_number() {
        let mut session = client("anna", 5, WorldLocation::default());
        let mut announce = join_request("anna", 5, WorldLocation::default());
        announce.consist.number = 12;
        session.handle(ConnectionId(0), Message::PlayerState(announce)).unwrap();

        assert_eq!(session.local_train(), Some(12));
        let train = session.sim().train(12).unwrap();
        assert!(train.cars.iter().all(|car| car.train == Some(12)));
        assert!(!session.sim().contains_train(5));
    }

    #[test]
    fn test_client_learns_remote_player() {
        let mut session = client("anna", 5, WorldLocation::default());
        session
            .handle(ConnectionId(0), Message::PlayerState(join_request("bob", 6, WorldLocation::default())))
            .unwrap();
        session.tick(0.0);
        assert_eq!(session.registry().find_player("bob").unwrap().train, Some(6));
        assert_eq!(session.sim().train(6).unwrap().control_mode, ControlMode::RemotePlayer);
    }

    #[test]
    fn test_link_loss_releases_remote_trains() {
        let mut session = client("anna", 5, WorldLocation::default());
        session
            .handle(ConnectionId(0), Message::PlayerState(join_request("bob", 6, WorldLocation::default())))
            .unwrap();
        session.tick(0.0);

        session.on_link_lost("connection reset");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.registry().player_count(), 0);
        assert_eq!(session.sim().train(6).unwrap().control_mode, ControlMode::Static);
        assert_eq!(session.sim().train(5).unwrap().control_mode, ControlMode::LocalPlayer);
    }

    #[test]
    fn test_roster_round_trip_restores_lost_players() {
        let mut session = dispatcher();
        admitted(&mut session, ANNA, "anna", 5);
        let roster = session.roster();

        let mut restored = dispatcher();
        restored.restore_roster(roster);
        assert!(restored.registry().is_lost("anna"));
    }

    #[test]
    fn test_spawn_consist_picks_lead() {
        let train = spawn_consist(3, "anna", consist(3, "anna", WorldLocation::default()).cars);
        assert_eq!(train.lead_car_id(), Some("anna - 0"));
    }
}
