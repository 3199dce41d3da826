//! The multiplayer session: role state machine, pending queues, and the
//! per-tick broadcast loop.
//!
//! A [`Session`] is a plain value. It never touches sockets: inbound
//! messages arrive through [`Session::handle`], outbound ones pile up in an
//! outbox that the [`Driver`](crate::driver::Driver) drains after every
//! tick. That keeps the whole protocol testable without a network.

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::hash::{Hash, Hasher};

use railsync_config::MultiplayerConfig;
use railsync_net::ConnectionId;
use rustc_hash::FxHasher;

use crate::authority::{self, AuthorityArbiter, AuthorityDecision, DenyReason};
use crate::catalog::CarCatalog;
use crate::chat::{ChatConfig, ChatLimiter};
use crate::clock::GameClock;
use crate::consist;
use crate::error::SessionError;
use crate::messages::{
    ChatMessage, ControlLevel, ControlRequest, ExhaustEntry, ExhaustMessage, LocomotiveChange,
    LocomotiveState, Message, MoveEntry, MoveMessage, MovingTable, SignalChange, SignalRecord,
    SignalReset, SignalState, SwitchChange, SwitchState, TimeCheck, TrainControl, TrainRecord,
};
use crate::registry::{OnlineLocomotive, OnlineTrains};
use crate::roster::Roster;
use crate::sim::{ControlMode, LocoControls, SignalHold, Simulation, Train, TrainNumber};

/// Protocol version announced in every join.
pub const PROTOCOL_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// SessionConfig
// ---------------------------------------------------------------------------

/// Timings and limits of a session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub protocol_version: u32,
    /// Seconds between position broadcasts.
    pub position_interval: f64,
    /// Seconds between switch, signal and clock snapshots.
    pub switch_interval: f64,
    /// Seconds a disconnected player's train is kept.
    pub lost_player_grace: f64,
    /// Moves for an unknown train before the client asks for it.
    pub missing_train_threshold: u32,
    /// Seconds a client keeps reporting its train after it stopped.
    pub client_stop_window: f64,
    /// Squared distance beyond which a reconnecting player gets the old
    /// train back.
    pub reattach_distance_sq: f64,
    /// Let every client throw switches, not only aiders.
    pub allow_client_switching: bool,
    pub chat: ChatConfig,
    /// Capacity of each pending queue.
    pub queue_capacity: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            protocol_version: PROTOCOL_VERSION,
            position_interval: 1.0,
            switch_interval: 10.0,
            lost_player_grace: 600.0,
            missing_train_threshold: 10,
            client_stop_window: 5.0,
            reattach_distance_sq: 1_000_000.0,
            allow_client_switching: false,
            chat: ChatConfig::default(),
            queue_capacity: 1024,
        }
    }
}

impl SessionConfig {
    pub fn from_config(config: &MultiplayerConfig) -> Self {
        Self {
            position_interval: config.position_interval_secs,
            switch_interval: config.switch_interval_secs,
            lost_player_grace: config.lost_player_grace_secs,
            missing_train_threshold: config.missing_train_threshold,
            client_stop_window: config.client_stop_window_secs,
            reattach_distance_sq: config.reattach_distance_sq,
            allow_client_switching: config.allow_client_switching,
            queue_capacity: config.inbox_capacity,
            ..Self::default()
        }
    }
}

/// Stable hash of a route name, compared on join.
pub fn route_hash(route: &str) -> u64 {
    let mut hasher = FxHasher::default();
    route.hash(&mut hasher);
    hasher.finish()
}

// ---------------------------------------------------------------------------
// State and output
// ---------------------------------------------------------------------------

/// Lifecycle of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Single-player, never connected.
    #[default]
    Idle,
    /// Waiting for the dispatcher link.
    Connecting,
    Client,
    Dispatcher,
    /// Single-player after losing or being refused a session.
    Disconnected,
}

/// What this node is in the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    None,
    Client,
    Dispatcher,
}

impl SessionState {
    pub fn role(self) -> Role {
        match self {
            SessionState::Client => Role::Client,
            SessionState::Dispatcher => Role::Dispatcher,
            SessionState::Idle | SessionState::Connecting | SessionState::Disconnected => Role::None,
        }
    }
}

/// Where an outbound message goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recipient {
    /// Every connected client.
    All,
    /// Every client except the one that sent the original.
    AllExcept(ConnectionId),
    Connection(ConnectionId),
    /// The dispatcher link of a client.
    Dispatcher,
}

/// One outbox entry.
#[derive(Debug, Clone, PartialEq)]
pub enum Outgoing {
    Send { recipient: Recipient, message: Message },
    /// Close the link(s) once queued frames are flushed.
    Close(Recipient),
}

/// Things the hosting game should know about.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Notification { level: ControlLevel, text: String },
    Chat { from: String, text: String },
    PlayerJoined { user: String, train: TrainNumber },
    PlayerLost { user: String },
    PlayerLeft { user: String },
    AuthorityChanged { user: String, train: TrainNumber },
    FellBackToSinglePlayer { reason: String },
}

// ---------------------------------------------------------------------------
// Pending queues
// ---------------------------------------------------------------------------

/// Changes deferred to the next tick. Items are re-checked when drained.
#[derive(Debug, Default)]
pub(crate) struct PendingQueues {
    capacity: usize,
    pub trains_to_add: VecDeque<Train>,
    pub trains_to_remove: VecDeque<TrainNumber>,
    pub locos_to_add: VecDeque<OnlineLocomotive>,
    pub locos_to_remove: VecDeque<OnlineLocomotive>,
    pub players_to_remove: VecDeque<String>,
}

fn push_bounded<T>(queue: &mut VecDeque<T>, capacity: usize, item: T, what: &'static str) {
    if queue.len() >= capacity {
        tracing::warn!(queue = what, capacity, "pending queue full, change dropped");
        return;
    }
    queue.push_back(item);
}

impl PendingQueues {
    fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ..Self::default()
        }
    }

    pub fn add_train(&mut self, train: Train) {
        push_bounded(&mut self.trains_to_add, self.capacity, train, "trains_to_add");
    }

    pub fn remove_train(&mut self, number: TrainNumber) {
        push_bounded(&mut self.trains_to_remove, self.capacity, number, "trains_to_remove");
    }

    pub fn add_loco(&mut self, loco: OnlineLocomotive) {
        push_bounded(&mut self.locos_to_add, self.capacity, loco, "locos_to_add");
    }

    pub fn remove_loco(&mut self, loco: OnlineLocomotive) {
        push_bounded(&mut self.locos_to_remove, self.capacity, loco, "locos_to_remove");
    }

    pub fn remove_player(&mut self, username: String) {
        push_bounded(&mut self.players_to_remove, self.capacity, username, "players_to_remove");
    }

    pub fn has_train(&self, number: TrainNumber) -> bool {
        self.trains_to_add.iter().any(|train| train.number == number)
    }

    pub fn train(&self, number: TrainNumber) -> Option<&Train> {
        self.trains_to_add.iter().find(|train| train.number == number)
    }

    fn highest_train(&self) -> Option<TrainNumber> {
        self.trains_to_add.iter().map(|train| train.number).max()
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

/// One node's view of a multiplayer session.
#[derive(Debug)]
pub struct Session {
    pub(crate) config: SessionConfig,
    pub(crate) state: SessionState,
    pub(crate) local_user: String,
    pub(crate) session_code: String,
    pub(crate) route_hash: u64,
    pub(crate) clock: GameClock,
    pub(crate) sim: Simulation,
    pub(crate) catalog: CarCatalog,
    pub(crate) registry: OnlineTrains,
    pub(crate) pending: PendingQueues,
    pub(crate) chat: ChatLimiter,
    pub(crate) local_train: Option<TrainNumber>,
    /// Users allowed to set switches and signals.
    pub(crate) aiders: BTreeSet<String>,
    /// Moves seen for trains this node does not know.
    pub(crate) missing_trains: HashMap<TrainNumber, u32>,
    pub(crate) last_position_broadcast: f64,
    pub(crate) last_snapshot: f64,
    pub(crate) last_local_motion: f64,
    pub(crate) outbox: Vec<Outgoing>,
    pub(crate) events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        local_user: impl Into<String>,
        route: &str,
        sim: Simulation,
        catalog: CarCatalog,
    ) -> Self {
        let pending = PendingQueues::new(config.queue_capacity);
        let chat = ChatLimiter::new(config.chat.clone());
        Self {
            config,
            state: SessionState::Idle,
            local_user: local_user.into(),
            session_code: String::new(),
            route_hash: route_hash(route),
            clock: GameClock::new(),
            sim,
            catalog,
            registry: OnlineTrains::new(),
            pending,
            chat,
            local_train: None,
            aiders: BTreeSet::new(),
            missing_trains: HashMap::new(),
            last_position_broadcast: f64::NEG_INFINITY,
            last_snapshot: f64::NEG_INFINITY,
            last_local_motion: f64::NEG_INFINITY,
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    // -- accessors ----------------------------------------------------------

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn role(&self) -> Role {
        self.state.role()
    }

    pub fn is_dispatcher(&self) -> bool {
        self.role() == Role::Dispatcher
    }

    pub fn local_user(&self) -> &str {
        &self.local_user
    }

    pub fn route_hash(&self) -> u64 {
        self.route_hash
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Session time, corrected towards the dispatcher on clients.
    pub fn now(&self) -> f64 {
        self.clock.now()
    }

    pub fn sim(&self) -> &Simulation {
        &self.sim
    }

    pub fn sim_mut(&mut self) -> &mut Simulation {
        &mut self.sim
    }

    pub fn catalog(&self) -> &CarCatalog {
        &self.catalog
    }

    pub fn registry(&self) -> &OnlineTrains {
        &self.registry
    }

    pub fn local_train(&self) -> Option<TrainNumber> {
        self.local_train
    }

    /// Make `number` the locally driven train.
    pub fn set_local_train(&mut self, number: TrainNumber) -> Result<(), SessionError> {
        if !self.sim.contains_train(number) {
            return Err(crate::sim::SimError::UnknownTrain(number).into());
        }
        let previous = self.local_train.replace(number);
        let mut touched = vec![number];
        touched.extend(previous);
        self.refresh_control_modes(&touched);
        Ok(())
    }

    pub fn add_aider(&mut self, user: impl Into<String>) {
        self.aiders.insert(user.into());
    }

    pub fn remove_aider(&mut self, user: &str) {
        self.aiders.remove(user);
    }

    pub fn is_aider(&self, user: &str) -> bool {
        self.aiders.contains(user)
    }

    /// Drain outbound messages.
    pub fn take_outbox(&mut self) -> Vec<Outgoing> {
        std::mem::take(&mut self.outbox)
    }

    /// Drain events for the host.
    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    // -- lifecycle ----------------------------------------------------------

    /// Become the dispatcher of a new session.
    pub fn start_dispatcher(&mut self) {
        self.registry.clear();
        self.state = SessionState::Dispatcher;
        tracing::info!(user = %self.local_user, "session started as dispatcher");
    }

    /// A connection to a dispatcher is being opened.
    pub fn begin_connect(&mut self) {
        self.state = SessionState::Connecting;
    }

    /// The dispatcher link is up.
    pub fn connected(&mut self) {
        self.state = SessionState::Client;
        tracing::info!(user = %self.local_user, "connected to dispatcher");
    }

    /// The dispatcher could not be reached.
    pub fn connect_failed(&mut self, reason: impl Into<String>) {
        self.fall_back_to_single_player(reason);
    }

    /// Leave the session on purpose.
    pub fn stop(&mut self) {
        let quit = Message::Quit(crate::messages::Quit {
            user: self.local_user.clone(),
        });
        match self.role() {
            Role::Dispatcher => {
                self.send(Recipient::All, quit);
                self.outbox.push(Outgoing::Close(Recipient::All));
            }
            Role::Client => {
                self.send(Recipient::Dispatcher, quit);
                self.outbox.push(Outgoing::Close(Recipient::Dispatcher));
            }
            Role::None => return,
        }
        self.state = SessionState::Idle;
        self.release_remote_trains();
        tracing::info!(user = %self.local_user, "left session");
    }

    /// Announce the local train to the dispatcher.
    pub fn join_game(&mut self, user: &str, route: &str, code: &str) -> Result<(), SessionError> {
        if self.role() != Role::Client {
            return Err(SessionError::NotConnected);
        }
        self.local_user = user.to_string();
        self.route_hash = route_hash(route);
        self.session_code = code.to_string();

        let number = self.local_train.ok_or(SessionError::NoLocalTrain)?;
        let train = self.sim.train(number).ok_or(SessionError::NoLocalTrain)?;
        let join = crate::messages::PlayerState {
            user: self.local_user.clone(),
            code: self.session_code.clone(),
            protocol_version: self.config.protocol_version,
            route_hash: self.route_hash,
            consist: crate::messages::ConsistRecord::from_train(train),
            speed: train.speed_mps,
        };
        tracing::info!(user, train = number, "joining session");
        self.send(Recipient::Dispatcher, Message::PlayerState(join));
        Ok(())
    }

    // -- local actions ------------------------------------------------------

    /// Ask for authority over `number`.
    pub fn request_train_control(&mut self, number: TrainNumber) -> Result<(), SessionError> {
        if !self.sim.contains_train(number) {
            return Err(crate::sim::SimError::UnknownTrain(number).into());
        }
        let request = TrainControl {
            user: self.local_user.clone(),
            request: ControlRequest::Request,
            number,
            lead_car: self
                .sim
                .train(number)
                .and_then(Train::lead_car_id)
                .map(str::to_string),
        };
        match self.role() {
            Role::Client => self.send(Recipient::Dispatcher, Message::TrainControl(request)),
            Role::Dispatcher => {
                let decision = AuthorityArbiter::new(&self.registry, &self.sim, &self.local_user, self.local_train)
                    .decide(&self.local_user, number);
                match decision {
                    AuthorityDecision::Grant => {
                        let confirm = authority::confirm(&request);
                        self.apply_confirm(&confirm);
                        self.send(Recipient::All, Message::TrainControl(confirm));
                    }
                    AuthorityDecision::Deny(reason) => {
                        self.notify(ControlLevel::Warning, deny_text(number, &reason));
                    }
                }
            }
            Role::None => self.set_local_train(number)?,
        }
        Ok(())
    }

    /// Couple `removed` behind `kept`.
    pub fn couple(&mut self, kept: TrainNumber, removed: TrainNumber) -> Result<(), SessionError> {
        let message = consist::couple_message(&self.sim, &self.local_user, kept, removed)?;
        self.apply_couple(&message)?;
        self.publish(Message::Couple(message));
        Ok(())
    }

    /// Split `number` in front of car `index`. Returns the number of the rear
    /// part.
    pub fn uncouple(&mut self, number: TrainNumber, index: usize) -> Result<TrainNumber, SessionError> {
        let new_number = self.next_free_number();
        let message = consist::uncouple_message(&self.sim, &self.local_user, number, index, new_number)?;
        self.apply_uncouple(&message)?;
        self.publish(Message::Uncouple(message));
        Ok(new_number)
    }

    /// Turn `number` end for end.
    pub fn flip(&mut self, number: TrainNumber) -> Result<(), SessionError> {
        let message = consist::flip_message(&self.sim, &self.local_user, number)?;
        self.apply_flip(&message)?;
        self.publish(Message::Flip(message));
        Ok(())
    }

    /// Throw a switch. Clients only ask; the dispatcher's broadcast applies it.
    pub fn throw_switch(&mut self, junction: u32, route: u8) -> Result<(), SessionError> {
        let change = SwitchChange {
            user: self.local_user.clone(),
            junction,
            route,
        };
        match self.role() {
            Role::Client => self.send(Recipient::Dispatcher, Message::SwitchChange(change)),
            Role::Dispatcher => {
                self.sim.request_set_switch(junction, route)?;
                self.send(Recipient::All, Message::SwitchChange(change));
            }
            Role::None => self.sim.request_set_switch(junction, route)?,
        }
        Ok(())
    }

    /// Hold or release a signal.
    pub fn set_signal(&mut self, signal: u32, hold: SignalHold) -> Result<(), SessionError> {
        let change = SignalChange {
            user: self.local_user.clone(),
            signal,
            hold,
        };
        match self.role() {
            Role::Client => self.send(Recipient::Dispatcher, Message::SignalChange(change)),
            Role::Dispatcher => {
                self.sim.set_signal_hold(signal, hold)?;
                self.send(Recipient::All, Message::SignalChange(change));
            }
            Role::None => self.sim.set_signal_hold(signal, hold)?,
        }
        Ok(())
    }

    /// Release the holds of `signals`.
    pub fn reset_signals(&mut self, signals: Vec<u32>) -> Result<(), SessionError> {
        let reset = SignalReset {
            user: self.local_user.clone(),
            signals,
        };
        match self.role() {
            Role::Client => self.send(Recipient::Dispatcher, Message::SignalReset(reset)),
            Role::Dispatcher => {
                self.apply_signal_reset(&reset.signals);
                self.send(Recipient::All, Message::SignalReset(reset));
            }
            Role::None => self.apply_signal_reset(&reset.signals),
        }
        Ok(())
    }

    /// Start a turntable.
    pub fn move_turntable(&mut self, id: u32, target: u32, clockwise: bool) -> Result<(), SessionError> {
        self.sim.set_turntable_target(id, target, clockwise)?;
        self.publish(Message::MovingTable(MovingTable {
            user: self.local_user.clone(),
            id,
            target,
            clockwise,
        }));
        Ok(())
    }

    /// Move the local cab to another engine of the local train.
    pub fn change_locomotive(&mut self, car_id: &str) -> Result<(), SessionError> {
        let number = self.local_train.ok_or(SessionError::NoLocalTrain)?;
        let train = self
            .sim
            .train_mut(number)
            .ok_or(crate::sim::SimError::UnknownTrain(number))?;
        train.recompute_lead(Some(car_id));
        self.publish(Message::LocomotiveChange(LocomotiveChange {
            user: self.local_user.clone(),
            number,
            car_id: car_id.to_string(),
        }));
        Ok(())
    }

    /// Send the cab controls of the local lead locomotive.
    pub fn publish_controls(&mut self, controls: LocoControls) -> Result<(), SessionError> {
        let number = self.local_train.ok_or(SessionError::NoLocalTrain)?;
        let train = self
            .sim
            .train_mut(number)
            .ok_or(crate::sim::SimError::UnknownTrain(number))?;
        let Some(index) = train.lead_locomotive else {
            return Ok(());
        };
        let car = &mut train.cars[index];
        car.controls = controls;
        let state = LocomotiveState {
            user: self.local_user.clone(),
            number,
            car_id: car.car_id.clone(),
            controls,
        };
        self.publish(Message::LocomotiveState(state));
        Ok(())
    }

    /// Send chat text; an empty `recipients` list reaches everyone.
    pub fn send_chat(&mut self, text: &str, recipients: Vec<String>) {
        let message = ChatMessage {
            user: self.local_user.clone(),
            recipients,
            text: text.to_string(),
        };
        match self.role() {
            Role::Client => self.send(Recipient::Dispatcher, Message::Chat(message)),
            Role::Dispatcher => self.route_chat(None, message),
            Role::None => {}
        }
    }

    /// Save the dispatcher's roster.
    pub fn roster(&self) -> Roster {
        Roster::capture(&self.registry, &self.sim)
    }

    /// Restore a saved roster; every player comes back as lost.
    pub fn restore_roster(&mut self, roster: Roster) {
        let now = self.clock.now();
        roster.restore_into(&mut self.registry, now);
        for lost in self.registry.lost_players() {
            tracing::debug!(user = %lost.player.username, train = ?lost.player.train, "restored lost player");
        }
    }

    // -- tick ---------------------------------------------------------------

    /// Advance the session to `local_clock` seconds.
    pub fn tick(&mut self, local_clock: f64) {
        self.clock.advance(local_clock);
        let now = self.clock.now();
        match self.state {
            SessionState::Dispatcher => {
                self.broadcast_positions(now);
                self.broadcast_snapshots(now);
            }
            SessionState::Client => self.report_local_train(now),
            _ => {}
        }
        self.drain_pending();
        self.expire_lost_players(now);
        self.process_player_removals();
    }

    /// Moves for every train nobody remote drives, plus diesel exhaust.
    fn broadcast_positions(&mut self, now: f64) {
        if now - self.last_position_broadcast < self.config.position_interval {
            return;
        }
        self.last_position_broadcast = now;

        let mut moves = Vec::new();
        let mut exhaust = Vec::new();
        for train in self.sim.trains_mut() {
            if !self.registry.drivers_of(train.number).is_empty() {
                continue;
            }
            if train.speed_mps == 0.0 && train.last_reported_speed == 0.0 {
                continue;
            }
            let user = if self.local_train == Some(train.number) {
                self.local_user.clone()
            } else {
                String::new()
            };
            collect_motion(train, &user, &mut moves, &mut exhaust);
        }
        if !moves.is_empty() {
            self.send(Recipient::All, Message::Move(MoveMessage { entries: moves }));
        }
        if !exhaust.is_empty() {
            self.send(Recipient::All, Message::Exhaust(ExhaustMessage { entries: exhaust }));
        }
    }

    fn broadcast_snapshots(&mut self, now: f64) {
        if now - self.last_snapshot < self.config.switch_interval {
            return;
        }
        self.last_snapshot = now;
        let switches = SwitchState {
            switches: self.sim.switch_states(),
        };
        self.send(Recipient::All, Message::SwitchState(switches));
        let signals = self.signal_state();
        self.send(Recipient::All, Message::SignalState(signals));
        self.send(Recipient::All, Message::TimeCheck(TimeCheck { clock: now }));
    }

    /// Client: report the local train while it moves and for a short while
    /// after it stopped.
    fn report_local_train(&mut self, now: f64) {
        let Some(number) = self.local_train else { return };
        let Some(train) = self.sim.train_mut(number) else { return };
        if train.is_moving() {
            self.last_local_motion = now;
        }
        let active = train.is_moving() || now - self.last_local_motion < self.config.client_stop_window;
        if !active || now - self.last_position_broadcast < self.config.position_interval {
            return;
        }
        self.last_position_broadcast = now;

        let mut moves = Vec::new();
        let mut exhaust = Vec::new();
        collect_motion(train, &self.local_user, &mut moves, &mut exhaust);
        self.send(Recipient::Dispatcher, Message::Move(MoveMessage { entries: moves }));
        if !exhaust.is_empty() {
            self.send(Recipient::Dispatcher, Message::Exhaust(ExhaustMessage { entries: exhaust }));
        }
    }

    fn drain_pending(&mut self) {
        while let Some(train) = self.pending.trains_to_add.pop_front() {
            let number = train.number;
            if self.sim.contains_train(number) {
                tracing::debug!(train = number, "queued train already present");
                continue;
            }
            self.sim.add_train(train);
            let ready = self
                .sim
                .initialize_brakes(number)
                .and_then(|()| self.sim.check_freight(number));
            if let Err(e) = ready {
                tracing::warn!(train = number, error = %e, "failed to ready queued train");
            }
            self.missing_trains.remove(&number);
            tracing::debug!(train = number, "train added");
        }
        while let Some(number) = self.pending.trains_to_remove.pop_front() {
            if self.local_train == Some(number) {
                tracing::warn!(train = number, "refusing to remove the local train");
                continue;
            }
            if self.sim.remove_train(number).is_some() {
                self.registry.remove_online_locos_of_train(number);
                tracing::debug!(train = number, "train removed");
            }
        }
        while let Some(loco) = self.pending.locos_to_add.pop_front() {
            self.registry.add_online_loco(loco);
        }
        while let Some(loco) = self.pending.locos_to_remove.pop_front() {
            self.registry.remove_online_loco(&loco);
        }
    }

    // -- helpers shared with the handlers ----------------------------------

    pub(crate) fn send(&mut self, recipient: Recipient, message: Message) {
        self.outbox.push(Outgoing::Send { recipient, message });
    }

    /// Send a locally initiated change to the rest of the session.
    pub(crate) fn publish(&mut self, message: Message) {
        match self.role() {
            Role::Dispatcher => self.send(Recipient::All, message),
            Role::Client => self.send(Recipient::Dispatcher, message),
            Role::None => {}
        }
    }

    /// Dispatcher: pass a client's change on to everyone else.
    pub(crate) fn relay(&mut self, from: ConnectionId, message: Message) {
        if self.is_dispatcher() {
            self.send(Recipient::AllExcept(from), message);
        }
    }

    pub(crate) fn notify(&mut self, level: ControlLevel, text: impl Into<String>) {
        self.events.push(SessionEvent::Notification {
            level,
            text: text.into(),
        });
    }

    /// Lowest number free in the arena and in the pending adds.
    pub(crate) fn next_free_number(&self) -> TrainNumber {
        let pending = self.pending.highest_train().map_or(1, |n| n + 1);
        self.sim.allocate_train_number().max(pending)
    }

    /// Set control modes of `trains` from who drives them now.
    pub(crate) fn refresh_control_modes(&mut self, trains: &[TrainNumber]) {
        for &number in trains {
            let remote = !self.registry.drivers_of(number).is_empty();
            let Some(train) = self.sim.train_mut(number) else { continue };
            train.control_mode = if self.local_train == Some(number) {
                ControlMode::LocalPlayer
            } else if remote {
                ControlMode::RemotePlayer
            } else if matches!(train.control_mode, ControlMode::LocalPlayer | ControlMode::RemotePlayer) {
                ControlMode::Static
            } else {
                train.control_mode
            };
        }
    }

    /// Hand every remotely driven train back to the local simulation.
    pub(crate) fn release_remote_trains(&mut self) {
        self.registry.clear();
        self.missing_trains.clear();
        for train in self.sim.trains_mut() {
            if self.local_train == Some(train.number) {
                train.control_mode = ControlMode::LocalPlayer;
            } else if train.control_mode == ControlMode::RemotePlayer {
                train.control_mode = ControlMode::Static;
            }
        }
    }

    pub(crate) fn signal_state(&self) -> SignalState {
        SignalState {
            signals: self
                .sim
                .signals()
                .map(|signal| SignalRecord {
                    id: signal.id,
                    hold: signal.hold,
                    heads: signal.heads.clone(),
                })
                .collect(),
        }
    }

    pub(crate) fn apply_signal_reset(&mut self, signals: &[u32]) {
        for &id in signals {
            if let Err(e) = self.sim.set_signal_hold(id, SignalHold::None) {
                tracing::debug!(signal = id, error = %e, "signal reset skipped");
            }
        }
    }

    /// Everything a client needs to recreate `train`.
    pub(crate) fn train_record(&self, train: &Train) -> TrainRecord {
        let driver = if self.local_train == Some(train.number) {
            Some(self.local_user.clone())
        } else {
            self.registry
                .drivers_of(train.number)
                .first()
                .map(|user| user.to_string())
        };
        TrainRecord {
            consist: crate::messages::ConsistRecord::from_train(train),
            name: train.name.clone(),
            control_mode: train.control_mode,
            speed: train.speed_mps,
            driver,
        }
    }
}

fn collect_motion(train: &mut Train, user: &str, moves: &mut Vec<MoveEntry>, exhaust: &mut Vec<ExhaustEntry>) {
    moves.push(MoveEntry {
        user: user.to_string(),
        number: train.number,
        rear: train.rear_location,
        travelled: train.travelled,
        speed: train.speed_mps,
        direction: train.mu_direction,
        car_count: train.cars.len() as u32,
    });
    train.last_reported_speed = train.speed_mps;
    for (index, car) in train.cars.iter().enumerate() {
        if car.is_diesel() {
            exhaust.push(ExhaustEntry {
                user: user.to_string(),
                number: train.number,
                car_index: index as u32,
                exhaust: car.exhaust,
            });
        }
    }
}

pub(crate) fn deny_text(number: TrainNumber, reason: &DenyReason) -> String {
    match reason {
        DenyReason::UnknownTrain => format!("train {number} does not exist"),
        DenyReason::HeldBy(holder) => format!("train {number} is driven by {holder}"),
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::messages::{ConsistRecord, PlayerState};
    use crate::sim::{CarKind, EngineKind, TrainCar, WorldLocation};

    pub(crate) const ROUTE: &str = "Demo Valley";

    pub(crate) fn consist(number: TrainNumber, prefix: &str, rear: WorldLocation) -> Train {
        let mut train = Train::new(number, format!("{prefix} train"));
        train.cars = vec![
            TrainCar::new(format!("{prefix} - 0"), "engines/class66.ron", CarKind::Engine(EngineKind::Diesel), 21.0),
            TrainCar::new(format!("{prefix} - 1"), "wagons/box.ron", CarKind::Freight, 14.0),
        ];
        train.rear_location = rear;
        train.recompute_lead(None);
        train
    }

    pub(crate) fn dispatcher() -> Session {
        let mut sim = Simulation::new();
        sim.add_train(consist(1, "disp", WorldLocation::default()));
        let mut session = Session::new(SessionConfig::default(), "disp", ROUTE, sim, CarCatalog::new());
        session.set_local_train(1).unwrap();
        session.start_dispatcher();
        session
    }

    pub(crate) fn client(user: &str, number: TrainNumber, rear: WorldLocation) -> Session {
        let mut sim = Simulation::new();
        sim.add_train(consist(number, user, rear));
        let mut session = Session::new(SessionConfig::default(), user, ROUTE, sim, CarCatalog::new());
        session.set_local_train(number).unwrap();
        session.begin_connect();
        session.connected();
        session
    }

    pub(crate) fn join_request(user: &str, number: TrainNumber, rear: WorldLocation) -> PlayerState {
        PlayerState {
            user: user.to_string(),
            code: String::new(),
            protocol_version: PROTOCOL_VERSION,
            route_hash: route_hash(ROUTE),
            consist: ConsistRecord::from_train(&consist(number, user, rear)),
            speed: 0.0,
        }
    }

    pub(crate) fn sent(session: &mut Session) -> Vec<(Recipient, Message)> {
        session
            .take_outbox()
            .into_iter()
            .filter_map(|out| match out {
                Outgoing::Send { recipient, message } => Some((recipient, message)),
                Outgoing::Close(_) => None,
            })
            .collect()
    }

    #[test]
    fn test_route_hash_is_stable() {
        assert_eq!(route_hash(ROUTE), route_hash("Demo Valley"));
        assert_ne!(route_hash(ROUTE), route_hash("Other Line"));
    }

    #[test]
    fn test_role_follows_state() {
        let mut session = Session::new(SessionConfig::default(), "anna", ROUTE, Simulation::new(), CarCatalog::new());
        assert_eq!(session.role(), Role::None);
        session.begin_connect();
        assert_eq!(session.role(), Role::None);
        session.connected();
        assert_eq!(session.role(), Role::Client);
        session.connect_failed("refused");
        assert_eq!(session.state(), SessionState::Disconnected);
        assert_eq!(session.role(), Role::None);
    }

    #[test]
    fn test_dispatcher_throttles_moves() {
        let mut session = dispatcher();
        session.sim_mut().train_mut(1).unwrap().speed_mps = 5.0;

        session.tick(0.0);
        let first = sent(&mut session);
        assert!(first.iter().any(|(_, m)| matches!(m, Message::Move(_))));
        assert!(first.iter().any(|(_, m)| matches!(m, Message::Exhaust(_))));
        assert!(first.iter().any(|(_, m)| matches!(m, Message::TimeCheck(_))));

        session.tick(0.5);
        assert!(sent(&mut session).is_empty());

        session.tick(1.0);
        let moves: Vec<_> = sent(&mut session)
            .into_iter()
            .filter_map(|(to, m)| match m {
                Message::Move(m) => Some((to, m)),
                _ => None,
            })
            .collect();
        assert_eq!(moves.len(), 1);
        assert_eq!(moves[0].0, Recipient::All);
        assert_eq!(moves[0].1.entries[0].user, "disp");
    }

    #[test]
    fn test_dispatcher_reports_the_stop_once() {
        let mut session = dispatcher();
        session.sim_mut().train_mut(1).unwrap().speed_mps = 5.0;
        session.tick(0.0);
        session.take_outbox();

        session.sim_mut().train_mut(1).unwrap().speed_mps = 0.0;
        session.tick(1.0);
        let stop = sent(&mut session)
            .into_iter()
            .find_map(|(_, m)| match m {
                Message::Move(m) => Some(m),
                _ => None,
            })
            .unwrap();
        assert_eq!(stop.entries[0].speed, 0.0);

        session.tick(2.0);
        assert!(!sent(&mut session).iter().any(|(_, m)| matches!(m, Message::Move(_))));
    }

    #[test]
    fn test_snapshots_follow_switch_interval() {
        let mut session = dispatcher();
        session.sim_mut().add_junction(3, 2);
        session.tick(0.0);
        let kinds: Vec<_> = sent(&mut session).into_iter().map(|(_, m)| m.kind()).collect();
        assert!(kinds.contains(&crate::messages::MessageKind::SwitchState));
        assert!(kinds.contains(&crate::messages::MessageKind::SignalState));

        session.tick(9.0);
        assert!(sent(&mut session).is_empty());
        session.tick(10.0);
        assert_eq!(sent(&mut session).len(), 3);
    }

    #[test]
    fn test_client_reports_within_stop_window() {
        let mut session = client("anna", 5, WorldLocation::default());
        session.sim_mut().train_mut(5).unwrap().speed_mps = 3.0;
        session.tick(2.0);
        assert_eq!(sent(&mut session).iter().filter(|(_, m)| matches!(m, Message::Move(_))).count(), 1);

        session.sim_mut().train_mut(5).unwrap().speed_mps = 0.0;
        for t in [3.0, 4.0, 5.0, 6.0] {
            session.tick(t);
            let out = sent(&mut session);
            assert!(
                out.iter().any(|(to, m)| *to == Recipient::Dispatcher && matches!(m, Message::Move(_))),
                "expected a move at {t}"
            );
        }
        session.tick(7.0);
        assert!(sent(&mut session).is_empty());
    }

    #[test]
    fn test_client_without_motion_stays_quiet() {
        let mut session = client("anna", 5, WorldLocation::default());
        session.tick(0.0);
        session.tick(1.0);
        assert!(sent(&mut session).is_empty());
    }

    #[test]
    fn test_pending_train_is_added_on_tick() {
        let mut session = dispatcher();
        session.pending.add_train(consist(4, "x", WorldLocation::default()));
        assert!(!session.sim().contains_train(4));
        session.tick(0.0);
        let train = session.sim().train(4).unwrap();
        assert!(train.brakes_initialized);
        assert!(train.cars.iter().all(|car| car.train == Some(4)));
    }

    #[test]
    fn test_pending_queue_is_bounded() {
        let config = SessionConfig {
            queue_capacity: 2,
            ..SessionConfig::default()
        };
        let mut session = Session::new(config, "disp", ROUTE, Simulation::new(), CarCatalog::new());
        for number in 1..=3 {
            session.pending.remove_train(number);
        }
        assert_eq!(session.pending.trains_to_remove.len(), 2);
    }

    #[test]
    fn test_local_train_is_never_removed_by_queue() {
        let mut session = dispatcher();
        session.pending.remove_train(1);
        session.tick(0.0);
        assert!(session.sim().contains_train(1));
    }

    #[test]
    fn test_next_free_number_skips_pending() {
        let mut session = dispatcher();
        assert_eq!(session.next_free_number(), 2);
        session.pending.add_train(consist(6, "x", WorldLocation::default()));
        assert_eq!(session.next_free_number(), 7);
    }

    #[test]
    fn test_dispatcher_grants_itself_a_free_train() {
        let mut session = dispatcher();
        session.sim_mut().add_train(consist(2, "spare", WorldLocation::default()));
        session.request_train_control(2).unwrap();

        assert_eq!(session.local_train(), Some(2));
        assert_eq!(session.sim().train(2).unwrap().control_mode, ControlMode::LocalPlayer);
        assert_eq!(session.sim().train(1).unwrap().control_mode, ControlMode::Static);
        let out = sent(&mut session);
        assert!(matches!(
            &out[0],
            (Recipient::All, Message::TrainControl(c)) if c.request == ControlRequest::Confirm && c.number == 2
        ));
    }

    #[test]
    fn test_client_switch_is_only_requested() {
        let mut session = client("anna", 5, WorldLocation::default());
        session.sim_mut().add_junction(3, 2);
        session.throw_switch(3, 1).unwrap();
        assert_eq!(session.sim().junction(3).unwrap().selected_route, 0);
        let out = sent(&mut session);
        assert!(matches!(&out[0], (Recipient::Dispatcher, Message::SwitchChange(c)) if c.route == 1));
    }

    #[test]
    fn test_stop_sends_quit_and_closes() {
        let mut session = client("anna", 5, WorldLocation::default());
        session.stop();
        let out = session.take_outbox();
        assert!(matches!(&out[0], Outgoing::Send { message: Message::Quit(q), .. } if q.user == "anna"));
        assert_eq!(out[1], Outgoing::Close(Recipient::Dispatcher));
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[test]
    fn test_join_requires_connection_and_train() {
        let mut session = Session::new(SessionConfig::default(), "anna", ROUTE, Simulation::new(), CarCatalog::new());
        assert!(matches!(session.join_game("anna", ROUTE, ""), Err(SessionError::NotConnected)));
        session.begin_connect();
        session.connected();
        assert!(matches!(session.join_game("anna", ROUTE, ""), Err(SessionError::NoLocalTrain)));
    }
}
