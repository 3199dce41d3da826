//! Inbound message handling for both roles.
//!
//! On the dispatcher every change from a client is validated, applied, and
//! relayed to the other clients. On a client, messages come from the
//! dispatcher and are applied as they are.

use railsync_net::ConnectionId;

use crate::authority::{self, AuthorityArbiter, AuthorityDecision};
use crate::consist;
use crate::error::SessionError;
use crate::messages::{
    ChatMessage, ControlKind, ControlLevel, ControlMessage, ControlRequest, CoupleMessage,
    ExhaustMessage, FlipMessage, LocomotiveChange, LocomotiveState, Message, MoveMessage,
    MovingTable, PlayerTrainChange, RemoveTrain, SignalChange, SignalReset, SignalState,
    SwitchChange, SwitchState, TimeCheck, TrainControl, TrainRecord, TrainRequest, TrainUpdate,
    UncoupleMessage,
};
use crate::registry::{OnlineLocomotive, OnlinePlayer};
use crate::session::{Recipient, Role, Session, SessionEvent, deny_text};
use crate::sim::{ControlMode, TrainNumber};

impl Session {
    /// Apply one message received on connection `from`.
    pub fn handle(&mut self, from: ConnectionId, message: Message) -> Result<(), SessionError> {
        let role = self.role();
        if role == Role::None {
            tracing::debug!(kind = message.kind().as_str(), "message outside a session ignored");
            return Ok(());
        }
        tracing::trace!(kind = message.kind().as_str(), connection = from.0, "handling message");

        if role == Role::Dispatcher
            && !matches!(message, Message::PlayerState(_))
            && let Some(user) = message.user()
            && !self.is_sender(from, user)
        {
            tracing::warn!(
                kind = message.kind().as_str(),
                user,
                connection = from.0,
                "message from unregistered sender dropped"
            );
            return Ok(());
        }

        match message {
            Message::Move(m) => self.handle_move(from, m),
            Message::Couple(m) => self.handle_couple(from, m),
            Message::Uncouple(m) => self.handle_uncouple(from, m),
            Message::Flip(m) => self.handle_flip(from, m),
            Message::SwitchChange(m) => self.handle_switch_change(from, m),
            Message::SwitchState(m) => {
                self.handle_switch_state(m);
                Ok(())
            }
            Message::SignalChange(m) => self.handle_signal_change(from, m),
            Message::SignalState(m) => {
                self.handle_signal_state(m);
                Ok(())
            }
            Message::SignalReset(m) => {
                self.handle_signal_reset(from, m);
                Ok(())
            }
            Message::PlayerState(m) => self.handle_player_state(from, m),
            Message::PlayerTrainChange(m) => {
                self.handle_player_train_change(from, m);
                Ok(())
            }
            Message::LocomotiveChange(m) => {
                self.handle_locomotive_change(from, m);
                Ok(())
            }
            Message::LocomotiveState(m) => {
                self.handle_locomotive_state(from, m);
                Ok(())
            }
            Message::Exhaust(m) => {
                self.handle_exhaust(from, m);
                Ok(())
            }
            Message::Control(m) => {
                self.handle_control(m);
                Ok(())
            }
            Message::TrainControl(m) => {
                self.handle_train_control(from, m);
                Ok(())
            }
            Message::TrainRequest(m) => {
                self.handle_train_request(from, m);
                Ok(())
            }
            Message::TrainUpdate(m) => {
                self.handle_train_update(m);
                Ok(())
            }
            Message::RemoveTrain(m) => {
                self.handle_remove_train(m);
                Ok(())
            }
            Message::Quit(m) => {
                self.handle_quit(from, m);
                Ok(())
            }
            Message::Chat(m) => {
                self.handle_chat(from, m);
                Ok(())
            }
            Message::TimeCheck(m) => {
                self.handle_time_check(m);
                Ok(())
            }
            Message::MovingTable(m) => self.handle_moving_table(from, m),
        }
    }

    /// Dispatcher: whether `user` is the player registered on `from`.
    fn is_sender(&self, from: ConnectionId, user: &str) -> bool {
        self.registry
            .find_player(user)
            .is_some_and(|player| player.connection == Some(from))
    }

    // -- motion -------------------------------------------------------------

    fn handle_move(&mut self, from: ConnectionId, message: MoveMessage) -> Result<(), SessionError> {
        let dispatcher = self.is_dispatcher();
        let mut accepted = Vec::new();
        for entry in message.entries {
            if self.local_train == Some(entry.number) || entry.user == self.local_user {
                continue;
            }
            if dispatcher {
                let holds = self.registry.find_player(&entry.user).is_some_and(|player| {
                    player.connection == Some(from) && player.train == Some(entry.number)
                });
                if !holds {
                    tracing::debug!(user = %entry.user, train = entry.number, "move without authority dropped");
                    continue;
                }
            }
            let Some(train) = self.sim.train_mut(entry.number) else {
                if !self.pending.has_train(entry.number) {
                    self.note_missing_train(entry.number);
                }
                continue;
            };
            train.rear_location = entry.rear;
            train.travelled = entry.travelled;
            train.speed_mps = entry.speed;
            train.mu_direction = entry.direction;
            self.sim.calculate_position_of_cars(entry.number)?;
            self.missing_trains.remove(&entry.number);
            accepted.push(entry);
        }
        if dispatcher && !accepted.is_empty() {
            self.relay(from, Message::Move(MoveMessage { entries: accepted }));
        }
        Ok(())
    }

    /// Count moves for an unknown train; a client asks the dispatcher for it
    /// once the count reaches the threshold.
    fn note_missing_train(&mut self, number: TrainNumber) {
        let count = self.missing_trains.entry(number).or_insert(0);
        *count += 1;
        if *count < self.config.missing_train_threshold {
            return;
        }
        self.missing_trains.remove(&number);
        if self.role() == Role::Client {
            tracing::info!(train = number, "requesting unknown train");
            let request = TrainRequest {
                user: self.local_user.clone(),
                number,
            };
            self.send(Recipient::Dispatcher, Message::TrainRequest(request));
        }
    }

    fn handle_exhaust(&mut self, from: ConnectionId, message: ExhaustMessage) {
        let dispatcher = self.is_dispatcher();
        let mut accepted = Vec::new();
        for entry in message.entries {
            if self.local_train == Some(entry.number) {
                continue;
            }
            if dispatcher && !self.is_sender(from, &entry.user) {
                continue;
            }
            let car = self
                .sim
                .train_mut(entry.number)
                .and_then(|train| train.cars.get_mut(entry.car_index as usize));
            if let Some(car) = car {
                car.exhaust = entry.exhaust;
                accepted.push(entry);
            }
        }
        if !accepted.is_empty() {
            self.relay(from, Message::Exhaust(ExhaustMessage { entries: accepted }));
        }
    }

    // -- consist changes ----------------------------------------------------

    /// Dispatcher: why `user` may not change the consist of `trains`. The
    /// sender must drive one of them and nobody else may drive any of them.
    fn consist_denial(&self, user: &str, trains: &[TrainNumber]) -> Option<String> {
        let driven = self.registry.find_player(user).and_then(|player| player.train);
        if !trains.iter().any(|&number| Some(number) == driven) {
            return Some(format!("{user} does not drive train {}", trains[0]));
        }
        let arbiter = AuthorityArbiter::new(&self.registry, &self.sim, &self.local_user, self.local_train);
        trains.iter().find_map(|&number| match arbiter.decide(user, number) {
            AuthorityDecision::Grant => None,
            AuthorityDecision::Deny(reason) => Some(deny_text(number, &reason)),
        })
    }

    /// Dispatcher: refuse a consist change the sender has no authority for.
    /// Returns `true` when the change was refused.
    fn refuse_consist(&mut self, from: ConnectionId, user: &str, trains: &[TrainNumber]) -> bool {
        if !self.is_dispatcher() {
            return false;
        }
        let Some(text) = self.consist_denial(user, trains) else {
            return false;
        };
        tracing::info!(user, ?trains, reason = %text, "consist change refused");
        self.warn_user(from, user, ControlKind::TrainControlDenied, text);
        true
    }

    fn handle_couple(&mut self, from: ConnectionId, message: CoupleMessage) -> Result<(), SessionError> {
        if self.refuse_consist(from, &message.user, &[message.kept.number, message.removed]) {
            return Ok(());
        }
        self.apply_couple(&message)?;
        self.relay(from, Message::Couple(message));
        Ok(())
    }

    fn handle_uncouple(&mut self, from: ConnectionId, mut message: UncoupleMessage) -> Result<(), SessionError> {
        if self.refuse_consist(from, &message.user, &[message.first.number]) {
            return Ok(());
        }
        let second = message.second.number;
        let taken = second == message.first.number
            || self.sim.contains_train(second)
            || self.pending.has_train(second);
        if self.is_dispatcher() && taken {
            // the sender picked the number from a stale view; everyone,
            // sender included, gets the corrected split
            message.second.number = self.next_free_number();
            tracing::info!(user = %message.user, requested = second, assigned = message.second.number, "detached train renumbered");
            self.apply_uncouple(&message)?;
            self.send(Recipient::All, Message::Uncouple(message));
            return Ok(());
        }
        self.apply_uncouple(&message)?;
        self.relay(from, Message::Uncouple(message));
        Ok(())
    }

    fn handle_flip(&mut self, from: ConnectionId, message: FlipMessage) -> Result<(), SessionError> {
        if self.refuse_consist(from, &message.user, &[message.number]) {
            return Ok(());
        }
        self.apply_flip(&message)?;
        self.relay(from, Message::Flip(message));
        Ok(())
    }

    pub(crate) fn apply_couple(&mut self, message: &CoupleMessage) -> Result<(), SessionError> {
        let kept = message.kept.number;
        consist::apply_couple(&mut self.sim, &self.catalog, message)?;
        if message.removed != kept {
            self.registry.retarget_train(message.removed, kept);
            if self.local_train == Some(message.removed) {
                self.local_train = Some(kept);
            }
            self.missing_trains.remove(&message.removed);
        }
        consist::reassign_drivers(&mut self.registry, &self.sim, &[kept]);
        self.refresh_control_modes(&[kept]);
        Ok(())
    }

    pub(crate) fn apply_uncouple(&mut self, message: &UncoupleMessage) -> Result<(), SessionError> {
        let first = message.first.number;
        let second = message.second.number;
        let local_cab = self
            .local_train
            .and_then(|number| self.sim.train(number))
            .and_then(|train| train.lead_car_id())
            .map(str::to_string);

        let absorbed = consist::apply_uncouple(&mut self.sim, &self.catalog, message)?;

        if let Some(cab) = local_cab
            && let Some(holder) = [first, second]
                .into_iter()
                .find(|&number| self.sim.train(number).is_some_and(|train| train.contains_car(&cab)))
            && self.local_train != Some(holder)
        {
            tracing::info!(from = ?self.local_train, to = holder, "local cab moved to another train");
            self.local_train = Some(holder);
        }
        let mut touched = vec![first, second];
        touched.extend(&absorbed);
        for number in &absorbed {
            self.missing_trains.remove(number);
        }
        consist::reassign_drivers(&mut self.registry, &self.sim, &touched);
        self.refresh_control_modes(&[first, second]);
        Ok(())
    }

    pub(crate) fn apply_flip(&mut self, message: &FlipMessage) -> Result<(), SessionError> {
        consist::apply_flip(&mut self.sim, message)?;
        consist::reassign_drivers(&mut self.registry, &self.sim, &[message.number]);
        Ok(())
    }

    // -- switches and signals -----------------------------------------------

    fn may_switch(&self, user: &str) -> bool {
        self.config.allow_client_switching || self.aiders.contains(user)
    }

    fn warn_user(&mut self, to: ConnectionId, user: &str, kind: ControlKind, text: String) {
        let warning = ControlMessage {
            level: ControlLevel::Warning,
            kind,
            recipient: Some(user.to_string()),
            text,
        };
        self.send(Recipient::Connection(to), Message::Control(warning));
    }

    fn handle_switch_change(&mut self, from: ConnectionId, message: SwitchChange) -> Result<(), SessionError> {
        if !self.is_dispatcher() {
            self.sim.request_set_switch(message.junction, message.route)?;
            return Ok(());
        }
        if !self.may_switch(&message.user) {
            let text = format!("not allowed to throw switch {}", message.junction);
            self.warn_user(from, &message.user, ControlKind::SwitchWarning, text);
            return Ok(());
        }
        if let Err(e) = self.sim.request_set_switch(message.junction, message.route) {
            self.warn_user(from, &message.user, ControlKind::SwitchWarning, e.to_string());
            return Err(e.into());
        }
        self.send(Recipient::All, Message::SwitchChange(message));
        Ok(())
    }

    fn handle_switch_state(&mut self, message: SwitchState) {
        if self.is_dispatcher() {
            return;
        }
        for (id, route) in message.switches {
            if let Err(e) = self.sim.request_set_switch(id, route) {
                tracing::debug!(junction = id, error = %e, "switch snapshot entry skipped");
            }
        }
    }

    fn handle_signal_change(&mut self, from: ConnectionId, message: SignalChange) -> Result<(), SessionError> {
        if !self.is_dispatcher() {
            self.sim.set_signal_hold(message.signal, message.hold)?;
            return Ok(());
        }
        if !self.aiders.contains(&message.user) {
            let text = format!("not allowed to set signal {}", message.signal);
            self.warn_user(from, &message.user, ControlKind::SignalWarning, text);
            return Ok(());
        }
        if let Err(e) = self.sim.set_signal_hold(message.signal, message.hold) {
            self.warn_user(from, &message.user, ControlKind::SignalWarning, e.to_string());
            return Err(e.into());
        }
        self.send(Recipient::All, Message::SignalChange(message));
        Ok(())
    }

    fn handle_signal_state(&mut self, message: SignalState) {
        if self.is_dispatcher() {
            return;
        }
        for record in message.signals {
            let applied = self
                .sim
                .set_signal_hold(record.id, record.hold)
                .and_then(|()| self.sim.set_signal_heads(record.id, record.heads));
            if let Err(e) = applied {
                tracing::debug!(signal = record.id, error = %e, "signal snapshot entry skipped");
            }
        }
    }

    fn handle_signal_reset(&mut self, from: ConnectionId, message: SignalReset) {
        if self.is_dispatcher() {
            if !self.aiders.contains(&message.user) {
                let text = "not allowed to reset signals".to_string();
                self.warn_user(from, &message.user, ControlKind::SignalWarning, text);
                return;
            }
            self.apply_signal_reset(&message.signals);
            self.send(Recipient::All, Message::SignalReset(message));
        } else {
            self.apply_signal_reset(&message.signals);
        }
    }

    fn handle_moving_table(&mut self, from: ConnectionId, message: MovingTable) -> Result<(), SessionError> {
        if message.user == self.local_user {
            return Ok(());
        }
        self.sim
            .set_turntable_target(message.id, message.target, message.clockwise)?;
        self.relay(from, Message::MovingTable(message));
        Ok(())
    }

    // -- players and locomotives -------------------------------------------

    fn handle_player_train_change(&mut self, from: ConnectionId, message: PlayerTrainChange) {
        if message.user == self.local_user {
            return;
        }
        if self.is_dispatcher() {
            let decision = AuthorityArbiter::new(&self.registry, &self.sim, &self.local_user, self.local_train)
                .decide(&message.user, message.number);
            if let AuthorityDecision::Deny(reason) = decision {
                let text = deny_text(message.number, &reason);
                self.warn_user(from, &message.user, ControlKind::TrainControlDenied, text);
                return;
            }
        }
        let Some(player) = self.registry.find_player_mut(&message.user) else {
            tracing::debug!(user = %message.user, "train change for unknown player");
            return;
        };
        let previous = player.train.replace(message.number);
        player.lead_car = message.lead_car.clone();
        let mut touched = vec![message.number];
        touched.extend(previous);
        self.refresh_control_modes(&touched);
        self.relay(from, Message::PlayerTrainChange(message));
    }

    fn handle_locomotive_change(&mut self, from: ConnectionId, message: LocomotiveChange) {
        if message.user == self.local_user {
            return;
        }
        let position = self.sim.train_mut(message.number).and_then(|train| {
            train.recompute_lead(Some(&message.car_id));
            train.find_car(&message.car_id)
        });
        if let Some(player) = self.registry.find_player_mut(&message.user) {
            player.lead_car = Some(message.car_id.clone());
        }
        self.registry.remove_online_locos_of(&message.user);
        if let Some(car_position) = position {
            self.registry.add_online_loco(OnlineLocomotive {
                username: message.user.clone(),
                train: message.number,
                car_position,
            });
        }
        self.relay(from, Message::LocomotiveChange(message));
    }

    fn handle_locomotive_state(&mut self, from: ConnectionId, message: LocomotiveState) {
        if message.user == self.local_user || self.local_train == Some(message.number) {
            return;
        }
        let car = self.sim.train_mut(message.number).and_then(|train| {
            let index = train.find_car(&message.car_id)?;
            train.cars.get_mut(index)
        });
        match car {
            Some(car) => car.controls = message.controls,
            None => {
                tracing::debug!(train = message.number, car = %message.car_id, "controls for unknown car");
                return;
            }
        }
        self.relay(from, Message::LocomotiveState(message));
    }

    // -- authority ----------------------------------------------------------

    fn handle_train_control(&mut self, from: ConnectionId, message: TrainControl) {
        match (self.role(), message.request) {
            (Role::Dispatcher, ControlRequest::Request) => {
                let decision = AuthorityArbiter::new(&self.registry, &self.sim, &self.local_user, self.local_train)
                    .decide(&message.user, message.number);
                match decision {
                    AuthorityDecision::Grant => {
                        let confirm = authority::confirm(&message);
                        tracing::info!(user = %confirm.user, train = confirm.number, "authority granted");
                        self.apply_confirm(&confirm);
                        self.send(Recipient::All, Message::TrainControl(confirm));
                    }
                    AuthorityDecision::Deny(reason) => {
                        tracing::info!(user = %message.user, train = message.number, ?reason, "authority denied");
                        let text = deny_text(message.number, &reason);
                        self.warn_user(from, &message.user, ControlKind::TrainControlDenied, text);
                    }
                }
            }
            (Role::Dispatcher, ControlRequest::Confirm) => {
                tracing::warn!(user = %message.user, "confirm from a client ignored");
            }
            (_, ControlRequest::Confirm) => self.apply_confirm(&message),
            (_, ControlRequest::Request) => {
                tracing::debug!(user = %message.user, "authority request on a client ignored");
            }
        }
    }

    /// Move `confirm.user` onto `confirm.number`.
    pub(crate) fn apply_confirm(&mut self, confirm: &TrainControl) {
        let number = confirm.number;
        let mut touched = vec![number];
        if confirm.user == self.local_user {
            touched.extend(self.local_train.replace(number));
        } else {
            let now = self.clock.now();
            match self.registry.find_player_mut(&confirm.user) {
                Some(player) => {
                    touched.extend(player.train.replace(number));
                    player.lead_car = confirm.lead_car.clone();
                }
                None => {
                    let mut player = OnlinePlayer::new(confirm.user.clone(), Some(number), now);
                    player.lead_car = confirm.lead_car.clone();
                    self.registry.add_player(player);
                }
            }
            self.registry.remove_online_locos_of(&confirm.user);
            let position = self.sim.train(number).and_then(|train| {
                confirm
                    .lead_car
                    .as_deref()
                    .and_then(|id| train.find_car(id))
                    .or(train.lead_locomotive)
            });
            if let Some(car_position) = position {
                self.registry.add_online_loco(OnlineLocomotive {
                    username: confirm.user.clone(),
                    train: number,
                    car_position,
                });
            }
        }
        self.refresh_control_modes(&touched);
        self.events.push(SessionEvent::AuthorityChanged {
            user: confirm.user.clone(),
            train: number,
        });
    }

    // -- train sync ---------------------------------------------------------

    fn handle_train_request(&mut self, from: ConnectionId, message: TrainRequest) {
        if !self.is_dispatcher() {
            return;
        }
        match self.sim.train(message.number) {
            Some(train) => {
                let update = TrainUpdate {
                    trains: vec![self.train_record(train)],
                };
                self.send(Recipient::Connection(from), Message::TrainUpdate(update));
            }
            None => {
                let remove = RemoveTrain {
                    numbers: vec![message.number],
                };
                self.send(Recipient::Connection(from), Message::RemoveTrain(remove));
            }
        }
    }

    fn handle_train_update(&mut self, message: TrainUpdate) {
        if self.is_dispatcher() {
            tracing::warn!("train update from a client ignored");
            return;
        }
        for record in message.trains {
            self.upsert_train(record);
        }
    }

    /// Client: create or refresh a train described by the dispatcher.
    fn upsert_train(&mut self, record: TrainRecord) {
        let number = record.consist.number;
        if self.local_train == Some(number) {
            return;
        }
        let control_mode = match record.control_mode {
            ControlMode::LocalPlayer | ControlMode::RemotePlayer => ControlMode::RemotePlayer,
            other => other,
        };
        if let Some(driver) = record.driver.as_deref()
            && driver != self.local_user
            && self.registry.find_player(driver).is_none()
        {
            let mut player = OnlinePlayer::new(driver, Some(number), self.clock.now());
            player.lead_car = record.consist.lead_car.clone();
            self.registry.add_player(player);
        }

        if let Some(train) = self.sim.train_mut(number) {
            train.rear_location = record.consist.rear;
            train.travelled = record.consist.travelled;
            train.mu_direction = record.consist.direction;
            train.speed_mps = record.speed;
            train.control_mode = control_mode;
            return;
        }
        if self.pending.has_train(number) {
            return;
        }
        let mut train = consist::build_train(&self.catalog, &record.consist, record.name);
        train.speed_mps = record.speed;
        train.control_mode = control_mode;
        match self.sim.place(&mut train) {
            Ok(()) => self.pending.add_train(train),
            Err(e) => tracing::warn!(train = number, error = %e, "received train could not be placed"),
        }
    }

    fn handle_remove_train(&mut self, message: RemoveTrain) {
        if self.is_dispatcher() {
            tracing::warn!("train removal from a client ignored");
            return;
        }
        for number in message.numbers {
            if self.local_train == Some(number) {
                continue;
            }
            self.pending.remove_train(number);
        }
    }

    // -- notifications ------------------------------------------------------

    fn handle_control(&mut self, message: ControlMessage) {
        if self.is_dispatcher() {
            tracing::info!(kind = ?message.kind, text = %message.text, "control message from client");
            return;
        }
        if !message.is_for(&self.local_user) {
            return;
        }
        let fatal = message.level == ControlLevel::Error
            && !(message.kind == ControlKind::SameNameError && self.registry.player_count() > 0);
        if fatal {
            tracing::error!(kind = ?message.kind, text = %message.text, "dispatcher refused the session");
            self.fall_back_to_single_player(message.text);
        } else {
            self.notify(message.level, message.text);
        }
    }

    fn handle_chat(&mut self, from: ConnectionId, message: ChatMessage) {
        if self.is_dispatcher() {
            self.route_chat(Some(from), message);
        } else if message.user != self.local_user {
            self.events.push(SessionEvent::Chat {
                from: message.user,
                text: message.text,
            });
        }
    }

    /// Dispatcher: validate and deliver a chat message. `from` is `None` for
    /// the dispatcher's own messages.
    pub(crate) fn route_chat(&mut self, from: Option<ConnectionId>, message: ChatMessage) {
        let now = self.clock.now();
        if let Err(rejection) = self.chat.validate_chat(&message.user, &message.text, now) {
            tracing::debug!(user = %message.user, %rejection, "chat rejected");
            match from {
                Some(connection) => {
                    self.warn_user(connection, &message.user, ControlKind::General, rejection.to_string());
                }
                None => self.notify(ControlLevel::Warning, rejection.to_string()),
            }
            return;
        }

        if message.recipients.is_empty() {
            if from.is_some() {
                self.events.push(SessionEvent::Chat {
                    from: message.user.clone(),
                    text: message.text.clone(),
                });
            }
            let recipient = from.map_or(Recipient::All, Recipient::AllExcept);
            self.send(recipient, Message::Chat(message));
            return;
        }

        for name in &message.recipients {
            if *name == self.local_user {
                if from.is_some() {
                    self.events.push(SessionEvent::Chat {
                        from: message.user.clone(),
                        text: message.text.clone(),
                    });
                }
                continue;
            }
            match self.registry.find_player(name).and_then(|player| player.connection) {
                Some(connection) => self.send(Recipient::Connection(connection), Message::Chat(message.clone())),
                None => tracing::debug!(recipient = %name, "chat recipient not online"),
            }
        }
    }

    fn handle_time_check(&mut self, message: TimeCheck) {
        if self.is_dispatcher() {
            return;
        }
        let adjustment = self.clock.apply_time_check(message.clock);
        tracing::trace!(?adjustment, "clock checked");
    }
}
