//! Dispatcher-side arbitration of train authority.
//!
//! Authority is the right to simulate a train and report its ground truth.
//! A client asks with [`ControlRequest::Request`]; the dispatcher decides with
//! [`AuthorityArbiter::decide`] and, on a grant, broadcasts a
//! [`ControlRequest::Confirm`]. Only the confirm changes anyone's state.

use crate::messages::{ControlRequest, TrainControl};
use crate::registry::OnlineTrains;
use crate::sim::{Simulation, TrainNumber};

/// Why a request was turned down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenyReason {
    /// The train does not exist on the dispatcher.
    UnknownTrain,
    /// Somebody else drives it.
    HeldBy(String),
}

/// Outcome of an authority request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthorityDecision {
    Grant,
    Deny(DenyReason),
}

/// Read-only view of the state needed to arbitrate.
pub struct AuthorityArbiter<'a> {
    registry: &'a OnlineTrains,
    sim: &'a Simulation,
    dispatcher_user: &'a str,
    dispatcher_train: Option<TrainNumber>,
}

impl<'a> AuthorityArbiter<'a> {
    /// `dispatcher_user` drives `dispatcher_train` locally and is not listed
    /// in the registry.
    pub fn new(
        registry: &'a OnlineTrains,
        sim: &'a Simulation,
        dispatcher_user: &'a str,
        dispatcher_train: Option<TrainNumber>,
    ) -> Self {
        Self {
            registry,
            sim,
            dispatcher_user,
            dispatcher_train,
        }
    }

    /// Grant when no other valid player drives `train`.
    pub fn decide(&self, requester: &str, train: TrainNumber) -> AuthorityDecision {
        if !self.sim.contains_train(train) {
            return AuthorityDecision::Deny(DenyReason::UnknownTrain);
        }
        if self.dispatcher_train == Some(train) && requester != self.dispatcher_user {
            return AuthorityDecision::Deny(DenyReason::HeldBy(self.dispatcher_user.to_string()));
        }
        match self
            .registry
            .drivers_of(train)
            .into_iter()
            .find(|driver| *driver != requester)
        {
            Some(holder) => AuthorityDecision::Deny(DenyReason::HeldBy(holder.to_string())),
            None => AuthorityDecision::Grant,
        }
    }
}

/// The confirm broadcast for a granted request.
pub fn confirm(request: &TrainControl) -> TrainControl {
    TrainControl {
        request: ControlRequest::Confirm,
        ..request.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OnlinePlayer;
    use crate::sim::{CarKind, Train, TrainCar};

    fn world() -> Simulation {
        let mut sim = Simulation::new();
        for number in [1, 2, 3] {
            let mut train = Train::new(number, "t");
            train.cars.push(TrainCar::new(format!("c{number}"), "w.ron", CarKind::Wagon, 10.0));
            sim.add_train(train);
        }
        sim
    }

    #[test]
    fn test_free_train_is_granted() {
        let sim = world();
        let registry = OnlineTrains::new();
        let arbiter = AuthorityArbiter::new(&registry, &sim, "disp", Some(1));
        assert_eq!(arbiter.decide("anna", 2), AuthorityDecision::Grant);
    }

    #[test]
    fn test_held_train_is_denied() {
        let sim = world();
        let mut registry = OnlineTrains::new();
        registry.add_player(OnlinePlayer::new("bob", Some(2), 0.0));
        let arbiter = AuthorityArbiter::new(&registry, &sim, "disp", Some(1));

        assert_eq!(
            arbiter.decide("anna", 2),
            AuthorityDecision::Deny(DenyReason::HeldBy("bob".into()))
        );
        // Re-asking for one's own train is fine.
        assert_eq!(arbiter.decide("bob", 2), AuthorityDecision::Grant);
    }

    #[test]
    fn test_dispatcher_train_is_denied() {
        let sim = world();
        let registry = OnlineTrains::new();
        let arbiter = AuthorityArbiter::new(&registry, &sim, "disp", Some(1));
        assert_eq!(
            arbiter.decide("anna", 1),
            AuthorityDecision::Deny(DenyReason::HeldBy("disp".into()))
        );
    }

    #[test]
    fn test_unknown_train_is_denied() {
        let sim = world();
        let registry = OnlineTrains::new();
        let arbiter = AuthorityArbiter::new(&registry, &sim, "disp", None);
        assert_eq!(
            arbiter.decide("anna", 99),
            AuthorityDecision::Deny(DenyReason::UnknownTrain)
        );
    }

    #[test]
    fn test_confirm_copies_request() {
        let request = TrainControl {
            user: "anna".into(),
            request: ControlRequest::Request,
            number: 2,
            lead_car: Some("c2".into()),
        };
        let confirmed = confirm(&request);
        assert_eq!(confirmed.request, ControlRequest::Confirm);
        assert_eq!(confirmed.user, "anna");
        assert_eq!(confirmed.lead_car, request.lead_car);
    }
}
