//! Consist changes: couple, uncouple and flip.
//!
//! The side that performs the change computes the final car lists and sends
//! them; every receiver rebuilds the trains from the message alone, so all
//! replicas end up with the same order, flip flags and lead locomotives.

use std::collections::HashMap;

use crate::catalog::CarCatalog;
use crate::messages::{ConsistRecord, CoupleMessage, FlipMessage, UncoupleMessage};
use crate::registry::{OnlineLocomotive, OnlineTrains};
use crate::sim::{SimError, Simulation, Train, TrainCar, TrainNumber};

// ---------------------------------------------------------------------------
// Outbound
// ---------------------------------------------------------------------------

/// Describe coupling `removed` behind `kept`.
pub fn couple_message(
    sim: &Simulation,
    user: &str,
    kept: TrainNumber,
    removed: TrainNumber,
) -> Result<CoupleMessage, SimError> {
    let front = sim.train(kept).ok_or(SimError::UnknownTrain(kept))?;
    let rear = sim.train(removed).ok_or(SimError::UnknownTrain(removed))?;

    let mut record = ConsistRecord::from_train(front);
    let rear_record = ConsistRecord::from_train(rear);
    record.cars.extend(rear_record.cars);
    record.lead_car = record.lead_car.or(rear_record.lead_car);
    record.rear = rear.rear_location;
    record.travelled = rear.travelled;

    Ok(CoupleMessage {
        user: user.to_string(),
        kept: record,
        removed,
    })
}

/// Describe splitting `number` in front of car `index`. The rear part
/// becomes `new_number`.
pub fn uncouple_message(
    sim: &Simulation,
    user: &str,
    number: TrainNumber,
    index: usize,
    new_number: TrainNumber,
) -> Result<UncoupleMessage, SimError> {
    let train = sim.train(number).ok_or(SimError::UnknownTrain(number))?;
    if index == 0 || index >= train.cars.len() {
        return Err(SimError::InvalidSplit { number, index });
    }

    let whole = ConsistRecord::from_train(train);
    let mut first = whole.clone();
    let mut second = whole;
    second.cars = first.cars.split_off(index);
    second.number = new_number;

    let lead = train.lead_car_id();
    first.lead_car = lead_within(&train.cars[..index], lead);
    second.lead_car = lead_within(&train.cars[index..], lead);

    Ok(UncoupleMessage {
        user: user.to_string(),
        first,
        second,
    })
}

/// Describe turning `number` end for end.
pub fn flip_message(sim: &Simulation, user: &str, number: TrainNumber) -> Result<FlipMessage, SimError> {
    let train = sim.train(number).ok_or(SimError::UnknownTrain(number))?;
    Ok(FlipMessage {
        user: user.to_string(),
        number,
        rear: train.rear_location,
        direction: train.mu_direction.reversed(),
    })
}

/// The current lead when it is inside `cars`, otherwise the first engine.
fn lead_within(cars: &[TrainCar], lead: Option<&str>) -> Option<String> {
    lead.filter(|id| cars.iter().any(|car| car.car_id == *id))
        .or_else(|| {
            cars.iter()
                .find(|car| car.kind.is_engine())
                .map(|car| car.car_id.as_str())
        })
        .map(str::to_string)
}

// ---------------------------------------------------------------------------
// Inbound
// ---------------------------------------------------------------------------

/// Rebuild the merged train and drop the absorbed one.
pub fn apply_couple(sim: &mut Simulation, catalog: &CarCatalog, message: &CoupleMessage) -> Result<(), SimError> {
    let kept = message.kept.number;
    let mut pool = car_pool(sim, &[kept, message.removed]);
    let base = sim
        .train(kept)
        .or_else(|| sim.train(message.removed))
        .cloned()
        .unwrap_or_else(|| Train::new(kept, format!("train {kept}")));

    let mut train = rebuild(base, &message.kept, &mut pool, catalog);
    sim.place(&mut train)?;

    if message.removed != kept {
        sim.remove_train(message.removed);
    }
    sim.add_train(train);
    tracing::debug!(kept, removed = message.removed, user = %message.user, "trains coupled");
    Ok(())
}

/// Rebuild both halves of a split train.
///
/// `second` must be a fresh number; an existing train under it is only
/// accepted when every one of its cars is part of the split. Trains that
/// hold nothing but cars of the split, such as a half this node detached
/// under another number, are absorbed and their numbers returned.
pub fn apply_uncouple(
    sim: &mut Simulation,
    catalog: &CarCatalog,
    message: &UncoupleMessage,
) -> Result<Vec<TrainNumber>, SimError> {
    let first_number = message.first.number;
    let second_number = message.second.number;
    if second_number == first_number {
        return Err(SimError::NumberInUse(second_number));
    }
    let base = sim
        .train(first_number)
        .cloned()
        .ok_or(SimError::UnknownTrain(first_number))?;

    let listed: Vec<&str> = message
        .first
        .cars
        .iter()
        .chain(&message.second.cars)
        .map(|car| car.car_id.as_str())
        .collect();
    let only_listed = |train: &Train| train.cars.iter().all(|car| listed.contains(&car.car_id.as_str()));
    if sim.train(second_number).is_some_and(|train| !only_listed(train)) {
        return Err(SimError::NumberInUse(second_number));
    }
    let absorbed: Vec<TrainNumber> = sim
        .trains()
        .filter(|&train| train.number != first_number && train.number != second_number)
        .filter(|&train| !train.cars.is_empty() && only_listed(train))
        .map(|train| train.number)
        .collect();

    let mut involved = vec![first_number, second_number];
    involved.extend(&absorbed);
    let mut pool = car_pool(sim, &involved);

    let mut first = rebuild(base.clone(), &message.first, &mut pool, catalog);
    let second_base = Train::new(second_number, format!("{} (detached)", base.name));
    let mut second = rebuild(second_base, &message.second, &mut pool, catalog);
    second.speed_mps = base.speed_mps;

    sim.place(&mut first)?;
    sim.place(&mut second)?;
    for &number in &absorbed {
        sim.remove_train(number);
    }
    sim.add_train(first);
    sim.add_train(second);
    tracing::debug!(first = first_number, second = second_number, ?absorbed, user = %message.user, "train uncoupled");
    Ok(absorbed)
}

/// Reverse car order and flip flags, keeping the same lead car.
pub fn apply_flip(sim: &mut Simulation, message: &FlipMessage) -> Result<(), SimError> {
    let train = sim
        .train_mut(message.number)
        .ok_or(SimError::UnknownTrain(message.number))?;
    let lead = train.lead_car_id().map(str::to_string);

    train.cars.reverse();
    for car in &mut train.cars {
        car.flipped = !car.flipped;
    }
    train.recompute_lead(lead.as_deref());
    train.rear_location = message.rear;
    train.mu_direction = message.direction;
    sim.calculate_position_of_cars(message.number)
}

/// After a consist change, move every driver whose cab ended up in another
/// of `trains`, and rewrite their online locomotive entries.
pub fn reassign_drivers(registry: &mut OnlineTrains, sim: &Simulation, trains: &[TrainNumber]) {
    let mut moved = Vec::new();
    for player in registry.players_mut() {
        let Some(current) = player.train else { continue };
        if !trains.contains(&current) {
            continue;
        }
        let Some(lead) = player.lead_car.as_deref() else { continue };
        let found = trains.iter().find_map(|&number| {
            sim.train(number)
                .and_then(|train| train.find_car(lead).map(|position| (number, position)))
        });
        if let Some((number, position)) = found {
            if number != current {
                tracing::info!(user = %player.username, from = current, to = number, "driver follows cab");
            }
            player.train = Some(number);
            moved.push(OnlineLocomotive {
                username: player.username.clone(),
                train: number,
                car_position: position,
            });
        }
    }
    for loco in moved {
        registry.remove_online_locos_of(&loco.username);
        registry.add_online_loco(loco);
    }
}

/// Copies of every car of `trains`, keyed by car id.
fn car_pool(sim: &Simulation, trains: &[TrainNumber]) -> HashMap<String, TrainCar> {
    trains
        .iter()
        .filter_map(|&number| sim.train(number))
        .flat_map(|train| train.cars.iter().cloned())
        .map(|car| (car.car_id.clone(), car))
        .collect()
}

/// A new train made from a received consist, with cars resolved through
/// `catalog`. The train is not placed.
pub fn build_train(catalog: &CarCatalog, record: &ConsistRecord, name: impl Into<String>) -> Train {
    rebuild(Train::new(record.number, name), record, &mut HashMap::new(), catalog)
}

fn rebuild(
    mut base: Train,
    record: &ConsistRecord,
    pool: &mut HashMap<String, TrainCar>,
    catalog: &CarCatalog,
) -> Train {
    base.number = record.number;
    base.cars = record
        .cars
        .iter()
        .map(|car| {
            let mut built = pool.remove(&car.car_id).unwrap_or_else(|| {
                catalog.build_car(&car.car_id, &car.wagon_path, car.length, car.flipped)
            });
            built.flipped = car.flipped;
            built
        })
        .collect();
    base.recompute_lead(record.lead_car.as_deref());
    base.rear_location = record.rear;
    base.travelled = record.travelled;
    base.mu_direction = record.direction;
    base
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::OnlinePlayer;
    use crate::sim::{CarKind, ControlMode, EngineKind};

    fn car(id: &str, engine: bool) -> TrainCar {
        let kind = if engine {
            CarKind::Engine(EngineKind::Electric)
        } else {
            CarKind::Wagon
        };
        TrainCar::new(id, format!("{id}.ron"), kind, 15.0)
    }

    /// A = [a1 (engine), a2], B = [b1 (engine), b2].
    fn two_trains() -> Simulation {
        let mut sim = Simulation::new();
        let mut a = Train::new(1, "A");
        a.cars = vec![car("a1", true), car("a2", false)];
        a.cars[1].flipped = true;
        a.recompute_lead(None);
        a.control_mode = ControlMode::LocalPlayer;
        let mut b = Train::new(2, "B");
        b.cars = vec![car("b1", true), car("b2", false)];
        b.recompute_lead(None);
        sim.add_train(a);
        sim.add_train(b);
        sim
    }

    fn ids(train: &Train) -> Vec<(String, bool)> {
        train
            .cars
            .iter()
            .map(|car| (car.car_id.clone(), car.flipped))
            .collect()
    }

    fn expect(cars: &[(&str, bool)]) -> Vec<(String, bool)> {
        cars.iter().map(|(id, flipped)| (id.to_string(), *flipped)).collect()
    }

    #[test]
    fn test_couple_then_uncouple_restores_both_trains() {
        let mut sim = two_trains();
        let before_a = ids(sim.train(1).unwrap());
        let before_b = ids(sim.train(2).unwrap());
        let catalog = CarCatalog::new();

        let couple = couple_message(&sim, "anna", 1, 2).unwrap();
        apply_couple(&mut sim, &catalog, &couple).unwrap();
        assert!(sim.train(2).is_none());
        assert_eq!(
            ids(sim.train(1).unwrap()),
            expect(&[("a1", false), ("a2", true), ("b1", false), ("b2", false)])
        );
        assert!(sim.train(1).unwrap().cars.iter().all(|car| car.train == Some(1)));

        let new_number = sim.allocate_train_number();
        let uncouple = uncouple_message(&sim, "anna", 1, 2, new_number).unwrap();
        apply_uncouple(&mut sim, &catalog, &uncouple).unwrap();

        let a = sim.train(1).unwrap();
        let b = sim.train(new_number).unwrap();
        assert_eq!(ids(a), before_a);
        assert_eq!(ids(b), before_b);
        assert_eq!(a.lead_car_id(), Some("a1"));
        assert_eq!(b.lead_car_id(), Some("b1"));
        assert!(b.cars.iter().all(|car| car.train == Some(new_number)));
    }

    #[test]
    fn test_receiver_replays_same_result() {
        let mut sender = two_trains();
        let mut receiver = two_trains();
        let catalog = CarCatalog::new();

        let couple = couple_message(&sender, "anna", 2, 1).unwrap();
        apply_couple(&mut sender, &catalog, &couple).unwrap();
        apply_couple(&mut receiver, &catalog, &couple).unwrap();
        assert_eq!(ids(sender.train(2).unwrap()), ids(receiver.train(2).unwrap()));
        assert_eq!(
            sender.train(2).unwrap().lead_car_id(),
            receiver.train(2).unwrap().lead_car_id()
        );
    }

    #[test]
    fn test_uncouple_rejects_edge_split() {
        let sim = two_trains();
        assert_eq!(
            uncouple_message(&sim, "anna", 1, 0, 9).unwrap_err(),
            SimError::InvalidSplit { number: 1, index: 0 }
        );
        assert!(uncouple_message(&sim, "anna", 1, 2, 9).is_err());
    }

    #[test]
    fn test_unknown_cars_come_from_catalog() {
        let mut sim = two_trains();
        let mut message = couple_message(&sim, "anna", 1, 2).unwrap();
        message.kept.cars.push(crate::messages::CarRecord {
            car_id: "x9".into(),
            wagon_path: "missing.ron".into(),
            length: 9.0,
            flipped: true,
        });
        apply_couple(&mut sim, &CarCatalog::new(), &message).unwrap();
        let train = sim.train(1).unwrap();
        assert_eq!(train.cars.len(), 5);
        assert!(train.cars[4].flipped);
        assert_eq!(train.cars[4].length, 9.0);
    }

    #[test]
    fn test_flip_reverses_and_keeps_lead() {
        let mut sim = two_trains();
        let flip = flip_message(&sim, "anna", 1).unwrap();
        apply_flip(&mut sim, &flip).unwrap();
        let train = sim.train(1).unwrap();
        assert_eq!(ids(train), expect(&[("a2", false), ("a1", true)]));
        assert_eq!(train.lead_car_id(), Some("a1"));
        assert_eq!(train.mu_direction, crate::sim::Direction::Reverse);
    }

    #[test]
    fn test_uncouple_never_replaces_another_train() {
        let mut sim = two_trains();
        let before = ids(sim.train(2).unwrap());
        let uncouple = uncouple_message(&sim, "anna", 1, 1, 2).unwrap();

        assert_eq!(
            apply_uncouple(&mut sim, &CarCatalog::new(), &uncouple).unwrap_err(),
            SimError::NumberInUse(2)
        );
        assert_eq!(ids(sim.train(2).unwrap()), before);
        assert_eq!(sim.train(1).unwrap().cars.len(), 2);
    }

    #[test]
    fn test_renumbered_split_absorbs_local_half() {
        let mut sim = two_trains();
        let catalog = CarCatalog::new();
        // split locally as train 7, then the dispatcher's copy names it 9
        let local = uncouple_message(&sim, "anna", 1, 1, 7).unwrap();
        apply_uncouple(&mut sim, &catalog, &local).unwrap();
        let mut corrected = local.clone();
        corrected.second.number = 9;

        let absorbed = apply_uncouple(&mut sim, &catalog, &corrected).unwrap();
        assert_eq!(absorbed, vec![7]);
        assert!(sim.train(7).is_none());
        assert_eq!(ids(sim.train(9).unwrap()), expect(&[("a2", true)]));
        assert_eq!(ids(sim.train(1).unwrap()), expect(&[("a1", false)]));
        assert_eq!(ids(sim.train(2).unwrap()), expect(&[("b1", false), ("b2", false)]));
    }

    #[test]
    fn test_driver_follows_cab_into_detached_half() {
        let mut sim = two_trains();
        let catalog = CarCatalog::new();
        let mut registry = OnlineTrains::new();
        let mut bob = OnlinePlayer::new("bob", Some(1), 0.0);
        bob.lead_car = Some("b1".into());
        registry.add_player(bob);

        let couple = couple_message(&sim, "anna", 1, 2).unwrap();
        apply_couple(&mut sim, &catalog, &couple).unwrap();
        let uncouple = uncouple_message(&sim, "anna", 1, 2, 7).unwrap();
        apply_uncouple(&mut sim, &catalog, &uncouple).unwrap();
        reassign_drivers(&mut registry, &sim, &[1, 7]);

        assert_eq!(registry.find_player("bob").unwrap().train, Some(7));
        assert!(registry.is_online_loco(7, 0));
    }
}
