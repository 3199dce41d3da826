//! The small yard the headless node runs: a few tiles of track, three
//! junctions, a signal per junction and a turntable, plus the local player's
//! train.

use railsync_multiplayer::sim::{CarKind, EngineKind, SignalAspect, SimError};
use railsync_multiplayer::{CarCatalog, CarSpec, Simulation, Train, TrainNumber, WorldLocation, spawn_consist};

const YARD_TILES: [(i32, i32); 3] = [(0, 0), (0, 1), (1, 0)];
const JUNCTIONS: [u32; 3] = [1, 2, 3];
const SIGNALS: [u32; 3] = [11, 12, 13];
const TURNTABLE: u32 = 20;

const LOCO_PATH: &str = "engines/class66.ron";
const WAGON_PATH: &str = "wagons/box.ron";

/// Stock the yard's own trains are built from when no rolling-stock
/// directory is configured.
pub fn yard_catalog() -> CarCatalog {
    let mut catalog = CarCatalog::new();
    catalog.insert(
        LOCO_PATH,
        CarSpec {
            length: 21.0,
            kind: CarKind::Engine(EngineKind::Diesel),
        },
    );
    catalog.insert(
        WAGON_PATH,
        CarSpec {
            length: 14.0,
            kind: CarKind::Freight,
        },
    );
    catalog
}

pub fn build_yard() -> Simulation {
    let mut sim = Simulation::new();
    for (x, z) in YARD_TILES {
        sim.add_route_tile(x, z);
    }
    for id in JUNCTIONS {
        sim.add_junction(id, 2);
    }
    for id in SIGNALS {
        sim.add_signal(id, vec![SignalAspect::Stop]);
    }
    sim.add_turntable(TURNTABLE, 12);
    sim
}

/// A locomotive and two wagons for `user`, with car ids `"<user> - <n>"`.
pub fn local_consist(catalog: &CarCatalog, number: TrainNumber, user: &str) -> Train {
    let cars = [(LOCO_PATH, 21.0), (WAGON_PATH, 14.0), (WAGON_PATH, 14.0)]
        .into_iter()
        .enumerate()
        .map(|(i, (path, length))| catalog.build_car(&format!("{user} - {i}"), path, length, false))
        .collect();
    let mut train = spawn_consist(number, user, cars);
    train.rear_location = WorldLocation::new(0, 0, 100.0, 0.0, 100.0);
    train
}

/// Put the local train into the yard. Returns its number.
pub fn place_local_train(sim: &mut Simulation, catalog: &CarCatalog, user: &str) -> Result<TrainNumber, SimError> {
    let number = sim.allocate_train_number();
    sim.add_train(local_consist(catalog, number, user));
    sim.calculate_initial_train_position(number)?;
    sim.initialize_brakes(number)?;
    Ok(number)
}

/// Move `number` along its heading for `dt` seconds at its current speed.
pub fn advance_train(sim: &mut Simulation, number: TrainNumber, dt: f64) {
    let Some(train) = sim.train_mut(number) else {
        return;
    };
    if train.speed_mps == 0.0 {
        return;
    }
    train.rear_location.x += train.speed_mps * dt as f32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_local_train_is_placed_in_yard() {
        let mut sim = build_yard();
        let number = place_local_train(&mut sim, &yard_catalog(), "anna").unwrap();
        let train = sim.train(number).unwrap();
        assert!(train.placed);
        assert_eq!(train.cars.len(), 3);
        assert_eq!(train.lead_car_id(), Some("anna - 0"));
        assert_eq!(sim.switch_states().len(), JUNCTIONS.len());
    }

    #[test]
    fn test_empty_catalog_leaves_train_without_lead() {
        let train = local_consist(&CarCatalog::new(), 1, "anna");
        assert_eq!(train.cars.len(), 3);
        assert!(train.lead_car().is_none());
    }

    #[test]
    fn test_advance_moves_only_running_trains() {
        let mut sim = build_yard();
        let number = place_local_train(&mut sim, &yard_catalog(), "anna").unwrap();
        let start = sim.train(number).unwrap().rear_location;

        advance_train(&mut sim, number, 1.0);
        assert_eq!(sim.train(number).unwrap().rear_location, start);

        sim.train_mut(number).unwrap().speed_mps = 10.0;
        advance_train(&mut sim, number, 0.5);
        assert_eq!(sim.train(number).unwrap().rear_location.x, start.x + 5.0);
    }
}
