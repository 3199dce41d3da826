//! In-memory simulation surface that the multiplayer layer keeps consistent.
//!
//! Physics and track topology live elsewhere; this module holds the state the
//! protocol reads and writes: trains and their cars, junction routes, signal
//! holds and turntable targets. Trains are kept in an indexed arena keyed by
//! [`TrainNumber`]; cars carry the number of the train they belong to rather
//! than a pointer, so detaching a car is a matter of clearing that field.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

/// Identifier of a train within the session.
pub type TrainNumber = u32;

/// Edge length of one world tile in metres.
pub const TILE_SIZE: f64 = 2048.0;

// ---------------------------------------------------------------------------
// WorldLocation
// ---------------------------------------------------------------------------

/// A position expressed as a tile plus an offset within it.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct WorldLocation {
    /// Tile column.
    pub tile_x: i32,
    /// Tile row.
    pub tile_z: i32,
    /// East offset within the tile, metres.
    pub x: f32,
    /// Elevation, metres.
    pub y: f32,
    /// North offset within the tile, metres.
    pub z: f32,
}

impl WorldLocation {
    /// Construct a location.
    pub fn new(tile_x: i32, tile_z: i32, x: f32, y: f32, z: f32) -> Self {
        Self {
            tile_x,
            tile_z,
            x,
            y,
            z,
        }
    }

    /// Squared distance in square metres, across tile boundaries.
    pub fn distance_squared(&self, other: &WorldLocation) -> f64 {
        let dx = f64::from(self.tile_x - other.tile_x) * TILE_SIZE
            + f64::from(self.x)
            - f64::from(other.x);
        let dy = f64::from(self.y) - f64::from(other.y);
        let dz = f64::from(self.tile_z - other.tile_z) * TILE_SIZE
            + f64::from(self.z)
            - f64::from(other.z);
        dx * dx + dy * dy + dz * dz
    }
}

// ---------------------------------------------------------------------------
// Cars
// ---------------------------------------------------------------------------

/// Direction of travel relative to the lead locomotive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Direction {
    /// Moving towards the front.
    #[default]
    Forward,
    /// Moving towards the rear.
    Reverse,
    /// No traction direction selected.
    Neutral,
}

impl Direction {
    /// Wire code used by the text grammar.
    pub fn code(self) -> u8 {
        match self {
            Direction::Forward => 0,
            Direction::Reverse => 1,
            Direction::Neutral => 2,
        }
    }

    /// Inverse of [`Direction::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(Direction::Forward),
            1 => Some(Direction::Reverse),
            2 => Some(Direction::Neutral),
            _ => None,
        }
    }

    /// The opposite direction; neutral stays neutral.
    pub fn reversed(self) -> Self {
        match self {
            Direction::Forward => Direction::Reverse,
            Direction::Reverse => Direction::Forward,
            Direction::Neutral => Direction::Neutral,
        }
    }
}

/// Traction type of a locomotive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EngineKind {
    /// Diesel, the only kind that reports exhaust.
    Diesel,
    /// Electric.
    Electric,
    /// Steam.
    Steam,
}

/// What a car is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CarKind {
    /// Unpowered car without a load.
    Wagon,
    /// Unpowered car with a visible freight load.
    Freight,
    /// Powered car.
    Engine(EngineKind),
}

impl CarKind {
    /// Whether the car can lead a train.
    pub fn is_engine(self) -> bool {
        matches!(self, CarKind::Engine(_))
    }
}

/// Cab controls of one locomotive.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct LocoControls {
    /// Throttle notch, 0.0 to 1.0.
    pub throttle: f32,
    /// Train brake application, 0.0 to 1.0.
    pub train_brake: f32,
    /// Dynamic brake application, 0.0 to 1.0.
    pub dynamic_brake: f32,
    /// Reverser.
    pub reverser: Direction,
}

/// Exhaust plume of a diesel locomotive.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct Exhaust {
    /// Particle emission rate.
    pub particles: f32,
    /// Plume magnitude.
    pub magnitude: f32,
    /// Plume colour, RGB 0.0 to 1.0.
    pub color: [f32; 3],
}

/// One rail vehicle.
#[derive(Debug, Clone, PartialEq)]
pub struct TrainCar {
    /// Identifier unique within the session, e.g. `"alice - 0"`.
    pub car_id: String,
    /// Rolling-stock path the car was built from.
    pub wagon_path: String,
    /// Vehicle type.
    pub kind: CarKind,
    /// Length in metres.
    pub length: f32,
    /// Whether the car faces backwards within its train.
    pub flipped: bool,
    /// Train this car currently belongs to; `None` once detached.
    pub train: Option<TrainNumber>,
    /// Distance from the train's rear to this car's rear, metres.
    pub offset: f32,
    /// Whether a freight load is shown.
    pub freight_visible: bool,
    /// Cab controls; only meaningful for engines.
    pub controls: LocoControls,
    /// Exhaust plume; only meaningful for diesel engines.
    pub exhaust: Exhaust,
}

impl TrainCar {
    /// Build an unattached car.
    pub fn new(car_id: impl Into<String>, wagon_path: impl Into<String>, kind: CarKind, length: f32) -> Self {
        Self {
            car_id: car_id.into(),
            wagon_path: wagon_path.into(),
            kind,
            length,
            flipped: false,
            train: None,
            offset: 0.0,
            freight_visible: false,
            controls: LocoControls::default(),
            exhaust: Exhaust::default(),
        }
    }

    /// Whether this is a diesel locomotive.
    pub fn is_diesel(&self) -> bool {
        self.kind == CarKind::Engine(EngineKind::Diesel)
    }
}

// ---------------------------------------------------------------------------
// Train
// ---------------------------------------------------------------------------

/// Who simulates a train on this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ControlMode {
    /// Driven by the local player.
    LocalPlayer,
    /// Driven by a remote participant; positions come from the network.
    RemotePlayer,
    /// Computer controlled by the dispatcher.
    Ai,
    /// Standing, not driven by anyone.
    #[default]
    Static,
}

/// A consist on the track.
#[derive(Debug, Clone, PartialEq)]
pub struct Train {
    /// Session-wide train number.
    pub number: TrainNumber,
    /// Display name.
    pub name: String,
    /// Cars from front to rear.
    pub cars: Vec<TrainCar>,
    /// Location of the rear end.
    pub rear_location: WorldLocation,
    /// Distance travelled since creation, metres.
    pub travelled: f32,
    /// Current speed, metres per second.
    pub speed_mps: f32,
    /// Speed included in the last position broadcast.
    pub last_reported_speed: f32,
    /// Multi-unit direction.
    pub mu_direction: Direction,
    /// Index of the lead locomotive in `cars`.
    pub lead_locomotive: Option<usize>,
    /// Who simulates this train.
    pub control_mode: ControlMode,
    /// Set by [`Simulation::initialize_brakes`].
    pub brakes_initialized: bool,
    /// Set once initial placement succeeded.
    pub placed: bool,
}

impl Train {
    /// An empty, unplaced train.
    pub fn new(number: TrainNumber, name: impl Into<String>) -> Self {
        Self {
            number,
            name: name.into(),
            cars: Vec::new(),
            rear_location: WorldLocation::default(),
            travelled: 0.0,
            speed_mps: 0.0,
            last_reported_speed: 0.0,
            mu_direction: Direction::Forward,
            lead_locomotive: None,
            control_mode: ControlMode::Static,
            brakes_initialized: false,
            placed: false,
        }
    }

    /// Total length in metres.
    pub fn length(&self) -> f32 {
        self.cars.iter().map(|car| car.length).sum()
    }

    /// Position of a car by id.
    pub fn find_car(&self, car_id: &str) -> Option<usize> {
        self.cars.iter().position(|car| car.car_id == car_id)
    }

    /// Whether the train holds a car with this id.
    pub fn contains_car(&self, car_id: &str) -> bool {
        self.find_car(car_id).is_some()
    }

    /// Id of the lead locomotive, if any.
    pub fn lead_car_id(&self) -> Option<&str> {
        self.lead_locomotive
            .and_then(|index| self.cars.get(index))
            .map(|car| car.car_id.as_str())
    }

    /// The lead locomotive, if any.
    pub fn lead_car(&self) -> Option<&TrainCar> {
        self.lead_locomotive.and_then(|index| self.cars.get(index))
    }

    /// Pick the lead locomotive: `preferred` when it is an engine in this
    /// train, otherwise the first engine from the front.
    pub fn recompute_lead(&mut self, preferred: Option<&str>) {
        let preferred = preferred
            .and_then(|id| self.find_car(id))
            .filter(|&index| self.cars[index].kind.is_engine());
        self.lead_locomotive =
            preferred.or_else(|| self.cars.iter().position(|car| car.kind.is_engine()));
    }

    /// Whether any car is moving.
    pub fn is_moving(&self) -> bool {
        self.speed_mps != 0.0
    }
}

// ---------------------------------------------------------------------------
// Track furniture
// ---------------------------------------------------------------------------

/// A set of points with a selected route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Junction {
    /// Junction id.
    pub id: u32,
    /// Number of selectable routes.
    pub route_count: u8,
    /// Currently selected route.
    pub selected_route: u8,
}

/// Aspect shown by one signal head.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignalAspect {
    /// Stop.
    Stop,
    /// Stop, then proceed at caution.
    StopAndProceed,
    /// Proceed at restricted speed.
    Restricting,
    /// Prepare to stop at the next signal.
    Approach,
    /// Proceed.
    Clear,
}

/// Manual hold placed on a signal by the dispatcher or an aider.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum SignalHold {
    /// Signal runs on its own logic.
    #[default]
    None,
    /// Held at stop.
    Stop,
    /// Held at approach.
    Approach,
    /// Held clear.
    Pass,
}

impl SignalHold {
    /// Wire code used by the text grammar.
    pub fn code(self) -> u8 {
        match self {
            SignalHold::None => 0,
            SignalHold::Stop => 1,
            SignalHold::Approach => 2,
            SignalHold::Pass => 3,
        }
    }

    /// Inverse of [`SignalHold::code`].
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SignalHold::None),
            1 => Some(SignalHold::Stop),
            2 => Some(SignalHold::Approach),
            3 => Some(SignalHold::Pass),
            _ => None,
        }
    }
}

/// A signal with one or more heads.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signal {
    /// Signal id.
    pub id: u32,
    /// Aspects the heads show without a hold.
    pub heads: Vec<SignalAspect>,
    /// Current manual hold.
    pub hold: SignalHold,
}

impl Signal {
    /// Aspects currently displayed, with the hold applied.
    pub fn displayed_aspects(&self) -> Vec<SignalAspect> {
        let forced = match self.hold {
            SignalHold::None => None,
            SignalHold::Stop => Some(SignalAspect::Stop),
            SignalHold::Approach => Some(SignalAspect::Approach),
            SignalHold::Pass => Some(SignalAspect::Clear),
        };
        match forced {
            Some(aspect) => vec![aspect; self.heads.len()],
            None => self.heads.clone(),
        }
    }
}

/// A turntable or transfer table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Turntable {
    /// Table id.
    pub id: u32,
    /// Number of track positions it can align to.
    pub position_count: u32,
    /// Position currently aligned.
    pub current: u32,
    /// Position the table is turning towards.
    pub target: Option<u32>,
    /// Turning direction of the current move.
    pub clockwise: bool,
}

// ---------------------------------------------------------------------------
// SimError
// ---------------------------------------------------------------------------

/// Failures of simulation operations.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum SimError {
    /// No train with this number.
    #[error("unknown train {0}")]
    UnknownTrain(TrainNumber),

    /// Placement found no track to put the train on.
    #[error("train {0} has no route to be placed on")]
    EmptyRoute(TrainNumber),

    /// No junction with this id, or the route does not exist.
    #[error("unknown junction {id} or route {route}")]
    UnknownJunction {
        /// Junction id.
        id: u32,
        /// Requested route.
        route: u8,
    },

    /// An uncouple point that would leave one side empty.
    #[error("cannot split train {number} at car {index}")]
    InvalidSplit {
        /// Train number.
        number: TrainNumber,
        /// Requested split position.
        index: usize,
    },

    /// A new train would take the number of an unrelated one.
    #[error("train number {0} is already in use")]
    NumberInUse(TrainNumber),

    /// No signal with this id.
    #[error("unknown signal {0}")]
    UnknownSignal(u32),

    /// No turntable with this id, or the position does not exist.
    #[error("unknown turntable {id} or position {position}")]
    UnknownTurntable {
        /// Turntable id.
        id: u32,
        /// Requested position.
        position: u32,
    },
}

// ---------------------------------------------------------------------------
// Simulation
// ---------------------------------------------------------------------------

/// The shared world: trains plus track furniture.
#[derive(Debug, Default)]
pub struct Simulation {
    trains: BTreeMap<TrainNumber, Train>,
    junctions: BTreeMap<u32, Junction>,
    signals: BTreeMap<u32, Signal>,
    turntables: BTreeMap<u32, Turntable>,
    /// Tiles holding track. Empty means placement is unrestricted.
    route_tiles: BTreeSet<(i32, i32)>,
}

impl Simulation {
    /// An empty world.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a tile as holding track.
    pub fn add_route_tile(&mut self, tile_x: i32, tile_z: i32) {
        self.route_tiles.insert((tile_x, tile_z));
    }

    /// Register a junction with route 0 selected.
    pub fn add_junction(&mut self, id: u32, route_count: u8) {
        self.junctions.insert(
            id,
            Junction {
                id,
                route_count,
                selected_route: 0,
            },
        );
    }

    /// Register a signal.
    pub fn add_signal(&mut self, id: u32, heads: Vec<SignalAspect>) {
        self.signals.insert(
            id,
            Signal {
                id,
                heads,
                hold: SignalHold::None,
            },
        );
    }

    /// Register a turntable aligned to position 0.
    pub fn add_turntable(&mut self, id: u32, position_count: u32) {
        self.turntables.insert(
            id,
            Turntable {
                id,
                position_count,
                current: 0,
                target: None,
                clockwise: true,
            },
        );
    }

    // -- trains -------------------------------------------------------------

    /// Insert a train, pointing every car back at it. Replaces a train with the
    /// same number.
    pub fn add_train(&mut self, mut train: Train) {
        let number = train.number;
        for car in &mut train.cars {
            car.train = Some(number);
        }
        self.trains.insert(number, train);
    }

    /// Remove a train, detaching all of its cars.
    pub fn remove_train(&mut self, number: TrainNumber) -> Option<Train> {
        let mut train = self.trains.remove(&number)?;
        for car in &mut train.cars {
            car.train = None;
        }
        Some(train)
    }

    /// Give an existing train a new number.
    pub fn renumber_train(&mut self, from: TrainNumber, to: TrainNumber) -> Result<(), SimError> {
        if from == to {
            return Ok(());
        }
        let mut train = self.trains.remove(&from).ok_or(SimError::UnknownTrain(from))?;
        train.number = to;
        self.add_train(train);
        Ok(())
    }

    /// Restore the back-references of every car and show freight loads again.
    pub fn reattach_train(&mut self, number: TrainNumber) -> Result<(), SimError> {
        let train = self
            .trains
            .get_mut(&number)
            .ok_or(SimError::UnknownTrain(number))?;
        for car in &mut train.cars {
            car.train = Some(number);
        }
        self.check_freight(number)
    }

    /// Whether a train with this number exists.
    pub fn contains_train(&self, number: TrainNumber) -> bool {
        self.trains.contains_key(&number)
    }

    /// Look up a train.
    pub fn train(&self, number: TrainNumber) -> Option<&Train> {
        self.trains.get(&number)
    }

    /// Look up a train mutably.
    pub fn train_mut(&mut self, number: TrainNumber) -> Option<&mut Train> {
        self.trains.get_mut(&number)
    }

    /// All trains in number order.
    pub fn trains(&self) -> impl Iterator<Item = &Train> {
        self.trains.values()
    }

    /// All trains in number order, mutably.
    pub fn trains_mut(&mut self) -> impl Iterator<Item = &mut Train> {
        self.trains.values_mut()
    }

    /// Number of trains.
    pub fn train_count(&self) -> usize {
        self.trains.len()
    }

    /// Lowest unused number above every existing train.
    pub fn allocate_train_number(&self) -> TrainNumber {
        self.trains.keys().next_back().map_or(1, |last| last + 1)
    }

    /// Validate and place a train that is not yet in the arena.
    ///
    /// Fails with [`SimError::EmptyRoute`] for a train without cars or whose
    /// rear lies on a tile without track.
    pub fn place(&self, train: &mut Train) -> Result<(), SimError> {
        if train.cars.is_empty() {
            return Err(SimError::EmptyRoute(train.number));
        }
        let tile = (train.rear_location.tile_x, train.rear_location.tile_z);
        if !self.route_tiles.is_empty() && !self.route_tiles.contains(&tile) {
            return Err(SimError::EmptyRoute(train.number));
        }
        position_cars(train);
        train.placed = true;
        Ok(())
    }

    /// Place a train that is already in the arena.
    pub fn calculate_initial_train_position(&mut self, number: TrainNumber) -> Result<(), SimError> {
        let mut train = self
            .trains
            .remove(&number)
            .ok_or(SimError::UnknownTrain(number))?;
        let placed = self.place(&mut train);
        self.trains.insert(number, train);
        placed
    }

    /// Recompute each car's offset from the rear after a move or a consist change.
    pub fn calculate_position_of_cars(&mut self, number: TrainNumber) -> Result<(), SimError> {
        let train = self
            .trains
            .get_mut(&number)
            .ok_or(SimError::UnknownTrain(number))?;
        position_cars(train);
        Ok(())
    }

    /// Release all brakes and mark the brake system charged.
    pub fn initialize_brakes(&mut self, number: TrainNumber) -> Result<(), SimError> {
        let train = self
            .trains
            .get_mut(&number)
            .ok_or(SimError::UnknownTrain(number))?;
        for car in &mut train.cars {
            car.controls.train_brake = 0.0;
            car.controls.dynamic_brake = 0.0;
        }
        train.brakes_initialized = true;
        Ok(())
    }

    /// Show freight loads on every attached freight car.
    pub fn check_freight(&mut self, number: TrainNumber) -> Result<(), SimError> {
        let train = self
            .trains
            .get_mut(&number)
            .ok_or(SimError::UnknownTrain(number))?;
        for car in &mut train.cars {
            car.freight_visible = car.kind == CarKind::Freight && car.train == Some(number);
        }
        Ok(())
    }

    // -- junctions ----------------------------------------------------------

    /// Throw a junction to `route`.
    pub fn request_set_switch(&mut self, id: u32, route: u8) -> Result<(), SimError> {
        let junction = self
            .junctions
            .get_mut(&id)
            .filter(|junction| route < junction.route_count)
            .ok_or(SimError::UnknownJunction { id, route })?;
        junction.selected_route = route;
        Ok(())
    }

    /// Look up a junction.
    pub fn junction(&self, id: u32) -> Option<&Junction> {
        self.junctions.get(&id)
    }

    /// `(id, selected route)` for every junction.
    pub fn switch_states(&self) -> Vec<(u32, u8)> {
        self.junctions
            .values()
            .map(|junction| (junction.id, junction.selected_route))
            .collect()
    }

    // -- signals ------------------------------------------------------------

    /// Place or clear a manual hold.
    pub fn set_signal_hold(&mut self, id: u32, hold: SignalHold) -> Result<(), SimError> {
        let signal = self.signals.get_mut(&id).ok_or(SimError::UnknownSignal(id))?;
        signal.hold = hold;
        Ok(())
    }

    /// Overwrite the natural aspects of a signal.
    pub fn set_signal_heads(&mut self, id: u32, heads: Vec<SignalAspect>) -> Result<(), SimError> {
        let signal = self.signals.get_mut(&id).ok_or(SimError::UnknownSignal(id))?;
        signal.heads = heads;
        Ok(())
    }

    /// Look up a signal.
    pub fn signal(&self, id: u32) -> Option<&Signal> {
        self.signals.get(&id)
    }

    /// All signals in id order.
    pub fn signals(&self) -> impl Iterator<Item = &Signal> {
        self.signals.values()
    }

    // -- turntables ---------------------------------------------------------

    /// Start turning a table towards `target`.
    pub fn set_turntable_target(&mut self, id: u32, target: u32, clockwise: bool) -> Result<(), SimError> {
        let table = self
            .turntables
            .get_mut(&id)
            .filter(|table| target < table.position_count)
            .ok_or(SimError::UnknownTurntable { id, position: target })?;
        table.target = Some(target);
        table.clockwise = clockwise;
        Ok(())
    }

    /// Look up a turntable.
    pub fn turntable(&self, id: u32) -> Option<&Turntable> {
        self.turntables.get(&id)
    }
}

/// Cars are ordered front to rear, so offsets accumulate from the last car.
fn position_cars(train: &mut Train) {
    let mut offset = 0.0;
    for car in train.cars.iter_mut().rev() {
        car.offset = offset;
        offset += car.length;
    }
}
