//! The closed set of messages exchanged between dispatcher and clients.
//!
//! Each [`Message`] variant travels as one frame whose type token is the
//! [`MessageKind`] tag. Legacy kinds keep the positional text grammar of
//! [`crate::text`]; newer kinds carry a postcard-encoded body.

use serde::{Deserialize, Serialize};

use railsync_net::{Frame, WireMessage};

use crate::sim::{
    ControlMode, Direction, Exhaust, LocoControls, SignalAspect, SignalHold, Train, TrainNumber,
    WorldLocation,
};
use crate::text::{TextReader, TextWriter};

/// Upper bound on pre-allocation for counts read from the wire.
const MAX_PREALLOCATE: usize = 256;

// ---------------------------------------------------------------------------
// MessageError
// ---------------------------------------------------------------------------

/// Errors raised while encoding or decoding a message body.
#[derive(Debug, thiserror::Error)]
pub enum MessageError {
    /// The frame's type token names no known message.
    #[error("unknown message type {0:?}")]
    UnknownMessageType(String),

    /// A positional field is absent.
    #[error("missing field {0}")]
    MissingField(&'static str),

    /// A positional field does not parse.
    #[error("invalid value {value:?} for field {field}")]
    InvalidField {
        /// Field name.
        field: &'static str,
        /// Offending text.
        value: String,
    },

    /// A text payload is not UTF-8.
    #[error("payload is not UTF-8: {0}")]
    Utf8(std::str::Utf8Error),

    /// A structured payload failed to encode or decode.
    #[error("postcard: {0}")]
    Postcard(#[from] postcard::Error),
}

// ---------------------------------------------------------------------------
// MessageKind
// ---------------------------------------------------------------------------

/// Tag of every message kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Move,
    Couple,
    Uncouple,
    Flip,
    SwitchChange,
    SwitchState,
    SignalChange,
    SignalState,
    SignalReset,
    PlayerState,
    PlayerTrainChange,
    LocomotiveChange,
    LocomotiveState,
    Exhaust,
    Control,
    TrainControl,
    TrainRequest,
    TrainUpdate,
    RemoveTrain,
    Quit,
    Chat,
    TimeCheck,
    MovingTable,
}

impl MessageKind {
    /// ASCII type token on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            MessageKind::Move => "MOVE",
            MessageKind::Couple => "COUPLE",
            MessageKind::Uncouple => "UNCOUPLE",
            MessageKind::Flip => "FLIP",
            MessageKind::SwitchChange => "SWITCH",
            MessageKind::SwitchState => "SWITCHSTATE",
            MessageKind::SignalChange => "SIGNALCHANGE",
            MessageKind::SignalState => "SIGNALSTATE",
            MessageKind::SignalReset => "SIGNALRESET",
            MessageKind::PlayerState => "PLAYER",
            MessageKind::PlayerTrainChange => "PLAYERTRAINCHANGE",
            MessageKind::LocomotiveChange => "LOCOCHANGE",
            MessageKind::LocomotiveState => "LOCOSTATE",
            MessageKind::Exhaust => "EXHAUST",
            MessageKind::Control => "CONTROL",
            MessageKind::TrainControl => "TRAINCONTROL",
            MessageKind::TrainRequest => "TRAINREQUEST",
            MessageKind::TrainUpdate => "TRAINUPDATE",
            MessageKind::RemoveTrain => "REMOVETRAIN",
            MessageKind::Quit => "QUIT",
            MessageKind::Chat => "CHAT",
            MessageKind::TimeCheck => "TIMECHECK",
            MessageKind::MovingTable => "MOVINGTABLE",
        }
    }

    /// Look up a type token.
    pub fn from_tag(tag: &str) -> Result<Self, MessageError> {
        let kind = match tag {
            "MOVE" => MessageKind::Move,
            "COUPLE" => MessageKind::Couple,
            "UNCOUPLE" => MessageKind::Uncouple,
            "FLIP" => MessageKind::Flip,
            "SWITCH" => MessageKind::SwitchChange,
            "SWITCHSTATE" => MessageKind::SwitchState,
            "SIGNALCHANGE" => MessageKind::SignalChange,
            "SIGNALSTATE" => MessageKind::SignalState,
            "SIGNALRESET" => MessageKind::SignalReset,
            "PLAYER" => MessageKind::PlayerState,
            "PLAYERTRAINCHANGE" => MessageKind::PlayerTrainChange,
            "LOCOCHANGE" => MessageKind::LocomotiveChange,
            "LOCOSTATE" => MessageKind::LocomotiveState,
            "EXHAUST" => MessageKind::Exhaust,
            "CONTROL" => MessageKind::Control,
            "TRAINCONTROL" => MessageKind::TrainControl,
            "TRAINREQUEST" => MessageKind::TrainRequest,
            "TRAINUPDATE" => MessageKind::TrainUpdate,
            "REMOVETRAIN" => MessageKind::RemoveTrain,
            "QUIT" => MessageKind::Quit,
            "CHAT" => MessageKind::Chat,
            "TIMECHECK" => MessageKind::TimeCheck,
            "MOVINGTABLE" => MessageKind::MovingTable,
            other => return Err(MessageError::UnknownMessageType(other.to_string())),
        };
        Ok(kind)
    }
}

// ---------------------------------------------------------------------------
// Shared records
// ---------------------------------------------------------------------------

/// One car of a consist as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarRecord {
    /// Session-unique car id.
    pub car_id: String,
    /// Rolling-stock path on the sender.
    pub wagon_path: String,
    /// Length in metres, used for substitution.
    pub length: f32,
    /// Whether the car faces backwards.
    pub flipped: bool,
}

/// A full consist: enough to rebuild and place a train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsistRecord {
    /// Train number.
    pub number: TrainNumber,
    /// Cars front to rear.
    pub cars: Vec<CarRecord>,
    /// Id of the lead locomotive.
    pub lead_car: Option<String>,
    /// Rear end location.
    pub rear: WorldLocation,
    /// Distance travelled.
    pub travelled: f32,
    /// Multi-unit direction.
    pub direction: Direction,
}

impl ConsistRecord {
    /// Snapshot a live train.
    pub fn from_train(train: &Train) -> Self {
        Self {
            number: train.number,
            cars: train
                .cars
                .iter()
                .map(|car| CarRecord {
                    car_id: car.car_id.clone(),
                    wagon_path: car.wagon_path.clone(),
                    length: car.length,
                    flipped: car.flipped,
                })
                .collect(),
            lead_car: train.lead_car_id().map(str::to_string),
            rear: train.rear_location,
            travelled: train.travelled,
            direction: train.mu_direction,
        }
    }
}

// ---------------------------------------------------------------------------
// Message bodies
// ---------------------------------------------------------------------------

/// Position report for one train.
#[derive(Debug, Clone, PartialEq)]
pub struct MoveEntry {
    /// Driver of the train, empty for unmanned trains.
    pub user: String,
    pub number: TrainNumber,
    pub rear: WorldLocation,
    pub travelled: f32,
    pub speed: f32,
    pub direction: Direction,
    /// Length of the consist, used to spot stale compositions.
    pub car_count: u32,
}

/// Position reports, batched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct MoveMessage {
    pub entries: Vec<MoveEntry>,
}

/// Two trains became one: `kept` holds the merged consist, `removed` is gone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CoupleMessage {
    pub user: String,
    pub kept: ConsistRecord,
    pub removed: TrainNumber,
}

/// One train became two. `first` keeps its number.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UncoupleMessage {
    pub user: String,
    pub first: ConsistRecord,
    pub second: ConsistRecord,
}

/// A train was turned end for end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlipMessage {
    pub user: String,
    pub number: TrainNumber,
    /// Rear location after the flip.
    pub rear: WorldLocation,
    pub direction: Direction,
}

/// A junction should be thrown.
#[derive(Debug, Clone, PartialEq)]
pub struct SwitchChange {
    pub user: String,
    pub junction: u32,
    pub route: u8,
}

/// Full junction snapshot from the dispatcher.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SwitchState {
    /// `(junction id, selected route)`.
    pub switches: Vec<(u32, u8)>,
}

/// A manual signal hold should change.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalChange {
    pub user: String,
    pub signal: u32,
    pub hold: SignalHold,
}

/// One signal within a [`SignalState`] snapshot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalRecord {
    pub id: u32,
    pub hold: SignalHold,
    pub heads: Vec<SignalAspect>,
}

/// Full signal snapshot from the dispatcher.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SignalState {
    pub signals: Vec<SignalRecord>,
}

/// Manual holds on these signals should be released.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalReset {
    pub user: String,
    pub signals: Vec<u32>,
}

/// Join request from a client, and the dispatcher's announcement of a player.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerState {
    pub user: String,
    /// Session code the client was given.
    pub code: String,
    pub protocol_version: u32,
    /// Hash of the route identity the sender runs.
    pub route_hash: u64,
    pub consist: ConsistRecord,
    pub speed: f32,
}

/// A player now drives a different train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlayerTrainChange {
    pub user: String,
    pub number: TrainNumber,
    pub lead_car: Option<String>,
}

/// A player moved to another cab within the same train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocomotiveChange {
    pub user: String,
    pub number: TrainNumber,
    pub car_id: String,
}

/// Cab control positions of a remotely driven locomotive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocomotiveState {
    pub user: String,
    pub number: TrainNumber,
    pub car_id: String,
    pub controls: LocoControls,
}

/// Exhaust of one diesel locomotive.
#[derive(Debug, Clone, PartialEq)]
pub struct ExhaustEntry {
    pub user: String,
    pub number: TrainNumber,
    /// Position of the car within its train.
    pub car_index: u32,
    pub exhaust: Exhaust,
}

/// Exhaust updates, batched.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ExhaustMessage {
    pub entries: Vec<ExhaustEntry>,
}

/// Severity of a [`ControlMessage`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlLevel {
    Error,
    Warning,
    Information,
}

impl ControlLevel {
    fn code(self) -> u8 {
        match self {
            ControlLevel::Error => 0,
            ControlLevel::Warning => 1,
            ControlLevel::Information => 2,
        }
    }

    fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ControlLevel::Error),
            1 => Some(ControlLevel::Warning),
            2 => Some(ControlLevel::Information),
            _ => None,
        }
    }
}

/// What a [`ControlMessage`] is about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlKind {
    General,
    SameNameError,
    VersionMismatch,
    RouteMismatch,
    SwitchWarning,
    SignalWarning,
    TrainControlDenied,
    PlacementError,
}

impl ControlKind {
    fn as_str(self) -> &'static str {
        match self {
            ControlKind::General => "General",
            ControlKind::SameNameError => "SameNameError",
            ControlKind::VersionMismatch => "VersionMismatch",
            ControlKind::RouteMismatch => "RouteMismatch",
            ControlKind::SwitchWarning => "SwitchWarning",
            ControlKind::SignalWarning => "SignalWarning",
            ControlKind::TrainControlDenied => "TrainControlDenied",
            ControlKind::PlacementError => "PlacementError",
        }
    }

    fn from_token(token: &str) -> Option<Self> {
        let kind = match token {
            "General" => ControlKind::General,
            "SameNameError" => ControlKind::SameNameError,
            "VersionMismatch" => ControlKind::VersionMismatch,
            "RouteMismatch" => ControlKind::RouteMismatch,
            "SwitchWarning" => ControlKind::SwitchWarning,
            "SignalWarning" => ControlKind::SignalWarning,
            "TrainControlDenied" => ControlKind::TrainControlDenied,
            "PlacementError" => ControlKind::PlacementError,
            _ => return None,
        };
        Some(kind)
    }
}

/// Notification, warning or error addressed to one user or to everyone.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlMessage {
    pub level: ControlLevel,
    pub kind: ControlKind,
    /// Single recipient; `None` addresses every receiver.
    pub recipient: Option<String>,
    pub text: String,
}

impl ControlMessage {
    /// Whether `user` is meant to act on this message.
    pub fn is_for(&self, user: &str) -> bool {
        self.recipient.as_deref().is_none_or(|recipient| recipient == user)
    }
}

/// Phase of an authority handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ControlRequest {
    /// A client asks to drive a train.
    Request,
    /// The dispatcher grants it; every peer applies it.
    Confirm,
}

/// Authority handoff for one train.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainControl {
    pub user: String,
    pub request: ControlRequest,
    pub number: TrainNumber,
    pub lead_car: Option<String>,
}

/// A client does not know this train and asks for it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRequest {
    pub user: String,
    pub number: TrainNumber,
}

/// Everything needed to recreate one train on a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainRecord {
    pub consist: ConsistRecord,
    pub name: String,
    pub control_mode: ControlMode,
    pub speed: f32,
    /// Player driving it, if any.
    pub driver: Option<String>,
}

/// Trains sent by the dispatcher on join or on request.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TrainUpdate {
    pub trains: Vec<TrainRecord>,
}

/// These trains left the session.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RemoveTrain {
    pub numbers: Vec<TrainNumber>,
}

/// A player leaves for good.
#[derive(Debug, Clone, PartialEq)]
pub struct Quit {
    pub user: String,
}

/// Chat text, to everyone or to the listed users.
#[derive(Debug, Clone, PartialEq)]
pub struct ChatMessage {
    pub user: String,
    /// Empty means everyone.
    pub recipients: Vec<String>,
    pub text: String,
}

/// Dispatcher game clock, for client correction.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeCheck {
    pub clock: f64,
}

/// A turntable starts moving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MovingTable {
    pub user: String,
    pub id: u32,
    pub target: u32,
    pub clockwise: bool,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// Every message of the protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    Move(MoveMessage),
    Couple(CoupleMessage),
    Uncouple(UncoupleMessage),
    Flip(FlipMessage),
    SwitchChange(SwitchChange),
    SwitchState(SwitchState),
    SignalChange(SignalChange),
    SignalState(SignalState),
    SignalReset(SignalReset),
    PlayerState(PlayerState),
    PlayerTrainChange(PlayerTrainChange),
    LocomotiveChange(LocomotiveChange),
    LocomotiveState(LocomotiveState),
    Exhaust(ExhaustMessage),
    Control(ControlMessage),
    TrainControl(TrainControl),
    TrainRequest(TrainRequest),
    TrainUpdate(TrainUpdate),
    RemoveTrain(RemoveTrain),
    Quit(Quit),
    Chat(ChatMessage),
    TimeCheck(TimeCheck),
    MovingTable(MovingTable),
}

impl Message {
    /// Tag of this message.
    pub fn kind(&self) -> MessageKind {
        match self {
            Message::Move(_) => MessageKind::Move,
            Message::Couple(_) => MessageKind::Couple,
            Message::Uncouple(_) => MessageKind::Uncouple,
            Message::Flip(_) => MessageKind::Flip,
            Message::SwitchChange(_) => MessageKind::SwitchChange,
            Message::SwitchState(_) => MessageKind::SwitchState,
            Message::SignalChange(_) => MessageKind::SignalChange,
            Message::SignalState(_) => MessageKind::SignalState,
            Message::SignalReset(_) => MessageKind::SignalReset,
            Message::PlayerState(_) => MessageKind::PlayerState,
            Message::PlayerTrainChange(_) => MessageKind::PlayerTrainChange,
            Message::LocomotiveChange(_) => MessageKind::LocomotiveChange,
            Message::LocomotiveState(_) => MessageKind::LocomotiveState,
            Message::Exhaust(_) => MessageKind::Exhaust,
            Message::Control(_) => MessageKind::Control,
            Message::TrainControl(_) => MessageKind::TrainControl,
            Message::TrainRequest(_) => MessageKind::TrainRequest,
            Message::TrainUpdate(_) => MessageKind::TrainUpdate,
            Message::RemoveTrain(_) => MessageKind::RemoveTrain,
            Message::Quit(_) => MessageKind::Quit,
            Message::Chat(_) => MessageKind::Chat,
            Message::TimeCheck(_) => MessageKind::TimeCheck,
            Message::MovingTable(_) => MessageKind::MovingTable,
        }
    }

    /// Originating user, for kinds that name one.
    pub fn user(&self) -> Option<&str> {
        let user = match self {
            Message::Couple(m) => &m.user,
            Message::Uncouple(m) => &m.user,
            Message::Flip(m) => &m.user,
            Message::SwitchChange(m) => &m.user,
            Message::SignalChange(m) => &m.user,
            Message::SignalReset(m) => &m.user,
            Message::PlayerState(m) => &m.user,
            Message::PlayerTrainChange(m) => &m.user,
            Message::LocomotiveChange(m) => &m.user,
            Message::LocomotiveState(m) => &m.user,
            Message::TrainControl(m) => &m.user,
            Message::TrainRequest(m) => &m.user,
            Message::Quit(m) => &m.user,
            Message::Chat(m) => &m.user,
            Message::MovingTable(m) => &m.user,
            Message::Move(_)
            | Message::SwitchState(_)
            | Message::SignalState(_)
            | Message::Exhaust(_)
            | Message::Control(_)
            | Message::TrainUpdate(_)
            | Message::RemoveTrain(_)
            | Message::TimeCheck(_) => return None,
        };
        Some(user.as_str())
    }

    /// Encode the body.
    pub fn encode_payload(&self) -> Result<Vec<u8>, MessageError> {
        let payload = match self {
            Message::Move(m) => text_payload(m),
            Message::SwitchChange(m) => text_payload(m),
            Message::SignalChange(m) => text_payload(m),
            Message::SignalReset(m) => text_payload(m),
            Message::Exhaust(m) => text_payload(m),
            Message::Control(m) => text_payload(m),
            Message::RemoveTrain(m) => text_payload(m),
            Message::Quit(m) => text_payload(m),
            Message::Chat(m) => text_payload(m),
            Message::TimeCheck(m) => text_payload(m),
            Message::Couple(m) => postcard::to_allocvec(m)?,
            Message::Uncouple(m) => postcard::to_allocvec(m)?,
            Message::Flip(m) => postcard::to_allocvec(m)?,
            Message::SwitchState(m) => postcard::to_allocvec(m)?,
            Message::SignalState(m) => postcard::to_allocvec(m)?,
            Message::PlayerState(m) => postcard::to_allocvec(m)?,
            Message::PlayerTrainChange(m) => postcard::to_allocvec(m)?,
            Message::LocomotiveChange(m) => postcard::to_allocvec(m)?,
            Message::LocomotiveState(m) => postcard::to_allocvec(m)?,
            Message::TrainControl(m) => postcard::to_allocvec(m)?,
            Message::TrainRequest(m) => postcard::to_allocvec(m)?,
            Message::TrainUpdate(m) => postcard::to_allocvec(m)?,
            Message::MovingTable(m) => postcard::to_allocvec(m)?,
        };
        Ok(payload)
    }

    /// Encode into a frame.
    pub fn encode(&self) -> Result<Frame, MessageError> {
        Ok(Frame::new(self.kind().as_str(), self.encode_payload()?))
    }

    /// Decode a received frame.
    pub fn decode(frame: &Frame) -> Result<Self, MessageError> {
        let payload = frame.payload.as_slice();
        let message = match MessageKind::from_tag(&frame.kind)? {
            MessageKind::Move => Message::Move(from_text(payload)?),
            MessageKind::SwitchChange => Message::SwitchChange(from_text(payload)?),
            MessageKind::SignalChange => Message::SignalChange(from_text(payload)?),
            MessageKind::SignalReset => Message::SignalReset(from_text(payload)?),
            MessageKind::Exhaust => Message::Exhaust(from_text(payload)?),
            MessageKind::Control => Message::Control(from_text(payload)?),
            MessageKind::RemoveTrain => Message::RemoveTrain(from_text(payload)?),
            MessageKind::Quit => Message::Quit(from_text(payload)?),
            MessageKind::Chat => Message::Chat(from_text(payload)?),
            MessageKind::TimeCheck => Message::TimeCheck(from_text(payload)?),
            MessageKind::Couple => Message::Couple(postcard::from_bytes(payload)?),
            MessageKind::Uncouple => Message::Uncouple(postcard::from_bytes(payload)?),
            MessageKind::Flip => Message::Flip(postcard::from_bytes(payload)?),
            MessageKind::SwitchState => Message::SwitchState(postcard::from_bytes(payload)?),
            MessageKind::SignalState => Message::SignalState(postcard::from_bytes(payload)?),
            MessageKind::PlayerState => Message::PlayerState(postcard::from_bytes(payload)?),
            MessageKind::PlayerTrainChange => {
                Message::PlayerTrainChange(postcard::from_bytes(payload)?)
            }
            MessageKind::LocomotiveChange => {
                Message::LocomotiveChange(postcard::from_bytes(payload)?)
            }
            MessageKind::LocomotiveState => Message::LocomotiveState(postcard::from_bytes(payload)?),
            MessageKind::TrainControl => Message::TrainControl(postcard::from_bytes(payload)?),
            MessageKind::TrainRequest => Message::TrainRequest(postcard::from_bytes(payload)?),
            MessageKind::TrainUpdate => Message::TrainUpdate(postcard::from_bytes(payload)?),
            MessageKind::MovingTable => Message::MovingTable(postcard::from_bytes(payload)?),
        };
        Ok(message)
    }
}

impl WireMessage for Message {
    type Error = MessageError;

    fn to_frame(&self) -> Result<Frame, Self::Error> {
        self.encode()
    }

    fn from_frame(frame: &Frame) -> Result<Self, Self::Error> {
        Message::decode(frame)
    }
}

// ---------------------------------------------------------------------------
// Text grammar
// ---------------------------------------------------------------------------

trait TextBody: Sized {
    fn write(&self, w: &mut TextWriter);
    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError>;
}

fn text_payload<T: TextBody>(body: &T) -> Vec<u8> {
    let mut writer = TextWriter::new();
    body.write(&mut writer);
    writer.finish()
}

fn from_text<T: TextBody>(payload: &[u8]) -> Result<T, MessageError> {
    let mut reader = TextReader::new(payload)?;
    T::read(&mut reader)
}

fn write_location(w: &mut TextWriter, location: &WorldLocation) {
    w.field(location.tile_x)
        .field(location.tile_z)
        .field(location.x)
        .field(location.y)
        .field(location.z);
}

fn read_location(r: &mut TextReader<'_>) -> Result<WorldLocation, MessageError> {
    Ok(WorldLocation {
        tile_x: r.parse("tile_x")?,
        tile_z: r.parse("tile_z")?,
        x: r.parse("x")?,
        y: r.parse("y")?,
        z: r.parse("z")?,
    })
}

fn read_direction(r: &mut TextReader<'_>) -> Result<Direction, MessageError> {
    let code: u8 = r.parse("direction")?;
    Direction::from_code(code).ok_or(MessageError::InvalidField {
        field: "direction",
        value: code.to_string(),
    })
}

impl TextBody for MoveMessage {
    fn write(&self, w: &mut TextWriter) {
        w.field(self.entries.len());
        for entry in &self.entries {
            w.string(&entry.user).field(entry.number);
            write_location(w, &entry.rear);
            w.field(entry.travelled)
                .field(entry.speed)
                .field(entry.direction.code())
                .field(entry.car_count);
        }
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        let count: u32 = r.parse("count")?;
        let mut entries = Vec::with_capacity((count as usize).min(MAX_PREALLOCATE));
        for _ in 0..count {
            entries.push(MoveEntry {
                user: r.string("user")?,
                number: r.parse("number")?,
                rear: read_location(r)?,
                travelled: r.parse("travelled")?,
                speed: r.parse("speed")?,
                direction: read_direction(r)?,
                car_count: r.parse("car_count")?,
            });
        }
        Ok(Self { entries })
    }
}

impl TextBody for SwitchChange {
    fn write(&self, w: &mut TextWriter) {
        w.string(&self.user).field(self.junction).field(self.route);
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        Ok(Self {
            user: r.string("user")?,
            junction: r.parse("junction")?,
            route: r.parse("route")?,
        })
    }
}

impl TextBody for SignalChange {
    fn write(&self, w: &mut TextWriter) {
        w.string(&self.user).field(self.signal).field(self.hold.code());
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        let user = r.string("user")?;
        let signal = r.parse("signal")?;
        let code: u8 = r.parse("hold")?;
        let hold = SignalHold::from_code(code).ok_or(MessageError::InvalidField {
            field: "hold",
            value: code.to_string(),
        })?;
        Ok(Self { user, signal, hold })
    }
}

impl TextBody for SignalReset {
    fn write(&self, w: &mut TextWriter) {
        w.string(&self.user).field(self.signals.len());
        for id in &self.signals {
            w.field(id);
        }
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        let user = r.string("user")?;
        let count: u32 = r.parse("count")?;
        let signals = (0..count)
            .map(|_| r.parse("signal"))
            .collect::<Result<_, _>>()?;
        Ok(Self { user, signals })
    }
}

impl TextBody for ExhaustMessage {
    fn write(&self, w: &mut TextWriter) {
        w.field(self.entries.len());
        for entry in &self.entries {
            let [red, green, blue] = entry.exhaust.color;
            w.string(&entry.user)
                .field(entry.number)
                .field(entry.car_index)
                .field(entry.exhaust.particles)
                .field(entry.exhaust.magnitude)
                .field(red)
                .field(green)
                .field(blue);
        }
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        let count: u32 = r.parse("count")?;
        let mut entries = Vec::with_capacity((count as usize).min(MAX_PREALLOCATE));
        for _ in 0..count {
            entries.push(ExhaustEntry {
                user: r.string("user")?,
                number: r.parse("number")?,
                car_index: r.parse("car_index")?,
                exhaust: Exhaust {
                    particles: r.parse("particles")?,
                    magnitude: r.parse("magnitude")?,
                    color: [r.parse("red")?, r.parse("green")?, r.parse("blue")?],
                },
            });
        }
        Ok(Self { entries })
    }
}

impl TextBody for ControlMessage {
    fn write(&self, w: &mut TextWriter) {
        w.field(self.level.code())
            .field(self.kind.as_str())
            .string(self.recipient.as_deref().unwrap_or(""))
            .string(&self.text);
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        let code: u8 = r.parse("level")?;
        let level = ControlLevel::from_code(code).ok_or(MessageError::InvalidField {
            field: "level",
            value: code.to_string(),
        })?;
        let token = r.token("kind")?;
        let kind = ControlKind::from_token(token).ok_or_else(|| MessageError::InvalidField {
            field: "kind",
            value: token.to_string(),
        })?;
        let recipient = Some(r.string("recipient")?).filter(|name| !name.is_empty());
        let text = r.string("text")?;
        Ok(Self {
            level,
            kind,
            recipient,
            text,
        })
    }
}

impl TextBody for RemoveTrain {
    fn write(&self, w: &mut TextWriter) {
        w.field(self.numbers.len());
        for number in &self.numbers {
            w.field(number);
        }
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        let count: u32 = r.parse("count")?;
        let numbers = (0..count)
            .map(|_| r.parse("number"))
            .collect::<Result<_, _>>()?;
        Ok(Self { numbers })
    }
}

impl TextBody for Quit {
    fn write(&self, w: &mut TextWriter) {
        w.string(&self.user);
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        Ok(Self {
            user: r.string("user")?,
        })
    }
}

impl TextBody for ChatMessage {
    fn write(&self, w: &mut TextWriter) {
        w.string(&self.user).field(self.recipients.len());
        for recipient in &self.recipients {
            w.string(recipient);
        }
        w.string(&self.text);
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        let user = r.string("user")?;
        let count: u32 = r.parse("recipients")?;
        let recipients = (0..count)
            .map(|_| r.string("recipient"))
            .collect::<Result<_, _>>()?;
        let text = r.string("text")?;
        Ok(Self {
            user,
            recipients,
            text,
        })
    }
}

impl TextBody for TimeCheck {
    fn write(&self, w: &mut TextWriter) {
        w.field(self.clock);
    }

    fn read(r: &mut TextReader<'_>) -> Result<Self, MessageError> {
        Ok(Self {
            clock: r.parse("clock")?,
        })
    }
}
