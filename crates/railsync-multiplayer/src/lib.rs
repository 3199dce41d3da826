//! Multiplayer synchronisation for the railway simulator: the message model,
//! the dispatcher/client session, player join and reconnect, and the driver
//! that runs a session over TCP.

pub mod authority;
pub mod catalog;
pub mod chat;
pub mod clock;
pub mod consist;
pub mod driver;
pub mod error;
mod handlers;
pub mod messages;
pub mod player_session;
pub mod registry;
pub mod roster;
pub mod session;
pub mod sim;
mod text;

pub use authority::{AuthorityArbiter, AuthorityDecision, DenyReason};
pub use catalog::{CarCatalog, CarSpec, CatalogError};
pub use driver::Driver;
pub use error::{ErrorCategory, SessionError};
pub use messages::{Message, MessageError, MessageKind};
pub use player_session::{JoinError, spawn_consist};
pub use registry::{LostPlayer, OnlineLocomotive, OnlinePlayer, OnlineTrains, PlayerStatus};
pub use roster::{Roster, RosterError};
pub use session::{
    Outgoing, PROTOCOL_VERSION, Recipient, Role, Session, SessionConfig, SessionEvent,
    SessionState, route_hash,
};
pub use sim::{Simulation, Train, TrainCar, TrainNumber, WorldLocation};
