//! OCPP 1.6-J protocol support

pub mod messages;
pub mod types;

pub use messages::*;
pub use types::*;
