mod allocator;
mod events;
mod models;
pub mod ocpp;
mod state_machine;
mod store;

pub use crate::allocator::*;
pub use crate::events::*;
pub use crate::models::*;
pub use crate::state_machine::*;
pub use crate::store::*;

use serde::Serialize;
use thiserror::Error;

/// How a failure is treated by the caller, whatever component raised it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorKind {
    /// Malformed frame or invalid transition: answered with a CALLERROR,
    /// the connection stays up.
    ProtocolViolation,
    /// Duplicate or competing start, resolved against the existing session.
    Conflict,
    NotFound,
    AllocationFailure,
    DeliveryFailure,
    Timeout,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum SessionError {
    #[error("Station {station_id} is not registered")]
    StationNotFound { station_id: String },
    #[error("Connector {connector_id} does not exist in the station configuration")]
    ConnectorNotFound { connector_id: ConnectorId },
    #[error("Transaction {transaction_id} not found")]
    TransactionNotFound { transaction_id: String },
    #[error("Charging group {group_id} not found")]
    GroupNotFound { group_id: uuid::Uuid },
    #[error("Connector {connector_id} is already in use by transaction {existing}")]
    ConnectorAlreadyInUse {
        connector_id: ConnectorId,
        existing: String,
    },
    #[error("Transaction {transaction_id} has already been used")]
    TransactionConflict { transaction_id: String },
    #[error("Connector {connector_id} cannot move from {from} to {to}")]
    InvalidStatus {
        connector_id: ConnectorId,
        from: ChargePointStatus,
        to: ChargePointStatus,
    },
    #[error("Meter reading {reading} of transaction {transaction_id} is below {last}")]
    MeterRegression {
        transaction_id: String,
        last: u64,
        reading: u64,
    },
    #[error("Station {station_id} is disabled")]
    StationDisabled { station_id: String },
    #[error("Transaction {transaction_id} is closed")]
    SessionClosed { transaction_id: String },
    #[error("Timed out waiting for connector {connector_id}")]
    LockTimeout { connector_id: ConnectorId },
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SessionError::StationNotFound { .. }
            | SessionError::ConnectorNotFound { .. }
            | SessionError::TransactionNotFound { .. }
            | SessionError::GroupNotFound { .. } => ErrorKind::NotFound,
            SessionError::ConnectorAlreadyInUse { .. }
            | SessionError::TransactionConflict { .. } => ErrorKind::Conflict,
            SessionError::InvalidStatus { .. }
            | SessionError::MeterRegression { .. }
            | SessionError::StationDisabled { .. }
            | SessionError::SessionClosed { .. } => ErrorKind::ProtocolViolation,
            SessionError::LockTimeout { .. } => ErrorKind::Timeout,
        }
    }
}
