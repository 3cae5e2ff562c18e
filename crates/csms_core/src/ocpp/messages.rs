//! OCPP-J framing
//!
//! - CALL: [2, messageId, action, payload]
//! - CALLRESULT: [3, messageId, payload]
//! - CALLERROR: [4, messageId, errorCode, errorDescription, errorDetails]

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use uuid::Uuid;

use super::types::*;

/// OCPP message type identifiers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageType {
    Call = 2,
    CallResult = 3,
    CallError = 4,
}

/// OCPP-J error codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    NotImplemented,
    NotSupported,
    InternalError,
    ProtocolError,
    SecurityError,
    FormationViolation,
    PropertyConstraintViolation,
    OccurenceConstraintViolation,
    TypeConstraintViolation,
    GenericError,
}

/// Actions exchanged with a station
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    // CP -> CSMS
    BootNotification,
    Heartbeat,
    StatusNotification,
    StartTransaction,
    MeterValues,
    StopTransaction,

    // CSMS -> CP
    SetChargingProfile,
}

impl std::fmt::Display for Action {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl std::str::FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "BootNotification" => Ok(Action::BootNotification),
            "Heartbeat" => Ok(Action::Heartbeat),
            "StatusNotification" => Ok(Action::StatusNotification),
            "StartTransaction" => Ok(Action::StartTransaction),
            "MeterValues" => Ok(Action::MeterValues),
            "StopTransaction" => Ok(Action::StopTransaction),
            "SetChargingProfile" => Ok(Action::SetChargingProfile),
            _ => Err(s.to_string()),
        }
    }
}

/// Errors in OCPP frame handling
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("JSON parse error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Invalid message format")]
    InvalidFormat,

    #[error("Unknown action {action} in message {message_id}")]
    UnknownAction { message_id: String, action: String },

    #[error("Unknown message type: {0}")]
    UnknownMessageType(i64),

    #[error("Invalid {action} payload in message {message_id}: {reason}")]
    InvalidPayload {
        message_id: String,
        action: Action,
        reason: String,
    },
}

impl FrameError {
    /// The CALLERROR a station should receive for this error, when the
    /// offending message id is known.
    pub fn to_call_error(&self) -> Option<CallError> {
        match self {
            FrameError::UnknownAction { message_id, action } => Some(CallError::new(
                message_id.clone(),
                ErrorCode::NotImplemented,
                format!("Action {action} is not supported"),
            )),
            FrameError::InvalidPayload {
                message_id, reason, ..
            } => Some(CallError::new(
                message_id.clone(),
                ErrorCode::FormationViolation,
                reason.clone(),
            )),
            _ => None,
        }
    }
}

/// OCPP CALL message (request)
#[derive(Debug, Clone)]
pub struct Call {
    pub message_id: String,
    pub action: Action,
    pub payload: Value,
}

impl Call {
    /// Create a new CALL message with auto-generated ID
    pub fn new(action: Action, payload: impl Serialize) -> Result<Self, FrameError> {
        Ok(Self {
            message_id: Uuid::new_v4().to_string(),
            action,
            payload: serde_json::to_value(payload)?,
        })
    }

    pub fn set_charging_profile(request: SetChargingProfileRequest) -> Result<Self, FrameError> {
        Self::new(Action::SetChargingProfile, request)
    }

    /// Parse the payload as the request type of this action
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FrameError> {
        serde_json::from_value(self.payload.clone()).map_err(|err| FrameError::InvalidPayload {
            message_id: self.message_id.clone(),
            action: self.action,
            reason: err.to_string(),
        })
    }

    /// Serialize to OCPP wire format: [2, messageId, action, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let array = serde_json::json!([
            MessageType::Call as i32,
            &self.message_id,
            self.action.to_string(),
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// OCPP CALLRESULT message (success response)
#[derive(Debug, Clone)]
pub struct CallResult {
    pub message_id: String,
    pub payload: Value,
}

impl CallResult {
    pub fn new(message_id: String, payload: impl Serialize) -> Result<Self, FrameError> {
        Ok(Self {
            message_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Serialize to OCPP wire format: [3, messageId, payload]
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let array = serde_json::json!([
            MessageType::CallResult as i32,
            &self.message_id,
            &self.payload
        ]);
        Ok(serde_json::to_vec(&array)?)
    }

    /// Parse the payload as a specific response type
    pub fn parse_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T, FrameError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// OCPP CALLERROR message (error response)
#[derive(Debug, Clone)]
pub struct CallError {
    pub message_id: String,
    pub error_code: ErrorCode,
    pub error_description: String,
    pub error_details: Value,
}

impl CallError {
    pub fn new(
        message_id: String,
        error_code: ErrorCode,
        error_description: impl Into<String>,
    ) -> Self {
        Self {
            message_id,
            error_code,
            error_description: error_description.into(),
            error_details: Value::Object(serde_json::Map::new()),
        }
    }

    /// Serialize to OCPP wire format: [4, messageId, errorCode, errorDescription, errorDetails]
    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        let array = serde_json::json!([
            MessageType::CallError as i32,
            &self.message_id,
            format!("{:?}", self.error_code),
            &self.error_description,
            &self.error_details
        ]);
        Ok(serde_json::to_vec(&array)?)
    }
}

/// Parsed OCPP message (any type)
#[derive(Debug, Clone)]
pub enum OcppMessage {
    Call(Call),
    CallResult(CallResult),
    CallError(CallError),
}

fn message_id_at(array: &[Value]) -> Result<String, FrameError> {
    array
        .get(1)
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or(FrameError::InvalidFormat)
}

impl OcppMessage {
    /// Parse an OCPP message from JSON bytes
    pub fn parse(bytes: &[u8]) -> Result<Self, FrameError> {
        let array: Vec<Value> = serde_json::from_slice(bytes)?;

        let msg_type = array
            .first()
            .and_then(Value::as_i64)
            .ok_or(FrameError::InvalidFormat)?;

        match msg_type {
            2 => {
                if array.len() != 4 {
                    return Err(FrameError::InvalidFormat);
                }
                let message_id = message_id_at(&array)?;
                let action_str = array[2].as_str().ok_or(FrameError::InvalidFormat)?;
                let action: Action =
                    action_str
                        .parse()
                        .map_err(|action| FrameError::UnknownAction {
                            message_id: message_id.clone(),
                            action,
                        })?;

                Ok(OcppMessage::Call(Call {
                    message_id,
                    action,
                    payload: array[3].clone(),
                }))
            }
            3 => {
                if array.len() != 3 {
                    return Err(FrameError::InvalidFormat);
                }
                Ok(OcppMessage::CallResult(CallResult {
                    message_id: message_id_at(&array)?,
                    payload: array[2].clone(),
                }))
            }
            4 => {
                if array.len() != 5 {
                    return Err(FrameError::InvalidFormat);
                }
                let message_id = message_id_at(&array)?;
                let error_code = array[2]
                    .as_str()
                    .and_then(|code| serde_json::from_value(Value::String(code.to_string())).ok())
                    .unwrap_or(ErrorCode::GenericError);
                let error_description = array[3].as_str().unwrap_or("").to_string();

                Ok(OcppMessage::CallError(CallError {
                    message_id,
                    error_code,
                    error_description,
                    error_details: array[4].clone(),
                }))
            }
            _ => Err(FrameError::UnknownMessageType(msg_type)),
        }
    }

    pub fn message_id(&self) -> &str {
        match self {
            OcppMessage::Call(c) => &c.message_id,
            OcppMessage::CallResult(r) => &r.message_id,
            OcppMessage::CallError(e) => &e.message_id,
        }
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, FrameError> {
        match self {
            OcppMessage::Call(c) => c.to_bytes(),
            OcppMessage::CallResult(r) => r.to_bytes(),
            OcppMessage::CallError(e) => e.to_bytes(),
        }
    }
}
