//! Station channel manager
//!
//! Keeps one outbound channel per connected station and correlates the
//! calls sent to stations with the results they send back.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use csms_core::ErrorKind;
use csms_core::ocpp::{Action, Call, CallError, CallResult, ErrorCode, FrameError};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("Station {station_id} is not connected")]
    NotConnected { station_id: String },
    #[error("Station {station_id} did not answer {action} in time")]
    Timeout { station_id: String, action: Action },
    #[error("Connection to station {station_id} closed")]
    ConnectionClosed { station_id: String },
    #[error("Station {station_id} answered {code:?}: {description}")]
    Remote {
        station_id: String,
        code: ErrorCode,
        description: String,
    },
    #[error("Station {station_id} rejected the charging profile ({status})")]
    Rejected { station_id: String, status: String },
    #[error(transparent)]
    Frame(#[from] FrameError),
}

impl DeliveryError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            DeliveryError::Timeout { .. } => ErrorKind::Timeout,
            _ => ErrorKind::DeliveryFailure,
        }
    }

    /// Failures that may go away on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            DeliveryError::NotConnected { .. }
                | DeliveryError::Timeout { .. }
                | DeliveryError::ConnectionClosed { .. }
                | DeliveryError::Remote { .. }
        )
    }
}

/// Pending request awaiting response
struct PendingCall {
    action: Action,
    response_tx: oneshot::Sender<Result<CallResult, DeliveryError>>,
}

struct Connection {
    generation: u64,
    outbound: mpsc::Sender<String>,
    pending: HashMap<String, PendingCall>,
}

pub struct ChannelManager {
    connections: Mutex<HashMap<String, Connection>>,
    next_generation: AtomicU64,
    call_timeout: Duration,
}

impl ChannelManager {
    pub fn new(call_timeout: Duration) -> Self {
        ChannelManager {
            connections: Mutex::new(HashMap::new()),
            next_generation: AtomicU64::new(1),
            call_timeout,
        }
    }

    /// Register the outbound side of a new connection. A previous connection
    /// of the same station is replaced and its pending calls fail.
    pub fn connect(&self, station_id: &str, outbound: mpsc::Sender<String>) -> u64 {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        let previous = self.connections.lock().insert(
            station_id.to_string(),
            Connection {
                generation,
                outbound,
                pending: HashMap::new(),
            },
        );
        if let Some(previous) = previous {
            tracing::warn!(station_id, "Station reconnected, dropping previous connection");
            fail_pending(station_id, previous);
        }
        tracing::info!(station_id, generation, "Station connected");
        generation
    }

    /// Forget the connection, unless the station already reconnected.
    pub fn disconnect(&self, station_id: &str, generation: u64) {
        let mut connections = self.connections.lock();
        if connections
            .get(station_id)
            .is_some_and(|c| c.generation == generation)
        {
            if let Some(connection) = connections.remove(station_id) {
                fail_pending(station_id, connection);
            }
            tracing::info!(station_id, generation, "Station disconnected");
        }
    }

    pub fn is_connected(&self, station_id: &str) -> bool {
        self.connections.lock().contains_key(station_id)
    }

    pub fn connected_stations(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.lock().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Send a call to a station and wait for its result.
    pub async fn call(&self, station_id: &str, call: Call) -> Result<CallResult, DeliveryError> {
        let bytes = call.to_bytes()?;
        let text = String::from_utf8_lossy(&bytes).into_owned();
        let (response_tx, response_rx) = oneshot::channel();

        let outbound = {
            let mut connections = self.connections.lock();
            let connection =
                connections
                    .get_mut(station_id)
                    .ok_or_else(|| DeliveryError::NotConnected {
                        station_id: station_id.to_string(),
                    })?;
            connection.pending.insert(
                call.message_id.clone(),
                PendingCall {
                    action: call.action,
                    response_tx,
                },
            );
            connection.outbound.clone()
        };

        tracing::debug!(station_id, message_id = %call.message_id, action = %call.action, "Sending call");
        if outbound.send(text).await.is_err() {
            self.forget(station_id, &call.message_id);
            return Err(DeliveryError::ConnectionClosed {
                station_id: station_id.to_string(),
            });
        }

        match tokio::time::timeout(self.call_timeout, response_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(DeliveryError::ConnectionClosed {
                station_id: station_id.to_string(),
            }),
            Err(_) => {
                self.forget(station_id, &call.message_id);
                Err(DeliveryError::Timeout {
                    station_id: station_id.to_string(),
                    action: call.action,
                })
            }
        }
    }

    fn forget(&self, station_id: &str, message_id: &str) {
        if let Some(connection) = self.connections.lock().get_mut(station_id) {
            connection.pending.remove(message_id);
        }
    }

    fn take_pending(&self, station_id: &str, message_id: &str) -> Option<PendingCall> {
        self.connections
            .lock()
            .get_mut(station_id)
            .and_then(|c| c.pending.remove(message_id))
    }

    /// Hand a CALLRESULT to the call waiting for it.
    pub fn resolve(&self, station_id: &str, result: CallResult) {
        match self.take_pending(station_id, &result.message_id) {
            Some(pending) => {
                tracing::debug!(station_id, message_id = %result.message_id, action = %pending.action, "Call answered");
                let _ = pending.response_tx.send(Ok(result));
            }
            None => {
                tracing::warn!(station_id, message_id = %result.message_id, "Result for unknown call");
            }
        }
    }

    /// Hand a CALLERROR to the call waiting for it.
    pub fn reject(&self, station_id: &str, error: CallError) {
        match self.take_pending(station_id, &error.message_id) {
            Some(pending) => {
                let _ = pending.response_tx.send(Err(DeliveryError::Remote {
                    station_id: station_id.to_string(),
                    code: error.error_code,
                    description: error.error_description,
                }));
            }
            None => {
                tracing::warn!(station_id, message_id = %error.message_id, "Error for unknown call");
            }
        }
    }
}

fn fail_pending(station_id: &str, connection: Connection) {
    for (_, pending) in connection.pending {
        let _ = pending.response_tx.send(Err(DeliveryError::ConnectionClosed {
            station_id: station_id.to_string(),
        }));
    }
}
