// heapdbg - Heap origin debugger
// Copyright (C) 2024 Zhuo Zhang and Wuqi Zhang
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Remote debugging protocol plumbing.
//!
//! The engine talks to the debuggee through the [`ProtocolClient`] trait: a
//! request/response call plus a broadcast stream of events. The transport itself
//! (a websocket, a pipe, an in-process channel) is provided by the caller.
//!
//! # Wire Types
//!
//! - [`ProtocolRequest`] - Outgoing command with a numeric id
//! - [`ProtocolResponse`] - Result or error for a previously sent command
//! - [`ProtocolEvent`] - Unsolicited notification (`Debugger.paused`, ...)
//!
//! [`ChannelClient`] implements the trait over a pair of text-frame channels and
//! is enough to drive any transport that can exchange JSON frames.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc,
    },
};

use futures::future::BoxFuture;
use parking_lot::Mutex;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc, oneshot};
use tracing::{debug, trace, warn};

/// Capacity of the event broadcast channel
pub const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Errors raised by protocol round-trips.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum ProtocolError {
    /// The remote side answered with an error object
    #[error("{method} failed ({code}): {message}")]
    Remote {
        /// Method that failed
        method: String,
        /// Remote error code
        code: i64,
        /// Remote error message
        message: String,
    },
    /// The response could not be decoded into the expected shape
    #[error("unexpected response to {method}: {reason}")]
    UnexpectedResponse {
        /// Method that was called
        method: String,
        /// Decoding error
        reason: String,
    },
    /// The connection went away before a response arrived
    #[error("protocol connection closed")]
    Closed,
}

/// Protocol error codes.
pub mod error_codes {
    /// Generic server-side failure
    pub const SERVER_ERROR: i64 = -32000;
    /// Invalid request
    pub const INVALID_REQUEST: i64 = -32600;
    /// Method not found
    pub const METHOD_NOT_FOUND: i64 = -32601;
    /// Invalid params
    pub const INVALID_PARAMS: i64 = -32602;
}

/// An unsolicited protocol notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProtocolEvent {
    /// Event name, e.g. `Debugger.paused`
    pub method: String,
    /// Event payload
    #[serde(default)]
    pub params: Value,
}

impl ProtocolEvent {
    /// Create a new event
    pub fn new(method: impl Into<String>, params: Value) -> Self {
        Self { method: method.into(), params }
    }
}

/// Outgoing command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolRequest {
    /// Request identifier for matching with the response
    pub id: u64,
    /// Method name
    pub method: String,
    /// Method parameters
    #[serde(default)]
    pub params: Value,
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolErrorObject {
    /// Numeric error code
    pub code: i64,
    /// Human-readable error message
    pub message: String,
    /// Optional additional error data
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// Response to a command. Contains either a result or an error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolResponse {
    /// Identifier of the request being answered
    pub id: u64,
    /// Successful result
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error information
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ProtocolErrorObject>,
}

/// Any frame received from the remote side.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum InboundMessage {
    /// Answer to a command
    Response(ProtocolResponse),
    /// Notification
    Event(ProtocolEvent),
}

/// A live connection to a debuggee.
pub trait ProtocolClient: Send + Sync + 'static {
    /// Send a command and wait for its result.
    fn send(&self, method: &str, params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>>;

    /// Subscribe to every event received from now on.
    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent>;
}

/// Shared handle to a protocol connection
pub type SharedProtocol = Arc<dyn ProtocolClient>;

/// Send a command and decode its result.
pub async fn request<T: DeserializeOwned>(
    client: &dyn ProtocolClient,
    method: &str,
    params: Value,
) -> Result<T, ProtocolError> {
    let raw = client.send(method, params).await?;
    serde_json::from_value(raw).map_err(|e| ProtocolError::UnexpectedResponse {
        method: method.to_string(),
        reason: e.to_string(),
    })
}

type Pending = HashMap<u64, (String, oneshot::Sender<Result<Value, ProtocolError>>)>;

/// [`ProtocolClient`] over a pair of JSON text-frame channels.
///
/// Outgoing requests are serialized onto `outbound`. A reader task drains
/// `inbound`, completing pending requests by id and broadcasting events.
pub struct ChannelClient {
    outbound: mpsc::UnboundedSender<String>,
    closed: Arc<AtomicBool>,
    next_id: AtomicU64,
    pending: Arc<Mutex<Pending>>,
    events: broadcast::Sender<ProtocolEvent>,
}

impl ChannelClient {
    /// Create the client and spawn its reader task.
    pub fn spawn(
        outbound: mpsc::UnboundedSender<String>,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let pending: Arc<Mutex<Pending>> = Arc::default();
        let closed = Arc::new(AtomicBool::new(false));

        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        let reader_events = events.clone();
        tokio::spawn(async move {
            while let Some(frame) = inbound.recv().await {
                route_frame(&frame, &reader_pending, &reader_events);
            }

            debug!("Protocol connection closed, failing pending requests");
            reader_closed.store(true, Ordering::SeqCst);
            for (_, (_, tx)) in reader_pending.lock().drain() {
                let _ = tx.send(Err(ProtocolError::Closed));
            }
        });

        Arc::new(Self { outbound, closed, next_id: AtomicU64::new(1), pending, events })
    }
}

fn route_frame(frame: &str, pending: &Mutex<Pending>, events: &broadcast::Sender<ProtocolEvent>) {
    let message = match serde_json::from_str::<InboundMessage>(frame) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "Dropping malformed protocol frame");
            return;
        }
    };

    match message {
        InboundMessage::Response(response) => {
            let Some((method, tx)) = pending.lock().remove(&response.id) else {
                warn!(id = response.id, "Response for unknown request");
                return;
            };
            let result = match response.error {
                Some(error) => {
                    Err(ProtocolError::Remote { method, code: error.code, message: error.message })
                }
                None => Ok(response.result.unwrap_or(Value::Null)),
            };
            let _ = tx.send(result);
        }
        InboundMessage::Event(event) => {
            trace!(method = %event.method, "Protocol event");
            // No subscribers is not an error.
            let _ = events.send(event);
        }
    }
}

impl ProtocolClient for ChannelClient {
    fn send(&self, method: &str, params: Value) -> BoxFuture<'_, Result<Value, ProtocolError>> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let method = method.to_string();

        Box::pin(async move {
            let (tx, rx) = oneshot::channel();
            self.pending.lock().insert(id, (method.clone(), tx));
            if self.closed.load(Ordering::SeqCst) {
                self.pending.lock().remove(&id);
                return Err(ProtocolError::Closed);
            }

            let request = ProtocolRequest { id, method: method.clone(), params };
            let frame = serde_json::to_string(&request)
                .map_err(|e| ProtocolError::UnexpectedResponse {
                    method: method.clone(),
                    reason: e.to_string(),
                })?;

            debug!(id, method = %method, "Sending protocol request");
            if self.outbound.send(frame).is_err() {
                self.pending.lock().remove(&id);
                return Err(ProtocolError::Closed);
            }

            rx.await.unwrap_or(Err(ProtocolError::Closed))
        })
    }

    fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }
}
