//! Control-channel seam between consumer and provider.
//!
//! The actual transport (hole punching, encryption, wire framing) lives
//! outside this crate; the core consumes it through the narrow [`Dialer`]
//! and [`Channel`] traits. Message bodies are typed structs carried in an
//! opaque byte envelope so mocks and transports stay interchangeable.
//!
//! `Channel::send` must be safe for concurrent use: the manager, the
//! keepalive loop and the payment issuer all share one channel.

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tokio::net::UdpSocket;

use crate::identity::Identity;
use crate::market::Contact;

/// Contact type the built-in dialer understands.
pub const CONTACT_TYPE_V1: &str = "p2p/v1";

/// Topic for the session-create request/response exchange.
pub const TOPIC_SESSION_CREATE: &str = "session-create";
/// Topic for advisory session status reports (IP verification verdicts).
pub const TOPIC_SESSION_STATUS: &str = "session-status";
/// Topic for the best-effort session end notice.
pub const TOPIC_SESSION_ACKNOWLEDGE: &str = "session-acknowledge";
/// Topic for liveness pings.
pub const TOPIC_KEEP_ALIVE: &str = "keep-alive";

/// Errors surfaced by the control channel.
#[derive(Debug, Error)]
pub enum ChannelError {
    /// Dialing the provider failed before a channel existed.
    #[error("dialing provider failed: {0}")]
    Dial(String),

    /// A send on an established channel failed.
    #[error("send on topic '{topic}' failed: {reason}")]
    Send { topic: String, reason: String },

    /// A send did not complete within the allotted time.
    #[error("send on topic '{0}' timed out")]
    Timeout(String),

    /// The channel was closed by either side.
    #[error("channel is closed")]
    Closed,

    /// A request expecting a reply got none.
    #[error("peer replied with an empty message")]
    EmptyReply,

    /// Message body (de)serialization failed.
    #[error("message codec: {0}")]
    Codec(#[from] serde_json::Error),
}

/// Opaque message envelope exchanged over the channel.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Message {
    payload: Vec<u8>,
}

impl Message {
    /// Encode a typed body into an envelope.
    pub fn encode<T: Serialize>(body: &T) -> Result<Self, ChannelError> {
        Ok(Self {
            payload: serde_json::to_vec(body)?,
        })
    }

    /// Decode the envelope into a typed body.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, ChannelError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Raw payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// Verdict codes carried by [`SessionStatus`] reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatusCode {
    /// Egress traffic verified to leave through the provider.
    ConnectionOk,
    /// The consumer's public IP did not change after connecting.
    SessionIpNotChanged,
}

impl StatusCode {
    /// Wire representation of the code.
    pub fn code(self) -> u32 {
        match self {
            StatusCode::ConnectionOk => 1000,
            StatusCode::SessionIpNotChanged => 1001,
        }
    }
}

/// Request opening a paid session with a provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRequest {
    pub consumer_id: String,
    pub hermes_id: String,
    pub service_type: String,
}

/// Provider's answer to [`SessionRequest`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionResponse {
    /// Identifier of the accepted session.
    pub id: String,
    /// Opaque provider-side configuration handed to the tunnel.
    #[serde(default)]
    pub config: Vec<u8>,
}

/// Advisory connectivity report for an active session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStatus {
    pub consumer_id: String,
    pub session_id: String,
    pub code: u32,
    pub message: String,
}

/// Identification of a session, used for the end notice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionInfoMessage {
    pub consumer_id: String,
    pub session_id: String,
}

/// Liveness ping sent by the keepalive loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct KeepAlivePing {
    pub session_id: String,
}

/// Handler invoked for messages the remote pushes on a topic.
pub type HandlerFn = Arc<dyn Fn(Message) -> Option<Message> + Send + Sync>;

/// An established bidirectional control channel to a provider.
#[async_trait]
pub trait Channel: Send + Sync {
    /// Send a message and wait for the remote's reply, if the topic has one.
    ///
    /// Safe for concurrent use from multiple tasks.
    async fn send(&self, topic: &str, message: &Message) -> Result<Option<Message>, ChannelError>;

    /// Register a handler for messages the remote initiates on `topic`.
    fn handle(&self, topic: &str, handler: HandlerFn);

    /// Close the channel. Further sends fail with [`ChannelError::Closed`].
    async fn close(&self) -> Result<(), ChannelError>;

    /// UDP endpoint carrying the channel itself, when the transport has one.
    fn conn(&self) -> Option<Arc<UdpSocket>> {
        None
    }

    /// UDP endpoint reserved for the tunnel's data plane, when available.
    fn service_conn(&self) -> Option<Arc<UdpSocket>> {
        None
    }
}

/// Establishes control channels to providers.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dial the provider advertised by `contact`.
    async fn dial(
        &self,
        consumer: &Identity,
        provider: &Identity,
        service_type: &str,
        contact: &Contact,
    ) -> Result<Arc<dyn Channel>, ChannelError>;
}
