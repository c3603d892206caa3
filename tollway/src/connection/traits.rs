//! Injection seams of the connection core.
//!
//! Every external collaborator the manager needs is a narrow trait with a
//! mock-friendly contract. Concrete tunnel implementations, payment engines
//! and IP resolvers live in other crates and are injected at construction.

use crate::connection::error::Error;
use crate::connection::state::{ConnectParams, SessionId, Statistics, TunnelState};
use crate::identity::{Address, Identity};
use crate::market::ServiceProposal;
use crate::p2p::Channel;
use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Everything a tunnel implementation needs to start.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
    /// Session id assigned by the provider.
    pub session_id: SessionId,
    /// Per-connection options from the connect call.
    pub params: ConnectParams,
    /// Opaque provider-side configuration from the session-create response.
    pub provider_config: Vec<u8>,
}

/// A running (or runnable) tunnel.
///
/// Implementations own an external process or in-process data plane. All
/// methods take `&self`; implementations provide their own interior
/// mutability so the connection can be shared with the statistics reporter.
#[async_trait]
pub trait Connection: Send + Sync {
    /// The ordered stream of tunnel states.
    ///
    /// May be taken once, before `start`; later calls return a receiver
    /// that is already closed. The stream closes after
    /// [`TunnelState::ProcessExited`].
    fn state_stream(&self) -> mpsc::UnboundedReceiver<TunnelState>;

    /// Launch the tunnel. The channel's transport endpoints are available
    /// for binding the data plane.
    async fn start(&self, options: ConnectOptions, channel: Arc<dyn Channel>)
        -> Result<(), Error>;

    /// Ask the tunnel to shut down. The definitive signal of death is
    /// [`TunnelState::ProcessExited`] on the state stream, not this call
    /// returning.
    async fn stop(&self);

    /// Current transfer statistics. Must be cheap and thread-safe.
    fn statistics(&self) -> Result<Statistics, Error>;
}

/// Produces a [`Connection`] for a service type. Called once per session.
pub trait ConnectionFactory: Send + Sync {
    /// Create the connection that will serve this session.
    fn create(&self, service_type: &str) -> Result<Arc<dyn Connection>, Error>;
}

/// Issues micropayments for an active session.
#[async_trait]
pub trait PaymentIssuer: Send + Sync {
    /// Run the payment loop. Blocks until [`stop`](Self::stop) is called or
    /// a fatal payment error occurs.
    async fn start(&self) -> Result<(), Error>;

    /// Stop the payment loop. Idempotent.
    async fn stop(&self);

    /// Bind the issuer to the session id assigned by the provider.
    fn set_session_id(&self, session_id: &SessionId);
}

/// Builds a [`PaymentIssuer`] bound to a channel and session parties.
pub trait PaymentIssuerFactory: Send + Sync {
    /// Create the issuer for this session.
    fn create(
        &self,
        channel: Arc<dyn Channel>,
        consumer: &Identity,
        provider: &Identity,
        hermes: &Address,
        proposal: &ServiceProposal,
    ) -> Result<Arc<dyn PaymentIssuer>, Error>;
}

/// Reports the host's currently observed public IP.
#[async_trait]
pub trait IpResolver: Send + Sync {
    /// The public IP as seen from outside.
    async fn public_ip(&self) -> Result<String, Error>;
}

/// Pre-flight check run before a session is created (e.g. balance check).
pub trait Validator: Send + Sync {
    /// Decide whether this consumer may open a session on this proposal.
    fn validate(&self, consumer: &Identity, proposal: &ServiceProposal) -> Result<(), Error>;
}
