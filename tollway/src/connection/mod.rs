//! The connection core: session state machine and its per-session tasks.
//!
//! [`Manager`] is the public entry point. Around it:
//!
//! - `demux`: translates tunnel-level states into manager state
//! - `stats`: pumps transfer statistics onto the event bus
//! - `ip_probe`: verifies that egress traffic moved to the provider
//! - `keepalive`: proves control-channel liveness
//!
//! All per-session tasks hang off one `CancellationToken` owned by the
//! session; a disconnect cancels it and joins everything before returning.

mod demux;
mod error;
mod ip_probe;
mod keepalive;
mod manager;
mod state;
mod stats;
mod traits;

pub use error::{BoxedError, Error};
pub use manager::{Dependencies, Manager, TimeSource};
pub use state::{
    ConnectParams, SessionEvent, SessionEventKind, SessionId, SessionInfo, State, StateEvent,
    Statistics, StatisticsEvent, Status, TunnelState,
};
pub use traits::{
    ConnectOptions, Connection, ConnectionFactory, IpResolver, PaymentIssuer,
    PaymentIssuerFactory, Validator,
};

use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

/// Read the status, recovering from a poisoned lock; the snapshot is plain
/// data, always valid to read.
pub(crate) fn read_status(status: &RwLock<Status>) -> RwLockReadGuard<'_, Status> {
    status.read().unwrap_or_else(PoisonError::into_inner)
}

/// Write the status, recovering from a poisoned lock.
pub(crate) fn write_status(status: &RwLock<Status>) -> RwLockWriteGuard<'_, Status> {
    status.write().unwrap_or_else(PoisonError::into_inner)
}
