//! Session state model and event payloads.
//!
//! Two levels of state coexist: the manager's [`State`] (the closed set the
//! public API reports) and the tunnel implementation's [`TunnelState`]
//! (whatever the underlying process goes through while establishing). The
//! state demultiplexer maps the latter onto the former.

use crate::identity::{Address, Identity};
use crate::market::ServiceProposal;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime};

/// Identifier of one negotiated session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Wrap a raw session identifier.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// The raw identifier.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// True until the remote has accepted session-create.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Manager-level connection state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum State {
    /// No session exists.
    #[default]
    NotConnected,
    /// A session is being established.
    Connecting,
    /// The tunnel is up and verified.
    Connected,
    /// The tunnel dropped and is re-establishing on its own.
    Reconnecting,
    /// Teardown is in progress.
    Disconnecting,
    /// Advisory only: the public IP did not change after connecting.
    /// Emitted as an event while the state variable stays `Connected`.
    IpNotChanged,
}

impl State {
    /// Stable name used in logs and event payloads.
    pub fn as_str(&self) -> &'static str {
        match self {
            State::NotConnected => "NotConnected",
            State::Connecting => "Connecting",
            State::Connected => "Connected",
            State::Reconnecting => "Reconnecting",
            State::Disconnecting => "Disconnecting",
            State::IpNotChanged => "IPNotChanged",
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tunnel-implementation-level state, as reported on the state stream.
///
/// The sequence is ordered and finite: `ProcessExited` is terminal and the
/// stream closes after it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TunnelState {
    ProcessStarted,
    ConnectingState,
    WaitState,
    AuthenticatingState,
    GetConfigState,
    AssignIpState,
    ConnectedState,
    ReconnectingState,
    ExitingState,
    ProcessExited,
}

impl TunnelState {
    /// Stable name used in debug logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            TunnelState::ProcessStarted => "ProcessStarted",
            TunnelState::ConnectingState => "Connecting",
            TunnelState::WaitState => "Wait",
            TunnelState::AuthenticatingState => "Authenticating",
            TunnelState::GetConfigState => "GetConfig",
            TunnelState::AssignIpState => "AssignIP",
            TunnelState::ConnectedState => "Connected",
            TunnelState::ReconnectingState => "Reconnecting",
            TunnelState::ExitingState => "Exiting",
            TunnelState::ProcessExited => "ProcessExited",
        }
    }
}

impl fmt::Display for TunnelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Transfer statistics pulled from the active connection.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Statistics {
    /// Bytes received through the tunnel.
    pub bytes_received: u64,
    /// Bytes sent through the tunnel.
    pub bytes_sent: u64,
    /// How long the tunnel has been up.
    pub duration: Duration,
}

/// Per-connection options recognized by tunnel implementations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectParams {
    /// DNS override policy, passed opaquely to the tunnel. `None` means
    /// system default.
    pub dns_config: Option<String>,
    /// When true, tunnel failure does not block the default route.
    pub disable_kill_switch: bool,
}

/// Public snapshot of the manager, returned by value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Status {
    /// Current manager state.
    pub state: State,
    /// When the last connect attempt started. `None` on a fresh manager.
    pub started_at: Option<SystemTime>,
    /// Consumer identity of the last session.
    pub consumer_id: Identity,
    /// Hermes address of the last session.
    pub hermes_id: Address,
    /// Session id; empty until the remote accepted session-create and
    /// cleared again once the session ended.
    pub session_id: SessionId,
    /// Proposal the last session was built from.
    pub proposal: Option<ServiceProposal>,
}

/// Identifying facts of one session, carried by every event it produces.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionInfo {
    /// Consumer identity that opened the session.
    pub consumer_id: Identity,
    /// Remote-assigned session id; empty until session-create succeeded.
    pub session_id: SessionId,
    /// Proposal the session was built from.
    pub proposal: ServiceProposal,
    /// Whether the end notice reached the channel during teardown.
    pub acknowledged: bool,
}

impl SessionInfo {
    /// Session info for a connect attempt that has no session id yet.
    pub fn new(consumer_id: Identity, proposal: ServiceProposal) -> Self {
        Self {
            consumer_id,
            session_id: SessionId::default(),
            proposal,
            acknowledged: false,
        }
    }
}

/// Lifecycle phase reported by [`SessionEvent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEventKind {
    /// The remote accepted session-create.
    Created,
    /// The session ended; no further events for it will follow.
    Ended,
}

/// Published on every manager state transition (and for the advisory
/// [`State::IpNotChanged`] notification).
#[derive(Debug, Clone, PartialEq)]
pub struct StateEvent {
    pub state: State,
    pub session: SessionInfo,
}

/// Published on every statistics report of an active session.
#[derive(Debug, Clone, PartialEq)]
pub struct StatisticsEvent {
    pub stats: Statistics,
    pub session: SessionInfo,
}

/// Published when a session is created and exactly once when it ends.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionEvent {
    pub kind: SessionEventKind,
    pub session: SessionInfo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fresh_status_reports_not_connected() {
        let status = Status::default();
        assert_eq!(status.state, State::NotConnected);
        assert!(status.started_at.is_none());
        assert!(status.session_id.is_empty());
        assert!(status.proposal.is_none());
    }

    #[test]
    fn state_names_are_stable() {
        assert_eq!(State::NotConnected.as_str(), "NotConnected");
        assert_eq!(State::IpNotChanged.as_str(), "IPNotChanged");
        assert_eq!(TunnelState::AssignIpState.as_str(), "AssignIP");
    }

    #[test]
    fn session_info_starts_unacknowledged() {
        let info = SessionInfo::new(
            Identity::from_address("identity-1"),
            ServiceProposal::default(),
        );
        assert!(info.session_id.is_empty());
        assert!(!info.acknowledged);
    }
}
