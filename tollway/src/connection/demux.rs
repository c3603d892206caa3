//! Tunnel state demultiplexer.
//!
//! Consumes the connection's state stream and drives the manager's state
//! machine. This task is the sole writer of `Status.state` for
//! tunnel-driven transitions; connect and disconnect coordinate with it
//! through the session's cancellation token, the connected signal and the
//! exit latch, never by touching the stream themselves.

use super::state::{SessionInfo, State, StateEvent, Status, TunnelState};
use super::write_status;
use crate::eventbus::EventBus;
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, warn};

/// Out-of-band signals that end a session the same way a tunnel exit does.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum SessionSignal {
    /// The keepalive loop exhausted its consecutive-failure budget.
    KeepaliveExhausted,
    /// The payment issuer returned before it was asked to stop.
    PaymentsHalted,
}

/// Per-session task translating tunnel states into manager state.
pub(crate) struct StateDemultiplexer {
    states: mpsc::UnboundedReceiver<TunnelState>,
    signals: mpsc::UnboundedReceiver<SessionSignal>,
    status: Arc<RwLock<Status>>,
    bus: EventBus,
    session: SessionInfo,
    connected_tx: Option<oneshot::Sender<()>>,
    exited_tx: watch::Sender<bool>,
}

impl StateDemultiplexer {
    pub(crate) fn new(
        states: mpsc::UnboundedReceiver<TunnelState>,
        signals: mpsc::UnboundedReceiver<SessionSignal>,
        status: Arc<RwLock<Status>>,
        bus: EventBus,
        session: SessionInfo,
        connected_tx: oneshot::Sender<()>,
        exited_tx: watch::Sender<bool>,
    ) -> Self {
        Self {
            states,
            signals,
            status,
            bus,
            session,
            connected_tx: Some(connected_tx),
            exited_tx,
        }
    }

    /// Run until the tunnel exits or the state stream closes.
    pub(crate) async fn run(mut self) {
        loop {
            tokio::select! {
                state = self.states.recv() => match state {
                    Some(TunnelState::ProcessExited) => {
                        debug!("tunnel process exited");
                        break;
                    }
                    Some(state) => self.on_tunnel_state(state),
                    None => break,
                },
                Some(signal) = self.signals.recv() => self.on_signal(signal),
            }
        }
        // The stream is gone; whatever happened, nobody should keep waiting
        // for an exit that can no longer be observed.
        let _ = self.exited_tx.send(true);
        debug!("state demultiplexer stopped");
    }

    fn on_tunnel_state(&mut self, state: TunnelState) {
        debug!(tunnel_state = %state, "tunnel state received");
        match state {
            TunnelState::ConnectedState => {
                let accepted = {
                    let mut status = write_status(&self.status);
                    match status.state {
                        State::Connecting | State::Reconnecting => {
                            status.state = State::Connected;
                            true
                        }
                        State::Connected => true,
                        _ => false,
                    }
                };
                if accepted {
                    if let Some(tx) = self.connected_tx.take() {
                        let _ = tx.send(());
                    }
                    self.bus.publish_state(StateEvent {
                        state: State::Connected,
                        session: self.session.clone(),
                    });
                }
            }
            TunnelState::ReconnectingState => {
                let accepted = {
                    let mut status = write_status(&self.status);
                    if status.state == State::Connected {
                        status.state = State::Reconnecting;
                        true
                    } else {
                        false
                    }
                };
                if accepted {
                    self.bus.publish_state(StateEvent {
                        state: State::Reconnecting,
                        session: self.session.clone(),
                    });
                }
            }
            TunnelState::ExitingState => {
                // Teardown is driven by stop()/ProcessExited; nothing to do.
            }
            TunnelState::ProcessExited => {
                // Handled in the run loop; terminal.
            }
            establishing => {
                // Establishment-phase states are informational. The public
                // state set is closed, so they surface as Connecting events
                // while the raw name goes to the debug log above.
                let connecting = {
                    let status = super::read_status(&self.status);
                    status.state == State::Connecting
                };
                if connecting {
                    debug!(tunnel_state = %establishing, "establishment progress");
                    self.bus.publish_state(StateEvent {
                        state: State::Connecting,
                        session: self.session.clone(),
                    });
                }
            }
        }
    }

    fn on_signal(&mut self, signal: SessionSignal) {
        match signal {
            SessionSignal::KeepaliveExhausted => {
                warn!("keepalive exhausted, treating tunnel as lost")
            }
            SessionSignal::PaymentsHalted => {
                warn!("payment issuer halted, treating session as failed")
            }
        }
        let _ = self.exited_tx.send(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::Identity;
    use crate::market::ServiceProposal;
    use tokio::sync::broadcast::error::TryRecvError;

    struct Harness {
        states_tx: mpsc::UnboundedSender<TunnelState>,
        signals_tx: mpsc::UnboundedSender<SessionSignal>,
        status: Arc<RwLock<Status>>,
        bus: EventBus,
        connected_rx: oneshot::Receiver<()>,
        exited_rx: watch::Receiver<bool>,
        task: tokio::task::JoinHandle<()>,
    }

    fn spawn_demux(initial: State) -> Harness {
        let (states_tx, states_rx) = mpsc::unbounded_channel();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let status = Arc::new(RwLock::new(Status {
            state: initial,
            ..Status::default()
        }));
        let bus = EventBus::new();
        let session = SessionInfo::new(
            Identity::from_address("identity-1"),
            ServiceProposal::default(),
        );
        let demux = StateDemultiplexer::new(
            states_rx,
            signals_rx,
            Arc::clone(&status),
            bus.clone(),
            session,
            connected_tx,
            exited_tx,
        );
        let task = tokio::spawn(demux.run());
        Harness {
            states_tx,
            signals_tx,
            status,
            bus,
            connected_rx,
            exited_rx,
            task,
        }
    }

    fn state_of(status: &Arc<RwLock<Status>>) -> State {
        status.read().unwrap().state
    }

    #[tokio::test]
    async fn connected_state_completes_the_connect_wait() {
        let harness = spawn_demux(State::Connecting);
        let mut events = harness.bus.subscribe_state();

        harness
            .states_tx
            .send(TunnelState::ConnectedState)
            .unwrap();

        harness.connected_rx.await.unwrap();
        assert_eq!(events.recv().await.unwrap().state, State::Connected);
        assert_eq!(state_of(&harness.status), State::Connected);

        drop(harness.states_tx);
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn reconnecting_then_connected_round_trips() {
        let harness = spawn_demux(State::Connecting);
        let mut events = harness.bus.subscribe_state();

        harness
            .states_tx
            .send(TunnelState::ConnectedState)
            .unwrap();
        harness
            .states_tx
            .send(TunnelState::ReconnectingState)
            .unwrap();
        harness
            .states_tx
            .send(TunnelState::ConnectedState)
            .unwrap();

        assert_eq!(events.recv().await.unwrap().state, State::Connected);
        assert_eq!(events.recv().await.unwrap().state, State::Reconnecting);
        assert_eq!(events.recv().await.unwrap().state, State::Connected);
        assert_eq!(state_of(&harness.status), State::Connected);

        drop(harness.states_tx);
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn process_exit_sets_the_latch_without_touching_state() {
        let mut harness = spawn_demux(State::Connecting);

        harness.states_tx.send(TunnelState::ProcessExited).unwrap();

        harness.exited_rx.changed().await.unwrap();
        assert!(*harness.exited_rx.borrow());
        assert_eq!(state_of(&harness.status), State::Connecting);

        drop(harness.states_tx);
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn keepalive_exhaustion_is_equivalent_to_exit() {
        let mut harness = spawn_demux(State::Connected);

        harness
            .signals_tx
            .send(SessionSignal::KeepaliveExhausted)
            .unwrap();

        harness.exited_rx.changed().await.unwrap();
        assert!(*harness.exited_rx.borrow());

        drop(harness.states_tx);
        harness.task.await.unwrap();
    }

    #[tokio::test]
    async fn establishment_states_publish_connecting_only_while_connecting() {
        let harness = spawn_demux(State::Connecting);
        let mut events = harness.bus.subscribe_state();

        harness
            .states_tx
            .send(TunnelState::AuthenticatingState)
            .unwrap();
        harness
            .states_tx
            .send(TunnelState::ConnectedState)
            .unwrap();
        // Connected now; further establishment chatter is ignored.
        harness.states_tx.send(TunnelState::WaitState).unwrap();
        drop(harness.states_tx);
        harness.task.await.unwrap();

        assert_eq!(events.recv().await.unwrap().state, State::Connecting);
        assert_eq!(events.recv().await.unwrap().state, State::Connected);
        assert!(matches!(events.try_recv(), Err(TryRecvError::Empty)));
    }

    #[tokio::test]
    async fn stream_close_releases_waiters() {
        let mut harness = spawn_demux(State::Connecting);

        drop(harness.states_tx);
        harness.task.await.unwrap();

        assert!(*harness.exited_rx.borrow_and_update());
        assert!(harness.connected_rx.await.is_err());
    }
}
