//! The connection manager.
//!
//! Public entry point of the crate: owns the session state machine, the
//! status snapshot and the lifecycle of every per-session task. One manager
//! runs at most one session at a time.
//!
//! # Lifecycle
//!
//! 1. **Connect**: dial the provider's control channel, validate, create the
//!    paid session, spawn the tunnel through the injected factory, start the
//!    payment issuer, then wait for the tunnel to report connected.
//! 2. **Operation**: the state demultiplexer drives tunnel-reported
//!    transitions; the statistics reporter, keepalive loop and IP probe run
//!    as children of the session's cancellation token.
//! 3. **Teardown**: disconnect (user call, provider exit, keepalive
//!    exhaustion or host wake) cancels the token, stops the issuer and the
//!    tunnel, waits for the exit with a bounded grace period, notifies the
//!    provider best-effort and joins every task it spawned.

use super::demux::{SessionSignal, StateDemultiplexer};
use super::error::Error;
use super::ip_probe::IpChangeProbe;
use super::keepalive::KeepAliveLoop;
use super::state::{
    ConnectParams, SessionEvent, SessionEventKind, SessionId, SessionInfo, State, StateEvent,
    Status,
};
use super::stats::StatsReporter;
use super::traits::{
    ConnectOptions, Connection, ConnectionFactory, IpResolver, PaymentIssuer,
    PaymentIssuerFactory, Validator,
};
use super::{read_status, write_status};
use crate::config::Config;
use crate::eventbus::EventBus;
use crate::identity::{Address, Identity};
use crate::market::ServiceProposal;
use crate::p2p::{
    self, Channel, ChannelError, Dialer, Message, SessionInfoMessage, SessionRequest,
    SessionResponse,
};
use crate::sleep;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock};
use std::time::{Duration, SystemTime};
use tokio::sync::{broadcast, mpsc, oneshot, watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Bounded wait for the best-effort session end notice and channel close.
const END_NOTICE_TIMEOUT: Duration = Duration::from_secs(2);

/// Clock used for `Status.started_at`; injectable for deterministic tests.
pub type TimeSource = Arc<dyn Fn() -> SystemTime + Send + Sync>;

/// External collaborators injected into the manager.
pub struct Dependencies {
    pub connection_factory: Arc<dyn ConnectionFactory>,
    pub payment_factory: Arc<dyn PaymentIssuerFactory>,
    pub dialer: Arc<dyn Dialer>,
    pub ip_resolver: Arc<dyn IpResolver>,
    pub validator: Arc<dyn Validator>,
    pub event_bus: EventBus,
}

/// The last connect request, replayed on wake-triggered reconnects.
#[derive(Clone)]
struct ConnectRequest {
    consumer: Identity,
    hermes: Address,
    proposal: ServiceProposal,
    params: ConnectParams,
}

/// What the control-operation slot currently holds.
enum Slot {
    /// No session, no connect in flight.
    Idle,
    /// A connect call is in flight; `cancel` aborts it and `done` latches
    /// once the call has fully unwound. `generation` identifies the owning
    /// connect call: a failed call rolls its status back before it re-takes
    /// the slot lock, so a newer connect may already occupy the slot by the
    /// time the old call returns, and only the owner may clear its entry.
    Connecting {
        generation: u64,
        cancel: CancellationToken,
        done: watch::Receiver<bool>,
    },
    /// An established session.
    Established(Box<ActiveSession>),
}

/// Every resource owned by an established session.
struct ActiveSession {
    cancel: CancellationToken,
    channel: Arc<dyn Channel>,
    connection: Arc<dyn Connection>,
    issuer: Arc<dyn PaymentIssuer>,
    issuer_task: JoinHandle<()>,
    demux_task: JoinHandle<()>,
    child_tasks: Vec<JoinHandle<()>>,
    exited: watch::Receiver<bool>,
    session: SessionInfo,
}

/// Resources alive between tunnel launch and the connected verdict.
struct RunningParts {
    channel: Arc<dyn Channel>,
    connection: Arc<dyn Connection>,
    issuer: Arc<dyn PaymentIssuer>,
    issuer_task: JoinHandle<()>,
    demux_task: JoinHandle<()>,
    exited: watch::Receiver<bool>,
}

/// Consumer-side manager of one paid tunnel session.
pub struct Manager {
    deps: Dependencies,
    config: Config,
    time_source: RwLock<TimeSource>,
    status: Arc<RwLock<Status>>,
    active: AsyncMutex<Slot>,
    connect_generation: AtomicU64,
    last_request: StdMutex<Option<ConnectRequest>>,
}

impl Manager {
    /// Create a manager and subscribe it to host wake notifications.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(deps: Dependencies, config: Config) -> Arc<Self> {
        let manager = Arc::new(Self {
            deps,
            config,
            time_source: RwLock::new(Arc::new(SystemTime::now) as TimeSource),
            status: Arc::new(RwLock::new(Status::default())),
            active: AsyncMutex::new(Slot::Idle),
            connect_generation: AtomicU64::new(0),
            last_request: StdMutex::new(None),
        });
        Self::spawn_sleep_consumer(&manager);
        manager
    }

    /// Replace the clock used for `Status.started_at`.
    pub fn set_time_source(&self, source: TimeSource) {
        *self
            .time_source
            .write()
            .unwrap_or_else(PoisonError::into_inner) = source;
    }

    /// Consistent snapshot of the manager. Never blocks on I/O.
    pub fn status(&self) -> Status {
        read_status(&self.status).clone()
    }

    /// Establish a session on `proposal` and block until the tunnel is up.
    ///
    /// Returns [`Error::AlreadyExists`] while any session exists,
    /// [`Error::Cancelled`] when a concurrent disconnect aborts the attempt,
    /// [`Error::Failed`] when the tunnel exits before connecting, and any
    /// upstream dial/validate/factory/start error verbatim.
    pub async fn connect(
        self: &Arc<Self>,
        consumer_id: Identity,
        hermes_id: Address,
        proposal: ServiceProposal,
        params: ConnectParams,
    ) -> Result<(), Error> {
        // Fast-fail without queueing behind a teardown in progress.
        if read_status(&self.status).state != State::NotConnected {
            return Err(Error::AlreadyExists);
        }

        let mut slot = self.active.lock().await;
        {
            let mut status = write_status(&self.status);
            if status.state != State::NotConnected {
                return Err(Error::AlreadyExists);
            }
            *status = Status {
                state: State::Connecting,
                started_at: Some(self.now()),
                consumer_id: consumer_id.clone(),
                hermes_id: hermes_id.clone(),
                session_id: SessionId::default(),
                proposal: Some(proposal.clone()),
            };
        }

        let request = ConnectRequest {
            consumer: consumer_id.clone(),
            hermes: hermes_id,
            proposal: proposal.clone(),
            params,
        };
        *self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(request.clone());

        let generation = self.connect_generation.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let (done_tx, done_rx) = watch::channel(false);
        *slot = Slot::Connecting {
            generation,
            cancel: cancel.clone(),
            done: done_rx,
        };
        drop(slot);

        let mut session = SessionInfo::new(consumer_id, proposal);
        self.deps.event_bus.publish_state(StateEvent {
            state: State::Connecting,
            session: session.clone(),
        });
        info!(provider = %request.proposal.provider_id, "connecting");

        let result = self.establish(&cancel, &request, &mut session).await;

        let mut slot = self.active.lock().await;
        let outcome = match result {
            Ok(active) => {
                if cancel.is_cancelled() {
                    // Disconnect raced the last establishment step; it is
                    // waiting on `done`, so unwind the session here.
                    debug!("connect cancelled at the finish line");
                    self.teardown(*active).await;
                    Err(Error::Cancelled)
                } else {
                    self.spawn_supervisor(cancel.clone(), active.exited.clone());
                    *slot = Slot::Established(active);
                    info!(session_id = %session.session_id, "connected");
                    Ok(())
                }
            }
            Err(e) => Err(e),
        };
        // A failed call rolled its status back before re-taking the lock, so
        // a newer connect may already have installed its own pending entry
        // here. Clear the slot only if it is still this call's.
        if matches!(&*slot, Slot::Connecting { generation: owner, .. } if *owner == generation) {
            *slot = Slot::Idle;
        }
        drop(slot);
        let _ = done_tx.send(true);
        outcome
    }

    /// Tear the current session down, or cancel an in-flight connect.
    ///
    /// Blocks until the tunnel has exited (bounded by a grace period) and
    /// every per-session task has joined. Returns [`Error::NoConnection`]
    /// when no session exists.
    pub async fn disconnect(&self) -> Result<(), Error> {
        if read_status(&self.status).state == State::NotConnected {
            return Err(Error::NoConnection);
        }

        let mut slot = self.active.lock().await;
        match std::mem::replace(&mut *slot, Slot::Idle) {
            Slot::Idle => {
                drop(slot);
                Err(Error::NoConnection)
            }
            Slot::Connecting {
                generation,
                cancel,
                done,
            } => {
                info!("cancelling in-flight connect");
                cancel.cancel();
                let mut wait = done.clone();
                *slot = Slot::Connecting {
                    generation,
                    cancel,
                    done,
                };
                drop(slot);
                while !*wait.borrow_and_update() {
                    if wait.changed().await.is_err() {
                        break;
                    }
                }
                Ok(())
            }
            Slot::Established(active) => {
                // The slot lock is held for the whole teardown: disconnect
                // happens-before the next connect's state transition.
                {
                    let mut status = write_status(&self.status);
                    status.state = State::Disconnecting;
                }
                self.deps.event_bus.publish_state(StateEvent {
                    state: State::Disconnecting,
                    session: active.session.clone(),
                });
                info!(session_id = %active.session.session_id, "disconnecting");
                self.teardown(*active).await;
                drop(slot);
                Ok(())
            }
        }
    }

    /// Recycle the session after a host wake: full disconnect, then connect
    /// with the last recorded request.
    pub(crate) async fn reconnect(self: &Arc<Self>) {
        let request = self
            .last_request
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let Some(request) = request else {
            debug!("no previous connect request to replay");
            return;
        };
        if let Err(e) = self.disconnect().await {
            debug!(error = %e, "nothing to disconnect before reconnect");
        }
        if let Err(e) = self
            .connect(
                request.consumer,
                request.hermes,
                request.proposal,
                request.params,
            )
            .await
        {
            warn!(error = %e, "reconnect after wake failed");
        }
    }

    fn now(&self) -> SystemTime {
        let source = self
            .time_source
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        source()
    }

    /// Run the connect sequence. On failure every resource acquired so far
    /// is released and the status rolled back before the error is returned.
    async fn establish(
        &self,
        cancel: &CancellationToken,
        request: &ConnectRequest,
        session: &mut SessionInfo,
    ) -> Result<Box<ActiveSession>, Error> {
        // Pre-connect egress baseline, best effort: a failed lookup means
        // any IP observed later counts as changed.
        let baseline = match with_cancel(cancel, self.deps.ip_resolver.public_ip()).await {
            Ok(ip) => ip,
            Err(Error::Cancelled) => {
                self.finish_session(session, false);
                return Err(Error::Cancelled);
            }
            Err(e) => {
                warn!(error = %e, "pre-connect IP lookup failed");
                String::new()
            }
        };

        let Some(contact) = request.proposal.contact_of_type(p2p::CONTACT_TYPE_V1) else {
            self.finish_session(session, false);
            return Err(Error::other(format!(
                "provider {} offers no {} contact",
                request.proposal.provider_id,
                p2p::CONTACT_TYPE_V1
            )));
        };

        let dialed = with_cancel(cancel, async {
            self.deps
                .dialer
                .dial(
                    &request.consumer,
                    &request.proposal.provider_id,
                    &request.proposal.service_type,
                    contact,
                )
                .await
                .map_err(Error::from)
        })
        .await;
        let channel = match dialed {
            Ok(channel) => channel,
            Err(e) => {
                self.finish_session(session, false);
                return Err(e);
            }
        };

        if let Err(e) = self
            .deps
            .validator
            .validate(&request.consumer, &request.proposal)
        {
            self.close_channel(&channel).await;
            self.finish_session(session, false);
            return Err(e);
        }

        let response = match self.create_session(cancel, &channel, request).await {
            Ok(response) => response,
            Err(e) => {
                self.close_channel(&channel).await;
                self.finish_session(session, false);
                return Err(e);
            }
        };
        let session_id = SessionId::new(response.id.clone());
        session.session_id = session_id.clone();
        write_status(&self.status).session_id = session_id.clone();
        self.deps.event_bus.publish_session(SessionEvent {
            kind: SessionEventKind::Created,
            session: session.clone(),
        });
        info!(session_id = %session_id, provider = %request.proposal.provider_id, "session created");

        let connection = match self
            .deps
            .connection_factory
            .create(&request.proposal.service_type)
        {
            Ok(connection) => connection,
            Err(e) => {
                self.close_channel(&channel).await;
                self.finish_session(session, true);
                return Err(e);
            }
        };

        // The demultiplexer must be consuming before the tunnel starts so
        // no state report is lost.
        let states = connection.state_stream();
        let (signals_tx, signals_rx) = mpsc::unbounded_channel();
        let (connected_tx, connected_rx) = oneshot::channel();
        let (exited_tx, exited_rx) = watch::channel(false);
        let demux = StateDemultiplexer::new(
            states,
            signals_rx,
            Arc::clone(&self.status),
            self.deps.event_bus.clone(),
            session.clone(),
            connected_tx,
            exited_tx,
        );
        let demux_task = tokio::spawn(demux.run());

        let issuer = match self.deps.payment_factory.create(
            Arc::clone(&channel),
            &request.consumer,
            &request.proposal.provider_id,
            &request.hermes,
            &request.proposal,
        ) {
            Ok(issuer) => issuer,
            Err(e) => {
                drop(connection);
                demux_task.abort();
                let _ = demux_task.await;
                self.close_channel(&channel).await;
                self.finish_session(session, true);
                return Err(e);
            }
        };
        issuer.set_session_id(&session_id);
        let issuer_task = tokio::spawn({
            let issuer = Arc::clone(&issuer);
            let signals = signals_tx.clone();
            let cancel = cancel.clone();
            async move {
                match issuer.start().await {
                    Ok(()) => debug!("payment issuer finished"),
                    Err(e) => warn!(error = %e, "payment issuer failed"),
                }
                if !cancel.is_cancelled() {
                    let _ = signals.send(SessionSignal::PaymentsHalted);
                }
            }
        });

        let parts = RunningParts {
            channel,
            connection,
            issuer,
            issuer_task,
            demux_task,
            exited: exited_rx,
        };

        let options = ConnectOptions {
            session_id: session_id.clone(),
            params: request.params.clone(),
            provider_config: response.config,
        };
        if let Err(e) = with_cancel(
            cancel,
            parts.connection.start(options, Arc::clone(&parts.channel)),
        )
        .await
        {
            self.rollback_running(cancel, parts, session).await;
            return Err(e);
        }

        // Wait for the tunnel's verdict: connected, exited, or cancelled.
        let verdict: Result<(), Error> = {
            let mut exited = parts.exited.clone();
            tokio::select! {
                biased;
                _ = cancel.cancelled() => Err(Error::Cancelled),
                _ = wait_for_exit(&mut exited) => Err(Error::Failed),
                joined = connected_rx => joined.map_err(|_| Error::Failed),
            }
        };
        if let Err(e) = verdict {
            self.rollback_running(cancel, parts, session).await;
            return Err(e);
        }

        let stats = StatsReporter::new(
            Arc::clone(&parts.connection),
            self.deps.event_bus.clone(),
            session.clone(),
            self.config.stats_report_interval,
            cancel.clone(),
        );
        let keepalive = KeepAliveLoop::new(
            Arc::clone(&parts.channel),
            session_id,
            self.config.keep_alive.clone(),
            signals_tx,
            cancel.clone(),
        );
        let probe = IpChangeProbe::new(
            Arc::clone(&self.deps.ip_resolver),
            Arc::clone(&parts.channel),
            self.deps.event_bus.clone(),
            session.clone(),
            baseline,
            self.config.ip_check.clone(),
            cancel.clone(),
        );
        let child_tasks = vec![
            tokio::spawn(stats.run()),
            tokio::spawn(keepalive.run()),
            tokio::spawn(probe.run()),
        ];

        Ok(Box::new(ActiveSession {
            cancel: cancel.clone(),
            channel: parts.channel,
            connection: parts.connection,
            issuer: parts.issuer,
            issuer_task: parts.issuer_task,
            demux_task: parts.demux_task,
            child_tasks,
            exited: parts.exited,
            session: session.clone(),
        }))
    }

    /// Send the session-create request and decode the provider's answer.
    async fn create_session(
        &self,
        cancel: &CancellationToken,
        channel: &Arc<dyn Channel>,
        request: &ConnectRequest,
    ) -> Result<SessionResponse, Error> {
        let body = SessionRequest {
            consumer_id: request.consumer.to_string(),
            hermes_id: request.hermes.to_string(),
            service_type: request.proposal.service_type.clone(),
        };
        let message = Message::encode(&body).map_err(Error::from)?;
        let reply = with_cancel(cancel, async {
            channel
                .send(p2p::TOPIC_SESSION_CREATE, &message)
                .await
                .map_err(Error::from)
        })
        .await?;
        let reply = reply.ok_or(Error::Channel(ChannelError::EmptyReply))?;
        reply.decode::<SessionResponse>().map_err(Error::from)
    }

    /// Unwind a session whose tunnel was already launched but which never
    /// reached the caller: no end notice is sent, only the session events.
    async fn rollback_running(
        &self,
        cancel: &CancellationToken,
        parts: RunningParts,
        session: &SessionInfo,
    ) {
        cancel.cancel();
        parts.issuer.stop().await;
        parts.connection.stop().await;
        self.await_exit(parts.exited, parts.demux_task).await;
        let _ = parts.issuer_task.await;
        self.close_channel(&parts.channel).await;
        self.finish_session(session, true);
    }

    /// Tear an established session down completely.
    async fn teardown(&self, active: ActiveSession) {
        let ActiveSession {
            cancel,
            channel,
            connection,
            issuer,
            issuer_task,
            demux_task,
            child_tasks,
            exited,
            mut session,
        } = active;

        cancel.cancel();
        issuer.stop().await;
        connection.stop().await;
        self.await_exit(exited, demux_task).await;

        // Best-effort end notice; the provider may already be gone.
        let notice = SessionInfoMessage {
            consumer_id: session.consumer_id.to_string(),
            session_id: session.session_id.to_string(),
        };
        match Message::encode(&notice) {
            Ok(message) => {
                match tokio::time::timeout(
                    END_NOTICE_TIMEOUT,
                    channel.send(p2p::TOPIC_SESSION_ACKNOWLEDGE, &message),
                )
                .await
                {
                    Ok(Ok(_)) => session.acknowledged = true,
                    Ok(Err(e)) => debug!(error = %e, "session end notice failed"),
                    Err(_) => debug!("session end notice timed out"),
                }
            }
            Err(e) => debug!(error = %e, "session end notice encoding failed"),
        }
        self.close_channel(&channel).await;

        let _ = issuer_task.await;
        for task in child_tasks {
            let _ = task.await;
        }

        self.finish_session(&session, true);
    }

    /// Wait for the tunnel exit with a bounded grace period, then join the
    /// demultiplexer (aborting it when the stream was abandoned).
    async fn await_exit(&self, mut exited: watch::Receiver<bool>, demux_task: JoinHandle<()>) {
        if tokio::time::timeout(self.config.disconnect_grace, wait_for_exit(&mut exited))
            .await
            .is_err()
        {
            warn!("tunnel did not report exit in time, abandoning state stream");
            demux_task.abort();
        }
        let _ = demux_task.await;
    }

    /// Final bookkeeping of a session: status back to `NotConnected` with
    /// the session id cleared (the other identifying fields stay observable
    /// post-mortem), then the state event and, when a session had been
    /// created, exactly one `SessionEnded`.
    fn finish_session(&self, session: &SessionInfo, session_created: bool) {
        {
            let mut status = write_status(&self.status);
            status.state = State::NotConnected;
            status.session_id = SessionId::default();
        }
        self.deps.event_bus.publish_state(StateEvent {
            state: State::NotConnected,
            session: session.clone(),
        });
        if session_created {
            self.deps.event_bus.publish_session(SessionEvent {
                kind: SessionEventKind::Ended,
                session: session.clone(),
            });
            info!(session_id = %session.session_id, "session ended");
        }
    }

    async fn close_channel(&self, channel: &Arc<dyn Channel>) {
        if let Err(e) = channel.close().await {
            debug!(error = %e, "channel close failed");
        }
    }

    /// Watch for a provider-side exit of an established session and turn it
    /// into a regular disconnect. Exits as soon as the session token is
    /// cancelled, so user-driven teardown never races it.
    fn spawn_supervisor(
        self: &Arc<Self>,
        cancel: CancellationToken,
        mut exited: watch::Receiver<bool>,
    ) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = wait_for_exit(&mut exited) => {
                    let Some(manager) = weak.upgrade() else { return };
                    info!("tunnel exited, tearing session down");
                    if let Err(e) = manager.disconnect().await {
                        debug!(error = %e, "session already torn down");
                    }
                }
            }
        });
    }

    /// React to host wake events by recycling the session. Dispatch is
    /// asynchronous so bus fanout can never deadlock the manager.
    fn spawn_sleep_consumer(manager: &Arc<Self>) {
        let mut events = manager.deps.event_bus.subscribe_sleep();
        let weak = Arc::downgrade(manager);
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        debug!(missed, "sleep notifications lagged");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                let Some(manager) = weak.upgrade() else { break };
                if event != sleep::Event::Wakeup {
                    continue;
                }
                let state = manager.status().state;
                match state {
                    State::Connected | State::Connecting | State::Reconnecting => {
                        info!("host woke up, recycling session");
                        manager.reconnect().await;
                    }
                    _ => debug!(%state, "wakeup ignored"),
                }
            }
        });
    }
}

/// Run `operation` unless the session is cancelled first.
async fn with_cancel<T>(
    cancel: &CancellationToken,
    operation: impl Future<Output = Result<T, Error>>,
) -> Result<T, Error> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(Error::Cancelled),
        result = operation => result,
    }
}

/// Resolve once the exit latch is set (or its writer is gone, which means
/// the stream can no longer report an exit at all).
async fn wait_for_exit(exited: &mut watch::Receiver<bool>) {
    while !*exited.borrow_and_update() {
        if exited.changed().await.is_err() {
            return;
        }
    }
}
