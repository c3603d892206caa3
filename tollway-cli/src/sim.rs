//! In-process simulated provider stack.
//!
//! Backs the `demo` command: a loopback control channel, a tunnel that
//! walks the establishment states on a timer, a payment issuer that ticks
//! until stopped, and a resolver whose reported IP changes once the tunnel
//! is up. No real networking happens; the point is to drive the whole
//! manager lifecycle end to end.

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, watch};
use tracing::{debug, info};

use tollway::connection::{
    ConnectOptions, Connection, ConnectionFactory, Error, IpResolver, PaymentIssuer,
    PaymentIssuerFactory, SessionId, Statistics, TunnelState, Validator,
};
use tollway::identity::{Address, Identity};
use tollway::market::ServiceProposal;
use tollway::p2p::{
    Channel, ChannelError, Dialer, HandlerFn, Message, SessionResponse, SessionStatus,
    TOPIC_KEEP_ALIVE, TOPIC_SESSION_ACKNOWLEDGE, TOPIC_SESSION_CREATE, TOPIC_SESSION_STATUS,
};

/// Delay between simulated tunnel state transitions.
const STATE_STEP: Duration = Duration::from_millis(120);

/// Simulated downlink rate for the statistics counters.
const BYTES_RECEIVED_PER_SEC: u64 = 384_000;
/// Simulated uplink rate for the statistics counters.
const BYTES_SENT_PER_SEC: u64 = 96_000;

// ============================================================================
// Control Channel
// ============================================================================

/// Loopback control channel playing the provider's side.
#[derive(Default)]
pub struct SimChannel;

#[async_trait]
impl Channel for SimChannel {
    async fn send(&self, topic: &str, message: &Message) -> Result<Option<Message>, ChannelError> {
        match topic {
            TOPIC_SESSION_CREATE => {
                let response = SessionResponse {
                    id: "demo-session-1".to_string(),
                    config: Vec::new(),
                };
                Ok(Some(Message::encode(&response)?))
            }
            TOPIC_SESSION_STATUS => {
                let status: SessionStatus = message.decode()?;
                info!(code = status.code, "provider received session status");
                Ok(None)
            }
            TOPIC_SESSION_ACKNOWLEDGE => {
                info!("provider received session end notice");
                Ok(None)
            }
            TOPIC_KEEP_ALIVE => Ok(None),
            other => Err(ChannelError::Send {
                topic: other.to_string(),
                reason: "unknown topic".to_string(),
            }),
        }
    }

    fn handle(&self, _topic: &str, _handler: HandlerFn) {}

    async fn close(&self) -> Result<(), ChannelError> {
        Ok(())
    }
}

/// Dialer that always reaches the simulated provider.
pub struct SimDialer;

#[async_trait]
impl Dialer for SimDialer {
    async fn dial(
        &self,
        _consumer: &Identity,
        provider: &Identity,
        _service_type: &str,
        _contact: &tollway::market::Contact,
    ) -> Result<Arc<dyn Channel>, ChannelError> {
        debug!(%provider, "dialing simulated provider");
        tokio::time::sleep(Duration::from_millis(50)).await;
        Ok(Arc::new(SimChannel) as Arc<dyn Channel>)
    }
}

// ============================================================================
// Tunnel
// ============================================================================

/// Tunnel that walks the establishment states on a timer.
pub struct SimConnection {
    state_tx: Mutex<Option<mpsc::UnboundedSender<TunnelState>>>,
    started_at: Mutex<Option<Instant>>,
}

impl SimConnection {
    fn new() -> Self {
        Self {
            state_tx: Mutex::new(None),
            started_at: Mutex::new(None),
        }
    }

    fn report(&self, state: TunnelState) {
        if let Some(tx) = self.state_tx.lock().unwrap().as_ref() {
            let _ = tx.send(state);
        }
    }
}

#[async_trait]
impl Connection for SimConnection {
    fn state_stream(&self) -> mpsc::UnboundedReceiver<TunnelState> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.state_tx.lock().unwrap() = Some(tx);
        rx
    }

    async fn start(&self, options: ConnectOptions, _channel: Arc<dyn Channel>) -> Result<(), Error> {
        info!(session_id = %options.session_id, "simulated tunnel starting");
        let establishment = [
            TunnelState::ProcessStarted,
            TunnelState::ConnectingState,
            TunnelState::AuthenticatingState,
            TunnelState::GetConfigState,
            TunnelState::AssignIpState,
            TunnelState::ConnectedState,
        ];
        for state in establishment {
            tokio::time::sleep(STATE_STEP).await;
            self.report(state);
        }
        *self.started_at.lock().unwrap() = Some(Instant::now());
        Ok(())
    }

    async fn stop(&self) {
        info!("simulated tunnel stopping");
        self.report(TunnelState::ExitingState);
        self.report(TunnelState::ProcessExited);
    }

    fn statistics(&self) -> Result<Statistics, Error> {
        let uptime = self
            .started_at
            .lock()
            .unwrap()
            .map(|started| started.elapsed())
            .unwrap_or_default();
        let secs = uptime.as_secs_f64();
        Ok(Statistics {
            bytes_received: (secs * BYTES_RECEIVED_PER_SEC as f64) as u64,
            bytes_sent: (secs * BYTES_SENT_PER_SEC as f64) as u64,
            duration: uptime,
        })
    }
}

/// Factory producing one simulated tunnel per session.
pub struct SimConnectionFactory;

impl ConnectionFactory for SimConnectionFactory {
    fn create(&self, service_type: &str) -> Result<Arc<dyn Connection>, Error> {
        debug!(service_type, "creating simulated connection");
        Ok(Arc::new(SimConnection::new()) as Arc<dyn Connection>)
    }
}

// ============================================================================
// Payments
// ============================================================================

/// Payment issuer that ticks until stopped.
pub struct SimPaymentIssuer {
    stop_tx: watch::Sender<bool>,
    session_id: Mutex<Option<SessionId>>,
}

#[async_trait]
impl PaymentIssuer for SimPaymentIssuer {
    async fn start(&self) -> Result<(), Error> {
        let mut stopped = self.stop_tx.subscribe();
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        ticker.tick().await;
        let mut issued: u32 = 0;
        loop {
            tokio::select! {
                changed = stopped.changed() => {
                    if changed.is_err() || *stopped.borrow() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    issued += 1;
                    let session = self.session_id.lock().unwrap().clone();
                    debug!(issued, session_id = ?session, "payment issued");
                }
            }
        }
        info!(issued, "payment issuer stopped");
        Ok(())
    }

    async fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    fn set_session_id(&self, session_id: &SessionId) {
        *self.session_id.lock().unwrap() = Some(session_id.clone());
    }
}

/// Factory producing one simulated issuer per session.
pub struct SimPaymentFactory;

impl PaymentIssuerFactory for SimPaymentFactory {
    fn create(
        &self,
        _channel: Arc<dyn Channel>,
        consumer: &Identity,
        provider: &Identity,
        _hermes: &Address,
        _proposal: &ServiceProposal,
    ) -> Result<Arc<dyn PaymentIssuer>, Error> {
        debug!(%consumer, %provider, "creating simulated payment issuer");
        let (stop_tx, _) = watch::channel(false);
        Ok(Arc::new(SimPaymentIssuer {
            stop_tx,
            session_id: Mutex::new(None),
        }) as Arc<dyn PaymentIssuer>)
    }
}

// ============================================================================
// Resolver & Validator
// ============================================================================

/// Resolver whose answer flips once the tunnel is expected to be up: the
/// first lookup (the pre-connect baseline) sees the residential IP, every
/// later one the provider's egress.
pub struct SimResolver {
    calls: AtomicU32,
}

impl SimResolver {
    pub fn new() -> Self {
        Self {
            calls: AtomicU32::new(0),
        }
    }
}

#[async_trait]
impl IpResolver for SimResolver {
    async fn public_ip(&self) -> Result<String, Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call == 0 {
            Ok("198.51.100.10".to_string())
        } else {
            Ok("203.0.113.7".to_string())
        }
    }
}

/// Validator that accepts every consumer.
pub struct SimValidator;

impl Validator for SimValidator {
    fn validate(&self, consumer: &Identity, _proposal: &ServiceProposal) -> Result<(), Error> {
        debug!(%consumer, "validating consumer");
        Ok(())
    }
}
