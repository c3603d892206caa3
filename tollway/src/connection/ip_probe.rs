//! Public IP change verification.
//!
//! After the tunnel reports connected, egress traffic should leave through
//! the provider, observable as a changed public IP. The probe polls the
//! resolver a bounded number of times and reports the verdict to the
//! provider over the control channel so both sides can diagnose a tunnel
//! that came up but routes nothing. It never tears the session down itself.

use super::state::{SessionInfo, State, StateEvent};
use super::traits::IpResolver;
use crate::config::IpCheckConfig;
use crate::eventbus::EventBus;
use crate::p2p::{Channel, Message, SessionStatus, StatusCode, TOPIC_SESSION_STATUS};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub(crate) struct IpChangeProbe {
    resolver: Arc<dyn IpResolver>,
    channel: Arc<dyn Channel>,
    bus: EventBus,
    session: SessionInfo,
    /// Public IP observed before the tunnel came up. Empty when the
    /// pre-connect lookup failed; any observed IP then counts as changed.
    baseline: String,
    config: IpCheckConfig,
    cancel: CancellationToken,
}

impl IpChangeProbe {
    pub(crate) fn new(
        resolver: Arc<dyn IpResolver>,
        channel: Arc<dyn Channel>,
        bus: EventBus,
        session: SessionInfo,
        baseline: String,
        config: IpCheckConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            resolver,
            channel,
            bus,
            session,
            baseline,
            config,
            cancel,
        }
    }

    /// Probe until the IP changes, the attempts run out, or the session is
    /// cancelled.
    pub(crate) async fn run(self) {
        for attempt in 1..=self.config.max_attempts {
            if self.cancel.is_cancelled() {
                return;
            }

            match self.resolver.public_ip().await {
                Ok(ip) if ip != self.baseline => {
                    info!(%ip, baseline = %self.baseline, "egress IP changed");
                    self.send_status(StatusCode::ConnectionOk).await;
                    return;
                }
                Ok(ip) => {
                    debug!(%ip, attempt, "egress IP unchanged");
                }
                Err(e) => {
                    warn!(error = %e, attempt, "public IP lookup failed");
                }
            }

            if attempt < self.config.max_attempts {
                tokio::select! {
                    _ = self.cancel.cancelled() => return,
                    _ = tokio::time::sleep(self.config.sleep_duration_after_check) => {}
                }
            }
        }

        info!(
            attempts = self.config.max_attempts,
            "egress IP did not change"
        );
        self.bus.publish_state(StateEvent {
            state: State::IpNotChanged,
            session: self.session.clone(),
        });
        self.send_status(StatusCode::SessionIpNotChanged).await;
    }

    async fn send_status(&self, code: StatusCode) {
        let status = SessionStatus {
            consumer_id: self.session.consumer_id.to_string(),
            session_id: self.session.session_id.to_string(),
            code: code.code(),
            message: String::new(),
        };
        let message = match Message::encode(&status) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "session status encoding failed");
                return;
            }
        };
        if let Err(e) = self.channel.send(TOPIC_SESSION_STATUS, &message).await {
            warn!(error = %e, "session status report failed");
        }
    }
}
