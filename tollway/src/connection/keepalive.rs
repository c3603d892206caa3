//! Control-channel keepalive loop.
//!
//! Proves channel liveness with periodic pings. A run of consecutive send
//! failures longer than the configured budget means the provider is
//! unreachable; the loop then signals the session as lost and stops,
//! equivalent to the tunnel process exiting.

use super::demux::SessionSignal;
use super::state::SessionId;
use crate::config::KeepAliveConfig;
use crate::p2p::{Channel, KeepAlivePing, Message, TOPIC_KEEP_ALIVE};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Upper bound on a single ping send before it counts as failed.
const SEND_TIMEOUT: Duration = Duration::from_secs(5);

pub(crate) struct KeepAliveLoop {
    channel: Arc<dyn Channel>,
    session_id: SessionId,
    config: KeepAliveConfig,
    signals: mpsc::UnboundedSender<SessionSignal>,
    cancel: CancellationToken,
}

impl KeepAliveLoop {
    pub(crate) fn new(
        channel: Arc<dyn Channel>,
        session_id: SessionId,
        config: KeepAliveConfig,
        signals: mpsc::UnboundedSender<SessionSignal>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            channel,
            session_id,
            config,
            signals,
            cancel,
        }
    }

    /// Run until cancelled or the failure budget is exhausted.
    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval(self.config.send_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        // The first tick of a tokio interval fires immediately; the session
        // just connected, so skip it and start pinging one interval in.
        ticker.tick().await;

        let mut consecutive_failures: u32 = 0;

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => {
                    if self.send_ping().await {
                        consecutive_failures = 0;
                    } else {
                        consecutive_failures += 1;
                        warn!(
                            consecutive_failures,
                            budget = self.config.max_send_err_count,
                            "keepalive send failed"
                        );
                        if consecutive_failures >= self.config.max_send_err_count {
                            let _ = self.signals.send(SessionSignal::KeepaliveExhausted);
                            break;
                        }
                    }
                }
            }
        }
        debug!("keepalive loop stopped");
    }

    async fn send_ping(&self) -> bool {
        let ping = KeepAlivePing {
            session_id: self.session_id.to_string(),
        };
        let message = match Message::encode(&ping) {
            Ok(message) => message,
            Err(e) => {
                warn!(error = %e, "keepalive ping encoding failed");
                return false;
            }
        };
        match tokio::time::timeout(SEND_TIMEOUT, self.channel.send(TOPIC_KEEP_ALIVE, &message))
            .await
        {
            Ok(Ok(_)) => true,
            Ok(Err(e)) => {
                debug!(error = %e, "keepalive send error");
                false
            }
            Err(_) => {
                debug!("keepalive send timed out");
                false
            }
        }
    }
}
