//! Periodic statistics reporting for an active session.

use super::state::{SessionInfo, StatisticsEvent};
use super::traits::Connection;
use crate::eventbus::EventBus;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pulls statistics from the connection on a fixed cadence and publishes
/// them to the bus. Statistics are advisory: a connection that cannot
/// report is logged and retried on the next tick, never fatal.
pub(crate) struct StatsReporter {
    connection: Arc<dyn Connection>,
    bus: EventBus,
    session: SessionInfo,
    interval: Duration,
    cancel: CancellationToken,
}

impl StatsReporter {
    pub(crate) fn new(
        connection: Arc<dyn Connection>,
        bus: EventBus,
        session: SessionInfo,
        interval: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            connection,
            bus,
            session,
            interval,
            cancel,
        }
    }

    /// Run until the session is cancelled.
    pub(crate) async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                biased;

                _ = self.cancel.cancelled() => break,

                _ = ticker.tick() => match self.connection.statistics() {
                    Ok(stats) => self.bus.publish_statistics(StatisticsEvent {
                        stats,
                        session: self.session.clone(),
                    }),
                    Err(e) => debug!(error = %e, "connection statistics unavailable"),
                },
            }
        }
        debug!("statistics reporter stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::error::Error;
    use crate::connection::state::{SessionId, Statistics, TunnelState};
    use crate::connection::traits::ConnectOptions;
    use crate::identity::Identity;
    use crate::market::ServiceProposal;
    use crate::p2p::Channel;
    use async_trait::async_trait;
    use tokio::sync::mpsc;

    struct FixedStatsConnection {
        stats: Statistics,
    }

    #[async_trait]
    impl Connection for FixedStatsConnection {
        fn state_stream(&self) -> mpsc::UnboundedReceiver<TunnelState> {
            mpsc::unbounded_channel().1
        }

        async fn start(
            &self,
            _options: ConnectOptions,
            _channel: Arc<dyn Channel>,
        ) -> Result<(), Error> {
            Ok(())
        }

        async fn stop(&self) {}

        fn statistics(&self) -> Result<Statistics, Error> {
            Ok(self.stats)
        }
    }

    fn session_info() -> SessionInfo {
        SessionInfo {
            consumer_id: Identity::from_address("identity-1"),
            session_id: SessionId::new("session-100"),
            proposal: ServiceProposal::default(),
            acknowledged: false,
        }
    }

    #[tokio::test]
    async fn publishes_statistics_until_cancelled() {
        let stats = Statistics {
            bytes_received: 10,
            bytes_sent: 20,
            duration: Duration::from_secs(1),
        };
        let bus = EventBus::new();
        let mut events = bus.subscribe_statistics();
        let cancel = CancellationToken::new();

        let reporter = StatsReporter::new(
            Arc::new(FixedStatsConnection { stats }),
            bus,
            session_info(),
            Duration::from_millis(1),
            cancel.clone(),
        );
        let task = tokio::spawn(reporter.run());

        let event = events.recv().await.unwrap();
        assert_eq!(event.stats, stats);
        assert_eq!(event.session.session_id, SessionId::new("session-100"));

        cancel.cancel();
        task.await.unwrap();
    }
}
