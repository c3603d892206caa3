//! Tollway CLI - Command-line interface
//!
//! This binary drives the Tollway connection core. The `demo` command wires
//! the manager to an in-process simulated provider stack and runs one full
//! connect → observe → disconnect cycle, which makes it a quick smoke test
//! of the whole session lifecycle without any real networking.

mod error;
mod sim;

use clap::{Parser, Subcommand};
use error::CliError;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use tollway::config::Config;
use tollway::connection::{ConnectParams, Dependencies, Manager, SessionEventKind};
use tollway::eventbus::EventBus;
use tollway::identity::{Address, Identity};
use tollway::market::{Contact, ServiceProposal};
use tollway::p2p::CONTACT_TYPE_V1;

#[derive(Parser)]
#[command(name = "tollway")]
#[command(version = tollway::VERSION)]
#[command(about = "Consumer-side paid tunnel client", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a full session lifecycle against a simulated provider
    Demo {
        /// How long to keep the session up, in seconds
        #[arg(long, default_value_t = 5)]
        duration_secs: u64,

        /// Directory for log files
        #[arg(long, default_value = "logs")]
        log_dir: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Demo {
            duration_secs,
            log_dir,
        } => run_demo(duration_secs, &log_dir).await,
    };

    if let Err(e) = result {
        e.exit();
    }
}

fn demo_proposal() -> ServiceProposal {
    ServiceProposal {
        provider_id: Identity::from_address("demo-provider"),
        provider_contacts: vec![Contact {
            contact_type: CONTACT_TYPE_V1.to_string(),
            definition: serde_json::Value::Null,
        }],
        service_type: "simulated".to_string(),
        service_definition: serde_json::Value::Null,
    }
}

async fn run_demo(duration_secs: u64, log_dir: &str) -> Result<(), CliError> {
    let _guard =
        tollway::logging::init_logging(log_dir, "tollway.log").map_err(CliError::LoggingInit)?;

    let bus = EventBus::new();
    spawn_event_printer(&bus);

    let manager = Manager::new(
        Dependencies {
            connection_factory: Arc::new(sim::SimConnectionFactory),
            payment_factory: Arc::new(sim::SimPaymentFactory),
            dialer: Arc::new(sim::SimDialer),
            ip_resolver: Arc::new(sim::SimResolver::new()),
            validator: Arc::new(sim::SimValidator),
            event_bus: bus.clone(),
        },
        Config::new().with_stats_report_interval(Duration::from_secs(1)),
    );

    info!("connecting to the simulated provider");
    manager
        .connect(
            Identity::from_address("demo-consumer"),
            Address::new("demo-hermes"),
            demo_proposal(),
            ConnectParams::default(),
        )
        .await?;

    let status = manager.status();
    info!(
        state = %status.state,
        session_id = %status.session_id,
        "session is up, holding for {duration_secs}s"
    );
    tokio::time::sleep(Duration::from_secs(duration_secs)).await;

    info!("disconnecting");
    manager.disconnect().await?;

    let status = manager.status();
    info!(state = %status.state, "demo finished");
    Ok(())
}

/// Print bus traffic so the demo shows what observers would see.
fn spawn_event_printer(bus: &EventBus) {
    let mut states = bus.subscribe_state();
    tokio::spawn(async move {
        while let Ok(event) = states.recv().await {
            info!(state = %event.state, session_id = %event.session.session_id, "state event");
        }
    });

    let mut sessions = bus.subscribe_session();
    tokio::spawn(async move {
        while let Ok(event) = sessions.recv().await {
            let kind = match event.kind {
                SessionEventKind::Created => "created",
                SessionEventKind::Ended => "ended",
            };
            info!(kind, session_id = %event.session.session_id, "session event");
        }
    });

    let mut stats = bus.subscribe_statistics();
    tokio::spawn(async move {
        while let Ok(event) = stats.recv().await {
            info!(
                received = event.stats.bytes_received,
                sent = event.stats.bytes_sent,
                "transfer statistics"
            );
        }
    });
}
