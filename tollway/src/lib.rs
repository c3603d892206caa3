//! Tollway - consumer-side connection core for paid peer-to-peer tunnels
//!
//! This library manages the lifecycle of one paid tunnel session: it dials
//! the provider's control channel, negotiates a session, runs a pluggable
//! tunnel connection, keeps the session observable (status snapshot + event
//! bus) and payable (payment issuer), and tears everything down cleanly.
//!
//! # High-Level API
//!
//! ```ignore
//! use tollway::config::Config;
//! use tollway::connection::{ConnectParams, Dependencies, Manager};
//!
//! let manager = Manager::new(dependencies, Config::new());
//!
//! manager
//!     .connect(consumer_id, hermes_id, proposal, ConnectParams::default())
//!     .await?;
//! println!("state: {}", manager.status().state);
//! manager.disconnect().await?;
//! ```
//!
//! Concrete tunnel implementations, the P2P transport, the payment engine
//! and the IP resolver are injected through the traits in [`connection`]
//! and [`p2p`].

pub mod config;
pub mod connection;
pub mod eventbus;
pub mod identity;
pub mod logging;
pub mod market;
pub mod p2p;
pub mod sleep;

/// Version of the Tollway library and CLI.
///
/// This is synchronized across all components in the workspace.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
