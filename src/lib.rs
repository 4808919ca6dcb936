//! # minidhcp
//!
//! A small IPv4 DHCP server implementing the Discover, Offer, Request, Ack
//! exchange of RFC 2131 with the RFC 2132 options a LAN client needs.
//!
//! ## Features
//!
//! - First-come MAC → IP leases that survive restarts
//! - Per-xid transaction tracking with a 30 second lifetime
//! - Background lease persistence to a JSON file (or memory only)
//! - Replies broadcast to both the limited and the directed broadcast address
//! - Async/await with Tokio
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use minidhcp::{Config, DhcpServer, Leases, storage};
//!
//! #[tokio::main]
//! async fn main() -> minidhcp::Result<()> {
//!     let config = Arc::new(Config::load("config.json")?);
//!     let backend = storage::open_backend(&config.storage)?;
//!     let leases = Arc::new(Leases::new(&config, backend).await?);
//!     let server = DhcpServer::new(config, leases).await?;
//!     server.run(async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`Config`] - Network, range, lease time, DNS and storage settings
//! - [`Leases`] - Thread-safe lease table with asynchronous persistence
//! - [`storage::LeaseBackend`] - Where lease rows are kept durably
//! - [`TransactionTable`] - In-flight exchanges keyed by xid
//! - [`DhcpServer`] - Listens on UDP port 67 and broadcasts replies
//! - [`DhcpPacket`] / [`DhcpOption`] - Wire codec

pub mod config;
pub mod error;
pub mod lease;
pub mod options;
pub mod packet;
pub mod server;
pub mod session;
pub mod storage;

pub use config::Config;
pub use error::{Error, Result};
pub use lease::{Lease, Leases, PersistenceWorker};
pub use options::{DhcpOption, MessageType};
pub use packet::{DhcpPacket, MacAddress};
pub use server::{Broadcaster, DhcpServer};
pub use session::{Transaction, TransactionTable};
