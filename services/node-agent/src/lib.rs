//! MangoFaaS node agent library.
//!
//! The node agent runs on each worker host. It consumes invocation requests
//! from Kafka, runs each one inside a Firecracker microVM leased from a
//! local pool, and produces the function's response to the reply topic.
//!
//! ## Architecture
//!
//! ```text
//! KafkaRequestReader ──> PartitionRouter ──> Dispatcher
//!                                              ├── ProcessPool (VMs, network, bridge)
//!                                              ├── ImageService (rootfs, kernel, overlay)
//!                                              └── PendingRequestStore <── VM bridge (/next, /response)
//! ```
//!
//! ## Modules
//!
//! - `pool`: microVM process pool, leases and supervision
//! - `network`: per-VM TAP devices, /30 address pairs, NAT rules
//! - `firecracker`: control-socket API client and device configuration
//! - `bridge`: per-VM HTTP server the guest polls for work
//! - `store`: per-function request queues and correlation map
//! - `image`: image download, decompression and cache
//! - `reader`: Kafka consumption, dispatch, offset tracking

pub mod bridge;
pub mod command;
pub mod config;
pub mod error;
pub mod firecracker;
pub mod image;
pub mod models;
pub mod network;
pub mod pool;
pub mod reader;
pub mod store;

pub use config::Config;
pub use error::ErrorKind;
pub use pool::{Lease, PoolConfig, ProcessPool};
pub use store::PendingRequestStore;
