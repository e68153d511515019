//! # assetstream
//! Per-group event fan-out with on-demand routing and provisioning.
//!
//! Entities (assets) publish events into a shared log. Entities are grouped
//! (by workcenter, line, ...) and every group gets a derived log and its own
//! [`Dispatcher`](dispatcher::Dispatcher): a single ordered log consumer that
//! fans events out to many HTTP subscribers, each filtered by entity and
//! optionally by data item.
//!
//! ```text
//!            GET /asset_stream?asset_uuid=ASSET-42
//!                          │
//!                   ┌──────▼──────┐  resolve   ┌──────────────────┐
//!                   │   router    ├───────────▶│ GroupingStrategy │
//!                   │             │            └──────────────────┘
//!                   │ Routing     │  ensure    ┌──────────────────┐
//!                   │ Controller  ├───────────▶│  GroupRegistry   │──▶ DeploymentPlatform
//!                   └──────┬──────┘            └──────────────────┘
//!                   proxy  │ or redirect
//!                   ┌──────▼──────┐   consume  ┌──────────────────┐
//!                   │ Dispatcher  │◀───────────│ derived log      │
//!                   │  "Weld"     │            │ asset_stream_Weld│
//!                   └─────────────┘            └──────────────────┘
//!                     │   │   │  NDJSON
//!                   sessions (entity / item filters, bounded queues)
//! ```
//!
//! ## Getting started
//! An embedded Dispatcher over an in-memory log:
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use assetstream::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> assetstream::Result<()> {
//!     let broker = MemoryBroker::new();
//!     let mut config = DispatcherConfig::for_group("Weld", &GroupNaming::default());
//!     config.log_backend = LogBackend::Memory;
//!
//!     let dispatcher = Dispatcher::new(config, Arc::new(broker.clone()));
//!     dispatcher.start();
//!
//!     let session = dispatcher.subscribe(SessionFilter::entity("ASSET-42"), None)?;
//!     broker
//!         .topic("asset_stream_Weld")
//!         .append_json("ASSET-42", &serde_json::json!({ "id": "temp", "value": 21.5 }));
//!     if let Some(event) = session.recv().await {
//!         println!("{} {:?}", event.sequence_token, event.payload);
//!     }
//!     dispatcher.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Binaries
//! - `assetstream-router`: routing layer (`serve`, `deploy`, `teardown`)
//! - `assetstream-dispatcher`: one group's Dispatcher service
//! - `assetstream-state`: point-in-time asset state queries

#![forbid(unsafe_code)]

pub mod background_tasks;
pub mod config;
pub mod constants;
pub mod controller;
pub mod deployment;
pub mod dispatcher;
pub mod error;
pub mod grouping;
pub mod http;
pub mod ksql;
pub mod log;
pub mod metrics;
pub mod registry;
pub mod retry;
pub mod state;
pub mod telemetry;
pub mod types;

pub use error::{Error, Result};

pub mod prelude {
    //! Commonly used types.
    pub use crate::config::{
        DispatcherConfig, LogBackend, RouterConfig, RoutingMode, ServiceInfo, StateApiConfig,
    };
    pub use crate::controller::{Route, RoutingController};
    pub use crate::deployment::{DeploymentPlatform, ServiceSpec};
    pub use crate::dispatcher::{Dispatcher, DispatcherState, SessionFilter, Subscription};
    pub use crate::error::{Error, Result};
    pub use crate::grouping::{GroupResolver, GroupingStrategy};
    pub use crate::log::{LogSource, LogSourceFactory, MemoryBroker, MemoryLog};
    pub use crate::registry::{GroupRegistry, RegistryEntry};
    pub use crate::types::{Event, GroupNaming, LifecycleState, SequenceToken};

    pub use bytes;
}
