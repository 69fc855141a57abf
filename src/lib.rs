//! Meteotemplate Uploader Library
//!
//! This library forwards weather station observations to a Meteotemplate
//! server without ever blocking the capture path:
//!
//! - **config**: Environment-based configuration
//! - **observation**: Observation records and station events
//! - **units**: Conversion to the metric unit system
//! - **fields**: Field-mapping table and record mapper
//! - **archive**: Read-only archive access and record enrichment
//! - **queue**: Delivery queue with bounded backlog
//! - **client**: HTTP transport and retry logic
//! - **protocol**: Destination protocol strategy (Meteotemplate)
//! - **worker**: Background upload worker
//! - **service**: Uploader service bound to station events
//! - **simulator**: Simulated weather station
//!
//! # Example
//!
//! ```no_run
//! use meteotemplate_uploader::config::Config;
//! use meteotemplate_uploader::observation::{Observation, US};
//! use meteotemplate_uploader::service::UploaderService;
//! use std::time::Duration;
//!
//! #[tokio::main]
//! async fn main() {
//!     // Load configuration from environment
//!     let config = Config::from_env().expect("Failed to load config");
//!
//!     // Start the uploader; it disables itself without a password
//!     let service = UploaderService::start(&config, None);
//!
//!     // Hand over records as they arrive
//!     let record = Observation::new(1_700_000_000, US)
//!         .with("outTemp", 32.5)
//!         .with("outHumidity", 24.0);
//!     service.new_archive_record(&record);
//!
//!     service.shutdown(Duration::from_secs(10)).await;
//! }
//! ```

// Module declarations
pub mod archive;
pub mod client;
pub mod config;
pub mod fields;
pub mod observation;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod simulator;
pub mod units;
pub mod worker;

// Re-export commonly used types at crate root for convenience
pub use archive::{Archive, ArchiveError, MemoryArchive};
pub use client::{ClientError, Delivery, HttpTransport, PostOutcome, SkipReason, Transport};
pub use config::{Binding, Config, ConfigError, ThrottlePolicy};
pub use fields::{FieldMapping, FieldTable};
pub use observation::{Event, Observation, Value};
pub use protocol::{Meteotemplate, Protocol};
pub use queue::{DeliveryQueue, QueueConfig, QueueError, QueueSender, QueueStats};
pub use service::{ServiceStats, UploaderService};
pub use simulator::{SimulatorConfig, StationSimulator};
pub use units::{MapError, UnitSystem};
pub use worker::{UploadStats, UploadWorker, WorkerSettings};
