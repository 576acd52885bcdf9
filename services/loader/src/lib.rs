//! Telemetry Loader
//!
//! First stage of the telemetry ETL pipeline. It consumes object-created
//! notifications, parses the referenced tractor telemetry file, loads its rows
//! into the PostgreSQL warehouse and publishes one outcome event per object.
//!
//! ## Features
//!
//! - **All-or-nothing validation**: one bad row rejects the whole file
//! - **Replaceable loads**: rows are keyed by object id and replaced in a
//!   single transaction together with the load manifest
//! - **Duplicate detection**: a redelivered notification for content that is
//!   already loaded re-publishes SUCCESS without touching the warehouse
//! - **Bounded retries**: storage, warehouse and publish calls each run under
//!   their own deadline and are retried with exponential backoff
//!
//! ## Architecture
//!
//! ```text
//! Kafka                 Object store             PostgreSQL
//! ┌──────────────┐     ┌──────────────┐        ┌──────────────────┐
//! │ etl.ingestion│     │ ingestion    │        │ <table>          │
//! └──────┬───────┘     │ bucket       │        │ <table>_manifest │
//!        │             └──────┬───────┘        └────────▲─────────┘
//!        ▼                    │ get                     │ load
//! ┌────────────────────────────▼────────────────────────┴─┐
//! │                        Loader                         │
//! └────────────────────────────┬──────────────────────────┘
//!                              │ publish
//!                 ┌────────────┴────────────┐
//!                 ▼                         ▼
//!        etl.outcomes.success        etl.outcomes.error
//! ```

pub mod config;
pub mod loader;
pub mod parser;
pub mod postgres;
pub mod record;
pub mod warehouse;

pub use config::{CsvFormat, LoaderConfig, LoggingConfig, ServiceConfig, WarehouseConfig};
pub use loader::{Failure, FailureKind, Loader, LoaderError, DUPLICATE_REASON};
pub use parser::{parse_telemetry, ParseError};
pub use postgres::PgWarehouse;
pub use record::{RecordError, TelemetryRecord, COLUMNS};
pub use warehouse::{LoadManifest, LoadReceipt, MemoryWarehouse, Warehouse, WarehouseError};
