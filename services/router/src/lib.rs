//! Telemetry Outcome Router
//!
//! Terminal stage of the telemetry ETL pipeline. One deployment is bound to
//! one outcome channel and one `(source, destination)` bucket pair; it moves
//! each object named on that channel out of the ingestion location.
//!
//! ## Architecture
//!
//! ```text
//!  etl.outcomes.success ──▶ OutcomeRouter(ingestion → success)
//!  etl.outcomes.error   ──▶ OutcomeRouter(ingestion → error)
//!
//!  per event:  HEAD source ─▶ HEAD destination ─▶ COPY ─▶ verify ─▶ DELETE source
//!                  │                │
//!                  │ absent         │ verified replica
//!                  ▼                ▼
//!             AlreadyMoved     skip to DELETE (Resumed)
//! ```
//!
//! Moves that still fail after the retry budget are parked on the dead
//! letter topic and the object stays in the source location.

pub mod config;
pub mod router;

pub use config::{LoggingConfig, RouteConfig, RouterConfig, ServiceConfig};
pub use router::{MoveOutcome, MoveStep, OutcomeRouter, RouterError};
