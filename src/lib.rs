//! # dbintel-pipeline
//!
//! Database telemetry intelligence pipeline. Sits between metric/log
//! collectors and an export backend and runs every batch through four stages:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                          DBINTEL PIPELINE                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  CIRCUIT BREAKER → ADAPTIVE SAMPLER → PLAN EXTRACTOR → VERIFICATION      │
//! │        ▲                                                   │             │
//! │        └── export outcomes          health / tuning / healing (async)    │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! - **Circuit breaker**: per-database failure isolation with adaptive timeouts
//!   and memory/CPU load shedding
//! - **Adaptive sampler**: prioritised rule-based sampling with fingerprint
//!   deduplication
//! - **Plan extractor**: PostgreSQL/MySQL plan summaries, structural plan hashes
//!   and regression detection
//! - **Verification**: data quality, PII redaction, health monitoring,
//!   auto-tuning and self-healing
//!
//! ```no_run
//! use dbintel_pipeline::{Batch, Pipeline, PipelineConfig, Record};
//!
//! # fn main() -> dbintel_pipeline::PipelineResult<()> {
//! let pipeline = Pipeline::new(PipelineConfig::default())?;
//! let batch = Batch::new(vec![Record::metric().with_attr("database_name", "orders")]);
//! let forwarded = pipeline.process_batch(batch)?;
//! pipeline.report_export(["orders"], Ok(()));
//! # drop(forwarded);
//! # Ok(())
//! # }
//! ```

#![warn(rust_2018_idioms)]

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod error;
pub mod logging;
pub mod metrics;
pub mod pipeline;
pub mod plan;
pub mod resources;
pub mod rules;
pub mod sampler;
pub mod types;
pub mod verification;

pub use circuit_breaker::{CircuitBreaker, CircuitSnapshot, CircuitState, Outcome};
pub use config::PipelineConfig;
pub use error::{ConfigError, PipelineError, PipelineResult, ProcessingError, ResourceError};
pub use metrics::PipelineMetrics;
pub use pipeline::{BatchContext, ConnectionReset, Pipeline, Stage};
pub use sampler::AdaptiveSampler;
pub use plan::PlanExtractor;
pub use types::{AttributeValue, Batch, DropReason, Record, RecordKind, Timestamp, Verdict};
pub use verification::{FeedbackEvent, FeedbackLevel, HealthSnapshot, HealthStatus, TunableSet, Verification};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
