//! Decision engine: orchestration, fusion, and the error taxonomy.

pub mod engine;
pub mod error;
pub mod fusion;
pub mod metrics;

pub use engine::{DecisionEngine, EngineDeps, Readiness};
pub use error::ScoreError;
pub use fusion::{fuse, Fused, FusionInput, ListHits};
pub use metrics::EngineMetrics;
