//! Pairing: categories and filters, the device registry, the waiting queue,
//! active pairs, and the engine that owns them.

pub mod category;
pub mod engine;
pub mod pairs;
pub mod queue;
pub mod registry;

pub use category::{Category, Filter};
pub use engine::{validate_device_id, EngineStats, JoinOutcome, MatchEngine, ReportOutcome};
pub use registry::{DailyCounts, PeerProfile, RemainingLimits};
