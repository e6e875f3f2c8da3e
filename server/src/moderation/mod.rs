pub mod ban;
pub mod report;

pub use ban::{BanKind, BanRecord, BanRegistry, BanStatus};
pub use report::ReportCounter;
