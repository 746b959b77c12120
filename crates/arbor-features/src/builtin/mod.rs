//! Hooks shipped with Arbor.

mod debug;
mod logging;
mod metrics;
mod quota;

pub use debug::DebugHook;
pub use logging::LoggingHook;
pub use metrics::{CapabilityMetrics, MetricsHook};
pub use quota::{QuotaCounters, QuotaHook, QuotaLimits};
