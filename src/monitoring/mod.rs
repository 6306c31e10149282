pub mod metrics;

pub use metrics::{LiveCounters, MetricsSource, ProbeReport, ScriptMetrics, TotalUsage};
