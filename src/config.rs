pub mod settings;
pub mod units;

pub use settings::{
    default_config_path, ForwardSettings, LogSettings, MetricsSettings, OverloadThresholds,
    RctlThresholds, RemoveAfter, ResourceLimits, Settings,
};
pub use units::{parse_size, parse_timespan, UnitParseError};
