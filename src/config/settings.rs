/*
* Cluster Configuration
* ---------------------
*
* One JSON file (comments allowed, it goes through the JSON5 reader) describes
* a node: who it is, where its own queue lives, where status reports go, which
* hosts it may dispatch to, and how much load it will take before shedding work
* to the next node.
*
* Every value is checked and normalised here, exactly once:
* - sizes ("4G", 1073741824) become bytes
* - timespans ("1h", 3600) become seconds
* - endpoints ("node-b", "node-b:11301") become `Host`
* - unknown keys at any level are a hard error
*
* Nothing downstream ever looks at the raw file again. The resulting `Settings`
* is read-only and handed to each component when it is built.
*
* Example:
* ```json
* {
*     "node-id": "node-a",
*     "hosts": ["127.0.0.1", "node-b:11300"],
*     "reporter": "node-r",
*     "forward": { "next": "node-b", "max": 4 },
*     "overload": { "memory-usage": "48G", "rctl": { "pcpu": 90 } },
*     // keep a week of status logs, at most 5000 of them
*     "logs": { "remove-after": { "days": 7 }, "count": 5000 }
* }
* ```
*/

use config::{Config, File, FileFormat};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

use crate::config::units::{self, seconds_of, RetentionUnit};
use crate::core::host::{Host, DEFAULT_PORT};
use crate::errors::ConfigError;

pub const DEFAULT_NODE_ID: &str = "default";
pub const DEFAULT_PROFILE: &str = "CS0";
pub const DEFAULT_PROFILES: [&str; 6] = ["CS0", "CS1", "CS2", "CS3", "CS4", "CS5"];
pub const DEFAULT_SELECT_ALGO: &str = "less-latency";
pub const DEFAULT_TTR: u64 = 60 * 60;
pub const DEFAULT_FORWARD_MAX: i64 = 16;
pub const DEFAULT_METRICS_DELAY: u64 = 5 * 60;
pub const DEFAULT_METRICS_SKEW: u64 = 6;

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct Settings {
    #[serde(default = "default_node_id")]
    pub node_id: String,
    #[serde(default = "default_profile")]
    pub default_profile: String,
    #[serde(default = "default_profiles")]
    pub profiles: Vec<String>,
    #[serde(default = "default_select_algo")]
    pub select_algo: String,
    #[serde(default)]
    pub select_arg: Option<String>,
    #[serde(default = "default_endpoint")]
    pub local: Host,
    #[serde(default = "default_endpoint")]
    pub reporter: Host,
    #[serde(default)]
    pub hosts: Vec<Host>,
    /// Visibility timeout for every job we put, in seconds.
    #[serde(default = "default_ttr", deserialize_with = "units::timespan::deserialize")]
    pub ttr: u64,
    /// Directory holding the external VM commands and probes.
    #[serde(default)]
    pub scripts: PathBuf,
    #[serde(default)]
    pub forward: ForwardSettings,
    #[serde(default)]
    pub limits: ResourceLimits,
    #[serde(default)]
    pub overload: OverloadThresholds,
    #[serde(default)]
    pub metrics: MetricsSettings,
    #[serde(default)]
    pub logs: LogSettings,

    /// Where status logs are written; derived from the config file location.
    #[serde(skip)]
    pub log_dir: PathBuf,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ForwardSettings {
    #[serde(default)]
    pub next: Option<Host>,
    #[serde(default = "default_forward_max")]
    pub max: i64,
}

impl Default for ForwardSettings {
    fn default() -> Self {
        Self {
            next: None,
            max: DEFAULT_FORWARD_MAX,
        }
    }
}

/// Static ceilings on what the machines on this node may add up to.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResourceLimits {
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub memory: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub storage: Option<u64>,
}

/// Live ceilings checked against the running machines' counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct OverloadThresholds {
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub memory_usage: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub rx: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub tx: Option<u64>,
    #[serde(default)]
    pub rctl: RctlThresholds,
}

impl OverloadThresholds {
    /// Top-level thresholds by counter name, in check order.
    pub fn counters(&self) -> [(&'static str, Option<u64>); 3] {
        [
            ("memory-usage", self.memory_usage),
            ("rx", self.rx),
            ("tx", self.tx),
        ]
    }
}

/// Per-resource-control ceilings (see rctl(8)). Every field defaults to
/// unconstrained.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RctlThresholds {
    #[serde(default, deserialize_with = "units::timespan::option::deserialize")]
    pub cputime: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub datasize: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub stacksize: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub coredumpsize: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub memoryuse: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub memorylocked: Option<u64>,
    #[serde(default)]
    pub maxproc: Option<u64>,
    #[serde(default)]
    pub openfiles: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub vmemoryuse: Option<u64>,
    #[serde(default)]
    pub pseudoterminals: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub swapuse: Option<u64>,
    #[serde(default)]
    pub nthr: Option<u64>,
    #[serde(default)]
    pub msgqqueued: Option<u64>,
    #[serde(default)]
    pub msgqsize: Option<u64>,
    #[serde(default)]
    pub nmsgq: Option<u64>,
    #[serde(default)]
    pub nsem: Option<u64>,
    #[serde(default)]
    pub nsemop: Option<u64>,
    #[serde(default)]
    pub nshm: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub shmsize: Option<u64>,
    #[serde(default, deserialize_with = "units::timespan::option::deserialize")]
    pub wallclock: Option<u64>,
    #[serde(default)]
    pub pcpu: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub readbps: Option<u64>,
    #[serde(default, deserialize_with = "units::size::deserialize")]
    pub writebps: Option<u64>,
    #[serde(default)]
    pub readiops: Option<u64>,
    #[serde(default)]
    pub writeiops: Option<u64>,
}

impl RctlThresholds {
    pub fn entries(&self) -> [(&'static str, Option<u64>); 25] {
        [
            ("cputime", self.cputime),
            ("datasize", self.datasize),
            ("stacksize", self.stacksize),
            ("coredumpsize", self.coredumpsize),
            ("memoryuse", self.memoryuse),
            ("memorylocked", self.memorylocked),
            ("maxproc", self.maxproc),
            ("openfiles", self.openfiles),
            ("vmemoryuse", self.vmemoryuse),
            ("pseudoterminals", self.pseudoterminals),
            ("swapuse", self.swapuse),
            ("nthr", self.nthr),
            ("msgqqueued", self.msgqqueued),
            ("msgqsize", self.msgqsize),
            ("nmsgq", self.nmsgq),
            ("nsem", self.nsem),
            ("nsemop", self.nsemop),
            ("nshm", self.nshm),
            ("shmsize", self.shmsize),
            ("wallclock", self.wallclock),
            ("pcpu", self.pcpu),
            ("readbps", self.readbps),
            ("writebps", self.writebps),
            ("readiops", self.readiops),
            ("writeiops", self.writeiops),
        ]
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MetricsSettings {
    #[serde(
        default = "default_metrics_delay",
        deserialize_with = "units::timespan::deserialize"
    )]
    pub delay: u64,
    #[serde(
        default = "default_metrics_skew",
        deserialize_with = "units::timespan::deserialize"
    )]
    pub skew: u64,
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            delay: DEFAULT_METRICS_DELAY,
            skew: DEFAULT_METRICS_SKEW,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, rename_all = "kebab-case")]
pub struct LogSettings {
    #[serde(default)]
    pub remove_after: RemoveAfter,
    #[serde(default)]
    pub count: Option<usize>,
}

/// Age thresholds, each counted in its own unit. Any subset may be set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RemoveAfter {
    #[serde(default)]
    pub years: Option<u64>,
    #[serde(default)]
    pub weeks: Option<u64>,
    #[serde(default)]
    pub days: Option<u64>,
    #[serde(default)]
    pub hours: Option<u64>,
    #[serde(default)]
    pub minutes: Option<u64>,
    #[serde(default)]
    pub seconds: Option<u64>,
}

impl RemoveAfter {
    /// Active thresholds, in seconds.
    pub fn thresholds(&self) -> Vec<u64> {
        [
            (self.years, RetentionUnit::Years),
            (self.weeks, RetentionUnit::Weeks),
            (self.days, RetentionUnit::Days),
            (self.hours, RetentionUnit::Hours),
            (self.minutes, RetentionUnit::Minutes),
            (self.seconds, RetentionUnit::Seconds),
        ]
        .into_iter()
        .filter_map(|(count, unit)| count.map(|c| seconds_of(c, unit)))
        .collect()
    }
}

fn default_node_id() -> String {
    DEFAULT_NODE_ID.to_string()
}

fn default_profile() -> String {
    DEFAULT_PROFILE.to_string()
}

fn default_profiles() -> Vec<String> {
    DEFAULT_PROFILES.iter().map(|p| p.to_string()).collect()
}

fn default_select_algo() -> String {
    DEFAULT_SELECT_ALGO.to_string()
}

fn default_endpoint() -> Host {
    Host::new("127.0.0.1", DEFAULT_PORT)
}

fn default_ttr() -> u64 {
    DEFAULT_TTR
}

fn default_forward_max() -> i64 {
    DEFAULT_FORWARD_MAX
}

fn default_metrics_delay() -> u64 {
    DEFAULT_METRICS_DELAY
}

fn default_metrics_skew() -> u64 {
    DEFAULT_METRICS_SKEW
}

impl Settings {
    /// Load and validate the settings file at `path`.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        info!("Loading configuration from {}", path.display());

        let config = Config::builder()
            .add_source(File::from(path).format(FileFormat::Json5))
            .build()?;

        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        Self::finish(config.try_deserialize()?, &base_dir)
    }

    /// Same as [`Settings::load`] but from an in-memory document; log
    /// storage goes under `base_dir`.
    pub fn from_json5(raw: &str, base_dir: &Path) -> Result<Self, ConfigError> {
        let config = Config::builder()
            .add_source(File::from_str(raw, FileFormat::Json5))
            .build()?;

        Self::finish(config.try_deserialize()?, base_dir)
    }

    fn finish(mut settings: Settings, base_dir: &Path) -> Result<Self, ConfigError> {
        if settings.hosts.is_empty() {
            return Err(ConfigError::NoHosts);
        }

        if settings.scripts.as_os_str().is_empty() {
            settings.scripts = default_scripts_dir()?;
        }
        settings.log_dir = base_dir.join("logs");

        debug!(
            node_id = %settings.node_id,
            hosts = settings.hosts.len(),
            ttr = settings.ttr,
            scripts = %settings.scripts.display(),
            "Configuration loaded"
        );

        Ok(settings)
    }

    /// Age thresholds for log retention, in seconds.
    pub fn retention_thresholds(&self) -> Vec<u64> {
        self.logs.remove_after.thresholds()
    }
}

/// `settings.json` next to the running executable.
pub fn default_config_path() -> Result<PathBuf, ConfigError> {
    Ok(executable_dir()?.join("settings.json"))
}

fn default_scripts_dir() -> Result<PathBuf, ConfigError> {
    let dir = executable_dir()?;
    Ok(dir.parent().map(Path::to_path_buf).unwrap_or(dir))
}

fn executable_dir() -> Result<PathBuf, ConfigError> {
    let exe = std::env::current_exe().map_err(ConfigError::BaseDir)?;
    let exe = exe.canonicalize().unwrap_or(exe);
    Ok(exe
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from(".")))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(raw: &str) -> Result<Settings, ConfigError> {
        Settings::from_json5(raw, Path::new("/srv/cluster"))
    }

    #[test]
    fn test_minimal_settings_get_defaults() {
        let settings = parse(r#"{ "hosts": ["127.0.0.1"], "scripts": "/opt/vm" }"#).unwrap();

        assert_eq!(settings.node_id, "default");
        assert_eq!(settings.default_profile, "CS0");
        assert_eq!(settings.profiles.len(), 6);
        assert_eq!(settings.select_algo, "less-latency");
        assert_eq!(settings.select_arg, None);
        assert_eq!(settings.local, Host::new("127.0.0.1", 11300));
        assert_eq!(settings.ttr, 3600);
        assert_eq!(settings.forward.max, 16);
        assert_eq!(settings.forward.next, None);
        assert_eq!(settings.metrics.delay, 300);
        assert_eq!(settings.metrics.skew, 6);
        assert_eq!(settings.limits, ResourceLimits::default());
        assert_eq!(settings.log_dir, PathBuf::from("/srv/cluster/logs"));
        assert!(settings.retention_thresholds().is_empty());
    }

    #[test]
    fn test_full_document_with_comments() {
        let raw = r#"
        {
            // who we are
            "node-id": "node-a",
            "hosts": ["node-b:11301", "node-c"],
            "reporter": "node-r",
            "ttr": "2h",
            "scripts": "/opt/vm",
            "forward": { "next": "node-b", "max": 3 },
            "limits": { "memory": "64G", "storage": 1099511627776 },
            "overload": {
                "memory-usage": "48G",
                "rx": "1M",
                "rctl": { "cputime": "1h", "pcpu": 90, "coredumpsize": "1G" }
            },
            "metrics": { "delay": "1m", "skew": 10 },
            "logs": { "remove-after": { "days": 7, "hours": 1 }, "count": 100 }
        }"#;
        let settings = parse(raw).unwrap();

        assert_eq!(settings.node_id, "node-a");
        assert_eq!(settings.hosts[0], Host::new("node-b", 11301));
        assert_eq!(settings.hosts[1], Host::new("node-c", 11300));
        assert_eq!(settings.ttr, 7200);
        assert_eq!(settings.forward.next, Some(Host::new("node-b", 11300)));
        assert_eq!(settings.forward.max, 3);
        assert_eq!(settings.limits.memory, Some(64 << 30));
        assert_eq!(settings.limits.storage, Some(1 << 40));
        assert_eq!(settings.overload.memory_usage, Some(48 << 30));
        assert_eq!(settings.overload.rx, Some(1 << 20));
        assert_eq!(settings.overload.tx, None);
        assert_eq!(settings.overload.rctl.cputime, Some(3600));
        assert_eq!(settings.overload.rctl.pcpu, Some(90));
        assert_eq!(settings.overload.rctl.coredumpsize, Some(1 << 30));
        assert_eq!(settings.overload.rctl.msgqqueued, None);
        assert_eq!(settings.metrics.delay, 60);
        assert_eq!(settings.logs.count, Some(100));

        let mut thresholds = settings.retention_thresholds();
        thresholds.sort();
        assert_eq!(thresholds, vec![3600, 7 * 86400]);
    }

    #[test]
    fn test_every_rctl_field_is_present_and_unset_by_default() {
        let rctl = RctlThresholds::default();
        let entries = rctl.entries();
        assert_eq!(entries.len(), 25);
        assert!(entries.iter().all(|(_, v)| v.is_none()));
        assert!(entries.iter().any(|(k, _)| *k == "nmsgq"));
    }

    #[test]
    fn test_unknown_keys_are_fatal() {
        assert!(parse(r#"{ "hosts": ["a"], "colour": "blue" }"#).is_err());
        assert!(parse(r#"{ "hosts": ["a"], "limits": { "cpu": 4 } }"#).is_err());
        assert!(parse(r#"{ "hosts": ["a"], "overload": { "rctl": { "bogus": 1 } } }"#).is_err());
        assert!(parse(r#"{ "hosts": ["a"], "logs": { "remove-after": { "months": 1 } } }"#).is_err());
    }

    #[test]
    fn test_wrong_types_are_fatal() {
        assert!(parse(r#"{ "hosts": ["a"], "ttr": "soon" }"#).is_err());
        assert!(parse(r#"{ "hosts": ["a"], "limits": { "memory": "lots" } }"#).is_err());
        assert!(parse(r#"{ "hosts": ["a:port"] }"#).is_err());
    }

    #[test]
    fn test_missing_hosts_is_fatal() {
        assert!(matches!(parse(r#"{ "node-id": "x" }"#), Err(ConfigError::NoHosts)));
        assert!(matches!(parse(r#"{ "hosts": [] }"#), Err(ConfigError::NoHosts)));
    }
}
