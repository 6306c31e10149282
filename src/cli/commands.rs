use rand::Rng;
use serde::Serialize;
use std::time::Duration;
use tracing::info;

use crate::config::Settings;
use crate::core::host::Host;
use crate::core::messages::{CreateRequest, DestroyRequest, StatusMessage, Tube};
use crate::errors::handlers::report_warning;
use crate::errors::{ClusterError, ClusterResult};
use crate::logs::LogStore;
use crate::monitoring::MetricsSource;
use crate::queue::{self, Broker};
use crate::reporter::StatusReporter;
use crate::scheduler::HostSelector;

/// `create` arguments, before defaults from the settings are applied.
#[derive(Debug, Clone, Default)]
pub struct CreateArgs {
    pub options: Option<String>,
    pub profile: Option<String>,
    pub select_algo: Option<String>,
    pub select_arg: Option<String>,
    pub tags: String,
}

/// Build a create request from the command line and queue it on the
/// selected hosts. Returns the hosts that took it.
pub async fn create(
    settings: &Settings,
    broker: &dyn Broker,
    selector: &HostSelector,
    args: CreateArgs,
) -> ClusterResult<Vec<Host>> {
    let profile = args
        .profile
        .unwrap_or_else(|| settings.default_profile.clone());
    if !settings.profiles.contains(&profile) {
        return Err(ClusterError::Usage(format!(
            "invalid profile '{profile}' (choose from {})",
            settings.profiles.join(", ")
        )));
    }

    let request = CreateRequest {
        profile,
        options: args.options.as_deref().map(shell_split),
        tags: split_tags(&args.tags),
    };

    let algo = args
        .select_algo
        .unwrap_or_else(|| settings.select_algo.clone());
    let arg = args.select_arg.or_else(|| settings.select_arg.clone());
    let hosts = selector.select(&settings.hosts, &algo, arg.as_deref()).await?;

    Ok(fan_out(settings, broker, &hosts, Tube::Create, &request).await)
}

/// Queue a destroy request on `target`, or on every configured host.
pub async fn destroy(
    settings: &Settings,
    broker: &dyn Broker,
    target: Option<&str>,
    tags: &str,
) -> ClusterResult<Vec<Host>> {
    let request = DestroyRequest {
        tags: split_tags(tags),
    };

    let targets = match target {
        Some(target) => vec![target
            .parse::<Host>()
            .map_err(|e| ClusterError::Usage(e.to_string()))?],
        None => settings.hosts.clone(),
    };

    Ok(fan_out(settings, broker, &targets, Tube::Destroy, &request).await)
}

/// One failed host never stops the others.
async fn fan_out<T: Serialize>(
    settings: &Settings,
    broker: &dyn Broker,
    hosts: &[Host],
    tube: Tube,
    message: &T,
) -> Vec<Host> {
    let mut reached = Vec::with_capacity(hosts.len());
    for host in hosts {
        match queue::submit(broker, host, tube, message, settings.ttr).await {
            Ok(_) => reached.push(host.clone()),
            Err(e) => report_warning(&format!("Exception: {e}")),
        }
    }
    reached
}

/// Wait out the configured delay plus some jitter, run the per-machine
/// probe and send whatever it printed to the reporter.
pub async fn metrics(
    settings: &Settings,
    source: &dyn MetricsSource,
    reporter: &StatusReporter,
) -> ClusterResult<()> {
    let delay = settings.metrics.delay;
    if delay > 0 {
        info!("Sleeping {delay} seconds (delay)");
        tokio::time::sleep(Duration::from_secs(delay)).await;
    }

    if settings.metrics.skew > 0 {
        let skew = rand::thread_rng().gen_range(1..=settings.metrics.skew);
        info!("Sleeping {skew} seconds (skew)");
        tokio::time::sleep(Duration::from_secs(skew)).await;
    }

    info!("Retrieving metrics");
    let probe = source.vm_metrics().await?;

    let message = StatusMessage::Metrics {
        node_id: settings.node_id.clone(),
        status: probe.status,
        stdout: probe.stdout,
        stderr: probe.stderr,
    };
    reporter.report(&message).await?;
    Ok(())
}

/// Every stored report as one pretty-printed JSON object.
pub async fn logs(store: &LogStore) -> ClusterResult<String> {
    let dump = store.dump().await?;

    let mut out = Vec::new();
    let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
    let mut ser = serde_json::Serializer::with_formatter(&mut out, formatter);
    dump.serialize(&mut ser)
        .map_err(crate::errors::LogStoreError::from)?;

    Ok(String::from_utf8_lossy(&out).into_owned())
}

pub fn split_tags(tags: &str) -> Vec<String> {
    tags.split_whitespace().map(str::to_string).collect()
}

/// Split like a POSIX shell would, minus expansions: whitespace separates
/// words, single and double quotes group them.
pub fn shell_split(input: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;

    for ch in input.chars() {
        match quote {
            Some(q) if ch == q => quote = None,
            Some(_) => current.push(ch),
            None if ch == '"' || ch == '\'' => {
                quote = Some(ch);
                in_word = true;
            }
            None if ch.is_whitespace() => {
                if in_word {
                    words.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            None => {
                current.push(ch);
                in_word = true;
            }
        }
    }

    if in_word {
        words.push(current);
    }
    words
}
