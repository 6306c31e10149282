//! Picks the hosts a new request is sent to.
//!
//! | algorithm      | argument    | result                                      |
//! |----------------|-------------|---------------------------------------------|
//! | `all`          | -           | every host, in configured order             |
//! | `random`       | -           | one host, uniformly                         |
//! | `less-latency` | -           | a loopback host if any, else lowest mean    |
//! | `single`       | `host:port` | the configured host equal to the argument   |

pub mod latency;

use rand::seq::SliceRandom;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info};

use crate::core::host::Host;
use crate::errors::SelectionError;

pub use latency::{LatencyProbe, TcpLatencyProbe};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectAlgo {
    All,
    Random,
    LessLatency,
    Single,
}

pub const SELECT_ALGOS: [&str; 4] = ["all", "random", "less-latency", "single"];

impl SelectAlgo {
    pub fn as_str(self) -> &'static str {
        match self {
            SelectAlgo::All => "all",
            SelectAlgo::Random => "random",
            SelectAlgo::LessLatency => "less-latency",
            SelectAlgo::Single => "single",
        }
    }
}

impl FromStr for SelectAlgo {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "all" => Ok(SelectAlgo::All),
            "random" => Ok(SelectAlgo::Random),
            "less-latency" => Ok(SelectAlgo::LessLatency),
            "single" => Ok(SelectAlgo::Single),
            other => Err(SelectionError::InvalidAlgorithm(other.to_string())),
        }
    }
}

impl fmt::Display for SelectAlgo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

pub struct HostSelector {
    probe: Arc<dyn LatencyProbe>,
}

impl HostSelector {
    pub fn new(probe: Arc<dyn LatencyProbe>) -> Self {
        Self { probe }
    }

    pub async fn select(
        &self,
        hosts: &[Host],
        algo: &str,
        arg: Option<&str>,
    ) -> Result<Vec<Host>, SelectionError> {
        let algo: SelectAlgo = algo.parse()?;

        let selected = match algo {
            SelectAlgo::All => {
                if hosts.is_empty() {
                    return Err(SelectionError::HostNotFound(None));
                }
                info!("selection:{algo} = all hosts available");
                return Ok(hosts.to_vec());
            }
            SelectAlgo::Random => hosts
                .choose(&mut rand::thread_rng())
                .cloned()
                .ok_or(SelectionError::HostNotFound(None))?,
            SelectAlgo::LessLatency => self.fastest(hosts).await?,
            SelectAlgo::Single => {
                let wanted: Host = arg
                    .ok_or(SelectionError::ArgumentRequired(SelectAlgo::Single.as_str()))?
                    .parse()?;
                hosts
                    .iter()
                    .find(|h| **h == wanted)
                    .cloned()
                    .ok_or_else(|| SelectionError::HostNotFound(Some(wanted.to_string())))?
            }
        };

        info!("selection:{algo} = {selected}");
        Ok(vec![selected])
    }

    /// A loopback host wins outright and nothing is probed. Otherwise probes
    /// run one host at a time.
    async fn fastest(&self, hosts: &[Host]) -> Result<Host, SelectionError> {
        if let Some(local) = hosts.iter().find(|h| h.is_loopback()) {
            return Ok(local.clone());
        }

        let mut best: Option<(&Host, f64)> = None;
        for host in hosts {
            let samples = self.probe.measure(host).await;
            let Some(latency) = latency::mean(&samples) else {
                debug!(%host, "No probe answered, skipping");
                continue;
            };
            debug!(%host, latency_ms = latency, "Mean latency");

            // Strict comparison keeps the first host on a tie.
            if best.is_none_or(|(_, lowest)| latency < lowest) {
                best = Some((host, latency));
            }
        }

        best.map(|(host, _)| host.clone())
            .ok_or(SelectionError::HostNotFound(None))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::HashMap;
    use std::sync::Mutex;

    /// Canned latencies; records which hosts were probed.
    #[derive(Default)]
    struct FakeProbe {
        latencies: HashMap<Host, Vec<f64>>,
        probed: Mutex<Vec<Host>>,
    }

    impl FakeProbe {
        fn with(latencies: &[(&Host, &[f64])]) -> Arc<Self> {
            Arc::new(Self {
                latencies: latencies
                    .iter()
                    .map(|(h, l)| ((*h).clone(), l.to_vec()))
                    .collect(),
                probed: Mutex::new(Vec::new()),
            })
        }

        fn probed(&self) -> Vec<Host> {
            self.probed.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl LatencyProbe for FakeProbe {
        async fn measure(&self, host: &Host) -> Vec<f64> {
            self.probed.lock().unwrap().push(host.clone());
            self.latencies.get(host).cloned().unwrap_or_default()
        }
    }

    fn pool() -> Vec<Host> {
        vec![
            Host::new("node-a", 11300),
            Host::new("node-b", 11300),
            Host::new("node-c", 11301),
        ]
    }

    fn selector(probe: Arc<FakeProbe>) -> HostSelector {
        HostSelector::new(probe)
    }

    #[tokio::test]
    async fn test_all_keeps_order() {
        let hosts = pool();
        let selected = selector(FakeProbe::with(&[])).select(&hosts, "all", None).await.unwrap();
        assert_eq!(selected, hosts);
    }

    #[tokio::test]
    async fn test_random_picks_one_member() {
        let hosts = pool();
        let selector = selector(FakeProbe::with(&[]));
        for _ in 0..20 {
            let selected = selector.select(&hosts, "random", None).await.unwrap();
            assert_eq!(selected.len(), 1);
            assert!(hosts.contains(&selected[0]));
        }
    }

    #[tokio::test]
    async fn test_unknown_algorithm() {
        let err = selector(FakeProbe::with(&[]))
            .select(&pool(), "fastest", None)
            .await
            .unwrap_err();
        assert_eq!(err, SelectionError::InvalidAlgorithm("fastest".into()));
    }

    #[tokio::test]
    async fn test_single_requires_exact_match() {
        let hosts = pool();
        let selector = selector(FakeProbe::with(&[]));

        assert_eq!(
            selector.select(&hosts, "single", None).await.unwrap_err(),
            SelectionError::ArgumentRequired("single")
        );
        assert_eq!(
            selector.select(&hosts, "single", Some("node-c:11301")).await.unwrap(),
            vec![Host::new("node-c", 11301)]
        );
        // Right address, wrong port.
        assert_eq!(
            selector.select(&hosts, "single", Some("node-c")).await.unwrap_err(),
            SelectionError::HostNotFound(Some("node-c:11300".into()))
        );
    }

    #[tokio::test]
    async fn test_less_latency_prefers_loopback_without_probing() {
        let mut hosts = pool();
        hosts.insert(2, Host::new("localhost", 11300));
        let probe = FakeProbe::with(&[(&hosts[0], &[0.1])]);

        let selected = selector(probe.clone())
            .select(&hosts, "less-latency", None)
            .await
            .unwrap();

        assert_eq!(selected, vec![Host::new("localhost", 11300)]);
        assert!(probe.probed().is_empty());
    }

    #[tokio::test]
    async fn test_less_latency_picks_lowest_mean_first_on_tie() {
        let hosts = pool();
        let probe = FakeProbe::with(&[
            (&hosts[0], &[4.0, 6.0]),
            (&hosts[1], &[1.0, 3.0, 2.0]),
            (&hosts[2], &[2.0, 2.0]),
        ]);

        let selected = selector(probe.clone())
            .select(&hosts, "less-latency", None)
            .await
            .unwrap();

        // node-b and node-c both average 2.0; node-b was seen first.
        assert_eq!(selected, vec![hosts[1].clone()]);
        assert_eq!(probe.probed(), hosts);
    }

    #[tokio::test]
    async fn test_less_latency_skips_silent_hosts() {
        let hosts = pool();
        let probe = FakeProbe::with(&[(&hosts[2], &[9.0])]);
        let selected = selector(probe).select(&hosts, "less-latency", None).await.unwrap();
        assert_eq!(selected, vec![hosts[2].clone()]);

        let err = selector(FakeProbe::with(&[]))
            .select(&hosts, "less-latency", None)
            .await
            .unwrap_err();
        assert_eq!(err, SelectionError::HostNotFound(None));
    }

    #[test]
    fn test_algo_names() {
        for name in SELECT_ALGOS {
            assert_eq!(name.parse::<SelectAlgo>().unwrap().as_str(), name);
        }
    }
}
