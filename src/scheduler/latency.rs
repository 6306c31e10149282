use async_trait::async_trait;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::debug;

use crate::core::host::Host;

/// Probes per host.
pub const PROBE_RUNS: usize = 4;

/// Connect timeout for a single probe (5 seconds).
const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Pause between consecutive probes to the same host.
const PROBE_WAIT: Duration = Duration::from_secs(1);

/// Round-trip measurements to a host, in milliseconds. Failed probes are
/// left out, so an unreachable host yields an empty vector.
#[async_trait]
pub trait LatencyProbe: Send + Sync {
    async fn measure(&self, host: &Host) -> Vec<f64>;
}

/// Times TCP handshakes against the host's queue port.
#[derive(Debug, Clone)]
pub struct TcpLatencyProbe {
    runs: usize,
    timeout: Duration,
    wait: Duration,
}

impl TcpLatencyProbe {
    pub fn new() -> Self {
        Self {
            runs: PROBE_RUNS,
            timeout: PROBE_TIMEOUT,
            wait: PROBE_WAIT,
        }
    }

    pub fn with_timing(runs: usize, timeout: Duration, wait: Duration) -> Self {
        Self {
            runs,
            timeout,
            wait,
        }
    }
}

impl Default for TcpLatencyProbe {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LatencyProbe for TcpLatencyProbe {
    async fn measure(&self, host: &Host) -> Vec<f64> {
        let addr = host.socket_addr();
        let mut samples = Vec::with_capacity(self.runs);

        for run in 0..self.runs {
            if run > 0 {
                sleep(self.wait).await;
            }

            let start = Instant::now();
            match timeout(self.timeout, TcpStream::connect(&addr)).await {
                Ok(Ok(_stream)) => {
                    let elapsed = start.elapsed().as_secs_f64() * 1000.0;
                    debug!(%host, run, latency_ms = elapsed, "Probe answered");
                    samples.push(elapsed);
                }
                Ok(Err(e)) => debug!(%host, run, "Probe failed: {e}"),
                Err(_) => debug!(%host, run, "Probe timed out"),
            }
        }

        samples
    }
}

pub fn mean(samples: &[f64]) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }
    Some(samples.iter().sum::<f64>() / samples.len() as f64)
}
