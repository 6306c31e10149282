use std::sync::Arc;
use tracing::debug;

use crate::core::host::Host;
use crate::core::messages::{CreateRequest, ForwardEnvelope, Tube};
use crate::errors::handlers::report_warning;
use crate::queue::{self, Broker};

/// What happened to a refused create request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForwardOutcome {
    /// Human readable account, used as the status of the report.
    pub status: String,
    /// The configured next node, whether or not the relay went through.
    /// `None` only when no next node is configured.
    pub forwarded: Option<Host>,
}

/// Hop budget for the envelope about to be relayed. A request that arrived
/// in an envelope spends one unit of what it carried; a fresh one starts from
/// the configured maximum.
pub fn relay_budget(received: Option<i64>, configured_max: i64) -> i64 {
    received.unwrap_or(configured_max) - 1
}

/// Relays work this node refused to the configured next node.
pub struct ForwardingCoordinator {
    broker: Arc<dyn Broker>,
    next: Option<Host>,
    ttr: u64,
}

impl ForwardingCoordinator {
    pub fn new(broker: Arc<dyn Broker>, next: Option<Host>, ttr: u64) -> Self {
        Self { broker, next, ttr }
    }

    /// Put `request` on the next node's forward tube with `budget` hops left.
    /// Relay failures end up in the status, they are never raised.
    pub async fn relay(&self, request: CreateRequest, budget: i64) -> ForwardOutcome {
        let Some(next) = &self.next else {
            let status = "Could not forward the message because no node has been set!".to_string();
            report_warning(&status);
            return ForwardOutcome {
                status,
                forwarded: None,
            };
        };

        // Budgets never go negative on the wire.
        if budget < 0 {
            let status = format!("Hop budget exhausted, not forwarding to {next}");
            report_warning(&status);
            return ForwardOutcome {
                status,
                forwarded: Some(next.clone()),
            };
        }

        let envelope = ForwardEnvelope {
            max: budget,
            message: request,
        };

        match queue::submit(self.broker.as_ref(), next, Tube::Forward, &envelope, self.ttr).await {
            Ok(_) => {
                debug!(max = budget, %next, "Envelope relayed");
                let status = format!("Forwarding message to {next}");
                report_warning(&status);
                ForwardOutcome {
                    status,
                    forwarded: Some(next.clone()),
                }
            }
            Err(e) => {
                let status = format!("Exception while forwarding message to {next}: {e}");
                report_warning(&status);
                ForwardOutcome {
                    status,
                    forwarded: Some(next.clone()),
                }
            }
        }
    }
}

/// The create request inside `envelope` and the budget it carries, or `None`
/// once the budget is spent.
pub fn unwrap_envelope(envelope: ForwardEnvelope) -> Option<(CreateRequest, i64)> {
    if envelope.max <= 0 {
        report_warning("Maximum number of forwarding reached!");
        return None;
    }
    Some((envelope.message, envelope.max))
}
