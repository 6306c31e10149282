use std::sync::Arc;
use tracing::{error, info};

use crate::core::host::Host;
use crate::core::messages::{StatusMessage, Tube};
use crate::errors::QueueError;
use crate::queue::{self, Broker, JobId};

/// Sends finished-work reports to the reporter node's status tube.
#[derive(Clone)]
pub struct StatusReporter {
    broker: Arc<dyn Broker>,
    destination: Host,
    ttr: u64,
}

impl StatusReporter {
    pub fn new(broker: Arc<dyn Broker>, destination: Host, ttr: u64) -> Self {
        Self {
            broker,
            destination,
            ttr,
        }
    }

    pub fn destination(&self) -> &Host {
        &self.destination
    }

    pub async fn report(&self, message: &StatusMessage) -> Result<JobId, QueueError> {
        info!(
            context = message.context(),
            reporter = %self.destination,
            "Reporting status"
        );
        queue::submit(
            self.broker.as_ref(),
            &self.destination,
            Tube::Status,
            message,
            self.ttr,
        )
        .await
    }

    /// Like [`StatusReporter::report`], but a failure is only logged.
    pub async fn report_or_log(&self, message: &StatusMessage) {
        if let Err(e) = self.report(message).await {
            error!(reporter = %self.destination, "Could not report status: {e}");
        }
    }
}
