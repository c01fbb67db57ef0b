//! Job Polling
//!
//! Every mutating array operation either completes synchronously or hands
//! back a job. The waiter blocks the calling thread, polling the job at a
//! fixed interval until it settles or the attempt budget runs out.

use crate::config::JobPollConfig;
use crate::domain::ports::{
    ArrayOperation, ArrayTransport, JobStatus, ResourceHandle, RC_COMPLETED, RC_JOB_STARTED,
};
use crate::error::{Error, Result};
use crate::metrics::MaskingMetrics;
use tracing::{debug, warn};

/// Bounded, blocking job poller
#[derive(Debug, Clone)]
pub struct JobWaiter {
    config: JobPollConfig,
    metrics: MaskingMetrics,
}

impl JobWaiter {
    pub fn new(config: JobPollConfig, metrics: MaskingMetrics) -> Self {
        Self { config, metrics }
    }

    pub fn config(&self) -> &JobPollConfig {
        &self.config
    }

    /// Poll `job` until it completes, fails, or exhausts `max_attempts`
    pub fn wait(&self, transport: &dyn ArrayTransport, job: &ResourceHandle) -> Result<()> {
        let max_attempts = self.config.max_attempts.max(1);

        for attempt in 1..=max_attempts {
            self.metrics.record_job_poll();
            match transport.job_status(job)? {
                JobStatus::Completed => {
                    debug!(job = %job.id, attempt, "Job completed");
                    return Ok(());
                }
                JobStatus::Failed { code, message } => {
                    warn!(job = %job.id, code, %message, "Job failed");
                    return Err(Error::JobFailed {
                        job: job.id.clone(),
                        code,
                        message,
                    });
                }
                JobStatus::Running => {
                    if attempt < max_attempts {
                        std::thread::sleep(self.config.interval());
                    }
                }
            }
        }

        warn!(job = %job.id, attempts = max_attempts, "Job polling gave up");
        Err(Error::JobTimeout {
            job: job.id.clone(),
            attempts: max_attempts,
        })
    }

    /// Invoke an operation and wait for its job, returning the created handle
    pub fn invoke_and_wait(
        &self,
        transport: &dyn ArrayTransport,
        operation: ArrayOperation,
    ) -> Result<Option<ResourceHandle>> {
        let kind = operation.kind();
        let outcome = transport.invoke(operation)?;

        match outcome.return_code {
            RC_COMPLETED => Ok(outcome.result),
            RC_JOB_STARTED => {
                let job = outcome.job.ok_or_else(|| Error::MissingResult {
                    operation: format!("{} job", kind),
                })?;
                self.wait(transport, &job)?;
                Ok(outcome.result)
            }
            code => Err(Error::OperationRejected {
                operation: kind.to_string(),
                code,
                message: outcome.message.unwrap_or_default(),
            }),
        }
    }
}
