use crate::error::CreditError;
use crate::pipeline::LiquidityPipeline;
use crate::types::{LiquidityRequest, RequestOutcome};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::{watch, Semaphore};
use tracing::{error, info};

pub const DEFAULT_WORKERS: usize = 8;

/// Progress of a dispatched request, keyed by its correlation id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DispatchStatus {
    Queued,
    Running,
    Completed { outcome: RequestOutcome },
    Failed { detail: String },
}

impl DispatchStatus {
    pub fn is_finished(&self) -> bool {
        matches!(self, Self::Completed { .. } | Self::Failed { .. })
    }
}

/// Runs pipeline submissions on background tasks with at most `workers` in flight.
///
/// Every spawned task reports through its status channel, including when it panics or is
/// aborted, so no submission is left unobserved.
#[derive(Clone)]
pub struct RequestDispatcher {
    pipeline: LiquidityPipeline,
    permits: Arc<Semaphore>,
    statuses: Arc<DashMap<String, watch::Sender<DispatchStatus>>>,
}

impl RequestDispatcher {
    pub fn new(pipeline: LiquidityPipeline, workers: usize) -> Self {
        Self {
            pipeline,
            permits: Arc::new(Semaphore::new(workers.max(1))),
            statuses: Arc::new(DashMap::new()),
        }
    }

    pub fn pipeline(&self) -> &LiquidityPipeline {
        &self.pipeline
    }

    /// Queue a request and return its correlation id (the request id).
    ///
    /// Resubmitting an id that is already tracked does not spawn a second task.
    pub fn submit(&self, request: LiquidityRequest) -> String {
        let correlation_id = request.request_id.clone();
        let sender = match self.statuses.entry(correlation_id.clone()) {
            Entry::Occupied(_) => {
                info!(correlation_id = %correlation_id, "request already dispatched");
                return correlation_id;
            }
            Entry::Vacant(vacant) => {
                let (sender, _) = watch::channel(DispatchStatus::Queued);
                vacant.insert(sender.clone());
                sender
            }
        };

        let pipeline = self.pipeline.clone();
        let permits = self.permits.clone();
        tokio::spawn(async move {
            let guard = StatusGuard::new(sender);
            let Ok(_permit) = permits.acquire_owned().await else {
                guard.finish(DispatchStatus::Failed {
                    detail: "dispatcher shut down".to_string(),
                });
                return;
            };
            guard.set(DispatchStatus::Running);
            let status = match pipeline.submit(request).await {
                Ok(outcome) => DispatchStatus::Completed { outcome },
                Err(err) => DispatchStatus::Failed {
                    detail: err.to_string(),
                },
            };
            guard.finish(status);
        });

        correlation_id
    }

    pub fn status(&self, correlation_id: &str) -> Option<DispatchStatus> {
        self.statuses
            .get(correlation_id)
            .map(|sender| (*sender.borrow()).clone())
    }

    /// Wait until the request finishes and return its final status.
    pub async fn wait(&self, correlation_id: &str) -> Result<DispatchStatus, CreditError> {
        let mut receiver = self
            .statuses
            .get(correlation_id)
            .map(|sender| sender.subscribe())
            .ok_or_else(|| CreditError::NotFound(format!("correlation id {correlation_id}")))?;
        let status = receiver
            .wait_for(DispatchStatus::is_finished)
            .await
            .map_err(|_| {
                CreditError::InvariantViolation(format!(
                    "status channel for {correlation_id} closed early"
                ))
            })?;
        Ok((*status).clone())
    }

    pub fn tracked(&self) -> usize {
        self.statuses.len()
    }
}

/// Marks the status `Failed` if the task is dropped before finishing.
struct StatusGuard {
    sender: watch::Sender<DispatchStatus>,
    finished: bool,
}

impl StatusGuard {
    fn new(sender: watch::Sender<DispatchStatus>) -> Self {
        Self {
            sender,
            finished: false,
        }
    }

    fn set(&self, status: DispatchStatus) {
        self.sender.send_replace(status);
    }

    fn finish(mut self, status: DispatchStatus) {
        if let DispatchStatus::Failed { detail } = &status {
            error!(detail = %detail, "dispatched request failed");
        }
        self.set(status);
        self.finished = true;
    }
}

impl Drop for StatusGuard {
    fn drop(&mut self) {
        if !self.finished {
            error!("dispatched request task ended without a result");
            self.sender.send_replace(DispatchStatus::Failed {
                detail: "request task panicked or was aborted".to_string(),
            });
        }
    }
}
