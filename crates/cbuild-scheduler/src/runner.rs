//! Drives executions to completion.

use cbuild_core::execution::{Conclusion, ExecutionState};
use cbuild_core::store::ExecutionStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{error, info};

use crate::engine::Engine;
use crate::error::{SchedulerError, SchedulerResult};

/// Runs the step loop of each execution in its own task.
#[derive(Clone)]
pub struct ExecutionRunner {
    engine: Arc<Engine>,
    executions: Arc<dyn ExecutionStore>,
}

impl ExecutionRunner {
    pub fn new(engine: Arc<Engine>, executions: Arc<dyn ExecutionStore>) -> Self {
        Self { engine, executions }
    }

    /// Step until the execution stops running, then take the terminal path.
    pub async fn drive(&self, mut state: ExecutionState) -> Conclusion {
        let execution = state.execution_id.clone();
        loop {
            if !state.is_running {
                return match self.engine.finish(state.clone()).await {
                    Ok(conclusion) => conclusion,
                    Err(e) => {
                        self.engine.fail(state, &e).await;
                        Conclusion::Error
                    }
                };
            }

            // Steps work on a copy; after a failure `state` is the last persisted one.
            match self.engine.step(state.clone()).await {
                Ok(next) => state = next,
                Err(e) => {
                    error!(execution = %execution, error = %e, "Execution step failed");
                    self.engine.fail(state, &e).await;
                    return Conclusion::Error;
                }
            }

            if state.is_running {
                sleep(Duration::from_secs(state.wait_seconds)).await;
            }
        }
    }

    pub fn spawn(&self, state: ExecutionState) -> JoinHandle<Conclusion> {
        let runner = self.clone();
        tokio::spawn(async move { runner.drive(state).await })
    }

    /// Pick up executions left unfinished by a previous process.
    pub async fn resume_all(&self) -> SchedulerResult<usize> {
        let records = self
            .executions
            .list_unfinished()
            .await
            .map_err(SchedulerError::Store)?;

        let count = records.len();
        for record in records {
            info!(repo = %record.repo_id, execution = %record.execution_id, "Resuming execution");
            self.spawn(record.state);
        }
        Ok(count)
    }
}
