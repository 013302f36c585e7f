//! Waiting for asynchronous engine tasks

use super::{SearchEngine, TaskHandle, TaskStatus};
use crate::error::{ObsearchError, Result};
use std::time::Duration;

/// Poll `task` until it reaches a terminal state or `timeout` elapses
///
/// Failed and canceled tasks become [`ObsearchError::TaskFailed`]; running
/// out of time becomes [`ObsearchError::TaskTimeout`].
pub async fn await_task(
    engine: &dyn SearchEngine,
    task: TaskHandle,
    timeout: Duration,
    poll_interval: Duration,
) -> Result<()> {
    let poll = async {
        loop {
            match engine.task_status(task).await? {
                TaskStatus::Succeeded => return Ok(()),
                TaskStatus::Failed(message) => {
                    return Err(ObsearchError::TaskFailed {
                        task_uid: task.uid,
                        message,
                    })
                }
                TaskStatus::Canceled => {
                    return Err(ObsearchError::TaskFailed {
                        task_uid: task.uid,
                        message: "task was canceled".to_string(),
                    })
                }
                TaskStatus::Enqueued | TaskStatus::Processing => {
                    tokio::time::sleep(poll_interval).await;
                }
            }
        }
    };

    match tokio::time::timeout(timeout, poll).await {
        Ok(result) => result,
        Err(_) => {
            tracing::warn!("Task {} still pending after {:?}", task.uid, timeout);
            Err(ObsearchError::TaskTimeout {
                task_uid: task.uid,
                timeout,
            })
        }
    }
}
