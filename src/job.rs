//! Singleton job lifecycle guard, keyed on the single `job` row named
//! [`crate::model::MQTT_TRANSFER_JOB_NAME`].
//!
//! `Drop` can't run the async `UPDATE` needed to mark a job finished, so
//! callers must call [`JobGuard::finish`] explicitly on every exit path;
//! `Drop` only logs an error if a guard was dropped without `finish` ever
//! having run, which would otherwise wedge the job in `RUNNING` forever.

use crate::db::Repository;
use crate::error::Result;
use crate::model::{JobState, MQTT_TRANSFER_JOB_NAME};
use tracing::error;

pub struct JobGuard<'a> {
    repo: &'a dyn Repository,
    name: &'static str,
    finished: bool,
}

impl<'a> JobGuard<'a> {
    /// Try to acquire the singleton job lock. Returns `Ok(None)` if the job
    /// is already `RUNNING`, never an error for that case.
    pub async fn acquire(repo: &'a dyn Repository) -> Result<Option<JobGuard<'a>>> {
        let job = repo.job(MQTT_TRANSFER_JOB_NAME).await?;
        if let Some(job) = job {
            if job.state == JobState::Running.as_str() {
                return Ok(None);
            }
        }
        repo.set_job_state(MQTT_TRANSFER_JOB_NAME, JobState::Running).await?;
        Ok(Some(JobGuard { repo, name: MQTT_TRANSFER_JOB_NAME, finished: false }))
    }

    /// Record the run's outcome and release the lock. Must be called on
    /// every path out of a run, success or failure.
    pub async fn finish(mut self, exit_code: i32) -> Result<()> {
        self.repo.finish_job(self.name, exit_code).await?;
        self.finished = true;
        Ok(())
    }
}

impl Drop for JobGuard<'_> {
    fn drop(&mut self) {
        if !self.finished {
            error!(job = self.name, "JobGuard dropped without calling finish(); job left RUNNING");
        }
    }
}
