//! Admission control over a bounded set of running jobs.
//!
//! The [`Taskpile`] owns three queues that partition every job it has
//! ever been handed: pending, running, and finished. It has no timer of
//! its own; a driver calls [`Taskpile::reconcile`] on a fixed cadence and
//! each pass re-sorts the queues by observed process state, evicts over
//! the parallelism limit, and admits at most one job.

use std::collections::VecDeque;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::default_max_parallel;
use crate::error::Result;
use crate::job::{Job, JobSnapshot, JobState};

/// Bounded job queue.
pub struct Taskpile {
    pending: VecDeque<Arc<Job>>,
    running: Vec<Arc<Job>>,
    finished: Vec<Arc<Job>>,
    max_parallel: usize,
}

/// Serializable view of the whole queue.
#[derive(Debug, Clone, Serialize)]
pub struct PileSnapshot {
    pub pending: Vec<JobSnapshot>,
    pub running: Vec<JobSnapshot>,
    pub finished: Vec<JobSnapshot>,
    pub max_parallel: usize,
}

impl Taskpile {
    /// Create a queue running at most `max_parallel` jobs at once.
    pub fn new(max_parallel: usize) -> Self {
        Self {
            pending: VecDeque::new(),
            running: Vec::new(),
            finished: Vec::new(),
            max_parallel,
        }
    }

    /// Append a job to the tail of the pending queue. Nothing is started
    /// until the next [`Taskpile::reconcile`] pass.
    pub fn enqueue(&mut self, job: Arc<Job>) {
        debug!(job = %job.name(), "enqueued");
        self.pending.push_back(job);
    }

    pub fn max_parallel(&self) -> usize {
        self.max_parallel
    }

    /// Change the parallelism limit. Takes effect on the next
    /// [`Taskpile::reconcile`] pass; nothing is evicted or admitted here.
    pub fn set_max_parallel(&mut self, max_parallel: usize) {
        debug!(max_parallel, "parallelism limit changed");
        self.max_parallel = max_parallel;
    }

    /// Jobs waiting (or paused and waiting) to run, front first.
    pub fn pending(&self) -> impl ExactSizeIterator<Item = &Arc<Job>> {
        self.pending.iter()
    }

    /// Jobs currently admitted, oldest start first.
    pub fn running(&self) -> &[Arc<Job>] {
        &self.running
    }

    /// Jobs whose exit status has been collected, in completion order.
    pub fn finished(&self) -> &[Arc<Job>] {
        &self.finished
    }

    /// True once no pending or running work remains.
    pub fn is_idle(&self) -> bool {
        self.pending.is_empty() && self.running.is_empty()
    }

    pub fn snapshot(&self) -> PileSnapshot {
        PileSnapshot {
            pending: self.pending.iter().map(|j| j.snapshot()).collect(),
            running: self.running.iter().map(|j| j.snapshot()).collect(),
            finished: self.finished.iter().map(|j| j.snapshot()).collect(),
            max_parallel: self.max_parallel,
        }
    }

    /// One reconciliation pass.
    ///
    /// Re-sorts pending and running by each job's observed state (paused
    /// jobs move to the front of pending so they get their slot back
    /// before newer work; finished jobs have their exit status collected),
    /// then pauses the most recently started jobs while the limit is
    /// exceeded, and finally admits at most one job from the front of
    /// pending. Admitting a single job per pass is deliberate; the queue
    /// catches up across subsequent passes.
    ///
    /// Never call this concurrently with itself; the queue is built for
    /// one externally clocked driver.
    pub async fn reconcile(&mut self) -> Result<()> {
        self.sort_queues().await;
        self.evict_over_limit()?;
        self.admit_one().await?;
        Ok(())
    }

    /// Re-derive the three queues from observed job states.
    async fn sort_queues(&mut self) {
        let mut pending = Vec::new();
        let mut stopped = Vec::new();
        let mut running = Vec::new();

        for job in self.pending.drain(..).chain(self.running.drain(..)) {
            match job.state() {
                JobState::Pending => pending.push(job),
                JobState::Running => running.push(job),
                JobState::Stopped => stopped.push(job),
                JobState::Finished => {
                    // The status is already sent once Finished is
                    // observable, so this does not block.
                    if let Err(e) = job.await_exit().await {
                        warn!(job = %job.name(), error = %e, "failed to collect exit status");
                    }
                    info!(
                        job = %job.name(),
                        outcome = job.describe_outcome().as_deref().unwrap_or("[?]"),
                        "job finished"
                    );
                    self.finished.push(job);
                }
            }
        }

        self.pending = stopped.into_iter().chain(pending).collect();
        self.running = running;
    }

    /// Pause the most recently started jobs until the limit holds,
    /// putting them at the front of pending so they resume first.
    fn evict_over_limit(&mut self) -> Result<()> {
        while self.running.len() > self.max_parallel {
            let Some(job) = self.running.pop() else {
                break;
            };
            debug!(job = %job.name(), "evicting over parallelism limit");
            self.pending.push_front(job.clone());
            job.pause()?;
        }
        Ok(())
    }

    /// Admit the job at the front of pending if a slot is free: resume it
    /// if it was paused, start it otherwise. At most one admission per
    /// pass.
    async fn admit_one(&mut self) -> Result<()> {
        if self.running.len() >= self.max_parallel {
            return Ok(());
        }
        let Some(job) = self.pending.pop_front() else {
            return Ok(());
        };
        debug!(job = %job.name(), state = %job.state(), "admitting");
        self.running.push(job.clone());
        if job.state() == JobState::Stopped {
            job.resume()?;
        } else {
            job.start().await?;
        }
        Ok(())
    }

    /// Terminate every pending and running job and collect their exit
    /// statuses. Used by drivers on shutdown.
    pub async fn terminate_all(&mut self) {
        for job in self.pending.drain(..).chain(self.running.drain(..)) {
            job.terminate();
            if let Err(e) = job.await_exit().await {
                warn!(job = %job.name(), error = %e, "failed to collect exit status");
            }
            self.finished.push(job);
        }
    }
}

impl Default for Taskpile {
    fn default() -> Self {
        Self::new(default_max_parallel())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::job::OutputSinks;

    fn job(cmd: &str) -> Arc<Job> {
        let sinks = OutputSinks {
            stdout: tempfile::tempfile().unwrap(),
            stderr: tempfile::tempfile().unwrap(),
        };
        Arc::new(Job::new(cmd, None, 0, sinks).unwrap())
    }

    async fn wait_for_state(job: &Arc<Job>, state: JobState) {
        for _ in 0..500 {
            if job.state() == state {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("timed out waiting for job to become {state}");
    }

    #[tokio::test]
    async fn enqueue_has_no_side_effects() {
        let mut pile = Taskpile::new(2);
        let a = job("true");
        pile.enqueue(a.clone());
        assert_eq!(a.state(), JobState::Pending);
        assert_eq!(a.pid(), None);
        assert_eq!(pile.pending().len(), 1);
        assert!(pile.running().is_empty());
    }

    #[tokio::test]
    async fn admits_at_most_one_job_per_pass() {
        let mut pile = Taskpile::new(4);
        for _ in 0..3 {
            pile.enqueue(job("sleep 30"));
        }

        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 1);
        assert_eq!(pile.pending().len(), 2);

        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 2);

        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 3);
        assert_eq!(pile.pending().len(), 0);

        pile.terminate_all().await;
    }

    #[tokio::test]
    async fn running_never_exceeds_the_limit() {
        let mut pile = Taskpile::new(2);
        for _ in 0..5 {
            pile.enqueue(job("sleep 30"));
        }
        for _ in 0..6 {
            pile.reconcile().await.unwrap();
            assert!(pile.running().len() <= 2);
        }
        assert_eq!(pile.running().len(), 2);
        assert_eq!(pile.pending().len(), 3);

        pile.terminate_all().await;
    }

    #[tokio::test]
    async fn finished_jobs_move_over_and_free_their_slot() {
        let mut pile = Taskpile::new(1);
        let a = job("true");
        let b = job("sleep 30");
        pile.enqueue(a.clone());
        pile.enqueue(b.clone());

        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 1);
        assert!(Arc::ptr_eq(&pile.running()[0], &a));
        assert_eq!(pile.pending().len(), 1);

        wait_for_state(&a, JobState::Finished).await;

        pile.reconcile().await.unwrap();
        assert_eq!(pile.finished().len(), 1);
        assert!(Arc::ptr_eq(&pile.finished()[0], &a));
        assert_eq!(pile.running().len(), 1);
        assert!(Arc::ptr_eq(&pile.running()[0], &b));
        assert_eq!(pile.pending().len(), 0);
        assert_eq!(a.exit_code(), Some(0));

        pile.terminate_all().await;
    }

    #[tokio::test]
    async fn lowering_the_limit_pauses_the_newest_job() {
        let mut pile = Taskpile::new(2);
        let first = job("sleep 30");
        let second = job("sleep 30");
        pile.enqueue(first.clone());
        pile.enqueue(second.clone());
        pile.reconcile().await.unwrap();
        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 2);

        let pid_before = second.pid();
        pile.set_max_parallel(1);
        // No immediate effect before the next pass.
        assert_eq!(pile.running().len(), 2);

        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 1);
        assert!(Arc::ptr_eq(&pile.running()[0], &first));
        assert_eq!(second.state(), JobState::Stopped);
        assert!(Arc::ptr_eq(pile.pending().next().unwrap(), &second));

        // Raising the limit readmits the paused job by resuming it,
        // same process, same pid.
        pile.set_max_parallel(2);
        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 2);
        assert_eq!(second.state(), JobState::Running);
        assert_eq!(second.pid(), pid_before);

        pile.terminate_all().await;
    }

    #[tokio::test]
    async fn stopped_jobs_resume_before_pending_ones() {
        let mut pile = Taskpile::new(1);
        let a = job("sleep 30");
        let b = job("sleep 30");
        pile.enqueue(a.clone());
        pile.enqueue(b.clone());
        pile.reconcile().await.unwrap();
        assert!(Arc::ptr_eq(&pile.running()[0], &a));

        // Zero capacity pauses everything.
        pile.set_max_parallel(0);
        pile.reconcile().await.unwrap();
        assert!(pile.running().is_empty());
        assert_eq!(a.state(), JobState::Stopped);

        pile.set_max_parallel(1);
        pile.reconcile().await.unwrap();
        assert_eq!(pile.running().len(), 1);
        assert!(Arc::ptr_eq(&pile.running()[0], &a), "paused job should win the slot");
        assert_eq!(a.state(), JobState::Running);
        assert_eq!(b.state(), JobState::Pending);

        pile.terminate_all().await;
    }

    #[tokio::test]
    async fn terminate_all_collects_everything() {
        let mut pile = Taskpile::new(1);
        let a = job("sleep 30");
        let b = job("sleep 30");
        pile.enqueue(a.clone());
        pile.enqueue(b.clone());
        pile.reconcile().await.unwrap();

        pile.terminate_all().await;
        assert!(pile.is_idle());
        assert_eq!(pile.finished().len(), 2);
        assert_eq!(a.exit_signal(), Some(libc::SIGTERM));
        // Never started, so no pid and no exit status.
        assert_eq!(b.pid(), None);
        assert_eq!(b.exit_code(), None);
        assert_eq!(b.state(), JobState::Finished);
    }

    #[tokio::test]
    async fn queues_partition_all_jobs() {
        let mut pile = Taskpile::new(2);
        let jobs: Vec<_> = (0..4).map(|_| job("sleep 30")).collect();
        for j in &jobs {
            pile.enqueue(j.clone());
        }
        for _ in 0..5 {
            pile.reconcile().await.unwrap();
            let total = pile.pending().len() + pile.running().len() + pile.finished().len();
            assert_eq!(total, 4);
        }
        pile.terminate_all().await;
        assert_eq!(pile.finished().len(), 4);
    }
}
