// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use stoker_db::{JobRepository, JobState};
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::SchedulerConfig;
use crate::error::Result;
use crate::recurring::RecurringJobs;
use crate::worker::WorkerPool;

/// Polls the store for due work and hands claimed jobs to the worker pool.
///
/// Any number of dispatchers may run against the same store; the claim CAS
/// is what keeps a job on exactly one of them. Losing a claim is normal and
/// silent.
pub struct Dispatcher {
	repository: Arc<JobRepository>,
	pool: Arc<WorkerPool>,
	recurring: RecurringJobs,
	config: SchedulerConfig,
}

impl Dispatcher {
	pub fn new(
		repository: Arc<JobRepository>,
		pool: Arc<WorkerPool>,
		recurring: RecurringJobs,
		config: SchedulerConfig,
	) -> Self {
		Self {
			repository,
			pool,
			recurring,
			config,
		}
	}

	/// One dispatch cycle: materialize due recurring occurrences so they are
	/// candidates this cycle, then claim and submit everything due, in
	/// ascending due-time order.
	#[tracing::instrument(skip(self))]
	pub async fn run_cycle(&self) -> Result<u32> {
		let now = Utc::now();
		self.recurring.tick(now).await?;

		let due = self.repository.list_due(now, self.config.batch_size).await?;
		let mut dispatched = 0;

		for mut job in due {
			if self.repository.claim(&job.id, job.state, now).await? {
				job.state = JobState::Processing;
				job.claimed_at = Some(now);
				self.pool.submit(job).await;
				dispatched += 1;
			} else {
				// Another dispatch cycle or node won the claim.
				debug!(job_id = %job.id, "claim lost, skipping");
			}
		}

		Ok(dispatched)
	}

	/// Repeating poll loop; runs until the shutdown channel fires. The
	/// recovery sweep piggybacks on this loop at its own, longer interval.
	pub async fn run_loop(self, mut shutdown_rx: broadcast::Receiver<()>) {
		let mut last_sweep = Instant::now();
		loop {
			tokio::select! {
				_ = tokio::time::sleep(self.config.poll_interval) => {
					if let Err(e) = self.run_cycle().await {
						warn!(error = %e, "dispatch cycle failed");
					}
					if last_sweep.elapsed() >= self.config.stale_sweep_interval {
						last_sweep = Instant::now();
						if let Err(e) =
							recover_stale(&self.repository, self.config.staleness_threshold, Utc::now()).await
						{
							warn!(error = %e, "stale job sweep failed");
						}
					}
				}
				_ = shutdown_rx.recv() => {
					info!("dispatcher shutting down");
					break;
				}
			}
		}
	}
}

/// Reset jobs stuck in `processing` past the staleness threshold back to
/// `scheduled`. This is what makes a crashed or force-killed worker
/// non-fatal: its claimed jobs are re-dispatched instead of stranded.
#[tracing::instrument(skip(repository))]
pub async fn recover_stale(
	repository: &JobRepository,
	threshold: Duration,
	now: DateTime<Utc>,
) -> Result<u32> {
	let cutoff = now
		- chrono::Duration::from_std(threshold).unwrap_or_else(|_| chrono::Duration::seconds(300));
	let mut recovered = 0;

	for job in repository.list_stale_processing(cutoff).await? {
		if repository.reset_stale(&job.id, now).await? {
			warn!(job_id = %job.id, claimed_at = ?job.claimed_at, "stale processing job recovered");
			recovered += 1;
		}
	}

	Ok(recovered)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::context::JobContext;
	use crate::error::JobError;
	use crate::job::{HandlerRegistry, JobHandler};
	use async_trait::async_trait;
	use chrono::Duration as ChronoDuration;
	use std::sync::atomic::{AtomicU32, Ordering};
	use stoker_db::testing::create_job_test_pool;
	use stoker_db::{JobKind, JobRecord};
	use tokio::sync::mpsc;

	struct CountingJob {
		runs: Arc<AtomicU32>,
	}

	#[async_trait]
	impl JobHandler for CountingJob {
		fn name(&self) -> &str {
			"counting"
		}

		async fn run(
			&self,
			_ctx: &JobContext,
			_args: &serde_json::Value,
		) -> std::result::Result<(), JobError> {
			self.runs.fetch_add(1, Ordering::SeqCst);
			Ok(())
		}
	}

	fn due_job(id: &str, due_at: DateTime<Utc>) -> JobRecord {
		JobRecord {
			id: id.to_string(),
			kind: JobKind::FireAndForget,
			handler: "counting".to_string(),
			args: serde_json::json!({}),
			state: JobState::Enqueued,
			created_at: due_at,
			due_at: Some(due_at),
			claimed_at: None,
			finished_at: None,
			parent_id: None,
			recurring_key: None,
			attempt_count: 0,
			last_error: None,
		}
	}

	fn build_dispatcher(
		repository: Arc<JobRepository>,
		runs: Arc<AtomicU32>,
	) -> (Dispatcher, mpsc::UnboundedReceiver<String>) {
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(CountingJob { runs }));
		let config = SchedulerConfig::default();
		let (tx, rx) = mpsc::unbounded_channel();
		let pool = Arc::new(WorkerPool::new(
			Arc::clone(&repository),
			Arc::new(registry),
			config.clone(),
			tx,
		));
		let recurring = RecurringJobs::new(Arc::clone(&repository));
		(Dispatcher::new(repository, pool, recurring, config), rx)
	}

	#[tokio::test]
	async fn test_cycle_dispatches_due_jobs_only() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let runs = Arc::new(AtomicU32::new(0));
		let (dispatcher, mut rx) = build_dispatcher(Arc::clone(&repository), Arc::clone(&runs));

		let now = Utc::now();
		repository
			.create(&due_job("job-due", now - ChronoDuration::seconds(5)))
			.await
			.unwrap();
		repository
			.create(&due_job("job-future", now + ChronoDuration::hours(1)))
			.await
			.unwrap();

		let dispatched = dispatcher.run_cycle().await.unwrap();
		assert_eq!(dispatched, 1);

		// The worker reports completion through the channel once done.
		assert_eq!(rx.recv().await.unwrap(), "job-due");
		let done = repository.get("job-due").await.unwrap().unwrap();
		assert_eq!(done.state, JobState::Succeeded);

		let waiting = repository.get("job-future").await.unwrap().unwrap();
		assert_eq!(waiting.state, JobState::Enqueued);
		assert_eq!(runs.load(Ordering::SeqCst), 1);
	}

	#[tokio::test]
	async fn test_cycle_skips_already_claimed() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let runs = Arc::new(AtomicU32::new(0));
		let (dispatcher, _rx) = build_dispatcher(Arc::clone(&repository), Arc::clone(&runs));

		let now = Utc::now();
		repository
			.create(&due_job("job-1", now - ChronoDuration::seconds(5)))
			.await
			.unwrap();
		// Another node claims between the list and our CAS.
		repository.claim("job-1", JobState::Enqueued, now).await.unwrap();

		let dispatched = dispatcher.run_cycle().await.unwrap();
		assert_eq!(dispatched, 0);
		assert_eq!(runs.load(Ordering::SeqCst), 0);
	}

	#[tokio::test]
	async fn test_recover_stale_resets_only_old_claims() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));

		let now = Utc::now();
		let mut stale = due_job("job-stale", now - ChronoDuration::hours(1));
		stale.state = JobState::Processing;
		stale.claimed_at = Some(now - ChronoDuration::hours(1));
		repository.create(&stale).await.unwrap();

		let mut fresh = due_job("job-fresh", now);
		fresh.state = JobState::Processing;
		fresh.claimed_at = Some(now);
		repository.create(&fresh).await.unwrap();

		let recovered = recover_stale(&repository, Duration::from_secs(300), now)
			.await
			.unwrap();
		assert_eq!(recovered, 1);

		let reset = repository.get("job-stale").await.unwrap().unwrap();
		assert_eq!(reset.state, JobState::Scheduled);
		assert!(reset.due_at.unwrap() <= Utc::now());

		let untouched = repository.get("job-fresh").await.unwrap().unwrap();
		assert_eq!(untouched.state, JobState::Processing);
	}

	#[tokio::test]
	async fn test_recovered_job_redispatches() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let runs = Arc::new(AtomicU32::new(0));
		let (dispatcher, mut rx) = build_dispatcher(Arc::clone(&repository), Arc::clone(&runs));

		let now = Utc::now();
		let mut stale = due_job("job-1", now - ChronoDuration::hours(1));
		stale.state = JobState::Processing;
		stale.claimed_at = Some(now - ChronoDuration::hours(1));
		repository.create(&stale).await.unwrap();

		recover_stale(&repository, Duration::from_secs(300), now)
			.await
			.unwrap();
		dispatcher.run_cycle().await.unwrap();

		assert_eq!(rx.recv().await.unwrap(), "job-1");
		let done = repository.get("job-1").await.unwrap().unwrap();
		assert_eq!(done.state, JobState::Succeeded);
	}
}
