// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use stoker_db::{JobRecord, JobRepository, JobState};
use tokio::sync::{mpsc, Semaphore};
use tracing::{info, warn};

use crate::config::SchedulerConfig;
use crate::context::{CancellationToken, JobContext};
use crate::error::Result;
use crate::job::HandlerRegistry;

/// Bounded set of concurrent execution slots.
///
/// `submit` blocks while the pool is saturated, which is what keeps the
/// dispatcher from claiming more work than the process can run. Payload
/// outcomes are converted into store transitions here; they never cross the
/// pool boundary as errors.
pub struct WorkerPool {
	repository: Arc<JobRepository>,
	registry: Arc<HandlerRegistry>,
	config: SchedulerConfig,
	slots: Arc<Semaphore>,
	completions: mpsc::UnboundedSender<String>,
}

impl WorkerPool {
	pub fn new(
		repository: Arc<JobRepository>,
		registry: Arc<HandlerRegistry>,
		config: SchedulerConfig,
		completions: mpsc::UnboundedSender<String>,
	) -> Self {
		let slots = Arc::new(Semaphore::new(config.worker_count));
		Self {
			repository,
			registry,
			config,
			slots,
			completions,
		}
	}

	/// Run a claimed job on a free slot. The job must already be in
	/// `processing`; waiting for a slot happens before the spawn so the
	/// caller observes backpressure.
	pub async fn submit(&self, job: JobRecord) {
		let permit = match Arc::clone(&self.slots).acquire_owned().await {
			Ok(permit) => permit,
			// Semaphore closed only during teardown.
			Err(_) => return,
		};

		let repository = Arc::clone(&self.repository);
		let registry = Arc::clone(&self.registry);
		let config = self.config.clone();
		let completions = self.completions.clone();

		tokio::spawn(async move {
			let _permit = permit;
			if let Err(e) = execute_job(&repository, &registry, &config, &completions, job).await {
				warn!(error = %e, "job completion bookkeeping failed");
			}
		});
	}
}

/// Execute one claimed job and record its outcome.
pub(crate) async fn execute_job(
	repository: &JobRepository,
	registry: &HandlerRegistry,
	config: &SchedulerConfig,
	completions: &mpsc::UnboundedSender<String>,
	job: JobRecord,
) -> Result<()> {
	let ctx = JobContext {
		job_id: job.id.clone(),
		attempt: job.attempt_count,
		cancellation_token: CancellationToken::new(),
	};

	let outcome = run_payload(registry, ctx, job.handler.clone(), job.args.clone()).await;
	let now = Utc::now();

	match outcome {
		Ok(()) => {
			if repository
				.finish(&job.id, JobState::Succeeded, None, job.attempt_count, now)
				.await?
			{
				info!(job_id = %job.id, "job succeeded");
				// Continuations are released by the consumer of this channel.
				let _ = completions.send(job.id.clone());
			} else {
				info!(job_id = %job.id, "job cancelled mid-flight; result discarded");
			}
		}
		Err(message) => {
			let attempts = job.attempt_count + 1;
			if attempts < config.max_attempts {
				let delay = backoff_delay(config.base_retry_delay, config.max_retry_delay, attempts);
				let due = now
					+ chrono::Duration::from_std(delay)
						.unwrap_or_else(|_| chrono::Duration::seconds(config.max_retry_delay.as_secs() as i64));
				if repository
					.schedule_retry(&job.id, due, attempts, &message)
					.await?
				{
					repository.release_retry(&job.id).await?;
					warn!(
						job_id = %job.id,
						attempt = attempts,
						delay_ms = delay.as_millis() as u64,
						error = %message,
						"job failed, retry scheduled"
					);
				} else {
					info!(job_id = %job.id, "job cancelled mid-flight; failure discarded");
				}
			} else if repository
				.finish(&job.id, JobState::Failed, Some(&message), attempts, now)
				.await?
			{
				warn!(job_id = %job.id, attempts, error = %message, "job failed permanently");
			}
		}
	}

	Ok(())
}

/// Run the payload on its own task so a panicking handler is contained and
/// reported as an ordinary failure.
async fn run_payload(
	registry: &HandlerRegistry,
	ctx: JobContext,
	handler_name: String,
	args: serde_json::Value,
) -> std::result::Result<(), String> {
	let Some(handler) = registry.get(&handler_name) else {
		return Err(format!("no handler registered for '{handler_name}'"));
	};

	match tokio::spawn(async move { handler.run(&ctx, &args).await }).await {
		Ok(Ok(())) => Ok(()),
		Ok(Err(e)) => Err(e.to_string()),
		Err(join_err) => Err(format!("payload panicked: {join_err}")),
	}
}

/// Exponential backoff for the Nth attempt (1-based), capped.
pub(crate) fn backoff_delay(base: Duration, max: Duration, attempt: u32) -> Duration {
	let exponent = attempt.saturating_sub(1).min(31);
	base.saturating_mul(1u32 << exponent).min(max)
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::error::JobError;
	use crate::job::JobHandler;
	use async_trait::async_trait;
	use chrono::{DateTime, Utc};
	use std::sync::atomic::{AtomicU32, Ordering};
	use stoker_db::testing::create_job_test_pool;
	use stoker_db::JobKind;

	fn processing_job(id: &str, handler: &str, attempt_count: u32) -> JobRecord {
		JobRecord {
			id: id.to_string(),
			kind: JobKind::FireAndForget,
			handler: handler.to_string(),
			args: serde_json::json!({}),
			state: JobState::Processing,
			created_at: Utc::now(),
			due_at: Some(Utc::now()),
			claimed_at: Some(Utc::now()),
			finished_at: None,
			parent_id: None,
			recurring_key: None,
			attempt_count,
			last_error: None,
		}
	}

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

	struct AlwaysFails;

	#[async_trait]
	impl JobHandler for AlwaysFails {
		fn name(&self) -> &str {
			"always_fails"
		}

		async fn run(
			&self,
			_ctx: &JobContext,
			_args: &serde_json::Value,
		) -> std::result::Result<(), JobError> {
			Err(JobError::failed("smtp unreachable"))
		}
	}

	struct PanickingJob;

	#[async_trait]
	impl JobHandler for PanickingJob {
		fn name(&self) -> &str {
			"panics"
		}

		async fn run(
			&self,
			_ctx: &JobContext,
			_args: &serde_json::Value,
		) -> std::result::Result<(), JobError> {
			panic!("boom");
		}
	}

	fn test_config() -> SchedulerConfig {
		SchedulerConfig {
			max_attempts: 2,
			base_retry_delay: Duration::from_millis(10),
			max_retry_delay: Duration::from_millis(100),
			..SchedulerConfig::default()
		}
	}

	#[test]
	fn test_backoff_first_attempt_is_base() {
		let delay = backoff_delay(Duration::from_secs(1), Duration::from_secs(60), 1);
		assert_eq!(delay, Duration::from_secs(1));
	}

	#[test]
	fn test_backoff_doubles() {
		let base = Duration::from_secs(1);
		let max = Duration::from_secs(60);
		assert_eq!(backoff_delay(base, max, 2), Duration::from_secs(2));
		assert_eq!(backoff_delay(base, max, 3), Duration::from_secs(4));
		assert!(backoff_delay(base, max, 2) < backoff_delay(base, max, 3));
		assert!(backoff_delay(base, max, 3) < backoff_delay(base, max, 4));
	}

	#[test]
	fn test_backoff_caps_at_max() {
		let base = Duration::from_secs(1);
		let max = Duration::from_secs(60);
		assert_eq!(backoff_delay(base, max, 10), max);
		assert_eq!(backoff_delay(base, max, 100), max);
	}

	#[tokio::test]
	async fn test_success_records_and_emits_completion() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let runs = Arc::new(AtomicU32::new(0));
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(CountingJob {
			runs: Arc::clone(&runs),
		}));
		let (tx, mut rx) = mpsc::unbounded_channel();

		let job = processing_job("job-1", "counting", 0);
		repository.create(&job).await.unwrap();

		execute_job(&repository, &registry, &test_config(), &tx, job)
			.await
			.unwrap();

		assert_eq!(runs.load(Ordering::SeqCst), 1);
		let stored = repository.get("job-1").await.unwrap().unwrap();
		assert_eq!(stored.state, JobState::Succeeded);
		assert_eq!(rx.recv().await.unwrap(), "job-1");
	}

	#[tokio::test]
	async fn test_failure_schedules_retry_with_future_due() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(AlwaysFails));
		let (tx, mut rx) = mpsc::unbounded_channel();

		let job = processing_job("job-1", "always_fails", 0);
		repository.create(&job).await.unwrap();

		let before: DateTime<Utc> = Utc::now();
		execute_job(&repository, &registry, &test_config(), &tx, job)
			.await
			.unwrap();

		let stored = repository.get("job-1").await.unwrap().unwrap();
		assert_eq!(stored.state, JobState::Scheduled);
		assert_eq!(stored.attempt_count, 1);
		assert!(stored.due_at.unwrap() > before);
		assert!(stored.last_error.as_deref().unwrap().contains("smtp unreachable"));
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn test_retry_due_at_strictly_increases() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(AlwaysFails));
		let (tx, _rx) = mpsc::unbounded_channel();

		let config = SchedulerConfig {
			max_attempts: 4,
			base_retry_delay: Duration::from_secs(1),
			max_retry_delay: Duration::from_secs(60),
			..SchedulerConfig::default()
		};

		repository
			.create(&processing_job("job-1", "always_fails", 0))
			.await
			.unwrap();

		// One job, three consecutive retries; each retry must be pushed
		// further out than the last.
		let mut due_ats: Vec<DateTime<Utc>> = Vec::new();
		for _ in 0..3 {
			let current = repository.get("job-1").await.unwrap().unwrap();
			execute_job(&repository, &registry, &config, &tx, current)
				.await
				.unwrap();

			let stored = repository.get("job-1").await.unwrap().unwrap();
			assert_eq!(stored.state, JobState::Scheduled);
			due_ats.push(stored.due_at.unwrap());

			assert!(repository
				.claim("job-1", JobState::Scheduled, Utc::now())
				.await
				.unwrap());
		}

		assert!(due_ats[0] < due_ats[1]);
		assert!(due_ats[1] < due_ats[2]);
	}

	#[tokio::test]
	async fn test_final_failure_marks_failed() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(AlwaysFails));
		let (tx, mut rx) = mpsc::unbounded_channel();

		// Last allowed attempt under max_attempts = 2.
		let job = processing_job("job-1", "always_fails", 1);
		repository.create(&job).await.unwrap();

		execute_job(&repository, &registry, &test_config(), &tx, job)
			.await
			.unwrap();

		let stored = repository.get("job-1").await.unwrap().unwrap();
		assert_eq!(stored.state, JobState::Failed);
		assert_eq!(stored.attempt_count, 2);
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test]
	async fn test_unknown_handler_is_a_payload_failure() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let registry = HandlerRegistry::new();
		let (tx, _rx) = mpsc::unbounded_channel();

		let job = processing_job("job-1", "ghost", 1);
		repository.create(&job).await.unwrap();

		execute_job(&repository, &registry, &test_config(), &tx, job)
			.await
			.unwrap();

		let stored = repository.get("job-1").await.unwrap().unwrap();
		assert_eq!(stored.state, JobState::Failed);
		assert!(stored.last_error.as_deref().unwrap().contains("ghost"));
	}

	#[tokio::test]
	async fn test_panic_is_contained_and_retried() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(PanickingJob));
		let (tx, _rx) = mpsc::unbounded_channel();

		let job = processing_job("job-1", "panics", 0);
		repository.create(&job).await.unwrap();

		execute_job(&repository, &registry, &test_config(), &tx, job)
			.await
			.unwrap();

		let stored = repository.get("job-1").await.unwrap().unwrap();
		assert_eq!(stored.state, JobState::Scheduled);
		assert_eq!(stored.attempt_count, 1);
	}

	#[tokio::test]
	async fn test_cancelled_mid_flight_result_discarded() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let runs = Arc::new(AtomicU32::new(0));
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(CountingJob {
			runs: Arc::clone(&runs),
		}));
		let (tx, mut rx) = mpsc::unbounded_channel();

		let job = processing_job("job-1", "counting", 0);
		repository.create(&job).await.unwrap();

		// Caller cancels while the payload is (conceptually) running.
		repository.cancel("job-1", Utc::now()).await.unwrap();

		execute_job(&repository, &registry, &test_config(), &tx, job)
			.await
			.unwrap();

		let stored = repository.get("job-1").await.unwrap().unwrap();
		assert_eq!(stored.state, JobState::Deleted);
		// No continuation event for a discarded result.
		assert!(rx.try_recv().is_err());
	}

	#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
	async fn test_pool_bounds_concurrency() {
		let pool = create_job_test_pool().await;
		let repository = Arc::new(JobRepository::new(pool));
		let runs = Arc::new(AtomicU32::new(0));
		let mut registry = HandlerRegistry::new();
		registry.register(Arc::new(CountingJob {
			runs: Arc::clone(&runs),
		}));
		let (tx, _rx) = mpsc::unbounded_channel();

		let config = SchedulerConfig {
			worker_count: 2,
			..test_config()
		};
		let worker_pool = WorkerPool::new(
			Arc::clone(&repository),
			Arc::new(registry),
			config,
			tx,
		);

		for i in 0..8 {
			let job = processing_job(&format!("job-{i}"), "counting", 0);
			repository.create(&job).await.unwrap();
			worker_pool.submit(job).await;
		}

		for _ in 0..200 {
			if runs.load(Ordering::SeqCst) == 8 {
				break;
			}
			tokio::time::sleep(Duration::from_millis(10)).await;
		}
		assert_eq!(runs.load(Ordering::SeqCst), 8);
	}
}
