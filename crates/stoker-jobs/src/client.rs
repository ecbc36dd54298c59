// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use stoker_db::{JobKind, JobRecord, JobRepository, JobState, RecurringSchedule};
use tracing::info;

use crate::error::{JobError, Result};
use crate::job::HandlerRegistry;
use crate::schedule;

/// Caller-facing API: the surface an HTTP layer (or any embedder) uses to
/// submit and observe work. Cheap to clone; all state lives in the store.
#[derive(Clone)]
pub struct JobClient {
	repository: Arc<JobRepository>,
	registry: Arc<HandlerRegistry>,
}

impl JobClient {
	pub fn new(repository: Arc<JobRepository>, registry: Arc<HandlerRegistry>) -> Self {
		Self {
			repository,
			registry,
		}
	}

	/// Create a fire-and-forget job, due immediately.
	#[tracing::instrument(skip(self, args))]
	pub async fn enqueue(&self, handler: &str, args: serde_json::Value) -> Result<String> {
		self.ensure_registered(handler)?;
		let now = Utc::now();
		let job = self.new_record(JobKind::FireAndForget, handler, args, JobState::Enqueued, now, Some(now));
		self.repository.create(&job).await?;
		info!(job_id = %job.id, handler, "job enqueued");
		Ok(job.id)
	}

	/// Create a job that becomes due after `delay`.
	#[tracing::instrument(skip(self, args))]
	pub async fn schedule(
		&self,
		handler: &str,
		args: serde_json::Value,
		delay: Duration,
	) -> Result<String> {
		self.ensure_registered(handler)?;
		let now = Utc::now();
		// Delays beyond chrono's range are clamped rather than rejected.
		let due = now
			+ chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::days(365 * 100));
		let job = self.new_record(JobKind::Scheduled, handler, args, JobState::Scheduled, now, Some(due));
		self.repository.create(&job).await?;
		info!(job_id = %job.id, handler, due_at = %due, "job scheduled");
		Ok(job.id)
	}

	/// Idempotent upsert of a named recurring schedule. The expression is
	/// validated here so a malformed schedule is rejected at registration,
	/// never silently at evaluation.
	#[tracing::instrument(skip(self, args))]
	pub async fn add_or_update_recurring(
		&self,
		key: &str,
		cron_expression: &str,
		handler: &str,
		args: serde_json::Value,
	) -> Result<()> {
		schedule::validate(cron_expression)?;
		self.ensure_registered(handler)?;

		self
			.repository
			.upsert_schedule(&RecurringSchedule {
				key: key.to_string(),
				cron_expression: cron_expression.to_string(),
				handler: handler.to_string(),
				args,
				registered_at: Utc::now(),
				last_fired_at: None,
			})
			.await?;
		info!(key, cron_expression, handler, "recurring schedule registered");
		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn remove_recurring(&self, key: &str) -> Result<()> {
		if !self.repository.remove_schedule(key).await? {
			return Err(JobError::NotFound(key.to_string()));
		}
		info!(key, "recurring schedule removed");
		Ok(())
	}

	/// Create a continuation that runs only after `parent_id` succeeds. If
	/// the parent has already succeeded the child is enqueued immediately.
	#[tracing::instrument(skip(self, args))]
	pub async fn continue_with(
		&self,
		parent_id: &str,
		handler: &str,
		args: serde_json::Value,
	) -> Result<String> {
		self.ensure_registered(handler)?;
		let parent = self
			.repository
			.get(parent_id)
			.await?
			.ok_or_else(|| JobError::NotFound(parent_id.to_string()))?;

		let now = Utc::now();
		let mut job = self.new_record(JobKind::Continuation, handler, args, JobState::Created, now, None);
		job.parent_id = Some(parent_id.to_string());
		self.repository.create(&job).await?;

		if parent.state == JobState::Succeeded {
			self.repository.release_continuation(&job.id, now).await?;
		}

		info!(job_id = %job.id, parent_id, handler, "continuation created");
		Ok(job.id)
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_state(&self, id: &str) -> Result<JobState> {
		let job = self
			.repository
			.get(id)
			.await?
			.ok_or_else(|| JobError::NotFound(id.to_string()))?;
		Ok(job.state)
	}

	/// Cancel a job. Waiting jobs are deleted immediately; a `processing`
	/// job is marked so its in-flight result is discarded on completion.
	/// Already-terminal jobs are left as they are.
	#[tracing::instrument(skip(self))]
	pub async fn delete(&self, id: &str) -> Result<()> {
		if self.repository.get(id).await?.is_none() {
			return Err(JobError::NotFound(id.to_string()));
		}
		if self.repository.cancel(id, Utc::now()).await? {
			info!(job_id = %id, "job cancelled");
		}
		Ok(())
	}

	fn ensure_registered(&self, handler: &str) -> Result<()> {
		if !self.registry.contains(handler) {
			return Err(JobError::NotFound(format!("handler '{handler}'")));
		}
		Ok(())
	}

	fn new_record(
		&self,
		kind: JobKind,
		handler: &str,
		args: serde_json::Value,
		state: JobState,
		created_at: DateTime<Utc>,
		due_at: Option<DateTime<Utc>>,
	) -> JobRecord {
		JobRecord {
			id: uuid::Uuid::new_v4().to_string(),
			kind,
			handler: handler.to_string(),
			args,
			state,
			created_at,
			due_at,
			claimed_at: None,
			finished_at: None,
			parent_id: None,
			recurring_key: None,
			attempt_count: 0,
			last_error: None,
		}
	}
}
