// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;

use crate::error::{DbError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
	Created,
	Scheduled,
	Enqueued,
	Processing,
	Succeeded,
	Failed,
	AwaitingRetry,
	Deleted,
}

impl JobState {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobState::Created => "created",
			JobState::Scheduled => "scheduled",
			JobState::Enqueued => "enqueued",
			JobState::Processing => "processing",
			JobState::Succeeded => "succeeded",
			JobState::Failed => "failed",
			JobState::AwaitingRetry => "awaiting_retry",
			JobState::Deleted => "deleted",
		}
	}

	pub fn is_terminal(&self) -> bool {
		matches!(
			self,
			JobState::Succeeded | JobState::Failed | JobState::Deleted
		)
	}
}

impl std::str::FromStr for JobState {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"created" => Ok(JobState::Created),
			"scheduled" => Ok(JobState::Scheduled),
			"enqueued" => Ok(JobState::Enqueued),
			"processing" => Ok(JobState::Processing),
			"succeeded" => Ok(JobState::Succeeded),
			"failed" => Ok(JobState::Failed),
			"awaiting_retry" => Ok(JobState::AwaitingRetry),
			"deleted" => Ok(JobState::Deleted),
			_ => Err(format!("unknown job state: {s}")),
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobKind {
	FireAndForget,
	Scheduled,
	Recurring,
	Continuation,
}

impl JobKind {
	pub fn as_str(&self) -> &'static str {
		match self {
			JobKind::FireAndForget => "fire_and_forget",
			JobKind::Scheduled => "scheduled",
			JobKind::Recurring => "recurring",
			JobKind::Continuation => "continuation",
		}
	}
}

impl std::str::FromStr for JobKind {
	type Err = String;

	fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
		match s {
			"fire_and_forget" => Ok(JobKind::FireAndForget),
			"scheduled" => Ok(JobKind::Scheduled),
			"recurring" => Ok(JobKind::Recurring),
			"continuation" => Ok(JobKind::Continuation),
			_ => Err(format!("unknown job kind: {s}")),
		}
	}
}

/// A durable job row. `due_at` is set for anything eligible for dispatch;
/// `parent_id` is set iff the job is a continuation; `recurring_key` is set
/// iff the job was materialized from a recurring schedule.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
	pub id: String,
	pub kind: JobKind,
	pub handler: String,
	pub args: serde_json::Value,
	pub state: JobState,
	pub created_at: DateTime<Utc>,
	pub due_at: Option<DateTime<Utc>>,
	pub claimed_at: Option<DateTime<Utc>>,
	pub finished_at: Option<DateTime<Utc>>,
	pub parent_id: Option<String>,
	pub recurring_key: Option<String>,
	pub attempt_count: u32,
	pub last_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecurringSchedule {
	pub key: String,
	pub cron_expression: String,
	pub handler: String,
	pub args: serde_json::Value,
	pub registered_at: DateTime<Utc>,
	pub last_fired_at: Option<DateTime<Utc>>,
}

type JobRow = (
	String,
	String,
	String,
	String,
	String,
	DateTime<Utc>,
	Option<DateTime<Utc>>,
	Option<DateTime<Utc>>,
	Option<DateTime<Utc>>,
	Option<String>,
	Option<String>,
	i64,
	Option<String>,
);

const JOB_COLUMNS: &str = "id, kind, handler, args, state, created_at, due_at, claimed_at, finished_at, parent_id, recurring_key, attempt_count, last_error";

fn decode_job(row: JobRow) -> Result<JobRecord> {
	let (
		id,
		kind,
		handler,
		args,
		state,
		created_at,
		due_at,
		claimed_at,
		finished_at,
		parent_id,
		recurring_key,
		attempt_count,
		last_error,
	) = row;

	Ok(JobRecord {
		id,
		kind: kind.parse().map_err(DbError::Internal)?,
		handler,
		args: serde_json::from_str(&args)?,
		state: state.parse().map_err(DbError::Internal)?,
		created_at,
		due_at,
		claimed_at,
		finished_at,
		parent_id,
		recurring_key,
		attempt_count: attempt_count as u32,
		last_error,
	})
}

type ScheduleRow = (
	String,
	String,
	String,
	String,
	DateTime<Utc>,
	Option<DateTime<Utc>>,
);

fn decode_schedule(row: ScheduleRow) -> Result<RecurringSchedule> {
	let (key, cron_expression, handler, args, registered_at, last_fired_at) = row;
	Ok(RecurringSchedule {
		key,
		cron_expression,
		handler,
		args: serde_json::from_str(&args)?,
		registered_at,
		last_fired_at,
	})
}

/// Repository over the `jobs` and `recurring_schedules` tables.
///
/// Every state transition is a conditional `UPDATE ... WHERE state = ?`;
/// `rows_affected == 0` means the caller lost the race (or the row is gone)
/// and must re-read before acting. This is the engine's sole claiming
/// primitive.
#[derive(Clone)]
pub struct JobRepository {
	pool: SqlitePool,
}

impl JobRepository {
	pub fn new(pool: SqlitePool) -> Self {
		Self { pool }
	}

	#[tracing::instrument(skip(self, job), fields(job_id = %job.id))]
	pub async fn create(&self, job: &JobRecord) -> Result<()> {
		sqlx::query(
			r#"
			INSERT INTO jobs (id, kind, handler, args, state, created_at, due_at, claimed_at, finished_at, parent_id, recurring_key, attempt_count, last_error)
			VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
			"#,
		)
		.bind(&job.id)
		.bind(job.kind.as_str())
		.bind(&job.handler)
		.bind(job.args.to_string())
		.bind(job.state.as_str())
		.bind(job.created_at)
		.bind(job.due_at)
		.bind(job.claimed_at)
		.bind(job.finished_at)
		.bind(&job.parent_id)
		.bind(&job.recurring_key)
		.bind(job.attempt_count as i64)
		.bind(&job.last_error)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn get(&self, id: &str) -> Result<Option<JobRecord>> {
		let row = sqlx::query_as::<_, JobRow>(&format!(
			"SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?"
		))
		.bind(id)
		.fetch_optional(&self.pool)
		.await?;

		row.map(decode_job).transpose()
	}

	/// Compare-and-swap the job state. Returns `false` when the stored state
	/// no longer matches `expected` (the caller lost the race).
	#[tracing::instrument(skip(self))]
	pub async fn update_state(&self, id: &str, expected: JobState, new: JobState) -> Result<bool> {
		let result = sqlx::query("UPDATE jobs SET state = ? WHERE id = ? AND state = ?")
			.bind(new.as_str())
			.bind(id)
			.bind(expected.as_str())
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected() == 1)
	}

	/// CAS into `processing`, stamping `claimed_at` for the recovery sweep.
	#[tracing::instrument(skip(self))]
	pub async fn claim(&self, id: &str, expected: JobState, now: DateTime<Utc>) -> Result<bool> {
		let result =
			sqlx::query("UPDATE jobs SET state = 'processing', claimed_at = ? WHERE id = ? AND state = ?")
				.bind(now)
				.bind(id)
				.bind(expected.as_str())
				.execute(&self.pool)
				.await?;

		Ok(result.rows_affected() == 1)
	}

	/// CAS `processing` into a terminal outcome. A `false` return means the
	/// job left `processing` underneath the worker (cancelled mid-flight) and
	/// the result must be discarded.
	#[tracing::instrument(skip(self, error))]
	pub async fn finish(
		&self,
		id: &str,
		outcome: JobState,
		error: Option<&str>,
		attempt_count: u32,
		now: DateTime<Utc>,
	) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET state = ?, finished_at = ?, last_error = ?, attempt_count = ?
			WHERE id = ? AND state = 'processing'
			"#,
		)
		.bind(outcome.as_str())
		.bind(now)
		.bind(error)
		.bind(attempt_count as i64)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// CAS `processing -> awaiting_retry`, recording the backoff due time.
	#[tracing::instrument(skip(self, error))]
	pub async fn schedule_retry(
		&self,
		id: &str,
		due_at: DateTime<Utc>,
		attempt_count: u32,
		error: &str,
	) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET state = 'awaiting_retry', due_at = ?, attempt_count = ?, last_error = ?, claimed_at = NULL
			WHERE id = ? AND state = 'processing'
			"#,
		)
		.bind(due_at)
		.bind(attempt_count as i64)
		.bind(error)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// CAS `awaiting_retry -> scheduled`, making the job pollable again.
	#[tracing::instrument(skip(self))]
	pub async fn release_retry(&self, id: &str) -> Result<bool> {
		self
			.update_state(id, JobState::AwaitingRetry, JobState::Scheduled)
			.await
	}

	/// CAS a waiting continuation `created -> enqueued`, due immediately.
	#[tracing::instrument(skip(self))]
	pub async fn release_continuation(&self, id: &str, due_at: DateTime<Utc>) -> Result<bool> {
		let result = sqlx::query(
			"UPDATE jobs SET state = 'enqueued', due_at = ? WHERE id = ? AND state = 'created'",
		)
		.bind(due_at)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// Cancel a job: any non-terminal state moves to `deleted`. A job in
	/// `processing` is only marked; the worker's completion CAS will then
	/// lose and its result is discarded. Returns `false` if the job was
	/// already terminal or absent.
	#[tracing::instrument(skip(self))]
	pub async fn cancel(&self, id: &str, now: DateTime<Utc>) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET state = 'deleted', finished_at = ?
			WHERE id = ? AND state IN ('created', 'scheduled', 'enqueued', 'processing', 'awaiting_retry')
			"#,
		)
		.bind(now)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// Jobs eligible for dispatch, best-effort FIFO within equal due times.
	#[tracing::instrument(skip(self))]
	pub async fn list_due(&self, before: DateTime<Utc>, limit: u32) -> Result<Vec<JobRecord>> {
		let rows = sqlx::query_as::<_, JobRow>(&format!(
			r#"
			SELECT {JOB_COLUMNS}
			FROM jobs
			WHERE state IN ('scheduled', 'enqueued') AND due_at <= ?
			ORDER BY due_at ASC, created_at ASC, id ASC
			LIMIT ?
			"#
		))
		.bind(before)
		.bind(limit as i64)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(decode_job).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_children(&self, parent_id: &str) -> Result<Vec<JobRecord>> {
		let rows = sqlx::query_as::<_, JobRow>(&format!(
			"SELECT {JOB_COLUMNS} FROM jobs WHERE parent_id = ? ORDER BY created_at ASC, id ASC"
		))
		.bind(parent_id)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(decode_job).collect()
	}

	/// Jobs stuck in `processing` whose claim predates `cutoff`.
	#[tracing::instrument(skip(self))]
	pub async fn list_stale_processing(&self, cutoff: DateTime<Utc>) -> Result<Vec<JobRecord>> {
		let rows = sqlx::query_as::<_, JobRow>(&format!(
			"SELECT {JOB_COLUMNS} FROM jobs WHERE state = 'processing' AND claimed_at <= ?"
		))
		.bind(cutoff)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(decode_job).collect()
	}

	/// CAS a presumed-abandoned `processing` job back to `scheduled`.
	#[tracing::instrument(skip(self))]
	pub async fn reset_stale(&self, id: &str, due_at: DateTime<Utc>) -> Result<bool> {
		let result = sqlx::query(
			r#"
			UPDATE jobs
			SET state = 'scheduled', due_at = ?, claimed_at = NULL
			WHERE id = ? AND state = 'processing'
			"#,
		)
		.bind(due_at)
		.bind(id)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}

	/// Whether a previous instance for this recurring key is still executing.
	#[tracing::instrument(skip(self))]
	pub async fn has_processing_for_key(&self, key: &str) -> Result<bool> {
		let row = sqlx::query_as::<_, (i64,)>(
			"SELECT COUNT(*) FROM jobs WHERE recurring_key = ? AND state = 'processing'",
		)
		.bind(key)
		.fetch_one(&self.pool)
		.await?;

		Ok(row.0 > 0)
	}

	#[tracing::instrument(skip(self))]
	pub async fn purge_terminal(&self, before: DateTime<Utc>) -> Result<u64> {
		let result = sqlx::query(
			"DELETE FROM jobs WHERE state IN ('succeeded', 'failed', 'deleted') AND finished_at < ?",
		)
		.bind(before)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected())
	}

	/// Idempotent upsert by key: re-registering replaces the expression and
	/// template without creating a duplicate schedule.
	#[tracing::instrument(skip(self, schedule), fields(key = %schedule.key))]
	pub async fn upsert_schedule(&self, schedule: &RecurringSchedule) -> Result<()> {
		sqlx::query(
			r#"
			INSERT INTO recurring_schedules (key, cron_expression, handler, args, registered_at, last_fired_at)
			VALUES (?, ?, ?, ?, ?, ?)
			ON CONFLICT(key) DO UPDATE SET
				cron_expression = excluded.cron_expression,
				handler = excluded.handler,
				args = excluded.args
			"#,
		)
		.bind(&schedule.key)
		.bind(&schedule.cron_expression)
		.bind(&schedule.handler)
		.bind(schedule.args.to_string())
		.bind(schedule.registered_at)
		.bind(schedule.last_fired_at)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	#[tracing::instrument(skip(self))]
	pub async fn get_schedule(&self, key: &str) -> Result<Option<RecurringSchedule>> {
		let row = sqlx::query_as::<_, ScheduleRow>(
			"SELECT key, cron_expression, handler, args, registered_at, last_fired_at FROM recurring_schedules WHERE key = ?",
		)
		.bind(key)
		.fetch_optional(&self.pool)
		.await?;

		row.map(decode_schedule).transpose()
	}

	#[tracing::instrument(skip(self))]
	pub async fn list_schedules(&self) -> Result<Vec<RecurringSchedule>> {
		let rows = sqlx::query_as::<_, ScheduleRow>(
			"SELECT key, cron_expression, handler, args, registered_at, last_fired_at FROM recurring_schedules ORDER BY key",
		)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(decode_schedule).collect()
	}

	#[tracing::instrument(skip(self))]
	pub async fn remove_schedule(&self, key: &str) -> Result<bool> {
		let result = sqlx::query("DELETE FROM recurring_schedules WHERE key = ?")
			.bind(key)
			.execute(&self.pool)
			.await?;

		Ok(result.rows_affected() == 1)
	}

	/// Advance `last_fired_at`, but only from the value the caller observed
	/// when it evaluated the schedule. Concurrent evaluation cycles that both
	/// see the same occurrence as due race here; exactly one wins and the
	/// loser must not materialize a job. A removed key simply loses.
	#[tracing::instrument(skip(self))]
	pub async fn mark_fired(
		&self,
		key: &str,
		observed: Option<DateTime<Utc>>,
		at: DateTime<Utc>,
	) -> Result<bool> {
		let result = sqlx::query(
			"UPDATE recurring_schedules SET last_fired_at = ? WHERE key = ? AND last_fired_at IS ?",
		)
		.bind(at)
		.bind(key)
		.bind(observed)
		.execute(&self.pool)
		.await?;

		Ok(result.rows_affected() == 1)
	}
}
