// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::{DateTime, Utc};
use std::sync::Arc;
use stoker_db::{JobKind, JobRecord, JobRepository, JobState};
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::schedule::next_fire_after;

/// Materializes due occurrences of registered recurring schedules into
/// dispatchable job rows. The schedules themselves are owned by the store;
/// this type is stateless between ticks.
pub struct RecurringJobs {
	repository: Arc<JobRepository>,
}

impl RecurringJobs {
	pub fn new(repository: Arc<JobRepository>) -> Self {
		Self { repository }
	}

	/// Evaluate every schedule once. For each whose next fire time is due,
	/// advance `last_fired_at` to `now` and insert a fresh `recurring` job,
	/// collapsing any occurrences missed during downtime into this single
	/// run. A key whose previous instance is still `processing` is skipped
	/// without advancing, so the occurrence fires once that run finishes.
	#[tracing::instrument(skip(self))]
	pub async fn tick(&self, now: DateTime<Utc>) -> Result<u32> {
		let mut fired = 0;

		for schedule in self.repository.list_schedules().await? {
			let reference = schedule.last_fired_at.unwrap_or(schedule.registered_at);
			let next = match next_fire_after(&schedule.cron_expression, reference) {
				Ok(next) => next,
				// Expressions are validated at registration; a row that fails
				// here was written by an incompatible version. Skip, loudly.
				Err(e) => {
					warn!(key = %schedule.key, error = %e, "unevaluable recurring expression, skipping");
					continue;
				}
			};

			if next > now {
				continue;
			}

			if self.repository.has_processing_for_key(&schedule.key).await? {
				debug!(key = %schedule.key, "previous instance still processing, occurrence deferred");
				continue;
			}

			// Another evaluation cycle, possibly in another process against
			// the same store, may see this occurrence as due too. Whoever
			// advances last_fired_at from the value read above owns it; the
			// loser skips without inserting a row.
			if !self
				.repository
				.mark_fired(&schedule.key, schedule.last_fired_at, now)
				.await?
			{
				debug!(key = %schedule.key, "occurrence claimed by a concurrent cycle");
				continue;
			}

			let job = JobRecord {
				id: uuid::Uuid::new_v4().to_string(),
				kind: JobKind::Recurring,
				handler: schedule.handler.clone(),
				args: schedule.args.clone(),
				state: JobState::Enqueued,
				created_at: now,
				due_at: Some(now),
				claimed_at: None,
				finished_at: None,
				parent_id: None,
				recurring_key: Some(schedule.key.clone()),
				attempt_count: 0,
				last_error: None,
			};
			self.repository.create(&job).await?;
			info!(key = %schedule.key, job_id = %job.id, "recurring occurrence enqueued");
			fired += 1;
		}

		Ok(fired)
	}
}
