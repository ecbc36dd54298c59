// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::SqlitePool;

use crate::error::Result;

/// Create the job engine tables if they do not exist.
///
/// Safe to call on every startup; all statements are idempotent.
#[tracing::instrument(skip(pool))]
pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS jobs (
			id TEXT PRIMARY KEY,
			kind TEXT NOT NULL,
			handler TEXT NOT NULL,
			args TEXT NOT NULL,
			state TEXT NOT NULL,
			created_at TEXT NOT NULL,
			due_at TEXT,
			claimed_at TEXT,
			finished_at TEXT,
			parent_id TEXT,
			recurring_key TEXT,
			attempt_count INTEGER NOT NULL DEFAULT 0,
			last_error TEXT
		)
		"#,
	)
	.execute(pool)
	.await?;

	sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_state_due ON jobs(state, due_at)")
		.execute(pool)
		.await?;

	sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_parent ON jobs(parent_id)")
		.execute(pool)
		.await?;

	sqlx::query("CREATE INDEX IF NOT EXISTS idx_jobs_recurring_key ON jobs(recurring_key, state)")
		.execute(pool)
		.await?;

	sqlx::query(
		r#"
		CREATE TABLE IF NOT EXISTS recurring_schedules (
			key TEXT PRIMARY KEY,
			cron_expression TEXT NOT NULL,
			handler TEXT NOT NULL,
			args TEXT NOT NULL,
			registered_at TEXT NOT NULL,
			last_fired_at TEXT
		)
		"#,
	)
	.execute(pool)
	.await?;

	tracing::debug!("job engine schema initialized");
	Ok(())
}
