// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use stoker_db::DbError;

/// Engine error taxonomy. Only `NotFound` and `InvalidExpression` are meant
/// to reach external callers; `Failed` drives the retry state machine. Lost
/// CAS races are not errors, the repository reports them as `Ok(false)`.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
	#[error("Not found: {0}")]
	NotFound(String),

	#[error("Invalid cron expression: {0}")]
	InvalidExpression(String),

	#[error("Job failed: {message}")]
	Failed { message: String },

	#[error("Database error: {0}")]
	Db(#[from] DbError),
}

impl JobError {
	pub fn failed(message: impl Into<String>) -> Self {
		JobError::Failed {
			message: message.into(),
		}
	}
}

pub type Result<T> = std::result::Result<T, JobError>;
