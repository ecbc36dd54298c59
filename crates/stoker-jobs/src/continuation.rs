// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use chrono::Utc;
use std::sync::Arc;
use stoker_db::{JobRepository, JobState};
use tracing::info;

use crate::error::Result;

/// Parent -> child release. Children are plain job rows carrying a
/// `parent_id`; a child becomes dispatchable only when its parent succeeds.
/// A failed parent leaves its children in `created` indefinitely.
pub struct ContinuationGraph {
	repository: Arc<JobRepository>,
}

impl ContinuationGraph {
	pub fn new(repository: Arc<JobRepository>) -> Self {
		Self { repository }
	}

	/// Enqueue every child of `parent_id` still waiting in `created`.
	///
	/// Idempotent: the `created -> enqueued` CAS makes a second invocation
	/// (or a concurrent one on another node) a no-op per child.
	#[tracing::instrument(skip(self))]
	pub async fn on_parent_succeeded(&self, parent_id: &str) -> Result<()> {
		let now = Utc::now();
		for child in self.repository.list_children(parent_id).await? {
			if child.state != JobState::Created {
				continue;
			}
			if self.repository.release_continuation(&child.id, now).await? {
				info!(parent_id, child_id = %child.id, "continuation enqueued");
			}
		}
		Ok(())
	}
}
