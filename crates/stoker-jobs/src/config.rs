// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::time::Duration;

/// Tunables for the scheduler, dispatcher, and worker pool.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
	/// How often the dispatcher polls the store for due jobs.
	pub poll_interval: Duration,
	/// Concurrent worker execution slots.
	pub worker_count: usize,
	/// Maximum candidates fetched per dispatch cycle.
	pub batch_size: u32,
	/// Total execution attempts before a job is marked failed.
	pub max_attempts: u32,
	/// First retry delay; doubles per attempt.
	pub base_retry_delay: Duration,
	/// Cap on the exponential backoff.
	pub max_retry_delay: Duration,
	/// How long a job may sit in `processing` before the recovery sweep
	/// presumes its worker is gone.
	pub staleness_threshold: Duration,
	/// How often the recovery sweep re-runs after startup.
	pub stale_sweep_interval: Duration,
}

impl Default for SchedulerConfig {
	fn default() -> Self {
		Self {
			poll_interval: Duration::from_secs(2),
			worker_count: 4,
			batch_size: 100,
			max_attempts: 3,
			base_retry_delay: Duration::from_secs(1),
			max_retry_delay: Duration::from_secs(60),
			staleness_threshold: Duration::from_secs(300),
			stale_sweep_interval: Duration::from_secs(60),
		}
	}
}
