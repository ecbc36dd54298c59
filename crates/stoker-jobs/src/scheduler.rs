// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use std::sync::Arc;
use stoker_db::JobRepository;
use tokio::sync::{broadcast, mpsc, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, instrument, warn};

use crate::client::JobClient;
use crate::config::SchedulerConfig;
use crate::continuation::ContinuationGraph;
use crate::dispatcher::{recover_stale, Dispatcher};
use crate::error::Result;
use crate::job::HandlerRegistry;
use crate::recurring::RecurringJobs;
use crate::worker::WorkerPool;

/// Owns the engine's background tasks: the dispatcher poll loop and the
/// continuation consumer. Handlers are registered up front; the store is the
/// only shared state, so several schedulers may run against one database.
pub struct JobScheduler {
	repository: Arc<JobRepository>,
	registry: Arc<HandlerRegistry>,
	config: SchedulerConfig,
	shutdown_tx: broadcast::Sender<()>,
	handles: Mutex<Vec<JoinHandle<()>>>,
}

impl JobScheduler {
	pub fn new(
		repository: Arc<JobRepository>,
		registry: HandlerRegistry,
		config: SchedulerConfig,
	) -> Self {
		let (shutdown_tx, _) = broadcast::channel(1);
		Self {
			repository,
			registry: Arc::new(registry),
			config,
			shutdown_tx,
			handles: Mutex::new(Vec::new()),
		}
	}

	/// Handle for submitting and observing jobs. Valid before `start`;
	/// submitted work just waits for the dispatcher.
	pub fn client(&self) -> JobClient {
		JobClient::new(Arc::clone(&self.repository), Arc::clone(&self.registry))
	}

	#[instrument(skip(self))]
	pub async fn start(&self) -> Result<()> {
		// Jobs claimed by a previous process that died mid-run come back
		// first, so they are dispatchable from the very first cycle.
		let recovered = recover_stale(
			&self.repository,
			self.config.staleness_threshold,
			chrono::Utc::now(),
		)
		.await?;
		if recovered > 0 {
			warn!(recovered, "recovered stale processing jobs at startup");
		}

		let (completions_tx, mut completions_rx) = mpsc::unbounded_channel::<String>();

		let continuations = ContinuationGraph::new(Arc::clone(&self.repository));
		let mut shutdown_rx = self.shutdown_tx.subscribe();
		let consumer = tokio::spawn(async move {
			loop {
				tokio::select! {
					maybe_id = completions_rx.recv() => {
						match maybe_id {
							Some(parent_id) => {
								if let Err(e) = continuations.on_parent_succeeded(&parent_id).await {
									warn!(parent_id = %parent_id, error = %e, "continuation release failed");
								}
							}
							None => break,
						}
					}
					_ = shutdown_rx.recv() => {
						info!("continuation consumer shutting down");
						break;
					}
				}
			}
		});

		let pool = Arc::new(WorkerPool::new(
			Arc::clone(&self.repository),
			Arc::clone(&self.registry),
			self.config.clone(),
			completions_tx,
		));
		let dispatcher = Dispatcher::new(
			Arc::clone(&self.repository),
			pool,
			RecurringJobs::new(Arc::clone(&self.repository)),
			self.config.clone(),
		);
		let loop_handle = tokio::spawn(dispatcher.run_loop(self.shutdown_tx.subscribe()));

		let mut handles = self.handles.lock().await;
		handles.push(consumer);
		handles.push(loop_handle);

		info!(
			workers = self.config.worker_count,
			poll_interval_ms = self.config.poll_interval.as_millis() as u64,
			handlers = self.registry.names().len(),
			"job scheduler started"
		);
		Ok(())
	}

	/// Stop the background loops and wait for them. In-flight payloads are
	/// not awaited; an abrupt stop is what the startup recovery sweep is for.
	#[instrument(skip(self))]
	pub async fn shutdown(&self) {
		let _ = self.shutdown_tx.send(());

		let mut handles = self.handles.lock().await;
		for handle in handles.drain(..) {
			let _ = handle.await;
		}

		info!("job scheduler shut down");
	}
}
