// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;

use crate::context::JobContext;
use crate::error::JobError;

/// A unit of executable work, registered by name.
///
/// Job rows persist the handler name plus JSON arguments rather than a
/// closure, so jobs survive process restarts and can be enqueued by one
/// process version and executed by another.
#[async_trait]
pub trait JobHandler: Send + Sync {
	/// Stable name the handler is registered and persisted under.
	fn name(&self) -> &str;

	async fn run(
		&self,
		ctx: &JobContext,
		args: &serde_json::Value,
	) -> std::result::Result<(), JobError>;
}

/// Process-wide map of handler names to executable handlers. Built once at
/// startup, then shared read-only by the client and the worker pool.
#[derive(Default)]
pub struct HandlerRegistry {
	handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
	pub fn new() -> Self {
		Self {
			handlers: HashMap::new(),
		}
	}

	pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
		self.handlers.insert(handler.name().to_string(), handler);
	}

	pub fn get(&self, name: &str) -> Option<Arc<dyn JobHandler>> {
		self.handlers.get(name).cloned()
	}

	pub fn contains(&self, name: &str) -> bool {
		self.handlers.contains_key(name)
	}

	pub fn names(&self) -> Vec<String> {
		self.handlers.keys().cloned().collect()
	}
}
