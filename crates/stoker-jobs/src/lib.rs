// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Durable background job engine.
//!
//! Jobs are persisted rows dispatched by a polling loop: fire-and-forget
//! jobs run immediately, scheduled jobs after a delay, recurring jobs on a
//! cron expression, and continuations after their parent succeeds. Any
//! number of scheduler processes may share one store; claiming is done with
//! compare-and-swap state transitions, never locks.
//!
//! Payloads are registered by name ([`JobHandler`]) and invoked with JSON
//! arguments, so queued work survives process restarts.

pub mod client;
pub mod config;
pub mod context;
pub mod continuation;
pub mod dispatcher;
pub mod error;
pub mod job;
pub mod recurring;
pub mod schedule;
pub mod scheduler;
pub mod worker;

pub use client::JobClient;
pub use config::SchedulerConfig;
pub use context::{CancellationToken, JobContext};
pub use error::{JobError, Result};
pub use job::{HandlerRegistry, JobHandler};
pub use schedule::{next_fire_after, validate};
pub use scheduler::JobScheduler;
pub use stoker_db::{JobKind, JobRecord, JobRepository, JobState, RecurringSchedule};
