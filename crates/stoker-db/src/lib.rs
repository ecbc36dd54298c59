// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! SQLite persistence layer for the Stoker job engine.
//!
//! Owns the durable job and recurring-schedule records. All state claiming
//! goes through the compare-and-swap updates on [`JobRepository`]; there is
//! no other mutual-exclusion mechanism in the engine.

pub mod error;
pub mod job;
pub mod pool;
pub mod schema;
pub mod testing;

pub use error::{DbError, Result};
pub use job::{JobKind, JobRecord, JobRepository, JobState, RecurringSchedule};
pub use pool::create_pool;
pub use schema::init_schema;
