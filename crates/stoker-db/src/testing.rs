// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::schema::init_schema;

// A pooled ":memory:" database exists per-connection, so the test pool is
// pinned to a single connection.
pub async fn create_test_pool() -> SqlitePool {
	SqlitePoolOptions::new()
		.max_connections(1)
		.connect(":memory:")
		.await
		.unwrap()
}

pub async fn create_job_test_pool() -> SqlitePool {
	let pool = create_test_pool().await;
	init_schema(&pool).await.unwrap();
	pool
}
