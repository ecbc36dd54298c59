// Copyright (c) 2025 Geoffrey Huntley <ghuntley@ghuntley.com>. All rights reserved.
// SPDX-License-Identifier: Proprietary

//! Next-fire-time evaluation for recurring schedules.
//!
//! Pure functions over 5-field Unix cron expressions
//! (minute hour day-of-month month day-of-week). All times are UTC.

use chrono::{DateTime, Utc};
use cron::Schedule;
use std::str::FromStr;

use crate::error::{JobError, Result};

/// Convert a standard 5-field Unix cron expression to the 7-field format
/// expected by the `cron` crate.
///
/// 5-field format: minute hour day-of-month month day-of-week
/// 7-field format: second minute hour day-of-month month day-of-week year
///
/// We add "0" for seconds (run at :00 of each minute) and "*" for year (any year).
fn to_seven_field(expression: &str) -> String {
	let field_count = expression.split_whitespace().count();
	if field_count >= 6 {
		// Already in extended format, use as-is
		expression.to_string()
	} else if field_count == 5 {
		format!("0 {} *", expression)
	} else {
		// Invalid format, return as-is and let the parser error
		expression.to_string()
	}
}

fn next_single(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
	let schedule = Schedule::from_str(&to_seven_field(expression))
		.map_err(|e| JobError::InvalidExpression(e.to_string()))?;

	schedule.after(&after).next().ok_or_else(|| {
		JobError::InvalidExpression(format!("expression '{expression}' never fires again"))
	})
}

/// Earliest fire time strictly after `after`.
///
/// Fields are ANDed, except that a restricted day-of-month and a restricted
/// day-of-week form a union (standard cron semantics). The `cron` crate
/// intersects the two fields, so when both are restricted the union is
/// computed by evaluating each single-restriction variant and taking the
/// earlier result.
pub fn next_fire_after(expression: &str, after: DateTime<Utc>) -> Result<DateTime<Utc>> {
	let fields: Vec<&str> = expression.split_whitespace().collect();
	if fields.len() == 5 && fields[2] != "*" && fields[4] != "*" {
		let dom_only = format!("{} {} {} {} *", fields[0], fields[1], fields[2], fields[3]);
		let dow_only = format!("{} {} * {} {}", fields[0], fields[1], fields[3], fields[4]);
		let by_dom = next_single(&dom_only, after)?;
		let by_dow = next_single(&dow_only, after)?;
		Ok(by_dom.min(by_dow))
	} else {
		next_single(expression, after)
	}
}

/// Validate an expression without computing a fire time. Surfaced to callers
/// at registration so malformed schedules are never silently accepted.
pub fn validate(expression: &str) -> Result<()> {
	Schedule::from_str(&to_seven_field(expression))
		.map_err(|e| JobError::InvalidExpression(e.to_string()))?;
	Ok(())
}
