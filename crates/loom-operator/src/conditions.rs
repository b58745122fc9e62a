//! Status condition machinery shared by all Loom reconcilers
//!
//! Every reconciled kind carries the same three conditions: `Ready`,
//! `Degraded`, `Progressing`. Exactly one of them is True at rest;
//! `Ready=Unknown` is the transient state between finalizer attachment and
//! the first resolution pass. Transition times only move when a condition's
//! status value actually changes, so no-op reconciles do not flap status.

use crate::crd::{condition_status, condition_type, Condition, LoomStatus};
use chrono::Utc;
use std::collections::BTreeMap;

/// Reason set on Ready=True after a successful composition
pub const REASON_COMPOSED: &str = "Composed";

/// Reason set on Ready=Unknown while resolution has not started
pub const REASON_PENDING: &str = "Pending";

/// Build one condition, preserving the previous transition time when the
/// status value is unchanged
fn condition(
    previous: Option<&LoomStatus>,
    r#type: &str,
    status: &str,
    reason: &str,
    message: &str,
    now: &str,
) -> Condition {
    let last_transition_time = previous
        .and_then(|p| p.condition(r#type))
        .filter(|c| c.status == status)
        .map(|c| c.last_transition_time.clone())
        .unwrap_or_else(|| now.to_string());

    Condition {
        r#type: r#type.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
    }
}

/// Condition set for a successfully composed resource:
/// Ready=True, Degraded=False, Progressing=False
pub fn ready(previous: Option<&LoomStatus>, message: &str) -> Vec<Condition> {
    let now = Utc::now().to_rfc3339();
    vec![
        condition(
            previous,
            condition_type::READY,
            condition_status::TRUE,
            REASON_COMPOSED,
            message,
            &now,
        ),
        condition(
            previous,
            condition_type::DEGRADED,
            condition_status::FALSE,
            REASON_COMPOSED,
            "",
            &now,
        ),
        condition(
            previous,
            condition_type::PROGRESSING,
            condition_status::FALSE,
            REASON_COMPOSED,
            "",
            &now,
        ),
    ]
}

/// Condition set for a resource that cannot compose:
/// Degraded=True, Progressing=False, Ready=False
pub fn degraded(previous: Option<&LoomStatus>, reason: &str, message: &str) -> Vec<Condition> {
    let now = Utc::now().to_rfc3339();
    vec![
        condition(
            previous,
            condition_type::READY,
            condition_status::FALSE,
            reason,
            message,
            &now,
        ),
        condition(
            previous,
            condition_type::DEGRADED,
            condition_status::TRUE,
            reason,
            message,
            &now,
        ),
        condition(
            previous,
            condition_type::PROGRESSING,
            condition_status::FALSE,
            reason,
            message,
            &now,
        ),
    ]
}

/// Condition set for a resource whose resolution has not begun:
/// Progressing=True, Degraded=False, Ready=Unknown
pub fn progressing(previous: Option<&LoomStatus>) -> Vec<Condition> {
    let now = Utc::now().to_rfc3339();
    vec![
        condition(
            previous,
            condition_type::READY,
            condition_status::UNKNOWN,
            REASON_PENDING,
            "resolution has not started",
            &now,
        ),
        condition(
            previous,
            condition_type::DEGRADED,
            condition_status::FALSE,
            REASON_PENDING,
            "",
            &now,
        ),
        condition(
            previous,
            condition_type::PROGRESSING,
            condition_status::TRUE,
            REASON_PENDING,
            "resolution has not started",
            &now,
        ),
    ]
}

/// Assemble a full status from a condition set
pub fn build_status(
    conditions: Vec<Condition>,
    observed_generation: i64,
    attributes: BTreeMap<String, String>,
) -> LoomStatus {
    LoomStatus {
        conditions,
        observed_generation,
        attributes,
    }
}

/// Whether a status currently reports Ready=True
pub fn is_ready(status: &LoomStatus) -> bool {
    status
        .condition(condition_type::READY)
        .map(|c| c.status == condition_status::TRUE)
        .unwrap_or(false)
}
