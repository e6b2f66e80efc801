/*
* Copyright (C) 2025 Pedro Henrique / phkaiser13
*
* File: src/conditions.rs
*
* Condition bookkeeping for `HelmAppStatus`. Conditions are an ordered list
* keyed by type: setting one either updates it in place or appends it, and the
* transition timestamp only moves when the status value actually changes. That
* keeps repeated reconciliations of an unchanged resource from producing new
* status writes.
*
* Everything here is pure data manipulation. The caller supplies `now`.
*
* SPDX-License-Identifier: Apache-2.0
*/

use crate::crds::{ConditionStatus, HelmAppCondition, HelmAppConditionType, HelmAppStatus};
use chrono::{DateTime, SecondsFormat, Utc};

/// Condition reasons for failures that only a spec change can resolve.
pub const TERMINAL_REASONS: &[&str] = &[
    "PackageNotFound",
    "VersionNotFound",
    "ValidationFailed",
    "RenderError",
    "ApplyFatal",
];

fn timestamp(now: DateTime<Utc>) -> String {
    now.to_rfc3339_opts(SecondsFormat::Secs, true)
}

impl HelmAppStatus {
    /// Upserts the condition of the given type.
    ///
    /// Returns `true` when anything in the list changed.
    pub fn set_condition(
        &mut self,
        type_: HelmAppConditionType,
        status: ConditionStatus,
        reason: &str,
        message: &str,
        now: DateTime<Utc>,
    ) -> bool {
        match self.conditions.iter_mut().find(|c| c.type_ == type_) {
            Some(existing) => {
                if existing.status == status
                    && existing.reason == reason
                    && existing.message == message
                {
                    return false;
                }
                if existing.status != status {
                    existing.last_transition_time = timestamp(now);
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                true
            }
            None => {
                self.conditions.push(HelmAppCondition {
                    type_,
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_transition_time: timestamp(now),
                });
                true
            }
        }
    }

    pub fn get_condition(&self, type_: HelmAppConditionType) -> Option<(usize, &HelmAppCondition)> {
        self.conditions
            .iter()
            .enumerate()
            .find(|(_, c)| c.type_ == type_)
    }

    /// Absent, `False` and `Unknown` all read as not true.
    pub fn is_condition_true(&self, type_: HelmAppConditionType) -> bool {
        matches!(
            self.get_condition(type_),
            Some((_, c)) if c.status == ConditionStatus::True
        )
    }

    /// Ensures every default condition type is present. Existing entries are
    /// left untouched.
    pub fn init_conditions(&mut self, now: DateTime<Utc>) {
        for type_ in HelmAppConditionType::DEFAULTS {
            if self.get_condition(type_).is_none() {
                self.set_condition(type_, ConditionStatus::Unknown, "", "", now);
            }
        }
    }

    /// Puts the detection conditions back to `Unknown` and drops the parsed
    /// chart content. Used when the chart identity changes.
    pub fn reset_detection(&mut self, now: DateTime<Utc>) {
        for type_ in HelmAppConditionType::DEFAULTS {
            self.set_condition(type_, ConditionStatus::Unknown, "ChartChanged", "", now);
        }
        self.readme.clear();
        self.values.clear();
        self.observed_chart = None;
    }

    /// Whether any of the given conditions records a failure that retrying
    /// cannot fix.
    pub fn has_terminal_failure(&self, types: &[HelmAppConditionType]) -> bool {
        self.conditions.iter().any(|c| {
            types.contains(&c.type_)
                && c.status == ConditionStatus::False
                && TERMINAL_REASONS.contains(&c.reason.as_str())
        })
    }
}
