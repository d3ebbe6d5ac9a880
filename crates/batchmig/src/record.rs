//! Migration records and their lifecycle.
//!
//! A record is the durable state of one batched migration within a project:
//! its range, batch size, progress cursor and status.

use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Lifecycle status of a batched migration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationStatus {
    /// Enqueued, not yet claimed by a scheduler.
    Pending,
    /// Claimed; batches run whenever a worker holds its lock.
    Running,
    /// Stopped by an operator.
    Paused,
    /// Being driven to completion synchronously by `finalize`.
    Finalizing,
    /// Every unit in the range has been processed.
    Succeeded,
    /// Given up on after repeated failures.
    Failed,
}

impl MigrationStatus {
    /// Every status, in lifecycle order.
    pub const ALL: [MigrationStatus; 6] = [
        MigrationStatus::Pending,
        MigrationStatus::Running,
        MigrationStatus::Paused,
        MigrationStatus::Finalizing,
        MigrationStatus::Succeeded,
        MigrationStatus::Failed,
    ];

    /// Name as stored in the record store.
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationStatus::Pending => "pending",
            MigrationStatus::Running => "running",
            MigrationStatus::Paused => "paused",
            MigrationStatus::Finalizing => "finalizing",
            MigrationStatus::Succeeded => "succeeded",
            MigrationStatus::Failed => "failed",
        }
    }

    /// Check if the status is terminal.
    pub fn is_terminal(&self) -> bool {
        matches!(self, MigrationStatus::Succeeded | MigrationStatus::Failed)
    }

    /// Check if a scheduler may pick up the migration.
    pub fn is_runnable(&self) -> bool {
        matches!(self, MigrationStatus::Pending | MigrationStatus::Running)
    }
}

impl std::fmt::Display for MigrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MigrationStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        MigrationStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| Error::Corrupt(format!("unknown migration status {:?}", s)))
    }
}

/// Persistent state of one batched migration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationRecord {
    /// Store-assigned ID; also the scheduling order.
    pub id: i64,
    /// Project namespace.
    pub project: String,
    /// Definition filename the record was enqueued from.
    pub filename: String,
    /// 14-digit timestamp, unique within the project.
    pub timestamp: String,
    /// Units processed per batch.
    pub batch_size: i64,
    /// First unit of the range (inclusive).
    pub min_value: i64,
    /// Last unit of the range (inclusive).
    pub max_value: i64,
    /// Last completed unit; `min_value - 1` before the first batch.
    pub cursor: i64,
    /// Current status.
    pub status: MigrationStatus,
    /// Last time the record changed.
    pub updated_at: DateTime<Utc>,
}

impl MigrationRecord {
    /// Check if every unit has been processed.
    pub fn is_exhausted(&self) -> bool {
        self.cursor >= self.max_value
    }

    /// Units left to process.
    pub fn remaining_units(&self) -> u64 {
        unit_count(i128::from(self.max_value) - i128::from(self.cursor))
    }

    /// Total units in the range.
    pub fn total_units(&self) -> u64 {
        unit_count(i128::from(self.max_value) - i128::from(self.min_value) + 1)
    }

    /// Calculate percentage complete.
    pub fn percent_complete(&self) -> f64 {
        let total = self.total_units();
        if total == 0 {
            100.0
        } else {
            (total.saturating_sub(self.remaining_units()) as f64 / total as f64) * 100.0
        }
    }

    /// Namespaced lock key for this migration.
    pub fn lock_key(&self) -> String {
        crate::lock::lock_key(&self.project, &self.timestamp)
    }
}

/// A record about to be inserted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewMigration {
    /// Project namespace.
    pub project: String,
    /// Definition filename.
    pub filename: String,
    /// 14-digit timestamp.
    pub timestamp: String,
    /// Units processed per batch.
    pub batch_size: i64,
    /// First unit of the range.
    pub min_value: i64,
    /// Last unit of the range.
    pub max_value: i64,
    /// Initial status: `pending`, or `succeeded` when there is no work.
    pub status: MigrationStatus,
}

// Empty ranges count as zero; the full i64 range saturates at u64::MAX.
fn unit_count(units: i128) -> u64 {
    u64::try_from(units.max(0)).unwrap_or(u64::MAX)
}

impl NewMigration {
    /// Check that the record can be scheduled.
    ///
    /// The cursor starts one before `min_value`, so `i64::MIN` is not a
    /// valid range start.
    pub fn validate(&self) -> Result<(), Error> {
        let reason = if self.batch_size < 1 {
            format!("batch size {} is less than 1", self.batch_size)
        } else if self.min_value == i64::MIN {
            format!("min {} leaves no room for the cursor", self.min_value)
        } else if self.status != MigrationStatus::Succeeded && self.max_value < self.min_value {
            format!("min {} is greater than max {}", self.min_value, self.max_value)
        } else {
            return Ok(());
        };

        Err(Error::InvalidParameters {
            timestamp: self.timestamp.clone(),
            reason,
        })
    }

    /// Cursor the record starts with.
    pub fn initial_cursor(&self) -> i64 {
        if self.status == MigrationStatus::Succeeded {
            self.max_value
        } else {
            self.min_value.saturating_sub(1)
        }
    }
}
