// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Activity vocabulary shared by every resource family.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A named transient state attached to a resource.
///
/// The set of current activities, not their count, is what other jobs and
/// confirmers look at. Each family only accepts a subset, see
/// [`ResourceKind::ACTIVITIES`](super::ResourceKind::ACTIVITIES).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Activity {
    /// Subsystem objects are being created.
    #[serde(rename = "beingCreated")]
    BeingCreated,
    /// Subsystem objects are being torn down.
    #[serde(rename = "beingDeleted")]
    BeingDeleted,
    /// An update (spec or ownership) is in flight.
    #[serde(rename = "updating")]
    Updating,
    /// A GPU lease is being attached.
    #[serde(rename = "attachingGPU")]
    AttachingGpu,
    /// A GPU lease is being released.
    #[serde(rename = "detachingGPU")]
    DetachingGpu,
    /// Subsystem objects are being reconciled with the desired state.
    #[serde(rename = "repairing")]
    Repairing,
    /// A snapshot is being created or removed.
    #[serde(rename = "creatingSnapshot")]
    CreatingSnapshot,
    /// A snapshot is being restored.
    #[serde(rename = "applyingSnapshot")]
    ApplyingSnapshot,
}

impl Activity {
    /// Every activity known to the system.
    pub const ALL: [Activity; 8] = [
        Activity::BeingCreated,
        Activity::BeingDeleted,
        Activity::Updating,
        Activity::AttachingGpu,
        Activity::DetachingGpu,
        Activity::Repairing,
        Activity::CreatingSnapshot,
        Activity::ApplyingSnapshot,
    ];

    /// The stored name of this activity.
    pub const fn as_str(&self) -> &'static str {
        match self {
            Activity::BeingCreated => "beingCreated",
            Activity::BeingDeleted => "beingDeleted",
            Activity::Updating => "updating",
            Activity::AttachingGpu => "attachingGPU",
            Activity::DetachingGpu => "detachingGPU",
            Activity::Repairing => "repairing",
            Activity::CreatingSnapshot => "creatingSnapshot",
            Activity::ApplyingSnapshot => "applyingSnapshot",
        }
    }

    /// JSON path of this activity inside the `activities` column.
    pub(crate) fn json_path(&self) -> String {
        format!("$.\"{}\"", self.as_str())
    }
}

impl fmt::Display for Activity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Activity {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Activity::ALL
            .iter()
            .copied()
            .find(|a| a.as_str() == s)
            .ok_or_else(|| format!("unknown activity: {}", s))
    }
}

/// Stored value of one activity entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityRecord {
    /// Activity name (same as the map key).
    pub name: String,
    /// When the activity was added.
    pub created_at: DateTime<Utc>,
}

impl ActivityRecord {
    /// A record for `activity` stamped with the current time.
    pub fn now(activity: Activity) -> Self {
        Self {
            name: activity.as_str().to_string(),
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip_names() {
        for activity in Activity::ALL {
            assert_eq!(activity.as_str().parse::<Activity>().unwrap(), activity);
            let json = serde_json::to_string(&activity).unwrap();
            assert_eq!(json, format!("\"{}\"", activity.as_str()));
        }
    }

    #[test]
    fn test_gpu_activities_keep_upper_case_suffix() {
        assert_eq!(Activity::AttachingGpu.as_str(), "attachingGPU");
        assert_eq!(Activity::DetachingGpu.as_str(), "detachingGPU");
        assert!("attachingGpu".parse::<Activity>().is_err());
    }

    #[test]
    fn test_json_path_is_quoted() {
        assert_eq!(Activity::BeingCreated.json_path(), "$.\"beingCreated\"");
    }
}
