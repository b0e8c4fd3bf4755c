// Copyright The LwM2M-rs Authors
// SPDX-License-Identifier: Apache-2.0

//! Engine-wide observe settings.

use serde::{Deserialize, Serialize};

/// Cap on the total number of stored (unsent) notifications, summed over all
/// connections.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "mode")]
pub enum StoredNotificationLimit {
    /// No cap; the queue grows as long as memory lasts.
    #[default]
    Unlimited,
    /// When the cap is reached, the globally-oldest queued entry is evicted
    /// to make room.
    DropOldest {
        /// The cap. Evaluated before every enqueue.
        limit: usize,
    },
}

/// Engine-wide observe configuration.
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ObserveConfig {
    /// Send notifications as Confirmable messages unless an observation's
    /// effective `con` attribute says otherwise. An explicit `con = 0` still
    /// forces non-confirmable delivery.
    pub confirmable_notifications: bool,
    /// Storing-queue cap.
    pub stored_notification_limit: StoredNotificationLimit,
}
