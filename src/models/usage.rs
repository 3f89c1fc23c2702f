use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;

/// Per-user metering counters. A missing row reads as all zeros.
#[derive(Debug, Clone, Default, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct UsageCounters {
    pub note_count: i64,
    pub meeting_seconds_used: i64,
    pub last_meeting_start: Option<OffsetDateTime>,
}

impl UsageCounters {
    pub fn has_open_meeting(&self) -> bool {
        self.last_meeting_start.is_some()
    }
}
