use serde::Serialize;

/// Meeting time left for a user. Subscribers are never metered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "seconds", rename_all = "lowercase")]
pub enum MeetingAllowance {
    Unlimited,
    Seconds(i64),
}

impl MeetingAllowance {
    pub fn is_exhausted(&self) -> bool {
        match self {
            MeetingAllowance::Unlimited => false,
            MeetingAllowance::Seconds(remaining) => *remaining <= 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Allowance {
    pub is_subscribed: bool,
    pub note_limit_exceeded: bool,
    pub remaining_meeting_seconds: MeetingAllowance,
}
