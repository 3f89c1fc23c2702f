use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Local replica of the provider's subscription state for one user.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Serialize, Deserialize)]
pub struct EntitlementSnapshot {
    pub user_id: Uuid,
    pub is_active: bool,
    pub plan_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
}

impl EntitlementSnapshot {
    pub fn inactive(user_id: Uuid) -> Self {
        Self {
            user_id,
            is_active: false,
            plan_id: None,
            current_period_end: None,
            external_customer_id: None,
            external_subscription_id: None,
        }
    }

    /// `is_active` on its own is never enough: the period must also be open at `now`.
    pub fn is_effectively_active(&self, now: OffsetDateTime) -> bool {
        self.is_active
            && self
                .current_period_end
                .map(|end| end > now)
                .unwrap_or(false)
    }

    /// Applies the `Some` fields of `update`, leaving the rest untouched.
    pub fn apply(&mut self, update: &SnapshotUpdate) {
        if let Some(is_active) = update.is_active {
            self.is_active = is_active;
        }
        if let Some(plan_id) = &update.plan_id {
            self.plan_id = Some(plan_id.clone());
        }
        if let Some(period_end) = update.current_period_end {
            self.current_period_end = Some(period_end);
        }
        if let Some(customer_id) = &update.external_customer_id {
            self.external_customer_id = Some(customer_id.clone());
        }
        if let Some(subscription_id) = &update.external_subscription_id {
            self.external_subscription_id = Some(subscription_id.clone());
        }
    }
}

/// Partial write against a snapshot; `None` means "keep the stored value".
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotUpdate {
    pub is_active: Option<bool>,
    pub plan_id: Option<String>,
    pub current_period_end: Option<OffsetDateTime>,
    pub external_customer_id: Option<String>,
    pub external_subscription_id: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::Duration;

    fn at(secs: i64) -> OffsetDateTime {
        OffsetDateTime::from_unix_timestamp(secs).unwrap()
    }

    #[test]
    fn active_flag_without_open_period_is_not_effective() {
        let now = at(1_700_000_000);
        let mut snapshot = EntitlementSnapshot::inactive(Uuid::new_v4());
        snapshot.is_active = true;
        assert!(!snapshot.is_effectively_active(now));

        snapshot.current_period_end = Some(now - Duration::seconds(1));
        assert!(!snapshot.is_effectively_active(now));

        snapshot.current_period_end = Some(now);
        assert!(!snapshot.is_effectively_active(now));

        snapshot.current_period_end = Some(now + Duration::days(30));
        assert!(snapshot.is_effectively_active(now));
    }

    #[test]
    fn apply_only_touches_present_fields() {
        let mut snapshot = EntitlementSnapshot::inactive(Uuid::new_v4());
        snapshot.external_customer_id = Some("cus_1".into());
        snapshot.plan_id = Some("price_monthly".into());

        snapshot.apply(&SnapshotUpdate {
            is_active: Some(true),
            current_period_end: Some(at(1_800_000_000)),
            ..Default::default()
        });

        assert!(snapshot.is_active);
        assert_eq!(snapshot.plan_id.as_deref(), Some("price_monthly"));
        assert_eq!(snapshot.external_customer_id.as_deref(), Some("cus_1"));
        assert_eq!(snapshot.current_period_end, Some(at(1_800_000_000)));
        assert_eq!(snapshot.external_subscription_id, None);
    }
}
