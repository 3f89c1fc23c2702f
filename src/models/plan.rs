use serde::{Deserialize, Serialize};

use crate::config::BillingSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PlanTier {
    Free,
    Premium,
    Pro,
}

impl PlanTier {
    pub fn display_name(&self) -> &'static str {
        match self {
            PlanTier::Free => "Free",
            PlanTier::Premium => "Premium",
            PlanTier::Pro => "Pro",
        }
    }
}

/// Static price-to-plan mapping plus the limits that apply without a subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanCatalog {
    free_note_limit: i64,
    free_meeting_seconds: i64,
    prices: Vec<(String, PlanTier)>,
}

impl PlanCatalog {
    pub fn new(free_note_limit: i64, free_meeting_seconds: i64) -> Self {
        Self {
            free_note_limit: free_note_limit.max(0),
            free_meeting_seconds: free_meeting_seconds.max(0),
            prices: Vec::new(),
        }
    }

    pub fn with_price(mut self, price_id: impl Into<String>, tier: PlanTier) -> Self {
        let price_id = price_id.into();
        let trimmed = price_id.trim();
        if !trimmed.is_empty() {
            self.prices.push((trimmed.to_string(), tier));
        }
        self
    }

    pub fn from_settings(settings: &BillingSettings) -> Self {
        let mut catalog = Self::new(
            settings.free_note_limit,
            settings.free_meeting_minutes.saturating_mul(60),
        );
        if let Some(price) = settings.monthly_price_id.as_deref() {
            catalog = catalog.with_price(price, PlanTier::Premium);
        }
        if let Some(price) = settings.annual_price_id.as_deref() {
            catalog = catalog.with_price(price, PlanTier::Pro);
        }
        catalog
    }

    pub fn free_note_limit(&self) -> i64 {
        self.free_note_limit
    }

    pub fn free_meeting_seconds(&self) -> i64 {
        self.free_meeting_seconds
    }

    pub fn tier_for(&self, plan_id: Option<&str>) -> PlanTier {
        let Some(plan_id) = plan_id.map(str::trim).filter(|id| !id.is_empty()) else {
            return PlanTier::Free;
        };
        self.prices
            .iter()
            .find(|(price, _)| price == plan_id)
            .map(|(_, tier)| *tier)
            .unwrap_or(PlanTier::Free)
    }

    pub fn plan_name(&self, plan_id: Option<&str>) -> &'static str {
        self.tier_for(plan_id).display_name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_known_prices_and_falls_back_to_free() {
        let catalog = PlanCatalog::new(10, 3600)
            .with_price("price_monthly", PlanTier::Premium)
            .with_price("price_annual", PlanTier::Pro)
            .with_price("  ", PlanTier::Pro);

        assert_eq!(catalog.plan_name(Some("price_monthly")), "Premium");
        assert_eq!(catalog.plan_name(Some("price_annual")), "Pro");
        assert_eq!(catalog.plan_name(Some("price_unknown")), "Free");
        assert_eq!(catalog.plan_name(Some("")), "Free");
        assert_eq!(catalog.plan_name(None), "Free");
    }

    #[test]
    fn from_settings_converts_minutes_to_seconds() {
        let settings = BillingSettings {
            free_note_limit: 10,
            free_meeting_minutes: 60,
            monthly_price_id: Some("price_m".into()),
            annual_price_id: None,
            event_retention_days: 30,
        };
        let catalog = PlanCatalog::from_settings(&settings);
        assert_eq!(catalog.free_note_limit(), 10);
        assert_eq!(catalog.free_meeting_seconds(), 3600);
        assert_eq!(catalog.tier_for(Some("price_m")), PlanTier::Premium);
    }

    #[test]
    fn negative_limits_clamp_to_zero() {
        let catalog = PlanCatalog::new(-3, -1);
        assert_eq!(catalog.free_note_limit(), 0);
        assert_eq!(catalog.free_meeting_seconds(), 0);
    }
}
