use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use fakturenn_core::{AutomationId, DomainError, TenantId};

/// Rule resolving the effective extraction start date at trigger time, when
/// no explicit override is given.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum FromDateRule {
    /// N days back from the trigger date (`"30d"`).
    DaysBack(u32),
    /// First day of the trigger month (`"current_month"`).
    CurrentMonth,
    /// January 1st of the trigger year (`"current_year"`).
    CurrentYear,
}

impl FromDateRule {
    pub fn from_date(&self, today: NaiveDate) -> NaiveDate {
        match self {
            FromDateRule::DaysBack(days) => today - Duration::days(i64::from(*days)),
            FromDateRule::CurrentMonth => today.with_day(1).unwrap_or(today),
            FromDateRule::CurrentYear => {
                NaiveDate::from_ymd_opt(today.year(), 1, 1).unwrap_or(today)
            }
        }
    }
}

impl core::str::FromStr for FromDateRule {
    type Err = DomainError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "current_month" => Ok(FromDateRule::CurrentMonth),
            "current_year" => Ok(FromDateRule::CurrentYear),
            other => {
                let days = other
                    .strip_suffix('d')
                    .and_then(|n| n.parse::<u32>().ok())
                    .ok_or_else(|| {
                        DomainError::validation(format!("unrecognized from-date rule '{other}'"))
                    })?;
                Ok(FromDateRule::DaysBack(days))
            }
        }
    }
}

impl core::fmt::Display for FromDateRule {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FromDateRule::DaysBack(days) => write!(f, "{days}d"),
            FromDateRule::CurrentMonth => f.write_str("current_month"),
            FromDateRule::CurrentYear => f.write_str("current_year"),
        }
    }
}

impl TryFrom<String> for FromDateRule {
    type Error = DomainError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<FromDateRule> for String {
    fn from(rule: FromDateRule) -> Self {
        rule.to_string()
    }
}

/// Tenant-owned configuration binding sources to exports.
///
/// Referenced read-only by the orchestration core; mutation happens through
/// the CRUD layer's explicit update operations.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Automation {
    pub id: AutomationId,
    pub tenant_id: TenantId,
    pub name: String,
    pub description: Option<String>,
    /// Cron expression evaluated by the (external) scheduler.
    pub schedule: Option<String>,
    pub from_date_rule: Option<FromDateRule>,
    pub active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Automation {
    pub fn new(tenant_id: TenantId, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AutomationId::new(),
            tenant_id,
            name: name.into(),
            description: None,
            schedule: None,
            from_date_rule: None,
            active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_from_date_rule(mut self, rule: FromDateRule) -> Self {
        self.from_date_rule = Some(rule);
        self
    }

    pub fn deactivated(mut self) -> Self {
        self.active = false;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn days_back_rule() {
        let rule: FromDateRule = "30d".parse().unwrap();
        assert_eq!(rule.from_date(date(2025, 10, 31)), date(2025, 10, 1));
    }

    #[test]
    fn calendar_rules() {
        assert_eq!(
            FromDateRule::CurrentMonth.from_date(date(2025, 10, 29)),
            date(2025, 10, 1)
        );
        assert_eq!(
            FromDateRule::CurrentYear.from_date(date(2025, 10, 29)),
            date(2025, 1, 1)
        );
    }

    #[test]
    fn unrecognized_rule_is_rejected() {
        assert!("yesterday".parse::<FromDateRule>().is_err());
        assert!("d".parse::<FromDateRule>().is_err());
    }

    #[test]
    fn rule_round_trips_through_serde() {
        let rule = FromDateRule::DaysBack(90);
        let json = serde_json::to_string(&rule).unwrap();
        assert_eq!(json, "\"90d\"");
        let back: FromDateRule = serde_json::from_str(&json).unwrap();
        assert_eq!(back, rule);
    }
}
