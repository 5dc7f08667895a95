use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Row id shared by every order type (shop orders and subscriptions live in one table).
pub type OrderId = u64;

pub type CustomerId = u64;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum BillingPeriod {
    Day,
    Week,
    Month,
    Year,
}

impl BillingPeriod {
    pub fn as_str(&self) -> &'static str {
        match self {
            BillingPeriod::Day => "day",
            BillingPeriod::Week => "week",
            BillingPeriod::Month => "month",
            BillingPeriod::Year => "year",
        }
    }
}

impl std::fmt::Display for BillingPeriod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for BillingPeriod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "day" => Ok(BillingPeriod::Day),
            "week" => Ok(BillingPeriod::Week),
            "month" => Ok(BillingPeriod::Month),
            "year" => Ok(BillingPeriod::Year),
            other => Err(format!("unknown billing period: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Address {
    pub first_name: Option<String>,
    pub last_name: Option<String>,
    pub company: Option<String>,
    pub address_1: Option<String>,
    pub address_2: Option<String>,
    pub city: Option<String>,
    pub state: Option<String>,
    pub postcode: Option<String>,
    pub country: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_billing_period_slugs() {
        for period in [BillingPeriod::Day, BillingPeriod::Week, BillingPeriod::Month, BillingPeriod::Year] {
            assert_eq!(period.as_str().parse::<BillingPeriod>().unwrap(), period);
        }
        assert!("fortnight".parse::<BillingPeriod>().is_err());
    }
}
