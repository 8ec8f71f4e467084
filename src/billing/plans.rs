use std::fmt;
use std::str::FromStr;

use serde::Serialize;

/// Credits debited per admitted message.
pub const CREDIT_COST_PER_MESSAGE: i64 = 1;

/// Offer id used by the purchase endpoint for the monthly subscription.
pub const UNLIMITED_OFFER_ID: &str = "unlimited";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Plan {
    Free,
    Credits,
    Unlimited,
}

impl Plan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Plan::Free => "free",
            Plan::Credits => "credits",
            Plan::Unlimited => "unlimited",
        }
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Plan {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "free" => Ok(Plan::Free),
            "credits" => Ok(Plan::Credits),
            "unlimited" => Ok(Plan::Unlimited),
            _ => Err(()),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FreeTier {
    pub name: String,
    pub daily_limit: u64,
    pub price_minor_units: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct CreditPackage {
    pub id: String,
    pub label: String,
    pub credits: i64,
    pub price_minor_units: i64,
    #[serde(skip_serializing)]
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct UnlimitedTier {
    pub name: String,
    pub monthly_price_minor_units: i64,
    #[serde(skip_serializing)]
    pub price_id: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckoutMode {
    Payment,
    Subscription,
}

impl CheckoutMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            CheckoutMode::Payment => "payment",
            CheckoutMode::Subscription => "subscription",
        }
    }
}

/// key: billing-plan-catalog -> static plan/package table
#[derive(Debug, Clone, Serialize)]
pub struct PlanCatalog {
    pub free: FreeTier,
    pub credit_packages: Vec<CreditPackage>,
    pub unlimited: UnlimitedTier,
}

/// Gateway price ids for each purchasable offer.
#[derive(Debug, Clone, Default)]
pub struct PriceIds {
    pub credits_small: Option<String>,
    pub credits_medium: Option<String>,
    pub credits_large: Option<String>,
    pub unlimited_monthly: Option<String>,
}

impl PlanCatalog {
    /// Prices are in BRL centavos.
    pub fn standard(daily_limit: u64, prices: PriceIds) -> Self {
        let package = |id: &str, label: &str, credits, price, price_id| CreditPackage {
            id: id.to_string(),
            label: label.to_string(),
            credits,
            price_minor_units: price,
            price_id,
        };

        Self {
            free: FreeTier {
                name: "Gratuito".to_string(),
                daily_limit,
                price_minor_units: 0,
            },
            credit_packages: vec![
                package("small", "100 creditos", 100, 990, prices.credits_small),
                package("medium", "500 creditos", 500, 3990, prices.credits_medium),
                package("large", "2.000 creditos", 2000, 9990, prices.credits_large),
            ],
            unlimited: UnlimitedTier {
                name: "Ilimitado".to_string(),
                monthly_price_minor_units: 4990,
                price_id: prices.unlimited_monthly,
            },
        }
    }

    pub fn package_for_price(&self, price_id: &str) -> Option<&CreditPackage> {
        self.credit_packages
            .iter()
            .find(|package| package.price_id.as_deref() == Some(price_id))
    }

    /// Resolves a purchasable offer to its gateway price and checkout mode.
    pub fn checkout_offer(&self, offer_id: &str) -> Option<(&str, CheckoutMode)> {
        if offer_id == UNLIMITED_OFFER_ID {
            return self
                .unlimited
                .price_id
                .as_deref()
                .map(|price| (price, CheckoutMode::Subscription));
        }
        self.credit_packages
            .iter()
            .find(|package| package.id == offer_id)
            .and_then(|package| package.price_id.as_deref())
            .map(|price| (price, CheckoutMode::Payment))
    }
}
