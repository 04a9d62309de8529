//! Deposit rate table
//!
//! Range-keyed lookup of annual rates by amount and duration.
//! Loaded once, read-only afterwards, so it can be shared freely.

use crate::config::AppConfig;
use crate::error::AssistantError;
use crate::Result;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

pub mod store;
pub use store::PgRateRepository;

/// One row of the rate table. Amount and duration bounds are inclusive.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateBand {
    pub min_amount: u64,
    pub max_amount: u64,
    pub min_duration: u32,
    pub max_duration: u32,
    pub min_rate: Decimal,
    pub max_rate: Decimal,
}

impl RateBand {
    pub fn new(
        min_amount: u64,
        max_amount: u64,
        min_duration: u32,
        max_duration: u32,
        min_rate: Decimal,
        max_rate: Decimal,
    ) -> Result<Self> {
        if min_amount > max_amount {
            return Err(AssistantError::InvalidRateBand(format!(
                "amount range {}..={} is empty",
                min_amount, max_amount
            )));
        }
        if min_duration > max_duration {
            return Err(AssistantError::InvalidRateBand(format!(
                "duration range {}..={} is empty",
                min_duration, max_duration
            )));
        }
        if min_rate > max_rate {
            return Err(AssistantError::InvalidRateBand(format!(
                "rate range {}..={} is empty",
                min_rate, max_rate
            )));
        }

        Ok(Self {
            min_amount,
            max_amount,
            min_duration,
            max_duration,
            min_rate,
            max_rate,
        })
    }

    pub fn contains(&self, amount: u64, duration: u32) -> bool {
        (self.min_amount..=self.max_amount).contains(&amount)
            && (self.min_duration..=self.max_duration).contains(&duration)
    }
}

/// Aggregated interval over every band matching a query
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub struct RateRange {
    pub min_rate: Decimal,
    pub max_rate: Decimal,
}

/// `(min_amount, max_amount, min_duration, max_duration, min_rate, max_rate)`,
/// rates in tenths of a percent.
const DEFAULT_BANDS: [(u64, u64, u32, u32, i64, i64); 12] = [
    // 0-29 days
    (0, 100_000, 0, 29, 160, 164),
    (100_001, 500_000, 0, 29, 162, 164),
    (500_001, 5_000_000, 0, 29, 164, 168),
    (5_000_001, 100_000_000, 0, 29, 166, 169),
    // 30-180 days
    (0, 100_000, 30, 180, 150, 154),
    (100_001, 500_000, 30, 180, 152, 154),
    (500_001, 5_000_000, 30, 180, 154, 158),
    (5_000_001, 100_000_000, 30, 180, 156, 159),
    // 181-365 days
    (0, 100_000, 181, 365, 140, 144),
    (100_001, 500_000, 181, 365, 142, 144),
    (500_001, 5_000_000, 181, 365, 144, 148),
    (5_000_001, 100_000_000, 181, 365, 146, 149),
];

/// The bands every deployment starts from
pub fn default_bands() -> Vec<RateBand> {
    DEFAULT_BANDS
        .iter()
        .map(|&(min_amount, max_amount, min_duration, max_duration, min_rate, max_rate)| RateBand {
            min_amount,
            max_amount,
            min_duration,
            max_duration,
            min_rate: Decimal::new(min_rate, 1),
            max_rate: Decimal::new(max_rate, 1),
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct RateTable {
    bands: Vec<RateBand>,
}

impl RateTable {
    pub fn new(bands: Vec<RateBand>) -> Self {
        Self { bands }
    }

    pub fn seeded() -> Self {
        Self::new(default_bands())
    }

    pub fn bands(&self) -> &[RateBand] {
        &self.bands
    }

    /// Resolve the rate interval for an amount and duration.
    ///
    /// Overlapping bands widen the result: the lower bound is the minimum
    /// `min_rate` and the upper bound the maximum `max_rate` across all
    /// matching bands.
    pub fn resolve(&self, amount: u64, duration: u32) -> Result<RateRange> {
        self.bands
            .iter()
            .filter(|band| band.contains(amount, duration))
            .fold(None, |acc: Option<RateRange>, band| {
                Some(match acc {
                    None => RateRange {
                        min_rate: band.min_rate,
                        max_rate: band.max_rate,
                    },
                    Some(range) => RateRange {
                        min_rate: range.min_rate.min(band.min_rate),
                        max_rate: range.max_rate.max(band.max_rate),
                    },
                })
            })
            .ok_or(AssistantError::RateNotFound { amount, duration })
    }
}

impl Default for RateTable {
    fn default() -> Self {
        Self::seeded()
    }
}

/// Load the table from postgres when configured, otherwise use the seed
pub async fn load_rate_table(config: &AppConfig) -> RateTable {
    let Some(url) = config.database_url.as_deref() else {
        info!("Rate table source: built-in seed");
        return RateTable::seeded();
    };

    let loaded = match sqlx::postgres::PgPoolOptions::new()
        .max_connections(2)
        .connect(url)
        .await
    {
        Ok(pool) => PgRateRepository::new(pool).bootstrap().await,
        Err(error) => Err(AssistantError::DatabaseError(error.to_string())),
    };

    match loaded {
        Ok(table) => table,
        Err(error) => {
            warn!(
                "Failed to load rate table from postgres, using built-in seed: {}",
                error
            );
            RateTable::seeded()
        }
    }
}
