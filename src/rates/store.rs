//! Postgres-backed rate table
//!
//! Creates and seeds the `deposit_rates` table, then loads it into an
//! in-memory `RateTable` once at startup.

use crate::error::AssistantError;
use crate::rates::{default_bands, RateBand, RateTable};
use crate::Result;
use rust_decimal::Decimal;
use sqlx::{PgPool, Row};
use tracing::{info, warn};

pub struct PgRateRepository {
    pool: PgPool,
}

impl PgRateRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn ensure_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS deposit_rates (
              id BIGSERIAL PRIMARY KEY,
              min_amount BIGINT NOT NULL,
              max_amount BIGINT NOT NULL,
              min_duration INTEGER NOT NULL,
              max_duration INTEGER NOT NULL,
              min_rate NUMERIC(5,2) NOT NULL,
              max_rate NUMERIC(5,2) NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create deposit_rates table", e))?;

        sqlx::query(
            r#"
            CREATE INDEX IF NOT EXISTS idx_deposit_search
            ON deposit_rates (min_amount, max_amount, min_duration, max_duration);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("Failed to create deposit_rates index", e))?;

        Ok(())
    }

    /// Insert the default bands when the table is empty
    pub async fn seed_if_empty(&self) -> Result<usize> {
        let existing: i64 = sqlx::query("SELECT COUNT(*) AS count FROM deposit_rates")
            .fetch_one(&self.pool)
            .await
            .and_then(|row| row.try_get("count"))
            .map_err(|e| db_error("Failed to count deposit rates", e))?;

        if existing > 0 {
            return Ok(0);
        }

        let bands = default_bands();
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| db_error("Failed to begin rate seed transaction", e))?;

        for band in &bands {
            sqlx::query(
                r#"
                INSERT INTO deposit_rates
                  (min_amount, max_amount, min_duration, max_duration, min_rate, max_rate)
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(to_i64(band.min_amount)?)
            .bind(to_i64(band.max_amount)?)
            .bind(band.min_duration as i32)
            .bind(band.max_duration as i32)
            .bind(band.min_rate)
            .bind(band.max_rate)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_error("Failed to insert deposit rate", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| db_error("Failed to commit rate seed transaction", e))?;

        info!(count = bands.len(), "Seeded deposit_rates");
        Ok(bands.len())
    }

    pub async fn load_table(&self) -> Result<RateTable> {
        let rows = sqlx::query(
            r#"
            SELECT min_amount, max_amount, min_duration, max_duration, min_rate, max_rate
            FROM deposit_rates
            ORDER BY id ASC
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_error("Failed to load deposit rates", e))?;

        let mut bands = Vec::with_capacity(rows.len());
        for row in rows {
            let min_amount: i64 = row.try_get("min_amount").map_err(|e| db_error("min_amount", e))?;
            let max_amount: i64 = row.try_get("max_amount").map_err(|e| db_error("max_amount", e))?;
            let min_duration: i32 =
                row.try_get("min_duration").map_err(|e| db_error("min_duration", e))?;
            let max_duration: i32 =
                row.try_get("max_duration").map_err(|e| db_error("max_duration", e))?;
            let min_rate: Decimal = row.try_get("min_rate").map_err(|e| db_error("min_rate", e))?;
            let max_rate: Decimal = row.try_get("max_rate").map_err(|e| db_error("max_rate", e))?;

            if let Some(band) =
                band_from_row(min_amount, max_amount, min_duration, max_duration, min_rate, max_rate)?
            {
                bands.push(band);
            }
        }

        info!(bands = bands.len(), "Loaded deposit rate table from postgres");
        Ok(RateTable::new(bands))
    }

    /// Create, seed and load in one go
    pub async fn bootstrap(&self) -> Result<RateTable> {
        self.ensure_schema().await?;
        self.seed_if_empty().await?;
        self.load_table().await
    }
}

/// Map one stored row onto a band. Rows with negative bounds are skipped.
fn band_from_row(
    min_amount: i64,
    max_amount: i64,
    min_duration: i32,
    max_duration: i32,
    min_rate: Decimal,
    max_rate: Decimal,
) -> Result<Option<RateBand>> {
    match (
        u64::try_from(min_amount),
        u64::try_from(max_amount),
        u32::try_from(min_duration),
        u32::try_from(max_duration),
    ) {
        (Ok(min_a), Ok(max_a), Ok(min_d), Ok(max_d)) => {
            RateBand::new(min_a, max_a, min_d, max_d, min_rate, max_rate).map(Some)
        }
        _ => {
            warn!(min_amount, min_duration, "Skipping rate band with negative bounds");
            Ok(None)
        }
    }
}

fn to_i64(value: u64) -> Result<i64> {
    i64::try_from(value)
        .map_err(|_| AssistantError::InvalidRateBand(format!("{} does not fit BIGINT", value)))
}

fn db_error(context: &str, error: sqlx::Error) -> AssistantError {
    AssistantError::DatabaseError(format!("{}: {}", context, error))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rate(tenths: i64) -> Decimal {
        Decimal::new(tenths, 1)
    }

    #[test]
    fn test_row_becomes_band() {
        let band = band_from_row(300_001, 500_000, 1, 30, rate(152), rate(154))
            .unwrap()
            .expect("band");
        assert_eq!(band.min_amount, 300_001);
        assert_eq!(band.max_duration, 30);
        assert_eq!(band.max_rate, rate(154));
    }

    #[test]
    fn test_negative_bounds_are_skipped() {
        assert_eq!(band_from_row(-1, 500_000, 1, 30, rate(152), rate(154)).unwrap(), None);
        assert_eq!(band_from_row(0, 500_000, 1, -30, rate(152), rate(154)).unwrap(), None);
    }

    #[test]
    fn test_inconsistent_row_is_an_error() {
        assert!(band_from_row(500_000, 300_001, 1, 30, rate(152), rate(154)).is_err());
        assert!(band_from_row(300_001, 500_000, 1, 30, rate(160), rate(154)).is_err());
    }
}
