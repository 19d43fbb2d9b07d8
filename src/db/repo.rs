//! Repository over the history tables.
//!
//! Amounts are stored as canonical decimal strings so that values round-trip
//! exactly; timestamps are RFC 3339 text, which sorts correctly.

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqlitePool;
use sqlx::Row;

use crate::domain::{
    AccountSnapshot, AdjustmentDirection, AdjustmentRecord, Decimal, LiquidationRecord,
    PositionSide, TriggerType,
};

pub struct HistoryStore {
    pool: SqlitePool,
}

impl HistoryStore {
    pub fn new(pool: SqlitePool) -> Self {
        HistoryStore { pool }
    }

    pub async fn record_adjustment(&self, record: &AdjustmentRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO margin_adjustments
            (timestamp, symbol, direction, amount, before_margin, after_margin, trigger_type)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.symbol)
        .bind(record.direction.as_str())
        .bind(record.amount.to_canonical_string())
        .bind(record.before_margin.to_canonical_string())
        .bind(record.after_margin.to_canonical_string())
        .bind(record.trigger.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_liquidation(&self, record: &LiquidationRecord) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO liquidations
            (timestamp, symbol, side, quantity, price, released_margin, reason)
            VALUES (?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.timestamp.to_rfc3339())
        .bind(&record.symbol)
        .bind(record.side.as_str())
        .bind(record.quantity.to_canonical_string())
        .bind(record.price.to_canonical_string())
        .bind(record.released_margin.to_canonical_string())
        .bind(&record.reason)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn record_snapshot(&self, snapshot: &AccountSnapshot) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO account_snapshots
            (timestamp, total_equity, total_margin, available_balance, positions_json)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(snapshot.timestamp.to_rfc3339())
        .bind(snapshot.total_equity.to_canonical_string())
        .bind(snapshot.total_margin.to_canonical_string())
        .bind(snapshot.available_balance.to_canonical_string())
        .bind(&snapshot.positions_json)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// All adjustments, oldest first.
    pub async fn list_adjustments(&self) -> Result<Vec<AdjustmentRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, symbol, direction, amount, before_margin, after_margin, trigger_type
            FROM margin_adjustments ORDER BY timestamp, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(AdjustmentRecord {
                    timestamp: parse_timestamp(row.get("timestamp"))?,
                    symbol: row.get("symbol"),
                    direction: match row.get::<String, _>("direction").as_str() {
                        "increase" => AdjustmentDirection::Increase,
                        _ => AdjustmentDirection::Decrease,
                    },
                    amount: parse_decimal(row.get("amount"))?,
                    before_margin: parse_decimal(row.get("before_margin"))?,
                    after_margin: parse_decimal(row.get("after_margin"))?,
                    trigger: match row.get::<String, _>("trigger_type").as_str() {
                        "emergency" => TriggerType::Emergency,
                        _ => TriggerType::Scheduled,
                    },
                })
            })
            .collect()
    }

    /// All liquidations, oldest first.
    pub async fn list_liquidations(&self) -> Result<Vec<LiquidationRecord>, sqlx::Error> {
        let rows = sqlx::query(
            r#"
            SELECT timestamp, symbol, side, quantity, price, released_margin, reason
            FROM liquidations ORDER BY timestamp, id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(LiquidationRecord {
                    timestamp: parse_timestamp(row.get("timestamp"))?,
                    symbol: row.get("symbol"),
                    side: match row.get::<String, _>("side").as_str() {
                        "short" => PositionSide::Short,
                        _ => PositionSide::Long,
                    },
                    quantity: parse_decimal(row.get("quantity"))?,
                    price: parse_decimal(row.get("price"))?,
                    released_margin: parse_decimal(row.get("released_margin"))?,
                    reason: row.get("reason"),
                })
            })
            .collect()
    }

    pub async fn snapshot_count(&self) -> Result<i64, sqlx::Error> {
        let row: (i64,) = sqlx::query_as("SELECT COUNT(*) FROM account_snapshots")
            .fetch_one(&self.pool)
            .await?;
        Ok(row.0)
    }
}

fn parse_decimal(text: String) -> Result<Decimal, sqlx::Error> {
    Decimal::parse(&text).map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

fn parse_timestamp(text: String) -> Result<DateTime<Utc>, sqlx::Error> {
    DateTime::parse_from_rfc3339(&text)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| sqlx::Error::Decode(Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::init_db;
    use tempfile::TempDir;

    async fn open_store() -> (HistoryStore, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let db_path = temp_dir
            .path()
            .join("test.db")
            .to_string_lossy()
            .to_string();
        let pool = init_db(&db_path).await.expect("init_db failed");
        (HistoryStore::new(pool), temp_dir)
    }

    fn dec(s: &str) -> Decimal {
        Decimal::parse(s).unwrap()
    }

    #[tokio::test]
    async fn adjustment_roundtrip() {
        let (store, _temp) = open_store().await;
        let record = AdjustmentRecord {
            timestamp: Utc::now(),
            symbol: "BTC".to_string(),
            direction: AdjustmentDirection::Decrease,
            amount: dec("72.13"),
            before_margin: dec("400"),
            after_margin: dec("327.87"),
            trigger: TriggerType::Scheduled,
        };
        store.record_adjustment(&record).await.unwrap();

        let rows = store.list_adjustments().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].symbol, "BTC");
        assert_eq!(rows[0].amount, dec("72.13"));
        assert_eq!(rows[0].direction, AdjustmentDirection::Decrease);
        assert_eq!(rows[0].trigger, TriggerType::Scheduled);
    }

    #[tokio::test]
    async fn liquidation_roundtrip() {
        let (store, _temp) = open_store().await;
        let record = LiquidationRecord {
            timestamp: Utc::now(),
            symbol: "DOGE".to_string(),
            side: PositionSide::Long,
            quantity: dec("2500"),
            price: dec("0.1"),
            released_margin: dec("2.5"),
            reason: "margin gap: 5".to_string(),
        };
        store.record_liquidation(&record).await.unwrap();

        let rows = store.list_liquidations().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].quantity, dec("2500"));
        assert_eq!(rows[0].side, PositionSide::Long);
    }

    #[tokio::test]
    async fn snapshot_count_increments() {
        let (store, _temp) = open_store().await;
        assert_eq!(store.snapshot_count().await.unwrap(), 0);
        store
            .record_snapshot(&AccountSnapshot {
                timestamp: Utc::now(),
                total_equity: dec("800"),
                total_margin: dec("800"),
                available_balance: dec("0"),
                positions_json: "[]".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(store.snapshot_count().await.unwrap(), 1);
    }
}
