use async_trait::async_trait;
use clickhouse::Client;
use tracing::warn;

use super::HistoryStore;
use crate::database::{fetch_rows, insert_rows};
use crate::error::Result;
use crate::types::{HistoryRecord, HistoryRow};

/// History log backed by a ClickHouse table (`MergeTree`, never updated).
#[derive(Clone)]
pub struct ClickHouseHistoryStore {
    client: Client,
    table: String,
}

impl ClickHouseHistoryStore {
    pub fn new(client: Client, table: impl Into<String>) -> Self {
        Self {
            client,
            table: table.into(),
        }
    }

    pub async fn ensure_table(&self) -> Result<()> {
        let ddl = format!(
            "CREATE TABLE IF NOT EXISTS {} (
                kind LowCardinality(String),
                id String,
                timestamp UInt32,
                status LowCardinality(String),
                amount_lamports UInt64,
                confirmed_lamports UInt64,
                token_amount UInt64,
                recipient_count UInt32,
                signature Nullable(String),
                burn_signature Nullable(String),
                error Nullable(String),
                inserted_at DateTime64(6) DEFAULT now64(6)
            ) ENGINE = MergeTree ORDER BY (timestamp, id)",
            self.table
        );
        self.client.query(&ddl).execute().await?;
        // Tables created before confirmed amounts were tracked.
        let migrate = format!(
            "ALTER TABLE {} ADD COLUMN IF NOT EXISTS confirmed_lamports UInt64 DEFAULT 0 AFTER amount_lamports",
            self.table
        );
        self.client.query(&migrate).execute().await?;
        Ok(())
    }

    fn decode(rows: Vec<HistoryRow>) -> Vec<HistoryRecord> {
        rows.into_iter()
            .filter_map(|row| {
                let id = row.id.clone();
                HistoryRecord::try_from(row)
                    .map_err(|e| warn!(id = %id, error = %e, "[History] skipping undecodable row"))
                    .ok()
            })
            .collect()
    }
}

#[async_trait]
impl HistoryStore for ClickHouseHistoryStore {
    async fn append(&self, record: HistoryRecord) -> Result<()> {
        insert_rows(&self.client, &self.table, vec![HistoryRow::from(&record)], "History").await
    }

    async fn recent(&self, limit: usize) -> Result<Vec<HistoryRecord>> {
        let query = format!(
            "SELECT ?fields FROM {} ORDER BY inserted_at DESC LIMIT {}",
            self.table, limit
        );
        Ok(Self::decode(fetch_rows(&self.client, &query).await?))
    }

    async fn all(&self) -> Result<Vec<HistoryRecord>> {
        let query = format!("SELECT ?fields FROM {} ORDER BY inserted_at ASC", self.table);
        Ok(Self::decode(fetch_rows(&self.client, &query).await?))
    }
}
