use clickhouse::{Client, Row};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::error::Result;

pub async fn insert_rows<T: Row + Send + Serialize>(
    db_client: &Client,
    table_name: &str,
    rows: Vec<T>,
    writer_name: &str,
) -> Result<()> {
    if !rows.is_empty() {
        let count = rows.len();
        let mut inserter = db_client.insert(table_name)?;
        for row in rows {
            inserter.write(&row).await?;
        }
        inserter.end().await?;
        debug!(count, table = table_name, "[db] {} stored rows", writer_name);
    }
    Ok(())
}

/// Runs `query` (which must select `?fields`) and decodes every row.
pub async fn fetch_rows<T: Row + DeserializeOwned>(db_client: &Client, query: &str) -> Result<Vec<T>> {
    Ok(db_client.query(query).fetch_all::<T>().await?)
}
