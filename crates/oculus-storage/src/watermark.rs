use chrono::{DateTime, Utc};
use oculus_core::{from_micros, to_micros, LakeTable, PipelineResult};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;

use crate::map_db_err;

/// Last lake stamp whose row has been reconciled for one table. `None`
/// before the first successful batch: reconcile from the beginning.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncWatermark {
    pub table: LakeTable,
    pub value: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone)]
pub struct WatermarkTracker {
    pool: SqlitePool,
}

impl WatermarkTracker {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, table: LakeTable) -> PipelineResult<SyncWatermark> {
        let value: Option<i64> =
            sqlx::query_scalar("SELECT watermark_us FROM sync_watermarks WHERE table_name = ?")
                .bind(table.name())
                .fetch_optional(&self.pool)
                .await
                .map_err(map_db_err)?;
        Ok(SyncWatermark {
            table,
            value: value.map(from_micros),
        })
    }

    /// Standalone advance. Reconciliation advances inside its batch
    /// transaction instead, see [`crate::WarehouseBatch::advance_watermark`].
    pub async fn advance(&self, table: LakeTable, ts: DateTime<Utc>) -> PipelineResult<DateTime<Utc>> {
        let mut conn = self.pool.acquire().await.map_err(map_db_err)?;
        advance_in(&mut conn, table, ts).await
    }

    pub async fn all(&self) -> PipelineResult<Vec<SyncWatermark>> {
        let mut out = Vec::with_capacity(LakeTable::ALL.len());
        for table in LakeTable::ALL {
            out.push(self.get(table).await?);
        }
        Ok(out)
    }
}

/// Move the watermark forward to `ts`. A value at or below the stored one is
/// a no-op; the stored (unchanged) value is returned.
pub(crate) async fn advance_in(
    conn: &mut SqliteConnection,
    table: LakeTable,
    ts: DateTime<Utc>,
) -> PipelineResult<DateTime<Utc>> {
    let requested = to_micros(ts);
    let stored: i64 = sqlx::query_scalar(
        "INSERT INTO sync_watermarks (table_name, watermark_us, updated_us) VALUES (?, ?, ?) \
         ON CONFLICT(table_name) DO UPDATE SET \
             watermark_us = MAX(sync_watermarks.watermark_us, excluded.watermark_us), \
             updated_us = excluded.updated_us \
         RETURNING watermark_us",
    )
    .bind(table.name())
    .bind(requested)
    .bind(to_micros(Utc::now()))
    .fetch_one(&mut *conn)
    .await
    .map_err(map_db_err)?;

    if stored > requested {
        warn!(%table, requested, stored, "ignored watermark regression");
    }
    Ok(from_micros(stored))
}
