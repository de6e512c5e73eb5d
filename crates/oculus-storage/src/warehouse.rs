use std::collections::HashMap;

use chrono::{DateTime, Utc};
use oculus_core::{
    from_micros, to_micros, FactKey, LakeTable, Marketplace, PipelineError, PipelineResult,
    WarehouseChildren, WarehouseListing, WarehouseLocation,
};
use serde::Serialize;
use sqlx::{Connection, Row, Sqlite, SqliteConnection, SqlitePool, Transaction};
use tracing::debug;
use uuid::Uuid;

use crate::map_db_err;
use crate::watermark::advance_in;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub table: String,
    pub source_listing_id: String,
    pub last_synced_at: DateTime<Utc>,
    pub error: String,
    pub failed_at: DateTime<Utc>,
}

/// One complete, price-bearing listing in model-feature form.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TrainingRow {
    pub make: Option<String>,
    pub model: String,
    pub fuel: String,
    pub mileage_km: i64,
    pub power_kw: i64,
    pub year_model: i32,
    pub price: f64,
}

/// Column lists used by [`Warehouse::snapshot`], with their ordering keys.
const SNAPSHOT_TABLES: [(&str, &str, &str); 6] = [
    (
        "warehouse_listings",
        "listing_id, marketplace, source_listing_id, listing_guid, make_id, model_id, fuel_id, \
         transmission_id, condition_id, car_type_id, color_id, status, year_model, mileage_km, \
         seats, power_kw, owners, price, predicted_price, warranty, private_seller, published_us, \
         upstream_updated_us, lake_synced_us",
        "listing_id",
    ),
    (
        "warehouse_locations",
        "listing_id, source_listing_id, listing_guid, location_id, address, locality, postcode, \
         district, region, country, latitude, longitude",
        "listing_id",
    ),
    (
        "warehouse_equipment",
        "listing_id, position, equipment_id",
        "listing_id, position",
    ),
    ("warehouse_texts", "listing_id, kind, body", "listing_id, kind"),
    (
        "warehouse_urls",
        "listing_id, position, kind, url",
        "listing_id, position",
    ),
    (
        "warehouse_guid_map",
        "marketplace, source_listing_id, listing_guid",
        "marketplace, source_listing_id",
    ),
];

/// Read side of the warehouse plus the entry point for transactional batches.
#[derive(Debug, Clone)]
pub struct Warehouse {
    pool: SqlitePool,
}

impl Warehouse {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn begin_batch(&self, table: LakeTable) -> PipelineResult<WarehouseBatch> {
        let tx = self.pool.begin().await.map_err(map_db_err)?;
        Ok(WarehouseBatch {
            tx,
            table,
            minted: HashMap::new(),
        })
    }

    pub async fn listing_count(&self) -> PipelineResult<i64> {
        sqlx::query_scalar("SELECT COUNT(*) FROM warehouse_listings")
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Warehouse row id for a marketplace listing, if it has been reconciled.
    pub async fn find_listing_id(
        &self,
        marketplace: Marketplace,
        source_listing_id: &str,
    ) -> PipelineResult<Option<i64>> {
        sqlx::query_scalar(
            "SELECT l.listing_id FROM warehouse_listings l \
             LEFT JOIN warehouse_guid_map g \
                 ON g.listing_guid = l.listing_guid AND g.marketplace = l.marketplace \
             WHERE l.marketplace = ? AND (l.source_listing_id = ? OR g.source_listing_id = ?)",
        )
        .bind(marketplace.as_str())
        .bind(source_listing_id)
        .bind(source_listing_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)
    }

    pub async fn dead_letters(&self, table: LakeTable) -> PipelineResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT table_name, source_listing_id, last_synced_us, error, failed_us \
             FROM reconcile_dead_letters WHERE table_name = ? ORDER BY last_synced_us",
        )
        .bind(table.name())
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.iter()
            .map(|row| -> Result<DeadLetter, sqlx::Error> {
                Ok(DeadLetter {
                    table: row.try_get("table_name")?,
                    source_listing_id: row.try_get("source_listing_id")?,
                    last_synced_at: from_micros(row.try_get("last_synced_us")?),
                    error: row.try_get("error")?,
                    failed_at: from_micros(row.try_get("failed_us")?),
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(map_db_err)
    }

    /// Complete listings for price-model training: mileage, power and price
    /// present, and power not zero.
    pub async fn training_rows(&self) -> PipelineResult<Vec<TrainingRow>> {
        let rows = sqlx::query(
            "SELECT mk.name AS make, md.name AS model, f.name AS fuel, \
                    l.mileage_km, l.power_kw, l.year_model, l.price \
             FROM warehouse_listings l \
             JOIN dim_model md ON md.id = l.model_id \
             JOIN dim_fuel f ON f.id = l.fuel_id \
             LEFT JOIN dim_make mk ON mk.id = l.make_id \
             WHERE l.mileage_km IS NOT NULL AND l.power_kw IS NOT NULL AND l.power_kw <> 0 \
               AND l.price IS NOT NULL \
             ORDER BY l.listing_id",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(map_db_err)?;

        rows.iter()
            .map(|row| -> Result<TrainingRow, sqlx::Error> {
                Ok(TrainingRow {
                    make: row.try_get("make")?,
                    model: row.try_get("model")?,
                    fuel: row.try_get("fuel")?,
                    mileage_km: row.try_get("mileage_km")?,
                    power_kw: row.try_get("power_kw")?,
                    year_model: row.try_get("year_model")?,
                    price: row.try_get("price")?,
                })
            })
            .collect::<Result<_, sqlx::Error>>()
            .map_err(map_db_err)
    }

    /// Every warehouse row rendered as a JSON array, table by table in key
    /// order. Two equal snapshots mean byte-identical warehouse contents.
    pub async fn snapshot(&self) -> PipelineResult<Vec<String>> {
        let mut out = Vec::new();
        for (table, columns, order) in SNAPSHOT_TABLES {
            let rows: Vec<String> = sqlx::query_scalar(&format!(
                "SELECT '{table}:' || json_array({columns}) FROM {table} ORDER BY {order}"
            ))
            .fetch_all(&self.pool)
            .await
            .map_err(map_db_err)?;
            out.extend(rows);
        }
        Ok(out)
    }
}

/// All warehouse writes of one reconciliation batch. Nothing is visible to
/// other readers until [`WarehouseBatch::commit`]; dropping the batch rolls
/// everything back, watermark included.
pub struct WarehouseBatch {
    tx: Transaction<'static, Sqlite>,
    table: LakeTable,
    /// GUIDs handed out by `fact_key` but not yet persisted, by source id.
    minted: HashMap<Uuid, String>,
}

impl WarehouseBatch {
    pub fn table(&self) -> LakeTable {
        self.table
    }

    /// Identity for a lake row: the source id where the marketplace's ids are
    /// stable, otherwise a GUID minted once and reused from then on. A new
    /// GUID is only persisted by a successful [`WarehouseBatch::write_row`].
    pub async fn fact_key(
        &mut self,
        marketplace: Marketplace,
        source_listing_id: &str,
    ) -> PipelineResult<FactKey> {
        if marketplace.has_stable_ids() {
            return Ok(FactKey::Native(source_listing_id.to_string()));
        }

        let existing: Option<String> = sqlx::query_scalar(
            "SELECT listing_guid FROM warehouse_guid_map \
             WHERE marketplace = ? AND source_listing_id = ?",
        )
        .bind(marketplace.as_str())
        .bind(source_listing_id)
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(map_db_err)?;

        if let Some(raw) = existing {
            let guid = Uuid::parse_str(&raw).map_err(|err| {
                PipelineError::ConstraintViolation(format!("stored guid '{raw}' is invalid: {err}"))
            })?;
            return Ok(FactKey::Guid(guid));
        }

        if let Some((guid, _)) = self.minted.iter().find(|(_, id)| *id == source_listing_id) {
            return Ok(FactKey::Guid(*guid));
        }
        let guid = Uuid::new_v4();
        self.minted.insert(guid, source_listing_id.to_string());
        debug!(%marketplace, source_listing_id, %guid, "minted listing guid");
        Ok(FactKey::Guid(guid))
    }

    /// Upsert one fact row with its location and children under a savepoint.
    /// On failure only this row's writes are undone and the batch stays usable.
    pub async fn write_row(
        &mut self,
        listing: &WarehouseListing,
        location: &WarehouseLocation,
        children: &WarehouseChildren,
    ) -> PipelineResult<i64> {
        let new_guid = match &listing.key {
            FactKey::Guid(guid) => self
                .minted
                .get(guid)
                .map(|source_listing_id| (*guid, source_listing_id.clone())),
            FactKey::Native(_) => None,
        };
        let mut savepoint = Connection::begin(&mut *self.tx).await.map_err(map_db_err)?;
        let written: PipelineResult<i64> = async {
            if let Some((guid, source_listing_id)) = &new_guid {
                insert_guid(&mut savepoint, listing.marketplace, source_listing_id, *guid).await?;
            }
            write_row_in(&mut savepoint, listing, location, children).await
        }
        .await;
        match written {
            Ok(listing_id) => {
                savepoint.commit().await.map_err(map_db_err)?;
                if let Some((guid, _)) = new_guid {
                    self.minted.remove(&guid);
                }
                Ok(listing_id)
            }
            Err(err) => {
                savepoint.rollback().await.map_err(map_db_err)?;
                Err(err)
            }
        }
    }

    pub async fn record_dead_letter(
        &mut self,
        source_listing_id: &str,
        last_synced_at: DateTime<Utc>,
        error: &PipelineError,
    ) -> PipelineResult<()> {
        sqlx::query(
            "INSERT INTO reconcile_dead_letters \
                 (table_name, source_listing_id, last_synced_us, error, failed_us) \
             VALUES (?, ?, ?, ?, ?) \
             ON CONFLICT(table_name, source_listing_id) DO UPDATE SET \
                 last_synced_us = excluded.last_synced_us, \
                 error = excluded.error, \
                 failed_us = excluded.failed_us",
        )
        .bind(self.table.name())
        .bind(source_listing_id)
        .bind(to_micros(last_synced_at))
        .bind(error.to_string())
        .bind(to_micros(Utc::now()))
        .execute(&mut *self.tx)
        .await
        .map_err(map_db_err)?;
        Ok(())
    }

    /// A row that now reconciles cleanly is no longer dead.
    pub async fn clear_dead_letter(&mut self, source_listing_id: &str) -> PipelineResult<()> {
        sqlx::query("DELETE FROM reconcile_dead_letters WHERE table_name = ? AND source_listing_id = ?")
            .bind(self.table.name())
            .bind(source_listing_id)
            .execute(&mut *self.tx)
            .await
            .map_err(map_db_err)?;
        Ok(())
    }

    pub async fn advance_watermark(&mut self, ts: DateTime<Utc>) -> PipelineResult<DateTime<Utc>> {
        advance_in(&mut self.tx, self.table, ts).await
    }

    pub async fn commit(self) -> PipelineResult<()> {
        self.tx.commit().await.map_err(map_db_err)
    }

    pub async fn rollback(self) -> PipelineResult<()> {
        self.tx.rollback().await.map_err(map_db_err)
    }
}

async fn insert_guid(
    conn: &mut SqliteConnection,
    marketplace: Marketplace,
    source_listing_id: &str,
    guid: Uuid,
) -> PipelineResult<()> {
    sqlx::query(
        "INSERT INTO warehouse_guid_map (marketplace, source_listing_id, listing_guid) \
         VALUES (?, ?, ?)",
    )
    .bind(marketplace.as_str())
    .bind(source_listing_id)
    .bind(guid.to_string())
    .execute(&mut *conn)
    .await
    .map_err(map_db_err)?;
    Ok(())
}

async fn write_row_in(
    conn: &mut SqliteConnection,
    listing: &WarehouseListing,
    location: &WarehouseLocation,
    children: &WarehouseChildren,
) -> PipelineResult<i64> {
    let conflict_target = match listing.key {
        FactKey::Native(_) => "(source_listing_id) WHERE source_listing_id IS NOT NULL",
        FactKey::Guid(_) => "(listing_guid) WHERE listing_guid IS NOT NULL",
    };
    let dims = &listing.dimensions;

    let listing_id: i64 = sqlx::query_scalar(&format!(
        "INSERT INTO warehouse_listings (marketplace, source_listing_id, listing_guid, make_id, \
             model_id, fuel_id, transmission_id, condition_id, car_type_id, color_id, status, \
             year_model, mileage_km, seats, power_kw, owners, price, predicted_price, warranty, \
             private_seller, published_us, upstream_updated_us, lake_synced_us) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT{conflict_target} DO UPDATE SET \
             make_id = excluded.make_id, model_id = excluded.model_id, \
             fuel_id = excluded.fuel_id, transmission_id = excluded.transmission_id, \
             condition_id = excluded.condition_id, car_type_id = excluded.car_type_id, \
             color_id = excluded.color_id, status = excluded.status, \
             year_model = excluded.year_model, mileage_km = excluded.mileage_km, \
             seats = excluded.seats, power_kw = excluded.power_kw, owners = excluded.owners, \
             price = excluded.price, predicted_price = excluded.predicted_price, \
             warranty = excluded.warranty, private_seller = excluded.private_seller, \
             published_us = excluded.published_us, \
             upstream_updated_us = excluded.upstream_updated_us, \
             lake_synced_us = excluded.lake_synced_us \
         RETURNING listing_id"
    ))
    .bind(listing.marketplace.as_str())
    .bind(listing.key.source_listing_id())
    .bind(listing.key.listing_guid())
    .bind(dims.make)
    .bind(dims.model)
    .bind(dims.fuel)
    .bind(dims.transmission)
    .bind(dims.condition)
    .bind(dims.car_type)
    .bind(dims.color)
    .bind(&listing.status)
    .bind(listing.year_model)
    .bind(listing.mileage_km)
    .bind(listing.seats)
    .bind(listing.power_kw)
    .bind(listing.owners)
    .bind(listing.price)
    .bind(listing.predicted_price)
    .bind(listing.warranty)
    .bind(listing.private_seller)
    .bind(listing.published_at.map(to_micros))
    .bind(listing.upstream_updated_at.map(to_micros))
    .bind(to_micros(listing.lake_synced_at))
    .fetch_one(&mut *conn)
    .await
    .map_err(map_db_err)?;

    let fields = &location.fields;
    sqlx::query(
        "INSERT INTO warehouse_locations (listing_id, source_listing_id, listing_guid, location_id, \
             address, locality, postcode, district, region, country, latitude, longitude) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(listing_id) DO UPDATE SET \
             source_listing_id = excluded.source_listing_id, listing_guid = excluded.listing_guid, \
             location_id = excluded.location_id, address = excluded.address, \
             locality = excluded.locality, postcode = excluded.postcode, \
             district = excluded.district, region = excluded.region, \
             country = excluded.country, latitude = excluded.latitude, \
             longitude = excluded.longitude",
    )
    .bind(listing_id)
    .bind(location.key.source_listing_id())
    .bind(location.key.listing_guid())
    .bind(location.location_key)
    .bind(&fields.address)
    .bind(&fields.locality)
    .bind(&fields.postcode)
    .bind(&fields.district)
    .bind(&fields.region)
    .bind(&fields.country)
    .bind(fields.latitude)
    .bind(fields.longitude)
    .execute(&mut *conn)
    .await
    .map_err(map_db_err)?;

    for table in ["warehouse_equipment", "warehouse_texts", "warehouse_urls"] {
        sqlx::query(&format!("DELETE FROM {table} WHERE listing_id = ?"))
            .bind(listing_id)
            .execute(&mut *conn)
            .await
            .map_err(map_db_err)?;
    }
    for (position, equipment_id) in children.equipment.iter().enumerate() {
        sqlx::query(
            "INSERT INTO warehouse_equipment (listing_id, position, equipment_id) VALUES (?, ?, ?)",
        )
        .bind(listing_id)
        .bind(position as i64)
        .bind(equipment_id)
        .execute(&mut *conn)
        .await
        .map_err(map_db_err)?;
    }
    for (kind, body) in &children.texts {
        sqlx::query("INSERT INTO warehouse_texts (listing_id, kind, body) VALUES (?, ?, ?)")
            .bind(listing_id)
            .bind(kind.as_str())
            .bind(body)
            .execute(&mut *conn)
            .await
            .map_err(map_db_err)?;
    }
    for (position, (kind, url)) in children.urls.iter().enumerate() {
        sqlx::query(
            "INSERT INTO warehouse_urls (listing_id, position, kind, url) VALUES (?, ?, ?, ?)",
        )
        .bind(listing_id)
        .bind(position as i64)
        .bind(kind.as_str())
        .bind(url)
        .execute(&mut *conn)
        .await
        .map_err(map_db_err)?;
    }

    Ok(listing_id)
}
