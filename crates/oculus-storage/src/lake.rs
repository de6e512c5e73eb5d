use chrono::{DateTime, Utc};
use oculus_core::{
    from_micros, to_micros, CodedValue, EquipmentItem, LakeRecord, LakeTable, ListingChildren,
    NormalizedListing, PipelineError, PipelineResult, RawListing, RawLocation, TextKind, UrlKind,
};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection, SqlitePool};
use tracing::{debug, info};

use crate::map_db_err;

const LISTING_COLUMNS: [&str; 32] = [
    "source_listing_id",
    "status",
    "make",
    "model",
    "year_model",
    "mileage_km",
    "seats",
    "power_kw",
    "owners",
    "price",
    "fuel_code",
    "fuel_display",
    "transmission_code",
    "transmission_display",
    "condition_code",
    "condition_display",
    "car_type_code",
    "car_type_display",
    "color",
    "warranty",
    "private_seller",
    "address",
    "locality",
    "postcode",
    "district",
    "region",
    "country",
    "latitude",
    "longitude",
    "published_us",
    "upstream_updated_us",
    "last_synced_us",
];

/// The stamp expression: wall clock, but never at or below the newest stamp
/// already in the table. Rows therefore commit in stamp order.
fn next_stamp_expr(table: &str) -> String {
    format!("MAX(?, IFNULL((SELECT MAX(last_synced_us) FROM {table}), 0) + 1)")
}

fn upsert_sql(table: LakeTable) -> String {
    let name = table.name();
    let bound = &LISTING_COLUMNS[..LISTING_COLUMNS.len() - 1];
    let updates = LISTING_COLUMNS[1..]
        .iter()
        .map(|c| format!("{c} = excluded.{c}"))
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "INSERT INTO {name} ({columns}) VALUES ({placeholders}, {stamp}) \
         ON CONFLICT(source_listing_id) DO UPDATE SET {updates} \
         RETURNING last_synced_us",
        columns = LISTING_COLUMNS.join(", "),
        placeholders = vec!["?"; bound.len()].join(", "),
        stamp = next_stamp_expr(name),
    )
}

/// Writes normalized listings into the raw lake and reads change sets back.
#[derive(Debug, Clone)]
pub struct LakeWriter {
    pool: SqlitePool,
}

impl LakeWriter {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite the row keyed by (marketplace, source id) and fully
    /// replace its children. Returns the row's new last-synced stamp, which is
    /// strictly greater than every stamp previously written to the table.
    pub async fn upsert_listing(
        &self,
        normalized: &NormalizedListing,
    ) -> PipelineResult<DateTime<Utc>> {
        let listing = &normalized.listing;
        if listing.source_listing_id.trim().is_empty() {
            return Err(PipelineError::MalformedPayload {
                marketplace: listing.marketplace,
                reason: "listing has no source id".to_string(),
            });
        }
        let table = listing.marketplace.lake_table();
        let sql = upsert_sql(table);
        let loc = &listing.location;

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let stamp: i64 = sqlx::query_scalar(&sql)
            .bind(&listing.source_listing_id)
            .bind(&listing.status)
            .bind(&listing.make)
            .bind(&listing.model)
            .bind(listing.year_model)
            .bind(listing.mileage_km)
            .bind(listing.seats)
            .bind(listing.power_kw)
            .bind(listing.owners)
            .bind(listing.price)
            .bind(&listing.fuel.code)
            .bind(&listing.fuel.display)
            .bind(&listing.transmission.code)
            .bind(&listing.transmission.display)
            .bind(&listing.condition.code)
            .bind(&listing.condition.display)
            .bind(&listing.car_type.code)
            .bind(&listing.car_type.display)
            .bind(&listing.color)
            .bind(listing.warranty)
            .bind(listing.private_seller)
            .bind(&loc.address)
            .bind(&loc.locality)
            .bind(&loc.postcode)
            .bind(&loc.district)
            .bind(&loc.region)
            .bind(&loc.country)
            .bind(loc.latitude)
            .bind(loc.longitude)
            .bind(listing.published_at.map(to_micros))
            .bind(listing.upstream_updated_at.map(to_micros))
            .bind(to_micros(Utc::now()))
            .fetch_one(&mut *tx)
            .await
            .map_err(map_db_err)?;

        replace_children(&mut tx, table, &listing.source_listing_id, &normalized.children)
            .await
            .map_err(map_db_err)?;
        tx.commit().await.map_err(map_db_err)?;

        debug!(%table, source_listing_id = %listing.source_listing_id, stamp, "lake row upserted");
        Ok(from_micros(stamp))
    }

    /// Rows with a stamp strictly after `after` (everything when `None`), in
    /// stamp order. At most `limit` rows unless the limit falls inside a run of
    /// equal stamps, in which case the whole run is returned so a watermark
    /// placed at the last stamp never strands a sibling.
    pub async fn fetch_changed(
        &self,
        table: LakeTable,
        after: Option<DateTime<Utc>>,
        limit: usize,
    ) -> PipelineResult<Vec<LakeRecord>> {
        let name = table.name();
        let after_us = after.map(to_micros).unwrap_or(i64::MIN);
        let offset = limit.max(1) as i64 - 1;

        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let boundary: Option<i64> = sqlx::query_scalar(&format!(
            "SELECT last_synced_us FROM {name} WHERE last_synced_us > ? \
             ORDER BY last_synced_us LIMIT 1 OFFSET ?"
        ))
        .bind(after_us)
        .bind(offset)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let rows = sqlx::query(&format!(
            "SELECT {columns} FROM {name} WHERE last_synced_us > ? AND last_synced_us <= ? \
             ORDER BY last_synced_us, source_listing_id",
            columns = LISTING_COLUMNS.join(", ")
        ))
        .bind(after_us)
        .bind(boundary.unwrap_or(i64::MAX))
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            let (listing, stamp) = listing_from_row(table, row).map_err(map_db_err)?;
            let children = load_children(&mut tx, table, &listing.source_listing_id)
                .await
                .map_err(map_db_err)?;
            records.push(LakeRecord {
                table,
                last_synced_at: from_micros(stamp),
                listing,
                children,
            });
        }
        tx.commit().await.map_err(map_db_err)?;
        Ok(records)
    }

    pub async fn get(
        &self,
        table: LakeTable,
        source_listing_id: &str,
    ) -> PipelineResult<Option<LakeRecord>> {
        let name = table.name();
        let mut conn = self.pool.acquire().await.map_err(map_db_err)?;
        let row = sqlx::query(&format!(
            "SELECT {columns} FROM {name} WHERE source_listing_id = ?",
            columns = LISTING_COLUMNS.join(", ")
        ))
        .bind(source_listing_id)
        .fetch_optional(&mut *conn)
        .await
        .map_err(map_db_err)?;

        let Some(row) = row else {
            return Ok(None);
        };
        let (listing, stamp) = listing_from_row(table, &row).map_err(map_db_err)?;
        let children = load_children(&mut conn, table, source_listing_id)
            .await
            .map_err(map_db_err)?;
        Ok(Some(LakeRecord {
            table,
            last_synced_at: from_micros(stamp),
            listing,
            children,
        }))
    }

    pub async fn count(&self, table: LakeTable) -> PipelineResult<i64> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", table.name()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }

    /// Give every dead-lettered row of `table` a fresh stamp so the next
    /// reconciliation run picks it up again, and clear the dead letters.
    pub async fn requeue_dead_letters(&self, table: LakeTable) -> PipelineResult<u64> {
        let name = table.name();
        let mut tx = self.pool.begin().await.map_err(map_db_err)?;
        let ids: Vec<String> = sqlx::query_scalar(
            "DELETE FROM reconcile_dead_letters WHERE table_name = ? RETURNING source_listing_id",
        )
        .bind(name)
        .fetch_all(&mut *tx)
        .await
        .map_err(map_db_err)?;

        let restamp = format!(
            "UPDATE {name} SET last_synced_us = {} WHERE source_listing_id = ?",
            next_stamp_expr(name)
        );
        let mut requeued = 0;
        for id in &ids {
            requeued += sqlx::query(&restamp)
                .bind(to_micros(Utc::now()))
                .bind(id)
                .execute(&mut *tx)
                .await
                .map_err(map_db_err)?
                .rows_affected();
        }
        tx.commit().await.map_err(map_db_err)?;
        info!(%table, requeued, cleared = ids.len(), "dead letters requeued");
        Ok(requeued)
    }
}

async fn replace_children(
    conn: &mut SqliteConnection,
    table: LakeTable,
    source_listing_id: &str,
    children: &ListingChildren,
) -> Result<(), sqlx::Error> {
    for child_table in [table.equipment_table(), table.texts_table(), table.urls_table()] {
        sqlx::query(&format!("DELETE FROM {child_table} WHERE source_listing_id = ?"))
            .bind(source_listing_id)
            .execute(&mut *conn)
            .await?;
    }

    let insert_equipment = format!(
        "INSERT INTO {} (source_listing_id, position, code, name) VALUES (?, ?, ?, ?)",
        table.equipment_table()
    );
    for (position, item) in children.equipment.iter().enumerate() {
        sqlx::query(&insert_equipment)
            .bind(source_listing_id)
            .bind(position as i64)
            .bind(&item.code)
            .bind(&item.name)
            .execute(&mut *conn)
            .await?;
    }

    let insert_text = format!(
        "INSERT INTO {} (source_listing_id, kind, body) VALUES (?, ?, ?)",
        table.texts_table()
    );
    for (kind, body) in children.texts() {
        sqlx::query(&insert_text)
            .bind(source_listing_id)
            .bind(kind.as_str())
            .bind(body)
            .execute(&mut *conn)
            .await?;
    }

    let insert_url = format!(
        "INSERT INTO {} (source_listing_id, position, kind, url) VALUES (?, ?, ?, ?)",
        table.urls_table()
    );
    for (position, (kind, url)) in children.urls().into_iter().enumerate() {
        sqlx::query(&insert_url)
            .bind(source_listing_id)
            .bind(position as i64)
            .bind(kind.as_str())
            .bind(url)
            .execute(&mut *conn)
            .await?;
    }
    Ok(())
}

async fn load_children(
    conn: &mut SqliteConnection,
    table: LakeTable,
    source_listing_id: &str,
) -> Result<ListingChildren, sqlx::Error> {
    let mut children = ListingChildren::default();

    let equipment = sqlx::query(&format!(
        "SELECT code, name FROM {} WHERE source_listing_id = ? ORDER BY position",
        table.equipment_table()
    ))
    .bind(source_listing_id)
    .fetch_all(&mut *conn)
    .await?;
    for row in equipment {
        children.equipment.push(EquipmentItem {
            code: row.try_get("code")?,
            name: row.try_get("name")?,
        });
    }

    let texts = sqlx::query(&format!(
        "SELECT kind, body FROM {} WHERE source_listing_id = ?",
        table.texts_table()
    ))
    .bind(source_listing_id)
    .fetch_all(&mut *conn)
    .await?;
    for row in texts {
        let kind: String = row.try_get("kind")?;
        if let Ok(kind) = kind.parse::<TextKind>() {
            children.set_text(kind, row.try_get("body")?);
        }
    }

    let urls = sqlx::query(&format!(
        "SELECT kind, url FROM {} WHERE source_listing_id = ? ORDER BY position",
        table.urls_table()
    ))
    .bind(source_listing_id)
    .fetch_all(&mut *conn)
    .await?;
    for row in urls {
        let kind: String = row.try_get("kind")?;
        if let Ok(kind) = kind.parse::<UrlKind>() {
            children.push_url(kind, row.try_get("url")?);
        }
    }

    Ok(children)
}

fn listing_from_row(table: LakeTable, row: &SqliteRow) -> Result<(RawListing, i64), sqlx::Error> {
    let mut listing = RawListing::new(table.marketplace(), row.try_get::<String, _>("source_listing_id")?);
    listing.status = row.try_get("status")?;
    listing.make = row.try_get("make")?;
    listing.model = row.try_get("model")?;
    listing.year_model = row.try_get("year_model")?;
    listing.mileage_km = row.try_get("mileage_km")?;
    listing.seats = row.try_get("seats")?;
    listing.power_kw = row.try_get("power_kw")?;
    listing.owners = row.try_get("owners")?;
    listing.price = row.try_get("price")?;
    listing.fuel = CodedValue::new(row.try_get("fuel_code")?, row.try_get("fuel_display")?);
    listing.transmission = CodedValue::new(
        row.try_get("transmission_code")?,
        row.try_get("transmission_display")?,
    );
    listing.condition = CodedValue::new(
        row.try_get("condition_code")?,
        row.try_get("condition_display")?,
    );
    listing.car_type = CodedValue::new(
        row.try_get("car_type_code")?,
        row.try_get("car_type_display")?,
    );
    listing.color = row.try_get("color")?;
    listing.warranty = row.try_get("warranty")?;
    listing.private_seller = row.try_get("private_seller")?;
    listing.location = RawLocation {
        address: row.try_get("address")?,
        locality: row.try_get("locality")?,
        postcode: row.try_get("postcode")?,
        district: row.try_get("district")?,
        region: row.try_get("region")?,
        country: row.try_get("country")?,
        latitude: row.try_get("latitude")?,
        longitude: row.try_get("longitude")?,
    };
    listing.published_at = row.try_get::<Option<i64>, _>("published_us")?.map(from_micros);
    listing.upstream_updated_at = row
        .try_get::<Option<i64>, _>("upstream_updated_us")?
        .map(from_micros);
    Ok((listing, row.try_get("last_synced_us")?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::temp_store;
    use oculus_core::Marketplace;

    fn sample(id: &str, model: &str) -> NormalizedListing {
        let mut listing = RawListing::new(Marketplace::Willhaben, id);
        listing.make = Some("BMW".into());
        listing.model = Some(model.into());
        listing.year_model = Some(2019);
        listing.mileage_km = Some(84_000);
        listing.fuel = CodedValue::new(Some("100003".into()), Some("Diesel".into()));
        listing.location.locality = Some("Graz".into());
        NormalizedListing {
            listing,
            children: ListingChildren {
                equipment: vec![
                    EquipmentItem { code: "52".into(), name: Some("Navigationssystem".into()) },
                    EquipmentItem { code: "9".into(), name: None },
                ],
                heading: Some("BMW X5 xDrive30d".into()),
                main_image_url: Some("https://cache.willhaben.at/a.jpg".into()),
                image_urls: vec!["https://cache.willhaben.at/b.jpg".into()],
                ..Default::default()
            },
        }
    }

    #[tokio::test]
    async fn upsert_round_trips_listing_and_children() {
        let (_dir, store) = temp_store().await;
        let lake = store.lake();
        let stamp = lake.upsert_listing(&sample("100", "X5")).await.unwrap();

        let record = lake.get(LakeTable::Willhaben, "100").await.unwrap().unwrap();
        assert_eq!(record.last_synced_at, stamp);
        assert_eq!(record.listing, sample("100", "X5").listing);
        assert_eq!(record.children, sample("100", "X5").children);
    }

    #[tokio::test]
    async fn overwrite_replaces_children_and_bumps_stamp() {
        let (_dir, store) = temp_store().await;
        let lake = store.lake();
        let first = lake.upsert_listing(&sample("100", "X5")).await.unwrap();

        let mut updated = sample("100", "X6");
        updated.children.equipment.truncate(1);
        updated.children.image_urls.clear();
        let second = lake.upsert_listing(&updated).await.unwrap();

        assert!(second > first);
        assert_eq!(lake.count(LakeTable::Willhaben).await.unwrap(), 1);
        let record = lake.get(LakeTable::Willhaben, "100").await.unwrap().unwrap();
        assert_eq!(record.listing.model.as_deref(), Some("X6"));
        assert_eq!(record.children.equipment.len(), 1);
        assert!(record.children.image_urls.is_empty());
    }

    #[tokio::test]
    async fn stamps_are_strictly_increasing_within_a_table() {
        let (_dir, store) = temp_store().await;
        let lake = store.lake();
        let mut previous = None;
        for i in 0..20 {
            let stamp = lake.upsert_listing(&sample(&i.to_string(), "X5")).await.unwrap();
            if let Some(prev) = previous {
                assert!(stamp > prev);
            }
            previous = Some(stamp);
        }
    }

    #[tokio::test]
    async fn fetch_changed_pages_by_stamp_and_extends_ties() {
        let (_dir, store) = temp_store().await;
        let lake = store.lake();
        for id in ["a", "b", "c", "d"] {
            lake.upsert_listing(&sample(id, "X5")).await.unwrap();
        }
        // Force a tie between "b" and "c".
        sqlx::query(
            "UPDATE lake_willhaben SET last_synced_us = \
             (SELECT last_synced_us FROM lake_willhaben WHERE source_listing_id = 'b') \
             WHERE source_listing_id = 'c'",
        )
        .execute(store.pool())
        .await
        .unwrap();

        let first = lake.fetch_changed(LakeTable::Willhaben, None, 2).await.unwrap();
        let ids: Vec<_> = first.iter().map(|r| r.listing.source_listing_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);

        let rest = lake
            .fetch_changed(LakeTable::Willhaben, Some(first[2].last_synced_at), 2)
            .await
            .unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].listing.source_listing_id, "d");
        assert!(lake
            .fetch_changed(LakeTable::Willhaben, Some(rest[0].last_synced_at), 2)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn blank_source_id_is_malformed() {
        let (_dir, store) = temp_store().await;
        let err = store.lake().upsert_listing(&sample("  ", "X5")).await.unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload { .. }));
    }
}
