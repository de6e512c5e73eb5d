use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use oculus_core::{
    CodedValue, EquipmentItem, ListingChildren, Marketplace, PipelineError, PipelineResult,
    RawListing, RawLocation,
};
use oculus_storage::HttpFetcher;
use serde_json::Value;
use tracing::{debug, warn};

use crate::normalize::{clean_text, json_path, json_text, parse_f64, parse_i32, parse_i64};
use crate::{
    AdapterContext, AdapterError, ListingSource, ListingSummary, PayloadCache, SearchCriteria,
    SearchPage,
};

const SEARCH_PATH: &str = "/api/v2/search-listings";
/// The search API serves fixed-size pages.
const PAGE_SIZE: usize = 20;

fn listing_id(vehicle: &Value) -> Option<String> {
    vehicle.get("id").and_then(json_text)
}

/// `"2019-03-01"` -> 2019.
fn registration_year(vehicle: &Value) -> Option<i32> {
    let date = vehicle.get("firstRegistrationDate").and_then(Value::as_str)?;
    let year = date.split('-').next()?;
    (year.len() == 4).then(|| parse_i32(Some(year))).flatten()
}

fn text_at(vehicle: &Value, path: &[&str]) -> Option<String> {
    json_path(vehicle, path).and_then(json_text)
}

/// Location arrives either as a plain place name or as a structured object.
fn location(vehicle: &Value) -> RawLocation {
    match vehicle.get("location") {
        Some(Value::String(place)) => RawLocation {
            locality: clean_text(place),
            ..Default::default()
        },
        Some(obj @ Value::Object(_)) => RawLocation {
            address: text_at(obj, &["street"]),
            locality: text_at(obj, &["city"]),
            postcode: text_at(obj, &["zip"]),
            district: text_at(obj, &["district"]),
            region: text_at(obj, &["state"]),
            country: text_at(obj, &["country"]),
            latitude: parse_f64(text_at(obj, &["lat"]).as_deref()),
            longitude: parse_f64(text_at(obj, &["lon"]).as_deref()),
        },
        _ => RawLocation::default(),
    }
}

pub(crate) fn map_payload(vehicle: &Value) -> PipelineResult<(RawListing, ListingChildren)> {
    let id = listing_id(vehicle).ok_or_else(|| PipelineError::MalformedPayload {
        marketplace: Marketplace::Gebrauchtwagen,
        reason: "listing without id".to_string(),
    })?;

    let mut listing = RawListing::new(Marketplace::Gebrauchtwagen, id);
    listing.status = Some("active".to_string());
    listing.make = text_at(vehicle, &["make", "formatted"]);
    listing.model = text_at(vehicle, &["model", "formatted"]);
    listing.year_model = registration_year(vehicle);
    listing.mileage_km = parse_i64(text_at(vehicle, &["mileage", "raw"]).as_deref());
    listing.power_kw = parse_i32(text_at(vehicle, &["powerInKW"]).as_deref());
    listing.price = parse_f64(text_at(vehicle, &["price", "raw"]).as_deref());
    listing.fuel = CodedValue::new(None, text_at(vehicle, &["fuel"]));
    listing.transmission = CodedValue::new(None, text_at(vehicle, &["transmission"]));
    listing.car_type = CodedValue::new(None, text_at(vehicle, &["bodyType"]));
    listing.color = text_at(vehicle, &["color"]);
    listing.location = location(vehicle);

    let mut children = ListingChildren::default();
    if let Some(images) = vehicle.get("images").and_then(Value::as_array) {
        children.image_urls = images
            .iter()
            .filter_map(|image| match image {
                Value::Object(_) => text_at(image, &["url"]),
                other => json_text(other),
            })
            .collect();
        children.main_image_url = children.image_urls.first().cloned();
    }
    children.seo_url = text_at(vehicle, &["url"]);

    Ok((listing, children))
}

pub(crate) fn parse_search_page(
    page: &Value,
) -> Result<(Vec<ListingSummary>, usize), AdapterError> {
    let Some(listings) = page.get("listings").filter(|v| !v.is_null()) else {
        return Ok((Vec::new(), 0));
    };
    let listings = listings.as_array().ok_or_else(|| AdapterError::Payload {
        marketplace: Marketplace::Gebrauchtwagen,
        reason: "listings is not an array".to_string(),
    })?;

    let mut summaries = Vec::with_capacity(listings.len());
    let mut skipped = 0;
    for vehicle in listings {
        match listing_id(vehicle) {
            Some(source_listing_id) => summaries.push(ListingSummary {
                source_listing_id,
                payload: vehicle.clone(),
            }),
            None => {
                warn!("gebrauchtwagen listing without id skipped");
                skipped += 1;
            }
        }
    }
    Ok((summaries, skipped))
}

pub struct GebrauchtwagenSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    cache: PayloadCache,
}

impl GebrauchtwagenSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: PayloadCache::default(),
        }
    }
}

#[async_trait]
impl ListingSource for GebrauchtwagenSource {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Gebrauchtwagen
    }

    /// Search results carry no timestamps, so the window cannot be applied
    /// here; `max_pages` bounds the crawl instead.
    async fn search(
        &self,
        ctx: &AdapterContext,
        criteria: &SearchCriteria,
    ) -> Result<Vec<SearchPage>, AdapterError> {
        self.cache.clear().await;
        let url = format!("{}{SEARCH_PATH}", self.base_url);
        let mut seen = HashSet::new();
        let mut pages = Vec::new();

        for page_no in 1..=criteria.max_pages.max(1) {
            let mut query = vec![
                ("sort".to_string(), "year".to_string()),
                ("desc".to_string(), "0".to_string()),
                ("custtype".to_string(), "D".to_string()),
                ("ustate".to_string(), "N,U".to_string()),
            ];
            if page_no > 1 {
                query.push(("page".to_string(), page_no.to_string()));
            }
            let Some(fetched) = self
                .http
                .get_json(ctx.run_id, "gebrauchtwagen", &url, &query)
                .await?
            else {
                break;
            };
            let (summaries, skipped) = parse_search_page(&fetched.value)?;
            let returned = summaries.len() + skipped;
            if returned == 0 {
                break;
            }

            let fresh: Vec<_> = summaries
                .into_iter()
                .filter(|s| seen.insert(s.source_listing_id.clone()))
                .collect();
            debug!(page = page_no, returned, fresh = fresh.len(), "gebrauchtwagen search page");
            if fresh.is_empty() {
                break;
            }

            self.cache.remember(&fresh).await;
            pages.push(SearchPage {
                url: fetched.final_url,
                body: fetched.body,
                summaries: fresh,
                skipped,
            });
            if returned < PAGE_SIZE {
                break;
            }
        }
        Ok(pages)
    }

    async fn get_details(
        &self,
        _ctx: &AdapterContext,
        source_listing_id: &str,
    ) -> Result<Option<Value>, AdapterError> {
        Ok(self.cache.get(source_listing_id).await)
    }

    /// The search API exposes no equipment.
    async fn get_equipment(
        &self,
        _ctx: &AdapterContext,
        _source_listing_id: &str,
    ) -> Result<Vec<EquipmentItem>, AdapterError> {
        Ok(Vec::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use chrono::{TimeZone, Utc};
    use serde_json::json;

    fn vehicle() -> Value {
        json!({
            "id": 5512093,
            "make": { "formatted": "Volkswagen" },
            "model": { "formatted": "Golf" },
            "mileage": { "raw": 45210 },
            "powerInKW": 110,
            "fuel": "Benzin",
            "firstRegistrationDate": "2021-04-01",
            "location": "Wien",
            "price": { "raw": 23490.0 },
            "images": [ { "url": "https://img.gebrauchtwagen.at/1.jpg" }, "https://img.gebrauchtwagen.at/2.jpg" ],
            "url": "/auto/volkswagen-golf-5512093"
        })
    }

    #[test]
    fn maps_search_listing_fields() {
        let now = Utc.with_ymd_and_hms(2024, 12, 1, 8, 0, 0).single().unwrap();
        let normalized = normalize(Marketplace::Gebrauchtwagen, &vehicle(), &[], now).unwrap();
        let listing = &normalized.listing;
        assert_eq!(listing.source_listing_id, "5512093");
        assert_eq!(listing.year_model, Some(2021));
        assert_eq!(listing.mileage_km, Some(45_210));
        assert_eq!(listing.power_kw, Some(110));
        assert_eq!(listing.price, Some(23_490.0));
        assert_eq!(listing.fuel.label(), Some("Benzin"));
        assert_eq!(listing.location.locality.as_deref(), Some("Wien"));
        assert_eq!(normalized.children.image_urls.len(), 2);
        assert_eq!(
            normalized.children.main_image_url.as_deref(),
            Some("https://img.gebrauchtwagen.at/1.jpg")
        );
    }

    #[test]
    fn blank_fuel_is_incomplete() {
        let now = Utc.with_ymd_and_hms(2024, 12, 1, 8, 0, 0).single().unwrap();
        let mut payload = vehicle();
        payload["fuel"] = json!("");
        let err = normalize(Marketplace::Gebrauchtwagen, &payload, &[], now).unwrap_err();
        assert!(matches!(err, PipelineError::IncompleteListing { .. }));
    }

    #[test]
    fn blank_equipment_from_the_source_does_not_reach_the_listing() {
        let now = Utc.with_ymd_and_hms(2024, 12, 1, 8, 0, 0).single().unwrap();
        let equipment = vec![
            EquipmentItem { code: "abs".into(), name: Some(" ABS ".into()) },
            EquipmentItem { code: " ".into(), name: None },
        ];
        let normalized =
            normalize(Marketplace::Gebrauchtwagen, &vehicle(), &equipment, now).unwrap();
        assert_eq!(normalized.children.equipment.len(), 1);
        assert_eq!(normalized.children.equipment[0].label(), "ABS");
    }

    #[test]
    fn malformed_registration_date_leaves_year_unknown() {
        let mut payload = vehicle();
        payload["firstRegistrationDate"] = json!("04/2021");
        assert_eq!(registration_year(&payload), None);
    }
}
