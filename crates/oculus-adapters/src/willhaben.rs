use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use oculus_core::{
    CodedValue, EquipmentItem, ListingChildren, Marketplace, PipelineError, PipelineResult,
    RawListing, RawLocation, TextKind,
};
use oculus_storage::HttpFetcher;
use serde_json::Value;
use tracing::{debug, warn};

use crate::normalize::{
    clean_text, clean_truncated, json_path, json_text, parse_bool, parse_coordinates, parse_f64,
    parse_i32, parse_i64, parse_timestamp, split_list, DESCRIPTION_MAX_CHARS, SHORT_TEXT_MAX_CHARS,
};
use crate::{
    AdapterContext, AdapterError, ListingSource, ListingSummary, PayloadCache, SearchCriteria,
    SearchPage,
};

const SEARCH_PATH: &str = "/webapi/iad/search/atz/seo/gebrauchtwagen/auto/gebrauchtwagenboerse";
const SORT_NEWEST_FIRST: &str = "1";

/// Flattened `attributes.attribute[]` of a willhaben advert.
struct Attributes(HashMap<String, Vec<String>>);

impl Attributes {
    fn of(advert: &Value) -> Self {
        let mut map = HashMap::new();
        let entries = json_path(advert, &["attributes", "attribute"])
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or_default();
        for entry in entries {
            let Some(name) = entry.get("name").and_then(Value::as_str) else {
                continue;
            };
            let values = entry
                .get("values")
                .and_then(Value::as_array)
                .map(|vals| vals.iter().filter_map(json_text).collect())
                .unwrap_or_default();
            map.insert(name.to_string(), values);
        }
        Self(map)
    }

    fn first(&self, name: &str) -> Option<&str> {
        self.0.get(name)?.first().map(String::as_str)
    }

    fn text(&self, name: &str) -> Option<String> {
        self.first(name).and_then(clean_text)
    }

    fn truncated(&self, name: &str, max_chars: usize) -> Option<String> {
        self.first(name).and_then(|t| clean_truncated(t, max_chars))
    }

    /// Every value of a list attribute, whether sent as several values or as
    /// one `;`-separated string.
    fn list(&self, name: &str) -> Vec<String> {
        self.0
            .get(name)
            .map(|values| values.iter().flat_map(|v| split_list(v)).collect())
            .unwrap_or_default()
    }

    fn coded(&self, code: &str, resolved: &str) -> CodedValue {
        CodedValue::new(self.text(code), self.text(resolved))
    }
}

fn advert_id(advert: &Value) -> Option<String> {
    advert.get("id").and_then(json_text)
}

pub(crate) fn map_payload(advert: &Value) -> PipelineResult<(RawListing, ListingChildren)> {
    let id = advert_id(advert).ok_or_else(|| PipelineError::MalformedPayload {
        marketplace: Marketplace::Willhaben,
        reason: "advert without id".to_string(),
    })?;
    let attrs = Attributes::of(advert);

    let mut listing = RawListing::new(Marketplace::Willhaben, id);
    listing.status = json_path(advert, &["advertStatus", "id"]).and_then(json_text);
    listing.make = attrs.text("CAR_MODEL/MAKE");
    listing.model = attrs.text("CAR_MODEL/MODEL");
    listing.year_model = parse_i32(attrs.first("YEAR_MODEL"));
    listing.mileage_km = parse_i64(attrs.first("MILEAGE"));
    listing.seats = parse_i32(attrs.first("NOOFSEATS"));
    listing.power_kw = parse_i32(attrs.first("ENGINE/EFFECT"));
    listing.owners = parse_i32(attrs.first("NO_OF_OWNERS"));
    listing.price = parse_f64(attrs.first("PRICE/AMOUNT"));
    listing.fuel = attrs.coded("ENGINE/FUEL", "ENGINE/FUEL_RESOLVED");
    listing.transmission = attrs.coded("TRANSMISSION", "TRANSMISSION_RESOLVED");
    listing.condition = attrs.coded("CONDITION", "CONDITION_RESOLVED");
    listing.car_type = CodedValue::new(attrs.text("CAR_TYPE"), None);
    listing.color = attrs.text("EXTERIORCOLOURMAIN");
    listing.warranty = parse_bool(attrs.first("WARRANTY_RESOLVED"))
        .or_else(|| parse_bool(attrs.first("WARRANTY")));
    listing.private_seller = parse_bool(attrs.first("ISPRIVATE"));
    listing.published_at = parse_timestamp(attrs.first("PUBLISHED"));
    listing.upstream_updated_at = parse_timestamp(attrs.first("LAST_UPDATED"));

    let (latitude, longitude) = parse_coordinates(attrs.first("COORDINATES"));
    listing.location = RawLocation {
        address: attrs.text("ADDRESS"),
        locality: attrs.text("LOCATION"),
        postcode: attrs.text("POSTCODE"),
        district: attrs.text("DISTRICT"),
        region: attrs.text("STATE"),
        country: attrs.text("COUNTRY"),
        latitude,
        longitude,
    };

    let mut children = ListingChildren::default();
    if let Some(spec) = attrs.truncated("CAR_MODEL/MODEL_SPECIFICATION", SHORT_TEXT_MAX_CHARS) {
        children.set_text(TextKind::Specification, spec);
    }
    if let Some(heading) = attrs.truncated("HEADING", SHORT_TEXT_MAX_CHARS) {
        children.set_text(TextKind::Heading, heading);
    }
    if let Some(head) = advert
        .get("description")
        .and_then(Value::as_str)
        .and_then(|d| clean_truncated(d, SHORT_TEXT_MAX_CHARS))
    {
        children.set_text(TextKind::DescriptionHead, head);
    }
    if let Some(body) = attrs.truncated("BODY_DYN", DESCRIPTION_MAX_CHARS) {
        children.set_text(TextKind::Description, body);
    }
    children.main_image_url = json_path(advert, &["advertImageList", "advertImage"])
        .and_then(Value::as_array)
        .and_then(|images| images.first())
        .and_then(|image| image.get("mainImageUrl"))
        .and_then(json_text);
    children.image_urls = attrs.list("ALL_IMAGE_URLS");
    children.seo_url = attrs.text("SEO_URL");

    Ok((listing, children))
}

/// Equipment codes paired positionally with their resolved names.
pub(crate) fn equipment_from_payload(advert: &Value) -> Vec<EquipmentItem> {
    let attrs = Attributes::of(advert);
    let names = attrs.list("EQUIPMENT_RESOLVED");
    attrs
        .list("EQUIPMENT")
        .into_iter()
        .enumerate()
        .map(|(i, code)| EquipmentItem {
            code,
            name: names.get(i).cloned(),
        })
        .collect()
}

pub(crate) fn parse_search_page(
    page: &Value,
) -> Result<(Vec<ListingSummary>, usize), AdapterError> {
    let Some(adverts) = json_path(page, &["advertSummaryList", "advertSummary"]) else {
        // An empty result page omits the list entirely.
        return Ok((Vec::new(), 0));
    };
    let adverts = adverts.as_array().ok_or_else(|| AdapterError::Payload {
        marketplace: Marketplace::Willhaben,
        reason: "advertSummary is not an array".to_string(),
    })?;

    let mut summaries = Vec::with_capacity(adverts.len());
    let mut skipped = 0;
    for advert in adverts {
        match advert_id(advert) {
            Some(source_listing_id) => summaries.push(ListingSummary {
                source_listing_id,
                payload: advert.clone(),
            }),
            None => {
                warn!("willhaben advert without id skipped");
                skipped += 1;
            }
        }
    }
    Ok((summaries, skipped))
}

/// When the advert was last touched upstream, if it says.
fn touched_at(advert: &Value) -> Option<DateTime<Utc>> {
    let attrs = Attributes::of(advert);
    parse_timestamp(attrs.first("LAST_UPDATED")).or_else(|| parse_timestamp(attrs.first("PUBLISHED")))
}

pub struct WillhabenSource {
    http: Arc<HttpFetcher>,
    base_url: String,
    cache: PayloadCache,
}

impl WillhabenSource {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            cache: PayloadCache::default(),
        }
    }
}

#[async_trait]
impl ListingSource for WillhabenSource {
    fn marketplace(&self) -> Marketplace {
        Marketplace::Willhaben
    }

    /// Pages newest-first and stops at the first page reaching past the window.
    async fn search(
        &self,
        ctx: &AdapterContext,
        criteria: &SearchCriteria,
    ) -> Result<Vec<SearchPage>, AdapterError> {
        self.cache.clear().await;
        let url = format!("{}{SEARCH_PATH}", self.base_url);
        let cutoff = ctx.fetched_at - Duration::hours(i64::from(criteria.window_hours));
        let mut pages = Vec::new();

        for page_no in 1..=criteria.max_pages.max(1) {
            let query = vec![
                ("page".to_string(), page_no.to_string()),
                ("rows".to_string(), criteria.page_size.to_string()),
                ("sort".to_string(), SORT_NEWEST_FIRST.to_string()),
            ];
            let Some(fetched) = self.http.get_json(ctx.run_id, "willhaben", &url, &query).await?
            else {
                break;
            };
            let (summaries, skipped) = parse_search_page(&fetched.value)?;
            if summaries.is_empty() && skipped == 0 {
                break;
            }

            let returned = summaries.len();
            let in_window: Vec<_> = summaries
                .into_iter()
                .filter(|s| touched_at(&s.payload).map_or(true, |ts| ts >= cutoff))
                .collect();
            let reached_window_end = in_window.len() < returned;
            debug!(page = page_no, returned, kept = in_window.len(), "willhaben search page");

            self.cache.remember(&in_window).await;
            pages.push(SearchPage {
                url: fetched.final_url,
                body: fetched.body,
                summaries: in_window,
                skipped,
            });
            if reached_window_end {
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

    async fn get_equipment(
        &self,
        _ctx: &AdapterContext,
        source_listing_id: &str,
    ) -> Result<Vec<EquipmentItem>, AdapterError> {
        Ok(self
            .cache
            .get(source_listing_id)
            .await
            .map(|advert| equipment_from_payload(&advert))
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::normalize::normalize;
    use chrono::TimeZone;
    use serde_json::json;

    fn advert(attrs: &[(&str, &str)]) -> Value {
        json!({
            "id": "873214559",
            "description": "BMW X5 xDrive30d\u{00a0}M Sport",
            "advertStatus": { "id": "active" },
            "attributes": {
                "attribute": attrs
                    .iter()
                    .map(|(name, value)| json!({ "name": name, "values": [value] }))
                    .collect::<Vec<_>>()
            },
            "advertImageList": { "advertImage": [ { "mainImageUrl": "https://cache.willhaben.at/main.jpg" } ] }
        })
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 12, 1, 8, 0, 0).single().unwrap()
    }

    #[test]
    fn maps_attributes_into_listing_and_children() {
        let payload = advert(&[
            ("CAR_MODEL/MAKE", "BMW"),
            ("CAR_MODEL/MODEL", "X5"),
            ("CAR_MODEL/MODEL_SPECIFICATION", "xDrive30d"),
            ("YEAR_MODEL", "2019"),
            ("MILEAGE", "84000"),
            ("ENGINE/EFFECT", "195"),
            ("ENGINE/FUEL", "100003"),
            ("ENGINE/FUEL_RESOLVED", "Diesel"),
            ("TRANSMISSION_RESOLVED", "Automatik"),
            ("PRICE/AMOUNT", "41900"),
            ("ISPRIVATE", "0"),
            ("LOCATION", "Graz"),
            ("COORDINATES", "47.0707,15.4395"),
            ("ALL_IMAGE_URLS", "a.jpg;b.jpg; "),
            ("EQUIPMENT", "52;9"),
            ("EQUIPMENT_RESOLVED", "Navigationssystem;Klimaanlage"),
        ]);
        let normalized = normalize(Marketplace::Willhaben, &payload, &equipment_from_payload(&payload), now())
            .unwrap();
        let listing = &normalized.listing;
        assert_eq!(listing.source_listing_id, "873214559");
        assert_eq!(listing.fuel.label(), Some("Diesel"));
        assert_eq!(listing.transmission.code, None);
        assert_eq!(listing.private_seller, Some(false));
        assert_eq!(listing.location.latitude, Some(47.0707));
        assert_eq!(
            normalized.children.description_head.as_deref(),
            Some("BMW X5 xDrive30d M Sport")
        );
        assert_eq!(normalized.children.image_urls, vec!["a.jpg", "b.jpg"]);
        assert_eq!(normalized.children.equipment[1].name.as_deref(), Some("Klimaanlage"));
    }

    #[test]
    fn empty_mileage_and_year_is_incomplete_not_near_new() {
        let payload = advert(&[
            ("CAR_MODEL/MODEL", "X5"),
            ("ENGINE/FUEL_RESOLVED", "Diesel"),
            ("MILEAGE", ""),
            ("YEAR_MODEL", ""),
        ]);
        let err = normalize(Marketplace::Willhaben, &payload, &[], now()).unwrap_err();
        match err {
            PipelineError::IncompleteListing { missing, listing_id, .. } => {
                assert_eq!(missing, vec!["year_model"]);
                assert_eq!(listing_id, "873214559");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn low_mileage_without_year_is_treated_as_new() {
        let payload = advert(&[
            ("CAR_MODEL/MODEL", "iX1"),
            ("ENGINE/FUEL_RESOLVED", "Elektro"),
            ("MILEAGE", "15"),
        ]);
        let normalized = normalize(Marketplace::Willhaben, &payload, &[], now()).unwrap();
        assert_eq!(normalized.listing.year_model, Some(2024));
        assert_eq!(normalized.listing.mileage_km, Some(0));

        let used = advert(&[
            ("CAR_MODEL/MODEL", "iX1"),
            ("ENGINE/FUEL_RESOLVED", "Elektro"),
            ("MILEAGE", "1000"),
        ]);
        assert!(normalize(Marketplace::Willhaben, &used, &[], now()).is_err());
    }

    #[test]
    fn advert_without_id_is_malformed() {
        let mut payload = advert(&[("CAR_MODEL/MODEL", "X5")]);
        payload["id"] = json!("  ");
        let err = normalize(Marketplace::Willhaben, &payload, &[], now()).unwrap_err();
        assert!(matches!(err, PipelineError::MalformedPayload { .. }));
    }

    #[test]
    fn search_page_without_list_is_empty() {
        let (summaries, skipped) = parse_search_page(&json!({ "rowsReturned": 0 })).unwrap();
        assert!(summaries.is_empty());
        assert_eq!(skipped, 0);
    }
}
