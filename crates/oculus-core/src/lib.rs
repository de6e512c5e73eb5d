//! Core domain model for the oculus listing pipeline.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

mod error;

pub use error::{PipelineError, PipelineResult};

/// The external listing marketplaces the pipeline ingests from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Marketplace {
    Willhaben,
    Gebrauchtwagen,
}

impl Marketplace {
    pub const ALL: [Marketplace; 2] = [Marketplace::Willhaben, Marketplace::Gebrauchtwagen];

    pub fn as_str(&self) -> &'static str {
        match self {
            Marketplace::Willhaben => "willhaben",
            Marketplace::Gebrauchtwagen => "gebrauchtwagen",
        }
    }

    pub fn lake_table(&self) -> LakeTable {
        match self {
            Marketplace::Willhaben => LakeTable::Willhaben,
            Marketplace::Gebrauchtwagen => LakeTable::Gebrauchtwagen,
        }
    }

    /// Whether the marketplace's ad ids are stable enough to key warehouse rows.
    /// Marketplaces without stable ids get an internal GUID instead.
    pub fn has_stable_ids(&self) -> bool {
        matches!(self, Marketplace::Willhaben)
    }
}

impl fmt::Display for Marketplace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Marketplace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "willhaben" => Ok(Marketplace::Willhaben),
            "gebrauchtwagen" => Ok(Marketplace::Gebrauchtwagen),
            other => Err(format!("unknown marketplace '{other}'")),
        }
    }
}

/// Raw lake tables, one per marketplace. Each has its own sync watermark.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LakeTable {
    Willhaben,
    Gebrauchtwagen,
}

impl LakeTable {
    pub const ALL: [LakeTable; 2] = [LakeTable::Willhaben, LakeTable::Gebrauchtwagen];

    pub fn name(&self) -> &'static str {
        match self {
            LakeTable::Willhaben => "lake_willhaben",
            LakeTable::Gebrauchtwagen => "lake_gebrauchtwagen",
        }
    }

    pub fn equipment_table(&self) -> &'static str {
        match self {
            LakeTable::Willhaben => "lake_willhaben_equipment",
            LakeTable::Gebrauchtwagen => "lake_gebrauchtwagen_equipment",
        }
    }

    pub fn texts_table(&self) -> &'static str {
        match self {
            LakeTable::Willhaben => "lake_willhaben_texts",
            LakeTable::Gebrauchtwagen => "lake_gebrauchtwagen_texts",
        }
    }

    pub fn urls_table(&self) -> &'static str {
        match self {
            LakeTable::Willhaben => "lake_willhaben_urls",
            LakeTable::Gebrauchtwagen => "lake_gebrauchtwagen_urls",
        }
    }

    pub fn marketplace(&self) -> Marketplace {
        match self {
            LakeTable::Willhaben => Marketplace::Willhaben,
            LakeTable::Gebrauchtwagen => Marketplace::Gebrauchtwagen,
        }
    }
}

impl fmt::Display for LakeTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LakeTable {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        LakeTable::ALL
            .into_iter()
            .find(|t| t.name() == s || t.marketplace().as_str() == s)
            .ok_or_else(|| format!("unknown lake table '{s}'"))
    }
}

/// Warehouse dimension tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DimensionFamily {
    Make,
    Model,
    Fuel,
    Transmission,
    Condition,
    CarType,
    Color,
    Location,
    Equipment,
}

impl DimensionFamily {
    pub const ALL: [DimensionFamily; 9] = [
        DimensionFamily::Make,
        DimensionFamily::Model,
        DimensionFamily::Fuel,
        DimensionFamily::Transmission,
        DimensionFamily::Condition,
        DimensionFamily::CarType,
        DimensionFamily::Color,
        DimensionFamily::Location,
        DimensionFamily::Equipment,
    ];

    pub fn table(&self) -> &'static str {
        match self {
            DimensionFamily::Make => "dim_make",
            DimensionFamily::Model => "dim_model",
            DimensionFamily::Fuel => "dim_fuel",
            DimensionFamily::Transmission => "dim_transmission",
            DimensionFamily::Condition => "dim_condition",
            DimensionFamily::CarType => "dim_car_type",
            DimensionFamily::Color => "dim_color",
            DimensionFamily::Location => "dim_location",
            DimensionFamily::Equipment => "dim_equipment",
        }
    }

    /// Hierarchical families carry a parent reference (model -> make).
    pub fn parent(&self) -> Option<DimensionFamily> {
        match self {
            DimensionFamily::Model => Some(DimensionFamily::Make),
            _ => None,
        }
    }
}

impl fmt::Display for DimensionFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.table().trim_start_matches("dim_"))
    }
}

/// A dimension value split into its stored form and its comparison key.
///
/// The display form keeps the first-seen casing with whitespace collapsed;
/// the key is additionally case-folded and is what uniqueness is checked on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DimensionName {
    pub display: String,
    pub key: String,
}

impl DimensionName {
    /// Returns `None` for blank input so empty names never reach a dimension table.
    pub fn parse(raw: &str) -> Option<Self> {
        let display = raw.split_whitespace().collect::<Vec<_>>().join(" ");
        if display.is_empty() {
            return None;
        }
        let key = display.to_lowercase();
        Some(Self { display, key })
    }
}

/// A coded marketplace attribute stored both as raw code and resolved label.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CodedValue {
    pub code: Option<String>,
    pub display: Option<String>,
}

impl CodedValue {
    pub fn new(code: Option<String>, display: Option<String>) -> Self {
        Self { code, display }
    }

    /// The name used for dimension resolution: resolved label, else raw code.
    pub fn label(&self) -> Option<&str> {
        self.display.as_deref().or(self.code.as_deref())
    }

    pub fn is_unknown(&self) -> bool {
        self.label().is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct RawLocation {
    pub address: Option<String>,
    pub locality: Option<String>,
    pub postcode: Option<String>,
    pub district: Option<String>,
    pub region: Option<String>,
    pub country: Option<String>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
}

impl RawLocation {
    /// Natural name for the location dimension.
    pub fn dimension_label(&self) -> Option<&str> {
        self.locality.as_deref().or(self.district.as_deref())
    }
}

/// One lake row, after source-specific cleaning. The row's last-synced stamp
/// is assigned by the lake writer and travels separately in [`LakeRecord`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RawListing {
    pub marketplace: Marketplace,
    pub source_listing_id: String,
    pub status: Option<String>,
    pub make: Option<String>,
    pub model: Option<String>,
    pub year_model: Option<i32>,
    pub mileage_km: Option<i64>,
    pub seats: Option<i32>,
    pub power_kw: Option<i32>,
    pub owners: Option<i32>,
    pub price: Option<f64>,
    pub fuel: CodedValue,
    pub transmission: CodedValue,
    pub condition: CodedValue,
    pub car_type: CodedValue,
    pub color: Option<String>,
    pub warranty: Option<bool>,
    pub private_seller: Option<bool>,
    pub location: RawLocation,
    pub published_at: Option<DateTime<Utc>>,
    pub upstream_updated_at: Option<DateTime<Utc>>,
}

impl RawListing {
    pub fn new(marketplace: Marketplace, source_listing_id: impl Into<String>) -> Self {
        Self {
            marketplace,
            source_listing_id: source_listing_id.into(),
            status: None,
            make: None,
            model: None,
            year_model: None,
            mileage_km: None,
            seats: None,
            power_kw: None,
            owners: None,
            price: None,
            fuel: CodedValue::default(),
            transmission: CodedValue::default(),
            condition: CodedValue::default(),
            car_type: CodedValue::default(),
            color: None,
            warranty: None,
            private_seller: None,
            location: RawLocation::default(),
            published_at: None,
            upstream_updated_at: None,
        }
    }

    /// Names of the load-bearing attributes that are still unknown.
    pub fn missing_required(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.model.is_none() {
            missing.push("model");
        }
        if self.fuel.is_unknown() {
            missing.push("fuel");
        }
        if self.year_model.is_none() {
            missing.push("year_model");
        }
        missing
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EquipmentItem {
    pub code: String,
    pub name: Option<String>,
}

impl EquipmentItem {
    pub fn label(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.code)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TextKind {
    Specification,
    Heading,
    DescriptionHead,
    Description,
}

impl TextKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TextKind::Specification => "specification",
            TextKind::Heading => "heading",
            TextKind::DescriptionHead => "description_head",
            TextKind::Description => "description",
        }
    }
}

impl FromStr for TextKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "specification" => Ok(TextKind::Specification),
            "heading" => Ok(TextKind::Heading),
            "description_head" => Ok(TextKind::DescriptionHead),
            "description" => Ok(TextKind::Description),
            other => Err(format!("unknown text kind '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum UrlKind {
    MainImage,
    Image,
    Seo,
}

impl UrlKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            UrlKind::MainImage => "main_image",
            UrlKind::Image => "image",
            UrlKind::Seo => "seo",
        }
    }
}

impl FromStr for UrlKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "main_image" => Ok(UrlKind::MainImage),
            "image" => Ok(UrlKind::Image),
            "seo" => Ok(UrlKind::Seo),
            other => Err(format!("unknown url kind '{other}'")),
        }
    }
}

/// Child collections of a listing. Always replaced as a whole, never patched.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ListingChildren {
    pub equipment: Vec<EquipmentItem>,
    pub specification: Option<String>,
    pub heading: Option<String>,
    pub description_head: Option<String>,
    pub description: Option<String>,
    pub main_image_url: Option<String>,
    pub image_urls: Vec<String>,
    pub seo_url: Option<String>,
}

impl ListingChildren {
    pub fn texts(&self) -> Vec<(TextKind, &str)> {
        [
            (TextKind::Specification, &self.specification),
            (TextKind::Heading, &self.heading),
            (TextKind::DescriptionHead, &self.description_head),
            (TextKind::Description, &self.description),
        ]
        .into_iter()
        .filter_map(|(kind, text)| text.as_deref().map(|t| (kind, t)))
        .collect()
    }

    /// URLs in a stable order: main image, gallery images, SEO link.
    pub fn urls(&self) -> Vec<(UrlKind, &str)> {
        let mut out = Vec::with_capacity(self.image_urls.len() + 2);
        if let Some(url) = &self.main_image_url {
            out.push((UrlKind::MainImage, url.as_str()));
        }
        out.extend(self.image_urls.iter().map(|u| (UrlKind::Image, u.as_str())));
        if let Some(url) = &self.seo_url {
            out.push((UrlKind::Seo, url.as_str()));
        }
        out
    }

    pub fn set_text(&mut self, kind: TextKind, text: String) {
        match kind {
            TextKind::Specification => self.specification = Some(text),
            TextKind::Heading => self.heading = Some(text),
            TextKind::DescriptionHead => self.description_head = Some(text),
            TextKind::Description => self.description = Some(text),
        }
    }

    pub fn push_url(&mut self, kind: UrlKind, url: String) {
        match kind {
            UrlKind::MainImage => self.main_image_url = Some(url),
            UrlKind::Image => self.image_urls.push(url),
            UrlKind::Seo => self.seo_url = Some(url),
        }
    }
}

/// Normalizer output and lake writer input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NormalizedListing {
    pub listing: RawListing,
    pub children: ListingChildren,
}

/// A lake row read back for reconciliation.
#[derive(Debug, Clone, PartialEq)]
pub struct LakeRecord {
    pub table: LakeTable,
    pub last_synced_at: DateTime<Utc>,
    pub listing: RawListing,
    pub children: ListingChildren,
}

/// Upsert key of a warehouse fact row. Exactly one identity column is set.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FactKey {
    Native(String),
    Guid(Uuid),
}

impl FactKey {
    pub fn source_listing_id(&self) -> Option<&str> {
        match self {
            FactKey::Native(id) => Some(id),
            FactKey::Guid(_) => None,
        }
    }

    pub fn listing_guid(&self) -> Option<String> {
        match self {
            FactKey::Native(_) => None,
            FactKey::Guid(guid) => Some(guid.to_string()),
        }
    }
}

impl fmt::Display for FactKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FactKey::Native(id) => write!(f, "native:{id}"),
            FactKey::Guid(guid) => write!(f, "guid:{guid}"),
        }
    }
}

/// Resolved dimension foreign keys for one fact row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DimensionKeys {
    pub make: Option<i64>,
    pub model: i64,
    pub fuel: i64,
    pub transmission: Option<i64>,
    pub condition: Option<i64>,
    pub car_type: Option<i64>,
    pub color: Option<i64>,
    pub location: Option<i64>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseListing {
    pub key: FactKey,
    pub marketplace: Marketplace,
    pub dimensions: DimensionKeys,
    pub status: Option<String>,
    pub year_model: i32,
    pub mileage_km: Option<i64>,
    pub seats: Option<i32>,
    pub power_kw: Option<i32>,
    pub owners: Option<i32>,
    pub price: Option<f64>,
    pub predicted_price: Option<f64>,
    pub warranty: Option<bool>,
    pub private_seller: Option<bool>,
    pub published_at: Option<DateTime<Utc>>,
    pub upstream_updated_at: Option<DateTime<Utc>>,
    pub lake_synced_at: DateTime<Utc>,
}

/// Denormalized address/geocoding row, 1:1 with [`WarehouseListing`].
#[derive(Debug, Clone, PartialEq)]
pub struct WarehouseLocation {
    pub key: FactKey,
    pub location_key: Option<i64>,
    pub fields: RawLocation,
}

/// Warehouse-side children: equipment as dimension keys, texts and URLs copied.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct WarehouseChildren {
    pub equipment: Vec<i64>,
    pub texts: Vec<(TextKind, String)>,
    pub urls: Vec<(UrlKind, String)>,
}

/// Inputs of the price model, in warehouse terms.
#[derive(Debug, Clone, PartialEq)]
pub struct PriceFeatures {
    pub make: Option<String>,
    pub model: String,
    pub fuel: String,
    pub mileage_km: Option<i64>,
    pub power_kw: Option<i32>,
    pub first_registration_year: i32,
}

/// Attributes -> price estimate. Implementations must be pure.
pub trait PricePredictor: Send + Sync {
    fn predict(&self, features: &PriceFeatures) -> Option<f64>;
}

/// Lake stamps and watermarks are stored as integer microseconds.
pub fn to_micros(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_micros()
}

pub fn from_micros(us: i64) -> DateTime<Utc> {
    DateTime::<Utc>::from_timestamp_micros(us).unwrap_or(DateTime::<Utc>::MIN_UTC)
}
