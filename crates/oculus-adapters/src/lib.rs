//! Listing-source capability + marketplace sources and the Listing Normalizer.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use oculus_core::{EquipmentItem, Marketplace};
use oculus_storage::FetchError;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::Mutex;
use uuid::Uuid;

mod fixture;
mod gebrauchtwagen;
pub mod normalize;
mod willhaben;

pub use fixture::FixtureSource;
pub use gebrauchtwagen::GebrauchtwagenSource;
pub use normalize::normalize;
pub use willhaben::WillhabenSource;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdapterContext {
    pub run_id: Uuid,
    pub fetched_at: DateTime<Utc>,
}

impl AdapterContext {
    pub fn new(fetched_at: DateTime<Utc>) -> Self {
        Self {
            run_id: Uuid::new_v4(),
            fetched_at,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SearchCriteria {
    /// Only listings published or updated within this many hours, where the
    /// marketplace exposes timestamps.
    pub window_hours: u32,
    pub page_size: usize,
    pub max_pages: usize,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ListingSummary {
    pub source_listing_id: String,
    pub payload: Value,
}

/// One raw search response and the summaries taken from it.
#[derive(Debug, Clone)]
pub struct SearchPage {
    pub url: String,
    pub body: Vec<u8>,
    pub summaries: Vec<ListingSummary>,
    /// Entries dropped because they carried no listing id.
    pub skipped: usize,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("unexpected {marketplace} payload: {reason}")]
    Payload {
        marketplace: Marketplace,
        reason: String,
    },
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// The polymorphic marketplace capability. Field mapping lives in the
/// normalizer; sources only move payloads.
#[async_trait]
pub trait ListingSource: Send + Sync {
    fn marketplace(&self) -> Marketplace;

    async fn search(
        &self,
        ctx: &AdapterContext,
        criteria: &SearchCriteria,
    ) -> Result<Vec<SearchPage>, AdapterError>;

    /// Full payload for a listing, `None` if the marketplace no longer has it.
    async fn get_details(
        &self,
        ctx: &AdapterContext,
        source_listing_id: &str,
    ) -> Result<Option<Value>, AdapterError>;

    async fn get_equipment(
        &self,
        ctx: &AdapterContext,
        source_listing_id: &str,
    ) -> Result<Vec<EquipmentItem>, AdapterError>;
}

/// Summary payloads seen during the current search, keyed by listing id. Both
/// marketplaces return complete attribute sets in search results, so detail
/// and equipment lookups are served from here.
#[derive(Debug, Default)]
pub(crate) struct PayloadCache {
    inner: Mutex<HashMap<String, Value>>,
}

impl PayloadCache {
    /// Forget the previous search; called when a new one starts.
    pub(crate) async fn clear(&self) {
        self.inner.lock().await.clear();
    }

    pub(crate) async fn remember(&self, summaries: &[ListingSummary]) {
        let mut inner = self.inner.lock().await;
        for summary in summaries {
            inner.insert(summary.source_listing_id.clone(), summary.payload.clone());
        }
    }

    pub(crate) async fn get(&self, source_listing_id: &str) -> Option<Value> {
        self.inner.lock().await.get(source_listing_id).cloned()
    }
}

pub(crate) fn parse_search_page(
    marketplace: Marketplace,
    page: &Value,
) -> Result<(Vec<ListingSummary>, usize), AdapterError> {
    match marketplace {
        Marketplace::Willhaben => willhaben::parse_search_page(page),
        Marketplace::Gebrauchtwagen => gebrauchtwagen::parse_search_page(page),
    }
}

pub(crate) fn equipment_from_payload(marketplace: Marketplace, payload: &Value) -> Vec<EquipmentItem> {
    match marketplace {
        Marketplace::Willhaben => willhaben::equipment_from_payload(payload),
        Marketplace::Gebrauchtwagen => Vec::new(),
    }
}
