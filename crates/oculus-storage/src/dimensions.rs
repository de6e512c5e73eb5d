use std::collections::HashMap;
use std::sync::Arc;

use oculus_core::{DimensionFamily, DimensionName, PipelineError, PipelineResult};
use sqlx::SqlitePool;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, warn};

use crate::map_db_err;

type CacheKey = (DimensionFamily, Option<i64>, String);

/// Maps natural dimension names to surrogate keys, creating rows on first
/// sight. Resolution is idempotent and case/whitespace insensitive, and
/// concurrent callers for the same name always get the same key.
///
/// Rows are written in autocommit mode and never deleted, so cached keys
/// stay valid even when a caller's own transaction later rolls back.
#[derive(Debug)]
pub struct DimensionResolver {
    pool: SqlitePool,
    cache: Mutex<HashMap<CacheKey, i64>>,
    family_locks: Mutex<HashMap<DimensionFamily, Arc<Semaphore>>>,
}

impl DimensionResolver {
    pub(crate) fn new(pool: SqlitePool) -> Self {
        Self {
            pool,
            cache: Mutex::new(HashMap::new()),
            family_locks: Mutex::new(HashMap::new()),
        }
    }

    async fn family_lock(&self, family: DimensionFamily) -> Arc<Semaphore> {
        let mut locks = self.family_locks.lock().await;
        locks
            .entry(family)
            .or_insert_with(|| Arc::new(Semaphore::new(1)))
            .clone()
    }

    async fn cached(&self, key: &CacheKey) -> Option<i64> {
        self.cache.lock().await.get(key).copied()
    }

    pub async fn resolve(
        &self,
        family: DimensionFamily,
        natural_name: &str,
        parent: Option<i64>,
    ) -> PipelineResult<i64> {
        let name = DimensionName::parse(natural_name).ok_or_else(|| {
            PipelineError::ConstraintViolation(format!("empty {family} name"))
        })?;
        if parent.is_some() && family.parent().is_none() {
            return Err(PipelineError::ConstraintViolation(format!(
                "{family} is not hierarchical"
            )));
        }

        let cache_key = (family, parent, name.key.clone());
        if let Some(id) = self.cached(&cache_key).await {
            return Ok(id);
        }

        let lock = self.family_lock(family).await;
        let _permit = lock
            .acquire()
            .await
            .map_err(|_| PipelineError::StorageUnavailable("dimension resolver closed".into()))?;
        if let Some(id) = self.cached(&cache_key).await {
            return Ok(id);
        }

        let id = match self.lookup(family, &name, parent).await? {
            Some(id) => id,
            None => self.insert_or_reread(family, &name, parent).await?,
        };
        self.cache.lock().await.insert(cache_key, id);
        Ok(id)
    }

    /// Resolve when a name is present; unknown attributes map to no key.
    pub async fn resolve_optional(
        &self,
        family: DimensionFamily,
        natural_name: Option<&str>,
        parent: Option<i64>,
    ) -> PipelineResult<Option<i64>> {
        match natural_name.filter(|n| !n.trim().is_empty()) {
            Some(name) => self.resolve(family, name, parent).await.map(Some),
            None => Ok(None),
        }
    }

    async fn lookup(
        &self,
        family: DimensionFamily,
        name: &DimensionName,
        parent: Option<i64>,
    ) -> PipelineResult<Option<i64>> {
        sqlx::query_scalar(&format!(
            "SELECT id FROM {} WHERE name_key = ? AND IFNULL(parent_id, 0) = IFNULL(?, 0)",
            family.table()
        ))
        .bind(&name.key)
        .bind(parent)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)
    }

    async fn insert_or_reread(
        &self,
        family: DimensionFamily,
        name: &DimensionName,
        parent: Option<i64>,
    ) -> PipelineResult<i64> {
        let inserted: Option<i64> = sqlx::query_scalar(&format!(
            "INSERT INTO {} (parent_id, name, name_key) VALUES (?, ?, ?) \
             ON CONFLICT DO NOTHING RETURNING id",
            family.table()
        ))
        .bind(parent)
        .bind(&name.display)
        .bind(&name.key)
        .fetch_optional(&self.pool)
        .await
        .map_err(map_db_err)?;

        if let Some(id) = inserted {
            debug!(%family, name = %name.display, id, "dimension row created");
            return Ok(id);
        }

        // Another writer created the row between our lookup and insert.
        let conflict = PipelineError::DimensionConflict {
            family,
            name: name.display.clone(),
        };
        warn!(error = %conflict, "re-reading after concurrent dimension insert");
        self.lookup(family, name, parent).await?.ok_or(conflict)
    }

    /// Stored display name for a key, as first seen.
    pub async fn name_of(&self, family: DimensionFamily, id: i64) -> PipelineResult<Option<String>> {
        sqlx::query_scalar(&format!("SELECT name FROM {} WHERE id = ?", family.table()))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(map_db_err)
    }

    pub async fn count(&self, family: DimensionFamily) -> PipelineResult<i64> {
        sqlx::query_scalar(&format!("SELECT COUNT(*) FROM {}", family.table()))
            .fetch_one(&self.pool)
            .await
            .map_err(map_db_err)
    }
}
