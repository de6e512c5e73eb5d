//! Failure taxonomy shared by every pipeline stage.

use thiserror::Error;

use crate::{DimensionFamily, Marketplace};

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Identity fields are absent or the payload has the wrong shape.
    #[error("malformed {marketplace} payload: {reason}")]
    MalformedPayload {
        marketplace: Marketplace,
        reason: String,
    },
    /// A load-bearing attribute (model, fuel, model year) is unknown.
    #[error("incomplete {marketplace} listing {listing_id}: missing {}", .missing.join(", "))]
    IncompleteListing {
        marketplace: Marketplace,
        listing_id: String,
        missing: Vec<&'static str>,
    },
    #[error("storage unavailable: {0}")]
    StorageUnavailable(String),
    #[error("constraint violation: {0}")]
    ConstraintViolation(String),
    /// Lost a concurrent insert race for a dimension row. The resolver
    /// recovers from this by re-reading; it only escapes if the re-read
    /// also comes back empty.
    #[error("dimension conflict on {family} '{name}'")]
    DimensionConflict {
        family: DimensionFamily,
        name: String,
    },
    #[error("listing source unavailable: {0}")]
    SourceUnavailable(String),
}

impl PipelineError {
    /// Transient failures the caller should retry (whole batch, with backoff).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            PipelineError::StorageUnavailable(_) | PipelineError::SourceUnavailable(_)
        )
    }

    /// Failures scoped to a single record; the record is skipped, the batch goes on.
    pub fn is_row_level(&self) -> bool {
        matches!(
            self,
            PipelineError::MalformedPayload { .. }
                | PipelineError::IncompleteListing { .. }
                | PipelineError::ConstraintViolation(_)
                | PipelineError::DimensionConflict { .. }
        )
    }
}

pub type PipelineResult<T> = std::result::Result<T, PipelineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_listing_lists_missing_fields() {
        let err = PipelineError::IncompleteListing {
            marketplace: Marketplace::Willhaben,
            listing_id: "123".into(),
            missing: vec!["model", "year_model"],
        };
        assert_eq!(
            err.to_string(),
            "incomplete willhaben listing 123: missing model, year_model"
        );
        assert!(err.is_row_level());
        assert!(!err.is_retryable());
    }

    #[test]
    fn storage_failures_are_retryable() {
        assert!(PipelineError::StorageUnavailable("locked".into()).is_retryable());
        assert!(!PipelineError::ConstraintViolation("unique".into()).is_retryable());
    }
}
