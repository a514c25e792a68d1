//! Error types for cube generation.

use thiserror::Error;

use crate::bbox::BoundingBox;

/// Result type alias using CubeError.
pub type CubeResult<T> = Result<T, CubeError>;

/// Primary error type for cube generation.
#[derive(Debug, Error)]
pub enum CubeError {
    /// Invalid or inconsistent configuration. Aborts the run immediately.
    #[error("configuration error: {0}")]
    Config(String),

    /// A source dataset could not be opened or read.
    #[error("failed to access '{data_id}' in store '{store}': {message}")]
    SourceAccess {
        store: String,
        data_id: String,
        message: String,
    },

    /// Preload for a dataset failed or exceeded its retry budget.
    #[error("preload of '{data_id}' in store '{store}' failed: {message}")]
    Preload {
        store: String,
        data_id: String,
        message: String,
    },

    /// Reprojection, resampling, or point extraction failed.
    #[error("harmonization failed: {0}")]
    Harmonize(String),

    /// The source does not overlap the target grid.
    #[error("source extent {source_extent:?} does not intersect target extent {target:?}")]
    EmptyIntersection {
        // Not named `source`: thiserror reserves that for the error cause.
        source_extent: BoundingBox,
        target: BoundingBox,
    },

    /// Variable datasets could not be merged into one cube.
    #[error("fusion failed: {0}")]
    Fusion(String),

    /// Writing the result to the output store failed.
    #[error("failed to write '{data_id}': {message}")]
    Write { data_id: String, message: String },
}

impl CubeError {
    /// Short category label used in run reports and logs.
    pub fn category(&self) -> &'static str {
        match self {
            CubeError::Config(_) => "config",
            CubeError::SourceAccess { .. } => "source",
            CubeError::Preload { .. } => "preload",
            CubeError::Harmonize(_) => "harmonize",
            CubeError::EmptyIntersection { .. } => "harmonize",
            CubeError::Fusion(_) => "fusion",
            CubeError::Write { .. } => "write",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CubeError::SourceAccess {
            store: "cds".to_string(),
            data_id: "soil.zarr".to_string(),
            message: "timeout".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "failed to access 'soil.zarr' in store 'cds': timeout"
        );
        assert_eq!(err.category(), "source");
    }

    #[test]
    fn test_empty_intersection_category_and_display() {
        let err = CubeError::EmptyIntersection {
            source_extent: BoundingBox::new(0.0, 0.0, 1.0, 1.0),
            target: BoundingBox::new(5.0, 5.0, 6.0, 6.0),
        };
        assert_eq!(err.category(), "harmonize");
        let text = err.to_string();
        assert!(text.starts_with("source extent"), "{text}");
        assert!(text.contains("does not intersect"), "{text}");
    }
}
