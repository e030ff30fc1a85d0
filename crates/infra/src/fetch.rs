//! Feature fetching seam.
//!
//! Real geospatial adapters live outside this workspace; they plug in by
//! implementing [`FeatureFetcher`] (or passing a closure). Callers fall back
//! to [`SiteFeatures::synthetic`] when a fetch fails.

use thiserror::Error;

use geoscan_core::{Position, SiteFeatures};

#[derive(Debug, Error, Clone, PartialEq)]
pub enum FetchError {
    #[error("feature source unavailable: {0}")]
    Unavailable(String),

    #[error("feature fetch timed out at {0}")]
    Timeout(Position),

    #[error("invalid response from feature source: {0}")]
    InvalidResponse(String),
}

pub trait FeatureFetcher: Send + Sync {
    fn fetch(&self, position: Position) -> Result<SiteFeatures, FetchError>;
}

impl<F> FeatureFetcher for F
where
    F: Fn(Position) -> Result<SiteFeatures, FetchError> + Send + Sync,
{
    fn fetch(&self, position: Position) -> Result<SiteFeatures, FetchError> {
        self(position)
    }
}

/// A fetcher with no data source; every point takes the synthetic path.
#[derive(Debug, Clone, Copy, Default)]
pub struct OfflineFetcher;

impl FeatureFetcher for OfflineFetcher {
    fn fetch(&self, _position: Position) -> Result<SiteFeatures, FetchError> {
        Err(FetchError::Unavailable("no feature source configured".to_string()))
    }
}

/// Fetch, or fall back to deterministic synthetic features.
pub fn fetch_or_synthesize(fetcher: &dyn FeatureFetcher, position: Position) -> (SiteFeatures, Option<FetchError>) {
    match fetcher.fetch(position) {
        Ok(features) => (features, None),
        Err(e) => (SiteFeatures::synthetic(position), Some(e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offline_fetch_falls_back_to_synthetic() {
        let p = Position::new(34.05, -118.25);
        let (features, err) = fetch_or_synthesize(&OfflineFetcher, p);
        assert!(features.is_synthetic());
        assert!(matches!(err, Some(FetchError::Unavailable(_))));
        assert_eq!(features, SiteFeatures::synthetic(p));
    }

    #[test]
    fn closures_are_fetchers() {
        let fetcher = |p: Position| Ok::<_, FetchError>(SiteFeatures::synthetic(p));
        let (_, err) = fetch_or_synthesize(&fetcher, Position::new(0.0, 0.0));
        assert!(err.is_none());
    }
}
