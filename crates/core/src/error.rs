//! Domain error model.

use thiserror::Error;

pub type DomainResult<T> = Result<T, DomainError>;

/// Rejected input to a domain constructor. Storage and I/O failures live in
/// the infra crate.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DomainError {
    /// Coordinates, areas or target settings out of range.
    #[error("validation failed: {0}")]
    Validation(String),

    /// A target or job id that does not parse.
    #[error("invalid identifier: {0}")]
    InvalidId(String),
}

impl DomainError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn invalid_id(msg: impl Into<String>) -> Self {
        Self::InvalidId(msg.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_carry_the_detail() {
        assert_eq!(
            DomainError::validation("radius_km must be a positive number").to_string(),
            "validation failed: radius_km must be a positive number"
        );
        assert_eq!(DomainError::invalid_id("TargetId: bad").to_string(), "invalid identifier: TargetId: bad");
    }
}
