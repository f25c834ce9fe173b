use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

/// Stable error taxonomy shared by every module and both wire layers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorKind {
    /// oid / tenant / peer / key not present
    NotFound,
    /// tenant mismatch, closed parcel, unauthorized administration use
    Forbidden,
    /// schema / type / size / payload rejection
    Validation,
    /// peer timeout or channel reset
    Unreachable,
    /// cryptographic verification failure
    SignatureRejected,
    /// chain divergence caught at persist time
    ConflictingBlock,
    /// storage session abort, reconnect required
    DbTransient,
    /// invariant breach
    Internal,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NotFound => "NotFound",
            Self::Forbidden => "Forbidden",
            Self::Validation => "Validation",
            Self::Unreachable => "Unreachable",
            Self::SignatureRejected => "SignatureRejected",
            Self::ConflictingBlock => "ConflictingBlock",
            Self::DbTransient => "DbTransient",
            Self::Internal => "Internal",
        };
        write!(f, "{}", s)
    }
}

/// The one error type crossing module boundaries. Carries enough origin
/// information for the admin APIs to report where a failure happened.
#[derive(Debug, Clone, Error, Serialize, Deserialize)]
#[error("{kind} in {component}::{function} at {position}: {detail}")]
pub struct ModuleError {
    pub kind: ErrorKind,
    pub component: String,
    pub function: String,
    pub position: String,
    pub detail: String,
}

impl ModuleError {
    pub fn new(
        kind: ErrorKind,
        component: &str,
        function: &str,
        position: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            kind,
            component: component.to_string(),
            function: function.to_string(),
            position: position.to_string(),
            detail: detail.into(),
        }
    }

    pub fn not_found(component: &str, function: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, component, function, "", detail)
    }

    pub fn forbidden(component: &str, function: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Forbidden, component, function, "", detail)
    }

    pub fn validation(
        component: &str,
        function: &str,
        position: &str,
        detail: impl Into<String>,
    ) -> Self {
        Self::new(ErrorKind::Validation, component, function, position, detail)
    }

    pub fn unreachable(component: &str, function: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Unreachable, component, function, "", detail)
    }

    pub fn internal(component: &str, function: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::Internal, component, function, "", detail)
    }

    pub fn db(component: &str, function: &str, detail: impl Into<String>) -> Self {
        Self::new(ErrorKind::DbTransient, component, function, "", detail)
    }

    /// Attach or replace the position marker, keeping everything else.
    pub fn at(mut self, position: &str) -> Self {
        self.position = position.to_string();
        self
    }
}

pub type Result<T> = std::result::Result<T, ModuleError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display_carries_origin() {
        let e = ModuleError::validation("ledger", "post_by_json", "CheckKeys", "type is missing");
        let s = e.to_string();
        assert!(s.contains("Validation"));
        assert!(s.contains("post_by_json"));
        assert!(s.contains("CheckKeys"));
    }

    #[test]
    fn test_serde_roundtrip() {
        let e = ModuleError::unreachable("internode", "call", "peer node2 timed out");
        let json = serde_json::to_string(&e).unwrap();
        let back: ModuleError = serde_json::from_str(&json).unwrap();
        assert_eq!(back.kind, ErrorKind::Unreachable);
        assert_eq!(back.function, "call");
    }
}
