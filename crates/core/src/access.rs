//! Access request model.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Caller-visible status of an access request.
///
/// The status is derived, never stored: a request with remaining unavailable
/// archives is `Pending`; once its expiry deadline has passed it is
/// `Expired`; otherwise it is `Ready`. Unknown (or purged) ids map to
/// `NotFound`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AccessRequestStatus {
    Pending,
    Ready,
    Expired,
    NotFound,
}

impl AccessRequestStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessRequestStatus::Pending => "PENDING",
            AccessRequestStatus::Ready => "READY",
            AccessRequestStatus::Expired => "EXPIRED",
            AccessRequestStatus::NotFound => "NOT_FOUND",
        }
    }
}

impl fmt::Display for AccessRequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Generate a new access request identifier.
pub fn new_access_request_id() -> String {
    Uuid::new_v4().to_string()
}

/// Validate an access request identifier format.
pub fn check_access_request_id(id: &str) -> crate::Result<()> {
    if id.is_empty() {
        return Err(crate::Error::InvalidAccessRequestId("empty id".to_string()));
    }
    Uuid::parse_str(id)
        .map(|_| ())
        .map_err(|_| crate::Error::InvalidAccessRequestId(id.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_are_valid() {
        let id = new_access_request_id();
        check_access_request_id(&id).unwrap();
    }

    #[test]
    fn invalid_ids_are_rejected() {
        assert!(check_access_request_id("").is_err());
        assert!(check_access_request_id("not-a-uuid").is_err());
    }
}
