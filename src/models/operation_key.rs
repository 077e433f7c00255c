use crate::error::{AppError, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// Maximum accepted length of each key component.
pub const MAX_COMPONENT_LEN: usize = 255;

/// Identity of one logical operation attempt: (service, operation, idempotency key).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperationKey {
    pub service: String,
    pub operation: String,
    pub idempotency_key: String,
}

impl OperationKey {
    pub fn new(
        service: impl Into<String>,
        operation: impl Into<String>,
        idempotency_key: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            operation: operation.into(),
            idempotency_key: idempotency_key.into(),
        }
    }

    /// Rejects empty or oversized components.
    pub fn validate(&self) -> Result<()> {
        for (field, value) in [
            ("service", &self.service),
            ("operation", &self.operation),
            ("idempotencyKey", &self.idempotency_key),
        ] {
            if value.trim().is_empty() {
                return Err(AppError::Validation(format!("{} is required", field)));
            }
            if value.len() > MAX_COMPONENT_LEN {
                return Err(AppError::Validation(format!(
                    "{} must be at most {} characters",
                    field, MAX_COMPONENT_LEN
                )));
            }
        }
        Ok(())
    }

    /// Hex SHA-256 of the tuple, used where a single flat key is needed (e.g. Redis).
    /// Components are separated by a unit separator so ("a-b", "c") and ("a", "b-c") differ.
    pub fn digest(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.service.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.operation.as_bytes());
        hasher.update([0x1f]);
        hasher.update(self.idempotency_key.as_bytes());
        hex::encode(hasher.finalize())
    }
}

impl fmt::Display for OperationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.service, self.operation, self.idempotency_key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_rejects_blank_components() {
        assert!(OperationKey::new("billing", "charge", "order-42").validate().is_ok());
        assert!(OperationKey::new("", "charge", "order-42").validate().is_err());
        assert!(OperationKey::new("billing", "  ", "order-42").validate().is_err());
        assert!(OperationKey::new("billing", "charge", "").validate().is_err());
    }

    #[test]
    fn test_validate_rejects_oversized_key() {
        let key = OperationKey::new("billing", "charge", "k".repeat(MAX_COMPONENT_LEN + 1));
        assert!(matches!(key.validate(), Err(AppError::Validation(_))));
    }

    #[test]
    fn test_digest_separates_components() {
        let a = OperationKey::new("a-b", "c", "d");
        let b = OperationKey::new("a", "b-c", "d");
        assert_ne!(a.digest(), b.digest());
        assert_eq!(a.digest(), OperationKey::new("a-b", "c", "d").digest());
        assert_eq!(a.digest().len(), 64);
    }

    #[test]
    fn test_camel_case_wire_format() {
        let key = OperationKey::new("billing", "charge", "order-42");
        let json = serde_json::to_value(&key).unwrap();
        assert_eq!(json["idempotencyKey"], "order-42");
    }
}
