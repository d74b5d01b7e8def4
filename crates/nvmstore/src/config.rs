//! Store configuration

use nvmstore_core::{validate_name, PartitionError};

/// Store configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreConfig {
    /// Namespace every entry of this store lives in
    pub namespace: String,
    /// Maximum key length in bytes; keys are checked before touching the partition
    pub max_key_len: usize,
}

impl StoreConfig {
    pub fn with_namespace(namespace: impl Into<String>) -> Self {
        Self { namespace: namespace.into(), ..Self::default() }
    }

    /// Validate all configuration parameters against a partition that
    /// accepts names of at most `name_limit` bytes.
    pub fn validate(&self, name_limit: usize) -> Result<(), String> {
        validate_name(&self.namespace, name_limit).map_err(|e| match e {
            PartitionError::InvalidName { reason, .. } => format!("namespace: {}", reason),
            other => other.to_string(),
        })?;
        if self.max_key_len == 0 {
            return Err("max_key_len must be > 0".into());
        }
        if self.max_key_len > name_limit {
            return Err(format!(
                "max_key_len {} exceeds the partition name limit of {}",
                self.max_key_len, name_limit
            ));
        }
        Ok(())
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            namespace: "storage".to_string(),
            max_key_len: 15,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_valid() {
        let c = StoreConfig::default();
        assert!(c.validate(15).is_ok());
        assert_eq!(c.namespace, "storage");
    }

    #[test]
    fn test_rejects_empty_namespace() {
        assert!(StoreConfig::with_namespace("").validate(15).is_err());
    }

    #[test]
    fn test_rejects_namespace_over_name_limit() {
        let err = StoreConfig::with_namespace("a_namespace_of_20b").validate(15).unwrap_err();
        assert!(err.starts_with("namespace:"));
    }

    #[test]
    fn test_key_bound_must_fit_partition() {
        let c = StoreConfig { max_key_len: 64, ..StoreConfig::default() };
        assert!(c.validate(15).unwrap_err().contains("max_key_len 64"));
        assert!(c.validate(64).is_ok());
    }
}
