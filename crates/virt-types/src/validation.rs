//! Input validation utilities

use regex::Regex;

use crate::error::{CommonError, Result};

/// Instance name rules: what the four backends all accept as a guest name
pub struct InstanceNameValidator {
    min_length: usize,
    max_length: usize,
    pattern: Regex,
}

impl Default for InstanceNameValidator {
    fn default() -> Self {
        Self {
            min_length: 2,
            max_length: 48,
            // Leading alphanumeric keeps LXD/Incus and Docker naming happy
            pattern: Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]*$").unwrap(),
        }
    }
}

impl InstanceNameValidator {
    pub fn validate(&self, name: &str) -> Result<()> {
        if name.len() < self.min_length {
            return Err(CommonError::Validation(format!(
                "Instance name must be at least {} characters long",
                self.min_length
            )));
        }

        if name.len() > self.max_length {
            return Err(CommonError::Validation(format!(
                "Instance name must be at most {} characters long",
                self.max_length
            )));
        }

        if !self.pattern.is_match(name) {
            return Err(CommonError::Validation(
                "Instance name must start with a letter or digit and contain only letters, digits, underscores, and hyphens".to_string(),
            ));
        }

        Ok(())
    }
}

/// Configuration keys are kebab-case on the wire, in storage, and in code;
/// any other casing is rejected at the edge.
pub fn validate_config_key(key: &str) -> Result<()> {
    let pattern = Regex::new(r"^[a-z0-9]+(-[a-z0-9]+)*$").unwrap();
    if pattern.is_match(key) {
        Ok(())
    } else {
        Err(CommonError::Validation(format!(
            "configuration key must be kebab-case: {}",
            key
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_instance_names() {
        let v = InstanceNameValidator::default();
        assert!(v.validate("demo").is_ok());
        assert!(v.validate("web-01").is_ok());
        assert!(v.validate("demo_deleted_1735689600").is_ok());
    }

    #[test]
    fn invalid_instance_names() {
        let v = InstanceNameValidator::default();
        assert!(v.validate("a").is_err());
        assert!(v.validate("-leading-dash").is_err());
        assert!(v.validate("has space").is_err());
        assert!(v.validate(&"x".repeat(64)).is_err());
    }

    #[test]
    fn config_keys_are_kebab_case_only() {
        assert!(validate_config_key("expiry-check-interval").is_ok());
        assert!(validate_config_key("expiryCheckInterval").is_err());
        assert!(validate_config_key("expiry_check_interval").is_err());
        assert!(validate_config_key("-bad").is_err());
    }
}
