//! Contract validation results

use serde::{Deserialize, Serialize};

/// Validation error type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationError {
    pub field: String,
    pub message: String,
}

/// Validation result
#[derive(Debug, Default)]
pub struct ValidationResult {
    pub errors: Vec<ValidationError>,
    pub warnings: Vec<String>,
}

impl ValidationResult {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    pub fn add_warning(&mut self, warning: impl Into<String>) {
        self.warnings.push(warning.into());
    }

    /// Log collected warnings and convert into a contract error when invalid
    pub fn into_result(self, contract: &str) -> Result<(), crate::error::ContractError> {
        for warning in &self.warnings {
            tracing::warn!(contract = contract, "{}", warning);
        }

        if self.is_valid() {
            Ok(())
        } else {
            Err(crate::error::ContractError::Malformed {
                contract: contract.to_string(),
                errors: self.errors,
            })
        }
    }
}
