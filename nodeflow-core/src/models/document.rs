//! YAML/JSON contract document parsing

use crate::error::ContractError;
use serde::de::DeserializeOwned;
use std::path::Path;

/// Parse a contract from YAML text
pub fn from_yaml_str<T: DeserializeOwned>(content: &str) -> Result<T, ContractError> {
    serde_yaml::from_str(content).map_err(|e| ContractError::Parse {
        format: "yaml",
        message: e.to_string(),
    })
}

/// Parse a contract from JSON text
pub fn from_json_str<T: DeserializeOwned>(content: &str) -> Result<T, ContractError> {
    serde_json::from_str(content).map_err(|e| ContractError::Parse {
        format: "json",
        message: e.to_string(),
    })
}

/// Load a contract file, choosing the format from its extension.
///
/// `.json` files are parsed as JSON; everything else as YAML (a superset of JSON).
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T, ContractError> {
    let content = std::fs::read_to_string(path).map_err(|source| ContractError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    tracing::debug!(path = %path.display(), json = is_json, "Loading contract document");

    if is_json {
        from_json_str(&content)
    } else {
        from_yaml_str(&content)
    }
}
