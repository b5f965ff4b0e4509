//! Stack parameter files.
//!
//! Two shapes are accepted:
//! - a JSON object of scalars: `{"SpotMinWeight": 1, "KeyName": "ops"}`
//! - a parameter list: `[{"ParameterKey": "KeyName", "ParameterValue": "ops"}]`

use std::path::Path;

use maestro_deployer::backend::StackParameters;
use serde::Deserialize;
use serde_json::Value;

use crate::error::CliError;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ParameterEntry {
    parameter_key: String,
    parameter_value: Value,
}

/// Read a parameters file.
pub async fn load(path: &Path) -> Result<StackParameters, CliError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(|e| invalid(path, e.to_string()))?;
    parse(&contents).map_err(|reason| invalid(path, reason))
}

/// Read a parameters file if one was given.
pub async fn load_optional(path: Option<&Path>) -> Result<StackParameters, CliError> {
    match path {
        Some(path) => load(path).await,
        None => Ok(StackParameters::new()),
    }
}

fn parse(contents: &str) -> Result<StackParameters, String> {
    let value: Value = serde_json::from_str(contents).map_err(|e| e.to_string())?;

    let pairs: Vec<(String, Value)> = match value {
        Value::Object(map) => map.into_iter().collect(),
        Value::Array(_) => {
            let entries: Vec<ParameterEntry> =
                serde_json::from_value(value).map_err(|e| e.to_string())?;
            entries
                .into_iter()
                .map(|e| (e.parameter_key, e.parameter_value))
                .collect()
        }
        _ => return Err("expected an object or a list".to_string()),
    };

    pairs
        .into_iter()
        .map(|(key, value)| scalar(&key, value).map(|v| (key, v)))
        .collect()
}

fn scalar(key: &str, value: Value) -> Result<String, String> {
    match value {
        Value::String(s) => Ok(s),
        Value::Number(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        _ => Err(format!("{key}: value must be a string, number or boolean")),
    }
}

fn invalid(path: &Path, reason: String) -> CliError {
    CliError::InvalidParameters {
        path: path.to_path_buf(),
        reason,
    }
}
