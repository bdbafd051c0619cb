//! Command request/response types shared by the API server and the dispatcher.

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use super::operation::{CommandKind, Operation, OperationStatus};

const MAX_TENANT_ID_LEN: usize = 64;

/// Where a command runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    /// In-process, no network.
    #[default]
    Local,
    /// Against a remote execution server.
    Remote,
}

impl fmt::Display for ExecutionMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExecutionMode::Local => "local",
            ExecutionMode::Remote => "remote",
        })
    }
}

/// Body of `POST /api/v1/<kind>`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandRequest {
    /// Opaque identifier of the cloud account to operate on
    #[serde(default)]
    pub tenant_id: String,

    /// Handler-specific parameters. Must be a JSON object when present.
    #[serde(default)]
    pub params: Value,
}

impl CommandRequest {
    pub fn new(tenant_id: impl Into<String>, params: Value) -> Self {
        Self {
            tenant_id: tenant_id.into(),
            params,
        }
    }

    /// Validate the request and normalise absent params to `{}`.
    ///
    /// # Errors
    ///
    /// Returns every failing field at once.
    pub fn validate(mut self) -> Result<Self, ValidationErrors> {
        let mut errors = ValidationErrors::default();

        if let Err(message) = validate_tenant_id(&self.tenant_id) {
            errors.push(FieldError::new("tenantId", message));
        }
        if self.params.is_null() {
            self.params = Value::Object(Map::new());
        } else if !self.params.is_object() {
            errors.push(FieldError::new("params", "must be a JSON object"));
        }

        errors.into_result().map(|()| self)
    }
}

fn validate_tenant_id(tenant_id: &str) -> Result<(), String> {
    if tenant_id.is_empty() {
        return Err("is required".to_string());
    }
    if tenant_id.len() > MAX_TENANT_ID_LEN {
        return Err(format!("must be at most {MAX_TENANT_ID_LEN} characters"));
    }
    if !tenant_id.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        return Err("must start with a letter or digit".to_string());
    }
    if !tenant_id
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
    {
        return Err("may only contain letters, digits, '.', '_' and '-'".to_string());
    }
    Ok(())
}

/// `202 Accepted` body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AcceptedResponse {
    pub operation_id: Uuid,
}

/// Terminal outcome of a command, identical in shape for local and remote runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    pub operation_id: Uuid,
    pub kind: CommandKind,
    pub status: OperationStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CommandResult {
    pub fn is_success(&self) -> bool {
        self.status == OperationStatus::Succeeded
    }
}

impl From<&Operation> for CommandResult {
    fn from(op: &Operation) -> Self {
        Self {
            operation_id: op.id,
            kind: op.kind,
            status: op.status,
            result: op.result.clone(),
            error: op.error.clone(),
        }
    }
}

/// One failing request field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldError {
    pub field: String,
    pub message: String,
}

impl FieldError {
    pub fn new(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            message: message.into(),
        }
    }
}

/// Collected validation failures, rendered as `details` in 400 responses.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ValidationErrors(Vec<FieldError>);

impl ValidationErrors {
    pub fn single(field: impl Into<String>, message: impl Into<String>) -> Self {
        Self(vec![FieldError::new(field, message)])
    }

    pub fn push(&mut self, error: FieldError) {
        self.0.push(error);
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn fields(&self) -> &[FieldError] {
        &self.0
    }

    pub fn into_result(self) -> Result<(), Self> {
        if self.is_empty() { Ok(()) } else { Err(self) }
    }
}

impl From<Vec<FieldError>> for ValidationErrors {
    fn from(errors: Vec<FieldError>) -> Self {
        Self(errors)
    }
}

impl fmt::Display for ValidationErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, error) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("; ")?;
            }
            write!(f, "{} {}", error.field, error.message)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn valid_request_normalises_params() {
        let request = CommandRequest::new("acme-prod.eu_1", Value::Null)
            .validate()
            .unwrap();
        assert_eq!(request.params, json!({}));
    }

    #[test]
    fn tenant_id_rules() {
        let too_long = "a".repeat(65);
        for bad in ["", "-leading-dash", "has space", "ünïcode", too_long.as_str()] {
            let err = CommandRequest::new(bad, json!({})).validate().unwrap_err();
            assert_eq!(err.fields()[0].field, "tenantId", "accepted {bad:?}");
        }
        assert!(CommandRequest::new("a".repeat(64), json!({})).validate().is_ok());
    }

    #[test]
    fn reports_every_failing_field() {
        let err = CommandRequest::new("", json!([1, 2]))
            .validate()
            .unwrap_err();
        let fields: Vec<_> = err.fields().iter().map(|e| e.field.as_str()).collect();
        assert_eq!(fields, ["tenantId", "params"]);
        assert_eq!(err.to_string(), "tenantId is required; params must be a JSON object");
    }

    #[test]
    fn missing_fields_deserialize_to_defaults() {
        let request: CommandRequest = serde_json::from_str("{}").unwrap();
        assert!(request.tenant_id.is_empty());
        assert!(request.validate().is_err());
    }
}
