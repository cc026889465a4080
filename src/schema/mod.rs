//! # Schema Validation
//!
//! JSON Schema (draft-07) validation of candidate documents on the write
//! path. Templates are JSON files under `templates/` in the storage
//! backend; any file that parses as JSON is accepted as a schema. Compiled
//! schemas are memoized per `schema_id` and reloaded atomically on demand.

use std::collections::HashMap;
use std::sync::Arc;

use jsonschema::{Draft, Validator};
use parking_lot::RwLock;
use serde::Serialize;
use thiserror::Error;

use crate::error::DeltaError;
use crate::storage::{StorageBackend, StorageError};

/// Schema subsystem failures.
#[derive(Error, Debug)]
pub enum SchemaError {
    /// No template stored under the requested id.
    #[error("schema not found: {0}")]
    SchemaNotFound(String),

    /// Template bytes are not valid JSON or not a compilable schema.
    #[error("invalid template {0}")]
    InvalidTemplate(String),

    #[error(transparent)]
    Storage(StorageError),
}

pub type SchemaResult<T> = Result<T, SchemaError>;

impl From<SchemaError> for DeltaError {
    fn from(err: SchemaError) -> Self {
        match err {
            SchemaError::SchemaNotFound(id) => DeltaError::NotFound(format!("schema {}", id)),
            SchemaError::InvalidTemplate(id) => {
                DeltaError::InvalidArgument(format!("invalid schema template {}", id))
            }
            SchemaError::Storage(e) => e.into(),
        }
    }
}

/// One rejection produced by [`SchemaValidator::validate`].
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ValidationIssue {
    /// `invalid_json` for unparseable candidates, `schema` otherwise.
    pub error_type: String,
    /// JSON pointer into the candidate document.
    pub path: String,
    pub message: String,
}

/// Outcome of validating one candidate document.
#[derive(Debug, Clone, Serialize)]
pub struct Validation {
    pub valid: bool,
    pub errors: Vec<ValidationIssue>,
}

impl Validation {
    fn ok() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }
}

/// Draft-07 validator with a memoized template cache.
pub struct SchemaValidator {
    storage: Arc<dyn StorageBackend>,
    compiled: RwLock<HashMap<String, Arc<Validator>>>,
}

impl SchemaValidator {
    pub fn new(storage: Arc<dyn StorageBackend>) -> Self {
        Self {
            storage,
            compiled: RwLock::new(HashMap::new()),
        }
    }

    fn compile(schema_id: &str, bytes: &[u8]) -> SchemaResult<Arc<Validator>> {
        let schema: serde_json::Value = serde_json::from_slice(bytes)
            .map_err(|_| SchemaError::InvalidTemplate(schema_id.to_string()))?;
        let validator = jsonschema::options()
            .with_draft(Draft::Draft7)
            .build(&schema)
            .map_err(|_| SchemaError::InvalidTemplate(schema_id.to_string()))?;
        Ok(Arc::new(validator))
    }

    /// Fetch, compile, and memoize a template.
    pub async fn load_template(&self, schema_id: &str) -> SchemaResult<()> {
        let bytes = match self.storage.read_template(schema_id).await {
            Ok(bytes) => bytes,
            Err(StorageError::NotFound(_)) => {
                return Err(SchemaError::SchemaNotFound(schema_id.to_string()))
            }
            Err(e) => return Err(SchemaError::Storage(e)),
        };
        let validator = Self::compile(schema_id, &bytes)?;
        self.compiled
            .write()
            .insert(schema_id.to_string(), validator);
        Ok(())
    }

    /// Re-fetch a template and swap the memoized compiled schema.
    pub async fn reload_template(&self, schema_id: &str) -> SchemaResult<()> {
        self.load_template(schema_id).await
    }

    /// Persist a template and (re)compile it.
    ///
    /// The bytes must parse as JSON; any JSON document is accepted as a
    /// schema.
    pub async fn save_template(&self, schema_id: &str, bytes: &[u8]) -> SchemaResult<()> {
        let validator = Self::compile(schema_id, bytes)?;
        self.storage
            .write_template(schema_id, bytes)
            .await
            .map_err(SchemaError::Storage)?;
        self.compiled
            .write()
            .insert(schema_id.to_string(), validator);
        Ok(())
    }

    /// Template ids currently stored, sorted.
    pub async fn list_available_templates(&self) -> SchemaResult<Vec<String>> {
        self.storage
            .list_templates()
            .await
            .map_err(SchemaError::Storage)
    }

    async fn validator_for(&self, schema_id: &str) -> SchemaResult<Arc<Validator>> {
        if let Some(v) = self.compiled.read().get(schema_id) {
            return Ok(v.clone());
        }
        // Auto-load on first use.
        self.load_template(schema_id).await?;
        self.compiled
            .read()
            .get(schema_id)
            .cloned()
            .ok_or_else(|| SchemaError::SchemaNotFound(schema_id.to_string()))
    }

    /// Validate candidate bytes against a schema.
    ///
    /// Malformed candidate JSON is a *rejection*, not an error: the result
    /// carries a single `invalid_json` issue. A missing template is an
    /// outer [`SchemaError::SchemaNotFound`].
    pub async fn validate(&self, schema_id: &str, candidate: &[u8]) -> SchemaResult<Validation> {
        let validator = self.validator_for(schema_id).await?;

        let document: serde_json::Value = match serde_json::from_slice(candidate) {
            Ok(doc) => doc,
            Err(e) => {
                return Ok(Validation {
                    valid: false,
                    errors: vec![ValidationIssue {
                        error_type: "invalid_json".to_string(),
                        path: String::new(),
                        message: e.to_string(),
                    }],
                })
            }
        };

        let errors: Vec<ValidationIssue> = validator
            .iter_errors(&document)
            .map(|e| ValidationIssue {
                error_type: "schema".to_string(),
                path: e.instance_path.to_string(),
                message: e.to_string(),
            })
            .collect();

        if errors.is_empty() {
            Ok(Validation::ok())
        } else {
            Ok(Validation {
                valid: false,
                errors,
            })
        }
    }

    /// Validate and collapse rejections into a [`DeltaError::ValidationFailed`].
    pub async fn validate_strict(&self, schema_id: &str, candidate: &[u8]) -> Result<(), DeltaError> {
        let validation = self.validate(schema_id, candidate).await.map_err(DeltaError::from)?;
        if validation.valid {
            return Ok(());
        }
        let detail = validation
            .errors
            .iter()
            .map(|e| {
                if e.path.is_empty() {
                    format!("{}: {}", e.error_type, e.message)
                } else {
                    format!("{} at {}: {}", e.error_type, e.path, e.message)
                }
            })
            .collect::<Vec<_>>()
            .join("; ");
        Err(DeltaError::ValidationFailed(detail))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::FilesystemBackend;
    use tempfile::TempDir;

    const CHAT_SCHEMA: &[u8] = br#"{
        "type": "object",
        "required": ["chat"],
        "properties": {
            "chat": {
                "type": "array",
                "items": {
                    "type": "object",
                    "required": ["type", "text"],
                    "properties": {
                        "type": {"enum": ["user", "assistant"]},
                        "text": {"type": "string", "minLength": 1}
                    }
                }
            }
        }
    }"#;

    async fn validator_with_chat_schema(dir: &TempDir) -> SchemaValidator {
        let storage = Arc::new(FilesystemBackend::open(dir.path()).unwrap());
        storage.write_template("chat.v1", CHAT_SCHEMA).await.unwrap();
        SchemaValidator::new(storage)
    }

    #[tokio::test]
    async fn test_valid_document_passes() {
        let dir = TempDir::new().unwrap();
        let validator = validator_with_chat_schema(&dir).await;

        let doc = br#"{"chat":[{"type":"user","text":"hi"}]}"#;
        let result = validator.validate("chat.v1", doc).await.unwrap();
        assert!(result.valid);
        assert!(result.errors.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_document_rejected_with_paths() {
        let dir = TempDir::new().unwrap();
        let validator = validator_with_chat_schema(&dir).await;

        let doc = br#"{"chat":[{"type":"bogus","text":""}]}"#;
        let result = validator.validate("chat.v1", doc).await.unwrap();
        assert!(!result.valid);
        assert!(!result.errors.is_empty());
        assert!(result.errors.iter().all(|e| e.error_type == "schema"));
    }

    #[tokio::test]
    async fn test_malformed_json_is_single_invalid_json_issue() {
        let dir = TempDir::new().unwrap();
        let validator = validator_with_chat_schema(&dir).await;

        let result = validator.validate("chat.v1", b"{not json").await.unwrap();
        assert!(!result.valid);
        assert_eq!(result.errors.len(), 1);
        assert_eq!(result.errors[0].error_type, "invalid_json");
    }

    #[tokio::test]
    async fn test_missing_template_is_outer_error() {
        let dir = TempDir::new().unwrap();
        let storage = Arc::new(FilesystemBackend::open(dir.path()).unwrap());
        let validator = SchemaValidator::new(storage);

        assert!(matches!(
            validator.validate("nope.v1", b"{}").await,
            Err(SchemaError::SchemaNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_auto_load_on_first_validate() {
        let dir = TempDir::new().unwrap();
        let validator = validator_with_chat_schema(&dir).await;

        // No explicit load_template call before validate.
        let result = validator
            .validate("chat.v1", br#"{"chat":[]}"#)
            .await
            .unwrap();
        assert!(result.valid);
    }

    #[tokio::test]
    async fn test_reload_replaces_compiled_schema() {
        let dir = TempDir::new().unwrap();
        let validator = validator_with_chat_schema(&dir).await;
        let storage = Arc::new(FilesystemBackend::open(dir.path()).unwrap());

        assert!(!validator.validate("chat.v1", b"{}").await.unwrap().valid);

        // Replace the template with one accepting anything, then reload.
        storage.write_template("chat.v1", b"{}").await.unwrap();
        validator.reload_template("chat.v1").await.unwrap();
        assert!(validator.validate("chat.v1", b"{}").await.unwrap().valid);
    }

    #[tokio::test]
    async fn test_save_template_rejects_non_json() {
        let dir = TempDir::new().unwrap();
        let validator = validator_with_chat_schema(&dir).await;
        assert!(matches!(
            validator.save_template("bad", b"not json").await,
            Err(SchemaError::InvalidTemplate(_))
        ));
    }

    #[tokio::test]
    async fn test_validate_strict_maps_to_taxonomy() {
        let dir = TempDir::new().unwrap();
        let validator = validator_with_chat_schema(&dir).await;

        let err = validator
            .validate_strict("chat.v1", br#"{"chat":[{"type":"bogus","text":""}]}"#)
            .await
            .unwrap_err();
        assert!(matches!(err, DeltaError::ValidationFailed(_)));
    }
}
