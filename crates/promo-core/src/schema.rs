//! Snapshot schema validation for the Promotion Step

use crate::model::DistributionConfig;
use jsonschema::JSONSchema;
use promo_kernel::{StepError, StepResult};
use serde_json::{json, Value};

/// JSON schema every promotable configuration must satisfy
pub fn configuration_schema() -> Value {
    json!({
        "$schema": "http://json-schema.org/draft-07/schema#",
        "title": "DistributionConfig",
        "type": "object",
        "required": ["id"],
        "properties": {
            "id": { "type": "string", "minLength": 1 },
            "deployment_policy_id": { "type": ["string", "null"], "minLength": 1 }
        },
        "additionalProperties": true
    })
}

/// Compiled configuration schema
pub struct SnapshotValidator {
    schema: JSONSchema,
}

impl std::fmt::Debug for SnapshotValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotValidator").finish_non_exhaustive()
    }
}

impl SnapshotValidator {
    /// Compile `configuration_schema()`
    pub fn new() -> StepResult<Self> {
        let schema = configuration_schema();
        let compiled = JSONSchema::compile(&schema)
            .map_err(|e| StepError::Configuration(format!("invalid configuration schema: {e}")))?;
        Ok(Self { schema: compiled })
    }

    /// Check `snapshot` and decode it.
    ///
    /// # Errors
    /// `StepError::SchemaMismatch` listing every violation.
    pub fn validate(&self, snapshot: &Value) -> StepResult<DistributionConfig> {
        if let Err(errors) = self.schema.validate(snapshot) {
            let messages: Vec<String> = errors
                .map(|e| {
                    let path = e.instance_path.to_string();
                    if path.is_empty() {
                        e.to_string()
                    } else {
                        format!("{path}: {e}")
                    }
                })
                .collect();
            return Err(StepError::SchemaMismatch(messages.join("; ")));
        }

        serde_json::from_value(snapshot.clone()).map_err(|e| StepError::SchemaMismatch(e.to_string()))
    }
}
