//! Pipeline configuration
//!
//! Every field has a default, so a TOML file only needs to name what differs:
//!
//! ```toml
//! pipeline_name = "shop"
//!
//! [execution_context]
//! account = "123456789012"
//! region = "us-east-1"
//!
//! [retry]
//! max_attempts = 3
//!
//! [approval]
//! approvers = ["alice", "bob"]
//! ```

use crate::exports::ExportNames;
use promo_kernel::{BackoffConfig, ExecutionContext};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Default comment shown at the approval gate
pub const DEFAULT_APPROVAL_COMMENT: &str = "Validate and approve staging distribution changes. \
Promote step will promote staging configuration changes to primary distribution.";

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// File could not be read
    #[error("failed to read {path}: {source}")]
    Io {
        /// File that failed
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// File is not valid TOML for this schema
    #[error("failed to parse pipeline config: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values are out of range
    #[error("invalid pipeline config: {0}")]
    Invalid(String),
}

/// Approval gate settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApprovalConfig {
    /// Shown to the operator
    pub comment: String,

    /// Cancel the gate after this many seconds; `None` waits indefinitely
    pub timeout_secs: Option<u64>,

    /// Actors allowed to decide; empty allows anyone
    pub approvers: Vec<String>,
}

impl Default for ApprovalConfig {
    fn default() -> Self {
        Self {
            comment: DEFAULT_APPROVAL_COMMENT.to_string(),
            timeout_secs: None,
            approvers: Vec::new(),
        }
    }
}

impl ApprovalConfig {
    #[inline]
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn is_authorized(&self, actor: &str) -> bool {
        self.approvers.is_empty() || self.approvers.iter().any(|a| a == actor)
    }
}

/// Pipeline configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Prefix for export names
    pub pipeline_name: String,

    /// Name of the state-machine service running update and promotion
    pub state_machine_name: String,

    /// Build the update/approve/promote waves; `false` only verifies the primary
    pub continuous_deployment: bool,

    /// Account and region the steps run against
    pub execution_context: Option<ExecutionContext>,

    /// Backoff for transient infrastructure errors
    pub retry: BackoffConfig,

    /// Approval gate settings
    pub approval: ApprovalConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            pipeline_name: "promotion-pipeline".to_string(),
            state_machine_name: "promotion-pipeline-state-machine".to_string(),
            continuous_deployment: true,
            execution_context: None,
            retry: BackoffConfig::default(),
            approval: ApprovalConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Default configuration for `pipeline_name`
    pub fn new(pipeline_name: impl Into<String>) -> Self {
        let pipeline_name = pipeline_name.into();
        Self {
            state_machine_name: format!("{pipeline_name}-state-machine"),
            pipeline_name,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_execution_context(mut self, context: ExecutionContext) -> Self {
        self.execution_context = Some(context);
        self
    }

    #[must_use]
    pub fn with_retry(mut self, retry: BackoffConfig) -> Self {
        self.retry = retry;
        self
    }

    #[must_use]
    pub fn with_approval(mut self, approval: ApprovalConfig) -> Self {
        self.approval = approval;
        self
    }

    #[must_use]
    pub fn with_continuous_deployment(mut self, enabled: bool) -> Self {
        self.continuous_deployment = enabled;
        self
    }

    pub fn export_names(&self) -> ExportNames {
        ExportNames::for_pipeline(&self.pipeline_name)
    }

    /// Parse TOML and validate
    pub fn from_toml_str(raw: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_toml_str(&raw)?;
        tracing::debug!(path = %path.display(), pipeline = %config.pipeline_name, "loaded pipeline config");
        Ok(config)
    }

    /// Range checks that serde cannot express
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline_name.trim().is_empty() {
            return Err(ConfigError::Invalid("pipeline_name must not be empty".into()));
        }
        if self.state_machine_name.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "state_machine_name must not be empty".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        if self.retry.multiplier.is_nan() || self.retry.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry.multiplier must be at least 1.0".into(),
            ));
        }
        if self.retry.initial_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid(
                "retry.initial_delay_ms must not exceed retry.max_delay_ms".into(),
            ));
        }
        if self.approval.approvers.iter().any(|a| a.trim().is_empty()) {
            return Err(ConfigError::Invalid(
                "approval.approvers must not contain blank names".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = PipelineConfig::default();
        assert!(config.validate().is_ok());
        assert!(config.continuous_deployment);
        assert_eq!(config.retry.max_attempts, 5);
        assert_eq!(config.approval.timeout(), None);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = PipelineConfig::from_toml_str(
            r#"
            pipeline_name = "shop"

            [execution_context]
            account = "123456789012"
            region = "us-east-1"

            [retry]
            max_attempts = 3
            "#,
        )
        .unwrap();

        assert_eq!(config.pipeline_name, "shop");
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_ms, 200);
        assert_eq!(config.approval.comment, DEFAULT_APPROVAL_COMMENT);
        assert_eq!(
            config.export_names().primary_distribution_id,
            "shop-primary-distribution-id"
        );
    }

    #[test]
    fn out_of_range_retry_is_rejected() {
        let err = PipelineConfig::from_toml_str("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PipelineConfig::from_toml_str("[retry]\nmultiplier = 0.5\n").unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));

        let err = PipelineConfig::from_toml_str(
            "[retry]\ninitial_delay_ms = 10000\nmax_delay_ms = 100\n",
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_toml_is_a_parse_error() {
        let err = PipelineConfig::from_toml_str("pipeline_name = [").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn approvers_restrict_actors() {
        let approval = ApprovalConfig {
            approvers: vec!["alice".into()],
            ..ApprovalConfig::default()
        };
        assert!(approval.is_authorized("alice"));
        assert!(!approval.is_authorized("mallory"));
        assert!(ApprovalConfig::default().is_authorized("anyone"));
    }

    #[test]
    fn load_reads_from_disk() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "pipeline_name = \"from-disk\"\ncontinuous_deployment = false").unwrap();

        let config = PipelineConfig::load(file.path()).unwrap();
        assert_eq!(config.pipeline_name, "from-disk");
        assert!(!config.continuous_deployment);
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = PipelineConfig::load(dir.path().join("absent.toml")).unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }
}
