//! Error taxonomy for refactor planning.
//!
//! Ambiguous movements are deliberately absent: they are an expected outcome and are
//! returned as [`super::mapping::AmbiguousPath`] data.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum RefactorError {
    /// Malformed user input (mapping file, option combination). Aborts the whole operation.
    #[error("{0}")]
    Validation(String),

    /// A stack, resource or the toolkit bucket is missing where it is required.
    #[error("{what} not found. {remediation}")]
    NotFound { what: String, remediation: String },

    /// A call to CloudFormation, S3 or STS failed.
    #[error("{operation} failed: {source}")]
    Network {
        operation: String,
        #[source]
        source: anyhow::Error,
    },

    /// A stack template is over the inline limit and there is no bucket to upload it to.
    #[error(
        "Template too large to refactor ({size} bytes for stack {stack_name}) and no staging \
         bucket was found. Run 'cdk bootstrap' in this environment and try again."
    )]
    TemplateTooLarge { stack_name: String, size: usize },

    /// A graph query named a node that does not exist.
    #[error("Node not found in resource graph: {0}")]
    NodeNotFound(String),

    /// A template could not be read as a CloudFormation template.
    #[error("Invalid template for stack {stack_name}: {reason}")]
    InvalidTemplate { stack_name: String, reason: String },

    /// The operation was cancelled before it completed.
    #[error("Refactor cancelled")]
    Cancelled,
}

impl RefactorError {
    pub fn validation(message: impl Into<String>) -> Self {
        RefactorError::Validation(message.into())
    }

    pub fn not_found(what: impl Into<String>, remediation: impl Into<String>) -> Self {
        RefactorError::NotFound {
            what: what.into(),
            remediation: remediation.into(),
        }
    }

    pub fn network(operation: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        RefactorError::Network {
            operation: operation.into(),
            source: source.into(),
        }
    }

    /// Whether this error must abort every environment, not just the one it came from.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            RefactorError::Validation(_)
                | RefactorError::TemplateTooLarge { .. }
                | RefactorError::Cancelled
        )
    }

    /// Short kind label, used in reports and JSON output.
    pub fn kind(&self) -> &'static str {
        match self {
            RefactorError::Validation(_) => "ValidationError",
            RefactorError::NotFound { .. } => "NotFoundError",
            RefactorError::Network { .. } => "NetworkError",
            RefactorError::TemplateTooLarge { .. } => "TooLargeError",
            RefactorError::NodeNotFound(_) => "NodeNotFound",
            RefactorError::InvalidTemplate { .. } => "InvalidTemplate",
            RefactorError::Cancelled => "Cancelled",
        }
    }
}

pub type RefactorResult<T> = Result<T, RefactorError>;
