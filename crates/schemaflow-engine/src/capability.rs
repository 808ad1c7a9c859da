use schemaflow_core::{Actor, EngineError};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Eq, PartialEq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Read,
    Create,
    Update,
    Delete,
    Run,
    Rollback,
    Validate,
    Test,
    Import,
    Export,
    ManageDependencies,
    ManageLocks,
}

impl Operation {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
            Self::Run => "run",
            Self::Rollback => "rollback",
            Self::Validate => "validate",
            Self::Test => "test",
            Self::Import => "import",
            Self::Export => "export",
            Self::ManageDependencies => "manage_dependencies",
            Self::ManageLocks => "manage_locks",
        }
    }

    /// Whether the operation can change stored state or the target schema.
    #[must_use]
    pub fn is_mutating(self) -> bool {
        !matches!(self, Self::Read | Self::Validate | Self::Export)
    }
}

/// Permission check composed by the caller in front of engine operations.
pub trait CapabilityCheck {
    #[allow(clippy::missing_errors_doc)]
    fn authorize(&self, actor: &Actor, operation: Operation) -> Result<(), EngineError>;
}

pub struct AllowAll;

impl CapabilityCheck for AllowAll {
    fn authorize(&self, _actor: &Actor, _operation: Operation) -> Result<(), EngineError> {
        Ok(())
    }
}

/// Permits only operations that leave state untouched.
pub struct ReadOnly;

impl CapabilityCheck for ReadOnly {
    fn authorize(&self, actor: &Actor, operation: Operation) -> Result<(), EngineError> {
        if operation.is_mutating() {
            return Err(EngineError::Unauthorized {
                actor: actor.name.clone(),
                operation: operation.as_str().to_string(),
                reason: "read-only session".to_string(),
            });
        }
        Ok(())
    }
}
