use schemaflow_core::query::AuditFilter;
use schemaflow_core::{
    now_utc, Actor, AuditAction, AuditEntry, AuditEntryInput, EngineError, ResourceType,
};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::MigrationService;

/// What an audited operation acts on, plus the detail it fills in while it runs.
pub(crate) struct AuditScope {
    action: AuditAction,
    resource_type: ResourceType,
    pub(crate) resource_id: Option<String>,
    detail: Map<String, Value>,
}

impl AuditScope {
    pub(crate) fn new(action: AuditAction, resource_type: impl Into<ResourceType>) -> Self {
        Self {
            action,
            resource_type: resource_type.into(),
            resource_id: None,
            detail: Map::new(),
        }
    }

    pub(crate) fn on(
        action: AuditAction,
        resource_type: impl Into<ResourceType>,
        resource_id: impl ToString,
    ) -> Self {
        Self {
            resource_id: Some(resource_id.to_string()),
            ..Self::new(action, resource_type)
        }
    }

    pub(crate) fn note(&mut self, key: &str, value: impl Serialize) {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.detail.insert(key.to_string(), value);
    }
}

impl MigrationService<'_> {
    /// Runs `op` and appends exactly one audit entry describing its outcome.
    pub(crate) fn audited<T>(
        &self,
        actor: &Actor,
        mut scope: AuditScope,
        op: impl FnOnce(&mut AuditScope) -> Result<T, EngineError>,
    ) -> Result<T, EngineError> {
        actor.validate()?;
        let result = op(&mut scope);

        let error = result.as_ref().err();
        if let Some(err) = error {
            scope.note("error_code", err.code());
        }
        let input = AuditEntryInput {
            actor: actor.name.clone(),
            source: actor.source.clone(),
            action: scope.action,
            resource_type: scope.resource_type,
            resource_id: scope.resource_id,
            succeeded: error.is_none(),
            error: error.map(ToString::to_string),
            detail: Value::Object(scope.detail),
            recorded_at: now_utc(),
        };

        match self.store.append_audit(&input) {
            Ok(_) => result,
            Err(err) => {
                tracing::error!(
                    action = input.action.as_str(),
                    resource = input.resource_type.as_str(),
                    error = %format!("{err:#}"),
                    "failed to append audit entry"
                );
                match result {
                    Ok(_) => Err(err.into()),
                    Err(original) => Err(original),
                }
            }
        }
    }

    /// # Errors
    /// Returns [`EngineError::Store`] when the audit log cannot be read.
    pub fn get_audit_log(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, EngineError> {
        let mut filter = filter.clone();
        filter.limit.get_or_insert(self.config.history_page_limit);
        Ok(self.store.list_audit(&filter)?)
    }
}
