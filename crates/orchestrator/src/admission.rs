//! Admission hooks (defaulting and validation) registered per kind at
//! startup. Serving them over HTTPS is left to the embedding binary.

use std::collections::BTreeMap;
use std::sync::Arc;

use fleet_core::ResourceKind;
use serde_json::Value;
use thiserror::Error;
use tracing::info;

use crate::config::{FeatureGates, Gate};

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("admission hook for {0} already registered")]
    Duplicate(String),
    #[error("admission hook for {0} neither defaults nor validates")]
    NoCapability(String),
}

/// Defaulting and validation for one kind.
pub trait Admission: Send + Sync + 'static {
    fn supports_default(&self) -> bool { false }
    fn supports_validate(&self) -> bool { false }

    fn default(&self, _object: &mut Value) {}

    /// `old` is `None` on create.
    fn validate(&self, _old: Option<&Value>, _new: &Value) -> Result<(), String> { Ok(()) }
}

/// `/mutate-<group-with-dashes>-<version>-<kind>` (or `/validate-`), lowercase.
pub fn webhook_path(prefix: &str, kind: &ResourceKind) -> String {
    let group = if kind.group.is_empty() { "core".to_string() } else { kind.group.replace('.', "-") };
    format!("/{}-{}-{}-{}", prefix, group, kind.version, kind.kind.to_lowercase()).to_lowercase()
}

#[derive(Default)]
pub struct WebhookRegistry {
    hooks: BTreeMap<ResourceKind, Arc<dyn Admission>>,
}

impl WebhookRegistry {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, kind: ResourceKind, hook: Arc<dyn Admission>) -> Result<(), RegistryError> {
        if !hook.supports_default() && !hook.supports_validate() {
            return Err(RegistryError::NoCapability(kind.gvk_key()));
        }
        if self.hooks.contains_key(&kind) {
            return Err(RegistryError::Duplicate(kind.gvk_key()));
        }
        info!(kind = %kind, default = hook.supports_default(), validate = hook.supports_validate(), "admission hook registered");
        self.hooks.insert(kind, hook);
        Ok(())
    }

    /// Register unless `gate` is switched off. Returns whether it was added.
    pub fn register_gated(
        &mut self,
        gates: &FeatureGates,
        gate: Option<Gate>,
        kind: ResourceKind,
        hook: Arc<dyn Admission>,
    ) -> Result<bool, RegistryError> {
        if !gates.allows(gate) {
            return Ok(false);
        }
        self.register(kind, hook).map(|_| true)
    }

    pub fn get(&self, kind: &ResourceKind) -> Option<&Arc<dyn Admission>> { self.hooks.get(kind) }

    pub fn len(&self) -> usize { self.hooks.len() }
    pub fn is_empty(&self) -> bool { self.hooks.is_empty() }

    /// Every path the registered hooks would be served on, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut out = Vec::new();
        for (kind, hook) in &self.hooks {
            if hook.supports_default() {
                out.push(webhook_path("mutate", kind));
            }
            if hook.supports_validate() {
                out.push(webhook_path("validate", kind));
            }
        }
        out.sort();
        out
    }

    /// Run defaulting then validation for a create or update.
    pub fn admit(&self, kind: &ResourceKind, old: Option<&Value>, new: &mut Value) -> Result<(), String> {
        let Some(hook) = self.hooks.get(kind) else { return Ok(()) };
        if hook.supports_default() {
            hook.default(new);
        }
        if hook.supports_validate() {
            hook.validate(old, new)?;
        }
        Ok(())
    }
}
