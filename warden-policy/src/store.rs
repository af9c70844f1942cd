use std::sync::{Arc, RwLock};

use tokio::sync::OnceCell;

use crate::config::{PolicyConfig, PolicyDocument};
use crate::permission::PermissionChecker;
use crate::PolicyError;

/// An immutable, compiled policy. Requests hold one of these for their whole
/// validation so they never observe a half-applied update.
#[derive(Debug)]
pub struct ActivePolicy {
    pub version: u64,
    pub config: PolicyConfig,
    pub(crate) permissions: PermissionChecker,
    /// Embeddings of `config.blocked_topics`, computed on first semantic check.
    pub(crate) topic_embeddings: OnceCell<Vec<Vec<f32>>>,
}

impl ActivePolicy {
    pub fn compile(version: u64, config: PolicyConfig) -> Result<Self, PolicyError> {
        config.validate()?;
        let permissions = PermissionChecker::new(&config.blocked_operation_keywords)?;
        Ok(Self {
            version,
            config,
            permissions,
            topic_embeddings: OnceCell::new(),
        })
    }

    pub fn permissions(&self) -> &PermissionChecker {
        &self.permissions
    }
}

/// Holder of the current policy; updates swap the whole snapshot.
#[derive(Debug)]
pub struct PolicyStore {
    current: RwLock<Arc<ActivePolicy>>,
}

impl PolicyStore {
    pub fn new(config: PolicyConfig) -> Result<Self, PolicyError> {
        Self::from_document(PolicyDocument {
            version: 1,
            policy: config,
        })
    }

    pub fn from_document(doc: PolicyDocument) -> Result<Self, PolicyError> {
        let active = ActivePolicy::compile(doc.version, doc.policy)?;
        Ok(Self {
            current: RwLock::new(Arc::new(active)),
        })
    }

    pub fn snapshot(&self) -> Arc<ActivePolicy> {
        Arc::clone(&self.current.read().unwrap_or_else(|e| e.into_inner()))
    }

    /// Compiles and installs `config`, returning the new version. An invalid
    /// config leaves the current policy in place.
    pub fn replace(&self, config: PolicyConfig) -> Result<u64, PolicyError> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        let version = current.version + 1;
        let next = ActivePolicy::compile(version, config)?;
        *current = Arc::new(next);
        Ok(version)
    }
}
