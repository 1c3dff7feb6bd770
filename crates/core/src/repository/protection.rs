// Protection Rules - per-entity authorization used by the secure repositories

use crate::error::{AppError, Result};
use crate::port::Record;
use crate::repository::query::Query;
use async_trait::async_trait;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum RepositoryOperation {
    None = 0,
    Insert = 1,
    Update = 2,
    Delete = 3,
    Read = 4,
}

impl std::fmt::Display for RepositoryOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            RepositoryOperation::None => "none",
            RepositoryOperation::Insert => "insert",
            RepositoryOperation::Update => "update",
            RepositoryOperation::Delete => "delete",
            RepositoryOperation::Read => "read",
        };
        f.write_str(name)
    }
}

/// Authorization policy for one entity type
///
/// Rules are stateless apart from injected ports and are shared across requests.
#[async_trait]
pub trait Protection<T: Record>: Send + Sync {
    /// Rows visible to `identity`
    fn secured(&self, identity: Uuid) -> Query<T>;

    /// Whether `identity` may apply `operation` to `entity`
    async fn has_access(
        &self,
        entity: &T,
        identity: Uuid,
        operation: RepositoryOperation,
    ) -> Result<bool>;
}

/// Entity type -> rule, populated once at startup
#[derive(Default)]
pub struct ProtectionRegistry {
    rules: HashMap<TypeId, Box<dyn Any + Send + Sync>>,
}

impl ProtectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// At most one rule per entity type
    pub fn register<T: Record>(&mut self, rule: Arc<dyn Protection<T>>) -> Result<()> {
        let key = TypeId::of::<T>();
        if self.rules.contains_key(&key) {
            return Err(AppError::Config(format!(
                "Protection for {} is already registered",
                std::any::type_name::<T>()
            )));
        }
        self.rules.insert(key, Box::new(rule));
        Ok(())
    }

    pub fn resolve<T: Record>(&self) -> Option<Arc<dyn Protection<T>>> {
        self.rules
            .get(&TypeId::of::<T>())
            .and_then(|rule| rule.downcast_ref::<Arc<dyn Protection<T>>>())
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Card, ImportBatch};

    struct AllowAll;

    #[async_trait]
    impl Protection<Card> for AllowAll {
        fn secured(&self, _identity: Uuid) -> Query<Card> {
            Query::all()
        }

        async fn has_access(&self, _: &Card, _: Uuid, _: RepositoryOperation) -> Result<bool> {
            Ok(true)
        }
    }

    #[test]
    fn test_register_and_resolve_by_type() {
        let mut registry = ProtectionRegistry::new();
        registry.register::<Card>(Arc::new(AllowAll)).unwrap();

        assert!(registry.resolve::<Card>().is_some());
        assert!(registry.resolve::<ImportBatch>().is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let mut registry = ProtectionRegistry::new();
        registry.register::<Card>(Arc::new(AllowAll)).unwrap();
        let err = registry.register::<Card>(Arc::new(AllowAll)).unwrap_err();
        assert!(matches!(err, AppError::Config(_)));
    }
}
