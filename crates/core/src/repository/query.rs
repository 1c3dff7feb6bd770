// Query Repositories - plain (system) and secure (caller-scoped) reads

use crate::error::Result;
use crate::port::{EntityStore, EntityTable, FieldValue, Filter, IdentityContext, QuerySpec, Record, SortOrder};
use crate::port::entity_store::fields;
use crate::repository::protection::ProtectionRegistry;
use std::marker::PhantomData;
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Typed, composable query over the rows of `T`
pub struct Query<T> {
    spec: QuerySpec,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for Query<T> {
    fn clone(&self) -> Self {
        Self {
            spec: self.spec.clone(),
            _marker: PhantomData,
        }
    }
}

impl<T: Record> Query<T> {
    pub fn all() -> Self {
        Self {
            spec: QuerySpec::all(T::TABLE),
            _marker: PhantomData,
        }
    }

    pub fn filter_eq(mut self, field: &'static str, value: impl Into<FieldValue>) -> Self {
        self.spec.filters.push(Filter::Eq {
            field,
            value: value.into(),
        });
        self
    }

    pub fn filter_lt(mut self, field: &'static str, value: impl Into<FieldValue>) -> Self {
        self.spec.filters.push(Filter::Lt {
            field,
            value: value.into(),
        });
        self
    }

    pub fn owned_through(
        mut self,
        field: &'static str,
        parent: EntityTable,
        owner_field: &'static str,
        owner: Uuid,
    ) -> Self {
        self.spec.filters.push(Filter::OwnedThrough {
            field,
            parent,
            owner_field,
            owner,
        });
        self
    }

    pub fn by_id(self, id: Uuid) -> Self {
        self.filter_eq(fields::ID, id)
    }

    pub fn order_by(mut self, field: &'static str, order: SortOrder) -> Self {
        self.spec.order_by = Some((field, order));
        self
    }

    pub fn limit(mut self, limit: u32) -> Self {
        self.spec.limit = Some(limit);
        self
    }

    pub fn spec(&self) -> &QuerySpec {
        &self.spec
    }
}

/// Unscoped reads for background and system contexts
#[derive(Clone)]
pub struct QueryRepo {
    store: Arc<dyn EntityStore>,
}

impl QueryRepo {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }

    pub fn queryable<T: Record>(&self) -> Query<T> {
        Query::all()
    }

    pub async fn list<T: Record>(&self, query: &Query<T>) -> Result<Vec<T>> {
        self.store
            .fetch(query.spec())
            .await?
            .into_iter()
            .map(T::from_record)
            .collect()
    }

    pub async fn first<T: Record>(&self, query: &Query<T>) -> Result<Option<T>> {
        let query = query.clone().limit(1);
        Ok(self.list(&query).await?.into_iter().next())
    }

    pub async fn find<T: Record>(&self, id: Uuid) -> Result<Option<T>> {
        self.first(&Query::<T>::all().by_id(id)).await
    }

    pub async fn exists<T: Record>(&self, query: &Query<T>) -> Result<bool> {
        self.store.exists(query.spec()).await
    }
}

/// Reads filtered to what the current identity may see
pub struct SecureQueryRepo {
    repo: QueryRepo,
    identity: Arc<dyn IdentityContext>,
    protections: Arc<ProtectionRegistry>,
}

impl SecureQueryRepo {
    pub fn new(
        store: Arc<dyn EntityStore>,
        identity: Arc<dyn IdentityContext>,
        protections: Arc<ProtectionRegistry>,
    ) -> Self {
        Self {
            repo: QueryRepo::new(store),
            identity,
            protections,
        }
    }

    /// Caller-scoped query; unfiltered when no rule is registered for `T`
    pub fn secure<T: Record>(&self) -> Result<Query<T>> {
        match self.protections.resolve::<T>() {
            Some(rule) => Ok(rule.secured(self.identity.identity_id()?)),
            None => {
                debug!(
                    table = T::TABLE.as_str(),
                    "No protection registered, returning unfiltered query"
                );
                Ok(Query::all())
            }
        }
    }

    /// Unscoped query, for lookups that must see every row
    pub fn queryable<T: Record>(&self) -> Query<T> {
        self.repo.queryable()
    }

    pub async fn list<T: Record>(&self, query: &Query<T>) -> Result<Vec<T>> {
        self.repo.list(query).await
    }

    pub async fn first<T: Record>(&self, query: &Query<T>) -> Result<Option<T>> {
        self.repo.first(query).await
    }

    pub async fn exists<T: Record>(&self, query: &Query<T>) -> Result<bool> {
        self.repo.exists(query).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Card, CardType, ImportBatch};
    use crate::error::AppError;
    use crate::port::entity_store::mocks::InMemoryEntityStore;
    use crate::port::{ClaimsIdentity, EntityRecord};
    use crate::repository::protections;
    use chrono::{NaiveDate, Utc};

    fn card(owner: Uuid, number: &str) -> Card {
        Card::create(
            Uuid::now_v7(),
            owner,
            format!("card {}", number),
            number,
            CardType::Gold,
            NaiveDate::from_ymd_opt(2030, 1, 1).unwrap(),
            Utc::now(),
        )
        .unwrap()
    }

    fn setup(owner: Uuid) -> (Arc<InMemoryEntityStore>, SecureQueryRepo, Card, Card) {
        let store = Arc::new(InMemoryEntityStore::new());
        let mine = card(owner, "1");
        let theirs = card(Uuid::now_v7(), "2");
        store.seed(EntityRecord::Card(mine.clone()));
        store.seed(EntityRecord::Card(theirs.clone()));
        store.seed(EntityRecord::ImportBatch(
            ImportBatch::create(Uuid::now_v7(), theirs.id, "c", "n.csv", "AB".repeat(32), Utc::now())
                .unwrap(),
        ));

        let registry = protections::default_registry(store.clone()).unwrap();
        let repo = SecureQueryRepo::new(
            store.clone(),
            Arc::new(ClaimsIdentity::for_user(owner, &[])),
            Arc::new(registry),
        );
        (store, repo, mine, theirs)
    }

    #[tokio::test]
    async fn test_secure_scopes_cards_to_owner() {
        let owner = Uuid::now_v7();
        let (_, repo, mine, theirs) = setup(owner);

        let visible = repo.list(&repo.secure::<Card>().unwrap()).await.unwrap();
        assert_eq!(visible, vec![mine]);

        let other = repo.secure::<Card>().unwrap().by_id(theirs.id);
        assert!(!repo.exists(&other).await.unwrap());
    }

    #[tokio::test]
    async fn test_secure_scopes_batches_through_card() {
        let (_, repo, _, _) = setup(Uuid::now_v7());
        let scoped = repo.list(&repo.secure::<ImportBatch>().unwrap()).await.unwrap();
        assert!(scoped.is_empty());

        let everything = repo.list(&repo.queryable::<ImportBatch>()).await.unwrap();
        assert_eq!(everything.len(), 1);
    }

    #[tokio::test]
    async fn test_unregistered_type_is_unfiltered() {
        let store = Arc::new(InMemoryEntityStore::new());
        store.seed(EntityRecord::Card(card(Uuid::now_v7(), "9")));
        let repo = SecureQueryRepo::new(
            store,
            Arc::new(ClaimsIdentity::new()),
            Arc::new(ProtectionRegistry::new()),
        );

        let query = repo.secure::<Card>().unwrap();
        assert_eq!(repo.list(&query).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_missing_identity_propagates() {
        let store = Arc::new(InMemoryEntityStore::new());
        let registry = protections::default_registry(store.clone()).unwrap();
        let repo = SecureQueryRepo::new(store, Arc::new(ClaimsIdentity::new()), Arc::new(registry));

        let err = repo.secure::<Card>().err().unwrap();
        assert!(matches!(err, AppError::InvalidOperation(_)));
    }
}
