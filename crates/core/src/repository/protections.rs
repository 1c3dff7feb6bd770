// Ownership rules for cards and their import batches

use crate::domain::{Card, ImportBatch};
use crate::error::Result;
use crate::port::entity_store::fields;
use crate::port::{EntityRecord, EntityStore, EntityTable, QuerySpec};
use crate::repository::protection::{Protection, ProtectionRegistry, RepositoryOperation};
use crate::repository::query::Query;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// A card belongs to the user who registered it
pub struct CardProtection;

#[async_trait]
impl Protection<Card> for CardProtection {
    fn secured(&self, identity: Uuid) -> Query<Card> {
        Query::all().filter_eq(fields::card::USER_ID, identity)
    }

    async fn has_access(
        &self,
        card: &Card,
        identity: Uuid,
        _operation: RepositoryOperation,
    ) -> Result<bool> {
        Ok(card.user_id == identity)
    }
}

/// A batch belongs to whoever owns its card
pub struct ImportBatchProtection {
    store: Arc<dyn EntityStore>,
}

impl ImportBatchProtection {
    pub fn new(store: Arc<dyn EntityStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Protection<ImportBatch> for ImportBatchProtection {
    fn secured(&self, identity: Uuid) -> Query<ImportBatch> {
        Query::all().owned_through(
            fields::import_batch::CARD_ID,
            EntityTable::Cards,
            fields::card::USER_ID,
            identity,
        )
    }

    async fn has_access(
        &self,
        batch: &ImportBatch,
        identity: Uuid,
        _operation: RepositoryOperation,
    ) -> Result<bool> {
        let owner = self
            .store
            .fetch(&QuerySpec::by_id(EntityTable::Cards, batch.card_id()))
            .await?;
        Ok(matches!(owner.first(), Some(EntityRecord::Card(card)) if card.user_id == identity))
    }
}

/// Registry with a rule for every entity this crate persists
pub fn default_registry(store: Arc<dyn EntityStore>) -> Result<ProtectionRegistry> {
    let mut registry = ProtectionRegistry::new();
    registry.register::<Card>(Arc::new(CardProtection))?;
    registry.register::<ImportBatch>(Arc::new(ImportBatchProtection::new(store)))?;
    Ok(registry)
}
