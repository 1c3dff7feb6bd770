// Card Use Cases

use crate::application::events::DomainEventDispatcher;
use crate::domain::{Card, CardType};
use crate::error::{AppError, Result};
use crate::port::entity_store::fields;
use crate::port::{EntityStore, IdProvider, IdentityContext, SortOrder, TimeProvider};
use crate::repository::{
    CommandRepo, Persist, ProtectionRegistry, QueryRepo, SecureCommandRepo, SecureQueryRepo,
};
use chrono::{Days, NaiveDate};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Cards stay this long past their expiry date before cleanup removes them
pub const EXPIRED_CARD_RETENTION_DAYS: u64 = 30;

const DUPLICATE_NUMBER_MESSAGE: &str = "Card with this number already exists.";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CardRequest {
    pub alias: String,
    pub number: String,
    pub card_type: CardType,
    pub expiry_date: NaiveDate,
}

pub struct CardService {
    store: Arc<dyn EntityStore>,
    dispatcher: Arc<DomainEventDispatcher>,
    protections: Arc<ProtectionRegistry>,
    id_provider: Arc<dyn IdProvider>,
    time_provider: Arc<dyn TimeProvider>,
}

impl CardService {
    pub fn new(
        store: Arc<dyn EntityStore>,
        dispatcher: Arc<DomainEventDispatcher>,
        protections: Arc<ProtectionRegistry>,
        id_provider: Arc<dyn IdProvider>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store,
            dispatcher,
            protections,
            id_provider,
            time_provider,
        }
    }

    /// Register a card for the calling user
    pub async fn create(&self, identity: Arc<dyn IdentityContext>, request: CardRequest) -> Result<Card> {
        let owner = identity.identity_id()?;
        self.ensure_number_free(&request.number, None).await?;

        let card = Card::create(
            self.id_provider.generate_id(),
            owner,
            request.alias,
            request.number,
            request.card_type,
            request.expiry_date,
            self.time_provider.now(),
        )?;

        let mut commands = self.commands(identity);
        commands
            .insert(card.clone(), Persist::Immediately)
            .await
            .map_err(duplicate_number)?;

        info!(card_id = %card.id, user_id = %owner, "Card created");
        Ok(card)
    }

    pub async fn update(
        &self,
        identity: Arc<dyn IdentityContext>,
        id: Uuid,
        request: CardRequest,
    ) -> Result<Card> {
        let mut card = self.get(identity.clone(), id).await?;
        if card.number != request.number {
            self.ensure_number_free(&request.number, Some(id)).await?;
        }

        card.update(
            request.alias,
            request.number,
            request.card_type,
            request.expiry_date,
        )?;

        let mut commands = self.commands(identity);
        commands
            .update(card.clone(), Persist::Immediately)
            .await
            .map_err(duplicate_number)?;
        Ok(card)
    }

    /// Remove a card and, through the cascade, its import batches
    pub async fn delete(&self, identity: Arc<dyn IdentityContext>, id: Uuid) -> Result<()> {
        let card = self.get(identity.clone(), id).await?;
        let mut commands = self.commands(identity);
        commands.delete(card, Persist::Immediately).await?;

        info!(card_id = %id, "Card deleted");
        Ok(())
    }

    pub async fn get(&self, identity: Arc<dyn IdentityContext>, id: Uuid) -> Result<Card> {
        let queries = self.queries(identity);
        let query = queries.secure::<Card>()?.by_id(id);
        queries
            .first(&query)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Card with ID {} does not exist.", id)))
    }

    /// The caller's cards ordered by alias
    pub async fn list(&self, identity: Arc<dyn IdentityContext>) -> Result<Vec<Card>> {
        let queries = self.queries(identity);
        let query = queries
            .secure::<Card>()?
            .order_by(fields::card::ALIAS, SortOrder::Ascending);
        queries.list(&query).await
    }

    /// Delete every card that expired more than the retention period before `today`
    ///
    /// Runs as a system job, so it reads and writes without a caller identity.
    pub async fn delete_expired_cards(&self, today: NaiveDate) -> Result<usize> {
        let cutoff = today
            .checked_sub_days(Days::new(EXPIRED_CARD_RETENTION_DAYS))
            .ok_or_else(|| AppError::Internal(format!("date underflow before {}", today)))?;

        let queries = QueryRepo::new(self.store.clone());
        let expired = queries
            .list(&queries.queryable::<Card>().filter_lt(fields::card::EXPIRY_DATE, cutoff))
            .await?;
        if expired.is_empty() {
            return Ok(0);
        }

        let count = expired.len();
        let mut commands = CommandRepo::new(self.store.clone(), self.dispatcher.clone());
        for card in expired {
            commands.delete(card, Persist::Deferred).await?;
        }
        commands.save().await?;

        info!(deleted = count, cutoff = %cutoff, "Deleted expired cards");
        Ok(count)
    }

    async fn ensure_number_free(&self, number: &str, except: Option<Uuid>) -> Result<()> {
        let queries = QueryRepo::new(self.store.clone());
        let same_number = queries
            .queryable::<Card>()
            .filter_eq(fields::card::NUMBER, number);
        let taken = queries
            .list(&same_number)
            .await?
            .into_iter()
            .any(|card| Some(card.id) != except);
        if taken {
            return Err(AppError::Conflict(DUPLICATE_NUMBER_MESSAGE.to_string()));
        }
        Ok(())
    }

    fn queries(&self, identity: Arc<dyn IdentityContext>) -> SecureQueryRepo {
        SecureQueryRepo::new(self.store.clone(), identity, self.protections.clone())
    }

    fn commands(&self, identity: Arc<dyn IdentityContext>) -> SecureCommandRepo {
        SecureCommandRepo::new(
            self.store.clone(),
            self.dispatcher.clone(),
            identity,
            self.protections.clone(),
        )
    }
}

/// Unique violations on insert/update can only come from the number index
fn duplicate_number(err: AppError) -> AppError {
    match err {
        AppError::Conflict(_) => AppError::Conflict(DUPLICATE_NUMBER_MESSAGE.to_string()),
        other => other,
    }
}
