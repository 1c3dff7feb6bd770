// Command Repositories - unit of work over the entity store
//
// A repository instance belongs to one request or job execution. Mutations
// take `&mut self`, so a unit of work cannot be shared between tasks.

use crate::application::events::DomainEventDispatcher;
use crate::domain::DomainEvent;
use crate::error::{AppError, Result};
use crate::port::{Change, ChangeKind, EntityStore, IdentityContext, Record};
use crate::repository::protection::{ProtectionRegistry, RepositoryOperation};
use std::sync::Arc;
use tracing::{debug, warn};

/// Whether a mutation is committed right after staging
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Persist {
    Deferred,
    Immediately,
}

/// Unscoped unit of work for background and system contexts
pub struct CommandRepo {
    store: Arc<dyn EntityStore>,
    dispatcher: Arc<DomainEventDispatcher>,
    staged: Vec<Change>,
}

impl CommandRepo {
    pub fn new(store: Arc<dyn EntityStore>, dispatcher: Arc<DomainEventDispatcher>) -> Self {
        Self {
            store,
            dispatcher,
            staged: Vec::new(),
        }
    }

    pub async fn insert<T: Record>(&mut self, entity: T, persist: Persist) -> Result<()> {
        self.stage(ChangeKind::Insert, entity);
        self.finish(persist).await
    }

    pub async fn update<T: Record>(&mut self, entity: T, persist: Persist) -> Result<()> {
        self.stage(ChangeKind::Update, entity);
        self.finish(persist).await
    }

    pub async fn delete<T: Record>(&mut self, entity: T, persist: Persist) -> Result<()> {
        self.stage(ChangeKind::Delete, entity);
        self.finish(persist).await
    }

    /// Staged changes not yet committed
    pub fn pending(&self) -> usize {
        self.staged.len()
    }

    /// Commit every staged change atomically, then dispatch drained domain events
    ///
    /// Events are drained from staged entities before the commit. If the commit
    /// fails they are put back and the staged changes are kept for another try.
    /// A failing event handler fails `save` even though the rows are committed.
    pub async fn save(&mut self) -> Result<()> {
        if self.staged.is_empty() {
            return Ok(());
        }

        let mut drained: Vec<(usize, Vec<DomainEvent>)> = Vec::new();
        for (index, change) in self.staged.iter_mut().enumerate() {
            if change.kind == ChangeKind::Delete {
                continue;
            }
            let events = change.record.take_domain_events();
            if !events.is_empty() {
                drained.push((index, events));
            }
        }

        if let Err(e) = self.store.commit(&self.staged).await {
            for (index, events) in drained {
                self.staged[index].record.restore_domain_events(events);
            }
            return Err(e);
        }

        let committed = self.staged.len();
        self.staged.clear();

        let events: Vec<DomainEvent> = drained.into_iter().flat_map(|(_, e)| e).collect();
        debug!(changes = committed, events = events.len(), "Unit of work committed");

        self.dispatcher.dispatch(&events).await
    }

    fn stage<T: Record>(&mut self, kind: ChangeKind, entity: T) {
        self.staged.push(Change {
            kind,
            record: entity.into_record(),
        });
    }

    async fn finish(&mut self, persist: Persist) -> Result<()> {
        match persist {
            Persist::Immediately => self.save().await,
            Persist::Deferred => Ok(()),
        }
    }
}

/// Unit of work that checks the entity's protection rule before staging
pub struct SecureCommandRepo {
    repo: CommandRepo,
    identity: Arc<dyn IdentityContext>,
    protections: Arc<ProtectionRegistry>,
}

impl SecureCommandRepo {
    pub fn new(
        store: Arc<dyn EntityStore>,
        dispatcher: Arc<DomainEventDispatcher>,
        identity: Arc<dyn IdentityContext>,
        protections: Arc<ProtectionRegistry>,
    ) -> Self {
        Self {
            repo: CommandRepo::new(store, dispatcher),
            identity,
            protections,
        }
    }

    pub async fn insert<T: Record>(&mut self, entity: T, persist: Persist) -> Result<()> {
        self.authorize(&entity, RepositoryOperation::Insert).await?;
        self.repo.insert(entity, persist).await
    }

    pub async fn update<T: Record>(&mut self, entity: T, persist: Persist) -> Result<()> {
        self.authorize(&entity, RepositoryOperation::Update).await?;
        self.repo.update(entity, persist).await
    }

    pub async fn delete<T: Record>(&mut self, entity: T, persist: Persist) -> Result<()> {
        self.authorize(&entity, RepositoryOperation::Delete).await?;
        self.repo.delete(entity, persist).await
    }

    pub fn pending(&self) -> usize {
        self.repo.pending()
    }

    pub async fn save(&mut self) -> Result<()> {
        self.repo.save().await
    }

    async fn authorize<T: Record>(&self, entity: &T, operation: RepositoryOperation) -> Result<()> {
        let Some(rule) = self.protections.resolve::<T>() else {
            debug!(
                table = T::TABLE.as_str(),
                operation = %operation,
                "No protection registered, access granted"
            );
            return Ok(());
        };

        let identity = self.identity.identity_id()?;
        if rule.has_access(entity, identity, operation).await? {
            return Ok(());
        }

        warn!(
            table = T::TABLE.as_str(),
            entity_id = %entity.record_id(),
            identity = %identity,
            operation = %operation,
            "Access denied"
        );
        Err(AppError::Unauthorized(format!(
            "You do not have permission to {} this {} record.",
            operation,
            T::TABLE.as_str()
        )))
    }
}
