// Entity Store Port
// Generic persistence used by the query/command repositories

use crate::domain::{Card, DomainEvent, EventSource, ImportBatch};
use crate::error::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use std::cmp::Ordering;
use uuid::Uuid;

/// Column names shared by filters and adapters
pub mod fields {
    pub const ID: &str = "id";

    pub mod card {
        pub const USER_ID: &str = "user_id";
        pub const ALIAS: &str = "alias";
        pub const NUMBER: &str = "number";
        pub const CARD_TYPE: &str = "card_type";
        pub const EXPIRY_DATE: &str = "expiry_date";
        pub const CREATED_AT: &str = "created_at";
    }

    pub mod import_batch {
        pub const CARD_ID: &str = "card_id";
        pub const BLOB_CONTAINER: &str = "blob_container";
        pub const BLOB_NAME: &str = "blob_name";
        pub const SHA256: &str = "sha256";
        pub const STATUS: &str = "status";
        pub const RETRY_COUNT: &str = "retry_count";
        pub const UPLOADED_AT: &str = "uploaded_at";
        pub const HANGFIRE_JOB_ID: &str = "hangfire_job_id";
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityTable {
    Cards,
    ImportBatches,
}

impl EntityTable {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityTable::Cards => "cards",
            EntityTable::ImportBatches => "import_batches",
        }
    }

    /// Columns guarded by a unique index
    pub fn unique_fields(&self) -> &'static [&'static str] {
        match self {
            EntityTable::Cards => &[fields::card::NUMBER],
            EntityTable::ImportBatches => &[fields::import_batch::SHA256],
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Uuid(Uuid),
    Text(String),
    Int(i64),
    Date(NaiveDate),
    Timestamp(DateTime<Utc>),
}

impl FieldValue {
    /// Ordering within the same variant; `None` across variants or with Null
    pub fn compare(&self, other: &FieldValue) -> Option<Ordering> {
        match (self, other) {
            (FieldValue::Uuid(a), FieldValue::Uuid(b)) => Some(a.cmp(b)),
            (FieldValue::Text(a), FieldValue::Text(b)) => Some(a.cmp(b)),
            (FieldValue::Int(a), FieldValue::Int(b)) => Some(a.cmp(b)),
            (FieldValue::Date(a), FieldValue::Date(b)) => Some(a.cmp(b)),
            (FieldValue::Timestamp(a), FieldValue::Timestamp(b)) => Some(a.cmp(b)),
            _ => None,
        }
    }
}

impl From<Uuid> for FieldValue {
    fn from(v: Uuid) -> Self {
        FieldValue::Uuid(v)
    }
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Text(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Text(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::Int(v)
    }
}

impl From<i32> for FieldValue {
    fn from(v: i32) -> Self {
        FieldValue::Int(v as i64)
    }
}

impl From<NaiveDate> for FieldValue {
    fn from(v: NaiveDate) -> Self {
        FieldValue::Date(v)
    }
}

impl From<DateTime<Utc>> for FieldValue {
    fn from(v: DateTime<Utc>) -> Self {
        FieldValue::Timestamp(v)
    }
}

impl<T: Into<FieldValue>> From<Option<T>> for FieldValue {
    fn from(v: Option<T>) -> Self {
        v.map(Into::into).unwrap_or(FieldValue::Null)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Filter {
    Eq {
        field: &'static str,
        value: FieldValue,
    },
    Lt {
        field: &'static str,
        value: FieldValue,
    },
    /// `field` references a row of `parent` whose `owner_field` equals `owner`
    OwnedThrough {
        field: &'static str,
        parent: EntityTable,
        owner_field: &'static str,
        owner: Uuid,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SortOrder {
    Ascending,
    Descending,
}

/// Untyped query handed to the store
#[derive(Debug, Clone, PartialEq)]
pub struct QuerySpec {
    pub table: EntityTable,
    pub filters: Vec<Filter>,
    pub order_by: Option<(&'static str, SortOrder)>,
    pub limit: Option<u32>,
}

impl QuerySpec {
    pub fn all(table: EntityTable) -> Self {
        Self {
            table,
            filters: Vec::new(),
            order_by: None,
            limit: None,
        }
    }

    pub fn by_id(table: EntityTable, id: Uuid) -> Self {
        let mut spec = Self::all(table);
        spec.filters.push(Filter::Eq {
            field: fields::ID,
            value: FieldValue::Uuid(id),
        });
        spec.limit = Some(1);
        spec
    }
}

/// Any persisted entity
#[derive(Debug, Clone)]
pub enum EntityRecord {
    Card(Card),
    ImportBatch(ImportBatch),
}

impl EntityRecord {
    pub fn table(&self) -> EntityTable {
        match self {
            EntityRecord::Card(_) => EntityTable::Cards,
            EntityRecord::ImportBatch(_) => EntityTable::ImportBatches,
        }
    }

    pub fn id(&self) -> Uuid {
        match self {
            EntityRecord::Card(c) => c.id,
            EntityRecord::ImportBatch(b) => b.id(),
        }
    }

    /// Column value by name; `None` for unknown columns
    pub fn field(&self, name: &str) -> Option<FieldValue> {
        use fields::{card, import_batch as batch};

        if name == fields::ID {
            return Some(FieldValue::Uuid(self.id()));
        }

        match self {
            EntityRecord::Card(c) => match name {
                card::USER_ID => Some(c.user_id.into()),
                card::ALIAS => Some(c.alias.clone().into()),
                card::NUMBER => Some(c.number.clone().into()),
                card::CARD_TYPE => Some(c.card_type.as_i32().into()),
                card::EXPIRY_DATE => Some(c.expiry_date.into()),
                card::CREATED_AT => Some(c.created_at.into()),
                _ => None,
            },
            EntityRecord::ImportBatch(b) => match name {
                batch::CARD_ID => Some(b.card_id().into()),
                batch::BLOB_CONTAINER => Some(b.blob_container().into()),
                batch::BLOB_NAME => Some(b.blob_name().into()),
                batch::SHA256 => Some(b.sha256().into()),
                batch::STATUS => Some(b.status().as_i32().into()),
                batch::RETRY_COUNT => Some(b.retry_count().into()),
                batch::UPLOADED_AT => Some(b.uploaded_at().into()),
                batch::HANGFIRE_JOB_ID => Some(b.hangfire_job_id().map(str::to_string).into()),
                _ => None,
            },
        }
    }

    pub fn version(&self) -> Option<i64> {
        match self {
            EntityRecord::Card(_) => None,
            EntityRecord::ImportBatch(b) => Some(b.version()),
        }
    }

    pub fn take_domain_events(&mut self) -> Vec<DomainEvent> {
        match self {
            EntityRecord::Card(_) => Vec::new(),
            EntityRecord::ImportBatch(b) => b.take_domain_events(),
        }
    }

    pub fn restore_domain_events(&mut self, events: Vec<DomainEvent>) {
        if let EntityRecord::ImportBatch(b) = self {
            b.restore_domain_events(events);
        }
    }
}

/// Typed view over [`EntityRecord`]
pub trait Record: Clone + Send + Sync + 'static {
    const TABLE: EntityTable;

    fn record_id(&self) -> Uuid;

    fn into_record(self) -> EntityRecord;

    fn from_record(record: EntityRecord) -> Result<Self>;
}

impl Record for Card {
    const TABLE: EntityTable = EntityTable::Cards;

    fn record_id(&self) -> Uuid {
        self.id
    }

    fn into_record(self) -> EntityRecord {
        EntityRecord::Card(self)
    }

    fn from_record(record: EntityRecord) -> Result<Self> {
        match record {
            EntityRecord::Card(c) => Ok(c),
            other => Err(AppError::Internal(format!(
                "expected a card row, got {}",
                other.table().as_str()
            ))),
        }
    }
}

impl Record for ImportBatch {
    const TABLE: EntityTable = EntityTable::ImportBatches;

    fn record_id(&self) -> Uuid {
        self.id()
    }

    fn into_record(self) -> EntityRecord {
        EntityRecord::ImportBatch(self)
    }

    fn from_record(record: EntityRecord) -> Result<Self> {
        match record {
            EntityRecord::ImportBatch(b) => Ok(b),
            other => Err(AppError::Internal(format!(
                "expected an import batch row, got {}",
                other.table().as_str()
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

/// One staged mutation
#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub record: EntityRecord,
}

#[async_trait]
pub trait EntityStore: Send + Sync {
    async fn fetch(&self, spec: &QuerySpec) -> Result<Vec<EntityRecord>>;

    async fn exists(&self, spec: &QuerySpec) -> Result<bool> {
        let mut probe = spec.clone();
        probe.limit = Some(1);
        Ok(!self.fetch(&probe).await?.is_empty())
    }

    /// Apply all changes in one transaction
    ///
    /// # Errors
    /// - `Conflict` on a unique index violation
    /// - `Concurrency` when a versioned row changed since it was read
    /// - `NotFound` when an updated or deleted row is gone
    async fn commit(&self, changes: &[Change]) -> Result<()>;
}

pub mod mocks {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering as AtomicOrdering};
    use std::sync::Mutex;

    type Tables = BTreeMap<EntityTable, BTreeMap<Uuid, EntityRecord>>;

    /// In-memory store with the same constraint semantics as the SQLite adapter
    #[derive(Default)]
    pub struct InMemoryEntityStore {
        tables: Mutex<Tables>,
        commits: AtomicUsize,
        fail_next_commit: AtomicBool,
    }

    impl InMemoryEntityStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// Number of successful commits
        pub fn commit_count(&self) -> usize {
            self.commits.load(AtomicOrdering::SeqCst)
        }

        pub fn row_count(&self, table: EntityTable) -> usize {
            self.tables
                .lock()
                .unwrap()
                .get(&table)
                .map(|t| t.len())
                .unwrap_or(0)
        }

        pub fn fail_next_commit(&self) {
            self.fail_next_commit.store(true, AtomicOrdering::SeqCst);
        }

        /// Seed rows without going through commit
        pub fn seed(&self, record: EntityRecord) {
            self.tables
                .lock()
                .unwrap()
                .entry(record.table())
                .or_default()
                .insert(record.id(), record);
        }
    }

    fn matches(tables: &Tables, record: &EntityRecord, filter: &Filter) -> bool {
        match filter {
            Filter::Eq { field, value } => record.field(field).as_ref() == Some(value),
            Filter::Lt { field, value } => record
                .field(field)
                .and_then(|v| v.compare(value))
                .map(|o| o == Ordering::Less)
                .unwrap_or(false),
            Filter::OwnedThrough {
                field,
                parent,
                owner_field,
                owner,
            } => {
                let Some(FieldValue::Uuid(parent_id)) = record.field(field) else {
                    return false;
                };
                tables
                    .get(parent)
                    .and_then(|t| t.get(&parent_id))
                    .and_then(|p| p.field(owner_field))
                    == Some(FieldValue::Uuid(*owner))
            }
        }
    }

    fn check_unique(tables: &Tables, record: &EntityRecord) -> Result<()> {
        let table = record.table();
        let Some(rows) = tables.get(&table) else {
            return Ok(());
        };
        for field in table.unique_fields() {
            let value = record.field(field);
            let clash = rows
                .values()
                .any(|other| other.id() != record.id() && other.field(field) == value);
            if clash {
                return Err(AppError::Conflict(format!(
                    "Unique constraint violation: {}.{}",
                    table.as_str(),
                    field
                )));
            }
        }
        Ok(())
    }

    fn apply(tables: &mut Tables, change: &Change) -> Result<()> {
        let table = change.record.table();
        let id = change.record.id();

        match change.kind {
            ChangeKind::Insert => {
                if tables.get(&table).map(|t| t.contains_key(&id)).unwrap_or(false) {
                    return Err(AppError::Conflict(format!(
                        "Unique constraint violation: {}.id",
                        table.as_str()
                    )));
                }
                if let EntityRecord::ImportBatch(b) = &change.record {
                    let card_exists = tables
                        .get(&EntityTable::Cards)
                        .map(|t| t.contains_key(&b.card_id()))
                        .unwrap_or(false);
                    if !card_exists {
                        return Err(AppError::Database(
                            "Foreign key constraint violation: import_batches.card_id".to_string(),
                        ));
                    }
                }
                check_unique(tables, &change.record)?;
                tables
                    .entry(table)
                    .or_default()
                    .insert(id, change.record.clone());
            }
            ChangeKind::Update => {
                let current = tables
                    .get(&table)
                    .and_then(|t| t.get(&id))
                    .ok_or_else(|| {
                        AppError::NotFound(format!("{} row {} not found", table.as_str(), id))
                    })?;
                if current.version() != change.record.version() {
                    return Err(AppError::Concurrency(format!(
                        "{} row {} was modified by another writer",
                        table.as_str(),
                        id
                    )));
                }
                check_unique(tables, &change.record)?;

                let stored = match &change.record {
                    EntityRecord::ImportBatch(b) => {
                        let mut snapshot = b.snapshot();
                        snapshot.version += 1;
                        EntityRecord::ImportBatch(ImportBatch::rehydrate(snapshot))
                    }
                    other => other.clone(),
                };
                tables.entry(table).or_default().insert(id, stored);
            }
            ChangeKind::Delete => {
                let removed = tables.get_mut(&table).and_then(|t| t.remove(&id));
                if removed.is_none() {
                    return Err(AppError::NotFound(format!(
                        "{} row {} not found",
                        table.as_str(),
                        id
                    )));
                }
                if table == EntityTable::Cards {
                    if let Some(batches) = tables.get_mut(&EntityTable::ImportBatches) {
                        batches.retain(|_, b| {
                            b.field(fields::import_batch::CARD_ID) != Some(FieldValue::Uuid(id))
                        });
                    }
                }
            }
        }
        Ok(())
    }

    #[async_trait]
    impl EntityStore for InMemoryEntityStore {
        async fn fetch(&self, spec: &QuerySpec) -> Result<Vec<EntityRecord>> {
            let tables = self.tables.lock().unwrap();
            let mut rows: Vec<EntityRecord> = tables
                .get(&spec.table)
                .map(|t| {
                    t.values()
                        .filter(|r| spec.filters.iter().all(|f| matches(&tables, r, f)))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();

            if let Some((field, order)) = spec.order_by {
                rows.sort_by(|a, b| {
                    let ord = match (a.field(field), b.field(field)) {
                        (Some(x), Some(y)) => x.compare(&y).unwrap_or(Ordering::Equal),
                        _ => Ordering::Equal,
                    };
                    match order {
                        SortOrder::Ascending => ord,
                        SortOrder::Descending => ord.reverse(),
                    }
                });
            }
            if let Some(limit) = spec.limit {
                rows.truncate(limit as usize);
            }
            Ok(rows)
        }

        async fn commit(&self, changes: &[Change]) -> Result<()> {
            if self.fail_next_commit.swap(false, AtomicOrdering::SeqCst) {
                return Err(AppError::Database("simulated commit failure".to_string()));
            }

            let mut tables = self.tables.lock().unwrap();
            let mut working = tables.clone();
            for change in changes {
                apply(&mut working, change)?;
            }
            *tables = working;
            self.commits.fetch_add(1, AtomicOrdering::SeqCst);
            Ok(())
        }
    }
}
