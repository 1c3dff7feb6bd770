// SQLite EntityStore Implementation

use crate::error::{corrupt_row, map_sqlx_error};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::{QueryBuilder, Sqlite, SqliteConnection, SqlitePool};
use tracing::debug;
use transit_core::domain::{Card, CardType, ImportBatch, ImportBatchSnapshot, JobStatus, OutcomeFlags};
use transit_core::error::{AppError, Result};
use transit_core::port::entity_store::fields;
use transit_core::port::{
    Change, ChangeKind, EntityRecord, EntityStore, EntityTable, FieldValue, Filter, QuerySpec,
    SortOrder,
};
use uuid::Uuid;

const DATE_FORMAT: &str = "%Y-%m-%d";

const CARD_COLUMNS: &[&str] = &[
    fields::ID,
    fields::card::USER_ID,
    fields::card::ALIAS,
    fields::card::NUMBER,
    fields::card::CARD_TYPE,
    fields::card::EXPIRY_DATE,
    fields::card::CREATED_AT,
];

const IMPORT_BATCH_COLUMNS: &[&str] = &[
    fields::ID,
    fields::import_batch::CARD_ID,
    fields::import_batch::BLOB_CONTAINER,
    fields::import_batch::BLOB_NAME,
    fields::import_batch::SHA256,
    fields::import_batch::STATUS,
    "outcome_flags",
    fields::import_batch::RETRY_COUNT,
    "error",
    fields::import_batch::UPLOADED_AT,
    "queued_at",
    "started_at",
    "completed_at",
    "failed_at",
    "canceled_at",
    "superseded_at",
    fields::import_batch::HANGFIRE_JOB_ID,
    "version",
];

/// Column names are interpolated into SQL, so only known ones get through
fn check_column(table: EntityTable, column: &str) -> Result<()> {
    let known = match table {
        EntityTable::Cards => CARD_COLUMNS,
        EntityTable::ImportBatches => IMPORT_BATCH_COLUMNS,
    };
    if known.contains(&column) {
        Ok(())
    } else {
        Err(AppError::Internal(format!(
            "Unknown column {}.{}",
            table.as_str(),
            column
        )))
    }
}

fn push_value(builder: &mut QueryBuilder<'_, Sqlite>, value: &FieldValue) {
    match value {
        FieldValue::Null => {
            builder.push("NULL");
        }
        FieldValue::Uuid(v) => {
            builder.push_bind(v.to_string());
        }
        FieldValue::Text(v) => {
            builder.push_bind(v.clone());
        }
        FieldValue::Int(v) => {
            builder.push_bind(*v);
        }
        FieldValue::Date(v) => {
            builder.push_bind(v.format(DATE_FORMAT).to_string());
        }
        FieldValue::Timestamp(v) => {
            builder.push_bind(v.timestamp_millis());
        }
    }
}

fn push_filter(
    builder: &mut QueryBuilder<'_, Sqlite>,
    table: EntityTable,
    filter: &Filter,
) -> Result<()> {
    match filter {
        Filter::Eq { field, value } => {
            check_column(table, field)?;
            builder.push(*field);
            if *value == FieldValue::Null {
                builder.push(" IS NULL");
            } else {
                builder.push(" = ");
                push_value(builder, value);
            }
        }
        Filter::Lt { field, value } => {
            check_column(table, field)?;
            builder.push(*field).push(" < ");
            push_value(builder, value);
        }
        Filter::OwnedThrough {
            field,
            parent,
            owner_field,
            owner,
        } => {
            check_column(table, field)?;
            check_column(*parent, owner_field)?;
            builder
                .push(*field)
                .push(" IN (SELECT id FROM ")
                .push(parent.as_str())
                .push(" WHERE ")
                .push(*owner_field)
                .push(" = ");
            builder.push_bind(owner.to_string());
            builder.push(")");
        }
    }
    Ok(())
}

fn build_select(spec: &QuerySpec) -> Result<QueryBuilder<'static, Sqlite>> {
    let mut builder = QueryBuilder::new("SELECT * FROM ");
    builder.push(spec.table.as_str());

    for (i, filter) in spec.filters.iter().enumerate() {
        builder.push(if i == 0 { " WHERE " } else { " AND " });
        push_filter(&mut builder, spec.table, filter)?;
    }

    builder.push(" ORDER BY ");
    if let Some((field, order)) = spec.order_by {
        check_column(spec.table, field)?;
        builder.push(field).push(match order {
            SortOrder::Ascending => " ASC, ",
            SortOrder::Descending => " DESC, ",
        });
    }
    builder.push("id ASC");

    if let Some(limit) = spec.limit {
        builder.push(" LIMIT ");
        builder.push_bind(i64::from(limit));
    }
    Ok(builder)
}

fn millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

fn from_millis(table: &str, id: &str, value: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| corrupt_row(table, id, format!("timestamp {} out of range", value)))
}

fn from_optional_millis(table: &str, id: &str, value: Option<i64>) -> Result<Option<DateTime<Utc>>> {
    value.map(|v| from_millis(table, id, v)).transpose()
}

fn parse_uuid(table: &str, id: &str, value: &str) -> Result<Uuid> {
    Uuid::parse_str(value).map_err(|e| corrupt_row(table, id, e))
}

#[derive(Debug, sqlx::FromRow)]
struct CardRow {
    id: String,
    user_id: String,
    alias: String,
    number: String,
    card_type: i32,
    expiry_date: String,
    created_at: i64,
}

impl CardRow {
    fn into_card(self) -> Result<Card> {
        const TABLE: &str = "cards";
        let card_type = CardType::from_i32(self.card_type).ok_or_else(|| {
            corrupt_row(TABLE, &self.id, format!("card_type {}", self.card_type))
        })?;
        let expiry_date = NaiveDate::parse_from_str(&self.expiry_date, DATE_FORMAT)
            .map_err(|e| corrupt_row(TABLE, &self.id, e))?;

        Ok(Card {
            id: parse_uuid(TABLE, &self.id, &self.id)?,
            user_id: parse_uuid(TABLE, &self.id, &self.user_id)?,
            alias: self.alias,
            number: self.number,
            card_type,
            expiry_date,
            created_at: from_millis(TABLE, &self.id, self.created_at)?,
        })
    }
}

#[derive(Debug, sqlx::FromRow)]
struct ImportBatchRow {
    id: String,
    card_id: String,
    blob_container: String,
    blob_name: String,
    sha256: String,
    status: i32,
    outcome_flags: i64,
    retry_count: i32,
    error: Option<String>,
    uploaded_at: i64,
    queued_at: Option<i64>,
    started_at: Option<i64>,
    completed_at: Option<i64>,
    failed_at: Option<i64>,
    canceled_at: Option<i64>,
    superseded_at: Option<i64>,
    hangfire_job_id: Option<String>,
    version: i64,
}

impl ImportBatchRow {
    fn into_batch(self) -> Result<ImportBatch> {
        const TABLE: &str = "import_batches";
        let id = self.id.as_str();
        let status = JobStatus::from_i32(self.status)
            .ok_or_else(|| corrupt_row(TABLE, id, format!("status {}", self.status)))?;
        let outcome_flags = u32::try_from(self.outcome_flags)
            .map(OutcomeFlags::from_bits)
            .map_err(|e| corrupt_row(TABLE, id, e))?;

        Ok(ImportBatch::rehydrate(ImportBatchSnapshot {
            id: parse_uuid(TABLE, id, id)?,
            card_id: parse_uuid(TABLE, id, &self.card_id)?,
            blob_container: self.blob_container,
            blob_name: self.blob_name,
            sha256: self.sha256,
            status,
            outcome_flags,
            retry_count: self.retry_count,
            error: self.error,
            uploaded_at: from_millis(TABLE, id, self.uploaded_at)?,
            queued_at: from_optional_millis(TABLE, id, self.queued_at)?,
            started_at: from_optional_millis(TABLE, id, self.started_at)?,
            completed_at: from_optional_millis(TABLE, id, self.completed_at)?,
            failed_at: from_optional_millis(TABLE, id, self.failed_at)?,
            canceled_at: from_optional_millis(TABLE, id, self.canceled_at)?,
            superseded_at: from_optional_millis(TABLE, id, self.superseded_at)?,
            hangfire_job_id: self.hangfire_job_id,
            version: self.version,
        }))
    }
}

pub struct SqliteEntityStore {
    pool: SqlitePool,
}

impl SqliteEntityStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

async fn insert_card(conn: &mut SqliteConnection, card: &Card) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cards (id, user_id, alias, number, card_type, expiry_date, created_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(card.id.to_string())
    .bind(card.user_id.to_string())
    .bind(&card.alias)
    .bind(&card.number)
    .bind(card.card_type.as_i32())
    .bind(card.expiry_date.format(DATE_FORMAT).to_string())
    .bind(millis(card.created_at))
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

async fn update_card(conn: &mut SqliteConnection, card: &Card) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE cards
        SET user_id = ?, alias = ?, number = ?, card_type = ?, expiry_date = ?
        WHERE id = ?
        "#,
    )
    .bind(card.user_id.to_string())
    .bind(&card.alias)
    .bind(&card.number)
    .bind(card.card_type.as_i32())
    .bind(card.expiry_date.format(DATE_FORMAT).to_string())
    .bind(card.id.to_string())
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!("cards row {} not found", card.id)));
    }
    Ok(())
}

async fn insert_batch(conn: &mut SqliteConnection, batch: &ImportBatch) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO import_batches (
            id, card_id, blob_container, blob_name, sha256,
            status, outcome_flags, retry_count, error,
            uploaded_at, queued_at, started_at, completed_at,
            failed_at, canceled_at, superseded_at,
            hangfire_job_id, version
        ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(batch.id().to_string())
    .bind(batch.card_id().to_string())
    .bind(batch.blob_container())
    .bind(batch.blob_name())
    .bind(batch.sha256())
    .bind(batch.status().as_i32())
    .bind(i64::from(batch.outcome_flags().bits()))
    .bind(batch.retry_count())
    .bind(batch.error())
    .bind(millis(batch.uploaded_at()))
    .bind(batch.queued_at().map(millis))
    .bind(batch.started_at().map(millis))
    .bind(batch.completed_at().map(millis))
    .bind(batch.failed_at().map(millis))
    .bind(batch.canceled_at().map(millis))
    .bind(batch.superseded_at().map(millis))
    .bind(batch.hangfire_job_id())
    .bind(batch.version())
    .execute(conn)
    .await
    .map_err(map_sqlx_error)?;
    Ok(())
}

/// Compare-and-increment on `version`
async fn update_batch(conn: &mut SqliteConnection, batch: &ImportBatch) -> Result<()> {
    let result = sqlx::query(
        r#"
        UPDATE import_batches
        SET status = ?, outcome_flags = ?, retry_count = ?, error = ?,
            queued_at = ?, started_at = ?, completed_at = ?,
            failed_at = ?, canceled_at = ?, superseded_at = ?,
            hangfire_job_id = ?, version = version + 1
        WHERE id = ? AND version = ?
        "#,
    )
    .bind(batch.status().as_i32())
    .bind(i64::from(batch.outcome_flags().bits()))
    .bind(batch.retry_count())
    .bind(batch.error())
    .bind(batch.queued_at().map(millis))
    .bind(batch.started_at().map(millis))
    .bind(batch.completed_at().map(millis))
    .bind(batch.failed_at().map(millis))
    .bind(batch.canceled_at().map(millis))
    .bind(batch.superseded_at().map(millis))
    .bind(batch.hangfire_job_id())
    .bind(batch.id().to_string())
    .bind(batch.version())
    .execute(&mut *conn)
    .await
    .map_err(map_sqlx_error)?;

    if result.rows_affected() > 0 {
        return Ok(());
    }

    let exists: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM import_batches WHERE id = ?")
        .bind(batch.id().to_string())
        .fetch_one(&mut *conn)
        .await
        .map_err(map_sqlx_error)?;

    if exists == 0 {
        Err(AppError::NotFound(format!(
            "import_batches row {} not found",
            batch.id()
        )))
    } else {
        Err(AppError::Concurrency(format!(
            "import_batches row {} was modified by another writer",
            batch.id()
        )))
    }
}

async fn delete_row(conn: &mut SqliteConnection, table: EntityTable, id: Uuid) -> Result<()> {
    let mut builder: QueryBuilder<'_, Sqlite> = QueryBuilder::new("DELETE FROM ");
    builder.push(table.as_str()).push(" WHERE id = ");
    builder.push_bind(id.to_string());

    let result = builder
        .build()
        .execute(conn)
        .await
        .map_err(map_sqlx_error)?;

    if result.rows_affected() == 0 {
        return Err(AppError::NotFound(format!(
            "{} row {} not found",
            table.as_str(),
            id
        )));
    }
    Ok(())
}

async fn apply_change(conn: &mut SqliteConnection, change: &Change) -> Result<()> {
    match (change.kind, &change.record) {
        (ChangeKind::Insert, EntityRecord::Card(card)) => insert_card(conn, card).await,
        (ChangeKind::Update, EntityRecord::Card(card)) => update_card(conn, card).await,
        (ChangeKind::Insert, EntityRecord::ImportBatch(batch)) => insert_batch(conn, batch).await,
        (ChangeKind::Update, EntityRecord::ImportBatch(batch)) => update_batch(conn, batch).await,
        (ChangeKind::Delete, record) => delete_row(conn, record.table(), record.id()).await,
    }
}

#[async_trait]
impl EntityStore for SqliteEntityStore {
    async fn fetch(&self, spec: &QuerySpec) -> Result<Vec<EntityRecord>> {
        let mut builder = build_select(spec)?;

        match spec.table {
            EntityTable::Cards => {
                let rows = builder
                    .build_query_as::<CardRow>()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
                rows.into_iter()
                    .map(|r| r.into_card().map(EntityRecord::Card))
                    .collect()
            }
            EntityTable::ImportBatches => {
                let rows = builder
                    .build_query_as::<ImportBatchRow>()
                    .fetch_all(&self.pool)
                    .await
                    .map_err(map_sqlx_error)?;
                rows.into_iter()
                    .map(|r| r.into_batch().map(EntityRecord::ImportBatch))
                    .collect()
            }
        }
    }

    async fn commit(&self, changes: &[Change]) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }

        // Dropping the transaction on error rolls it back
        let mut tx = self.pool.begin().await.map_err(map_sqlx_error)?;
        for change in changes {
            apply_change(&mut tx, change).await?;
        }
        tx.commit().await.map_err(map_sqlx_error)?;

        debug!(changes = changes.len(), "Entity changes committed");
        Ok(())
    }
}
