//! Loosely-typed access to collections whose shape may vary between
//! deployments. Identifiers are validated before they are spliced into SQL.

use chrono::{DateTime, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tripdesk_core::store::Filter;

/// Quotes a table or column name, rejecting anything outside
/// `[A-Za-z_][A-Za-z0-9_]*`.
pub fn quote_ident(name: &str) -> Option<String> {
    let mut chars = name.chars();
    let first = chars.next()?;
    if !(first.is_ascii_alphabetic() || first == '_') {
        return None;
    }
    if !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return None;
    }
    Some(format!("\"{name}\""))
}

/// Errors raised before any SQL is sent.
#[derive(Debug, thiserror::Error)]
pub enum RecordQueryError {
    #[error("invalid identifier '{0}'")]
    InvalidIdentifier(String),
    #[error("record has no fields")]
    EmptyRecord,
    #[error(transparent)]
    Sql(#[from] sqlx::Error),
}

fn ident(name: &str) -> Result<String, RecordQueryError> {
    quote_ident(name).ok_or_else(|| RecordQueryError::InvalidIdentifier(name.to_string()))
}

pub async fn find_recent(
    pool: &PgPool,
    collection: &str,
    filter: &Filter,
    since: DateTime<Utc>,
) -> Result<Option<Map<String, Value>>, RecordQueryError> {
    let table = ident(collection)?;
    let (predicate, value, key) = match filter {
        Filter::Field { name, value } => (format!("t.{}::text = $1", ident(name)?), value, None),
        Filter::Metadata { column, key, value } => (
            format!("t.{} ->> $3 = $1", ident(column)?),
            value,
            Some(key.as_str()),
        ),
    };
    let sql = format!(
        "SELECT to_jsonb(t) AS record FROM {table} t \
         WHERE {predicate} AND t.created_at >= $2 \
         ORDER BY t.created_at DESC LIMIT 1"
    );

    let mut query = sqlx::query_scalar::<_, Value>(&sql).bind(value).bind(since);
    if let Some(key) = key {
        query = query.bind(key);
    }
    let found = query.fetch_optional(pool).await?;
    Ok(found.and_then(|record| match record {
        Value::Object(map) => Some(map),
        _ => None,
    }))
}

/// Inserts only the fields present in `record`, so an unknown field surfaces
/// as an undefined-column error instead of being dropped.
pub async fn insert(
    pool: &PgPool,
    collection: &str,
    record: &Map<String, Value>,
) -> Result<(), RecordQueryError> {
    if record.is_empty() {
        return Err(RecordQueryError::EmptyRecord);
    }
    let table = ident(collection)?;
    let columns = record
        .keys()
        .map(|key| ident(key))
        .collect::<Result<Vec<_>, _>>()?
        .join(", ");
    let sql = format!(
        "INSERT INTO {table} ({columns}) \
         SELECT {columns} FROM jsonb_populate_record(NULL::{table}, $1)"
    );
    sqlx::query(&sql)
        .bind(Value::Object(record.clone()))
        .execute(pool)
        .await?;
    Ok(())
}
