/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FerroDB - MongoDB wire-compatible proxy for PostgreSQL
 * Built with Rust for superior performance and reliability
 *
 * @file postgresql_backend.rs
 * @brief PostgreSQL backend: schema/table lifecycle, JSONB storage, SQL
 */

use async_trait::async_trait;
use bson::{Bson, Document};
use deadpool_postgres::{Manager, Pool, Transaction};
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio_postgres::error::SqlState;
use tokio_postgres::NoTls;
use tracing::debug;

use crate::backend::{
    validate_collection_name, validate_database_name, Backend, BackendError, BackendResult,
    CollectionStats, DatabaseStats, IndexSpec, NamespaceKind, QueryParams, QueryResult,
};
use crate::config::PostgresConfig;
use crate::error::{FerroDBError, Result};
use crate::pgjson;
use crate::pushdown;

/// Per-database metadata table: one row, one JSONB column.
pub const SETTINGS_TABLE: &str = "_ferretdb_settings";

// PostgreSQL identifiers are capped at 63 bytes; leave room for the
// hash suffix and index decorations.
const TABLE_NAME_BASE_MAX: usize = 45;
const TABLE_NAME_MAX: usize = 54;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct Settings {
    #[serde(default)]
    collections: IndexMap<String, CollectionSettings>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CollectionSettings {
    table: String,
    #[serde(default)]
    indexes: Vec<IndexSpec>,
}

pub struct PostgresBackend {
    pool: Pool,
}

impl PostgresBackend {
    pub async fn connect(config: &PostgresConfig) -> Result<Self> {
        let pg_config: tokio_postgres::Config = config
            .uri
            .parse()
            .map_err(|e| FerroDBError::Database(format!("invalid PostgreSQL URI: {e}")))?;

        let manager = Manager::new(pg_config, NoTls);
        let pool = Pool::builder(manager)
            .max_size(config.pool_size as usize)
            .build()
            .map_err(|e| {
                FerroDBError::ConnectionPool(format!("failed to build connection pool: {e}"))
            })?;

        Ok(Self { pool })
    }

    async fn client(&self) -> BackendResult<deadpool_postgres::Object> {
        self.pool
            .get()
            .await
            .map_err(|e| BackendError::Unclassified(format!("connection pool: {e}")))
    }

    /// Resolve the backing table for a collection from the settings table,
    /// which is authoritative; table names are never re-derived at read time.
    async fn resolve_table(
        &self,
        client: &deadpool_postgres::Object,
        db: &str,
        collection: &str,
    ) -> BackendResult<String> {
        let settings = read_settings(client, db).await?;
        settings
            .collections
            .get(collection)
            .map(|c| c.table.clone())
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))
    }
}

fn classify_ddl(err: tokio_postgres::Error) -> BackendError {
    match err.code() {
        Some(state) if *state == SqlState::DUPLICATE_SCHEMA => {
            BackendError::AlreadyExists(NamespaceKind::Database)
        }
        Some(state) if *state == SqlState::DUPLICATE_TABLE => {
            BackendError::AlreadyExists(NamespaceKind::Collection)
        }
        Some(state) if *state == SqlState::DUPLICATE_OBJECT => {
            BackendError::AlreadyExists(NamespaceKind::Collection)
        }
        // A unique violation during DDL is a racing creator, not bad data.
        Some(state) if *state == SqlState::UNIQUE_VIOLATION => {
            BackendError::AlreadyExists(NamespaceKind::Database)
        }
        _ => classify_common(err),
    }
}

fn classify_data(err: tokio_postgres::Error) -> BackendError {
    match err.code() {
        Some(state) if *state == SqlState::UNIQUE_VIOLATION => BackendError::DuplicateKey,
        _ => classify_common(err),
    }
}

fn classify_common(err: tokio_postgres::Error) -> BackendError {
    match err.code() {
        Some(state) if *state == SqlState::INVALID_SCHEMA_NAME => {
            BackendError::NotFound(NamespaceKind::Database)
        }
        Some(state) if *state == SqlState::UNDEFINED_TABLE => {
            BackendError::NotFound(NamespaceKind::Collection)
        }
        Some(state)
            if *state == SqlState::T_R_SERIALIZATION_FAILURE
                || *state == SqlState::T_R_DEADLOCK_DETECTED =>
        {
            BackendError::Retryable(err.to_string())
        }
        _ => BackendError::Unclassified(err.to_string()),
    }
}

/// Double-quoted SQL identifier.
fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

fn quote_literal(text: &str) -> String {
    format!("'{}'", text.replace('\'', "''"))
}

/// Deterministic table name for a collection: lowercased, characters outside
/// `[a-z0-9_]` replaced, hash-suffixed on any mangling, reserved-prefix
/// collision or length overflow.
pub fn table_name_for(collection: &str) -> String {
    let lowered = collection.to_lowercase();
    let sanitized: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    let needs_suffix = sanitized != collection
        || sanitized.len() > TABLE_NAME_MAX
        || sanitized.starts_with(crate::backend::RESERVED_PREFIX);
    if !needs_suffix {
        return sanitized;
    }
    let digest = md5::compute(collection.as_bytes());
    let suffix = format!("{:x}", digest);
    let base: String = sanitized.chars().take(TABLE_NAME_BASE_MAX).collect();
    format!("{}_{}", base, &suffix[..8])
}

fn index_table_name(table: &str, index_name: &str) -> String {
    let digest = md5::compute(index_name.as_bytes());
    let suffix = format!("{:x}", digest);
    format!("{}_{}_idx", table, &suffix[..8])
}

async fn read_settings(
    client: &deadpool_postgres::Object,
    db: &str,
) -> BackendResult<Settings> {
    let sql = format!(
        "SELECT settings FROM {}.{}",
        quote_ident(db),
        quote_ident(SETTINGS_TABLE)
    );
    let rows = client.query(sql.as_str(), &[]).await.map_err(classify_common)?;
    let row = rows
        .first()
        .ok_or(BackendError::NotFound(NamespaceKind::Database))?;
    let value: Value = row.get(0);
    serde_json::from_value(value)
        .map_err(|e| BackendError::Unclassified(format!("corrupt settings document: {e}")))
}

/// Lock and read the settings row inside a transaction. This is the
/// serialization point for concurrent DDL on the same database.
async fn lock_settings(tx: &Transaction<'_>, db: &str) -> BackendResult<Settings> {
    let sql = format!(
        "SELECT settings FROM {}.{} FOR UPDATE",
        quote_ident(db),
        quote_ident(SETTINGS_TABLE)
    );
    let rows = tx.query(sql.as_str(), &[]).await.map_err(classify_common)?;
    let row = rows
        .first()
        .ok_or(BackendError::NotFound(NamespaceKind::Database))?;
    let value: Value = row.get(0);
    serde_json::from_value(value)
        .map_err(|e| BackendError::Unclassified(format!("corrupt settings document: {e}")))
}

async fn write_settings(tx: &Transaction<'_>, db: &str, settings: &Settings) -> BackendResult<()> {
    let sql = format!(
        "UPDATE {}.{} SET settings = $1",
        quote_ident(db),
        quote_ident(SETTINGS_TABLE)
    );
    let value = serde_json::to_value(settings)
        .map_err(|e| BackendError::Unclassified(format!("settings encoding: {e}")))?;
    tx.execute(sql.as_str(), &[&value]).await.map_err(classify_common)?;
    Ok(())
}

fn encoded_id(id: &Bson) -> BackendResult<Value> {
    pgjson::encode_value(id).map_err(|e| BackendError::Unclassified(e.to_string()))
}

fn create_index_sql(db: &str, table: &str, index: &IndexSpec) -> String {
    let columns: Vec<String> = index
        .keys
        .iter()
        .map(|key| {
            format!(
                "(_jsonb->{}) {}",
                quote_literal(&key.field),
                if key.descending { "DESC" } else { "ASC" }
            )
        })
        .collect();
    format!(
        "CREATE {}INDEX {} ON {}.{} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index_table_name(table, &index.name)),
        quote_ident(db),
        quote_ident(table),
        columns.join(", ")
    )
}

#[async_trait]
impl Backend for PostgresBackend {
    async fn list_databases(&self) -> BackendResult<Vec<String>> {
        let client = self.client().await?;
        // Exactly two schema patterns are invisible to listings.
        let rows = client
            .query(
                "SELECT schema_name FROM information_schema.schemata \
                 WHERE schema_name NOT LIKE 'pg\\_%' \
                 AND schema_name <> 'information_schema' \
                 ORDER BY schema_name",
                &[],
            )
            .await
            .map_err(classify_common)?;
        Ok(rows.iter().map(|row| row.get(0)).collect())
    }

    async fn create_database(&self, db: &str) -> BackendResult<()> {
        validate_database_name(db)?;
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(classify_common)?;
        tx.execute(format!("CREATE SCHEMA {}", quote_ident(db)).as_str(), &[])
            .await
            .map_err(classify_ddl)?;
        tx.execute(
            &format!(
                "CREATE TABLE {}.{} (settings jsonb NOT NULL)",
                quote_ident(db),
                quote_ident(SETTINGS_TABLE)
            ),
            &[],
        )
        .await
        .map_err(classify_ddl)?;
        let empty = serde_json::to_value(Settings::default())
            .map_err(|e| BackendError::Unclassified(e.to_string()))?;
        tx.execute(
            &format!(
                "INSERT INTO {}.{} (settings) VALUES ($1)",
                quote_ident(db),
                quote_ident(SETTINGS_TABLE)
            ),
            &[&empty],
        )
        .await
        .map_err(classify_ddl)?;
        tx.commit().await.map_err(classify_ddl)?;
        debug!(database = db, "created database schema");
        Ok(())
    }

    async fn create_database_if_not_exists(&self, db: &str) -> BackendResult<()> {
        match self.create_database(db).await {
            Ok(()) => Ok(()),
            Err(BackendError::AlreadyExists(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn drop_database(&self, db: &str) -> BackendResult<()> {
        validate_database_name(db)?;
        let client = self.client().await?;
        // DROP SCHEMA has no SQLSTATE for "did not exist", so probe first.
        let exists = client
            .query(
                "SELECT 1 FROM information_schema.schemata WHERE schema_name = $1",
                &[&db],
            )
            .await
            .map_err(classify_common)?;
        if exists.is_empty() {
            return Err(BackendError::NotFound(NamespaceKind::Database));
        }
        client
            .execute(format!("DROP SCHEMA {} CASCADE", quote_ident(db)).as_str(), &[])
            .await
            .map_err(classify_common)?;
        debug!(database = db, "dropped database schema");
        Ok(())
    }

    async fn list_collections(&self, db: &str) -> BackendResult<Vec<String>> {
        let client = self.client().await?;
        let settings = read_settings(&client, db).await?;
        let mut names: Vec<String> = settings.collections.keys().cloned().collect();
        names.sort();
        Ok(names)
    }

    async fn create_collection(&self, db: &str, collection: &str) -> BackendResult<()> {
        validate_collection_name(collection)?;
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(classify_common)?;
        let mut settings = lock_settings(&tx, db).await?;
        if settings.collections.contains_key(collection) {
            return Err(BackendError::AlreadyExists(NamespaceKind::Collection));
        }
        let table = table_name_for(collection);
        tx.execute(
            &format!(
                "CREATE TABLE {}.{} (_jsonb jsonb NOT NULL)",
                quote_ident(db),
                quote_ident(&table)
            ),
            &[],
        )
        .await
        .map_err(classify_ddl)?;
        // `_id` uniqueness is enforced by the backend, not the evaluator.
        let id_index = IndexSpec::id_index();
        tx.execute(create_index_sql(db, &table, &id_index).as_str(), &[])
            .await
            .map_err(classify_ddl)?;
        settings.collections.insert(
            collection.to_string(),
            CollectionSettings {
                table,
                indexes: Vec::new(),
            },
        );
        write_settings(&tx, db, &settings).await?;
        tx.commit().await.map_err(classify_ddl)?;
        debug!(database = db, collection, "created collection");
        Ok(())
    }

    async fn create_collection_if_not_exists(
        &self,
        db: &str,
        collection: &str,
    ) -> BackendResult<()> {
        self.create_database_if_not_exists(db).await?;
        match self.create_collection(db, collection).await {
            Ok(()) => Ok(()),
            Err(BackendError::AlreadyExists(_)) => Ok(()),
            Err(other) => Err(other),
        }
    }

    async fn drop_collection(&self, db: &str, collection: &str) -> BackendResult<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(classify_common)?;
        let mut settings = lock_settings(&tx, db).await?;
        let Some(entry) = settings.collections.shift_remove(collection) else {
            return Err(BackendError::NotFound(NamespaceKind::Collection));
        };
        tx.execute(
            &format!(
                "DROP TABLE IF EXISTS {}.{}",
                quote_ident(db),
                quote_ident(&entry.table)
            ),
            &[],
        )
        .await
        .map_err(classify_common)?;
        write_settings(&tx, db, &settings).await?;
        tx.commit().await.map_err(classify_common)?;
        debug!(database = db, collection, "dropped collection");
        Ok(())
    }

    async fn insert_document(
        &self,
        db: &str,
        collection: &str,
        document: &Document,
    ) -> BackendResult<()> {
        let client = self.client().await?;
        let table = self.resolve_table(&client, db, collection).await?;
        let encoded = pgjson::encode_document(document)
            .map_err(|e| BackendError::Unclassified(e.to_string()))?;
        let sql = format!(
            "INSERT INTO {}.{} (_jsonb) VALUES ($1)",
            quote_ident(db),
            quote_ident(&table)
        );
        client
            .execute(sql.as_str(), &[&encoded])
            .await
            .map_err(classify_data)?;
        Ok(())
    }

    async fn query_documents(
        &self,
        db: &str,
        collection: &str,
        params: &QueryParams,
    ) -> BackendResult<QueryResult> {
        let client = self.client().await?;
        let table = self.resolve_table(&client, db, collection).await?;
        let pushed = pushdown::translate(&params.filter);
        let mut sql = format!(
            "SELECT _jsonb FROM {}.{}",
            quote_ident(db),
            quote_ident(&table)
        );
        if let Some(where_clause) = pushed.where_clause() {
            sql.push(' ');
            sql.push_str(&where_clause);
        }
        if pushed.complete {
            if let Some(limit) = params.limit {
                if limit > 0 {
                    sql.push_str(&format!(" LIMIT {limit}"));
                }
            }
        }
        debug!(database = db, collection, sql = sql.as_str(), "query");
        let bound = pushed.sql_params();
        let rows = client
            .query(sql.as_str(), &bound)
            .await
            .map_err(classify_common)?;
        let mut documents = Vec::with_capacity(rows.len());
        for row in rows {
            let value: Value = row.get(0);
            let document = pgjson::decode_document(&value)
                .map_err(|e| BackendError::Unclassified(e.to_string()))?;
            documents.push(document);
        }
        Ok(QueryResult {
            documents,
            pushdown_complete: pushed.complete,
        })
    }

    async fn update_document(
        &self,
        db: &str,
        collection: &str,
        id: &Bson,
        document: &Document,
    ) -> BackendResult<()> {
        let client = self.client().await?;
        let table = self.resolve_table(&client, db, collection).await?;
        let encoded = pgjson::encode_document(document)
            .map_err(|e| BackendError::Unclassified(e.to_string()))?;
        let id_value = encoded_id(id)?;
        let sql = format!(
            "UPDATE {}.{} SET _jsonb = $1 WHERE _jsonb->'_id' = $2",
            quote_ident(db),
            quote_ident(&table)
        );
        let updated = client
            .execute(sql.as_str(), &[&encoded, &id_value])
            .await
            .map_err(classify_data)?;
        if updated == 0 {
            return Err(BackendError::NotFound(NamespaceKind::Document));
        }
        Ok(())
    }

    async fn delete_document(&self, db: &str, collection: &str, id: &Bson) -> BackendResult<()> {
        let client = self.client().await?;
        let table = self.resolve_table(&client, db, collection).await?;
        let id_value = encoded_id(id)?;
        let sql = format!(
            "DELETE FROM {}.{} WHERE _jsonb->'_id' = $1",
            quote_ident(db),
            quote_ident(&table)
        );
        let deleted = client
            .execute(sql.as_str(), &[&id_value])
            .await
            .map_err(classify_common)?;
        if deleted == 0 {
            return Err(BackendError::NotFound(NamespaceKind::Document));
        }
        Ok(())
    }

    async fn create_index(
        &self,
        db: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> BackendResult<bool> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(classify_common)?;
        let mut settings = lock_settings(&tx, db).await?;
        let Some(entry) = settings.collections.get_mut(collection) else {
            return Err(BackendError::NotFound(NamespaceKind::Collection));
        };
        if index.name == "_id_" || entry.indexes.iter().any(|e| e == index) {
            return Ok(false);
        }
        if entry.indexes.iter().any(|e| e.name == index.name) {
            return Err(BackendError::AlreadyExists(NamespaceKind::Index));
        }
        let table = entry.table.clone();
        entry.indexes.push(index.clone());
        tx.execute(create_index_sql(db, &table, index).as_str(), &[])
            .await
            .map_err(classify_ddl)?;
        write_settings(&tx, db, &settings).await?;
        tx.commit().await.map_err(classify_ddl)?;
        Ok(true)
    }

    async fn drop_index(&self, db: &str, collection: &str, name: &str) -> BackendResult<()> {
        let mut client = self.client().await?;
        let tx = client.transaction().await.map_err(classify_common)?;
        let mut settings = lock_settings(&tx, db).await?;
        let Some(entry) = settings.collections.get_mut(collection) else {
            return Err(BackendError::NotFound(NamespaceKind::Collection));
        };
        let Some(position) = entry.indexes.iter().position(|e| e.name == name) else {
            return Err(BackendError::NotFound(NamespaceKind::Index));
        };
        let table = entry.table.clone();
        entry.indexes.remove(position);
        tx.execute(
            &format!(
                "DROP INDEX IF EXISTS {}.{}",
                quote_ident(db),
                quote_ident(&index_table_name(&table, name))
            ),
            &[],
        )
        .await
        .map_err(classify_common)?;
        write_settings(&tx, db, &settings).await?;
        tx.commit().await.map_err(classify_common)?;
        Ok(())
    }

    async fn list_indexes(&self, db: &str, collection: &str) -> BackendResult<Vec<IndexSpec>> {
        let client = self.client().await?;
        let settings = read_settings(&client, db).await?;
        let entry = settings
            .collections
            .get(collection)
            .ok_or(BackendError::NotFound(NamespaceKind::Collection))?;
        let mut indexes = vec![IndexSpec::id_index()];
        indexes.extend(entry.indexes.iter().cloned());
        Ok(indexes)
    }

    async fn collection_stats(
        &self,
        db: &str,
        collection: &str,
    ) -> BackendResult<CollectionStats> {
        let client = self.client().await?;
        let table = self.resolve_table(&client, db, collection).await?;
        let qualified = format!("{}.{}", quote_ident(db), quote_ident(&table));
        let sql = format!(
            "SELECT count(*), pg_total_relation_size({}::regclass) FROM {}",
            quote_literal(&qualified),
            qualified
        );
        let row = client
            .query_one(sql.as_str(), &[])
            .await
            .map_err(classify_common)?;
        Ok(CollectionStats {
            count: row.get(0),
            size_bytes: row.get(1),
        })
    }

    async fn database_stats(&self, db: &str) -> BackendResult<DatabaseStats> {
        let client = self.client().await?;
        let settings = read_settings(&client, db).await?;
        let mut stats = DatabaseStats {
            collections: settings.collections.len() as i64,
            ..Default::default()
        };
        for entry in settings.collections.values() {
            let qualified = format!("{}.{}", quote_ident(db), quote_ident(&entry.table));
            let sql = format!(
                "SELECT count(*), pg_total_relation_size({}::regclass) FROM {}",
                quote_literal(&qualified),
                qualified
            );
            let row = client
                .query_one(sql.as_str(), &[])
                .await
                .map_err(classify_common)?;
            let count: i64 = row.get(0);
            let size: i64 = row.get(1);
            stats.objects += count;
            stats.size_bytes += size;
        }
        Ok(stats)
    }

    async fn ping(&self) -> BackendResult<()> {
        let client = self.client().await?;
        client
            .query_one("SELECT 1", &[])
            .await
            .map_err(classify_common)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_map_unchanged() {
        assert_eq!(table_name_for("users"), "users");
        assert_eq!(table_name_for("audit_log_2024"), "audit_log_2024");
    }

    #[test]
    fn mangled_names_get_a_suffix() {
        let mapped = table_name_for("Users");
        assert!(mapped.starts_with("users_"));
        assert_eq!(mapped.len(), "users".len() + 9);
        // Deterministic across calls.
        assert_eq!(mapped, table_name_for("Users"));
        // Distinct originals that sanitize alike stay distinct.
        assert_ne!(table_name_for("a-b"), table_name_for("a_b"));
    }

    #[test]
    fn long_names_stay_within_identifier_limits() {
        let long = "x".repeat(200);
        let mapped = table_name_for(&long);
        assert!(mapped.len() <= TABLE_NAME_MAX);
    }

    #[test]
    fn reserved_prefix_cannot_shadow_the_settings_table() {
        let mapped = table_name_for("_ferretdb_settings");
        assert_ne!(mapped, SETTINGS_TABLE);
        assert_eq!(mapped, table_name_for("_ferretdb_settings"));
    }

    #[test]
    fn identifier_quoting() {
        assert_eq!(quote_ident("plain"), "\"plain\"");
        assert_eq!(quote_ident("we\"ird"), "\"we\"\"ird\"");
        assert_eq!(quote_literal("o'clock"), "'o''clock'");
    }

    #[test]
    fn index_sql_shape() {
        let spec = IndexSpec {
            name: "a_1_b_-1".to_string(),
            keys: vec![
                crate::backend::IndexKey {
                    field: "a".to_string(),
                    descending: false,
                },
                crate::backend::IndexKey {
                    field: "b".to_string(),
                    descending: true,
                },
            ],
            unique: true,
        };
        let sql = create_index_sql("db1", "tbl", &spec);
        assert!(sql.starts_with("CREATE UNIQUE INDEX"));
        assert!(sql.contains("(_jsonb->'a') ASC"));
        assert!(sql.contains("(_jsonb->'b') DESC"));
        assert!(sql.contains("\"db1\".\"tbl\""));
    }

    #[test]
    fn id_index_sql_matches_storage_contract() {
        let sql = create_index_sql("db1", "users", &IndexSpec::id_index());
        assert!(sql.contains("UNIQUE"));
        assert!(sql.contains("(_jsonb->'_id')"));
    }
}
