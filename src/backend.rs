/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FerroDB - MongoDB wire-compatible proxy for PostgreSQL
 * Built with Rust for superior performance and reliability
 *
 * @file backend.rs
 * @brief Storage backend interface shared by all backends
 */

use std::sync::OnceLock;

use async_trait::async_trait;
use bson::{Bson, Document};
use regex::Regex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reserved prefix for server-internal names; user databases, collections
/// and the settings table itself live behind it.
pub const RESERVED_PREFIX: &str = "_ferretdb_";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NamespaceKind {
    Database,
    Collection,
    Document,
    Index,
}

impl std::fmt::Display for NamespaceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            NamespaceKind::Database => "database",
            NamespaceKind::Collection => "collection",
            NamespaceKind::Document => "document",
            NamespaceKind::Index => "index",
        };
        f.write_str(name)
    }
}

/// Classified backend failures. Handlers map the first four onto MongoDB
/// error codes, retry `Retryable`, and wrap `Unclassified` as InternalError.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("{0} not found")]
    NotFound(NamespaceKind),

    #[error("{0} already exists")]
    AlreadyExists(NamespaceKind),

    #[error("duplicate key violation")]
    DuplicateKey,

    #[error("invalid name: {0}")]
    InvalidName(String),

    #[error("retryable failure: {0}")]
    Retryable(String),

    #[error("backend failure: {0}")]
    Unclassified(String),
}

impl BackendError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, BackendError::Retryable(_))
    }
}

pub type BackendResult<T> = std::result::Result<T, BackendError>;

/// Filter handed to the backend for pushdown. The backend translates what it
/// can into its native query language and reports whether the translation
/// was complete.
#[derive(Debug, Clone, Default)]
pub struct QueryParams {
    pub filter: Document,
    /// Applied by the backend only when its filter translation is complete.
    pub limit: Option<i64>,
}

/// Materialized query result plus the pushdown completeness flag. When the
/// flag is false the caller must re-apply the full filter in memory.
#[derive(Debug)]
pub struct QueryResult {
    pub documents: Vec<Document>,
    pub pushdown_complete: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexKey {
    pub field: String,
    pub descending: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct IndexSpec {
    pub name: String,
    pub keys: Vec<IndexKey>,
    #[serde(default)]
    pub unique: bool,
}

impl IndexSpec {
    /// The implicit primary-key index every collection carries.
    pub fn id_index() -> Self {
        Self {
            name: "_id_".to_string(),
            keys: vec![IndexKey {
                field: "_id".to_string(),
                descending: false,
            }],
            unique: true,
        }
    }

    /// Reply shape used by `listIndexes` and `createIndexes`.
    pub fn to_document(&self) -> Document {
        let mut key = Document::new();
        for k in &self.keys {
            key.insert(k.field.clone(), if k.descending { -1i32 } else { 1i32 });
        }
        let mut doc = Document::new();
        doc.insert("v", 2i32);
        doc.insert("key", key);
        doc.insert("name", self.name.clone());
        if self.unique && self.name != "_id_" {
            doc.insert("unique", true);
        }
        doc
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CollectionStats {
    pub count: i64,
    pub size_bytes: i64,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseStats {
    pub collections: i64,
    pub objects: i64,
    pub size_bytes: i64,
}

/// Capability surface the command handlers depend on. Each backend is a
/// value implementing this record; handlers never see SQL.
#[async_trait]
pub trait Backend: Send + Sync {
    async fn list_databases(&self) -> BackendResult<Vec<String>>;

    async fn create_database(&self, db: &str) -> BackendResult<()>;

    async fn create_database_if_not_exists(&self, db: &str) -> BackendResult<()>;

    async fn drop_database(&self, db: &str) -> BackendResult<()>;

    async fn list_collections(&self, db: &str) -> BackendResult<Vec<String>>;

    async fn create_collection(&self, db: &str, collection: &str) -> BackendResult<()>;

    async fn create_collection_if_not_exists(&self, db: &str, collection: &str)
        -> BackendResult<()>;

    async fn drop_collection(&self, db: &str, collection: &str) -> BackendResult<()>;

    async fn insert_document(
        &self,
        db: &str,
        collection: &str,
        document: &Document,
    ) -> BackendResult<()>;

    async fn query_documents(
        &self,
        db: &str,
        collection: &str,
        params: &QueryParams,
    ) -> BackendResult<QueryResult>;

    async fn update_document(
        &self,
        db: &str,
        collection: &str,
        id: &Bson,
        document: &Document,
    ) -> BackendResult<()>;

    async fn delete_document(&self, db: &str, collection: &str, id: &Bson) -> BackendResult<()>;

    /// Returns false when an identical index already exists.
    async fn create_index(
        &self,
        db: &str,
        collection: &str,
        index: &IndexSpec,
    ) -> BackendResult<bool>;

    async fn drop_index(&self, db: &str, collection: &str, name: &str) -> BackendResult<()>;

    async fn list_indexes(&self, db: &str, collection: &str) -> BackendResult<Vec<IndexSpec>>;

    async fn collection_stats(&self, db: &str, collection: &str)
        -> BackendResult<CollectionStats>;

    async fn database_stats(&self, db: &str) -> BackendResult<DatabaseStats>;

    async fn ping(&self) -> BackendResult<()>;
}

fn database_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-z_-][a-z0-9_-]{0,62}$").expect("static regex"))
}

fn collection_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[a-zA-Z_-][a-zA-Z0-9._-]{0,119}$").expect("static regex"))
}

/// Validate a database name before any backend work happens. `public` is
/// rejected outright: PostgreSQL's default schema pre-exists in every
/// database, so it can never be created (and would half-initialize without
/// a settings table).
pub fn validate_database_name(name: &str) -> BackendResult<()> {
    if name == "public"
        || name.starts_with(RESERVED_PREFIX)
        || !database_name_re().is_match(name)
    {
        return Err(BackendError::InvalidName(format!(
            "invalid database name: '{name}'"
        )));
    }
    Ok(())
}

/// Validate a collection name before any backend work happens.
pub fn validate_collection_name(name: &str) -> BackendResult<()> {
    if name.starts_with(RESERVED_PREFIX)
        || name.starts_with("system.")
        || !collection_name_re().is_match(name)
    {
        return Err(BackendError::InvalidName(format!(
            "invalid collection name: '{name}'"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_names() {
        assert!(validate_database_name("test").is_ok());
        assert!(validate_database_name("my_app-1").is_ok());
        assert!(validate_database_name("_private").is_ok());

        assert!(validate_database_name("").is_err());
        assert!(validate_database_name("Uppercase").is_err());
        assert!(validate_database_name("1starts-with-digit").is_err());
        assert!(validate_database_name("has space").is_err());
        assert!(validate_database_name(&"x".repeat(64)).is_err());
        assert!(validate_database_name("_ferretdb_x").is_err());
        assert!(validate_database_name("public").is_err());
    }

    #[test]
    fn collection_names() {
        assert!(validate_collection_name("users").is_ok());
        assert!(validate_collection_name("Users.archive-2024").is_ok());

        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("1bad").is_err());
        assert!(validate_collection_name("_ferretdb_settings").is_err());
        assert!(validate_collection_name("system.views").is_err());
        assert!(validate_collection_name(&"c".repeat(121)).is_err());
    }

    #[test]
    fn id_index_document_shape() {
        let doc = IndexSpec::id_index().to_document();
        assert_eq!(doc.get_i32("v").unwrap(), 2);
        assert_eq!(doc.get_str("name").unwrap(), "_id_");
        assert_eq!(
            doc.get_document("key").unwrap(),
            &bson::doc! { "_id": 1i32 }
        );
        assert!(doc.get("unique").is_none());
    }
}
