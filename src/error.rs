/*
 * Copyright (c) 2025 pgElephant. All rights reserved.
 *
 * FerroDB - MongoDB wire-compatible proxy for PostgreSQL
 * Built with Rust for superior performance and reliability
 *
 * @file error.rs
 * @brief FerroDB error handling
 */

use bson::{doc, Document};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum FerroDBError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("BSON error: {0}")]
    Bson(#[from] bson::de::Error),

    #[error("BSON serialization error: {0}")]
    BsonSerialization(#[from] bson::ser::Error),

    #[error("Wire protocol error: {0}")]
    WireProtocol(String),

    #[error("Network error: {0}")]
    Network(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Connection pool error: {0}")]
    ConnectionPool(String),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, FerroDBError>;

/// MongoDB canonical error codes, limited to the ones this server emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    InternalError = 1,
    BadValue = 2,
    FailedToParse = 9,
    TypeMismatch = 14,
    IllegalOperation = 20,
    InvalidBson = 22,
    NamespaceNotFound = 26,
    IndexNotFound = 27,
    ConflictingUpdateOperators = 40,
    CursorNotFound = 43,
    NamespaceExists = 48,
    MaxTimeMsExpired = 50,
    CommandNotFound = 59,
    InvalidOptions = 72,
    InvalidNamespace = 73,
    IndexOptionsConflict = 85,
    WriteConflict = 112,
    DuplicateKey = 11000,
    BsonObjectTooLarge = 10334,
}

impl ErrorCode {
    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn code_name(self) -> &'static str {
        match self {
            ErrorCode::InternalError => "InternalError",
            ErrorCode::BadValue => "BadValue",
            ErrorCode::FailedToParse => "FailedToParse",
            ErrorCode::TypeMismatch => "TypeMismatch",
            ErrorCode::IllegalOperation => "IllegalOperation",
            ErrorCode::InvalidBson => "InvalidBSON",
            ErrorCode::NamespaceNotFound => "NamespaceNotFound",
            ErrorCode::IndexNotFound => "IndexNotFound",
            ErrorCode::ConflictingUpdateOperators => "ConflictingUpdateOperators",
            ErrorCode::CursorNotFound => "CursorNotFound",
            ErrorCode::NamespaceExists => "NamespaceExists",
            ErrorCode::MaxTimeMsExpired => "MaxTimeMSExpired",
            ErrorCode::CommandNotFound => "CommandNotFound",
            ErrorCode::InvalidOptions => "InvalidOptions",
            ErrorCode::InvalidNamespace => "InvalidNamespace",
            ErrorCode::IndexOptionsConflict => "IndexOptionsConflict",
            ErrorCode::WriteConflict => "WriteConflict",
            ErrorCode::DuplicateKey => "DuplicateKey",
            ErrorCode::BsonObjectTooLarge => "BSONObjectTooLarge",
        }
    }
}

/// A command-level failure, reported to the client as `ok: 0` with the
/// canonical `code`/`codeName`/`errmsg` triple. The connection stays alive.
#[derive(Debug, Clone)]
pub struct CommandError {
    pub code: ErrorCode,
    pub message: String,
}

impl CommandError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn bad_value(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::BadValue, message)
    }

    pub fn type_mismatch(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::TypeMismatch, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(ErrorCode::InternalError, message)
    }

    pub fn to_document(&self) -> Document {
        doc! {
            "ok": 0.0,
            "errmsg": self.message.clone(),
            "code": self.code.code(),
            "codeName": self.code.code_name(),
        }
    }
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {}",
            self.code.code_name(),
            self.code.code(),
            self.message
        )
    }
}

impl std::error::Error for CommandError {}

pub type CommandResult<T> = std::result::Result<T, CommandError>;
