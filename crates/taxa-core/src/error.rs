//! Error types for taxa.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Result type alias using taxa's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Field-level validation failures, keyed by field name.
///
/// Values are stable message codes (`required`, `too_long`, `invalid_format`,
/// `taken`); turning them into prose is the caller's job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldErrors(BTreeMap<String, Vec<String>>);

/// Message code: the field is missing or blank.
pub const REQUIRED: &str = "required";
/// Message code: the field exceeds its maximum length.
pub const TOO_LONG: &str = "too_long";
/// Message code: the field does not match the expected format.
pub const INVALID_FORMAT: &str = "invalid_format";
/// Message code: the value is already used by another record.
pub const TAKEN: &str = "taken";

impl FieldErrors {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shorthand for a single failing field.
    pub fn single(field: &str, code: &str) -> Self {
        let mut errors = Self::new();
        errors.add(field, code);
        errors
    }

    pub fn add(&mut self, field: &str, code: &str) {
        self.0
            .entry(field.to_string())
            .or_default()
            .push(code.to_string());
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, field: &str) -> Option<&[String]> {
        self.0.get(field).map(Vec::as_slice)
    }

    pub fn fields(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    /// `Ok(())` when nothing was recorded, otherwise `Error::Validation`.
    pub fn into_result(self) -> Result<()> {
        if self.is_empty() {
            Ok(())
        } else {
            Err(Error::Validation(self))
        }
    }
}

impl fmt::Display for FieldErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (field, codes) in &self.0 {
            if !first {
                f.write_str("; ")?;
            }
            first = false;
            write!(f, "{}: {}", field, codes.join(", "))?;
        }
        Ok(())
    }
}

/// Coarse error classification for the calling layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    Conflict,
    Validation,
    InvalidOperation,
    Internal,
}

/// Core error type for taxa operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Database operation failed (wraps sqlx::Error)
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// Vocabulary not found (also returned for the nil id)
    #[error("Vocabulary not found: {0}")]
    VocabularyNotFound(Uuid),

    /// No vocabulary carries this alias
    #[error("Vocabulary not found: {0}")]
    VocabularyAliasNotFound(String),

    /// Term not found
    #[error("Term not found: {0}")]
    TermNotFound(Uuid),

    /// Taxonomy node not found
    #[error("Taxonomy not found: {0}")]
    TaxonomyNotFound(Uuid),

    /// The term has no node in the vocabulary
    #[error("Term {term_id} is not attached to vocabulary {vocabulary_id}")]
    NotAttached { term_id: Uuid, vocabulary_id: Uuid },

    /// Request collides with existing state
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Attribute validation failed
    #[error("Validation failed: {0}")]
    Validation(FieldErrors),

    /// Structurally illegal request (e.g. reparent under a descendant)
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    /// Stored nested-set data violates the tree invariants
    #[error("Corrupted tree: {0}")]
    Corrupted(String),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::VocabularyNotFound(_)
            | Error::VocabularyAliasNotFound(_)
            | Error::TermNotFound(_)
            | Error::TaxonomyNotFound(_)
            | Error::NotAttached { .. } => ErrorKind::NotFound,
            Error::Conflict(_) => ErrorKind::Conflict,
            Error::Validation(_) => ErrorKind::Validation,
            Error::InvalidOperation(_) => ErrorKind::InvalidOperation,
            Error::Database(_)
            | Error::Corrupted(_)
            | Error::Serialization(_)
            | Error::Config(_)
            | Error::Internal(_) => ErrorKind::Internal,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.kind() == ErrorKind::NotFound
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Serialization(e.to_string())
    }
}
