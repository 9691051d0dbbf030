//! # taxa-core
//!
//! Ordered taxonomy trees: vocabularies, reusable terms, and the nested-set
//! trees that place terms inside each vocabulary.
//!
//! Callers talk to [`TaxonomyService`]. It is generic over a
//! [`TaxonomyStore`] backend; this crate ships [`MemoryStore`], and
//! `taxa-db` provides the PostgreSQL one.

pub mod error;
pub mod ids;
pub mod logging;
pub mod memory;
pub mod models;
pub mod nested_set;
pub mod registry;
pub mod service;
pub mod terms;
pub mod traits;
pub mod tree;
pub mod validation;

// Re-export commonly used types at crate root
pub use error::{Error, ErrorKind, FieldErrors, Result};
pub use ids::new_v7;
pub use memory::MemoryStore;
pub use models::*;
pub use nested_set::{TreeDiff, VocabularyTree};
pub use registry::{default_type, VocabularyRegistry};
pub use service::TaxonomyService;
pub use terms::TermStore;
pub use traits::*;
pub use tree::TaxonomyTree;
pub use validation::{slugify, DefaultTermValidator, TermValidator};
