//! Domain types shared by the engine, the components and both stores.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::ids::new_v7;

// =============================================================================
// VOCABULARY
// =============================================================================

/// A named grouping that scopes one tree of terms (e.g. "Categories").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Vocabulary {
    pub id: Uuid,
    /// Unique slug; the scope key for tree queries.
    pub alias: String,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Allowed content type aliases, in preference order.
    #[serde(default)]
    pub types: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Request for creating a vocabulary.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CreateVocabularyRequest {
    pub alias: String,
    pub title: String,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub types: Vec<String>,
}

impl Vocabulary {
    /// Build a vocabulary row from an already validated request.
    pub fn from_request(req: CreateVocabularyRequest) -> Self {
        let now = Utc::now();
        Self {
            id: new_v7(),
            alias: req.alias,
            title: req.title,
            description: req.description,
            types: req.types,
            created_at: now,
            updated_at: now,
        }
    }
}

// =============================================================================
// TERM
// =============================================================================

/// A reusable labeled entity, independent of any tree position.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Term {
    pub id: Uuid,
    pub name: String,
    pub slug: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Caller-supplied term fields, as received from a form or JSON body.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TermAttributes {
    #[serde(default)]
    pub name: String,
    /// Derived from `name` when omitted.
    #[serde(default)]
    pub slug: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
}

impl TermAttributes {
    pub fn named(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    pub fn with_slug(mut self, slug: impl Into<String>) -> Self {
        self.slug = Some(slug.into());
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }
}

/// Term fields after validation: trimmed, slug resolved.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidTerm {
    pub name: String,
    pub slug: String,
    pub description: Option<String>,
}

impl Term {
    pub fn create(fields: ValidTerm) -> Self {
        let now = Utc::now();
        Self {
            id: new_v7(),
            name: fields.name,
            slug: fields.slug,
            description: fields.description,
            created_at: now,
            updated_at: now,
        }
    }

    /// Copy of this term with new field values and a fresh `updated_at`.
    pub fn updated(&self, fields: ValidTerm) -> Self {
        Self {
            id: self.id,
            name: fields.name,
            slug: fields.slug,
            description: fields.description,
            created_at: self.created_at,
            updated_at: Utc::now(),
        }
    }
}

// =============================================================================
// TAXONOMY (TREE NODE)
// =============================================================================

/// Attachment of a term to one vocabulary tree.
///
/// `lft`/`rgt` are nested-set boundaries: a node `d` lies in the subtree of
/// `a` iff `a.lft < d.lft && d.rgt < a.rgt`. This is the persisted layout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Taxonomy {
    pub id: Uuid,
    pub term_id: Uuid,
    pub vocabulary_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    pub lft: i64,
    pub rgt: i64,
}

impl Taxonomy {
    /// Number of boundary slots the subtree rooted here occupies.
    #[inline]
    pub fn width(&self) -> i64 {
        self.rgt - self.lft + 1
    }

    /// Number of descendants.
    #[inline]
    pub fn descendant_count(&self) -> usize {
        ((self.rgt - self.lft - 1) / 2) as usize
    }

    /// Whether `other` lies strictly inside this node's subtree.
    #[inline]
    pub fn contains(&self, other: &Taxonomy) -> bool {
        self.lft < other.lft && other.rgt < self.rgt
    }
}

/// Options for tree projections.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeOptions {
    /// Key nodes by taxonomy id instead of term id.
    #[serde(default)]
    pub taxonomy_id_as_key: bool,
}

impl TreeOptions {
    pub fn keyed_by_taxonomy() -> Self {
        Self {
            taxonomy_id_as_key: true,
        }
    }

    pub fn keyed_by_term() -> Self {
        Self {
            taxonomy_id_as_key: false,
        }
    }
}

/// One row of a pre-order tree projection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeNode {
    /// Taxonomy id or term id, per [`TreeOptions::taxonomy_id_as_key`].
    pub id: Uuid,
    pub taxonomy_id: Uuid,
    pub term_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<Uuid>,
    /// 0 for roots.
    pub depth: usize,
    pub lft: i64,
    pub rgt: i64,
    pub name: String,
    pub slug: String,
}

/// What happens to the descendants of a detached node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DetachPolicy {
    /// Remove the whole subtree.
    CascadeDelete,
    /// Hand the children to the removed node's parent, in their current order.
    PromoteChildren,
}

impl std::fmt::Display for DetachPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::CascadeDelete => write!(f, "cascade_delete"),
            Self::PromoteChildren => write!(f, "promote_children"),
        }
    }
}

/// Direction of a sibling reorder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveDirection {
    Up,
    Down,
}

impl std::fmt::Display for MoveDirection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Up => write!(f, "up"),
            Self::Down => write!(f, "down"),
        }
    }
}

impl std::str::FromStr for MoveDirection {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "up" => Ok(Self::Up),
            "down" => Ok(Self::Down),
            _ => Err(format!("Invalid move direction: {}", s)),
        }
    }
}

// =============================================================================
// SERVICE RESULTS
// =============================================================================

/// Everything the term listing of a vocabulary needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TermIndex {
    pub vocabulary: Vocabulary,
    /// Pre-order, keyed by term id.
    pub terms: Vec<TreeNode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_type: Option<String>,
}

/// Outcome of removing a term from a vocabulary.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Removal {
    /// Nodes deleted from the vocabulary tree (the term's node first).
    pub detached: Vec<Taxonomy>,
    /// Terms deleted because no vocabulary referenced them any more.
    pub deleted_terms: Vec<Uuid>,
}
