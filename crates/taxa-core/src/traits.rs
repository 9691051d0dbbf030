//! Storage seam for taxa.
//!
//! [`TaxonomyStore`] is the one trait a backend implements. Plain reads and
//! single-row term writes are ordinary methods; anything that touches a
//! vocabulary tree goes through [`TaxonomyStore::write`], a unit of work
//! that holds the vocabulary's exclusive lock, runs a closure against a
//! working copy and persists the result atomically.

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::*;
use crate::nested_set::{TreeDiff, VocabularyTree};

// =============================================================================
// UNIT OF WORK
// =============================================================================

/// Working state handed to a [`TaxonomyStore::write`] closure.
///
/// Everything staged here is persisted together or not at all.
#[derive(Debug)]
pub struct ScopedWrite {
    vocabulary: Vocabulary,
    tree: VocabularyTree,
    /// First integrity violation of the loaded rows, if any.
    damage: Option<String>,
    new_terms: Vec<Term>,
    updated_terms: Vec<Term>,
    prune: Vec<Uuid>,
}

impl ScopedWrite {
    /// Wrap a freshly loaded (possibly damaged) tree.
    pub fn new(vocabulary: Vocabulary, tree: VocabularyTree) -> Self {
        let damage = tree.verify().err().map(|e| e.to_string());
        Self {
            vocabulary,
            tree,
            damage,
            new_terms: Vec::new(),
            updated_terms: Vec::new(),
            prune: Vec::new(),
        }
    }

    pub fn vocabulary(&self) -> &Vocabulary {
        &self.vocabulary
    }

    /// The working tree. Fails with `Corrupted` when the stored rows were
    /// damaged and have not been recovered in this unit.
    pub fn tree(&self) -> Result<&VocabularyTree> {
        match &self.damage {
            Some(reason) => Err(Error::Corrupted(reason.clone())),
            None => Ok(&self.tree),
        }
    }

    pub fn tree_mut(&mut self) -> Result<&mut VocabularyTree> {
        match &self.damage {
            Some(reason) => Err(Error::Corrupted(reason.clone())),
            None => Ok(&mut self.tree),
        }
    }

    /// Rebuild the working tree from parent links and clear any damage.
    /// Returns the number of rows whose position changed.
    pub fn recover_tree(&mut self) -> usize {
        let before = self.tree.clone();
        self.tree.recover();
        self.damage = None;
        self.tree.diff(&before).rows_changed()
    }

    /// Stage a new term row, inserted before any node that references it.
    pub fn stage_term(&mut self, term: Term) {
        self.new_terms.push(term);
    }

    /// Stage an update of an existing term row.
    pub fn stage_term_update(&mut self, term: Term) {
        self.updated_terms.push(term);
    }

    /// Delete this term at commit time if no vocabulary references it any more.
    pub fn prune_if_orphaned(&mut self, term_id: Uuid) {
        if !self.prune.contains(&term_id) {
            self.prune.push(term_id);
        }
    }

    /// Close the unit: check the working tree and diff it against `before`.
    pub fn finish(self, before: &VocabularyTree) -> Result<ScopedChanges> {
        if let Some(reason) = self.damage {
            return Err(Error::Corrupted(reason));
        }
        self.tree.verify()?;
        let diff = self.tree.diff(before);
        Ok(ScopedChanges {
            vocabulary_id: self.vocabulary.id,
            tree: self.tree,
            diff,
            new_terms: self.new_terms,
            updated_terms: self.updated_terms,
            prune: self.prune,
        })
    }
}

/// Everything a backend must persist for one committed unit of work.
#[derive(Debug, Clone)]
pub struct ScopedChanges {
    pub vocabulary_id: Uuid,
    /// Final state of the tree.
    pub tree: VocabularyTree,
    pub diff: TreeDiff,
    pub new_terms: Vec<Term>,
    pub updated_terms: Vec<Term>,
    /// Candidates for deletion once the diff is applied.
    pub prune: Vec<Uuid>,
}

impl ScopedChanges {
    pub fn is_empty(&self) -> bool {
        self.diff.is_empty() && self.new_terms.is_empty() && self.updated_terms.is_empty()
    }
}

/// Result of a committed unit of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Committed<R> {
    pub value: R,
    /// Terms deleted because the unit left them without any attachment.
    pub pruned_terms: Vec<Uuid>,
}

// =============================================================================
// STORE TRAIT
// =============================================================================

/// Backend for vocabularies, terms and taxonomy trees.
///
/// Implementations must serialize `write` calls per vocabulary, let writes
/// to different vocabularies proceed independently, and never let a reader
/// observe a partially applied unit.
#[async_trait]
pub trait TaxonomyStore: Send + Sync {
    // ── vocabularies ──────────────────────────────────────────────────────

    /// Get a vocabulary by ID.
    async fn get_vocabulary(&self, id: Uuid) -> Result<Option<Vocabulary>>;

    /// Get a vocabulary by alias.
    async fn get_vocabulary_by_alias(&self, alias: &str) -> Result<Option<Vocabulary>>;

    /// List all vocabularies ordered by alias.
    async fn list_vocabularies(&self) -> Result<Vec<Vocabulary>>;

    /// Insert a vocabulary. A taken alias is a `Conflict`.
    async fn insert_vocabulary(&self, vocabulary: &Vocabulary) -> Result<()>;

    /// Delete a vocabulary with all of its nodes; returns pruned term ids.
    async fn delete_vocabulary(&self, id: Uuid) -> Result<Vec<Uuid>>;

    // ── terms ─────────────────────────────────────────────────────────────

    /// Get a term by ID.
    async fn get_term(&self, id: Uuid) -> Result<Option<Term>>;

    /// Get the terms among `ids` that exist, in no particular order.
    async fn get_terms(&self, ids: &[Uuid]) -> Result<Vec<Term>>;

    /// Insert a term. A taken slug is a `Validation` error on `slug`.
    async fn insert_term(&self, term: &Term) -> Result<()>;

    /// Overwrite a term row.
    async fn update_term(&self, term: &Term) -> Result<()>;

    /// Delete a term; `Conflict` while any vocabulary still references it.
    async fn delete_term(&self, id: Uuid) -> Result<()>;

    /// Number of vocabularies the term is attached to.
    async fn attachment_count(&self, term_id: Uuid) -> Result<usize>;

    // ── trees ─────────────────────────────────────────────────────────────

    /// Raw node rows of a vocabulary, unchecked.
    async fn load_rows(&self, vocabulary_id: Uuid) -> Result<Vec<Taxonomy>>;

    /// Node rows of a vocabulary and the terms they reference, read from
    /// one snapshot: no unit commits between the two reads.
    async fn load_labeled_rows(&self, vocabulary_id: Uuid) -> Result<(Vec<Taxonomy>, Vec<Term>)>;

    /// Find a node in any vocabulary.
    async fn get_taxonomy(&self, id: Uuid) -> Result<Option<Taxonomy>>;

    /// Consistent, verified snapshot of a vocabulary tree.
    async fn load_tree(&self, vocabulary_id: Uuid) -> Result<VocabularyTree> {
        let rows = self.load_rows(vocabulary_id).await?;
        VocabularyTree::from_rows(vocabulary_id, rows)
    }

    /// Run `f` as one atomic unit under the vocabulary's exclusive lock.
    ///
    /// An `Err` from `f`, a failed integrity check, or a failure while
    /// persisting leaves stored state exactly as it was.
    async fn write<R, F>(&self, vocabulary_id: Uuid, f: F) -> Result<Committed<R>>
    where
        R: Send,
        F: FnOnce(&mut ScopedWrite) -> Result<R> + Send;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::new_v7;

    fn vocabulary() -> Vocabulary {
        Vocabulary::from_request(CreateVocabularyRequest {
            alias: "category".into(),
            title: "Category".into(),
            ..Default::default()
        })
    }

    #[test]
    fn test_scoped_write_finish_diffs_against_before() {
        let vocab = vocabulary();
        let before = VocabularyTree::empty(vocab.id);
        let mut scope = ScopedWrite::new(vocab.clone(), before.clone());

        let term_id = new_v7();
        scope.tree_mut().unwrap().attach(new_v7(), term_id, None).unwrap();
        scope.prune_if_orphaned(term_id);
        scope.prune_if_orphaned(term_id);

        let changes = scope.finish(&before).unwrap();
        assert_eq!(changes.vocabulary_id, vocab.id);
        assert_eq!(changes.diff.inserted.len(), 1);
        assert_eq!(changes.prune, vec![term_id]);
        assert!(!changes.is_empty());
    }

    #[test]
    fn test_scoped_write_refuses_damaged_tree_until_recovered() {
        let vocab = vocabulary();
        let rows = vec![Taxonomy {
            id: new_v7(),
            term_id: new_v7(),
            vocabulary_id: vocab.id,
            parent_id: None,
            lft: 3,
            rgt: 9,
        }];
        let before = VocabularyTree::from_rows_unchecked(vocab.id, rows);

        let mut scope = ScopedWrite::new(vocab.clone(), before.clone());
        assert!(matches!(scope.tree(), Err(Error::Corrupted(_))));
        assert!(matches!(scope.tree_mut(), Err(Error::Corrupted(_))));

        assert_eq!(scope.recover_tree(), 1);
        let root = scope.tree().unwrap().nodes()[0];
        assert_eq!((root.lft, root.rgt), (1, 2));

        let changes = scope.finish(&before).unwrap();
        assert_eq!(changes.diff.updated.len(), 1);
    }

    #[test]
    fn test_scoped_write_unrecovered_damage_fails_finish() {
        let vocab = vocabulary();
        let rows = vec![Taxonomy {
            id: new_v7(),
            term_id: new_v7(),
            vocabulary_id: vocab.id,
            parent_id: None,
            lft: 2,
            rgt: 1,
        }];
        let before = VocabularyTree::from_rows_unchecked(vocab.id, rows);
        let scope = ScopedWrite::new(vocab, before.clone());
        assert!(matches!(scope.finish(&before), Err(Error::Corrupted(_))));
    }
}
