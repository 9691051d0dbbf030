//! In-memory [`TaxonomyStore`] for tests and embedded use.
//!
//! Each vocabulary owns its own `RwLock` around its tree, so writers on
//! different vocabularies never wait on each other while writers on one
//! vocabulary are serialized. A unit of work mutates a copy of the tree and
//! swaps it in only after every check passed, so readers see either the old
//! tree or the new one.
//!
//! Lock order: vocabulary map → vocabulary tree → term table. The term
//! table lock is never held while acquiring a tree lock.
//!
//! ## Usage
//!
//! ```rust
//! use std::sync::Arc;
//! use taxa_core::{CreateVocabularyRequest, MemoryStore, TaxonomyService, TermAttributes};
//!
//! # tokio_test_block(async {
//! let service = TaxonomyService::new(Arc::new(MemoryStore::new()));
//! let vocabulary = service
//!     .vocabularies()
//!     .create(CreateVocabularyRequest {
//!         alias: "categories".into(),
//!         title: "Categories".into(),
//!         ..Default::default()
//!     })
//!     .await
//!     .unwrap();
//! let term = service
//!     .add_term(vocabulary.id, TermAttributes::named("Sports"), None)
//!     .await
//!     .unwrap();
//! assert_eq!(term.slug, "sports");
//! # });
//! # fn tokio_test_block<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::error::{Error, FieldErrors, Result, TAKEN};
use crate::models::{Taxonomy, Term, Vocabulary};
use crate::nested_set::VocabularyTree;
use crate::traits::{Committed, ScopedChanges, ScopedWrite, TaxonomyStore};

/// One vocabulary and its tree. `None` marks a vocabulary deleted while a
/// writer still held a handle to it.
struct VocabularySlot {
    vocabulary: Vocabulary,
    tree: RwLock<Option<VocabularyTree>>,
}

#[derive(Default)]
struct TermTable {
    terms: HashMap<Uuid, Term>,
    slugs: HashMap<String, Uuid>,
    /// Number of vocabularies each term is attached to.
    attachments: HashMap<Uuid, usize>,
}

impl TermTable {
    fn slug_owner(&self, slug: &str) -> Option<Uuid> {
        self.slugs.get(slug).copied()
    }

    fn insert(&mut self, term: Term) {
        self.slugs.insert(term.slug.clone(), term.id);
        self.terms.insert(term.id, term);
    }

    fn replace(&mut self, term: Term) {
        if let Some(old) = self.terms.get(&term.id) {
            self.slugs.remove(&old.slug);
        }
        self.insert(term);
    }

    fn remove(&mut self, id: Uuid) -> Option<Term> {
        let term = self.terms.remove(&id)?;
        self.slugs.remove(&term.slug);
        self.attachments.remove(&id);
        Some(term)
    }

    fn count(&self, id: Uuid) -> usize {
        self.attachments.get(&id).copied().unwrap_or(0)
    }

    /// Check a unit's term changes without mutating anything.
    fn check(&self, changes: &ScopedChanges) -> Result<()> {
        let mut staged_slugs: HashMap<&str, Uuid> = HashMap::new();
        let mut staged_ids: HashSet<Uuid> = HashSet::new();

        for term in &changes.new_terms {
            if self.terms.contains_key(&term.id) {
                return Err(Error::Conflict(format!("term id {} already in use", term.id)));
            }
            staged_ids.insert(term.id);
        }
        for term in &changes.updated_terms {
            if !self.terms.contains_key(&term.id) {
                return Err(Error::TermNotFound(term.id));
            }
        }
        for term in changes.new_terms.iter().chain(&changes.updated_terms) {
            let stored_owner = self.slug_owner(&term.slug);
            let taken_in_store = stored_owner.is_some_and(|owner| {
                // A slug freed by another staged update is available again.
                owner != term.id
                    && !changes
                        .updated_terms
                        .iter()
                        .any(|u| u.id == owner && u.slug != term.slug)
            });
            let taken_in_unit = staged_slugs
                .insert(term.slug.as_str(), term.id)
                .is_some_and(|other| other != term.id);
            if taken_in_store || taken_in_unit {
                return Err(Error::Validation(FieldErrors::single("slug", TAKEN)));
            }
        }
        for node in &changes.diff.inserted {
            if !self.terms.contains_key(&node.term_id) && !staged_ids.contains(&node.term_id) {
                return Err(Error::TermNotFound(node.term_id));
            }
        }
        Ok(())
    }

    /// Apply a checked unit; returns the pruned term ids.
    fn apply(&mut self, changes: &ScopedChanges) -> Vec<Uuid> {
        for term in &changes.new_terms {
            self.insert(term.clone());
        }
        for term in &changes.updated_terms {
            self.replace(term.clone());
        }
        for node in &changes.diff.inserted {
            *self.attachments.entry(node.term_id).or_default() += 1;
        }
        for node in &changes.diff.deleted {
            self.detach_one(node.term_id);
        }
        self.prune(&changes.prune)
    }

    fn detach_one(&mut self, term_id: Uuid) {
        if let Some(count) = self.attachments.get_mut(&term_id) {
            *count = count.saturating_sub(1);
        }
    }

    fn prune(&mut self, candidates: &[Uuid]) -> Vec<Uuid> {
        let mut pruned = Vec::new();
        for &id in candidates {
            if self.count(id) == 0 && self.remove(id).is_some() {
                pruned.push(id);
            }
        }
        pruned
    }
}

/// In-memory implementation of [`TaxonomyStore`].
#[derive(Default)]
pub struct MemoryStore {
    vocabularies: RwLock<HashMap<Uuid, Arc<VocabularySlot>>>,
    terms: Mutex<TermTable>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn slot(&self, id: Uuid) -> Result<Arc<VocabularySlot>> {
        self.vocabularies
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(Error::VocabularyNotFound(id))
    }

    /// Replace a vocabulary's rows verbatim, bypassing every check.
    ///
    /// Stands in for a table edited by an external tool; pair with
    /// `TaxonomyTree::recover`.
    pub async fn import_rows(&self, vocabulary_id: Uuid, rows: Vec<Taxonomy>) -> Result<()> {
        let slot = self.slot(vocabulary_id).await?;
        let mut guard = slot.tree.write().await;
        let old = guard
            .take()
            .ok_or(Error::VocabularyNotFound(vocabulary_id))?;

        let mut terms = self.terms.lock().await;
        for node in old.nodes() {
            terms.detach_one(node.term_id);
        }
        for node in &rows {
            *terms.attachments.entry(node.term_id).or_default() += 1;
        }
        *guard = Some(VocabularyTree::from_rows_unchecked(vocabulary_id, rows));
        Ok(())
    }
}

#[async_trait]
impl TaxonomyStore for MemoryStore {
    async fn get_vocabulary(&self, id: Uuid) -> Result<Option<Vocabulary>> {
        Ok(self
            .vocabularies
            .read()
            .await
            .get(&id)
            .map(|slot| slot.vocabulary.clone()))
    }

    async fn get_vocabulary_by_alias(&self, alias: &str) -> Result<Option<Vocabulary>> {
        Ok(self
            .vocabularies
            .read()
            .await
            .values()
            .find(|slot| slot.vocabulary.alias == alias)
            .map(|slot| slot.vocabulary.clone()))
    }

    async fn list_vocabularies(&self) -> Result<Vec<Vocabulary>> {
        let mut list: Vec<Vocabulary> = self
            .vocabularies
            .read()
            .await
            .values()
            .map(|slot| slot.vocabulary.clone())
            .collect();
        list.sort_by(|a, b| a.alias.cmp(&b.alias));
        Ok(list)
    }

    async fn insert_vocabulary(&self, vocabulary: &Vocabulary) -> Result<()> {
        let mut map = self.vocabularies.write().await;
        if map.contains_key(&vocabulary.id) {
            return Err(Error::Conflict(format!(
                "vocabulary id {} already in use",
                vocabulary.id
            )));
        }
        if map.values().any(|slot| slot.vocabulary.alias == vocabulary.alias) {
            return Err(Error::Conflict(format!(
                "vocabulary alias '{}' already in use",
                vocabulary.alias
            )));
        }
        map.insert(
            vocabulary.id,
            Arc::new(VocabularySlot {
                vocabulary: vocabulary.clone(),
                tree: RwLock::new(Some(VocabularyTree::empty(vocabulary.id))),
            }),
        );
        Ok(())
    }

    async fn delete_vocabulary(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let slot = self
            .vocabularies
            .write()
            .await
            .remove(&id)
            .ok_or(Error::VocabularyNotFound(id))?;

        let mut guard = slot.tree.write().await;
        let tree = guard.take().ok_or(Error::VocabularyNotFound(id))?;

        let mut terms = self.terms.lock().await;
        let candidates: Vec<Uuid> = tree.nodes().iter().map(|n| n.term_id).collect();
        for term_id in &candidates {
            terms.detach_one(*term_id);
        }
        let pruned = terms.prune(&candidates);
        debug!(
            subsystem = "taxonomy",
            component = "memory_store",
            op = "delete_vocabulary",
            vocabulary_id = %id,
            node_count = tree.len(),
            pruned = pruned.len(),
            "Vocabulary removed"
        );
        Ok(pruned)
    }

    async fn get_term(&self, id: Uuid) -> Result<Option<Term>> {
        Ok(self.terms.lock().await.terms.get(&id).cloned())
    }

    async fn get_terms(&self, ids: &[Uuid]) -> Result<Vec<Term>> {
        let table = self.terms.lock().await;
        Ok(ids
            .iter()
            .filter_map(|id| table.terms.get(id).cloned())
            .collect())
    }

    async fn insert_term(&self, term: &Term) -> Result<()> {
        let mut table = self.terms.lock().await;
        if table.terms.contains_key(&term.id) {
            return Err(Error::Conflict(format!("term id {} already in use", term.id)));
        }
        if table.slug_owner(&term.slug).is_some() {
            return Err(Error::Validation(FieldErrors::single("slug", TAKEN)));
        }
        table.insert(term.clone());
        Ok(())
    }

    async fn update_term(&self, term: &Term) -> Result<()> {
        let mut table = self.terms.lock().await;
        if !table.terms.contains_key(&term.id) {
            return Err(Error::TermNotFound(term.id));
        }
        if table
            .slug_owner(&term.slug)
            .is_some_and(|owner| owner != term.id)
        {
            return Err(Error::Validation(FieldErrors::single("slug", TAKEN)));
        }
        table.replace(term.clone());
        Ok(())
    }

    async fn delete_term(&self, id: Uuid) -> Result<()> {
        let mut table = self.terms.lock().await;
        if !table.terms.contains_key(&id) {
            return Err(Error::TermNotFound(id));
        }
        let count = table.count(id);
        if count > 0 {
            return Err(Error::Conflict(format!(
                "term {} is still attached to {} vocabularies",
                id, count
            )));
        }
        table.remove(id);
        Ok(())
    }

    async fn attachment_count(&self, term_id: Uuid) -> Result<usize> {
        Ok(self.terms.lock().await.count(term_id))
    }

    async fn load_rows(&self, vocabulary_id: Uuid) -> Result<Vec<Taxonomy>> {
        let slot = self.slot(vocabulary_id).await?;
        let guard = slot.tree.read().await;
        guard
            .as_ref()
            .map(|tree| tree.nodes().to_vec())
            .ok_or(Error::VocabularyNotFound(vocabulary_id))
    }

    async fn load_labeled_rows(&self, vocabulary_id: Uuid) -> Result<(Vec<Taxonomy>, Vec<Term>)> {
        let slot = self.slot(vocabulary_id).await?;
        let guard = slot.tree.read().await;
        let tree = guard
            .as_ref()
            .ok_or(Error::VocabularyNotFound(vocabulary_id))?;

        // Tree guard stays held: writers prune terms under the tree write lock.
        let table = self.terms.lock().await;
        let terms = tree
            .nodes()
            .iter()
            .filter_map(|n| table.terms.get(&n.term_id).cloned())
            .collect();
        Ok((tree.nodes().to_vec(), terms))
    }

    async fn get_taxonomy(&self, id: Uuid) -> Result<Option<Taxonomy>> {
        let slots: Vec<Arc<VocabularySlot>> =
            self.vocabularies.read().await.values().cloned().collect();
        for slot in slots {
            let guard = slot.tree.read().await;
            if let Some(node) = guard.as_ref().and_then(|tree| tree.get(id)) {
                return Ok(Some(*node));
            }
        }
        Ok(None)
    }

    async fn write<R, F>(&self, vocabulary_id: Uuid, f: F) -> Result<Committed<R>>
    where
        R: Send,
        F: FnOnce(&mut ScopedWrite) -> Result<R> + Send,
    {
        let slot = self.slot(vocabulary_id).await?;
        let mut guard = slot.tree.write().await;
        let before = guard
            .clone()
            .ok_or(Error::VocabularyNotFound(vocabulary_id))?;

        let mut scope = ScopedWrite::new(slot.vocabulary.clone(), before.clone());
        let value = f(&mut scope)?;
        let changes = scope.finish(&before)?;

        let mut terms = self.terms.lock().await;
        terms.check(&changes)?;
        let pruned_terms = terms.apply(&changes);
        drop(terms);

        let rows_changed = changes.diff.rows_changed();
        *guard = Some(changes.tree);
        debug!(
            subsystem = "taxonomy",
            component = "memory_store",
            op = "write",
            vocabulary_id = %vocabulary_id,
            rows_changed,
            pruned = pruned_terms.len(),
            "Unit of work committed"
        );
        Ok(Committed {
            value,
            pruned_terms,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::new_v7;
    use crate::models::{CreateVocabularyRequest, DetachPolicy, ValidTerm};

    fn vocabulary(alias: &str) -> Vocabulary {
        Vocabulary::from_request(CreateVocabularyRequest {
            alias: alias.into(),
            title: alias.into(),
            ..Default::default()
        })
    }

    fn term(slug: &str) -> Term {
        Term::create(ValidTerm {
            name: slug.into(),
            slug: slug.into(),
            description: None,
        })
    }

    async fn store_with(alias: &str) -> (MemoryStore, Vocabulary) {
        let store = MemoryStore::new();
        let vocab = vocabulary(alias);
        store.insert_vocabulary(&vocab).await.unwrap();
        (store, vocab)
    }

    #[tokio::test]
    async fn test_insert_vocabulary_alias_conflict() {
        let (store, _) = store_with("tags").await;
        let err = store.insert_vocabulary(&vocabulary("tags")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_list_vocabularies_sorted() {
        let (store, _) = store_with("tags").await;
        store.insert_vocabulary(&vocabulary("categories")).await.unwrap();
        let aliases: Vec<String> = store
            .list_vocabularies()
            .await
            .unwrap()
            .into_iter()
            .map(|v| v.alias)
            .collect();
        assert_eq!(aliases, vec!["categories", "tags"]);
    }

    #[tokio::test]
    async fn test_write_commits_terms_and_nodes_together() {
        let (store, vocab) = store_with("category").await;
        let t = term("sports");
        let staged = t.clone();

        let committed = store
            .write(vocab.id, move |scope| {
                let node = scope.tree_mut()?.attach(new_v7(), staged.id, None)?;
                scope.stage_term(staged);
                Ok(node)
            })
            .await
            .unwrap();

        assert_eq!(committed.value.term_id, t.id);
        assert_eq!(store.get_term(t.id).await.unwrap(), Some(t.clone()));
        assert_eq!(store.attachment_count(t.id).await.unwrap(), 1);
        assert_eq!(store.load_tree(vocab.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_write_error_leaves_state_untouched() {
        let (store, vocab) = store_with("category").await;
        let t = term("sports");

        let result: Result<Committed<()>> = store
            .write(vocab.id, move |scope| {
                scope.tree_mut()?.attach(new_v7(), t.id, None)?;
                scope.stage_term(t);
                Err(Error::InvalidOperation("abort".into()))
            })
            .await;

        assert!(result.is_err());
        assert!(store.load_rows(vocab.id).await.unwrap().is_empty());
        assert!(store.get_terms(&[]).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_slug_collision_rolls_back_nodes() {
        let (store, vocab) = store_with("category").await;
        store.insert_term(&term("sports")).await.unwrap();
        let dup = term("sports");

        let err = store
            .write(vocab.id, move |scope| {
                scope.tree_mut()?.attach(new_v7(), dup.id, None)?;
                scope.stage_term(dup);
                Ok(())
            })
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Validation(_)));
        assert!(store.load_rows(vocab.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_rejects_unknown_term() {
        let (store, vocab) = store_with("category").await;
        let err = store
            .write(vocab.id, |scope| {
                scope.tree_mut()?.attach(new_v7(), new_v7(), None)?;
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TermNotFound(_)));
    }

    #[tokio::test]
    async fn test_labeled_rows_follow_pruning_writes() {
        let (store, vocab) = store_with("category").await;
        let a = term("a");
        let b = term("b");
        let (a_id, b_id) = (a.id, b.id);
        store
            .write(vocab.id, move |scope| {
                let root = scope.tree_mut()?.attach(new_v7(), a.id, None)?;
                scope.tree_mut()?.attach(new_v7(), b.id, Some(root.id))?;
                scope.stage_term(a);
                scope.stage_term(b);
                Ok(())
            })
            .await
            .unwrap();

        let (rows, terms) = store.load_labeled_rows(vocab.id).await.unwrap();
        assert_eq!(rows.len(), 2);
        let mut ids: Vec<Uuid> = terms.iter().map(|t| t.id).collect();
        ids.sort();
        let mut expected = vec![a_id, b_id];
        expected.sort();
        assert_eq!(ids, expected);

        let committed = store
            .write(vocab.id, move |scope| {
                let node = scope.tree()?.term_in_vocabulary(b_id)?;
                scope.tree_mut()?.detach(node, DetachPolicy::CascadeDelete)?;
                scope.prune_if_orphaned(b_id);
                Ok(())
            })
            .await
            .unwrap();
        assert_eq!(committed.pruned_terms, vec![b_id]);

        let (rows, terms) = store.load_labeled_rows(vocab.id).await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(terms.len(), 1);
        assert_eq!(terms[0].id, a_id);

        assert!(matches!(
            store.load_labeled_rows(Uuid::nil()).await,
            Err(Error::VocabularyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_prune_only_orphans() {
        let (store, cats) = store_with("category").await;
        let tags = vocabulary("tags");
        store.insert_vocabulary(&tags).await.unwrap();
        let t = term("rust");
        store.insert_term(&t).await.unwrap();

        for vocab in [cats.id, tags.id] {
            let term_id = t.id;
            store
                .write(vocab, move |scope| {
                    scope.tree_mut()?.attach(new_v7(), term_id, None)?;
                    Ok(())
                })
                .await
                .unwrap();
        }
        assert_eq!(store.attachment_count(t.id).await.unwrap(), 2);

        let detach = |vocab: Uuid, term_id: Uuid| {
            store.write(vocab, move |scope| {
                let id = scope.tree()?.term_in_vocabulary(term_id)?;
                scope.tree_mut()?.detach(id, DetachPolicy::CascadeDelete)?;
                scope.prune_if_orphaned(term_id);
                Ok(())
            })
        };

        let first = detach(cats.id, t.id).await.unwrap();
        assert!(first.pruned_terms.is_empty());
        assert!(store.get_term(t.id).await.unwrap().is_some());

        let second = detach(tags.id, t.id).await.unwrap();
        assert_eq!(second.pruned_terms, vec![t.id]);
        assert!(store.get_term(t.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_delete_term_while_attached_conflicts() {
        let (store, vocab) = store_with("category").await;
        let t = term("rust");
        store.insert_term(&t).await.unwrap();
        let term_id = t.id;
        store
            .write(vocab.id, move |scope| {
                scope.tree_mut()?.attach(new_v7(), term_id, None)?;
                Ok(())
            })
            .await
            .unwrap();

        assert!(matches!(
            store.delete_term(t.id).await,
            Err(Error::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn test_update_term_slug_taken() {
        let store = MemoryStore::new();
        let a = term("a");
        let b = term("b");
        store.insert_term(&a).await.unwrap();
        store.insert_term(&b).await.unwrap();

        let mut renamed = b.clone();
        renamed.slug = "a".into();
        assert!(matches!(
            store.update_term(&renamed).await,
            Err(Error::Validation(_))
        ));

        renamed.slug = "c".into();
        store.update_term(&renamed).await.unwrap();
        // The old slug is free again.
        store.insert_term(&term("b")).await.unwrap();
    }

    #[tokio::test]
    async fn test_delete_vocabulary_prunes_orphans() {
        let (store, vocab) = store_with("category").await;
        let t = term("rust");
        let staged = t.clone();
        store
            .write(vocab.id, move |scope| {
                scope.tree_mut()?.attach(new_v7(), staged.id, None)?;
                scope.stage_term(staged);
                Ok(())
            })
            .await
            .unwrap();

        let pruned = store.delete_vocabulary(vocab.id).await.unwrap();
        assert_eq!(pruned, vec![t.id]);
        assert!(store.get_vocabulary(vocab.id).await.unwrap().is_none());
        assert!(matches!(
            store.load_rows(vocab.id).await,
            Err(Error::VocabularyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_taxonomy_across_vocabularies() {
        let (store, vocab) = store_with("category").await;
        let t = term("rust");
        let staged = t.clone();
        let committed = store
            .write(vocab.id, move |scope| {
                let node = scope.tree_mut()?.attach(new_v7(), staged.id, None)?;
                scope.stage_term(staged);
                Ok(node)
            })
            .await
            .unwrap();

        let found = store.get_taxonomy(committed.value.id).await.unwrap();
        assert_eq!(found, Some(committed.value));
        assert!(store.get_taxonomy(new_v7()).await.unwrap().is_none());
    }
}
