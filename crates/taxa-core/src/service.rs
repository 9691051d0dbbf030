//! The entry point callers use: one method per admin action on a
//! vocabulary's terms.
//!
//! Each effectful method is a single unit of work, so a term is never left
//! created without its node, or attached without its row.

use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ids::new_v7;
use crate::models::*;
use crate::registry::{default_type, VocabularyRegistry};
use crate::terms::TermStore;
use crate::traits::TaxonomyStore;
use crate::tree::TaxonomyTree;
use crate::validation::TermValidator;

/// Orchestrates [`VocabularyRegistry`], [`TermStore`] and [`TaxonomyTree`].
pub struct TaxonomyService<S> {
    store: Arc<S>,
    vocabularies: VocabularyRegistry<S>,
    terms: TermStore<S>,
    tree: TaxonomyTree<S>,
}

impl<S> Clone for TaxonomyService<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            vocabularies: self.vocabularies.clone(),
            terms: self.terms.clone(),
            tree: self.tree.clone(),
        }
    }
}

impl<S: TaxonomyStore> TaxonomyService<S> {
    pub fn new(store: Arc<S>) -> Self {
        let terms = TermStore::new(store.clone());
        Self::assemble(store, terms)
    }

    /// Use custom term rules instead of [`crate::DefaultTermValidator`].
    pub fn with_validator(store: Arc<S>, validator: Arc<dyn TermValidator>) -> Self {
        let terms = TermStore::with_validator(store.clone(), validator);
        Self::assemble(store, terms)
    }

    fn assemble(store: Arc<S>, terms: TermStore<S>) -> Self {
        Self {
            vocabularies: VocabularyRegistry::new(store.clone()),
            tree: TaxonomyTree::new(store.clone()),
            terms,
            store,
        }
    }

    pub fn vocabularies(&self) -> &VocabularyRegistry<S> {
        &self.vocabularies
    }

    pub fn terms(&self) -> &TermStore<S> {
        &self.terms
    }

    pub fn tree(&self) -> &TaxonomyTree<S> {
        &self.tree
    }

    // =========================================================================
    // LISTINGS
    // =========================================================================

    /// Terms of a vocabulary in tree order, with the content type new
    /// content should default to.
    pub async fn index(&self, vocabulary_id: Uuid, requested_type: Option<&str>) -> Result<TermIndex> {
        let vocabulary = self.vocabularies.get(vocabulary_id).await?;
        let terms = self
            .tree
            .tree_for(vocabulary_id, TreeOptions::keyed_by_term())
            .await?;
        let default_type = default_type(&vocabulary, requested_type).map(str::to_string);
        Ok(TermIndex {
            vocabulary,
            terms,
            default_type,
        })
    }

    /// Candidate parents for the add and edit forms, keyed by taxonomy id.
    pub async fn parent_tree(&self, vocabulary_id: Uuid) -> Result<Vec<TreeNode>> {
        self.tree
            .tree_for(vocabulary_id, TreeOptions::keyed_by_taxonomy())
            .await
    }

    // =========================================================================
    // ACTIONS
    // =========================================================================

    /// Create a term and attach it under `parent` in one unit.
    pub async fn add_term(
        &self,
        vocabulary_id: Uuid,
        attrs: TermAttributes,
        parent: Option<Uuid>,
    ) -> Result<Term> {
        let start = Instant::now();
        self.vocabularies.get(vocabulary_id).await?;
        let term = Term::create(self.terms.validate(&attrs)?);

        let staged = term.clone();
        let committed = self
            .store
            .write(vocabulary_id, move |scope| {
                let node = scope.tree_mut()?.attach(new_v7(), staged.id, parent)?;
                scope.stage_term(staged);
                Ok(node)
            })
            .await?;

        info!(
            subsystem = "taxonomy",
            component = "service",
            op = "add_term",
            vocabulary_id = %vocabulary_id,
            term_id = %term.id,
            taxonomy_id = %committed.value.id,
            duration_ms = start.elapsed().as_millis() as u64,
            "Term added"
        );
        Ok(term)
    }

    /// Update a term's attributes and, when `parent` differs from its current
    /// parent, move its node there. Both happen or neither does.
    pub async fn edit_term(
        &self,
        term_id: Uuid,
        vocabulary_id: Uuid,
        attrs: TermAttributes,
        parent: Option<Uuid>,
    ) -> Result<Term> {
        self.vocabularies.get(vocabulary_id).await?;
        let fields = self.terms.validate(&attrs)?;
        let term = self.terms.get(term_id).await?.updated(fields);

        let staged = term.clone();
        let committed = self
            .store
            .write(vocabulary_id, move |scope| {
                let node_id = scope.tree()?.term_in_vocabulary(term_id)?;
                let moved = scope.tree_mut()?.reparent(node_id, parent)?;
                scope.stage_term_update(staged);
                Ok(moved)
            })
            .await?;

        info!(
            subsystem = "taxonomy",
            component = "service",
            op = "edit_term",
            vocabulary_id = %vocabulary_id,
            term_id = %term_id,
            reparented = committed.value,
            "Term edited"
        );
        Ok(term)
    }

    /// Detach a term and its subtree from a vocabulary. Terms left without
    /// any attachment are deleted along the way.
    pub async fn remove_term(&self, term_id: Uuid, vocabulary_id: Uuid) -> Result<Removal> {
        self.vocabularies.get(vocabulary_id).await?;
        if !self.terms.exists(term_id).await? {
            return Err(Error::TermNotFound(term_id));
        }

        let committed = self
            .store
            .write(vocabulary_id, move |scope| {
                let node_id = scope.tree()?.term_in_vocabulary(term_id)?;
                let removed = scope
                    .tree_mut()?
                    .detach(node_id, DetachPolicy::CascadeDelete)?;
                for node in &removed {
                    scope.prune_if_orphaned(node.term_id);
                }
                Ok(removed)
            })
            .await?;

        if !committed.pruned_terms.is_empty() {
            debug!(
                vocabulary_id = %vocabulary_id,
                pruned = ?committed.pruned_terms,
                "Pruned terms without attachments"
            );
        }
        info!(
            subsystem = "taxonomy",
            component = "service",
            op = "remove_term",
            vocabulary_id = %vocabulary_id,
            term_id = %term_id,
            node_count = committed.value.len(),
            deleted_terms = committed.pruned_terms.len(),
            "Term removed"
        );
        Ok(Removal {
            detached: committed.value,
            deleted_terms: committed.pruned_terms,
        })
    }

    /// Reorder a term among its siblings. `false` means it could not move.
    pub async fn move_term(
        &self,
        direction: MoveDirection,
        term_id: Uuid,
        vocabulary_id: Uuid,
        step: usize,
    ) -> Result<bool> {
        self.vocabularies.get(vocabulary_id).await?;
        if !self.terms.exists(term_id).await? {
            return Err(Error::TermNotFound(term_id));
        }

        let committed = self
            .store
            .write(vocabulary_id, move |scope| {
                let node_id = scope.tree()?.term_in_vocabulary(term_id)?;
                scope.tree_mut()?.move_by(node_id, direction, step)
            })
            .await?;

        if committed.value {
            info!(
                subsystem = "taxonomy",
                component = "service",
                op = "move_term",
                vocabulary_id = %vocabulary_id,
                term_id = %term_id,
                direction = %direction,
                step,
                "Term moved"
            );
        } else {
            debug!(
                term_id = %term_id,
                direction = %direction,
                step,
                "Term already at the edge of its siblings"
            );
        }
        Ok(committed.value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{FieldErrors, TAKEN};
    use crate::memory::MemoryStore;

    async fn service_with(alias: &str, types: &[&str]) -> (TaxonomyService<MemoryStore>, Vocabulary) {
        let service = TaxonomyService::new(Arc::new(MemoryStore::new()));
        let vocabulary = service
            .vocabularies()
            .create(CreateVocabularyRequest {
                alias: alias.into(),
                title: alias.into(),
                types: types.iter().map(|t| t.to_string()).collect(),
                ..Default::default()
            })
            .await
            .unwrap();
        (service, vocabulary)
    }

    #[tokio::test]
    async fn test_add_term_missing_vocabulary() {
        let (service, _) = service_with("category", &[]).await;
        let err = service
            .add_term(Uuid::nil(), TermAttributes::named("Sports"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::VocabularyNotFound(_)));
    }

    #[tokio::test]
    async fn test_add_term_invalid_attributes_writes_nothing() {
        let (service, vocab) = service_with("category", &[]).await;
        let err = service
            .add_term(vocab.id, TermAttributes::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
        assert!(service.parent_tree(vocab.id).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_add_term_bad_parent_rolls_back_term() {
        let (service, vocab) = service_with("category", &[]).await;
        let err = service
            .add_term(vocab.id, TermAttributes::named("Sports"), Some(new_v7()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TaxonomyNotFound(_)));

        // The slug is still free, so nothing was left behind.
        let term = service
            .add_term(vocab.id, TermAttributes::named("Sports"), None)
            .await
            .unwrap();
        assert_eq!(term.slug, "sports");
    }

    #[tokio::test]
    async fn test_add_term_slug_taken() {
        let (service, vocab) = service_with("category", &[]).await;
        service
            .add_term(vocab.id, TermAttributes::named("Sports"), None)
            .await
            .unwrap();
        let err = service
            .add_term(vocab.id, TermAttributes::named("sports!"), None)
            .await
            .unwrap_err();
        match err {
            Error::Validation(fields) => assert_eq!(fields, FieldErrors::single("slug", TAKEN)),
            other => panic!("Expected Validation error, got {:?}", other),
        }
        assert_eq!(service.parent_tree(vocab.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_index_and_parent_tree_keys() {
        let (service, vocab) = service_with("category", &["blog", "page"]).await;
        let term = service
            .add_term(vocab.id, TermAttributes::named("Sports"), None)
            .await
            .unwrap();

        let index = service.index(vocab.id, Some("page")).await.unwrap();
        assert_eq!(index.vocabulary.id, vocab.id);
        assert_eq!(index.terms[0].id, term.id);
        assert_eq!(index.default_type.as_deref(), Some("page"));

        let parents = service.parent_tree(vocab.id).await.unwrap();
        assert_eq!(parents[0].id, parents[0].taxonomy_id);
        assert_ne!(parents[0].id, term.id);
    }

    #[tokio::test]
    async fn test_edit_term_updates_and_reparents() {
        let (service, vocab) = service_with("category", &[]).await;
        let sports = service
            .add_term(vocab.id, TermAttributes::named("Sports"), None)
            .await
            .unwrap();
        let tennis = service
            .add_term(vocab.id, TermAttributes::named("Tenis"), None)
            .await
            .unwrap();
        let sports_node = service
            .tree()
            .term_in_vocabulary(sports.id, vocab.id)
            .await
            .unwrap();

        let edited = service
            .edit_term(
                tennis.id,
                vocab.id,
                TermAttributes::named("Tennis"),
                Some(sports_node),
            )
            .await
            .unwrap();
        assert_eq!(edited.slug, "tennis");

        let tree = service.parent_tree(vocab.id).await.unwrap();
        assert_eq!(tree[1].name, "Tennis");
        assert_eq!(tree[1].parent_id, Some(sports_node));
        assert_eq!(tree[1].depth, 1);
    }

    #[tokio::test]
    async fn test_edit_term_cycle_writes_nothing() {
        let (service, vocab) = service_with("category", &[]).await;
        let sports = service
            .add_term(vocab.id, TermAttributes::named("Sports"), None)
            .await
            .unwrap();
        let sports_node = service
            .tree()
            .term_in_vocabulary(sports.id, vocab.id)
            .await
            .unwrap();
        service
            .add_term(vocab.id, TermAttributes::named("Tennis"), Some(sports_node))
            .await
            .unwrap();
        let tennis_node = service.parent_tree(vocab.id).await.unwrap()[1].taxonomy_id;

        let err = service
            .edit_term(
                sports.id,
                vocab.id,
                TermAttributes::named("Renamed"),
                Some(tennis_node),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
        assert_eq!(service.terms().get(sports.id).await.unwrap().name, "Sports");
    }

    #[tokio::test]
    async fn test_remove_term_prunes_subtree_terms() {
        let (service, vocab) = service_with("category", &[]).await;
        let sports = service
            .add_term(vocab.id, TermAttributes::named("Sports"), None)
            .await
            .unwrap();
        let node = service
            .tree()
            .term_in_vocabulary(sports.id, vocab.id)
            .await
            .unwrap();
        let tennis = service
            .add_term(vocab.id, TermAttributes::named("Tennis"), Some(node))
            .await
            .unwrap();

        let removal = service.remove_term(sports.id, vocab.id).await.unwrap();
        assert_eq!(removal.detached.len(), 2);
        assert_eq!(removal.detached[0].term_id, sports.id);
        assert_eq!(removal.deleted_terms, vec![sports.id, tennis.id]);
        assert!(!service.terms().exists(tennis.id).await.unwrap());

        assert!(matches!(
            service.tree().term_in_vocabulary(sports.id, vocab.id).await,
            Err(Error::NotAttached { .. })
        ));
        assert!(matches!(
            service.remove_term(sports.id, vocab.id).await,
            Err(Error::TermNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_remove_term_keeps_shared_term() {
        let (service, cats) = service_with("category", &[]).await;
        let tags = service
            .vocabularies()
            .create(CreateVocabularyRequest {
                alias: "tags".into(),
                title: "Tags".into(),
                ..Default::default()
            })
            .await
            .unwrap();
        let rust = service
            .add_term(cats.id, TermAttributes::named("Rust"), None)
            .await
            .unwrap();
        service.tree().attach(rust.id, tags.id, None).await.unwrap();

        let removal = service.remove_term(rust.id, cats.id).await.unwrap();
        assert!(removal.deleted_terms.is_empty());
        assert!(service.terms().exists(rust.id).await.unwrap());

        let removal = service.remove_term(rust.id, tags.id).await.unwrap();
        assert_eq!(removal.deleted_terms, vec![rust.id]);
    }

    #[tokio::test]
    async fn test_move_term() {
        let (service, vocab) = service_with("category", &[]).await;
        let a = service
            .add_term(vocab.id, TermAttributes::named("A"), None)
            .await
            .unwrap();
        let b = service
            .add_term(vocab.id, TermAttributes::named("B"), None)
            .await
            .unwrap();

        assert!(!service
            .move_term(MoveDirection::Up, a.id, vocab.id, 1)
            .await
            .unwrap());
        assert!(service
            .move_term(MoveDirection::Up, b.id, vocab.id, 1)
            .await
            .unwrap());
        let index = service.index(vocab.id, None).await.unwrap();
        assert_eq!(index.terms[0].id, b.id);

        let stranger = service.terms().create(&TermAttributes::named("C")).await.unwrap();
        assert!(matches!(
            service
                .move_term(MoveDirection::Down, stranger.id, vocab.id, 1)
                .await,
            Err(Error::NotAttached { .. })
        ));
    }

    #[tokio::test]
    async fn test_move_term_unknown_term() {
        let (service, vocab) = service_with("category", &[]).await;
        service
            .add_term(vocab.id, TermAttributes::named("A"), None)
            .await
            .unwrap();

        let missing = Uuid::now_v7();
        let err = service
            .move_term(MoveDirection::Up, missing, vocab.id, 1)
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TermNotFound(id) if id == missing));

        let err = service.remove_term(missing, vocab.id).await.unwrap_err();
        assert!(matches!(err, Error::TermNotFound(id) if id == missing));
    }
}
