//! Position of terms inside vocabulary trees.
//!
//! Every structural change runs as one [`TaxonomyStore::write`] unit, so a
//! reader sees the tree either before or after a renumbering, never halfway.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ids::{is_present, new_v7};
use crate::models::{DetachPolicy, MoveDirection, Taxonomy, TreeNode, TreeOptions, Vocabulary};
use crate::nested_set::VocabularyTree;
use crate::traits::TaxonomyStore;

pub struct TaxonomyTree<S> {
    store: Arc<S>,
}

impl<S> Clone for TaxonomyTree<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TaxonomyStore> TaxonomyTree<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    async fn vocabulary(&self, id: Uuid) -> Result<Vocabulary> {
        if !is_present(&id) {
            return Err(Error::VocabularyNotFound(id));
        }
        self.store
            .get_vocabulary(id)
            .await?
            .ok_or(Error::VocabularyNotFound(id))
    }

    async fn node(&self, taxonomy_id: Uuid) -> Result<Taxonomy> {
        self.store
            .get_taxonomy(taxonomy_id)
            .await?
            .ok_or(Error::TaxonomyNotFound(taxonomy_id))
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Pre-order projection of the tree of the vocabulary with `alias`.
    pub async fn get_tree(&self, alias: &str, options: TreeOptions) -> Result<Vec<TreeNode>> {
        let vocabulary = self
            .store
            .get_vocabulary_by_alias(alias)
            .await?
            .ok_or_else(|| Error::VocabularyAliasNotFound(alias.to_string()))?;
        self.tree_for(vocabulary.id, options).await
    }

    /// Pre-order projection of a vocabulary tree, joined with term labels.
    pub async fn tree_for(&self, vocabulary_id: Uuid, options: TreeOptions) -> Result<Vec<TreeNode>> {
        self.vocabulary(vocabulary_id).await?;
        let (rows, terms) = self.store.load_labeled_rows(vocabulary_id).await?;
        let tree = VocabularyTree::from_rows(vocabulary_id, rows)?;
        let terms: HashMap<Uuid, _> = terms.into_iter().map(|t| (t.id, t)).collect();

        tree.preorder()
            .into_iter()
            .map(|(depth, node)| {
                let term = terms
                    .get(&node.term_id)
                    .ok_or(Error::TermNotFound(node.term_id))?;
                Ok(TreeNode {
                    id: if options.taxonomy_id_as_key {
                        node.id
                    } else {
                        node.term_id
                    },
                    taxonomy_id: node.id,
                    term_id: node.term_id,
                    parent_id: node.parent_id,
                    depth,
                    lft: node.lft,
                    rgt: node.rgt,
                    name: term.name.clone(),
                    slug: term.slug.clone(),
                })
            })
            .collect()
    }

    /// The node of `term_id` in a vocabulary; `NotAttached` when absent.
    pub async fn term_in_vocabulary(&self, term_id: Uuid, vocabulary_id: Uuid) -> Result<Uuid> {
        self.vocabulary(vocabulary_id).await?;
        self.store
            .load_tree(vocabulary_id)
            .await?
            .term_in_vocabulary(term_id)
    }

    /// Direct children of a node, in sibling order.
    pub async fn children(&self, taxonomy_id: Uuid) -> Result<Vec<Taxonomy>> {
        let node = self.node(taxonomy_id).await?;
        self.store
            .load_tree(node.vocabulary_id)
            .await?
            .children(Some(taxonomy_id))
    }

    /// Root nodes of a vocabulary, in sibling order.
    pub async fn roots(&self, vocabulary_id: Uuid) -> Result<Vec<Taxonomy>> {
        self.vocabulary(vocabulary_id).await?;
        self.store.load_tree(vocabulary_id).await?.children(None)
    }

    /// Ancestors of a node, root first.
    pub async fn ancestors(&self, taxonomy_id: Uuid) -> Result<Vec<Taxonomy>> {
        let node = self.node(taxonomy_id).await?;
        self.store
            .load_tree(node.vocabulary_id)
            .await?
            .ancestors(taxonomy_id)
    }

    /// Check the stored rows of a vocabulary against every nested-set rule.
    pub async fn verify(&self, vocabulary_id: Uuid) -> Result<()> {
        self.vocabulary(vocabulary_id).await?;
        let rows = self.store.load_rows(vocabulary_id).await?;
        let result = VocabularyTree::from_rows_unchecked(vocabulary_id, rows).verify();
        if let Err(e) = &result {
            warn!(
                subsystem = "taxonomy",
                component = "tree",
                op = "verify",
                vocabulary_id = %vocabulary_id,
                error = %e,
                "Vocabulary tree failed verification"
            );
        }
        result
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Attach a term as the last child of `parent` (or as the last root).
    pub async fn attach(
        &self,
        term_id: Uuid,
        vocabulary_id: Uuid,
        parent: Option<Uuid>,
    ) -> Result<Taxonomy> {
        self.vocabulary(vocabulary_id).await?;
        if self.store.get_term(term_id).await?.is_none() {
            return Err(Error::TermNotFound(term_id));
        }
        let committed = self
            .store
            .write(vocabulary_id, move |scope| {
                scope.tree_mut()?.attach(new_v7(), term_id, parent)
            })
            .await?;
        let node = committed.value;
        info!(
            subsystem = "taxonomy",
            component = "tree",
            op = "attach",
            vocabulary_id = %vocabulary_id,
            term_id = %term_id,
            taxonomy_id = %node.id,
            "Term attached"
        );
        Ok(node)
    }

    /// Remove a node; `policy` decides what happens to its descendants.
    /// Returns the removed rows, the node itself first.
    pub async fn detach(&self, taxonomy_id: Uuid, policy: DetachPolicy) -> Result<Vec<Taxonomy>> {
        let node = self.node(taxonomy_id).await?;
        let committed = self
            .store
            .write(node.vocabulary_id, move |scope| {
                scope.tree_mut()?.detach(taxonomy_id, policy)
            })
            .await?;
        info!(
            subsystem = "taxonomy",
            component = "tree",
            op = "detach",
            vocabulary_id = %node.vocabulary_id,
            taxonomy_id = %taxonomy_id,
            policy = %policy,
            removed = committed.value.len(),
            "Node detached"
        );
        Ok(committed.value)
    }

    pub async fn move_up(&self, taxonomy_id: Uuid, step: usize) -> Result<bool> {
        self.move_by(taxonomy_id, MoveDirection::Up, step).await
    }

    pub async fn move_down(&self, taxonomy_id: Uuid, step: usize) -> Result<bool> {
        self.move_by(taxonomy_id, MoveDirection::Down, step).await
    }

    /// Shift a node `step` places among its siblings. Returns `false` when
    /// the node cannot move in that direction.
    pub async fn move_by(
        &self,
        taxonomy_id: Uuid,
        direction: MoveDirection,
        step: usize,
    ) -> Result<bool> {
        let node = self.node(taxonomy_id).await?;
        let committed = self
            .store
            .write(node.vocabulary_id, move |scope| {
                scope.tree_mut()?.move_by(taxonomy_id, direction, step)
            })
            .await?;
        if committed.value {
            info!(
                subsystem = "taxonomy",
                component = "tree",
                op = "move",
                vocabulary_id = %node.vocabulary_id,
                taxonomy_id = %taxonomy_id,
                direction = %direction,
                step,
                "Node moved"
            );
        } else {
            debug!(
                taxonomy_id = %taxonomy_id,
                direction = %direction,
                step,
                "Move is a no-op"
            );
        }
        Ok(committed.value)
    }

    /// Move a node with its subtree under `new_parent` (or to the roots) as
    /// the last child. Returns `false` when the parent is unchanged.
    pub async fn reparent(&self, taxonomy_id: Uuid, new_parent: Option<Uuid>) -> Result<bool> {
        let node = self.node(taxonomy_id).await?;
        let committed = self
            .store
            .write(node.vocabulary_id, move |scope| {
                scope.tree_mut()?.reparent(taxonomy_id, new_parent)
            })
            .await?;
        if committed.value {
            info!(
                subsystem = "taxonomy",
                component = "tree",
                op = "reparent",
                vocabulary_id = %node.vocabulary_id,
                taxonomy_id = %taxonomy_id,
                parent_id = ?new_parent,
                "Node reparented"
            );
        }
        Ok(committed.value)
    }

    /// Rebuild the boundaries of a vocabulary from its parent links.
    /// Returns the number of rows rewritten.
    pub async fn recover(&self, vocabulary_id: Uuid) -> Result<usize> {
        self.vocabulary(vocabulary_id).await?;
        let start = Instant::now();
        let committed = self
            .store
            .write(vocabulary_id, |scope| Ok(scope.recover_tree()))
            .await?;
        info!(
            subsystem = "taxonomy",
            component = "tree",
            op = "recover",
            vocabulary_id = %vocabulary_id,
            rows_changed = committed.value,
            duration_ms = start.elapsed().as_millis() as u64,
            "Vocabulary tree recovered"
        );
        Ok(committed.value)
    }
}
