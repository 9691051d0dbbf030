//! Nested-set engine for one vocabulary tree.
//!
//! A [`VocabularyTree`] is a flat arena of [`Taxonomy`] rows kept sorted by
//! `lft`, which is exactly pre-order. Because every subtree is a contiguous
//! run of that vector, subtree membership is a slice and ancestry is an
//! interval check; no pointer chasing is needed.
//!
//! All mutations are pure and in-memory. Stores load a tree, mutate a working
//! copy, and persist the [`TreeDiff`] against the original in one unit, so
//! a half-renumbered tree is never visible outside this module.
//!
//! Costs:
//! - `attach`, `detach`, `reparent`: O(n) boundary shift.
//! - `move_up`, `move_down`: O(size of the swapped subtrees).

use std::collections::{HashMap, HashSet};

use serde::{Deserialize, Serialize};
use tracing::trace;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{DetachPolicy, MoveDirection, Taxonomy};

/// Row-level difference between two states of the same vocabulary tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TreeDiff {
    pub inserted: Vec<Taxonomy>,
    /// Rows whose `parent_id`, `lft` or `rgt` changed.
    pub updated: Vec<Taxonomy>,
    pub deleted: Vec<Taxonomy>,
}

impl TreeDiff {
    pub fn is_empty(&self) -> bool {
        self.inserted.is_empty() && self.updated.is_empty() && self.deleted.is_empty()
    }

    pub fn rows_changed(&self) -> usize {
        self.inserted.len() + self.updated.len() + self.deleted.len()
    }
}

/// The nested-set tree of a single vocabulary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VocabularyTree {
    vocabulary_id: Uuid,
    /// Sorted by `lft`.
    nodes: Vec<Taxonomy>,
}

impl VocabularyTree {
    pub fn empty(vocabulary_id: Uuid) -> Self {
        Self {
            vocabulary_id,
            nodes: Vec::new(),
        }
    }

    /// Build a tree from stored rows, rejecting rows that break the invariants.
    pub fn from_rows(vocabulary_id: Uuid, rows: Vec<Taxonomy>) -> Result<Self> {
        let tree = Self::from_rows_unchecked(vocabulary_id, rows);
        tree.verify()?;
        Ok(tree)
    }

    /// Build a tree without checking it; pair with [`recover`](Self::recover)
    /// for tables that were edited outside this engine.
    pub fn from_rows_unchecked(vocabulary_id: Uuid, mut rows: Vec<Taxonomy>) -> Self {
        rows.sort_by(|a, b| a.lft.cmp(&b.lft).then(a.id.cmp(&b.id)));
        Self {
            vocabulary_id,
            nodes: rows,
        }
    }

    pub fn vocabulary_id(&self) -> Uuid {
        self.vocabulary_id
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// All nodes in pre-order.
    pub fn nodes(&self) -> &[Taxonomy] {
        &self.nodes
    }

    pub fn into_rows(self) -> Vec<Taxonomy> {
        self.nodes
    }

    pub fn get(&self, id: Uuid) -> Option<&Taxonomy> {
        self.nodes.iter().find(|n| n.id == id)
    }

    pub fn find_by_term(&self, term_id: Uuid) -> Option<&Taxonomy> {
        self.nodes.iter().find(|n| n.term_id == term_id)
    }

    /// Resolve the node of `term_id` in this vocabulary.
    pub fn term_in_vocabulary(&self, term_id: Uuid) -> Result<Uuid> {
        self.find_by_term(term_id)
            .map(|n| n.id)
            .ok_or(Error::NotAttached {
                term_id,
                vocabulary_id: self.vocabulary_id,
            })
    }

    fn index_of(&self, id: Uuid) -> Result<usize> {
        self.nodes
            .iter()
            .position(|n| n.id == id)
            .ok_or(Error::TaxonomyNotFound(id))
    }

    /// Exclusive end index of the subtree starting at `index`.
    #[inline]
    fn subtree_end(&self, index: usize) -> usize {
        index + 1 + self.nodes[index].descendant_count()
    }

    /// First boundary value past the last root.
    #[inline]
    fn next_boundary(&self) -> i64 {
        self.nodes.len() as i64 * 2 + 1
    }

    /// Indices of the children of `parent` (roots for `None`), in order.
    ///
    /// Walks sibling to sibling by skipping whole subtrees, so the cost is
    /// the number of siblings rather than the size of the tree.
    fn sibling_indices(&self, parent: Option<Uuid>) -> Result<Vec<usize>> {
        let (mut cursor, end) = match parent {
            Some(pid) => {
                let p = self.index_of(pid)?;
                (p + 1, self.subtree_end(p))
            }
            None => (0, self.nodes.len()),
        };
        let mut indices = Vec::new();
        while cursor < end {
            indices.push(cursor);
            cursor = self.subtree_end(cursor);
        }
        Ok(indices)
    }

    /// Add `delta` to every boundary `>= from`.
    fn shift(&mut self, from: i64, delta: i64) {
        for node in &mut self.nodes {
            if node.lft >= from {
                node.lft += delta;
            }
            if node.rgt >= from {
                node.rgt += delta;
            }
        }
    }

    // =========================================================================
    // QUERIES
    // =========================================================================

    /// Nodes in pre-order, each paired with its depth (0 for roots).
    pub fn preorder(&self) -> Vec<(usize, Taxonomy)> {
        let mut open: Vec<i64> = Vec::new();
        let mut out = Vec::with_capacity(self.nodes.len());
        for node in &self.nodes {
            while open.last().is_some_and(|&rgt| rgt < node.lft) {
                open.pop();
            }
            out.push((open.len(), *node));
            open.push(node.rgt);
        }
        out
    }

    /// Direct children of `parent` (roots for `None`), in sibling order.
    pub fn children(&self, parent: Option<Uuid>) -> Result<Vec<Taxonomy>> {
        Ok(self
            .sibling_indices(parent)?
            .into_iter()
            .map(|i| self.nodes[i])
            .collect())
    }

    /// Ancestors of a node, root first.
    pub fn ancestors(&self, id: Uuid) -> Result<Vec<Taxonomy>> {
        let node = self.nodes[self.index_of(id)?];
        Ok(self
            .nodes
            .iter()
            .take_while(|n| n.lft < node.lft)
            .filter(|n| n.contains(&node))
            .copied()
            .collect())
    }

    /// The node followed by all of its descendants.
    pub fn subtree(&self, id: Uuid) -> Result<&[Taxonomy]> {
        let i = self.index_of(id)?;
        Ok(&self.nodes[i..self.subtree_end(i)])
    }

    /// Sibling indices of the node at `i` and its zero-based place among them.
    fn sibling_position(&self, i: usize) -> Result<(Vec<usize>, usize)> {
        let node = self.nodes[i];
        let siblings = self.sibling_indices(node.parent_id)?;
        let pos = siblings.iter().position(|&s| s == i).ok_or_else(|| {
            Error::Corrupted(format!("node {} missing from its sibling list", node.id))
        })?;
        Ok((siblings, pos))
    }

    // =========================================================================
    // MUTATIONS
    // =========================================================================

    /// Insert `term_id` as the last child of `parent_id` (or as the last root).
    pub fn attach(
        &mut self,
        id: Uuid,
        term_id: Uuid,
        parent_id: Option<Uuid>,
    ) -> Result<Taxonomy> {
        if self.find_by_term(term_id).is_some() {
            return Err(Error::Conflict(format!(
                "term {} is already attached to vocabulary {}",
                term_id, self.vocabulary_id
            )));
        }
        if self.get(id).is_some() {
            return Err(Error::Conflict(format!("taxonomy id {} already in use", id)));
        }

        let at = match parent_id {
            Some(pid) => self.nodes[self.index_of(pid)?].rgt,
            None => self.next_boundary(),
        };
        self.shift(at, 2);

        let node = Taxonomy {
            id,
            term_id,
            vocabulary_id: self.vocabulary_id,
            parent_id,
            lft: at,
            rgt: at + 1,
        };
        let index = self.nodes.partition_point(|n| n.lft < at);
        self.nodes.insert(index, node);
        trace!(taxonomy_id = %id, lft = node.lft, rgt = node.rgt, "Attached node");
        Ok(node)
    }

    /// Remove a node. Returns the removed rows, the node itself first.
    pub fn detach(&mut self, id: Uuid, policy: DetachPolicy) -> Result<Vec<Taxonomy>> {
        let i = self.index_of(id)?;
        let node = self.nodes[i];

        match policy {
            DetachPolicy::CascadeDelete => {
                let removed: Vec<Taxonomy> = self.nodes.drain(i..self.subtree_end(i)).collect();
                self.shift(node.rgt + 1, -node.width());
                Ok(removed)
            }
            DetachPolicy::PromoteChildren => {
                self.nodes.remove(i);
                let descendants = node.descendant_count();
                for child in &mut self.nodes[i..i + descendants] {
                    child.lft -= 1;
                    child.rgt -= 1;
                    if child.parent_id == Some(id) {
                        child.parent_id = node.parent_id;
                    }
                }
                self.shift(node.rgt + 1, -2);
                Ok(vec![node])
            }
        }
    }

    /// Move a node `step` places towards the front of its sibling list.
    ///
    /// The distance is clamped to the siblings available. Returns `false`
    /// without touching anything when the node is already first or `step`
    /// is zero.
    pub fn move_up(&mut self, id: Uuid, step: usize) -> Result<bool> {
        let i = self.index_of(id)?;
        let (siblings, pos) = self.sibling_position(i)?;
        if step == 0 || pos == 0 {
            return Ok(false);
        }

        let target = siblings[pos - step.min(pos)];
        let node = self.nodes[i];
        let end = self.subtree_end(i);
        let count = end - i;
        let skipped_width = node.lft - self.nodes[target].lft;

        for n in &mut self.nodes[target..i] {
            n.lft += node.width();
            n.rgt += node.width();
        }
        for n in &mut self.nodes[i..end] {
            n.lft -= skipped_width;
            n.rgt -= skipped_width;
        }
        self.nodes[target..end].rotate_right(count);
        Ok(true)
    }

    /// Move a node `step` places towards the back of its sibling list.
    ///
    /// Mirror image of [`move_up`](Self::move_up).
    pub fn move_down(&mut self, id: Uuid, step: usize) -> Result<bool> {
        let i = self.index_of(id)?;
        let (siblings, pos) = self.sibling_position(i)?;
        let last = siblings.len().saturating_sub(1);
        if step == 0 || pos >= last {
            return Ok(false);
        }

        let target = siblings[pos + step.min(last - pos)];
        let node = self.nodes[i];
        let end = self.subtree_end(i);
        let count = end - i;
        let block_end = self.subtree_end(target);
        let skipped_width = self.nodes[target].rgt - node.rgt;

        for n in &mut self.nodes[end..block_end] {
            n.lft -= node.width();
            n.rgt -= node.width();
        }
        for n in &mut self.nodes[i..end] {
            n.lft += skipped_width;
            n.rgt += skipped_width;
        }
        self.nodes[i..block_end].rotate_left(count);
        Ok(true)
    }

    pub fn move_by(&mut self, id: Uuid, direction: MoveDirection, step: usize) -> Result<bool> {
        match direction {
            MoveDirection::Up => self.move_up(id, step),
            MoveDirection::Down => self.move_down(id, step),
        }
    }

    /// Move a node and its subtree to the end of `new_parent`'s children.
    ///
    /// Returns `false` when the node already sits under `new_parent`; its
    /// sibling position is kept in that case.
    pub fn reparent(&mut self, id: Uuid, new_parent: Option<Uuid>) -> Result<bool> {
        let i = self.index_of(id)?;
        let node = self.nodes[i];
        if node.parent_id == new_parent {
            return Ok(false);
        }
        if let Some(pid) = new_parent {
            if pid == id {
                return Err(Error::InvalidOperation(format!(
                    "taxonomy {} cannot be its own parent",
                    id
                )));
            }
            let parent = self.nodes[self.index_of(pid)?];
            if node.contains(&parent) {
                return Err(Error::InvalidOperation(format!(
                    "taxonomy {} cannot move under its descendant {}",
                    id, pid
                )));
            }
        }

        let mut block: Vec<Taxonomy> = self.nodes.drain(i..self.subtree_end(i)).collect();
        self.shift(node.rgt + 1, -node.width());

        let at = match new_parent {
            Some(pid) => self.nodes[self.index_of(pid)?].rgt,
            None => self.next_boundary(),
        };
        self.shift(at, node.width());

        let offset = at - node.lft;
        for n in &mut block {
            n.lft += offset;
            n.rgt += offset;
        }
        block[0].parent_id = new_parent;

        let index = self.nodes.partition_point(|n| n.lft < at);
        self.nodes.splice(index..index, block);
        Ok(true)
    }

    /// Rebuild every boundary from the `parent_id` links.
    ///
    /// Siblings keep their current relative order (by `lft`, then id).
    /// Parents that do not resolve inside this vocabulary, and links that
    /// form cycles, are cut: those nodes become roots.
    pub fn recover(&mut self) {
        self.nodes
            .sort_by(|a, b| a.lft.cmp(&b.lft).then(a.id.cmp(&b.id)));

        let ids: HashSet<Uuid> = self.nodes.iter().map(|n| n.id).collect();
        for node in &mut self.nodes {
            if node.parent_id.is_some_and(|p| p == node.id || !ids.contains(&p)) {
                node.parent_id = None;
            }
        }

        let mut children: HashMap<Option<Uuid>, Vec<usize>> = HashMap::new();
        for (i, node) in self.nodes.iter().enumerate() {
            children.entry(node.parent_id).or_default().push(i);
        }

        let mut visited = vec![false; self.nodes.len()];
        let mut order: Vec<(usize, i64, i64)> = Vec::with_capacity(self.nodes.len());
        let mut counter = 1i64;

        let mut starts: Vec<usize> = children.get(&None).cloned().unwrap_or_default();
        loop {
            for root in starts.drain(..) {
                walk(root, &self.nodes, &children, &mut visited, &mut counter, &mut order);
            }
            // Anything unvisited is stuck in a cycle; cut the earliest node loose.
            match visited.iter().position(|v| !v) {
                Some(orphan) => {
                    self.nodes[orphan].parent_id = None;
                    if let Some(list) = children.values_mut().find(|l| l.contains(&orphan)) {
                        list.retain(|&c| c != orphan);
                    }
                    starts.push(orphan);
                }
                None => break,
            }
        }

        for (i, lft, rgt) in order {
            self.nodes[i].lft = lft;
            self.nodes[i].rgt = rgt;
        }
        self.nodes.sort_by_key(|n| n.lft);
    }

    /// Check every nested-set invariant, reporting the first violation.
    pub fn verify(&self) -> Result<()> {
        let mut ids = HashSet::with_capacity(self.nodes.len());
        let mut terms = HashSet::with_capacity(self.nodes.len());
        let mut boundaries = Vec::with_capacity(self.nodes.len() * 2);

        for node in &self.nodes {
            if node.vocabulary_id != self.vocabulary_id {
                return Err(Error::Corrupted(format!(
                    "node {} belongs to vocabulary {}",
                    node.id, node.vocabulary_id
                )));
            }
            if !ids.insert(node.id) {
                return Err(Error::Corrupted(format!("duplicate node {}", node.id)));
            }
            if !terms.insert(node.term_id) {
                return Err(Error::Corrupted(format!(
                    "term {} attached twice",
                    node.term_id
                )));
            }
            if node.lft >= node.rgt {
                return Err(Error::Corrupted(format!(
                    "node {} has lft {} >= rgt {}",
                    node.id, node.lft, node.rgt
                )));
            }
            boundaries.push(node.lft);
            boundaries.push(node.rgt);
        }

        boundaries.sort_unstable();
        for (expected, actual) in (1i64..).zip(boundaries.iter()) {
            if *actual != expected {
                return Err(Error::Corrupted(format!(
                    "boundaries not contiguous: expected {}, found {}",
                    expected, actual
                )));
            }
        }

        let mut open: Vec<&Taxonomy> = Vec::new();
        for pair in self.nodes.windows(2) {
            if pair[0].lft >= pair[1].lft {
                return Err(Error::Corrupted("nodes not in pre-order".to_string()));
            }
        }
        for node in &self.nodes {
            while open.last().is_some_and(|top| top.rgt < node.lft) {
                open.pop();
            }
            let expected = open.last().map(|top| top.id);
            if node.parent_id != expected {
                return Err(Error::Corrupted(format!(
                    "node {} has parent {:?} but lies under {:?}",
                    node.id, node.parent_id, expected
                )));
            }
            if let Some(top) = open.last() {
                if node.rgt > top.rgt {
                    return Err(Error::Corrupted(format!(
                        "node {} overlaps its parent {}",
                        node.id, top.id
                    )));
                }
            }
            open.push(node);
        }
        Ok(())
    }

    /// Rows to write to turn `before` into `self`.
    pub fn diff(&self, before: &VocabularyTree) -> TreeDiff {
        let old: HashMap<Uuid, &Taxonomy> = before.nodes.iter().map(|n| (n.id, n)).collect();
        let mut seen = HashSet::with_capacity(self.nodes.len());
        let mut diff = TreeDiff::default();

        for node in &self.nodes {
            seen.insert(node.id);
            match old.get(&node.id) {
                None => diff.inserted.push(*node),
                Some(prev) => {
                    if prev.parent_id != node.parent_id
                        || prev.lft != node.lft
                        || prev.rgt != node.rgt
                    {
                        diff.updated.push(*node);
                    }
                }
            }
        }
        diff.deleted = before
            .nodes
            .iter()
            .filter(|n| !seen.contains(&n.id))
            .copied()
            .collect();
        diff
    }
}

/// Iterative pre-order numbering used by `recover`.
fn walk(
    root: usize,
    nodes: &[Taxonomy],
    children: &HashMap<Option<Uuid>, Vec<usize>>,
    visited: &mut [bool],
    counter: &mut i64,
    order: &mut Vec<(usize, i64, i64)>,
) {
    // (node index, lft, next child cursor)
    let mut stack: Vec<(usize, i64, usize)> = Vec::new();
    if visited[root] {
        return;
    }
    visited[root] = true;
    stack.push((root, *counter, 0));
    *counter += 1;

    while let Some(top) = stack.last_mut() {
        let (index, lft) = (top.0, top.1);
        let next = children
            .get(&Some(nodes[index].id))
            .and_then(|kids| kids.get(top.2))
            .copied();
        top.2 += 1;
        match next {
            Some(child) if !visited[child] => {
                visited[child] = true;
                stack.push((child, *counter, 0));
                *counter += 1;
            }
            Some(_) => {}
            None => {
                order.push((index, lft, *counter));
                *counter += 1;
                stack.pop();
            }
        }
    }
}
