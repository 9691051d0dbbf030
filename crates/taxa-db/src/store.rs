//! PostgreSQL implementation of [`TaxonomyStore`].

use std::time::Instant;

use async_trait::async_trait;
use sqlx::{Pool, Postgres};
use tracing::{debug, info};
use uuid::Uuid;

use taxa_core::{
    Committed, Error, Result, ScopedWrite, Taxonomy, TaxonomyStore, Term, Vocabulary,
    VocabularyTree,
};

use crate::store_tx::{self, row_to_taxonomy, row_to_term, row_to_vocabulary};
use crate::store_tx::{TAXONOMY_COLUMNS, TERM_COLUMNS, VOCABULARY_COLUMNS};

/// Taxonomy storage on PostgreSQL.
///
/// A unit of work is one transaction holding `FOR UPDATE` on the vocabulary
/// row, so writers on one vocabulary queue behind each other while readers
/// keep reading the last committed tree.
#[derive(Clone)]
pub struct PgTaxonomyStore {
    pool: Pool<Postgres>,
}

impl PgTaxonomyStore {
    pub fn new(pool: Pool<Postgres>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }
}

#[async_trait]
impl TaxonomyStore for PgTaxonomyStore {
    async fn get_vocabulary(&self, id: Uuid) -> Result<Option<Vocabulary>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM vocabulary WHERE id = $1",
            VOCABULARY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(row_to_vocabulary))
    }

    async fn get_vocabulary_by_alias(&self, alias: &str) -> Result<Option<Vocabulary>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM vocabulary WHERE alias = $1",
            VOCABULARY_COLUMNS
        ))
        .bind(alias)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(row_to_vocabulary))
    }

    async fn list_vocabularies(&self) -> Result<Vec<Vocabulary>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM vocabulary ORDER BY alias",
            VOCABULARY_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(row_to_vocabulary).collect())
    }

    async fn insert_vocabulary(&self, vocabulary: &Vocabulary) -> Result<()> {
        sqlx::query(
            "INSERT INTO vocabulary (id, alias, title, description, types, created_at, updated_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)",
        )
        .bind(vocabulary.id)
        .bind(&vocabulary.alias)
        .bind(&vocabulary.title)
        .bind(&vocabulary.description)
        .bind(&vocabulary.types)
        .bind(vocabulary.created_at)
        .bind(vocabulary.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(format!(
                "vocabulary alias '{}' already in use",
                vocabulary.alias
            )),
            _ => Error::Database(e),
        })?;
        Ok(())
    }

    async fn delete_vocabulary(&self, id: Uuid) -> Result<Vec<Uuid>> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        if store_tx::lock_vocabulary(&mut tx, id).await?.is_none() {
            return Err(Error::VocabularyNotFound(id));
        }

        let term_ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT term_id FROM taxonomy WHERE vocabulary_id = $1 ORDER BY lft")
                .bind(id)
                .fetch_all(&mut *tx)
                .await
                .map_err(Error::Database)?;

        // Nodes go with the vocabulary through ON DELETE CASCADE.
        sqlx::query("DELETE FROM vocabulary WHERE id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let pruned = store_tx::prune_terms(&mut tx, &term_ids).await?;
        tx.commit().await.map_err(Error::Database)?;

        debug!(
            subsystem = "database",
            component = "pg_store",
            op = "delete_vocabulary",
            vocabulary_id = %id,
            node_count = term_ids.len(),
            pruned = pruned.len(),
            "Vocabulary removed"
        );
        Ok(pruned)
    }

    async fn get_term(&self, id: Uuid) -> Result<Option<Term>> {
        let row = sqlx::query(&format!("SELECT {} FROM term WHERE id = $1", TERM_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(row.as_ref().map(row_to_term))
    }

    async fn get_terms(&self, ids: &[Uuid]) -> Result<Vec<Term>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(&format!(
            "SELECT {} FROM term WHERE id = ANY($1)",
            TERM_COLUMNS
        ))
        .bind(ids)
        .fetch_all(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(rows.iter().map(row_to_term).collect())
    }

    async fn insert_term(&self, term: &Term) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        store_tx::insert_term(&mut conn, term).await
    }

    async fn update_term(&self, term: &Term) -> Result<()> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        store_tx::update_term(&mut conn, term).await
    }

    async fn delete_term(&self, id: Uuid) -> Result<()> {
        let result = sqlx::query("DELETE FROM term WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| match &e {
                sqlx::Error::Database(db) if db.is_foreign_key_violation() => {
                    Error::Conflict(format!("term {} is still attached to a vocabulary", id))
                }
                _ => Error::Database(e),
            })?;
        if result.rows_affected() == 0 {
            return Err(Error::TermNotFound(id));
        }
        Ok(())
    }

    async fn attachment_count(&self, term_id: Uuid) -> Result<usize> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM taxonomy WHERE term_id = $1")
            .bind(term_id)
            .fetch_one(&self.pool)
            .await
            .map_err(Error::Database)?;
        Ok(count as usize)
    }

    async fn load_rows(&self, vocabulary_id: Uuid) -> Result<Vec<Taxonomy>> {
        let mut conn = self.pool.acquire().await.map_err(Error::Database)?;
        let rows = store_tx::fetch_rows(&mut conn, vocabulary_id).await?;
        if rows.is_empty() {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM vocabulary WHERE id = $1)")
                    .bind(vocabulary_id)
                    .fetch_one(&mut *conn)
                    .await
                    .map_err(Error::Database)?;
            if !exists {
                return Err(Error::VocabularyNotFound(vocabulary_id));
            }
        }
        Ok(rows)
    }

    async fn load_labeled_rows(&self, vocabulary_id: Uuid) -> Result<(Vec<Taxonomy>, Vec<Term>)> {
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;
        // Both SELECTs below read the snapshot taken by the first of them.
        sqlx::query("SET TRANSACTION ISOLATION LEVEL REPEATABLE READ, READ ONLY")
            .execute(&mut *tx)
            .await
            .map_err(Error::Database)?;

        let rows = store_tx::fetch_rows(&mut tx, vocabulary_id).await?;
        if rows.is_empty() {
            let exists: bool =
                sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM vocabulary WHERE id = $1)")
                    .bind(vocabulary_id)
                    .fetch_one(&mut *tx)
                    .await
                    .map_err(Error::Database)?;
            if !exists {
                return Err(Error::VocabularyNotFound(vocabulary_id));
            }
            return Ok((rows, Vec::new()));
        }

        let terms = sqlx::query(&format!(
            "SELECT {} FROM term
             WHERE id IN (SELECT term_id FROM taxonomy WHERE vocabulary_id = $1)",
            TERM_COLUMNS
        ))
        .bind(vocabulary_id)
        .fetch_all(&mut *tx)
        .await
        .map_err(Error::Database)?;
        tx.commit().await.map_err(Error::Database)?;

        Ok((rows, terms.iter().map(row_to_term).collect()))
    }

    async fn get_taxonomy(&self, id: Uuid) -> Result<Option<Taxonomy>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM taxonomy WHERE id = $1",
            TAXONOMY_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(Error::Database)?;
        Ok(row.as_ref().map(row_to_taxonomy))
    }

    async fn write<R, F>(&self, vocabulary_id: Uuid, f: F) -> Result<Committed<R>>
    where
        R: Send,
        F: FnOnce(&mut ScopedWrite) -> Result<R> + Send,
    {
        let start = Instant::now();
        // Dropping `tx` on any early return rolls the unit back.
        let mut tx = self.pool.begin().await.map_err(Error::Database)?;

        let vocabulary = store_tx::lock_vocabulary(&mut tx, vocabulary_id)
            .await?
            .ok_or(Error::VocabularyNotFound(vocabulary_id))?;
        let rows = store_tx::fetch_rows(&mut tx, vocabulary_id).await?;
        let before = VocabularyTree::from_rows_unchecked(vocabulary_id, rows);

        let mut scope = ScopedWrite::new(vocabulary, before.clone());
        let value = f(&mut scope)?;
        let changes = scope.finish(&before)?;

        for term in &changes.new_terms {
            store_tx::insert_term(&mut tx, term).await?;
        }
        for term in &changes.updated_terms {
            store_tx::update_term(&mut tx, term).await?;
        }
        let rows_changed = store_tx::apply_diff(&mut tx, vocabulary_id, &changes.diff).await?;
        let pruned_terms = store_tx::prune_terms(&mut tx, &changes.prune).await?;

        tx.commit().await.map_err(Error::Database)?;

        if rows_changed > 0 || !pruned_terms.is_empty() {
            info!(
                subsystem = "database",
                component = "pg_store",
                op = "write",
                vocabulary_id = %vocabulary_id,
                rows_changed,
                pruned = pruned_terms.len(),
                duration_ms = start.elapsed().as_millis() as u64,
                "Unit of work committed"
            );
        }
        Ok(Committed {
            value,
            pruned_terms,
        })
    }
}
