//! Transaction-scoped statements used by [`crate::PgTaxonomyStore`].
//!
//! Every function here takes the caller's transaction, so a unit of work
//! composes them and commits once.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, Row};
use uuid::Uuid;

use taxa_core::error::TAKEN;
use taxa_core::{Error, FieldErrors, Result, Taxonomy, Term, TreeDiff, Vocabulary};

pub(crate) const VOCABULARY_COLUMNS: &str =
    "id, alias, title, description, types, created_at, updated_at";

pub(crate) const TERM_COLUMNS: &str = "id, name, slug, description, created_at, updated_at";

pub(crate) const TAXONOMY_COLUMNS: &str = "id, term_id, vocabulary_id, parent_id, lft, rgt";

pub(crate) fn row_to_vocabulary(r: &PgRow) -> Vocabulary {
    Vocabulary {
        id: r.get("id"),
        alias: r.get("alias"),
        title: r.get("title"),
        description: r.get("description"),
        types: r.get("types"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

pub(crate) fn row_to_term(r: &PgRow) -> Term {
    Term {
        id: r.get("id"),
        name: r.get("name"),
        slug: r.get("slug"),
        description: r.get("description"),
        created_at: r.get("created_at"),
        updated_at: r.get("updated_at"),
    }
}

pub(crate) fn row_to_taxonomy(r: &PgRow) -> Taxonomy {
    Taxonomy {
        id: r.get("id"),
        term_id: r.get("term_id"),
        vocabulary_id: r.get("vocabulary_id"),
        parent_id: r.get("parent_id"),
        lft: r.get("lft"),
        rgt: r.get("rgt"),
    }
}

/// Map a unique violation on `term.slug` to the field error callers expect.
pub(crate) fn slug_error(e: sqlx::Error) -> Error {
    match &e {
        sqlx::Error::Database(db) if db.is_unique_violation() => {
            Error::Validation(FieldErrors::single("slug", TAKEN))
        }
        _ => Error::Database(e),
    }
}

/// Lock a vocabulary row for the rest of the transaction.
pub(crate) async fn lock_vocabulary(
    conn: &mut PgConnection,
    id: Uuid,
) -> Result<Option<Vocabulary>> {
    let row = sqlx::query(&format!(
        "SELECT {} FROM vocabulary WHERE id = $1 FOR UPDATE",
        VOCABULARY_COLUMNS
    ))
    .bind(id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(Error::Database)?;
    Ok(row.as_ref().map(row_to_vocabulary))
}

pub(crate) async fn fetch_rows(conn: &mut PgConnection, vocabulary_id: Uuid) -> Result<Vec<Taxonomy>> {
    let rows = sqlx::query(&format!(
        "SELECT {} FROM taxonomy WHERE vocabulary_id = $1 ORDER BY lft, id",
        TAXONOMY_COLUMNS
    ))
    .bind(vocabulary_id)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;
    Ok(rows.iter().map(row_to_taxonomy).collect())
}

pub(crate) async fn insert_term(conn: &mut PgConnection, term: &Term) -> Result<()> {
    sqlx::query(
        "INSERT INTO term (id, name, slug, description, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6)",
    )
    .bind(term.id)
    .bind(&term.name)
    .bind(&term.slug)
    .bind(&term.description)
    .bind(term.created_at)
    .bind(term.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(slug_error)?;
    Ok(())
}

pub(crate) async fn update_term(conn: &mut PgConnection, term: &Term) -> Result<()> {
    let result = sqlx::query(
        "UPDATE term SET name = $2, slug = $3, description = $4, updated_at = $5
         WHERE id = $1",
    )
    .bind(term.id)
    .bind(&term.name)
    .bind(&term.slug)
    .bind(&term.description)
    .bind(term.updated_at)
    .execute(&mut *conn)
    .await
    .map_err(slug_error)?;

    if result.rows_affected() == 0 {
        return Err(Error::TermNotFound(term.id));
    }
    Ok(())
}

/// Key-share lock the terms new nodes point at, failing on the first one
/// that does not exist.
async fn lock_referenced_terms(conn: &mut PgConnection, term_ids: &[Uuid]) -> Result<()> {
    let found: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM term WHERE id = ANY($1) ORDER BY id FOR KEY SHARE",
    )
    .bind(term_ids)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    match term_ids.iter().find(|id| !found.contains(id)) {
        Some(missing) => Err(Error::TermNotFound(*missing)),
        None => Ok(()),
    }
}

fn columns(nodes: &[Taxonomy]) -> (Vec<Uuid>, Vec<Option<Uuid>>, Vec<i64>, Vec<i64>) {
    let mut ids = Vec::with_capacity(nodes.len());
    let mut parents = Vec::with_capacity(nodes.len());
    let mut lfts = Vec::with_capacity(nodes.len());
    let mut rgts = Vec::with_capacity(nodes.len());
    for n in nodes {
        ids.push(n.id);
        parents.push(n.parent_id);
        lfts.push(n.lft);
        rgts.push(n.rgt);
    }
    (ids, parents, lfts, rgts)
}

/// Write a tree diff. Returns the number of node rows touched.
pub(crate) async fn apply_diff(
    conn: &mut PgConnection,
    vocabulary_id: Uuid,
    diff: &TreeDiff,
) -> Result<u64> {
    let mut touched = 0;

    if !diff.deleted.is_empty() {
        let ids: Vec<Uuid> = diff.deleted.iter().map(|n| n.id).collect();
        touched += sqlx::query("DELETE FROM taxonomy WHERE id = ANY($1) AND vocabulary_id = $2")
            .bind(&ids)
            .bind(vocabulary_id)
            .execute(&mut *conn)
            .await
            .map_err(Error::Database)?
            .rows_affected();
    }

    if !diff.updated.is_empty() {
        let (ids, parents, lfts, rgts) = columns(&diff.updated);
        touched += sqlx::query(
            r#"
            UPDATE taxonomy t
            SET parent_id = u.parent_id, lft = u.lft, rgt = u.rgt
            FROM UNNEST($1::uuid[], $2::uuid[], $3::int8[], $4::int8[])
                 AS u(id, parent_id, lft, rgt)
            WHERE t.id = u.id AND t.vocabulary_id = $5
            "#,
        )
        .bind(&ids)
        .bind(&parents)
        .bind(&lfts)
        .bind(&rgts)
        .bind(vocabulary_id)
        .execute(&mut *conn)
        .await
        .map_err(Error::Database)?
        .rows_affected();
    }

    if !diff.inserted.is_empty() {
        let term_ids: Vec<Uuid> = diff.inserted.iter().map(|n| n.term_id).collect();
        lock_referenced_terms(conn, &term_ids).await?;

        let (ids, parents, lfts, rgts) = columns(&diff.inserted);
        touched += sqlx::query(
            r#"
            INSERT INTO taxonomy (id, term_id, vocabulary_id, parent_id, lft, rgt)
            SELECT u.id, u.term_id, $6, u.parent_id, u.lft, u.rgt
            FROM UNNEST($1::uuid[], $2::uuid[], $3::uuid[], $4::int8[], $5::int8[])
                 AS u(id, term_id, parent_id, lft, rgt)
            "#,
        )
        .bind(&ids)
        .bind(&term_ids)
        .bind(&parents)
        .bind(&lfts)
        .bind(&rgts)
        .bind(vocabulary_id)
        .execute(&mut *conn)
        .await
        .map_err(|e| match &e {
            sqlx::Error::Database(db) if db.is_unique_violation() => Error::Conflict(
                "term is already attached to this vocabulary".to_string(),
            ),
            _ => Error::Database(e),
        })?
        .rows_affected();
    }

    Ok(touched)
}

/// Delete the candidates no taxonomy row references any more.
///
/// Candidate rows are locked before the check; concurrent detaches of one
/// term from two vocabularies serialize here. The result follows the order
/// of `candidates`.
pub(crate) async fn prune_terms(conn: &mut PgConnection, candidates: &[Uuid]) -> Result<Vec<Uuid>> {
    if candidates.is_empty() {
        return Ok(Vec::new());
    }

    sqlx::query("SELECT id FROM term WHERE id = ANY($1) ORDER BY id FOR UPDATE")
        .bind(candidates)
        .fetch_all(&mut *conn)
        .await
        .map_err(Error::Database)?;

    let deleted: Vec<Uuid> = sqlx::query_scalar(
        r#"
        DELETE FROM term
        WHERE id = ANY($1)
          AND NOT EXISTS (SELECT 1 FROM taxonomy WHERE taxonomy.term_id = term.id)
        RETURNING id
        "#,
    )
    .bind(candidates)
    .fetch_all(&mut *conn)
    .await
    .map_err(Error::Database)?;

    Ok(candidates
        .iter()
        .filter(|id| deleted.contains(id))
        .copied()
        .collect())
}
