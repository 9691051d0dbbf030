//! Term identity and attributes, independent of any tree position.

use std::sync::Arc;

use tracing::info;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{Term, TermAttributes, ValidTerm};
use crate::traits::TaxonomyStore;
use crate::validation::{DefaultTermValidator, TermValidator};

pub struct TermStore<S> {
    store: Arc<S>,
    validator: Arc<dyn TermValidator>,
}

impl<S> Clone for TermStore<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            validator: Arc::clone(&self.validator),
        }
    }
}

impl<S: TaxonomyStore> TermStore<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_validator(store, Arc::new(DefaultTermValidator))
    }

    pub fn with_validator(store: Arc<S>, validator: Arc<dyn TermValidator>) -> Self {
        Self { store, validator }
    }

    /// Run the configured rules without touching storage.
    pub fn validate(&self, attrs: &TermAttributes) -> Result<ValidTerm> {
        self.validator.validate(attrs)
    }

    pub async fn exists(&self, id: Uuid) -> Result<bool> {
        Ok(self.store.get_term(id).await?.is_some())
    }

    pub async fn get(&self, id: Uuid) -> Result<Term> {
        self.store
            .get_term(id)
            .await?
            .ok_or(Error::TermNotFound(id))
    }

    /// Create a term that is not attached anywhere yet.
    pub async fn create(&self, attrs: &TermAttributes) -> Result<Term> {
        let term = Term::create(self.validate(attrs)?);
        self.store.insert_term(&term).await?;
        info!(
            subsystem = "taxonomy",
            component = "terms",
            op = "create_term",
            term_id = %term.id,
            slug = %term.slug,
            "Term created"
        );
        Ok(term)
    }

    pub async fn update(&self, id: Uuid, attrs: &TermAttributes) -> Result<Term> {
        let fields = self.validate(attrs)?;
        let term = self.get(id).await?.updated(fields);
        self.store.update_term(&term).await?;
        info!(
            subsystem = "taxonomy",
            component = "terms",
            op = "update_term",
            term_id = %id,
            "Term updated"
        );
        Ok(term)
    }

    /// Delete a term. Refused with `Conflict` while any vocabulary uses it.
    pub async fn delete(&self, id: Uuid) -> Result<()> {
        self.store.delete_term(id).await?;
        info!(
            subsystem = "taxonomy",
            component = "terms",
            op = "delete_term",
            term_id = %id,
            "Term deleted"
        );
        Ok(())
    }
}
