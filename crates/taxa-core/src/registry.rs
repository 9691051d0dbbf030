//! Vocabulary definitions that trees and term listings are scoped to.

use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::ids::is_present;
use crate::models::{CreateVocabularyRequest, Vocabulary};
use crate::traits::TaxonomyStore;
use crate::validation::validate_vocabulary;

/// Lookup and lifecycle of vocabularies.
pub struct VocabularyRegistry<S> {
    store: Arc<S>,
}

impl<S> Clone for VocabularyRegistry<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
        }
    }
}

impl<S: TaxonomyStore> VocabularyRegistry<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store }
    }

    /// Get a vocabulary by id. The nil id fails without a storage query.
    pub async fn get(&self, id: Uuid) -> Result<Vocabulary> {
        if !is_present(&id) {
            return Err(Error::VocabularyNotFound(id));
        }
        self.store
            .get_vocabulary(id)
            .await?
            .ok_or(Error::VocabularyNotFound(id))
    }

    pub async fn get_by_alias(&self, alias: &str) -> Result<Vocabulary> {
        if alias.is_empty() {
            return Err(Error::VocabularyAliasNotFound(String::new()));
        }
        self.store
            .get_vocabulary_by_alias(alias)
            .await?
            .ok_or_else(|| Error::VocabularyAliasNotFound(alias.to_string()))
    }

    /// All vocabularies, ordered by alias.
    pub async fn list(&self) -> Result<Vec<Vocabulary>> {
        self.store.list_vocabularies().await
    }

    pub async fn create(&self, req: CreateVocabularyRequest) -> Result<Vocabulary> {
        validate_vocabulary(&req)?;
        let vocabulary = Vocabulary::from_request(req);
        self.store.insert_vocabulary(&vocabulary).await?;
        info!(
            subsystem = "taxonomy",
            component = "registry",
            op = "create_vocabulary",
            vocabulary_id = %vocabulary.id,
            vocabulary_alias = %vocabulary.alias,
            "Vocabulary created"
        );
        Ok(vocabulary)
    }

    /// Delete a vocabulary and its whole tree. Returns the ids of terms
    /// deleted because no other vocabulary referenced them.
    pub async fn delete(&self, id: Uuid) -> Result<Vec<Uuid>> {
        if !is_present(&id) {
            return Err(Error::VocabularyNotFound(id));
        }
        let pruned = self.store.delete_vocabulary(id).await?;
        info!(
            subsystem = "taxonomy",
            component = "registry",
            op = "delete_vocabulary",
            vocabulary_id = %id,
            deleted_terms = pruned.len(),
            "Vocabulary deleted"
        );
        Ok(pruned)
    }
}

/// The requested type when the vocabulary allows it, else its first
/// allowed type, else none.
pub fn default_type<'a>(vocabulary: &'a Vocabulary, requested: Option<&str>) -> Option<&'a str> {
    let chosen = requested
        .and_then(|r| vocabulary.types.iter().find(|t| t.as_str() == r))
        .or_else(|| vocabulary.types.first())
        .map(String::as_str);
    if requested.is_some() && chosen != requested {
        debug!(
            vocabulary_alias = %vocabulary.alias,
            requested = ?requested,
            chosen = ?chosen,
            "Requested type not allowed, falling back"
        );
    }
    chosen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn registry() -> VocabularyRegistry<MemoryStore> {
        VocabularyRegistry::new(Arc::new(MemoryStore::new()))
    }

    fn request(alias: &str) -> CreateVocabularyRequest {
        CreateVocabularyRequest {
            alias: alias.into(),
            title: alias.to_uppercase(),
            types: vec!["blog".into(), "page".into()],
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_get_nil_id_is_not_found() {
        let err = registry().get(Uuid::nil()).await.unwrap_err();
        assert!(matches!(err, Error::VocabularyNotFound(id) if id.is_nil()));
    }

    #[tokio::test]
    async fn test_create_get_and_alias_lookup() {
        let registry = registry();
        let created = registry.create(request("categories")).await.unwrap();

        assert_eq!(registry.get(created.id).await.unwrap(), created);
        assert_eq!(registry.get_by_alias("categories").await.unwrap(), created);
        assert!(matches!(
            registry.get_by_alias("tags").await,
            Err(Error::VocabularyAliasNotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_create_duplicate_alias_conflicts() {
        let registry = registry();
        registry.create(request("tags")).await.unwrap();
        let err = registry.create(request("tags")).await.unwrap_err();
        assert!(matches!(err, Error::Conflict(_)));
    }

    #[tokio::test]
    async fn test_create_rejects_invalid_request() {
        let err = registry()
            .create(CreateVocabularyRequest::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_delete_then_get() {
        let registry = registry();
        let created = registry.create(request("tags")).await.unwrap();
        assert!(registry.delete(created.id).await.unwrap().is_empty());
        assert!(registry.get(created.id).await.unwrap_err().is_not_found());
        assert!(registry.list().await.unwrap().is_empty());
    }

    #[test]
    fn test_default_type() {
        let vocab = Vocabulary::from_request(request("categories"));
        assert_eq!(default_type(&vocab, Some("page")), Some("page"));
        assert_eq!(default_type(&vocab, Some("event")), Some("blog"));
        assert_eq!(default_type(&vocab, None), Some("blog"));

        let untyped = Vocabulary::from_request(CreateVocabularyRequest {
            alias: "tags".into(),
            title: "Tags".into(),
            ..Default::default()
        });
        assert_eq!(default_type(&untyped, Some("page")), None);
    }
}
