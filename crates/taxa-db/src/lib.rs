//! # taxa-db
//!
//! PostgreSQL storage for taxa.
//!
//! This crate provides:
//! - Connection pool management configured from the environment
//! - SQL migrations for the vocabulary, term and taxonomy tables
//! - [`PgTaxonomyStore`], a transactional [`taxa_core::TaxonomyStore`]
//!
//! ## Example
//!
//! ```rust,ignore
//! use taxa_db::{Database, TermAttributes};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let db = Database::connect("postgres://localhost/taxa").await?;
//!     db.migrate().await?;
//!
//!     let service = db.service();
//!     let categories = service.vocabularies().get_by_alias("categories").await?;
//!     service
//!         .add_term(categories.id, TermAttributes::named("Sports"), None)
//!         .await?;
//!     Ok(())
//! }
//! ```

use std::sync::Arc;

pub mod pool;
pub mod store;
mod store_tx;

#[cfg(all(test, feature = "migrations"))]
mod tests;

// Not test-only: downstream integration tests use DEFAULT_TEST_DATABASE_URL too
#[cfg(feature = "migrations")]
pub mod test_fixtures;

// Re-export core types
pub use taxa_core::*;

pub use pool::{
    create_pool, create_pool_with_config, create_scoped_pool, database_url_from_env,
    log_pool_metrics, PoolConfig,
};
pub use store::PgTaxonomyStore;

/// Connection pool plus the store built on it.
#[derive(Clone)]
pub struct Database {
    pub pool: sqlx::Pool<sqlx::Postgres>,
    pub store: Arc<PgTaxonomyStore>,
}

impl Database {
    pub fn new(pool: sqlx::Pool<sqlx::Postgres>) -> Self {
        Self {
            store: Arc::new(PgTaxonomyStore::new(pool.clone())),
            pool,
        }
    }

    /// Create a new Database instance by connecting to the given URL.
    pub async fn connect(url: &str) -> Result<Self> {
        let pool = create_pool(url).await?;
        Ok(Self::new(pool))
    }

    pub async fn connect_with_config(url: &str, config: PoolConfig) -> Result<Self> {
        let pool = create_pool_with_config(url, config).await?;
        Ok(Self::new(pool))
    }

    /// Connect using `DATABASE_URL` and the `DATABASE_*` pool variables.
    pub async fn from_env() -> Result<Self> {
        let url = database_url_from_env()?;
        Self::connect_with_config(&url, PoolConfig::from_env()?).await
    }

    /// Run pending migrations.
    #[cfg(feature = "migrations")]
    pub async fn migrate(&self) -> Result<()> {
        migrate(&self.pool).await
    }

    /// A service over this database.
    pub fn service(&self) -> TaxonomyService<PgTaxonomyStore> {
        TaxonomyService::new(Arc::clone(&self.store))
    }

    pub fn pool(&self) -> &sqlx::Pool<sqlx::Postgres> {
        &self.pool
    }
}

/// Apply the embedded migrations to `pool`.
#[cfg(feature = "migrations")]
pub async fn migrate(pool: &sqlx::Pool<sqlx::Postgres>) -> Result<()> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| Error::Database(sqlx::Error::Migrate(Box::new(e))))?;
    tracing::info!(
        subsystem = "database",
        component = "migrations",
        op = "migrate",
        "Migrations applied"
    );
    Ok(())
}
