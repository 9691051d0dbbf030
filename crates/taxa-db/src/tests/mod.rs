//! PostgreSQL-backed tests. They need a running server and are ignored by
//! default; run them with `cargo test -p taxa-db -- --ignored`.
