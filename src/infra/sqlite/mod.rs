//! SQLite persistence layer.
//!
//! One store per table. Timestamps are RFC 3339 TEXT; amounts are decimal
//! TEXT. Guarded state transitions take an explicit connection so the
//! engine can compose them with ledger writes inside one transaction.

mod ledger;
mod merchants;
mod orders;

pub use ledger::{Posted, SqliteLedgerStore};
pub use merchants::SqliteMerchantStore;
pub use orders::{SqliteOrderStore, Transition};

#[cfg(test)]
pub(crate) mod tests {
    use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

    /// Fresh migrated in-memory database. A single connection keeps every
    /// query on the same in-memory store.
    pub async fn test_pool() -> SqlitePool {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .expect("in-memory sqlite");
        crate::migrations::run_sqlite(&pool)
            .await
            .expect("migrations");
        pool
    }
}
