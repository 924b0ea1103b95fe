//! In-memory database setup for integration tests.

use drover::adapters::sqlite::{create_test_pool, Migrator};
use sqlx::SqlitePool;

pub async fn setup_test_db() -> SqlitePool {
    let pool = create_test_pool()
        .await
        .expect("failed to create test pool");
    Migrator::new(pool.clone())
        .run()
        .await
        .expect("failed to run migrations");
    pool
}
