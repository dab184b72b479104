use sqlx::{PgPool, Row};
use tracing::{error, info};

use super::PersistenceError;

pub struct MigrationRunner {
    pool: PgPool,
}

impl MigrationRunner {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Apply all pending migrations. Safe to call on every startup.
    pub async fn run_migrations(&self) -> Result<(), PersistenceError> {
        self.create_migrations_table().await?;

        let migrations = vec![("001_warehouse_schema", include_str!("../../sql/warehouse_schema.sql"))];

        for (name, sql) in migrations {
            if self.is_migration_applied(name).await? {
                info!("Migration {} already applied, skipping", name);
            } else {
                info!("Applying migration: {}", name);
                self.apply_migration(name, sql).await?;
            }
        }

        Ok(())
    }

    async fn create_migrations_table(&self) -> Result<(), PersistenceError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS migrations (
                id SERIAL PRIMARY KEY,
                name VARCHAR(255) NOT NULL UNIQUE,
                applied_at TIMESTAMPTZ DEFAULT NOW()
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn is_migration_applied(&self, name: &str) -> Result<bool, PersistenceError> {
        let row = sqlx::query("SELECT COUNT(*) as count FROM migrations WHERE name = $1")
            .bind(name)
            .fetch_one(&self.pool)
            .await?;

        let count: i64 = row.get("count");
        Ok(count > 0)
    }

    async fn apply_migration(&self, name: &str, sql: &str) -> Result<(), PersistenceError> {
        if let Err(e) = sqlx::raw_sql(sql).execute(&self.pool).await {
            error!("Migration {} failed: {}", name, e);
            return Err(e.into());
        }

        sqlx::query("INSERT INTO migrations (name) VALUES ($1)")
            .bind(name)
            .execute(&self.pool)
            .await?;

        info!("Successfully applied migration: {}", name);
        Ok(())
    }
}
