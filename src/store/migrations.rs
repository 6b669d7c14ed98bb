//! Version-tracked database migrations for the libSQL backend.
//!
//! Each migration has a version number and SQL. `run_migrations()` checks
//! the current version and applies only the new ones sequentially.

use libsql::Connection;

use crate::error::DatabaseError;

/// A single migration step.
struct Migration {
    version: i64,
    name: &'static str,
    sql: &'static str,
}

/// All migrations in order. Add new versions to the end.
static MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        name: "initial_schema",
        sql: r#"
            CREATE TABLE IF NOT EXISTS registrations (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'user_created',
                current_step TEXT NOT NULL DEFAULT 'user_form',
                completed_steps TEXT NOT NULL DEFAULT '[]',
                user_data TEXT,
                clinic_data TEXT,
                subscription_data TEXT,
                payment_data TEXT,
                verification_code TEXT,
                email_verified INTEGER NOT NULL DEFAULT 0,
                email_verified_at TEXT,
                payment_status TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                expires_at TEXT NOT NULL,
                completed_at TEXT,
                created_user_id TEXT,
                created_clinic_id TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_registrations_email ON registrations(email);
            CREATE INDEX IF NOT EXISTS idx_registrations_status ON registrations(status);

            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT NOT NULL,
                password_hash TEXT NOT NULL,
                email_verified_at TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS subscription_tiers (
                code TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                monthly_price TEXT NOT NULL,
                yearly_price TEXT NOT NULL,
                currency TEXT NOT NULL DEFAULT 'USD',
                is_active INTEGER NOT NULL DEFAULT 1
            );

            CREATE TABLE IF NOT EXISTS clinics (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                email TEXT NOT NULL UNIQUE,
                tier_code TEXT NOT NULL REFERENCES subscription_tiers(code),
                billing_cycle TEXT NOT NULL,
                phone TEXT,
                address TEXT,
                city TEXT,
                country TEXT,
                specialty TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS user_roles (
                user_id TEXT NOT NULL REFERENCES users(id),
                clinic_id TEXT NOT NULL REFERENCES clinics(id),
                role TEXT NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (user_id, clinic_id, role)
            );
        "#,
    },
    Migration {
        version: 2,
        name: "seed_subscription_tiers",
        sql: r#"
            INSERT OR IGNORE INTO subscription_tiers (code, name, monthly_price, yearly_price, currency, is_active)
            VALUES
                ('basic', 'Basic', '49.90', '499.00', 'USD', 1),
                ('professional', 'Professional', '99.90', '999.00', 'USD', 1),
                ('enterprise', 'Enterprise', '199.90', '1999.00', 'USD', 1);
        "#,
    },
];

/// Run all pending migrations against the given connection.
///
/// Creates the `_migrations` table if it doesn't exist.
pub async fn run_migrations(conn: &Connection) -> Result<(), DatabaseError> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS _migrations (
            version INTEGER PRIMARY KEY,
            name TEXT NOT NULL,
            applied_at TEXT NOT NULL DEFAULT (datetime('now'))
        )",
        (),
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to create _migrations table: {e}")))?;

    let current_version = get_current_version(conn).await?;

    for migration in MIGRATIONS.iter().filter(|m| m.version > current_version) {
        tracing::info!(
            version = migration.version,
            name = migration.name,
            "Applying migration"
        );
        conn.execute_batch(migration.sql).await.map_err(|e| {
            DatabaseError::Migration(format!(
                "Migration {} ({}) failed: {e}",
                migration.version, migration.name
            ))
        })?;
        conn.execute(
            "INSERT INTO _migrations (version, name) VALUES (?1, ?2)",
            libsql::params![migration.version, migration.name],
        )
        .await
        .map_err(|e| {
            DatabaseError::Migration(format!(
                "Failed to record migration {}: {e}",
                migration.version
            ))
        })?;
    }

    Ok(())
}

/// Highest applied migration version, or 0 for a fresh database.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration row: {e}")))?
    {
        Some(row) => Ok(row.get::<i64>(0).unwrap_or(0)),
        None => Ok(0),
    }
}
