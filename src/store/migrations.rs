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
            CREATE TABLE IF NOT EXISTS orders (
                id TEXT PRIMARY KEY,
                reference_number TEXT NOT NULL UNIQUE,
                purchase_date TEXT,
                reseller_name TEXT,
                customer_name TEXT NOT NULL,
                customer_email TEXT NOT NULL,
                alternative_email TEXT,
                mobile_number TEXT,
                payment_status TEXT,
                remarks TEXT,
                status TEXT NOT NULL DEFAULT 'RECEIVED',
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_orders_status ON orders(status);

            CREATE TABLE IF NOT EXISTS order_items (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL REFERENCES orders(id) ON DELETE CASCADE,
                confirmation_code TEXT NOT NULL UNIQUE,
                product_name TEXT NOT NULL,
                product_variant TEXT,
                sku TEXT NOT NULL,
                visit_date TEXT,
                quantity INTEGER NOT NULL DEFAULT 1,
                unit_price INTEGER,
                completed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_order_items_order ON order_items(order_id);

            CREATE TABLE IF NOT EXISTS sync_logs (
                id TEXT PRIMARY KEY,
                confirmation_code TEXT NOT NULL,
                reference_number TEXT NOT NULL,
                target_service TEXT NOT NULL,
                request_payload TEXT NOT NULL,
                response_payload TEXT,
                status TEXT NOT NULL,
                error_message TEXT,
                attempt_count INTEGER NOT NULL DEFAULT 1,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now')),
                UNIQUE (confirmation_code, target_service)
            );
            CREATE INDEX IF NOT EXISTS idx_sync_logs_status ON sync_logs(status);
            CREATE INDEX IF NOT EXISTS idx_sync_logs_target ON sync_logs(target_service);

            CREATE TABLE IF NOT EXISTS esim_details (
                id TEXT PRIMARY KEY,
                order_item_id TEXT NOT NULL REFERENCES order_items(id) ON DELETE CASCADE,
                product_name TEXT NOT NULL,
                valid_from TEXT,
                valid_until TEXT,
                iccid TEXT NOT NULL UNIQUE,
                qr_code TEXT NOT NULL,
                smdp_address TEXT NOT NULL,
                activation_code TEXT NOT NULL,
                combined_activation TEXT NOT NULL,
                apn_name TEXT,
                apn_username TEXT,
                apn_password TEXT,
                status TEXT NOT NULL DEFAULT 'PENDING',
                provisioned_at TEXT,
                activated_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_esim_details_status ON esim_details(status);
            CREATE INDEX IF NOT EXISTS idx_esim_details_item ON esim_details(order_item_id);

            CREATE TABLE IF NOT EXISTS upload_otps (
                id TEXT PRIMARY KEY,
                order_id TEXT NOT NULL,
                order_item_id TEXT NOT NULL,
                confirmation_code TEXT NOT NULL,
                otp_code TEXT NOT NULL UNIQUE,
                otp_expires_at TEXT NOT NULL,
                pdf_file_path TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'PENDING',
                confirmed_by TEXT,
                confirmed_at TEXT,
                created_at TEXT NOT NULL DEFAULT (datetime('now')),
                updated_at TEXT NOT NULL DEFAULT (datetime('now'))
            );
            CREATE INDEX IF NOT EXISTS idx_upload_otps_status ON upload_otps(status);
        "#,
    },
    Migration {
        version: 2,
        name: "pdf_upload_tracking",
        sql: r#"
            ALTER TABLE esim_details ADD COLUMN pdf_file_path TEXT;
            ALTER TABLE esim_details ADD COLUMN pdf_uploaded_at TEXT;
            ALTER TABLE esim_details ADD COLUMN pdf_upload_confirmed_at TEXT;
            ALTER TABLE upload_otps ADD COLUMN upload_url TEXT;
            ALTER TABLE upload_otps ADD COLUMN upload_response TEXT;
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

    for migration in MIGRATIONS {
        if migration.version > current_version {
            tracing::info!(
                version = migration.version,
                name = migration.name,
                "Applying migration"
            );
            conn.execute_batch(migration.sql).await.map_err(|e| {
                DatabaseError::Migration(format!(
                    "Migration V{} ({}) failed: {e}",
                    migration.version, migration.name
                ))
            })?;
            seed_version(conn, migration.version, migration.name).await?;
        }
    }

    Ok(())
}

/// Get the highest applied migration version, or 0 if none.
async fn get_current_version(conn: &Connection) -> Result<i64, DatabaseError> {
    let mut rows = conn
        .query("SELECT COALESCE(MAX(version), 0) FROM _migrations", ())
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to query migration version: {e}")))?;

    let row = rows
        .next()
        .await
        .map_err(|e| DatabaseError::Migration(format!("Failed to read migration version: {e}")))?;

    match row {
        Some(row) => {
            let version: i64 = row.get(0).map_err(|e| {
                DatabaseError::Migration(format!("Failed to parse migration version: {e}"))
            })?;
            Ok(version)
        }
        None => Ok(0),
    }
}

/// Insert a version record into `_migrations`.
async fn seed_version(conn: &Connection, version: i64, name: &str) -> Result<(), DatabaseError> {
    conn.execute(
        "INSERT OR IGNORE INTO _migrations (version, name) VALUES (?1, ?2)",
        libsql::params![version, name],
    )
    .await
    .map_err(|e| DatabaseError::Migration(format!("Failed to record migration V{version}: {e}")))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn test_conn() -> Connection {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .unwrap();
        db.connect().unwrap()
    }

    #[tokio::test]
    async fn migrations_create_all_tables() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        for table in &[
            "orders",
            "order_items",
            "sync_logs",
            "esim_details",
            "upload_otps",
            "_migrations",
        ] {
            let mut rows = conn
                .query(
                    "SELECT COUNT(*) FROM sqlite_master WHERE type='table' AND name=?1",
                    libsql::params![*table],
                )
                .await
                .unwrap();
            let row = rows.next().await.unwrap().unwrap();
            let count: i64 = row.get(0).unwrap();
            assert_eq!(count, 1, "Table '{}' should exist", table);
        }
    }

    #[tokio::test]
    async fn migrations_are_idempotent() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();
        run_migrations(&conn).await.unwrap();

        let version = get_current_version(&conn).await.unwrap();
        assert_eq!(version, 2);
    }

    #[tokio::test]
    async fn version_tracking() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        let mut rows = conn
            .query("SELECT version, name FROM _migrations ORDER BY version", ())
            .await
            .unwrap();

        let row1 = rows.next().await.unwrap().unwrap();
        let v1: i64 = row1.get(0).unwrap();
        let n1: String = row1.get(1).unwrap();
        assert_eq!(v1, 1);
        assert_eq!(n1, "initial_schema");

        let row2 = rows.next().await.unwrap().unwrap();
        let v2: i64 = row2.get(0).unwrap();
        let n2: String = row2.get(1).unwrap();
        assert_eq!(v2, 2);
        assert_eq!(n2, "pdf_upload_tracking");
    }

    #[tokio::test]
    async fn v2_columns_are_writable() {
        let conn = test_conn().await;
        run_migrations(&conn).await.unwrap();

        conn.execute(
            "INSERT INTO esim_details (id, order_item_id, product_name, iccid, qr_code,
                smdp_address, activation_code, combined_activation, pdf_file_path)
             VALUES ('e1', 'i1', 'p', '89620001', 'qr', 'smdp.example', 'AC-1', 'LPA:1', '/tmp/x.pdf')",
            (),
        )
        .await
        .unwrap();
    }
}
