//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. The two atomicity-critical
//! statements live here: the sticky-SUCCESS ledger upsert (conditional
//! `ON CONFLICT ... DO UPDATE ... WHERE`) and the finalize lock
//! (conditional `UPDATE ... WHERE status = 'COMPLETED'`).

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::migrations;
use crate::store::model::{
    EsimDetailRow, EsimStatus, NewEsimDetail, NewOrder, NewOrderItem, NewUploadOtp,
    OrderItemDetail, OrderRow, OrderStatus, OtpStatus, SyncLogEntry, SyncLogRow, SyncStatus,
    UploadOtp,
};
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(&backend.conn).await?;
        Ok(backend)
    }
}

// ── Helper functions ────────────────────────────────────────────────

fn query_err(e: libsql::Error) -> DatabaseError {
    DatabaseError::Query(e.to_string())
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return ndt.and_utc();
    }
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    DateTime::<Utc>::MIN_UTC
}

fn opt_datetime(s: Option<String>) -> Option<DateTime<Utc>> {
    s.map(|s| parse_datetime(&s))
}

fn to_rfc3339(dt: Option<DateTime<Utc>>) -> Option<String> {
    dt.map(|d| d.to_rfc3339())
}

const ORDER_COLUMNS: &str = "id, reference_number, purchase_date, reseller_name, customer_name, \
     customer_email, alternative_email, mobile_number, payment_status, remarks, status, \
     created_at, updated_at";

fn row_to_order(row: &libsql::Row) -> Result<OrderRow, libsql::Error> {
    Ok(OrderRow {
        id: row.get(0)?,
        reference_number: row.get(1)?,
        purchase_date: opt_datetime(row.get::<String>(2).ok()),
        reseller_name: row.get::<String>(3).ok(),
        customer_name: row.get(4)?,
        customer_email: row.get(5)?,
        alternative_email: row.get::<String>(6).ok(),
        mobile_number: row.get::<String>(7).ok(),
        payment_status: row.get::<String>(8).ok(),
        remarks: row.get::<String>(9).ok(),
        status: OrderStatus::parse(&row.get::<String>(10)?),
        created_at: parse_datetime(&row.get::<String>(11)?),
        updated_at: parse_datetime(&row.get::<String>(12)?),
    })
}

const ITEM_DETAIL_COLUMNS: &str = "i.id, i.order_id, i.confirmation_code, o.reference_number, \
     o.purchase_date, o.customer_name, o.customer_email, o.alternative_email, o.mobile_number, \
     o.payment_status, o.remarks, i.product_name, i.product_variant, i.sku, i.visit_date, \
     i.quantity, i.unit_price, i.completed_at";

fn row_to_item_detail(row: &libsql::Row) -> Result<OrderItemDetail, libsql::Error> {
    Ok(OrderItemDetail {
        order_item_id: row.get(0)?,
        order_id: row.get(1)?,
        confirmation_code: row.get(2)?,
        reference_number: row.get(3)?,
        purchase_date: opt_datetime(row.get::<String>(4).ok()),
        customer_name: row.get(5)?,
        customer_email: row.get(6)?,
        alternative_email: row.get::<String>(7).ok(),
        mobile_number: row.get::<String>(8).ok(),
        payment_status: row.get::<String>(9).ok(),
        remarks: row.get::<String>(10).ok(),
        product_name: row.get(11)?,
        product_variant: row.get::<String>(12).ok(),
        sku: row.get(13)?,
        visit_date: opt_datetime(row.get::<String>(14).ok()),
        quantity: row.get(15)?,
        unit_price: row.get::<i64>(16).ok(),
        completed_at: opt_datetime(row.get::<String>(17).ok()),
    })
}

const SYNC_COLUMNS: &str = "id, confirmation_code, reference_number, target_service, \
     request_payload, response_payload, status, error_message, attempt_count, created_at, \
     updated_at";

fn row_to_sync_log(row: &libsql::Row) -> Result<SyncLogRow, libsql::Error> {
    let request_raw: String = row.get(4)?;
    let response_raw: Option<String> = row.get::<String>(5).ok();
    Ok(SyncLogRow {
        id: row.get(0)?,
        confirmation_code: row.get(1)?,
        reference_number: row.get(2)?,
        target_service: row.get(3)?,
        request_payload: serde_json::from_str(&request_raw)
            .unwrap_or(serde_json::Value::Null),
        response_payload: response_raw.and_then(|s| serde_json::from_str(&s).ok()),
        status: SyncStatus::parse(&row.get::<String>(6)?),
        error_message: row.get::<String>(7).ok(),
        attempt_count: row.get(8)?,
        created_at: parse_datetime(&row.get::<String>(9)?),
        updated_at: parse_datetime(&row.get::<String>(10)?),
    })
}

const ESIM_COLUMNS: &str = "id, order_item_id, product_name, valid_from, valid_until, iccid, \
     qr_code, smdp_address, activation_code, combined_activation, apn_name, apn_username, \
     apn_password, status, pdf_file_path, pdf_uploaded_at, provisioned_at, activated_at, \
     created_at, updated_at";

fn row_to_esim(row: &libsql::Row) -> Result<EsimDetailRow, libsql::Error> {
    Ok(EsimDetailRow {
        id: row.get(0)?,
        order_item_id: row.get(1)?,
        product_name: row.get(2)?,
        valid_from: row.get::<String>(3).ok(),
        valid_until: row.get::<String>(4).ok(),
        iccid: row.get(5)?,
        qr_code: row.get(6)?,
        smdp_address: row.get(7)?,
        activation_code: row.get(8)?,
        combined_activation: row.get(9)?,
        apn_name: row.get::<String>(10).ok(),
        apn_username: row.get::<String>(11).ok(),
        apn_password: row.get::<String>(12).ok(),
        status: EsimStatus::parse(&row.get::<String>(13)?),
        pdf_file_path: row.get::<String>(14).ok(),
        pdf_uploaded_at: opt_datetime(row.get::<String>(15).ok()),
        provisioned_at: opt_datetime(row.get::<String>(16).ok()),
        activated_at: opt_datetime(row.get::<String>(17).ok()),
        created_at: parse_datetime(&row.get::<String>(18)?),
        updated_at: parse_datetime(&row.get::<String>(19)?),
    })
}

const OTP_COLUMNS: &str = "id, order_id, order_item_id, confirmation_code, otp_code, \
     otp_expires_at, pdf_file_path, upload_url, status, confirmed_by, confirmed_at, created_at, \
     updated_at";

fn row_to_otp(row: &libsql::Row) -> Result<UploadOtp, libsql::Error> {
    Ok(UploadOtp {
        id: row.get(0)?,
        order_id: row.get(1)?,
        order_item_id: row.get(2)?,
        confirmation_code: row.get(3)?,
        otp_code: row.get(4)?,
        expires_at: parse_datetime(&row.get::<String>(5)?),
        pdf_file_path: row.get(6)?,
        upload_url: row.get::<String>(7).ok(),
        status: OtpStatus::parse(&row.get::<String>(8)?),
        confirmed_by: row.get::<String>(9).ok(),
        confirmed_at: opt_datetime(row.get::<String>(10).ok()),
        created_at: parse_datetime(&row.get::<String>(11)?),
        updated_at: parse_datetime(&row.get::<String>(12)?),
    })
}

/// Upsert the order row plus all item rows. Runs inside a transaction.
async fn upsert_batch(
    conn: &Connection,
    order: &NewOrder,
    items: &[NewOrderItem],
) -> Result<String, DatabaseError> {
    conn.execute(
        "INSERT INTO orders (id, reference_number, purchase_date, reseller_name, customer_name,
            customer_email, alternative_email, mobile_number, payment_status, remarks)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
         ON CONFLICT(reference_number) DO UPDATE SET
            purchase_date = excluded.purchase_date,
            reseller_name = excluded.reseller_name,
            customer_name = excluded.customer_name,
            customer_email = excluded.customer_email,
            alternative_email = excluded.alternative_email,
            mobile_number = excluded.mobile_number,
            payment_status = excluded.payment_status,
            remarks = excluded.remarks,
            updated_at = datetime('now')",
        params![
            Uuid::new_v4().to_string(),
            order.reference_number.as_str(),
            to_rfc3339(order.purchase_date),
            order.reseller_name.clone(),
            order.customer_name.as_str(),
            order.customer_email.as_str(),
            order.alternative_email.clone(),
            order.mobile_number.clone(),
            order.payment_status.clone(),
            order.remarks.clone(),
        ],
    )
    .await
    .map_err(query_err)?;

    let mut rows = conn
        .query(
            "SELECT id FROM orders WHERE reference_number = ?1",
            params![order.reference_number.as_str()],
        )
        .await
        .map_err(query_err)?;
    let order_id: String = rows
        .next()
        .await
        .map_err(query_err)?
        .ok_or_else(|| DatabaseError::NotFound {
            entity: "order".into(),
            id: order.reference_number.clone(),
        })?
        .get(0)
        .map_err(query_err)?;

    for item in items {
        conn.execute(
            "INSERT INTO order_items (id, order_id, confirmation_code, product_name,
                product_variant, sku, visit_date, quantity, unit_price)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT(confirmation_code) DO UPDATE SET
                product_name = excluded.product_name,
                product_variant = excluded.product_variant,
                sku = excluded.sku,
                visit_date = excluded.visit_date,
                quantity = excluded.quantity,
                unit_price = excluded.unit_price,
                updated_at = datetime('now')",
            params![
                Uuid::new_v4().to_string(),
                order_id.as_str(),
                item.confirmation_code.as_str(),
                item.product_name.as_str(),
                item.product_variant.clone(),
                item.sku.as_str(),
                to_rfc3339(item.visit_date),
                item.quantity,
                item.unit_price,
            ],
        )
        .await
        .map_err(query_err)?;
    }

    Ok(order_id)
}

// ── Trait implementation ────────────────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    // ── Orders ──────────────────────────────────────────────────────

    async fn upsert_order_with_items(
        &self,
        order: &NewOrder,
        items: &[NewOrderItem],
    ) -> Result<String, DatabaseError> {
        let tx = self
            .conn
            .transaction()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open transaction: {e}")))?;

        match upsert_batch(&tx, order, items).await {
            Ok(order_id) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Query(format!("Commit failed: {e}")))?;
                Ok(order_id)
            }
            Err(e) => {
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }

    async fn get_order(&self, id: &str) -> Result<Option<OrderRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_order(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn get_order_by_reference(
        &self,
        reference_number: &str,
    ) -> Result<Option<OrderRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ORDER_COLUMNS} FROM orders WHERE reference_number = ?1"),
                params![reference_number],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_order(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn update_order_status(
        &self,
        id: &str,
        status: OrderStatus,
    ) -> Result<(), DatabaseError> {
        let current = self
            .get_order(id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "order".into(),
                id: id.to_string(),
            })?
            .status;

        if current == status {
            return Ok(());
        }
        if !current.can_transition_to(status) {
            return Err(DatabaseError::InvalidTransition {
                entity: "order".into(),
                from: current.as_str().into(),
                to: status.as_str().into(),
            });
        }

        self.conn
            .execute(
                "UPDATE orders SET status = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id, status.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn find_item_by_confirmation_code(
        &self,
        confirmation_code: &str,
    ) -> Result<Option<OrderItemDetail>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_DETAIL_COLUMNS}
                     FROM order_items i
                     JOIN orders o ON o.id = i.order_id
                     WHERE i.confirmation_code = ?1
                     LIMIT 1"
                ),
                params![confirmation_code],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_item_detail(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn find_item_by_id(&self, id: &str) -> Result<Option<OrderItemDetail>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ITEM_DETAIL_COLUMNS}
                     FROM order_items i
                     JOIN orders o ON o.id = i.order_id
                     WHERE i.id = ?1
                     LIMIT 1"
                ),
                params![id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_item_detail(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn mark_item_completed(&self, item_id: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE order_items
                 SET completed_at = ?2, updated_at = datetime('now')
                 WHERE id = ?1 AND completed_at IS NULL",
                params![item_id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;

        // Cascade: when every sibling is completed, complete the order.
        let mut rows = self
            .conn
            .query(
                "SELECT order_id FROM order_items WHERE id = ?1",
                params![item_id],
            )
            .await
            .map_err(query_err)?;
        let Some(row) = rows.next().await.map_err(query_err)? else {
            return Err(DatabaseError::NotFound {
                entity: "order_item".into(),
                id: item_id.to_string(),
            });
        };
        let order_id: String = row.get(0).map_err(query_err)?;

        let mut rows = self
            .conn
            .query(
                "SELECT COUNT(*) FROM order_items WHERE order_id = ?1 AND completed_at IS NULL",
                params![order_id.as_str()],
            )
            .await
            .map_err(query_err)?;
        let remaining: i64 = match rows.next().await.map_err(query_err)? {
            Some(row) => row.get(0).map_err(query_err)?,
            None => 0,
        };

        if remaining == 0 {
            self.conn
                .execute(
                    "UPDATE orders SET status = 'COMPLETED', updated_at = datetime('now')
                     WHERE id = ?1 AND status != 'COMPLETED'",
                    params![order_id.as_str()],
                )
                .await
                .map_err(query_err)?;
        }

        Ok(())
    }

    // ── Sync ledger ─────────────────────────────────────────────────

    async fn upsert_sync_log(&self, entry: &SyncLogEntry) -> Result<(), DatabaseError> {
        // The WHERE clause on the conflict update makes SUCCESS sticky:
        // a row already at SUCCESS is left untouched, attempt count included.
        self.conn
            .execute(
                "INSERT INTO sync_logs (id, confirmation_code, reference_number, target_service,
                    request_payload, response_payload, status, error_message, attempt_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 1)
                 ON CONFLICT(confirmation_code, target_service) DO UPDATE SET
                    request_payload = excluded.request_payload,
                    response_payload = excluded.response_payload,
                    status = excluded.status,
                    error_message = excluded.error_message,
                    attempt_count = sync_logs.attempt_count + 1,
                    updated_at = datetime('now')
                 WHERE sync_logs.status != 'SUCCESS'",
                params![
                    Uuid::new_v4().to_string(),
                    entry.confirmation_code.as_str(),
                    entry.reference_number.as_str(),
                    entry.target_service.as_str(),
                    entry.request_payload.to_string(),
                    entry.response_payload.as_ref().map(|v| v.to_string()),
                    entry.status.as_str(),
                    entry.error_message.clone(),
                ],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn is_already_synced(
        &self,
        confirmation_code: &str,
        target_service: &str,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                "SELECT status FROM sync_logs
                 WHERE confirmation_code = ?1 AND target_service = ?2
                 LIMIT 1",
                params![confirmation_code, target_service],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => {
                let status: String = row.get(0).map_err(query_err)?;
                Ok(status == "SUCCESS")
            }
            None => Ok(false),
        }
    }

    async fn find_sync_log(
        &self,
        confirmation_code: &str,
        target_service: &str,
    ) -> Result<Option<SyncLogRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {SYNC_COLUMNS} FROM sync_logs
                     WHERE confirmation_code = ?1 AND target_service = ?2
                     LIMIT 1"
                ),
                params![confirmation_code, target_service],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_sync_log(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn get_failed_sync_logs(
        &self,
        target_service: Option<&str>,
        limit: usize,
    ) -> Result<Vec<SyncLogRow>, DatabaseError> {
        let mut rows = match target_service {
            Some(service) => self
                .conn
                .query(
                    &format!(
                        "SELECT {SYNC_COLUMNS} FROM sync_logs
                         WHERE status = 'FAILED' AND target_service = ?1
                         ORDER BY updated_at ASC
                         LIMIT ?2"
                    ),
                    params![service, limit as i64],
                )
                .await
                .map_err(query_err)?,
            None => self
                .conn
                .query(
                    &format!(
                        "SELECT {SYNC_COLUMNS} FROM sync_logs
                         WHERE status = 'FAILED'
                         ORDER BY updated_at ASC
                         LIMIT ?1"
                    ),
                    params![limit as i64],
                )
                .await
                .map_err(query_err)?,
        };

        let mut logs = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            logs.push(row_to_sync_log(&row).map_err(query_err)?);
        }
        Ok(logs)
    }

    // ── eSIM records ────────────────────────────────────────────────

    async fn insert_provisioning(&self, esim: &NewEsimDetail) -> Result<String, DatabaseError> {
        self.conn
            .execute(
                "INSERT INTO esim_details (id, order_item_id, product_name, valid_from,
                    valid_until, iccid, qr_code, smdp_address, activation_code,
                    combined_activation, apn_name, apn_username, apn_password, status,
                    provisioned_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, 'PROCESS', ?14)
                 ON CONFLICT(iccid) DO NOTHING",
                params![
                    Uuid::new_v4().to_string(),
                    esim.order_item_id.as_str(),
                    esim.product_name.as_str(),
                    esim.valid_from.clone(),
                    esim.valid_until.clone(),
                    esim.iccid.as_str(),
                    esim.qr_code.as_str(),
                    esim.smdp_address.as_str(),
                    esim.activation_code.as_str(),
                    esim.combined_activation.as_str(),
                    esim.apn_name.clone(),
                    esim.apn_username.clone(),
                    esim.apn_password.clone(),
                    Utc::now().to_rfc3339(),
                ],
            )
            .await
            .map_err(query_err)?;

        let mut rows = self
            .conn
            .query(
                "SELECT id FROM esim_details WHERE iccid = ?1",
                params![esim.iccid.as_str()],
            )
            .await
            .map_err(query_err)?;

        let row = rows
            .next()
            .await
            .map_err(query_err)?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "esim_detail".into(),
                id: esim.iccid.clone(),
            })?;
        row.get(0).map_err(query_err)
    }

    async fn find_esim(&self, id: &str) -> Result<Option<EsimDetailRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ESIM_COLUMNS} FROM esim_details WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_esim(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn find_esim_by_order_item(
        &self,
        order_item_id: &str,
    ) -> Result<Option<EsimDetailRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {ESIM_COLUMNS} FROM esim_details WHERE order_item_id = ?1"),
                params![order_item_id],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_esim(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn update_esim_status(
        &self,
        id: &str,
        status: EsimStatus,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE esim_details SET status = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id, status.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn mark_as_finalizing(&self, id: &str) -> Result<bool, DatabaseError> {
        // Single conditional UPDATE — the cross-process finalize lock.
        let affected = self
            .conn
            .execute(
                "UPDATE esim_details
                 SET status = 'PROCESS', updated_at = datetime('now')
                 WHERE id = ?1 AND status = 'COMPLETED'",
                params![id],
            )
            .await
            .map_err(query_err)?;
        Ok(affected > 0)
    }

    async fn mark_esim_done(&self, id: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE esim_details
                 SET status = 'DONE', activated_at = ?2, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn confirm_pdf_upload(&self, id: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE esim_details
                 SET status = 'DONE', pdf_upload_confirmed_at = ?2, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_pdf_upload_info(
        &self,
        id: &str,
        pdf_file_path: &str,
        uploaded_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE esim_details
                 SET pdf_file_path = ?2, pdf_uploaded_at = ?3, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, pdf_file_path, uploaded_at.to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn find_pending_upload(
        &self,
        limit: usize,
    ) -> Result<Vec<EsimDetailRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ESIM_COLUMNS} FROM esim_details
                     WHERE status = 'COMPLETED'
                     ORDER BY updated_at ASC
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut esims = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            esims.push(row_to_esim(&row).map_err(query_err)?);
        }
        Ok(esims)
    }

    async fn find_done(&self) -> Result<Vec<EsimDetailRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ESIM_COLUMNS} FROM esim_details
                     WHERE status = 'DONE'
                     ORDER BY updated_at DESC"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut esims = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            esims.push(row_to_esim(&row).map_err(query_err)?);
        }
        Ok(esims)
    }

    async fn find_completed_but_not_done(&self) -> Result<Vec<EsimDetailRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ESIM_COLUMNS} FROM esim_details
                     WHERE status IN ('COMPLETED', 'PENDING_CONFIRMATION')
                     ORDER BY updated_at ASC"
                ),
                (),
            )
            .await
            .map_err(query_err)?;

        let mut esims = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            esims.push(row_to_esim(&row).map_err(query_err)?);
        }
        Ok(esims)
    }

    async fn find_failed_esims(&self, limit: usize) -> Result<Vec<EsimDetailRow>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {ESIM_COLUMNS} FROM esim_details
                     WHERE status = 'FAILED'
                     ORDER BY updated_at ASC
                     LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(query_err)?;

        let mut esims = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            esims.push(row_to_esim(&row).map_err(query_err)?);
        }
        Ok(esims)
    }

    // ── Upload OTPs ─────────────────────────────────────────────────

    async fn insert_otp(&self, otp: &NewUploadOtp) -> Result<UploadOtp, DatabaseError> {
        let id = Uuid::new_v4().to_string();
        let now = Utc::now();

        self.conn
            .execute(
                "INSERT INTO upload_otps (id, order_id, order_item_id, confirmation_code,
                    otp_code, otp_expires_at, pdf_file_path, status, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'PENDING', ?8, ?8)",
                params![
                    id.as_str(),
                    otp.order_id.as_str(),
                    otp.order_item_id.as_str(),
                    otp.confirmation_code.as_str(),
                    otp.otp_code.as_str(),
                    otp.expires_at.to_rfc3339(),
                    otp.pdf_file_path.as_str(),
                    now.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| match e {
                libsql::Error::SqliteFailure(_, ref msg) if msg.contains("UNIQUE") => {
                    DatabaseError::Constraint(format!("duplicate OTP code: {e}"))
                }
                e => query_err(e),
            })?;

        Ok(UploadOtp {
            id,
            order_id: otp.order_id.clone(),
            order_item_id: otp.order_item_id.clone(),
            confirmation_code: otp.confirmation_code.clone(),
            otp_code: otp.otp_code.clone(),
            expires_at: otp.expires_at,
            pdf_file_path: otp.pdf_file_path.clone(),
            upload_url: None,
            status: OtpStatus::Pending,
            confirmed_by: None,
            confirmed_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    async fn find_otp_by_code(&self, otp_code: &str) -> Result<Option<UploadOtp>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!("SELECT {OTP_COLUMNS} FROM upload_otps WHERE otp_code = ?1 LIMIT 1"),
                params![otp_code],
            )
            .await
            .map_err(query_err)?;

        match rows.next().await.map_err(query_err)? {
            Some(row) => Ok(Some(row_to_otp(&row).map_err(query_err)?)),
            None => Ok(None),
        }
    }

    async fn update_otp_status(&self, id: &str, status: OtpStatus) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE upload_otps SET status = ?2, updated_at = datetime('now') WHERE id = ?1",
                params![id, status.as_str()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn confirm_otp_row(&self, id: &str, confirmed_by: &str) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE upload_otps
                 SET status = 'CONFIRMED', confirmed_by = ?2, confirmed_at = ?3,
                     updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, confirmed_by, Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn update_otp_upload_result(
        &self,
        id: &str,
        upload_url: &str,
        response: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        self.conn
            .execute(
                "UPDATE upload_otps
                 SET upload_url = ?2, upload_response = ?3, updated_at = datetime('now')
                 WHERE id = ?1",
                params![id, upload_url, response.to_string()],
            )
            .await
            .map_err(query_err)?;
        Ok(())
    }

    async fn get_pending_otps(&self) -> Result<Vec<UploadOtp>, DatabaseError> {
        let mut rows = self
            .conn
            .query(
                &format!(
                    "SELECT {OTP_COLUMNS} FROM upload_otps
                     WHERE status = 'PENDING' AND otp_expires_at > ?1
                     ORDER BY created_at DESC"
                ),
                params![Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;

        let mut otps = Vec::new();
        while let Some(row) = rows.next().await.map_err(query_err)? {
            otps.push(row_to_otp(&row).map_err(query_err)?);
        }
        Ok(otps)
    }

    async fn expire_old_otps(&self) -> Result<usize, DatabaseError> {
        let affected = self
            .conn
            .execute(
                "UPDATE upload_otps
                 SET status = 'EXPIRED', updated_at = datetime('now')
                 WHERE status = 'PENDING' AND otp_expires_at <= ?1",
                params![Utc::now().to_rfc3339()],
            )
            .await
            .map_err(query_err)?;
        Ok(affected as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn sample_order(reference: &str) -> NewOrder {
        NewOrder {
            reference_number: reference.to_string(),
            purchase_date: Some(Utc::now()),
            reseller_name: Some("Walter Mitty Travel".into()),
            customer_name: "Jane Tan".into(),
            customer_email: "jane.tan@example.com".into(),
            alternative_email: None,
            mobile_number: Some("+628123456789".into()),
            payment_status: Some("Paid".into()),
            remarks: None,
        }
    }

    fn sample_item(code: &str) -> NewOrderItem {
        NewOrderItem {
            confirmation_code: code.to_string(),
            product_name: "eSIM Australia & New Zealand 15 Days".into(),
            product_variant: Some("WM-AUNZ-15-10GB".into()),
            sku: "WM-AUNZ-15-10GB".into(),
            visit_date: Some(Utc::now()),
            quantity: 1,
            unit_price: Some(250_000),
        }
    }

    fn sample_esim(item_id: &str, iccid: &str) -> NewEsimDetail {
        NewEsimDetail {
            order_item_id: item_id.to_string(),
            product_name: "eSIM Australia & New Zealand 15 Days".into(),
            valid_from: Some("2026-09-01".into()),
            valid_until: Some("2026-09-15".into()),
            iccid: iccid.to_string(),
            qr_code: format!("LPA:1$smdp.example${iccid}"),
            smdp_address: "smdp.example".into(),
            activation_code: "AC-0001".into(),
            combined_activation: format!("LPA:1$smdp.example$AC-0001-{iccid}"),
            apn_name: Some("internet".into()),
            apn_username: None,
            apn_password: None,
        }
    }

    async fn seed_item(db: &LibSqlBackend, reference: &str, code: &str) -> (String, String) {
        let order_id = db
            .upsert_order_with_items(&sample_order(reference), &[sample_item(code)])
            .await
            .unwrap();
        let item = db
            .find_item_by_confirmation_code(code)
            .await
            .unwrap()
            .unwrap();
        (order_id, item.order_item_id)
    }

    // ── Orders ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn upsert_order_is_idempotent() {
        let db = LibSqlBackend::new_memory().await.unwrap();

        let id1 = db
            .upsert_order_with_items(&sample_order("ZRPQG8VEGT"), &[sample_item("GTMSRLOW")])
            .await
            .unwrap();
        let id2 = db
            .upsert_order_with_items(&sample_order("ZRPQG8VEGT"), &[sample_item("GTMSRLOW")])
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let order = db.get_order_by_reference("ZRPQG8VEGT").await.unwrap();
        assert!(order.is_some());

        // Exactly one item row for the confirmation code.
        let item = db
            .find_item_by_confirmation_code("GTMSRLOW")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(item.reference_number, "ZRPQG8VEGT");
        assert_eq!(item.sku, "WM-AUNZ-15-10GB");
        assert_eq!(item.quantity, 1);
    }

    #[tokio::test]
    async fn upsert_overwrites_mutable_fields() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.upsert_order_with_items(&sample_order("REF001"), &[sample_item("CODE01")])
            .await
            .unwrap();

        let mut updated = sample_order("REF001");
        updated.customer_name = "Jane Tan-Lim".into();
        updated.payment_status = Some("Refunded".into());
        db.upsert_order_with_items(&updated, &[sample_item("CODE01")])
            .await
            .unwrap();

        let order = db.get_order_by_reference("REF001").await.unwrap().unwrap();
        assert_eq!(order.customer_name, "Jane Tan-Lim");
        assert_eq!(order.payment_status.as_deref(), Some("Refunded"));
    }

    #[tokio::test]
    async fn order_status_transitions_are_validated() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let (order_id, _) = seed_item(&db, "REF002", "CODE02").await;

        db.update_order_status(&order_id, OrderStatus::Processing)
            .await
            .unwrap();
        db.update_order_status(&order_id, OrderStatus::Completed)
            .await
            .unwrap();

        // Terminal state rejects further transitions.
        let err = db
            .update_order_status(&order_id, OrderStatus::Failed)
            .await
            .unwrap_err();
        assert!(matches!(err, DatabaseError::InvalidTransition { .. }));
    }

    #[tokio::test]
    async fn mark_item_completed_cascades_to_order() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let order_id = db
            .upsert_order_with_items(
                &sample_order("REF003"),
                &[sample_item("CODE3A"), sample_item("CODE3B")],
            )
            .await
            .unwrap();

        let a = db
            .find_item_by_confirmation_code("CODE3A")
            .await
            .unwrap()
            .unwrap();
        let b = db
            .find_item_by_confirmation_code("CODE3B")
            .await
            .unwrap()
            .unwrap();

        db.mark_item_completed(&a.order_item_id).await.unwrap();
        let order = db.get_order(&order_id).await.unwrap().unwrap();
        assert_ne!(order.status, OrderStatus::Completed);

        db.mark_item_completed(&b.order_item_id).await.unwrap();
        let order = db.get_order(&order_id).await.unwrap().unwrap();
        assert_eq!(order.status, OrderStatus::Completed);
    }

    // ── Sync ledger ─────────────────────────────────────────────────

    fn ledger_entry(code: &str, status: SyncStatus) -> SyncLogEntry {
        SyncLogEntry {
            confirmation_code: code.to_string(),
            reference_number: "REF100".into(),
            target_service: "third-party-service".into(),
            request_payload: serde_json::json!({"confirmationCode": code}),
            response_payload: (status == SyncStatus::Success)
                .then(|| serde_json::json!({"iccid": "89620001"})),
            status,
            error_message: (status == SyncStatus::Failed).then(|| "boom".to_string()),
        }
    }

    #[tokio::test]
    async fn success_is_sticky() {
        let db = LibSqlBackend::new_memory().await.unwrap();

        db.upsert_sync_log(&ledger_entry("STICKY", SyncStatus::Success))
            .await
            .unwrap();
        assert!(
            db.is_already_synced("STICKY", "third-party-service")
                .await
                .unwrap()
        );

        // A later FAILED write must not overwrite SUCCESS.
        db.upsert_sync_log(&ledger_entry("STICKY", SyncStatus::Failed))
            .await
            .unwrap();
        let log = db
            .find_sync_log("STICKY", "third-party-service")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Success);
        assert_eq!(log.attempt_count, 1, "sticky write must not bump attempts");
    }

    #[tokio::test]
    async fn failed_writes_increment_attempts() {
        let db = LibSqlBackend::new_memory().await.unwrap();

        db.upsert_sync_log(&ledger_entry("RETRIED", SyncStatus::Failed))
            .await
            .unwrap();
        db.upsert_sync_log(&ledger_entry("RETRIED", SyncStatus::Failed))
            .await
            .unwrap();
        db.upsert_sync_log(&ledger_entry("RETRIED", SyncStatus::Success))
            .await
            .unwrap();

        let log = db
            .find_sync_log("RETRIED", "third-party-service")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(log.status, SyncStatus::Success);
        assert_eq!(log.attempt_count, 3);
    }

    #[tokio::test]
    async fn ledger_pairs_are_independent_per_target() {
        let db = LibSqlBackend::new_memory().await.unwrap();

        db.upsert_sync_log(&ledger_entry("MULTI", SyncStatus::Success))
            .await
            .unwrap();

        let mut finalize = ledger_entry("MULTI", SyncStatus::Failed);
        finalize.target_service = "globaltix-pdf".into();
        db.upsert_sync_log(&finalize).await.unwrap();

        assert!(
            db.is_already_synced("MULTI", "third-party-service")
                .await
                .unwrap()
        );
        assert!(!db.is_already_synced("MULTI", "globaltix-pdf").await.unwrap());
    }

    #[tokio::test]
    async fn failed_logs_are_listed_oldest_first() {
        let db = LibSqlBackend::new_memory().await.unwrap();

        db.upsert_sync_log(&ledger_entry("F1", SyncStatus::Failed))
            .await
            .unwrap();
        db.upsert_sync_log(&ledger_entry("F2", SyncStatus::Failed))
            .await
            .unwrap();
        db.upsert_sync_log(&ledger_entry("OK", SyncStatus::Success))
            .await
            .unwrap();

        let failed = db
            .get_failed_sync_logs(Some("third-party-service"), 10)
            .await
            .unwrap();
        assert_eq!(failed.len(), 2);
        assert!(failed.iter().all(|l| l.status == SyncStatus::Failed));
    }

    // ── eSIM records ────────────────────────────────────────────────

    #[tokio::test]
    async fn insert_provisioning_is_idempotent_by_iccid() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let (_, item_id) = seed_item(&db, "REF200", "CODE200").await;

        let id1 = db
            .insert_provisioning(&sample_esim(&item_id, "8962000000000001"))
            .await
            .unwrap();
        let id2 = db
            .insert_provisioning(&sample_esim(&item_id, "8962000000000001"))
            .await
            .unwrap();
        assert_eq!(id1, id2);

        let esim = db.find_esim(&id1).await.unwrap().unwrap();
        assert_eq!(esim.status, EsimStatus::Process);
        assert!(esim.provisioned_at.is_some());
    }

    #[tokio::test]
    async fn finalize_lock_is_acquired_once() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let (_, item_id) = seed_item(&db, "REF201", "CODE201").await;

        let esim_id = db
            .insert_provisioning(&sample_esim(&item_id, "8962000000000002"))
            .await
            .unwrap();
        db.update_esim_status(&esim_id, EsimStatus::Completed)
            .await
            .unwrap();

        assert!(db.mark_as_finalizing(&esim_id).await.unwrap());
        // Second attempt sees PROCESS, not COMPLETED.
        assert!(!db.mark_as_finalizing(&esim_id).await.unwrap());

        // Back to COMPLETED re-arms the lock.
        db.update_esim_status(&esim_id, EsimStatus::Completed)
            .await
            .unwrap();
        assert!(db.mark_as_finalizing(&esim_id).await.unwrap());
    }

    #[tokio::test]
    async fn pending_upload_scan_only_sees_completed() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let (_, item_id) = seed_item(&db, "REF202", "CODE202").await;

        let esim_id = db
            .insert_provisioning(&sample_esim(&item_id, "8962000000000003"))
            .await
            .unwrap();
        assert!(db.find_pending_upload(10).await.unwrap().is_empty());

        db.update_esim_status(&esim_id, EsimStatus::Completed)
            .await
            .unwrap();
        let pending = db.find_pending_upload(10).await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, esim_id);
    }

    #[tokio::test]
    async fn confirm_pdf_upload_reaches_done() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let (_, item_id) = seed_item(&db, "REF203", "CODE203").await;

        let esim_id = db
            .insert_provisioning(&sample_esim(&item_id, "8962000000000004"))
            .await
            .unwrap();
        db.update_esim_status(&esim_id, EsimStatus::PendingConfirmation)
            .await
            .unwrap();
        db.update_pdf_upload_info(&esim_id, "/tmp/REF203.pdf", Utc::now())
            .await
            .unwrap();
        db.confirm_pdf_upload(&esim_id).await.unwrap();

        let esim = db.find_esim(&esim_id).await.unwrap().unwrap();
        assert_eq!(esim.status, EsimStatus::Done);
        assert_eq!(esim.pdf_file_path.as_deref(), Some("/tmp/REF203.pdf"));

        let done = db.find_done().await.unwrap();
        assert_eq!(done.len(), 1);
    }

    // ── Upload OTPs ─────────────────────────────────────────────────

    fn new_otp(code: &str, expires_at: DateTime<Utc>) -> NewUploadOtp {
        NewUploadOtp {
            order_id: "order-1".into(),
            order_item_id: "item-1".into(),
            confirmation_code: "CODE300".into(),
            otp_code: code.to_string(),
            expires_at,
            pdf_file_path: "/tmp/CODE300.pdf".into(),
        }
    }

    #[tokio::test]
    async fn otp_insert_and_lookup() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let created = db
            .insert_otp(&new_otp("123456", Utc::now() + Duration::hours(24)))
            .await
            .unwrap();
        assert_eq!(created.status, OtpStatus::Pending);

        let found = db.find_otp_by_code("123456").await.unwrap().unwrap();
        assert_eq!(found.id, created.id);
        assert_eq!(found.confirmation_code, "CODE300");

        assert!(db.find_otp_by_code("000000").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn otp_confirm_records_identity() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        let created = db
            .insert_otp(&new_otp("222222", Utc::now() + Duration::hours(24)))
            .await
            .unwrap();

        db.confirm_otp_row(&created.id, "Admin Jo").await.unwrap();
        let confirmed = db.find_otp_by_code("222222").await.unwrap().unwrap();
        assert_eq!(confirmed.status, OtpStatus::Confirmed);
        assert_eq!(confirmed.confirmed_by.as_deref(), Some("Admin Jo"));
        assert!(confirmed.confirmed_at.is_some());
    }

    #[tokio::test]
    async fn expire_sweep_flips_stale_pending_rows() {
        let db = LibSqlBackend::new_memory().await.unwrap();
        db.insert_otp(&new_otp("333333", Utc::now() - Duration::hours(1)))
            .await
            .unwrap();
        db.insert_otp(&new_otp("444444", Utc::now() + Duration::hours(1)))
            .await
            .unwrap();

        let expired = db.expire_old_otps().await.unwrap();
        assert_eq!(expired, 1);

        let stale = db.find_otp_by_code("333333").await.unwrap().unwrap();
        assert_eq!(stale.status, OtpStatus::Expired);

        let pending = db.get_pending_otps().await.unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].otp_code, "444444");
    }
}
