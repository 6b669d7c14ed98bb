//! libSQL backend — async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Registration step payloads
//! are stored as JSON text columns; timestamps are RFC 3339 text.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use rust_decimal::Decimal;
use tracing::info;
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::registration::model::{
    RegistrationRecord, RegistrationStatus, RegistrationStep, SubscriptionTier,
};
use crate::store::migrations;
use crate::store::traits::{Database, FinalizedIds};

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
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

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

fn parse_optional_datetime(s: &Option<String>) -> Option<DateTime<Utc>> {
    s.as_ref().map(|s| parse_datetime(s))
}

fn to_json<T: serde::Serialize>(value: &T) -> Result<String, DatabaseError> {
    serde_json::to_string(value).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

fn opt_to_json<T: serde::Serialize>(value: &Option<T>) -> Result<Option<String>, DatabaseError> {
    value.as_ref().map(|v| to_json(v)).transpose()
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> Result<T, DatabaseError> {
    serde_json::from_str(s).map_err(|e| DatabaseError::Serialization(e.to_string()))
}

/// Whether a libsql error is a UNIQUE constraint violation.
fn is_unique_violation(e: &libsql::Error) -> bool {
    e.to_string().contains("UNIQUE constraint failed")
}

/// Column order used by every `SELECT` against `registrations`.
const REGISTRATION_COLUMNS: &str = "id, email, status, current_step, completed_steps, \
     user_data, clinic_data, subscription_data, payment_data, verification_code, \
     email_verified, email_verified_at, payment_status, \
     created_at, updated_at, expires_at, completed_at, created_user_id, created_clinic_id";

/// Map a libsql Row to a RegistrationRecord. Column order matches
/// REGISTRATION_COLUMNS.
fn row_to_registration(row: &libsql::Row) -> Result<RegistrationRecord, DatabaseError> {
    let get_text = |idx: i32| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Query(format!("Bad registration row (col {idx}): {e}")))
    };
    let get_opt_text = |idx: i32| -> Option<String> { row.get::<String>(idx).ok() };

    let id_str = get_text(0)?;
    let status_str = get_text(2)?;
    let step_str = get_text(3)?;
    let steps_json = get_text(4)?;

    let status: RegistrationStatus = status_str
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let current_step: RegistrationStep = step_str
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let completed_steps: Vec<RegistrationStep> = from_json(&steps_json)?;

    Ok(RegistrationRecord {
        id: Uuid::parse_str(&id_str)
            .map_err(|e| DatabaseError::Serialization(format!("Bad registration id: {e}")))?,
        email: get_text(1)?,
        status,
        current_step,
        completed_steps,
        user_data: get_opt_text(5).map(|s| from_json(&s)).transpose()?,
        clinic_data: get_opt_text(6).map(|s| from_json(&s)).transpose()?,
        subscription_data: get_opt_text(7).map(|s| from_json(&s)).transpose()?,
        payment_data: get_opt_text(8).map(|s| from_json(&s)).transpose()?,
        verification_code: get_opt_text(9),
        email_verified: row.get::<i64>(10).unwrap_or(0) != 0,
        email_verified_at: parse_optional_datetime(&get_opt_text(11)),
        payment_status: get_opt_text(12)
            .map(|s| s.parse().map_err(DatabaseError::Serialization))
            .transpose()?,
        created_at: parse_datetime(&get_text(13)?),
        updated_at: parse_datetime(&get_text(14)?),
        expires_at: parse_datetime(&get_text(15)?),
        completed_at: parse_optional_datetime(&get_opt_text(16)),
        created_user_id: get_opt_text(17).and_then(|s| Uuid::parse_str(&s).ok()),
        created_clinic_id: get_opt_text(18).and_then(|s| Uuid::parse_str(&s).ok()),
    })
}

/// Map a libsql Row to a SubscriptionTier.
/// Column order: 0:code, 1:name, 2:monthly_price, 3:yearly_price, 4:currency, 5:is_active
fn row_to_tier(row: &libsql::Row) -> Result<SubscriptionTier, DatabaseError> {
    let parse_price = |idx: i32| -> Result<Decimal, DatabaseError> {
        let s: String = row
            .get(idx)
            .map_err(|e| DatabaseError::Query(format!("Bad tier row (col {idx}): {e}")))?;
        s.parse()
            .map_err(|e| DatabaseError::Serialization(format!("Bad tier price {s:?}: {e}")))
    };

    Ok(SubscriptionTier {
        code: row
            .get(0)
            .map_err(|e| DatabaseError::Query(format!("Bad tier row: {e}")))?,
        name: row
            .get(1)
            .map_err(|e| DatabaseError::Query(format!("Bad tier row: {e}")))?,
        monthly_price: parse_price(2)?,
        yearly_price: parse_price(3)?,
        currency: row.get(4).unwrap_or_else(|_| "USD".to_string()),
        is_active: row.get::<i64>(5).unwrap_or(0) != 0,
    })
}

// ── Database trait implementation ───────────────────────────────────

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    async fn insert_registration(
        &self,
        record: &RegistrationRecord,
    ) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO registrations (
                    id, email, status, current_step, completed_steps,
                    user_data, clinic_data, subscription_data, payment_data,
                    verification_code, email_verified, email_verified_at, payment_status,
                    created_at, updated_at, expires_at, completed_at,
                    created_user_id, created_clinic_id
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19)",
                params![
                    record.id.to_string(),
                    record.email.clone(),
                    record.status.to_string(),
                    record.current_step.to_string(),
                    to_json(&record.completed_steps)?,
                    opt_to_json(&record.user_data)?,
                    opt_to_json(&record.clinic_data)?,
                    opt_to_json(&record.subscription_data)?,
                    opt_to_json(&record.payment_data)?,
                    record.verification_code.clone(),
                    record.email_verified as i64,
                    record.email_verified_at.map(|t| t.to_rfc3339()),
                    record.payment_status.map(|s| s.to_string()),
                    record.created_at.to_rfc3339(),
                    record.updated_at.to_rfc3339(),
                    record.expires_at.to_rfc3339(),
                    record.completed_at.map(|t| t.to_rfc3339()),
                    record.created_user_id.map(|u| u.to_string()),
                    record.created_clinic_id.map(|u| u.to_string()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to insert registration: {e}")))?;
        Ok(())
    }

    async fn get_registration(
        &self,
        id: Uuid,
    ) -> Result<Option<RegistrationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {REGISTRATION_COLUMNS} FROM registrations WHERE id = ?1"),
                params![id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to fetch registration: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read registration row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_registration(&row)?)),
            None => Ok(None),
        }
    }

    async fn find_active_by_email(
        &self,
        email: &str,
    ) -> Result<Option<RegistrationRecord>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {REGISTRATION_COLUMNS} FROM registrations
                     WHERE email = ?1 AND status NOT IN ('completed', 'cancelled', 'expired')
                     ORDER BY created_at DESC LIMIT 1"
                ),
                params![email.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to search registrations: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read registration row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_registration(&row)?)),
            None => Ok(None),
        }
    }

    async fn update_registration(
        &self,
        record: &RegistrationRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError> {
        let affected = self
            .conn()
            .execute(
                "UPDATE registrations SET
                    status = ?1, current_step = ?2, completed_steps = ?3,
                    user_data = ?4, clinic_data = ?5, subscription_data = ?6, payment_data = ?7,
                    verification_code = ?8, email_verified = ?9, email_verified_at = ?10,
                    payment_status = ?11, updated_at = ?12, expires_at = ?13, completed_at = ?14,
                    created_user_id = ?15, created_clinic_id = ?16
                 WHERE id = ?17 AND updated_at = ?18",
                params![
                    record.status.to_string(),
                    record.current_step.to_string(),
                    to_json(&record.completed_steps)?,
                    opt_to_json(&record.user_data)?,
                    opt_to_json(&record.clinic_data)?,
                    opt_to_json(&record.subscription_data)?,
                    opt_to_json(&record.payment_data)?,
                    record.verification_code.clone(),
                    record.email_verified as i64,
                    record.email_verified_at.map(|t| t.to_rfc3339()),
                    record.payment_status.map(|s| s.to_string()),
                    record.updated_at.to_rfc3339(),
                    record.expires_at.to_rfc3339(),
                    record.completed_at.map(|t| t.to_rfc3339()),
                    record.created_user_id.map(|u| u.to_string()),
                    record.created_clinic_id.map(|u| u.to_string()),
                    record.id.to_string(),
                    expected_updated_at.to_rfc3339(),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to update registration: {e}")))?;

        if affected == 0 {
            return Err(DatabaseError::StaleWrite {
                entity: "registration".into(),
                id: record.id.to_string(),
            });
        }
        Ok(())
    }

    async fn user_email_exists(&self, email: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM users WHERE email = ?1 LIMIT 1",
                params![email.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to check user email: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read user row: {e}")))?
            .is_some())
    }

    async fn clinic_exists(&self, name: &str, email: &str) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM clinics WHERE name = ?1 OR email = ?2 LIMIT 1",
                params![name.trim(), email.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to check clinic: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read clinic row: {e}")))?
            .is_some())
    }

    async fn clinic_claimed_by_active(
        &self,
        name: &str,
        email: &str,
        exclude: Uuid,
    ) -> Result<bool, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT 1 FROM registrations
                 WHERE id != ?1
                   AND status NOT IN ('completed', 'cancelled', 'expired')
                   AND clinic_data IS NOT NULL
                   AND (json_extract(clinic_data, '$.name') = ?2
                        OR json_extract(clinic_data, '$.email') = ?3)
                 LIMIT 1",
                params![exclude.to_string(), name.trim(), email.trim().to_lowercase()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to check pending clinics: {e}")))?;
        Ok(rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read registration row: {e}")))?
            .is_some())
    }

    async fn get_tier(&self, code: &str) -> Result<Option<SubscriptionTier>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT code, name, monthly_price, yearly_price, currency, is_active
                 FROM subscription_tiers WHERE code = ?1",
                params![code],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to fetch tier: {e}")))?;

        match rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("Failed to read tier row: {e}")))?
        {
            Some(row) => Ok(Some(row_to_tier(&row)?)),
            None => Ok(None),
        }
    }

    async fn finalize_registration(
        &self,
        record: &RegistrationRecord,
    ) -> Result<FinalizedIds, DatabaseError> {
        let tx = self
            .conn()
            .transaction()
            .await
            .map_err(|e| DatabaseError::Transaction(format!("Failed to begin: {e}")))?;

        match finalize_in_tx(&tx, record).await {
            Ok(ids) => {
                tx.commit()
                    .await
                    .map_err(|e| DatabaseError::Transaction(format!("Failed to commit: {e}")))?;
                info!(
                    registration_id = %record.id,
                    user_id = %ids.user_id,
                    clinic_id = %ids.clinic_id,
                    "Registration finalized"
                );
                Ok(ids)
            }
            Err(e) => {
                // Rollback failure is secondary to the original error.
                let _ = tx.rollback().await;
                Err(e)
            }
        }
    }
}

/// The body of the finalization transaction. Every statement runs on `tx`;
/// the caller commits or rolls back.
async fn finalize_in_tx(
    tx: &libsql::Transaction,
    record: &RegistrationRecord,
) -> Result<FinalizedIds, DatabaseError> {
    let user = record.user_data.as_ref().ok_or_else(|| {
        DatabaseError::Constraint("Registration has no user data".into())
    })?;
    let clinic = record.clinic_data.as_ref().ok_or_else(|| {
        DatabaseError::Constraint("Registration has no clinic data".into())
    })?;
    let subscription = record.subscription_data.as_ref().ok_or_else(|| {
        DatabaseError::Constraint("Registration has no subscription data".into())
    })?;

    // Re-fetch the tier: it may have been removed or deactivated since
    // selection.
    let mut rows = tx
        .query(
            "SELECT code, name, monthly_price, yearly_price, currency, is_active
             FROM subscription_tiers WHERE code = ?1 AND is_active = 1",
            params![subscription.tier_code.clone()],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to fetch tier: {e}")))?;
    let tier = match rows
        .next()
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to read tier row: {e}")))?
    {
        Some(row) => row_to_tier(&row)?,
        None => {
            return Err(DatabaseError::NotFound {
                entity: "subscription_tier".into(),
                id: subscription.tier_code.clone(),
            });
        }
    };

    let now = Utc::now();
    let clinic_id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    tx.execute(
        "INSERT INTO clinics (id, name, email, tier_code, billing_cycle, phone, address, city, country, specialty, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
        params![
            clinic_id.to_string(),
            clinic.name.clone(),
            clinic.email.clone(),
            tier.code.clone(),
            subscription.billing_cycle.to_string(),
            clinic.phone.clone(),
            clinic.address.clone(),
            clinic.city.clone(),
            clinic.country.clone(),
            clinic.specialty.clone(),
            now.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DatabaseError::Constraint(format!("Clinic already exists: {e}"))
        } else {
            DatabaseError::Query(format!("Failed to insert clinic: {e}"))
        }
    })?;

    // The password hash is carried through unchanged; the account inherits
    // the original verification timestamp.
    tx.execute(
        "INSERT INTO users (id, email, name, password_hash, email_verified_at, created_at)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            user_id.to_string(),
            user.email.trim().to_lowercase(),
            user.name.clone(),
            user.password_hash.clone(),
            record.email_verified_at.map(|t| t.to_rfc3339()),
            now.to_rfc3339(),
        ],
    )
    .await
    .map_err(|e| {
        if is_unique_violation(&e) {
            DatabaseError::Constraint(format!("User already exists: {e}"))
        } else {
            DatabaseError::Query(format!("Failed to insert user: {e}"))
        }
    })?;

    tx.execute(
        "INSERT INTO user_roles (user_id, clinic_id, role, created_at)
         VALUES (?1, ?2, 'clinic_admin', ?3)",
        params![user_id.to_string(), clinic_id.to_string(), now.to_rfc3339()],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("Failed to insert role: {e}")))?;

    // Stamp the record inside the same transaction so "completed" and the
    // back-references become visible together or not at all.
    let affected = tx
        .execute(
            "UPDATE registrations SET
                status = 'completed', current_step = 'complete',
                completed_steps = ?1, completed_at = ?2, updated_at = ?2,
                created_user_id = ?3, created_clinic_id = ?4
             WHERE id = ?5 AND updated_at = ?6",
            params![
                completed_steps_with_complete(record)?,
                now.to_rfc3339(),
                user_id.to_string(),
                clinic_id.to_string(),
                record.id.to_string(),
                record.updated_at.to_rfc3339(),
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("Failed to stamp registration: {e}")))?;

    if affected == 0 {
        return Err(DatabaseError::StaleWrite {
            entity: "registration".into(),
            id: record.id.to_string(),
        });
    }

    Ok(FinalizedIds { user_id, clinic_id })
}

/// The record's completed-step list with `Complete` appended.
fn completed_steps_with_complete(record: &RegistrationRecord) -> Result<String, DatabaseError> {
    let mut steps = record.completed_steps.clone();
    if !steps.contains(&RegistrationStep::Complete) {
        steps.push(RegistrationStep::Complete);
    }
    to_json(&steps)
}

// ── Tests ───────────────────────────────────────────────────────────
