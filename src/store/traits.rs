//! Backend-agnostic `Database` trait — the persistence boundary of the
//! onboarding workflow.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::registration::model::{RegistrationRecord, SubscriptionTier};

/// Ids produced by a successful finalization transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FinalizedIds {
    pub user_id: Uuid,
    pub clinic_id: Uuid,
}

/// Persistence interface for the registration workflow.
///
/// Registration records are never deleted; terminal rows stay behind as an
/// audit trail. Everything except [`finalize_registration`] is a
/// single-record read or write.
///
/// [`finalize_registration`]: Database::finalize_registration
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Registration records ────────────────────────────────────────

    /// Insert a new registration record.
    async fn insert_registration(&self, record: &RegistrationRecord)
        -> Result<(), DatabaseError>;

    /// Fetch a record by id.
    async fn get_registration(
        &self,
        id: Uuid,
    ) -> Result<Option<RegistrationRecord>, DatabaseError>;

    /// Find the single active (non-terminal) record for an email, if any.
    async fn find_active_by_email(
        &self,
        email: &str,
    ) -> Result<Option<RegistrationRecord>, DatabaseError>;

    /// Persist a mutated record.
    ///
    /// `expected_updated_at` is the `updated_at` value the caller read
    /// before mutating; if the row has moved on since then the write is
    /// rejected with [`DatabaseError::StaleWrite`] and nothing changes.
    async fn update_registration(
        &self,
        record: &RegistrationRecord,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<(), DatabaseError>;

    // ── Collaborator lookups ────────────────────────────────────────

    /// Whether a permanent account already exists for this email.
    async fn user_email_exists(&self, email: &str) -> Result<bool, DatabaseError>;

    /// Whether a permanent clinic already exists with this name or email.
    async fn clinic_exists(&self, name: &str, email: &str) -> Result<bool, DatabaseError>;

    /// Whether another *active* registration has already claimed this
    /// clinic name or email in its pending payload.
    async fn clinic_claimed_by_active(
        &self,
        name: &str,
        email: &str,
        exclude: Uuid,
    ) -> Result<bool, DatabaseError>;

    /// Look up a subscription tier by code.
    async fn get_tier(&self, code: &str) -> Result<Option<SubscriptionTier>, DatabaseError>;

    // ── Finalization ────────────────────────────────────────────────

    /// Atomically create the permanent user, clinic, and admin-role rows
    /// from a fully-populated record, and stamp the record completed.
    ///
    /// All writes happen inside one transaction: any failure rolls back
    /// every row and leaves the record exactly as it was, so the caller
    /// may retry once the cause is fixed.
    async fn finalize_registration(
        &self,
        record: &RegistrationRecord,
    ) -> Result<FinalizedIds, DatabaseError>;
}
