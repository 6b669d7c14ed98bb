//! The registration workflow engine.
//!
//! Every operation is an explicit load → validate → mutate → persist unit
//! of work; there is no in-process session. All state lives in the durable
//! [`RegistrationRecord`], keyed by its id, which the client carries
//! between requests.
//!
//! Expiration is lazy: each operation checks `expires_at` on load, flips
//! the record to `Expired` on the first access past the deadline, and
//! fails with a distinct `registration_expired` reason. Nothing sweeps
//! expired records in the background.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::Utc;
use rust_decimal::Decimal;
use tracing::{info, warn};
use uuid::Uuid;

use crate::email::CodeMailer;
use crate::error::{DatabaseError, RegistrationError};
use crate::password::PasswordHasher;
use crate::store::Database;

use super::code::{code_matches, generate_code};
use super::model::{
    BillingCycle, ClinicData, PaymentData, PaymentMethod, PaymentStatus, RegistrationRecord,
    RegistrationSnapshot, RegistrationStatus, RegistrationStep, SubscriptionData, UserData,
};
use super::steps::{can_proceed_to, resume_step};

/// Input for [`RegistrationEngine::start`].
#[derive(Debug, Clone)]
pub struct StartRegistration {
    pub email: String,
    pub name: String,
    pub password: String,
    pub source: Option<String>,
    pub referrer: Option<String>,
}

/// Input for [`RegistrationEngine::process_payment`].
#[derive(Debug, Clone)]
pub struct PaymentRequest {
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    pub provider_ref: Option<String>,
}

type OpResult<T> = Result<T, RegistrationError>;

type LockRegistry = Arc<StdMutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>>;

/// Holds the per-record lock for one operation. Dropping it releases the
/// lock and evicts the registry entry once no other caller holds or waits
/// on it, so the registry never accumulates keys from finished operations.
struct KeyedGuard {
    key: String,
    registry: LockRegistry,
    guard: Option<tokio::sync::OwnedMutexGuard<()>>,
}

impl Drop for KeyedGuard {
    fn drop(&mut self) {
        // Release the lock first; after that, only the registry's own Arc
        // and any waiters' clones keep the entry alive.
        self.guard.take();
        if let Ok(mut locks) = self.registry.lock() {
            if let Some(lock) = locks.get(&self.key) {
                if Arc::strong_count(lock) == 1 {
                    locks.remove(&self.key);
                }
            }
        }
    }
}

/// The state machine driving clinic registration.
pub struct RegistrationEngine {
    db: Arc<dyn Database>,
    mailer: Arc<dyn CodeMailer>,
    hasher: Arc<dyn PasswordHasher>,
    /// Days until a fresh record expires.
    ttl_days: i64,
    /// Per-record serialization. Keyed by record id (or lowercased email
    /// for the operations addressed by email) so concurrent calls against
    /// the same registration are applied one at a time. Entries live only
    /// while an operation holds or waits on them.
    locks: LockRegistry,
}

impl RegistrationEngine {
    pub fn new(
        db: Arc<dyn Database>,
        mailer: Arc<dyn CodeMailer>,
        hasher: Arc<dyn PasswordHasher>,
        ttl_days: i64,
    ) -> Self {
        Self {
            db,
            mailer,
            hasher,
            ttl_days,
            locks: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    /// Acquire the serialization guard for a record key.
    async fn guard(&self, key: &str) -> KeyedGuard {
        let lock = {
            let mut locks = self.locks.lock().expect("lock registry poisoned");
            Arc::clone(
                locks
                    .entry(key.to_string())
                    .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(()))),
            )
        };
        let guard = lock.lock_owned().await;
        KeyedGuard {
            key: key.to_string(),
            registry: Arc::clone(&self.locks),
            guard: Some(guard),
        }
    }

    // ── Operations ──────────────────────────────────────────────────

    /// Begin a registration for `email`, or resume the active one.
    ///
    /// Idempotent: a second call before verification returns the existing
    /// record rather than creating a competitor. An expired active record
    /// is flipped to `Expired` and replaced with a fresh one.
    pub async fn start(&self, req: StartRegistration) -> OpResult<RegistrationSnapshot> {
        let email = req.email.trim().to_lowercase();
        let _guard = self.guard(&email).await;

        if let Some(mut existing) = self.db.find_active_by_email(&email).await? {
            if existing.is_past_expiry(Utc::now()) {
                self.expire(&mut existing).await?;
                // Fall through: the visitor starts over with a new record.
            } else {
                info!(id = %existing.id, email = %email, "Resuming active registration");
                return Ok(self.snapshot(&existing));
            }
        }

        if self.db.user_email_exists(&email).await? {
            return Err(RegistrationError::AccountExists(email));
        }

        let code = generate_code();
        let user_data = UserData {
            name: req.name.trim().to_string(),
            email: email.clone(),
            password_hash: self.hasher.hash(&req.password),
            source: req.source,
            referrer: req.referrer,
        };
        let record = RegistrationRecord::new(&email, user_data, code.clone(), self.ttl_days);
        self.db.insert_registration(&record).await?;

        // Code delivery is best-effort: the record exists either way and
        // the client can ask for a resend.
        if let Err(e) = self.mailer.send_code(&email, &code).await {
            warn!(id = %record.id, error = %e, "Verification code delivery failed");
        }

        info!(id = %record.id, email = %email, "Registration started");
        Ok(self.snapshot(&record))
    }

    /// Consume a verification code. A code is valid exactly once.
    pub async fn verify_email(&self, id: Uuid, code: &str) -> OpResult<RegistrationSnapshot> {
        let _guard = self.guard(&id.to_string()).await;
        let mut record = self.load_live(id).await?;

        if record.email_verified {
            return Err(RegistrationError::AlreadyVerified);
        }
        if !can_proceed_to(&record, RegistrationStep::EmailVerification) {
            return Err(RegistrationError::StepNotAllowed {
                step: RegistrationStep::EmailVerification,
            });
        }
        if !code_matches(record.verification_code.as_deref(), code) {
            return Err(RegistrationError::CodeMismatch);
        }

        record.email_verified = true;
        record.email_verified_at = Some(Utc::now());
        record.verification_code = None;
        record.complete_step(RegistrationStep::EmailVerification);
        record.status = RegistrationStatus::EmailVerified;
        self.persist(&mut record).await?;

        info!(id = %id, "Email verified");
        Ok(self.snapshot(&record))
    }

    /// Store the clinic profile. Write-once: a submitted profile is not
    /// silently overwritten.
    pub async fn submit_clinic_data(
        &self,
        id: Uuid,
        form: ClinicData,
    ) -> OpResult<RegistrationSnapshot> {
        let _guard = self.guard(&id.to_string()).await;
        let mut record = self.load_live(id).await?;

        if !can_proceed_to(&record, RegistrationStep::ClinicInfo) {
            return Err(RegistrationError::StepNotAllowed {
                step: RegistrationStep::ClinicInfo,
            });
        }
        if record.clinic_data.is_some() {
            return Err(RegistrationError::AlreadySubmitted("clinic"));
        }

        let name = form.name.trim().to_string();
        let clinic_email = form.email.trim().to_lowercase();
        if self.db.clinic_exists(&name, &clinic_email).await?
            || self
                .db
                .clinic_claimed_by_active(&name, &clinic_email, id)
                .await?
        {
            return Err(RegistrationError::ClinicExists(name));
        }

        record.clinic_data = Some(ClinicData {
            name,
            email: clinic_email,
            ..form
        });
        record.complete_step(RegistrationStep::ClinicInfo);
        record.status = RegistrationStatus::ClinicCreated;
        self.persist(&mut record).await?;

        info!(id = %id, "Clinic data submitted");
        Ok(self.snapshot(&record))
    }

    /// Pick a subscription tier; the amount is computed here and becomes
    /// the reference every payment must match.
    pub async fn select_subscription(
        &self,
        id: Uuid,
        tier_code: &str,
        billing_cycle: BillingCycle,
        currency: &str,
    ) -> OpResult<RegistrationSnapshot> {
        let _guard = self.guard(&id.to_string()).await;
        let mut record = self.load_live(id).await?;

        if !can_proceed_to(&record, RegistrationStep::Subscription) {
            return Err(RegistrationError::StepNotAllowed {
                step: RegistrationStep::Subscription,
            });
        }
        if record.subscription_data.is_some() {
            return Err(RegistrationError::AlreadySubmitted("subscription"));
        }

        let tier = self
            .db
            .get_tier(tier_code)
            .await?
            .filter(|t| t.is_active)
            .ok_or_else(|| RegistrationError::InvalidTier(tier_code.to_string()))?;
        if !currency.eq_ignore_ascii_case(&tier.currency) {
            return Err(RegistrationError::CurrencyMismatch {
                expected: tier.currency.clone(),
                got: currency.to_string(),
            });
        }

        let amount = tier.price_for(billing_cycle);
        record.subscription_data = Some(SubscriptionData {
            tier_code: tier.code.clone(),
            billing_cycle,
            currency: tier.currency.clone(),
            amount,
        });
        record.complete_step(RegistrationStep::Subscription);
        record.status = RegistrationStatus::SubscriptionSelected;
        self.persist(&mut record).await?;

        info!(id = %id, tier = %tier.code, %amount, "Subscription selected");
        Ok(self.snapshot(&record))
    }

    /// Record a payment attempt.
    ///
    /// Bank transfers park the record in `PaymentPending` until
    /// [`confirm_payment`] arrives from the provider. Every other method
    /// settles immediately — gateway integration is out of scope here, so
    /// immediate settlement stands in for the provider callback.
    ///
    /// A rejected attempt leaves `payment_status` untouched; the client
    /// may simply resubmit.
    ///
    /// [`confirm_payment`]: RegistrationEngine::confirm_payment
    pub async fn process_payment(
        &self,
        id: Uuid,
        req: PaymentRequest,
    ) -> OpResult<RegistrationSnapshot> {
        let _guard = self.guard(&id.to_string()).await;
        let mut record = self.load_live(id).await?;

        if !can_proceed_to(&record, RegistrationStep::Payment) {
            return Err(RegistrationError::StepNotAllowed {
                step: RegistrationStep::Payment,
            });
        }
        let subscription = record
            .subscription_data
            .as_ref()
            .ok_or(RegistrationError::MissingData("subscription"))?;
        if record.payment_completed() {
            return Err(RegistrationError::PaymentAlreadyCompleted);
        }
        if req.amount != subscription.amount {
            return Err(RegistrationError::AmountMismatch {
                expected: subscription.amount.to_string(),
                got: req.amount.to_string(),
            });
        }
        if !req.currency.eq_ignore_ascii_case(&subscription.currency) {
            return Err(RegistrationError::CurrencyMismatch {
                expected: subscription.currency.clone(),
                got: req.currency,
            });
        }

        let deferred = req.method.is_deferred();
        record.payment_data = Some(PaymentData {
            method: req.method,
            amount: req.amount,
            currency: subscription.currency.clone(),
            provider_ref: req.provider_ref,
            paid_at: if deferred { None } else { Some(Utc::now()) },
        });
        if deferred {
            record.payment_status = Some(PaymentStatus::Pending);
            record.status = RegistrationStatus::PaymentPending;
        } else {
            record.payment_status = Some(PaymentStatus::Completed);
            record.complete_step(RegistrationStep::Payment);
            record.status = RegistrationStatus::PaymentCompleted;
        }
        self.persist(&mut record).await?;

        info!(id = %id, method = ?record.payment_data.as_ref().map(|p| p.method), deferred, "Payment processed");
        Ok(self.snapshot(&record))
    }

    /// External confirmation for a deferred (bank-transfer) payment.
    pub async fn confirm_payment(
        &self,
        id: Uuid,
        provider_ref: Option<String>,
    ) -> OpResult<RegistrationSnapshot> {
        let _guard = self.guard(&id.to_string()).await;
        let mut record = self.load_live(id).await?;

        match record.payment_status {
            Some(PaymentStatus::Pending) | Some(PaymentStatus::Processing) => {}
            _ => return Err(RegistrationError::NotAwaitingConfirmation),
        }

        if let Some(payment) = record.payment_data.as_mut() {
            payment.paid_at = Some(Utc::now());
            if provider_ref.is_some() {
                payment.provider_ref = provider_ref;
            }
        }
        record.payment_status = Some(PaymentStatus::Completed);
        record.complete_step(RegistrationStep::Payment);
        record.status = RegistrationStatus::PaymentCompleted;
        self.persist(&mut record).await?;

        info!(id = %id, "Deferred payment confirmed");
        Ok(self.snapshot(&record))
    }

    /// Finalize: atomically create the user, clinic, and admin-role rows
    /// and mark the record completed.
    ///
    /// A finalization failure leaves no partial entities behind and the
    /// record in its pre-completion state, so the call is safe to retry
    /// once the cause is fixed.
    pub async fn complete_registration(&self, id: Uuid) -> OpResult<RegistrationSnapshot> {
        let _guard = self.guard(&id.to_string()).await;
        let record = self.load_live(id).await?;

        if !can_proceed_to(&record, RegistrationStep::Complete) {
            return Err(RegistrationError::StepNotAllowed {
                step: RegistrationStep::Complete,
            });
        }
        if record.user_data.is_none() {
            return Err(RegistrationError::MissingData("user"));
        }
        if record.clinic_data.is_none() {
            return Err(RegistrationError::MissingData("clinic"));
        }
        if record.subscription_data.is_none() {
            return Err(RegistrationError::MissingData("subscription"));
        }

        match self.db.finalize_registration(&record).await {
            Ok(ids) => {
                info!(id = %id, user_id = %ids.user_id, clinic_id = %ids.clinic_id, "Registration completed");
            }
            Err(DatabaseError::Constraint(msg)) if msg.contains("User") => {
                return Err(RegistrationError::AccountExists(record.email.clone()));
            }
            Err(DatabaseError::Constraint(msg)) if msg.contains("Clinic") => {
                let name = record
                    .clinic_data
                    .as_ref()
                    .map(|c| c.name.clone())
                    .unwrap_or_default();
                return Err(RegistrationError::ClinicExists(name));
            }
            Err(DatabaseError::NotFound { id: tier, .. }) => {
                return Err(RegistrationError::InvalidTier(tier));
            }
            Err(e) => return Err(e.into()),
        }

        // The transaction stamped the record; reload the committed state.
        let stamped = self
            .db
            .get_registration(id)
            .await?
            .ok_or(RegistrationError::NotFound(id))?;
        Ok(self.snapshot(&stamped))
    }

    /// Current snapshot plus the derived resume step.
    ///
    /// Completed and cancelled records stay queryable; only expiration
    /// turns the lookup into an error (applying the lazy flip on the way).
    pub async fn status(&self, id: Uuid) -> OpResult<RegistrationSnapshot> {
        let _guard = self.guard(&id.to_string()).await;
        let mut record = self
            .db
            .get_registration(id)
            .await?
            .ok_or(RegistrationError::NotFound(id))?;

        if record.status == RegistrationStatus::Expired {
            return Err(RegistrationError::Expired { id });
        }
        if record.is_past_expiry(Utc::now()) {
            self.expire(&mut record).await?;
            return Err(RegistrationError::Expired { id });
        }
        Ok(self.snapshot(&record))
    }

    /// Abandon a registration. Terminal records cannot be cancelled.
    pub async fn cancel(&self, id: Uuid) -> OpResult<()> {
        let _guard = self.guard(&id.to_string()).await;
        let mut record = self.load_live(id).await?;

        record.status = RegistrationStatus::Cancelled;
        self.persist(&mut record).await?;
        info!(id = %id, "Registration cancelled");
        Ok(())
    }

    /// Regenerate and resend the verification code for an active,
    /// unverified registration.
    pub async fn resend_code(&self, email: &str) -> OpResult<RegistrationSnapshot> {
        let email = email.trim().to_lowercase();
        let _guard = self.guard(&email).await;

        let mut record = self
            .db
            .find_active_by_email(&email)
            .await?
            .ok_or_else(|| RegistrationError::NoActiveRegistration(email.clone()))?;
        if record.is_past_expiry(Utc::now()) {
            self.expire(&mut record).await?;
            return Err(RegistrationError::Expired { id: record.id });
        }
        if record.email_verified {
            return Err(RegistrationError::AlreadyVerified);
        }

        let code = generate_code();
        record.verification_code = Some(code.clone());
        self.persist(&mut record).await?;

        if let Err(e) = self.mailer.send_code(&email, &code).await {
            warn!(id = %record.id, error = %e, "Verification code delivery failed");
        }
        info!(id = %record.id, "Verification code resent");
        Ok(self.snapshot(&record))
    }

    // ── Internals ───────────────────────────────────────────────────

    /// Load a record that is still allowed to change: exists, is not
    /// terminal, and has not passed its expiration deadline. Applies the
    /// lazy-expiration flip on first access past `expires_at`.
    async fn load_live(&self, id: Uuid) -> OpResult<RegistrationRecord> {
        let mut record = self
            .db
            .get_registration(id)
            .await?
            .ok_or(RegistrationError::NotFound(id))?;

        if record.status == RegistrationStatus::Expired {
            return Err(RegistrationError::Expired { id });
        }
        if record.status.is_terminal() {
            return Err(RegistrationError::Terminal {
                status: record.status,
            });
        }
        if record.is_past_expiry(Utc::now()) {
            self.expire(&mut record).await?;
            return Err(RegistrationError::Expired { id });
        }
        Ok(record)
    }

    /// Flip a record to `Expired` and persist it.
    async fn expire(&self, record: &mut RegistrationRecord) -> OpResult<()> {
        record.status = RegistrationStatus::Expired;
        self.persist(record).await?;
        info!(id = %record.id, "Registration expired on access");
        Ok(())
    }

    /// Persist with the optimistic `updated_at` guard.
    async fn persist(&self, record: &mut RegistrationRecord) -> OpResult<()> {
        let prev = record.updated_at;
        record.updated_at = Utc::now();
        self.db.update_registration(record, prev).await?;
        Ok(())
    }

    fn snapshot(&self, record: &RegistrationRecord) -> RegistrationSnapshot {
        RegistrationSnapshot {
            id: record.id,
            email: record.email.clone(),
            status: record.status,
            current_step: record.current_step,
            next_step: resume_step(record),
            completed_steps: record.completed_steps.clone(),
            email_verified: record.email_verified,
            payment_status: record.payment_status,
            amount: record.subscription_data.as_ref().map(|s| s.amount),
            expires_at: record.expires_at,
            completed_at: record.completed_at,
            created_user_id: record.created_user_id,
            created_clinic_id: record.created_clinic_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::email::LogMailer;
    use crate::password::SaltedSha256;
    use crate::store::LibSqlBackend;
    use rust_decimal_macros::dec;

    async fn engine() -> RegistrationEngine {
        engine_with_ttl(7).await
    }

    async fn engine_with_ttl(ttl_days: i64) -> RegistrationEngine {
        let db = Arc::new(LibSqlBackend::new_memory().await.unwrap());
        RegistrationEngine::new(db, Arc::new(LogMailer), Arc::new(SaltedSha256), ttl_days)
    }

    fn start_req(email: &str) -> StartRegistration {
        StartRegistration {
            email: email.into(),
            name: "Ada".into(),
            password: "secret1".into(),
            source: Some("web".into()),
            referrer: None,
        }
    }

    fn clinic_form(name: &str) -> ClinicData {
        ClinicData {
            name: name.into(),
            email: format!("{}@clinic.com", name.replace(' ', ".").to_lowercase()),
            phone: Some("+351 000 000 000".into()),
            address: None,
            city: Some("Porto".into()),
            country: Some("PT".into()),
            specialty: Some("dental".into()),
        }
    }

    fn card_payment(amount: Decimal) -> PaymentRequest {
        PaymentRequest {
            method: PaymentMethod::CreditCard,
            amount,
            currency: "USD".into(),
            provider_ref: Some("ch_123".into()),
        }
    }

    /// Pull the live verification code straight from the store.
    async fn stored_code(engine: &RegistrationEngine, id: Uuid) -> String {
        engine
            .db
            .get_registration(id)
            .await
            .unwrap()
            .unwrap()
            .verification_code
            .unwrap()
    }

    /// Drive a registration up to (and including) email verification.
    async fn verified(engine: &RegistrationEngine, email: &str) -> Uuid {
        let snap = engine.start(start_req(email)).await.unwrap();
        let code = stored_code(engine, snap.id).await;
        engine.verify_email(snap.id, &code).await.unwrap();
        snap.id
    }

    /// Drive a registration to the point where completion is allowed.
    async fn paid(engine: &RegistrationEngine, email: &str, clinic: &str) -> Uuid {
        let id = verified(engine, email).await;
        engine.submit_clinic_data(id, clinic_form(clinic)).await.unwrap();
        let snap = engine
            .select_subscription(id, "basic", BillingCycle::Monthly, "USD")
            .await
            .unwrap();
        engine
            .process_payment(id, card_payment(snap.amount.unwrap()))
            .await
            .unwrap();
        id
    }

    // ── start ───────────────────────────────────────────────────────

    #[tokio::test]
    async fn start_creates_user_created_record() {
        let eng = engine().await;
        let snap = eng.start(start_req("A@B.com")).await.unwrap();
        assert_eq!(snap.email, "a@b.com");
        assert_eq!(snap.status, RegistrationStatus::UserCreated);
        assert_eq!(snap.current_step, RegistrationStep::UserForm);
        assert_eq!(snap.next_step, RegistrationStep::EmailVerification);
        assert_eq!(snap.completed_steps, vec![RegistrationStep::UserForm]);
        assert!(!snap.email_verified);
    }

    #[tokio::test]
    async fn start_never_stores_plaintext_password() {
        let eng = engine().await;
        let snap = eng.start(start_req("a@b.com")).await.unwrap();
        let rec = eng.db.get_registration(snap.id).await.unwrap().unwrap();
        let hash = rec.user_data.unwrap().password_hash;
        assert_ne!(hash, "secret1");
        assert!(SaltedSha256.verify("secret1", &hash));
    }

    #[tokio::test]
    async fn start_is_idempotent_before_verification() {
        let eng = engine().await;
        let first = eng.start(start_req("a@b.com")).await.unwrap();
        let second = eng.start(start_req("a@b.com")).await.unwrap();
        assert_eq!(first.id, second.id);
    }

    #[tokio::test]
    async fn start_conflicts_with_permanent_account() {
        let eng = engine().await;
        let id = paid(&eng, "a@b.com", "Clinic A").await;
        eng.complete_registration(id).await.unwrap();

        let err = eng.start(start_req("a@b.com")).await.unwrap_err();
        assert!(matches!(err, RegistrationError::AccountExists(_)));
    }

    // ── verify_email ────────────────────────────────────────────────

    #[tokio::test]
    async fn wrong_code_is_rejected_without_mutation() {
        let eng = engine().await;
        let snap = eng.start(start_req("a@b.com")).await.unwrap();

        let err = eng.verify_email(snap.id, "000000x").await.unwrap_err();
        assert!(matches!(err, RegistrationError::CodeMismatch));

        let rec = eng.db.get_registration(snap.id).await.unwrap().unwrap();
        assert!(!rec.email_verified);
        assert!(rec.verification_code.is_some());
    }

    #[tokio::test]
    async fn code_is_single_use() {
        let eng = engine().await;
        let snap = eng.start(start_req("a@b.com")).await.unwrap();
        let code = stored_code(&eng, snap.id).await;

        let verified = eng.verify_email(snap.id, &code).await.unwrap();
        assert_eq!(verified.status, RegistrationStatus::EmailVerified);
        assert_eq!(verified.current_step, RegistrationStep::EmailVerification);
        assert!(verified.email_verified);

        // Same code again: rejected and the stored code stays cleared.
        let err = eng.verify_email(snap.id, &code).await.unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyVerified));
        let rec = eng.db.get_registration(snap.id).await.unwrap().unwrap();
        assert!(rec.verification_code.is_none());
    }

    // ── clinic data ─────────────────────────────────────────────────

    #[tokio::test]
    async fn clinic_data_locked_until_verified() {
        let eng = engine().await;
        let snap = eng.start(start_req("a@b.com")).await.unwrap();
        let err = eng
            .submit_clinic_data(snap.id, clinic_form("Clinic A"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::StepNotAllowed { .. }));
    }

    #[tokio::test]
    async fn duplicate_clinic_name_across_registrations_conflicts() {
        let eng = engine().await;
        let first = verified(&eng, "a@b.com").await;
        eng.submit_clinic_data(first, clinic_form("Clinic A"))
            .await
            .unwrap();

        let second = verified(&eng, "c@d.com").await;
        let err = eng
            .submit_clinic_data(second, clinic_form("Clinic A"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::ClinicExists(_)));
    }

    #[tokio::test]
    async fn clinic_data_is_write_once() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        eng.submit_clinic_data(id, clinic_form("Clinic A"))
            .await
            .unwrap();
        let err = eng
            .submit_clinic_data(id, clinic_form("Clinic B"))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadySubmitted("clinic")));
    }

    // ── subscription ────────────────────────────────────────────────

    #[tokio::test]
    async fn subscription_computes_amount_by_cycle() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        eng.submit_clinic_data(id, clinic_form("Clinic A"))
            .await
            .unwrap();

        let snap = eng
            .select_subscription(id, "basic", BillingCycle::Yearly, "usd")
            .await
            .unwrap();
        assert_eq!(snap.status, RegistrationStatus::SubscriptionSelected);
        assert_eq!(snap.amount, Some(dec!(499.00)));
        assert_eq!(snap.next_step, RegistrationStep::Payment);
    }

    #[tokio::test]
    async fn unknown_tier_is_rejected() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        eng.submit_clinic_data(id, clinic_form("Clinic A"))
            .await
            .unwrap();

        let err = eng
            .select_subscription(id, "platinum", BillingCycle::Monthly, "USD")
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidTier(_)));
    }

    // ── payment ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn amount_mismatch_leaves_payment_status_unchanged() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        eng.submit_clinic_data(id, clinic_form("Clinic A"))
            .await
            .unwrap();
        eng.select_subscription(id, "basic", BillingCycle::Monthly, "USD")
            .await
            .unwrap();

        let err = eng
            .process_payment(id, card_payment(dec!(1.00)))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistrationError::AmountMismatch { .. }));

        let rec = eng.db.get_registration(id).await.unwrap().unwrap();
        assert!(rec.payment_status.is_none());
        assert!(!rec.has_completed(RegistrationStep::Payment));

        // Resubmitting with the right amount succeeds.
        let snap = eng.process_payment(id, card_payment(dec!(49.90))).await.unwrap();
        assert_eq!(snap.status, RegistrationStatus::PaymentCompleted);
    }

    #[tokio::test]
    async fn bank_transfer_waits_for_confirmation() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        eng.submit_clinic_data(id, clinic_form("Clinic A"))
            .await
            .unwrap();
        eng.select_subscription(id, "basic", BillingCycle::Monthly, "USD")
            .await
            .unwrap();

        let snap = eng
            .process_payment(
                id,
                PaymentRequest {
                    method: PaymentMethod::BankTransfer,
                    amount: dec!(49.90),
                    currency: "USD".into(),
                    provider_ref: None,
                },
            )
            .await
            .unwrap();
        assert_eq!(snap.status, RegistrationStatus::PaymentPending);
        assert_eq!(snap.payment_status, Some(PaymentStatus::Pending));

        // Completion is gated until the transfer is confirmed.
        let err = eng.complete_registration(id).await.unwrap_err();
        assert!(matches!(err, RegistrationError::StepNotAllowed { .. }));

        let confirmed = eng
            .confirm_payment(id, Some("tr_999".into()))
            .await
            .unwrap();
        assert_eq!(confirmed.status, RegistrationStatus::PaymentCompleted);

        let done = eng.complete_registration(id).await.unwrap();
        assert_eq!(done.status, RegistrationStatus::Completed);
    }

    #[tokio::test]
    async fn confirm_without_pending_payment_fails() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        let err = eng.confirm_payment(id, None).await.unwrap_err();
        assert!(matches!(err, RegistrationError::NotAwaitingConfirmation));
    }

    // ── completion ──────────────────────────────────────────────────

    #[tokio::test]
    async fn complete_creates_entities_and_stamps_back_references() {
        let eng = engine().await;
        let id = paid(&eng, "a@b.com", "Clinic A").await;

        let snap = eng.complete_registration(id).await.unwrap();
        assert_eq!(snap.status, RegistrationStatus::Completed);
        assert_eq!(snap.next_step, RegistrationStep::Complete);
        assert!(snap.created_user_id.is_some());
        assert!(snap.created_clinic_id.is_some());
        assert!(snap.completed_at.is_some());

        assert!(eng.db.user_email_exists("a@b.com").await.unwrap());
    }

    #[tokio::test]
    async fn complete_before_payment_is_gated() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        let err = eng.complete_registration(id).await.unwrap_err();
        assert!(matches!(err, RegistrationError::StepNotAllowed { .. }));
    }

    #[tokio::test]
    async fn failed_finalize_keeps_record_retryable() {
        let eng = engine().await;
        let id = paid(&eng, "a@b.com", "Clinic A").await;

        // Sabotage: the tier disappears between selection and completion.
        {
            let mut rec = eng.db.get_registration(id).await.unwrap().unwrap();
            let prev = rec.updated_at;
            rec.subscription_data.as_mut().unwrap().tier_code = "gone".into();
            rec.updated_at = Utc::now();
            eng.db.update_registration(&rec, prev).await.unwrap();
        }

        let err = eng.complete_registration(id).await.unwrap_err();
        assert!(matches!(err, RegistrationError::InvalidTier(_)));

        // No partial entities, record still pre-completion.
        assert!(!eng.db.user_email_exists("a@b.com").await.unwrap());
        let rec = eng.db.get_registration(id).await.unwrap().unwrap();
        assert_eq!(rec.status, RegistrationStatus::PaymentCompleted);

        // Fix the cause and retry.
        {
            let mut rec = eng.db.get_registration(id).await.unwrap().unwrap();
            let prev = rec.updated_at;
            rec.subscription_data.as_mut().unwrap().tier_code = "basic".into();
            rec.updated_at = Utc::now();
            eng.db.update_registration(&rec, prev).await.unwrap();
        }
        let snap = eng.complete_registration(id).await.unwrap();
        assert_eq!(snap.status, RegistrationStatus::Completed);
    }

    // ── cancel / status / resend ────────────────────────────────────

    #[tokio::test]
    async fn cancel_blocks_further_operations() {
        let eng = engine().await;
        let snap = eng.start(start_req("a@b.com")).await.unwrap();
        eng.cancel(snap.id).await.unwrap();

        let err = eng.verify_email(snap.id, "123456").await.unwrap_err();
        assert!(matches!(
            err,
            RegistrationError::Terminal {
                status: RegistrationStatus::Cancelled
            }
        ));

        // A cancelled record is no longer active, so start opens a new one.
        let fresh = eng.start(start_req("a@b.com")).await.unwrap();
        assert_ne!(fresh.id, snap.id);
    }

    #[tokio::test]
    async fn cancel_after_completion_is_rejected() {
        let eng = engine().await;
        let id = paid(&eng, "a@b.com", "Clinic A").await;
        eng.complete_registration(id).await.unwrap();

        let err = eng.cancel(id).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Terminal { .. }));
    }

    #[tokio::test]
    async fn status_reports_derived_resume_step() {
        let eng = engine().await;
        let id = verified(&eng, "a@b.com").await;
        let snap = eng.status(id).await.unwrap();
        assert_eq!(snap.current_step, RegistrationStep::EmailVerification);
        assert_eq!(snap.next_step, RegistrationStep::ClinicInfo);
    }

    #[tokio::test]
    async fn status_of_unknown_record_is_not_found() {
        let eng = engine().await;
        let err = eng.status(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, RegistrationError::NotFound(_)));
    }

    #[tokio::test]
    async fn resend_rotates_the_code() {
        let eng = engine().await;
        let snap = eng.start(start_req("a@b.com")).await.unwrap();
        let first = stored_code(&eng, snap.id).await;

        // Codes are random and may collide; resend until the stored code
        // actually differs so the rejection check below always runs.
        let mut second = stored_code(&eng, snap.id).await;
        while second == first {
            eng.resend_code("a@b.com").await.unwrap();
            second = stored_code(&eng, snap.id).await;
        }

        let err = eng.verify_email(snap.id, &first).await.unwrap_err();
        assert!(matches!(err, RegistrationError::CodeMismatch));
        eng.verify_email(snap.id, &second).await.unwrap();
    }

    #[tokio::test]
    async fn resend_for_unknown_email_is_not_found() {
        let eng = engine().await;
        let err = eng.resend_code("ghost@b.com").await.unwrap_err();
        assert!(matches!(err, RegistrationError::NoActiveRegistration(_)));
    }

    #[tokio::test]
    async fn resend_after_verification_is_rejected() {
        let eng = engine().await;
        verified(&eng, "a@b.com").await;
        let err = eng.resend_code("a@b.com").await.unwrap_err();
        assert!(matches!(err, RegistrationError::AlreadyVerified));
    }

    // ── lock registry ───────────────────────────────────────────────

    #[tokio::test]
    async fn lock_registry_drains_after_operations() {
        let eng = engine().await;
        for i in 0..50 {
            eng.start(start_req(&format!("user{i}@b.com"))).await.unwrap();
        }
        // Every guard has been dropped, so no key may linger.
        assert!(eng.locks.lock().unwrap().is_empty());

        let snap = eng.start(start_req("a@b.com")).await.unwrap();
        let code = stored_code(&eng, snap.id).await;
        eng.verify_email(snap.id, &code).await.unwrap();
        assert!(eng.locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn lock_entry_survives_while_a_waiter_is_queued() {
        let eng = Arc::new(engine().await);
        let snap = eng.start(start_req("a@b.com")).await.unwrap();

        // Hold the record's lock, then queue a second operation behind it.
        let held = eng.guard(&snap.id.to_string()).await;
        let queued = {
            let eng = Arc::clone(&eng);
            tokio::spawn(async move { eng.status(snap.id).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert_eq!(eng.locks.lock().unwrap().len(), 1);

        drop(held);
        queued.await.unwrap().unwrap();
        assert!(eng.locks.lock().unwrap().is_empty());
    }

    // ── expiration ──────────────────────────────────────────────────

    #[tokio::test]
    async fn expired_record_is_flipped_on_first_access() {
        let eng = engine_with_ttl(0).await;
        let snap = eng.start(start_req("a@b.com")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let err = eng.verify_email(snap.id, "123456").await.unwrap_err();
        assert!(matches!(err, RegistrationError::Expired { .. }));

        let rec = eng.db.get_registration(snap.id).await.unwrap().unwrap();
        assert_eq!(rec.status, RegistrationStatus::Expired);

        // Every later access keeps failing with the same reason.
        let err = eng.status(snap.id).await.unwrap_err();
        assert!(matches!(err, RegistrationError::Expired { .. }));
        assert_eq!(err.reason(), "registration_expired");
    }

    #[tokio::test]
    async fn start_over_replaces_an_expired_record() {
        let eng = engine_with_ttl(0).await;
        let old = eng.start(start_req("a@b.com")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;

        let fresh = eng.start(start_req("a@b.com")).await.unwrap();
        assert_ne!(fresh.id, old.id);
        assert_eq!(fresh.status, RegistrationStatus::UserCreated);

        let flipped = eng.db.get_registration(old.id).await.unwrap().unwrap();
        assert_eq!(flipped.status, RegistrationStatus::Expired);
    }
}
