//! Registration data model — the record aggregate, statuses, steps, and
//! step payloads.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Coarse-grained lifecycle state of a registration record.
///
/// Monotonic along the happy path; `Cancelled` and `Expired` are absorbing
/// states reachable from any non-terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    UserCreated,
    EmailVerified,
    ClinicCreated,
    SubscriptionSelected,
    PaymentPending,
    PaymentCompleted,
    Completed,
    Cancelled,
    Expired,
}

impl RegistrationStatus {
    /// Terminal records accept no further transitions.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Cancelled | Self::Expired)
    }
}

impl std::fmt::Display for RegistrationStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserCreated => "user_created",
            Self::EmailVerified => "email_verified",
            Self::ClinicCreated => "clinic_created",
            Self::SubscriptionSelected => "subscription_selected",
            Self::PaymentPending => "payment_pending",
            Self::PaymentCompleted => "payment_completed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RegistrationStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_created" => Ok(Self::UserCreated),
            "email_verified" => Ok(Self::EmailVerified),
            "clinic_created" => Ok(Self::ClinicCreated),
            "subscription_selected" => Ok(Self::SubscriptionSelected),
            "payment_pending" => Ok(Self::PaymentPending),
            "payment_completed" => Ok(Self::PaymentCompleted),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "expired" => Ok(Self::Expired),
            _ => Err(format!("Unknown registration status: {s}")),
        }
    }
}

/// A position in the fixed five-stage signup flow (plus the terminal
/// `Complete` marker).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStep {
    UserForm,
    EmailVerification,
    ClinicInfo,
    Subscription,
    Payment,
    Complete,
}

impl std::fmt::Display for RegistrationStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::UserForm => "user_form",
            Self::EmailVerification => "email_verification",
            Self::ClinicInfo => "clinic_info",
            Self::Subscription => "subscription",
            Self::Payment => "payment",
            Self::Complete => "complete",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for RegistrationStep {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "user_form" => Ok(Self::UserForm),
            "email_verification" => Ok(Self::EmailVerification),
            "clinic_info" => Ok(Self::ClinicInfo),
            "subscription" => Ok(Self::Subscription),
            "payment" => Ok(Self::Payment),
            "complete" => Ok(Self::Complete),
            _ => Err(format!("Unknown registration step: {s}")),
        }
    }
}

/// Sub-status of the nested payment state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Cancelled,
}

impl std::fmt::Display for PaymentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

impl std::str::FromStr for PaymentStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown payment status: {s}")),
        }
    }
}

/// How the candidate wants to pay.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    CreditCard,
    DebitCard,
    BankTransfer,
    Paypal,
}

impl PaymentMethod {
    /// Bank transfers wait for an external confirmation; everything else
    /// settles immediately in this service (gateway integration is out of
    /// scope, see `process_payment`).
    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::BankTransfer)
    }
}

/// Billing cadence for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BillingCycle {
    Monthly,
    Yearly,
}

impl std::fmt::Display for BillingCycle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Monthly => write!(f, "monthly"),
            Self::Yearly => write!(f, "yearly"),
        }
    }
}

/// Account details captured on the first step. The password is hashed
/// before it reaches this struct; plaintext is never persisted.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserData {
    pub name: String,
    pub email: String,
    pub password_hash: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
}

/// Clinic profile captured on the third step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClinicData {
    pub name: String,
    pub email: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub city: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub specialty: Option<String>,
}

/// The chosen subscription. `amount` is computed from the tier's price at
/// selection time and is the reference value every payment must match.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionData {
    pub tier_code: String,
    pub billing_cycle: BillingCycle,
    pub currency: String,
    pub amount: Decimal,
}

/// Payment attempt details. Resubmittable while the payment sub-status is
/// pending/processing or after a failure; frozen once completed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentData {
    pub method: PaymentMethod,
    pub amount: Decimal,
    pub currency: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub paid_at: Option<DateTime<Utc>>,
}

/// A subscription tier as exposed by the tier catalog.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubscriptionTier {
    pub code: String,
    pub name: String,
    pub monthly_price: Decimal,
    pub yearly_price: Decimal,
    pub currency: String,
    pub is_active: bool,
}

impl SubscriptionTier {
    /// Price for the given billing cycle.
    pub fn price_for(&self, cycle: BillingCycle) -> Decimal {
        match cycle {
            BillingCycle::Monthly => self.monthly_price,
            BillingCycle::Yearly => self.yearly_price,
        }
    }
}

/// The aggregate root of the onboarding workflow — one registration
/// attempt end-to-end. Mutated exclusively through the engine, never
/// deleted: terminal records are kept as an audit trail.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationRecord {
    pub id: Uuid,
    /// Lowercased candidate email. Unique among active records only.
    pub email: String,
    pub status: RegistrationStatus,
    /// The most recently completed step.
    pub current_step: RegistrationStep,
    /// Append-only ordered set; the authoritative gate input.
    pub completed_steps: Vec<RegistrationStep>,
    pub user_data: Option<UserData>,
    pub clinic_data: Option<ClinicData>,
    pub subscription_data: Option<SubscriptionData>,
    pub payment_data: Option<PaymentData>,
    /// Cleared the moment it is consumed; never valid twice.
    pub verification_code: Option<String>,
    pub email_verified: bool,
    pub email_verified_at: Option<DateTime<Utc>>,
    pub payment_status: Option<PaymentStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// Set only by a successful finalization.
    pub created_user_id: Option<Uuid>,
    pub created_clinic_id: Option<Uuid>,
}

impl RegistrationRecord {
    /// Create a fresh record for `email` in the `UserCreated` state with the
    /// `UserForm` step already completed.
    pub fn new(email: &str, user_data: UserData, code: String, ttl_days: i64) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            status: RegistrationStatus::UserCreated,
            current_step: RegistrationStep::UserForm,
            completed_steps: vec![RegistrationStep::UserForm],
            user_data: Some(user_data),
            clinic_data: None,
            subscription_data: None,
            payment_data: None,
            verification_code: Some(code),
            email_verified: false,
            email_verified_at: None,
            payment_status: None,
            created_at: now,
            updated_at: now,
            expires_at: now + chrono::Duration::days(ttl_days),
            completed_at: None,
            created_user_id: None,
            created_clinic_id: None,
        }
    }

    /// Whether this step is already in the completed set.
    pub fn has_completed(&self, step: RegistrationStep) -> bool {
        self.completed_steps.contains(&step)
    }

    /// Append a step to the completed set and make it current.
    /// Idempotent: a step is never recorded twice.
    pub fn complete_step(&mut self, step: RegistrationStep) {
        if !self.has_completed(step) {
            self.completed_steps.push(step);
        }
        self.current_step = step;
    }

    /// Whether the record has passed its expiration deadline.
    pub fn is_past_expiry(&self, now: DateTime<Utc>) -> bool {
        !self.status.is_terminal() && now > self.expires_at
    }

    /// Whether the nested payment machine has reached `Completed`.
    pub fn payment_completed(&self) -> bool {
        self.payment_status == Some(PaymentStatus::Completed)
    }
}

/// Client-facing view of a record, returned by every engine operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrationSnapshot {
    pub id: Uuid,
    pub email: String,
    pub status: RegistrationStatus,
    pub current_step: RegistrationStep,
    /// Where an abandoned flow should resume — derived from data presence,
    /// not from the completed-step list.
    pub next_step: RegistrationStep,
    pub completed_steps: Vec<RegistrationStep>,
    pub email_verified: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment_status: Option<PaymentStatus>,
    /// The computed subscription amount, once a tier has been selected.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub amount: Option<Decimal>,
    pub expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_user_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_clinic_id: Option<Uuid>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn user_data() -> UserData {
        UserData {
            name: "Ada".into(),
            email: "ada@example.com".into(),
            password_hash: "hashed".into(),
            source: None,
            referrer: None,
        }
    }

    #[test]
    fn new_record_starts_with_user_form_completed() {
        let rec = RegistrationRecord::new("Ada@Example.com ", user_data(), "123456".into(), 7);
        assert_eq!(rec.email, "ada@example.com");
        assert_eq!(rec.status, RegistrationStatus::UserCreated);
        assert_eq!(rec.current_step, RegistrationStep::UserForm);
        assert_eq!(rec.completed_steps, vec![RegistrationStep::UserForm]);
        assert!(!rec.email_verified);
        assert_eq!(rec.verification_code.as_deref(), Some("123456"));
        assert!(rec.expires_at > rec.created_at);
    }

    #[test]
    fn complete_step_is_idempotent() {
        let mut rec = RegistrationRecord::new("a@b.com", user_data(), "111111".into(), 7);
        rec.complete_step(RegistrationStep::EmailVerification);
        rec.complete_step(RegistrationStep::EmailVerification);
        assert_eq!(
            rec.completed_steps,
            vec![RegistrationStep::UserForm, RegistrationStep::EmailVerification]
        );
        assert_eq!(rec.current_step, RegistrationStep::EmailVerification);
    }

    #[test]
    fn terminal_statuses() {
        assert!(RegistrationStatus::Completed.is_terminal());
        assert!(RegistrationStatus::Cancelled.is_terminal());
        assert!(RegistrationStatus::Expired.is_terminal());
        assert!(!RegistrationStatus::PaymentPending.is_terminal());
    }

    #[test]
    fn terminal_records_never_expire_again() {
        let mut rec = RegistrationRecord::new("a@b.com", user_data(), "111111".into(), 7);
        rec.status = RegistrationStatus::Cancelled;
        let later = rec.expires_at + chrono::Duration::days(1);
        assert!(!rec.is_past_expiry(later));
    }

    #[test]
    fn status_display_matches_serde() {
        let statuses = [
            RegistrationStatus::UserCreated,
            RegistrationStatus::EmailVerified,
            RegistrationStatus::ClinicCreated,
            RegistrationStatus::SubscriptionSelected,
            RegistrationStatus::PaymentPending,
            RegistrationStatus::PaymentCompleted,
            RegistrationStatus::Completed,
            RegistrationStatus::Cancelled,
            RegistrationStatus::Expired,
        ];
        for status in statuses {
            let json = serde_json::to_string(&status).unwrap();
            assert_eq!(json, format!("\"{status}\""));
            let parsed: RegistrationStatus = format!("{status}").parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn tier_price_by_cycle() {
        let tier = SubscriptionTier {
            code: "basic".into(),
            name: "Basic".into(),
            monthly_price: dec!(49.90),
            yearly_price: dec!(499.00),
            currency: "USD".into(),
            is_active: true,
        };
        assert_eq!(tier.price_for(BillingCycle::Monthly), dec!(49.90));
        assert_eq!(tier.price_for(BillingCycle::Yearly), dec!(499.00));
    }

    #[test]
    fn record_serde_roundtrip() {
        let mut rec = RegistrationRecord::new("a@b.com", user_data(), "222222".into(), 7);
        rec.subscription_data = Some(SubscriptionData {
            tier_code: "basic".into(),
            billing_cycle: BillingCycle::Monthly,
            currency: "USD".into(),
            amount: dec!(49.90),
        });
        let json = serde_json::to_string(&rec).unwrap();
        let parsed: RegistrationRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, rec.id);
        assert_eq!(parsed.subscription_data.unwrap().amount, dec!(49.90));
    }
}
