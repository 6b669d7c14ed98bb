//! Error types for the clinic onboarding service.

use uuid::Uuid;

use crate::registration::model::{RegistrationStatus, RegistrationStep};

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registration error: {0}")]
    Registration(#[from] RegistrationError),

    #[error("Mailer error: {0}")]
    Mailer(#[from] MailerError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection error: {0}")]
    Connection(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Constraint violation: {0}")]
    Constraint(String),

    #[error("Stale write: {entity} {id} was modified concurrently")]
    StaleWrite { entity: String, id: String },

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Verification-code delivery errors.
#[derive(Debug, thiserror::Error)]
pub enum MailerError {
    #[error("Failed to build message for {email}: {reason}")]
    Build { email: String, reason: String },

    #[error("Failed to send verification code to {email}: {reason}")]
    Send { email: String, reason: String },
}

/// Workflow validation errors surfaced by the registration engine.
///
/// Every variant falls into one of four classes: conflict, not-found,
/// bad-request, or expired. The HTTP status mapping lives in the routes
/// layer; [`RegistrationError::reason`] gives clients a stable
/// machine-readable code.
#[derive(Debug, thiserror::Error)]
pub enum RegistrationError {
    #[error("An account already exists for {0}")]
    AccountExists(String),

    #[error("A clinic named {0} is already registered")]
    ClinicExists(String),

    #[error("Registration {0} not found")]
    NotFound(Uuid),

    #[error("No active registration for {0}")]
    NoActiveRegistration(String),

    #[error("Registration {id} has expired")]
    Expired { id: Uuid },

    #[error("Registration is {status}, no further changes are accepted")]
    Terminal { status: RegistrationStatus },

    #[error("Step {step} is not reachable yet")]
    StepNotAllowed { step: RegistrationStep },

    #[error("Email is already verified")]
    AlreadyVerified,

    #[error("Verification code does not match")]
    CodeMismatch,

    #[error("Unknown or inactive subscription tier: {0}")]
    InvalidTier(String),

    #[error("{0} data has already been submitted")]
    AlreadySubmitted(&'static str),

    #[error("Missing {0} data")]
    MissingData(&'static str),

    #[error("Payment amount {got} does not match subscription amount {expected}")]
    AmountMismatch { expected: String, got: String },

    #[error("Payment currency {got} does not match subscription currency {expected}")]
    CurrencyMismatch { expected: String, got: String },

    #[error("Payment is not awaiting confirmation")]
    NotAwaitingConfirmation,

    #[error("Payment has already completed")]
    PaymentAlreadyCompleted,

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),
}

impl RegistrationError {
    /// Stable machine-readable reason code for API clients.
    pub fn reason(&self) -> &'static str {
        match self {
            Self::AccountExists(_) => "account_exists",
            Self::ClinicExists(_) => "clinic_exists",
            Self::NotFound(_) => "registration_not_found",
            Self::NoActiveRegistration(_) => "no_active_registration",
            Self::Expired { .. } => "registration_expired",
            Self::Terminal { .. } => "registration_terminal",
            Self::StepNotAllowed { .. } => "step_not_allowed",
            Self::AlreadyVerified => "already_verified",
            Self::CodeMismatch => "code_mismatch",
            Self::InvalidTier(_) => "invalid_tier",
            Self::AlreadySubmitted(_) => "already_submitted",
            Self::MissingData(_) => "missing_data",
            Self::AmountMismatch { .. } => "amount_mismatch",
            Self::CurrencyMismatch { .. } => "currency_mismatch",
            Self::NotAwaitingConfirmation => "not_awaiting_confirmation",
            Self::PaymentAlreadyCompleted => "payment_already_completed",
            Self::Database(_) => "storage_error",
        }
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
