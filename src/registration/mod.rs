//! Clinic registration workflow — a five-step onboarding state machine
//! with durable records, lazy expiration, and atomic finalization.

pub mod code;
pub mod engine;
pub mod model;
pub mod routes;
pub mod steps;

pub use engine::{PaymentRequest, RegistrationEngine, StartRegistration};
pub use model::{
    BillingCycle, ClinicData, PaymentMethod, PaymentStatus, RegistrationRecord,
    RegistrationSnapshot, RegistrationStatus, RegistrationStep,
};
pub use routes::{RegistrationRouteState, registration_routes};
