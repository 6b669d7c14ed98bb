//! Step gates — pure decision logic, no I/O.
//!
//! `can_proceed_to` is the authoritative precondition check for advancing
//! the flow; `resume_step` derives "where are you now" from data presence
//! so an abandoned flow can be resumed even when the completed-step list
//! is inconsistent with the record's payloads.

use super::model::{RegistrationRecord, RegistrationStep};

/// Whether `record` satisfies the prerequisites for `target`.
///
/// `ClinicInfo` deliberately checks the completed-step flag *and* the
/// verified flag as two independent booleans: a code path that marks the
/// verification step visited without actually verifying must not unlock
/// the clinic form.
pub fn can_proceed_to(record: &RegistrationRecord, target: RegistrationStep) -> bool {
    use RegistrationStep::*;
    match target {
        UserForm => true,
        EmailVerification => record.has_completed(UserForm),
        ClinicInfo => record.has_completed(EmailVerification) && record.email_verified,
        Subscription => record.has_completed(ClinicInfo),
        Payment => record.has_completed(Subscription),
        Complete => record.has_completed(Payment) && record.payment_completed(),
    }
}

/// The step an abandoned flow should resume at, derived from data
/// presence rather than the completed-step flags.
pub fn resume_step(record: &RegistrationRecord) -> RegistrationStep {
    use RegistrationStep::*;
    if record.user_data.is_none() {
        UserForm
    } else if !record.email_verified {
        EmailVerification
    } else if record.clinic_data.is_none() {
        ClinicInfo
    } else if record.subscription_data.is_none() {
        Subscription
    } else if !record.payment_completed() {
        Payment
    } else {
        Complete
    }
}
