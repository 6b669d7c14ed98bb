//! Verification code generation.

use rand::Rng;

/// Number of digits in a verification code.
pub const CODE_LEN: usize = 6;

/// Generate a zero-padded numeric verification code.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    let n: u32 = rng.gen_range(0..1_000_000);
    format!("{n:06}")
}

/// Compare a supplied code against the stored one. An absent or empty
/// stored code never matches anything.
pub fn code_matches(stored: Option<&str>, supplied: &str) -> bool {
    match stored {
        Some(code) => !code.is_empty() && code == supplied.trim(),
        None => false,
    }
}
