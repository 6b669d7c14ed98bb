//! Clinic Onboard — multi-step clinic registration service.

pub mod config;
pub mod email;
pub mod error;
pub mod password;
pub mod registration;
pub mod store;
