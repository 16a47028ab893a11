//! Data Transfer Objects

mod recovery_config;
mod recovery_report;

pub use recovery_config::RecoveryConfig;
pub use recovery_report::RecoveryReport;
