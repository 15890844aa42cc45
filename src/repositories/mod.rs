pub mod audit;
pub mod user;

pub use audit::{AuditLogRepository, AuditStore};
pub use user::{CredentialStore, UserRepository};
