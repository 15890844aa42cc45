pub mod audit;
pub mod user;

pub use audit::{
    AuditAction, AuditActor, AuditEntry, AuditFilter, AuditSeverity, ClientInfo, NewAuditEntry,
    SuspiciousActivity,
};
pub use user::User;
