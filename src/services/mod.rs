pub mod audit;
pub mod auth;
pub mod backup_codes;
pub mod rate_limit;
pub mod secret_cipher;
pub mod totp;

pub use audit::AuditLogger;
pub use auth::AuthService;
pub use rate_limit::{RateLimiter, RatePolicy, presets};
pub use secret_cipher::SecretCipher;
pub use totp::TotpService;
