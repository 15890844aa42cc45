use std::sync::Arc;

use sqlx::PgPool;

use crate::config::Config;
use crate::error::AppError;
use crate::repositories::{AuditLogRepository, UserRepository};
use crate::services::{AuditLogger, AuthService, RateLimiter, SecretCipher, TotpService};
use secrecy::ExposeSecret;

/// アプリケーション共有状態
///
/// axum の State として全ハンドラーで共有される。
/// Clone は必須（axum が内部で clone するため）。
#[derive(Clone)]
pub struct AppState {
    /// PostgreSQL コネクションプール
    pub db_pool: PgPool,
    /// アプリケーション設定（Arc で共有）
    pub config: Arc<Config>,
    /// レート制限カウンター（合成ルートが所有し、掃除タスクは main が起動する）
    pub rate_limiter: Arc<RateLimiter>,
    /// 監査ログサービス
    pub audit: AuditLogger,
    /// 認証・アカウントセキュリティの合成ルート
    pub auth_service: AuthService,
}

impl AppState {
    /// 新しい AppState を作成
    pub fn new(db_pool: PgPool, config: Config) -> Result<Self, AppError> {
        let config = Arc::new(config);

        let user_repo = Arc::new(UserRepository::new(db_pool.clone()));
        let audit_repo = Arc::new(AuditLogRepository::new(db_pool.clone()));

        let cipher = SecretCipher::new(
            config.encryption_master_key.expose_secret(),
            config.kdf_iterations,
        )?;
        let totp_service = TotpService::new(config.totp_issuer.clone());
        let rate_limiter = Arc::new(RateLimiter::new());
        let audit = AuditLogger::new(audit_repo);

        let auth_service = AuthService::new(
            user_repo,
            totp_service,
            cipher,
            rate_limiter.clone(),
            audit.clone(),
        );

        Ok(Self {
            db_pool,
            config,
            rate_limiter,
            audit,
            auth_service,
        })
    }
}
