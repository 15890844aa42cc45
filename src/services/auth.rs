use std::sync::Arc;

use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use serde_json::json;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::{
    AuditAction, AuditActor, AuditSeverity, ClientInfo, NewAuditEntry, User,
};
use crate::repositories::CredentialStore;
use crate::services::audit::AuditLogger;
use crate::services::backup_codes::{self, BACKUP_CODE_COUNT};
use crate::services::rate_limit::{RateLimiter, presets};
use crate::services::secret_cipher::SecretCipher;
use crate::services::totp::TotpService;

/// 統一拒否理由。不在ユーザー・パスワード不一致・2FAコード不一致の
/// いずれでも外部から観測できるメッセージはこれ1つ（列挙攻撃対策）。
pub const REASON_INVALID_CREDENTIALS: &str = "invalid_credentials";
/// パスワード照合成功後にのみ到達する、唯一区別可能な拒否理由
pub const REASON_SECOND_FACTOR_REQUIRED: &str = "second_factor_required";

/// ユーザー不在時にも実行するダミーのパスワード検証用ハッシュ
/// （応答時間からの存在推測を防ぐ）。本番と同じパラメーター・
/// 16バイトソルト・32バイト出力の正規形式で、どの入力とも一致しない。
const DUMMY_HASH: &str =
    "$argon2id$v=19$m=19456,t=2,p=1$Ys+iJcEADg4t4uY4g0tb9g$o1sZdxExj2GvFZ2lZuyraczvr2lneUA7Fzhgnr1VYTg";

/// ログイン試行の入力
#[derive(Debug, Clone)]
pub struct LoginAttempt {
    pub email: String,
    pub password: String,
    /// 認証アプリの6桁コード
    pub totp_code: Option<String>,
    /// バックアップコード（TOTPの代替、1回限り）
    pub backup_code: Option<String>,
}

/// ログイン判定の結果
#[derive(Debug)]
pub enum LoginOutcome {
    Allowed(User),
    /// パスワードは正しいが第二要素の提示が必要
    SecondFactorRequired,
}

/// 2FA登録開始時にクライアントへ返す一式（この時点では何も永続化しない）
#[derive(Debug)]
pub struct EnrollmentMaterial {
    pub secret: String,
    pub otpauth_url: String,
    /// 表示専用のQRコード（PNG、Base64）
    pub qr_code: String,
    pub backup_codes: Vec<String>,
}

/// パスワードをargon2idでハッシュ化
pub fn hash_password(password: &str) -> Result<String, AppError> {
    let salt = SaltString::generate(&mut OsRng);
    let argon2 = Argon2::default();
    let hash = argon2
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| {
            tracing::error!(error = ?e, "パスワードハッシュ生成エラー");
            AppError::Internal(anyhow::anyhow!("password hash error"))
        })?;
    Ok(hash.to_string())
}

/// パスワードを検証
fn verify_password(password: &str, hash: &str) -> Result<bool, AppError> {
    let parsed_hash = PasswordHash::new(hash).map_err(|e| {
        tracing::error!(error = ?e, "パスワードハッシュのパースエラー");
        AppError::Internal(anyhow::anyhow!("password hash parse error"))
    })?;

    Ok(Argon2::default()
        .verify_password(password.as_bytes(), &parsed_hash)
        .is_ok())
}

/// argon2 はCPUバウンドなので、リクエストディスパッチを塞がないよう
/// ワーカースレッドへ逃がす
async fn verify_password_off_thread(password: String, hash: String) -> Result<bool, AppError> {
    tokio::task::spawn_blocking(move || verify_password(&password, &hash))
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("hash task join error: {e}")))?
}

fn invalid_credentials() -> AppError {
    AppError::Authentication(REASON_INVALID_CREDENTIALS.to_string())
}

/// 認証・アカウントセキュリティの合成ルート
///
/// パスワード照合・第二要素・レート制限・監査の順序と組み合わせを
/// ここで一元管理する。レート制限チェックはパスワード照合より必ず先。
#[derive(Clone)]
pub struct AuthService {
    users: Arc<dyn CredentialStore>,
    totp: TotpService,
    cipher: SecretCipher,
    rate_limiter: Arc<RateLimiter>,
    audit: AuditLogger,
}

impl AuthService {
    pub fn new(
        users: Arc<dyn CredentialStore>,
        totp: TotpService,
        cipher: SecretCipher,
        rate_limiter: Arc<RateLimiter>,
        audit: AuditLogger,
    ) -> Self {
        Self {
            users,
            totp,
            cipher,
            rate_limiter,
            audit,
        }
    }

    /// ログイン試行を判定
    ///
    /// 状態遷移:
    /// 1. レート制限（IPキー・メールキーの両方、どちらかの拒否で即拒否）
    /// 2. ユーザー検索（不在でもダミー照合でタイミングを揃える）
    /// 3. パスワード照合
    /// 4. 2FA有効なら TOTP またはバックアップコードを検証
    /// 5. 成功時はレート制限をリセットし login_success を監査記録
    pub async fn authenticate(
        &self,
        attempt: LoginAttempt,
        client: ClientInfo,
    ) -> Result<LoginOutcome, AppError> {
        let email = attempt.email.trim().to_lowercase();
        let ip = client.ip_address.as_deref().unwrap_or("unknown");
        let ip_key = format!("login:ip:{ip}");
        let email_key = format!("login:email:{email}");

        // 拒否されたリクエストはパスワードハッシュに一切触れない
        self.enforce_rate_limit(&[&ip_key, &email_key], &presets::LOGIN)?;

        let Some(user) = self.users.find_by_email(&email).await? else {
            self.equalize_timing(&attempt.password).await;
            self.audit_login_failed(
                AuditActor::system(),
                &client,
                json!({ "email": email, "stage": "lookup" }),
            )
            .await;
            return Err(invalid_credentials());
        };

        let Some(password_hash) = user.password_hash.clone() else {
            // パスワード未設定アカウントも不在と同じ見え方にする
            self.equalize_timing(&attempt.password).await;
            self.audit_login_failed(
                AuditActor::from_user(&user),
                &client,
                json!({ "stage": "no_password" }),
            )
            .await;
            return Err(invalid_credentials());
        };

        if !verify_password_off_thread(attempt.password.clone(), password_hash).await? {
            self.audit_login_failed(
                AuditActor::from_user(&user),
                &client,
                json!({ "stage": "password" }),
            )
            .await;
            return Err(invalid_credentials());
        }

        if user.two_factor_enabled {
            if let Some(code) = &attempt.totp_code {
                self.verify_totp_login(&user, code, &client).await?;
            } else if let Some(backup_code) = &attempt.backup_code {
                self.consume_backup_code_login(&user, backup_code, &client)
                    .await?;
            } else {
                // パスワード検証済みの場合のみ到達する、区別可能な唯一の拒否
                return Ok(LoginOutcome::SecondFactorRequired);
            }
        }

        // 認証成功で過去の失敗を赦す
        self.rate_limiter.reset(&ip_key);
        self.rate_limiter.reset(&email_key);

        self.audit
            .record(
                NewAuditEntry::new(
                    AuditActor::from_user(&user),
                    AuditAction::LoginSuccess,
                    AuditSeverity::Info,
                )
                .resource("user", Some(user.id.to_string()))
                .client(&client),
            )
            .await;

        Ok(LoginOutcome::Allowed(user))
    }

    /// 2FA登録の開始: シークレット・URI・QR・バックアップコードを生成して返す
    ///
    /// この段階では何も永続化しない。クライアントがコードを提示できることを
    /// `confirm_second_factor` で証明して初めて保存する（ロックイン防止）。
    pub async fn setup_second_factor(
        &self,
        user_id: Uuid,
        client: ClientInfo,
    ) -> Result<EnrollmentMaterial, AppError> {
        let setup_key = format!("2fa:setup:{user_id}");
        self.enforce_rate_limit(&[&setup_key], &presets::TWO_FACTOR_SETUP)?;

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::Validation("ユーザーが見つかりません".to_string()))?;

        if user.two_factor_enabled {
            return Err(AppError::TotpAlreadyEnabled);
        }

        let secret = TotpService::generate_secret();
        let otpauth_url = self.totp.provisioning_uri(&secret, &user.email)?;
        let qr_code = self.totp.qr_code_base64(&secret, &user.email)?;
        let codes = backup_codes::generate_codes();

        self.audit
            .record(
                NewAuditEntry::new(
                    AuditActor::from_user(&user),
                    AuditAction::TwoFactorSetupInitiated,
                    AuditSeverity::Info,
                )
                .resource("user", Some(user.id.to_string()))
                .client(&client),
            )
            .await;

        Ok(EnrollmentMaterial {
            secret,
            otpauth_url,
            qr_code,
            backup_codes: codes,
        })
    }

    /// 2FA登録の確定: 提示されたシークレットに対するライブコードを再検証し、
    /// 成功した場合のみ暗号化・ハッシュ化して永続化、フラグを有効化する
    pub async fn confirm_second_factor(
        &self,
        user_id: Uuid,
        secret: &str,
        code: &str,
        codes: &[String],
        client: ClientInfo,
    ) -> Result<(), AppError> {
        let verify_key = format!("2fa:verify:{user_id}");
        self.enforce_rate_limit(&[&verify_key], &presets::TWO_FACTOR_VERIFY)?;

        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::Validation("ユーザーが見つかりません".to_string()))?;

        if user.two_factor_enabled {
            return Err(AppError::TotpAlreadyEnabled);
        }

        if codes.len() != BACKUP_CODE_COUNT {
            return Err(AppError::Validation(format!(
                "バックアップコードは{BACKUP_CODE_COUNT}個必要です"
            )));
        }

        if !self.totp.verify_code(secret, code) {
            self.audit
                .record(
                    NewAuditEntry::new(
                        AuditActor::from_user(&user),
                        AuditAction::TwoFactorVerifyFailed,
                        AuditSeverity::Warning,
                    )
                    .resource("user", Some(user.id.to_string()))
                    .client(&client),
                )
                .await;
            return Err(AppError::TotpInvalid);
        }

        // 暗号化とハッシュ化はどちらもCPUバウンド
        let cipher = self.cipher.clone();
        let secret_owned = secret.to_string();
        let codes_owned = codes.to_vec();
        let (encrypted, hashes) = tokio::task::spawn_blocking(move || {
            let encrypted = cipher.encrypt(&secret_owned)?;
            let hashes = backup_codes::hash_codes(&codes_owned)?;
            Ok::<_, AppError>((encrypted, hashes))
        })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("crypto task join error: {e}")))??;

        self.users
            .enable_two_factor(user.id, &encrypted, &hashes)
            .await?;

        self.audit
            .record(
                NewAuditEntry::new(
                    AuditActor::from_user(&user),
                    AuditAction::TwoFactorEnabled,
                    AuditSeverity::Info,
                )
                .resource("user", Some(user.id.to_string()))
                .client(&client),
            )
            .await;

        Ok(())
    }

    /// 2FAの無効化。アクティブなセッションだけでは不十分で、
    /// 現在のパスワードの再入力を要求する
    pub async fn disable_second_factor(
        &self,
        user_id: Uuid,
        password: &str,
        client: ClientInfo,
    ) -> Result<(), AppError> {
        let user = self
            .users
            .find_by_id(user_id)
            .await?
            .ok_or_else(|| AppError::Validation("ユーザーが見つかりません".to_string()))?;

        let Some(password_hash) = user.password_hash.clone() else {
            self.equalize_timing(password).await;
            return Err(invalid_credentials());
        };

        if !verify_password_off_thread(password.to_string(), password_hash).await? {
            self.audit
                .record(
                    NewAuditEntry::new(
                        AuditActor::from_user(&user),
                        AuditAction::TwoFactorDisableFailed,
                        AuditSeverity::Warning,
                    )
                    .resource("user", Some(user.id.to_string()))
                    .details(json!({ "stage": "password" }))
                    .client(&client),
                )
                .await;
            return Err(invalid_credentials());
        }

        if !user.two_factor_enabled {
            return Err(AppError::TotpNotEnabled);
        }

        self.users.disable_two_factor(user.id).await?;

        self.audit
            .record(
                NewAuditEntry::new(
                    AuditActor::from_user(&user),
                    AuditAction::TwoFactorDisabled,
                    AuditSeverity::Warning,
                )
                .resource("user", Some(user.id.to_string()))
                .client(&client),
            )
            .await;

        Ok(())
    }

    /// 複数キーのレート制限を合成判定（どれか1つの拒否で全体を拒否）
    fn enforce_rate_limit(
        &self,
        keys: &[&str],
        policy: &crate::services::rate_limit::RatePolicy,
    ) -> Result<(), AppError> {
        let now = OffsetDateTime::now_utc();
        let mut retry_after: Option<i64> = None;

        for key in keys {
            let verdict = self.rate_limiter.check(key, policy);
            if !verdict.allowed {
                // 最も厳しい（遅い）解除時刻を採用
                let until = verdict.blocked_until.unwrap_or(verdict.reset_at);
                let secs = (until - now).whole_seconds().max(0);
                retry_after = Some(retry_after.map_or(secs, |prev| prev.max(secs)));
            }
        }

        match retry_after {
            Some(retry_after_secs) => Err(AppError::RateLimited { retry_after_secs }),
            None => Ok(()),
        }
    }

    /// ログイン時のTOTP検証
    async fn verify_totp_login(
        &self,
        user: &User,
        code: &str,
        client: &ClientInfo,
    ) -> Result<(), AppError> {
        let secret = self.decrypt_stored_secret(user, client).await?;

        if !self.totp.verify_code(&secret, code) {
            self.audit_login_failed(
                AuditActor::from_user(user),
                client,
                json!({ "stage": "totp" }),
            )
            .await;
            return Err(invalid_credentials());
        }

        Ok(())
    }

    /// ログイン時のバックアップコード消費
    ///
    /// 一致したコードは compare-and-set で即座にリストから削除する。
    /// 同じコードを同時に使う2リクエストのうち成功できるのは最大1つ。
    async fn consume_backup_code_login(
        &self,
        user: &User,
        candidate: &str,
        client: &ClientInfo,
    ) -> Result<(), AppError> {
        let Some(hashes) = user.backup_codes.clone() else {
            return self.integrity_failure(user, client, "backup codes missing").await;
        };

        let scan_hashes = hashes.clone();
        let candidate_owned = candidate.to_string();
        let index = tokio::task::spawn_blocking(move || {
            backup_codes::consume_code(&scan_hashes, &candidate_owned)
        })
        .await
        .map_err(|e| AppError::Internal(anyhow::anyhow!("hash task join error: {e}")))?;

        let Some(index) = index else {
            self.audit_login_failed(
                AuditActor::from_user(user),
                client,
                json!({ "stage": "backup_code" }),
            )
            .await;
            return Err(invalid_credentials());
        };

        let removed = self.users.remove_backup_code(user.id, &hashes, index).await?;
        if !removed {
            // CAS失敗 = 同一コードの同時使用に負けた
            self.audit_login_failed(
                AuditActor::from_user(user),
                client,
                json!({ "stage": "backup_code_conflict" }),
            )
            .await;
            return Err(invalid_credentials());
        }

        self.audit
            .record(
                NewAuditEntry::new(
                    AuditActor::from_user(user),
                    AuditAction::BackupCodeUsed,
                    AuditSeverity::Warning,
                )
                .resource("user", Some(user.id.to_string()))
                .details(json!({ "remaining": hashes.len() - 1 }))
                .client(client),
            )
            .await;

        Ok(())
    }

    /// 保存済みシークレットの復号。失敗はフェイルクローズド
    async fn decrypt_stored_secret(
        &self,
        user: &User,
        client: &ClientInfo,
    ) -> Result<String, AppError> {
        let Some(encrypted) = user.two_factor_secret.clone() else {
            return self.integrity_failure(user, client, "secret missing").await;
        };

        let cipher = self.cipher.clone();
        let result = tokio::task::spawn_blocking(move || cipher.decrypt(&encrypted))
            .await
            .map_err(|e| AppError::Internal(anyhow::anyhow!("kdf task join error: {e}")))?;

        match result {
            Ok(secret) => Ok(secret),
            Err(AppError::Integrity(e)) => {
                // 改ざん・破損の疑い。偽の「有効」判定に倒してはならない
                self.audit
                    .record(
                        NewAuditEntry::new(
                            AuditActor::from_user(user),
                            AuditAction::LoginFailed,
                            AuditSeverity::Critical,
                        )
                        .resource("user", Some(user.id.to_string()))
                        .details(json!({ "stage": "secret_integrity" }))
                        .client(client),
                    )
                    .await;
                Err(AppError::Integrity(e))
            }
            Err(e) => Err(e),
        }
    }

    /// 不変条件違反（enabled なのに必須フィールドがない）を critical で記録
    async fn integrity_failure<T>(
        &self,
        user: &User,
        client: &ClientInfo,
        detail: &str,
    ) -> Result<T, AppError> {
        self.audit
            .record(
                NewAuditEntry::new(
                    AuditActor::from_user(user),
                    AuditAction::LoginFailed,
                    AuditSeverity::Critical,
                )
                .resource("user", Some(user.id.to_string()))
                .details(json!({ "stage": "invariant", "detail": detail }))
                .client(client),
            )
            .await;
        Err(AppError::Integrity(anyhow::anyhow!(
            "credential invariant violated: {detail}"
        )))
    }

    /// ユーザー不在・パスワード未設定でもダミー照合を実行し応答時間を揃える
    async fn equalize_timing(&self, password: &str) {
        let password = password.to_string();
        let _ = tokio::task::spawn_blocking(move || verify_password(&password, DUMMY_HASH)).await;
    }

    async fn audit_login_failed(
        &self,
        actor: AuditActor,
        client: &ClientInfo,
        details: serde_json::Value,
    ) {
        let resource_id = actor.user_id.map(|id| id.to_string());
        self.audit
            .record(
                NewAuditEntry::new(actor, AuditAction::LoginFailed, AuditSeverity::Warning)
                    .resource("user", resource_id)
                    .details(details)
                    .client(client),
            )
            .await;
    }
}
