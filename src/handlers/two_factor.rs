use std::net::SocketAddr;

use axum::{
    Json,
    extract::{ConnectInfo, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::AppError;
use crate::handlers::client_info;
use crate::state::AppState;

// === 2FA Setup ===

#[derive(Debug, Deserialize)]
pub struct SetupRequest {
    pub user_id: Uuid,
}

#[derive(Debug, Serialize)]
pub struct SetupResponse {
    pub secret: String,
    pub otpauth_url: String,
    pub qr_code: String,
    pub backup_codes: Vec<String>,
}

/// POST /api/2fa/setup
///
/// 2FA登録を開始（シークレット・QRコード・バックアップコードの発行）
///
/// # Security
/// - この時点ではDBに何も保存しない（verify 成功時に初めて永続化）
/// - シークレット・バックアップコード平文はログ出力禁止
pub async fn setup_2fa(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<SetupRequest>,
) -> Result<Json<SetupResponse>, AppError> {
    let client = client_info(&headers, peer);

    let material = state
        .auth_service
        .setup_second_factor(request.user_id, client)
        .await?;

    tracing::info!(user_id = %request.user_id, "2FA設定開始");

    Ok(Json(SetupResponse {
        secret: material.secret,
        otpauth_url: material.otpauth_url,
        qr_code: format!("data:image/png;base64,{}", material.qr_code),
        backup_codes: material.backup_codes,
    }))
}

// === 2FA Verify ===

#[derive(Debug, Deserialize)]
pub struct VerifyRequest {
    pub user_id: Uuid,
    /// setup で発行されたシークレット
    pub secret: String,
    /// 認証アプリが生成したライブコード
    pub code: String,
    /// setup で発行されたバックアップコード一式
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub enabled: bool,
}

/// POST /api/2fa/verify
///
/// 2FA登録の確定。クライアントがコードを生成できることを証明したときのみ
/// シークレットを暗号化保存し有効化する
///
/// # Security
/// - コード・シークレットはログ出力禁止
pub async fn verify_2fa(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<VerifyRequest>,
) -> Result<Json<VerifyResponse>, AppError> {
    validate_totp_code(&request.code)?;
    if request.secret.trim().is_empty() {
        return Err(AppError::Validation("シークレットは必須です".to_string()));
    }

    let client = client_info(&headers, peer);

    state
        .auth_service
        .confirm_second_factor(
            request.user_id,
            &request.secret,
            &request.code,
            &request.backup_codes,
            client,
        )
        .await?;

    tracing::info!(user_id = %request.user_id, "2FA有効化完了");

    Ok(Json(VerifyResponse { enabled: true }))
}

// === 2FA Disable ===

#[derive(Debug, Deserialize)]
pub struct DisableRequest {
    pub user_id: Uuid,
    /// 現在のパスワード（アクティブなセッションだけでは無効化できない）
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct DisableResponse {
    pub disabled: bool,
}

/// POST /api/2fa/disable
///
/// 2FA無効化
///
/// # Security
/// - パスワード確認必須
pub async fn disable_2fa(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<DisableRequest>,
) -> Result<Json<DisableResponse>, AppError> {
    validate_password(&request.password)?;

    let client = client_info(&headers, peer);

    state
        .auth_service
        .disable_second_factor(request.user_id, &request.password, client)
        .await?;

    tracing::info!(user_id = %request.user_id, "2FA無効化完了");

    Ok(Json(DisableResponse { disabled: true }))
}

// === Helper Functions ===

/// パスワードバリデーション
fn validate_password(password: &str) -> Result<(), AppError> {
    if password.is_empty() {
        return Err(AppError::Validation("パスワードは必須です".to_string()));
    }
    Ok(())
}

/// TOTPコードバリデーション
fn validate_totp_code(code: &str) -> Result<(), AppError> {
    if code.is_empty() {
        return Err(AppError::Validation("認証コードは必須です".to_string()));
    }
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "認証コードは6桁の数字で入力してください".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_empty_password() {
        assert!(validate_password("").is_err());
    }

    #[test]
    fn test_validate_valid_password() {
        assert!(validate_password("password123").is_ok());
    }

    #[test]
    fn test_validate_empty_code() {
        assert!(validate_totp_code("").is_err());
    }

    #[test]
    fn test_validate_short_code() {
        assert!(validate_totp_code("12345").is_err());
    }

    #[test]
    fn test_validate_non_digit_code() {
        assert!(validate_totp_code("12345a").is_err());
    }

    #[test]
    fn test_validate_valid_code() {
        assert!(validate_totp_code("123456").is_ok());
    }
}
