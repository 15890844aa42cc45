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
use crate::services::auth::{LoginAttempt, LoginOutcome, REASON_SECOND_FACTOR_REQUIRED};
use crate::state::AppState;

/// ログインリクエスト
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// ユーザーのメールアドレス
    pub email: String,
    /// ユーザーのパスワード
    pub password: String,
    /// 認証アプリの6桁コード（2FA有効ユーザーのみ）
    pub totp_code: Option<String>,
    /// バックアップコード（認証アプリが使えないときの代替）
    pub backup_code: Option<String>,
}

/// ログインレスポンス
///
/// セッション発行は呼び出し側（CRUD層）の責務。
#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub allow: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<&'static str>,
    /// 許可時のみ返却
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

/// ログインハンドラー
///
/// POST /api/login
///
/// 処理フロー:
/// 1. リクエストバリデーション
/// 2. 認証判定（レート制限 → パスワード → 第二要素、監査記録込み）
/// 3. 結果の返却
pub async fn login(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    Json(request): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, AppError> {
    validate_login_request(&request)?;

    let client = client_info(&headers, peer);
    let attempt = LoginAttempt {
        email: request.email,
        password: request.password,
        totp_code: request.totp_code,
        backup_code: request.backup_code,
    };

    match state.auth_service.authenticate(attempt, client).await? {
        LoginOutcome::Allowed(user) => Ok(Json(LoginResponse {
            allow: true,
            reason: None,
            user_id: Some(user.id),
        })),
        LoginOutcome::SecondFactorRequired => Ok(Json(LoginResponse {
            allow: false,
            reason: Some(REASON_SECOND_FACTOR_REQUIRED),
            user_id: None,
        })),
    }
}

/// ログインリクエストのバリデーション
fn validate_login_request(request: &LoginRequest) -> Result<(), AppError> {
    // email: 必須、メール形式
    if request.email.trim().is_empty() {
        return Err(AppError::Validation("メールアドレスは必須です".to_string()));
    }

    // 簡易的なメール形式チェック（@ が含まれているか）
    if !request.email.contains('@') {
        return Err(AppError::Validation(
            "有効なメールアドレスを入力してください".to_string(),
        ));
    }

    // password: 必須
    if request.password.is_empty() {
        return Err(AppError::Validation("パスワードは必須です".to_string()));
    }

    // 第二要素は同時に1種類だけ
    if request.totp_code.is_some() && request.backup_code.is_some() {
        return Err(AppError::Validation(
            "認証コードとバックアップコードは同時に指定できません".to_string(),
        ));
    }

    if let Some(code) = &request.totp_code {
        validate_totp_code(code)?;
    }

    Ok(())
}

/// TOTPコードバリデーション
fn validate_totp_code(code: &str) -> Result<(), AppError> {
    if code.len() != 6 || !code.chars().all(|c| c.is_ascii_digit()) {
        return Err(AppError::Validation(
            "認証コードは6桁の数字で入力してください".to_string(),
        ));
    }
    Ok(())
}
