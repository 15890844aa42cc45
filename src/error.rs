use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("認証エラー: {0}")]
    Authentication(String),

    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("レート制限超過")]
    RateLimited { retry_after_secs: i64 },

    #[error("データベースエラー")]
    Database(#[from] sqlx::Error),

    #[error("内部エラー")]
    Internal(#[from] anyhow::Error),

    /// 保存済みシークレットの復号・タグ検証失敗（改ざんまたは破損）
    #[error("完全性エラー")]
    Integrity(anyhow::Error),

    #[error("認証コードが無効です")]
    TotpInvalid,

    #[error("二要素認証は既に有効です")]
    TotpAlreadyEnabled,

    #[error("二要素認証が有効化されていません")]
    TotpNotEnabled,
}

#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    retry_after_secs: Option<i64>,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message, retry_after) = match &self {
            // 不在ユーザー・パスワード不一致・2FAコード不一致は同一メッセージ
            // （アカウント存在有無の漏洩防止）
            Self::Authentication(_) => (
                StatusCode::UNAUTHORIZED,
                "メールアドレスまたはパスワードが正しくありません".to_string(),
                None,
            ),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg.clone(), None),
            Self::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                "試行回数が上限を超えました。しばらく待ってから再試行してください".to_string(),
                Some(*retry_after_secs),
            ),
            Self::Database(e) => {
                tracing::error!(error = ?e, "データベースエラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                    None,
                )
            }
            Self::Internal(e) => {
                tracing::error!(error = ?e, "内部エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "内部エラーが発生しました".to_string(),
                    None,
                )
            }
            Self::Integrity(e) => {
                // フェイルクローズド: 改ざん・破損の疑いがあるため2FAを通さない
                tracing::error!(error = ?e, "保存データの完全性エラー");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "二要素認証の設定に問題があります。サポートへお問い合わせください".to_string(),
                    None,
                )
            }
            Self::TotpInvalid => (
                StatusCode::UNAUTHORIZED,
                "認証コードが正しくありません".to_string(),
                None,
            ),
            Self::TotpAlreadyEnabled => {
                (StatusCode::CONFLICT, "二要素認証は既に有効です".to_string(), None)
            }
            Self::TotpNotEnabled => (
                StatusCode::BAD_REQUEST,
                "二要素認証が有効化されていません".to_string(),
                None,
            ),
        };

        let body = Json(ErrorResponse {
            error: message,
            retry_after_secs: retry_after,
        });

        match retry_after {
            Some(secs) => {
                (status, [(header::RETRY_AFTER, secs.to_string())], body).into_response()
            }
            None => (status, body).into_response(),
        }
    }
}
