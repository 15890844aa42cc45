use axum::{
    Json,
    extract::{Query, State},
};
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::models::{AuditEntry, AuditFilter, SuspiciousActivity};
use crate::state::AppState;

/// 検索ウィンドウの最大値（時間）。広すぎる集計で DB を殴らないための上限
const MAX_WINDOW_HOURS: i64 = 24 * 31;

#[derive(Debug, Serialize)]
pub struct AuditLogResponse {
    pub entries: Vec<AuditEntry>,
    pub offset: i64,
    pub limit: i64,
}

/// 監査ログ検索ハンドラー
///
/// GET /api/audit/logs
///
/// クエリパラメーターでフィルター指定（actor_email / action / severity /
/// from / to など）。常に新しい順、offset/limit ページング。
pub async fn query_audit_logs(
    State(state): State<AppState>,
    Query(filter): Query<AuditFilter>,
) -> Result<Json<AuditLogResponse>, AppError> {
    validate_filter(&filter)?;

    let entries = state.audit.query(&filter).await?;

    Ok(Json(AuditLogResponse {
        entries,
        offset: filter.offset,
        limit: filter.limit,
    }))
}

#[derive(Debug, Deserialize)]
pub struct SuspiciousQuery {
    /// 集計ウィンドウ（時間）。省略時は直近24時間
    #[serde(default = "default_window_hours")]
    pub hours: i64,
}

fn default_window_hours() -> i64 {
    24
}

#[derive(Debug, Serialize)]
pub struct SuspiciousResponse {
    pub window_hours: i64,
    pub groups: Vec<SuspiciousActivity>,
}

/// 異常検知レポートハンドラー
///
/// GET /api/audit/suspicious?hours=24
pub async fn suspicious_activity(
    State(state): State<AppState>,
    Query(query): Query<SuspiciousQuery>,
) -> Result<Json<SuspiciousResponse>, AppError> {
    if query.hours < 1 || query.hours > MAX_WINDOW_HOURS {
        return Err(AppError::Validation(format!(
            "hours は 1〜{MAX_WINDOW_HOURS} の範囲で指定してください"
        )));
    }

    let groups = state.audit.suspicious_activity(query.hours).await?;

    Ok(Json(SuspiciousResponse {
        window_hours: query.hours,
        groups,
    }))
}

/// 検索フィルターのバリデーション
fn validate_filter(filter: &AuditFilter) -> Result<(), AppError> {
    if filter.offset < 0 {
        return Err(AppError::Validation(
            "offset は 0 以上で指定してください".to_string(),
        ));
    }
    if filter.limit < 1 || filter.limit > 500 {
        return Err(AppError::Validation(
            "limit は 1〜500 の範囲で指定してください".to_string(),
        ));
    }
    if let Some(from) = filter.from
        && let Some(to) = filter.to
        && from > to
    {
        return Err(AppError::Validation(
            "from は to より前の時刻を指定してください".to_string(),
        ));
    }
    Ok(())
}
