use axum::Json;
use serde::Serialize;

/// 稼働状況レスポンス
#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub service: &'static str,
    pub status: &'static str,
    pub version: &'static str,
}

/// ヘルスチェックハンドラー
///
/// GET /api/health
///
/// ロードバランサー・監視ツール向け。認証もDBアクセスも行わない。
pub async fn health_check() -> Json<HealthStatus> {
    Json(HealthStatus {
        service: env!("CARGO_PKG_NAME"),
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}
