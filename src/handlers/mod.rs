pub mod audit;
pub mod health;
pub mod login;
pub mod two_factor;

pub use audit::{query_audit_logs, suspicious_activity};
pub use health::health_check;
pub use login::login;
pub use two_factor::{disable_2fa, setup_2fa, verify_2fa};

use std::net::SocketAddr;

use axum::http::HeaderMap;

use crate::models::ClientInfo;

/// ヘッダーと接続元からクライアント情報を抽出
///
/// IPは `x-forwarded-for` の先頭ホップを優先し、ヘッダーがなければ
/// TCP接続のピアアドレスを使う（直接アクセスでもクライアントごとに
/// レート制限・監査キーが分かれる）。
/// 監査ログへはこの値を引数として明示的に渡す
/// （リクエストコンテキストからの暗黙取得はしない）。
pub fn client_info(headers: &HeaderMap, peer: SocketAddr) -> ClientInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        // プロキシ経由では先頭が元クライアント
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty());

    let ip_address = Some(forwarded.unwrap_or_else(|| peer.ip().to_string()));

    let user_agent = headers
        .get(axum::http::header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .map(|v| v.to_string());

    ClientInfo {
        ip_address,
        user_agent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn peer() -> SocketAddr {
        "192.0.2.50:54321".parse().unwrap()
    }

    #[test]
    fn test_client_info_prefers_forwarded_first_hop() {
        let mut headers = HeaderMap::new();
        headers.insert(
            "x-forwarded-for",
            HeaderValue::from_static("203.0.113.7, 10.0.0.1"),
        );
        headers.insert(
            axum::http::header::USER_AGENT,
            HeaderValue::from_static("TestAgent/1.0"),
        );

        let client = client_info(&headers, peer());
        assert_eq!(client.ip_address.as_deref(), Some("203.0.113.7"));
        assert_eq!(client.user_agent.as_deref(), Some("TestAgent/1.0"));
    }

    #[test]
    fn test_client_info_falls_back_to_peer_address() {
        // プロキシなしの直接アクセスでもピアIPで具体的なキーになる
        let client = client_info(&HeaderMap::new(), peer());
        assert_eq!(client.ip_address.as_deref(), Some("192.0.2.50"));
        assert!(client.user_agent.is_none());
    }

    #[test]
    fn test_client_info_empty_forwarded_header_uses_peer() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("  "));

        let client = client_info(&headers, peer());
        assert_eq!(client.ip_address.as_deref(), Some("192.0.2.50"));
    }
}
