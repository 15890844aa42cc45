use serde::Serialize;
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// アカウントごとの認証情報レコード
///
/// # Invariant
/// `two_factor_secret` と `backup_codes` は `two_factor_enabled = true` のときのみ
/// 値を持つ。有効化・無効化フローが3カラムを同一ステートメントで更新することで
/// この不変条件を保つ。シークレット平文は一切永続化しない。
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub name: String,
    pub role: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub two_factor_enabled: bool,
    /// AES-256-GCM 暗号文（base64ブロブ）
    #[serde(skip)]
    pub two_factor_secret: Option<String>,
    /// バックアップコードの argon2 ハッシュ（各コード独立ソルト）
    #[serde(skip)]
    pub backup_codes: Option<Vec<String>>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}
