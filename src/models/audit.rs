use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// 監査ログの重要度
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditSeverity {
    Info,
    Warning,
    Critical,
}

impl AuditSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Info => "info",
            Self::Warning => "warning",
            Self::Critical => "critical",
        }
    }
}

impl std::fmt::Display for AuditSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 監査対象アクション（閉じた列挙）
///
/// serde 表現は `as_str` と同一のタグ（検索フィルターに保存済みタグを
/// そのまま指定できるよう、外部表記は1種類に揃える）。
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    #[serde(rename = "login_success")]
    LoginSuccess,
    #[serde(rename = "login_failed")]
    LoginFailed,
    #[serde(rename = "2fa_setup_initiated")]
    TwoFactorSetupInitiated,
    #[serde(rename = "2fa_enabled")]
    TwoFactorEnabled,
    #[serde(rename = "2fa_verify_failed")]
    TwoFactorVerifyFailed,
    #[serde(rename = "2fa_disabled")]
    TwoFactorDisabled,
    #[serde(rename = "2fa_disable_failed")]
    TwoFactorDisableFailed,
    #[serde(rename = "2fa_backup_used")]
    BackupCodeUsed,
    // CRUD層から報告される一括操作（異常検知の監視対象）
    #[serde(rename = "bulk_delete")]
    BulkDelete,
    #[serde(rename = "bulk_export")]
    BulkExport,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LoginSuccess => "login_success",
            Self::LoginFailed => "login_failed",
            Self::TwoFactorSetupInitiated => "2fa_setup_initiated",
            Self::TwoFactorEnabled => "2fa_enabled",
            Self::TwoFactorVerifyFailed => "2fa_verify_failed",
            Self::TwoFactorDisabled => "2fa_disabled",
            Self::TwoFactorDisableFailed => "2fa_disable_failed",
            Self::BackupCodeUsed => "2fa_backup_used",
            Self::BulkDelete => "bulk_delete",
            Self::BulkExport => "bulk_export",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 監査ログの行為者
///
/// 未認証コンテキストでは `system()` のセンチネルを明示的に渡す
/// （アンビエントなセッション状態からの暗黙取得はしない）。
#[derive(Debug, Clone, Serialize)]
pub struct AuditActor {
    pub user_id: Option<Uuid>,
    pub email: String,
    pub name: String,
    pub role: String,
}

impl AuditActor {
    pub fn system() -> Self {
        Self {
            user_id: None,
            email: "system".to_string(),
            name: "system".to_string(),
            role: "system".to_string(),
        }
    }

    pub fn from_user(user: &crate::models::User) -> Self {
        Self {
            user_id: Some(user.id),
            email: user.email.clone(),
            name: user.name.clone(),
            role: user.role.clone(),
        }
    }
}

/// リクエスト元のクライアント情報
///
/// ハンドラーがヘッダーから抽出し、監査呼び出しまで明示的に引き回す。
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// 追記前の監査エントリ
#[derive(Debug, Clone)]
pub struct NewAuditEntry {
    pub actor: AuditActor,
    pub action: AuditAction,
    pub severity: AuditSeverity,
    pub resource_type: String,
    pub resource_id: Option<String>,
    /// 任意形状のメタデータ（秘密情報は入れないこと）
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

impl NewAuditEntry {
    pub fn new(actor: AuditActor, action: AuditAction, severity: AuditSeverity) -> Self {
        Self {
            actor,
            action,
            severity,
            resource_type: "auth".to_string(),
            resource_id: None,
            details: serde_json::Value::Null,
            ip_address: None,
            user_agent: None,
        }
    }

    pub fn resource(mut self, resource_type: &str, resource_id: Option<String>) -> Self {
        self.resource_type = resource_type.to_string();
        self.resource_id = resource_id;
        self
    }

    pub fn details(mut self, details: serde_json::Value) -> Self {
        self.details = details;
        self
    }

    pub fn client(mut self, client: &ClientInfo) -> Self {
        self.ip_address = client.ip_address.clone();
        self.user_agent = client.user_agent.clone();
        self
    }
}

/// 永続化済みの監査エントリ（追記後は不変）
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub created_at: OffsetDateTime,
    pub actor_id: Option<Uuid>,
    pub actor_email: String,
    pub actor_name: String,
    pub actor_role: String,
    pub action: String,
    pub resource_type: String,
    pub resource_id: Option<String>,
    pub details: serde_json::Value,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub severity: String,
}

/// 監査ログ検索フィルター
#[derive(Debug, Clone, Deserialize)]
pub struct AuditFilter {
    pub actor_email: Option<String>,
    pub action: Option<AuditAction>,
    pub resource_type: Option<String>,
    pub resource_id: Option<String>,
    pub severity: Option<AuditSeverity>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub from: Option<OffsetDateTime>,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub to: Option<OffsetDateTime>,
    #[serde(default)]
    pub offset: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
}

fn default_limit() -> i64 {
    50
}

impl Default for AuditFilter {
    fn default() -> Self {
        Self {
            actor_email: None,
            action: None,
            resource_type: None,
            resource_id: None,
            severity: None,
            from: None,
            to: None,
            offset: 0,
            limit: default_limit(),
        }
    }
}

/// 異常検知レポートの1グループ（actor × action）
#[derive(Debug, Clone, Serialize)]
pub struct SuspiciousActivity {
    pub actor: String,
    pub action: String,
    pub count: u64,
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_ACTIONS: [AuditAction; 10] = [
        AuditAction::LoginSuccess,
        AuditAction::LoginFailed,
        AuditAction::TwoFactorSetupInitiated,
        AuditAction::TwoFactorEnabled,
        AuditAction::TwoFactorVerifyFailed,
        AuditAction::TwoFactorDisabled,
        AuditAction::TwoFactorDisableFailed,
        AuditAction::BackupCodeUsed,
        AuditAction::BulkDelete,
        AuditAction::BulkExport,
    ];

    #[test]
    fn test_action_serde_tag_matches_stored_tag() {
        // レスポンスに出るタグをそのままフィルターに使えること
        for action in ALL_ACTIONS {
            let serialized = serde_json::to_value(action).unwrap();
            assert_eq!(serialized, serde_json::Value::String(action.as_str().to_string()));

            let parsed: AuditAction =
                serde_json::from_value(serde_json::json!(action.as_str())).unwrap();
            assert_eq!(parsed, action);
        }
    }

    #[test]
    fn test_severity_serde_tag_matches_stored_tag() {
        for severity in [
            AuditSeverity::Info,
            AuditSeverity::Warning,
            AuditSeverity::Critical,
        ] {
            let serialized = serde_json::to_value(severity).unwrap();
            assert_eq!(
                serialized,
                serde_json::Value::String(severity.as_str().to_string())
            );
        }
    }
}
