use async_trait::async_trait;
use sqlx::{PgPool, QueryBuilder};
use time::OffsetDateTime;

use crate::models::{AuditEntry, AuditFilter, NewAuditEntry};

/// 監査ログストアの抽象
///
/// 追記と検索のみ。UPDATE / DELETE は存在しない（追記専用）。
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append(&self, entry: NewAuditEntry) -> Result<(), sqlx::Error>;

    /// フィルター検索（新しい順、offset/limit ページング）
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, sqlx::Error>;

    /// 指定時刻以降の全エントリ（異常検知の集計用）
    async fn entries_since(&self, cutoff: OffsetDateTime) -> Result<Vec<AuditEntry>, sqlx::Error>;
}

#[derive(Clone)]
pub struct AuditLogRepository {
    pool: PgPool,
}

impl AuditLogRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AuditStore for AuditLogRepository {
    async fn append(&self, entry: NewAuditEntry) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            INSERT INTO audit_logs
                (actor_id, actor_email, actor_name, actor_role, action,
                 resource_type, resource_id, details, ip_address, user_agent, severity)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            "#,
        )
        .bind(entry.actor.user_id)
        .bind(&entry.actor.email)
        .bind(&entry.actor.name)
        .bind(&entry.actor.role)
        .bind(entry.action.as_str())
        .bind(&entry.resource_type)
        .bind(&entry.resource_id)
        .bind(&entry.details)
        .bind(&entry.ip_address)
        .bind(&entry.user_agent)
        .bind(entry.severity.as_str())
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, sqlx::Error> {
        let mut builder = QueryBuilder::new(
            "SELECT id, created_at, actor_id, actor_email, actor_name, actor_role, \
             action, resource_type, resource_id, details, ip_address, user_agent, severity \
             FROM audit_logs WHERE 1=1",
        );

        if let Some(actor_email) = &filter.actor_email {
            builder.push(" AND actor_email = ").push_bind(actor_email);
        }
        if let Some(action) = filter.action {
            builder.push(" AND action = ").push_bind(action.as_str());
        }
        if let Some(resource_type) = &filter.resource_type {
            builder.push(" AND resource_type = ").push_bind(resource_type);
        }
        if let Some(resource_id) = &filter.resource_id {
            builder.push(" AND resource_id = ").push_bind(resource_id);
        }
        if let Some(severity) = filter.severity {
            builder.push(" AND severity = ").push_bind(severity.as_str());
        }
        if let Some(from) = filter.from {
            builder.push(" AND created_at >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND created_at <= ").push_bind(to);
        }

        builder.push(" ORDER BY created_at DESC");
        builder.push(" LIMIT ").push_bind(filter.limit);
        builder.push(" OFFSET ").push_bind(filter.offset);

        builder
            .build_query_as::<AuditEntry>()
            .fetch_all(&self.pool)
            .await
    }

    async fn entries_since(&self, cutoff: OffsetDateTime) -> Result<Vec<AuditEntry>, sqlx::Error> {
        sqlx::query_as::<_, AuditEntry>(
            r#"
            SELECT id, created_at, actor_id, actor_email, actor_name, actor_role,
                   action, resource_type, resource_id, details, ip_address, user_agent, severity
            FROM audit_logs
            WHERE created_at >= $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
    }
}
