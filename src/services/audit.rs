use std::collections::HashMap;
use std::sync::Arc;

use time::{Duration, OffsetDateTime};

use crate::error::AppError;
use crate::models::{AuditEntry, AuditFilter, NewAuditEntry, SuspiciousActivity};
use crate::repositories::AuditStore;

/// 異常検知でカウント対象となる件数のしきい値（これを超えたら報告）
const SUSPICIOUS_THRESHOLD: u64 = 5;
/// 重要度に関わらず監視対象とするアクション
const WATCHED_ACTIONS: [&str; 3] = ["login_failed", "bulk_delete", "bulk_export"];

/// セキュリティ監査ログサービス
///
/// # Note
/// 記録はベストエフォート。書き込み失敗はローカルログに残して飲み込み、
/// 呼び出し元の本来の処理を決して失敗させない。
#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditStore>,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditStore>) -> Self {
        Self { store }
    }

    /// 監査エントリを追記（fire-and-forget）
    pub async fn record(&self, entry: NewAuditEntry) {
        let action = entry.action;
        if let Err(e) = self.store.append(entry).await {
            // 監査失敗でセキュリティ操作本体を巻き戻してはならない
            tracing::error!(error = ?e, action = %action, "監査ログの書き込みに失敗（処理は継続）");
        }
    }

    /// フィルター検索（新しい順、offset/limit ページング）
    pub async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AppError> {
        Ok(self.store.query(filter).await?)
    }

    /// 直近ウィンドウ内の不審なアクティビティを集計
    ///
    /// (actor, action) でグループ化し、監視対象アクションまたは critical の
    /// エントリが しきい値を超えたグループを件数降順・直近順で返す。
    /// 単純な頻度しきい値であり、統計モデルではない。
    pub async fn suspicious_activity(
        &self,
        window_hours: i64,
    ) -> Result<Vec<SuspiciousActivity>, AppError> {
        let cutoff = OffsetDateTime::now_utc() - Duration::hours(window_hours);
        let entries = self.store.entries_since(cutoff).await?;

        let mut groups: HashMap<(String, String), (u64, OffsetDateTime)> = HashMap::new();
        for entry in entries {
            let watched =
                WATCHED_ACTIONS.contains(&entry.action.as_str()) || entry.severity == "critical";
            if !watched {
                continue;
            }

            let key = (entry.actor_email.clone(), entry.action.clone());
            let group = groups.entry(key).or_insert((0, entry.created_at));
            group.0 += 1;
            if entry.created_at > group.1 {
                group.1 = entry.created_at;
            }
        }

        let mut report: Vec<SuspiciousActivity> = groups
            .into_iter()
            .filter(|(_, (count, _))| *count > SUSPICIOUS_THRESHOLD)
            .map(|((actor, action), (count, last_seen))| SuspiciousActivity {
                actor,
                action,
                count,
                last_seen,
            })
            .collect();

        report.sort_by(|a, b| {
            b.count
                .cmp(&a.count)
                .then_with(|| b.last_seen.cmp(&a.last_seen))
        });

        Ok(report)
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::{Mutex, PoisonError};

    use async_trait::async_trait;
    use time::OffsetDateTime;
    use uuid::Uuid;

    use crate::models::{AuditEntry, AuditFilter, NewAuditEntry};
    use crate::repositories::AuditStore;

    /// テスト用インメモリ監査ストア（挿入順を保持、検索は新しい順）
    #[derive(Default)]
    pub struct InMemoryAuditStore {
        entries: Mutex<Vec<AuditEntry>>,
    }

    impl InMemoryAuditStore {
        pub fn new() -> Self {
            Self::default()
        }

        /// タイムスタンプを指定して直接投入（時刻依存テスト用）
        pub fn push_at(&self, entry: NewAuditEntry, created_at: OffsetDateTime) {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            entries.push(materialize(entry, created_at));
        }

        pub fn len(&self) -> usize {
            self.entries
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .len()
        }
    }

    fn materialize(entry: NewAuditEntry, created_at: OffsetDateTime) -> AuditEntry {
        AuditEntry {
            id: Uuid::new_v4(),
            created_at,
            actor_id: entry.actor.user_id,
            actor_email: entry.actor.email,
            actor_name: entry.actor.name,
            actor_role: entry.actor.role,
            action: entry.action.as_str().to_string(),
            resource_type: entry.resource_type,
            resource_id: entry.resource_id,
            details: entry.details,
            ip_address: entry.ip_address,
            user_agent: entry.user_agent,
            severity: entry.severity.as_str().to_string(),
        }
    }

    fn matches(entry: &AuditEntry, filter: &AuditFilter) -> bool {
        if let Some(actor_email) = &filter.actor_email
            && &entry.actor_email != actor_email
        {
            return false;
        }
        if let Some(action) = filter.action
            && entry.action != action.as_str()
        {
            return false;
        }
        if let Some(resource_type) = &filter.resource_type
            && &entry.resource_type != resource_type
        {
            return false;
        }
        if let Some(resource_id) = &filter.resource_id
            && entry.resource_id.as_ref() != Some(resource_id)
        {
            return false;
        }
        if let Some(severity) = filter.severity
            && entry.severity != severity.as_str()
        {
            return false;
        }
        if let Some(from) = filter.from
            && entry.created_at < from
        {
            return false;
        }
        if let Some(to) = filter.to
            && entry.created_at > to
        {
            return false;
        }
        true
    }

    #[async_trait]
    impl AuditStore for InMemoryAuditStore {
        async fn append(&self, entry: NewAuditEntry) -> Result<(), sqlx::Error> {
            let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            let created_at = OffsetDateTime::now_utc();
            entries.push(materialize(entry, created_at));
            Ok(())
        }

        async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, sqlx::Error> {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            // 挿入順の逆 = 新しい順（同時刻でも安定）
            Ok(entries
                .iter()
                .rev()
                .filter(|e| matches(e, filter))
                .skip(filter.offset as usize)
                .take(filter.limit as usize)
                .cloned()
                .collect())
        }

        async fn entries_since(
            &self,
            cutoff: OffsetDateTime,
        ) -> Result<Vec<AuditEntry>, sqlx::Error> {
            let entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
            Ok(entries
                .iter()
                .rev()
                .filter(|e| e.created_at >= cutoff)
                .cloned()
                .collect())
        }
    }

    /// 常に書き込みに失敗するストア（ベストエフォート性の検証用）
    pub struct FailingAuditStore;

    #[async_trait]
    impl AuditStore for FailingAuditStore {
        async fn append(&self, _entry: NewAuditEntry) -> Result<(), sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }

        async fn query(&self, _filter: &AuditFilter) -> Result<Vec<AuditEntry>, sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }

        async fn entries_since(
            &self,
            _cutoff: OffsetDateTime,
        ) -> Result<Vec<AuditEntry>, sqlx::Error> {
            Err(sqlx::Error::PoolClosed)
        }
    }
}
