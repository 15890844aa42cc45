use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use time::{Duration, OffsetDateTime};

/// レート制限ポリシー（固定ウィンドウ + ロックアウト）
#[derive(Debug, Clone, Copy)]
pub struct RatePolicy {
    pub max_attempts: u32,
    pub window: Duration,
    pub block: Duration,
}

/// ポリシーのプリセット。仕組みはポリシー非依存で、ここは設定にすぎない。
pub mod presets {
    use super::RatePolicy;
    use time::Duration;

    /// ログイン: 15分間に5回まで、超過で15分ロック
    pub const LOGIN: RatePolicy = RatePolicy {
        max_attempts: 5,
        window: Duration::minutes(15),
        block: Duration::minutes(15),
    };

    /// 汎用API: 1分間に100回
    pub const API: RatePolicy = RatePolicy {
        max_attempts: 100,
        window: Duration::minutes(1),
        block: Duration::minutes(1),
    };

    /// 一括エクスポート: 1時間に10回
    pub const BULK_EXPORT: RatePolicy = RatePolicy {
        max_attempts: 10,
        window: Duration::hours(1),
        block: Duration::hours(1),
    };

    /// パスワードリセット: 1時間に3回
    pub const PASSWORD_RESET: RatePolicy = RatePolicy {
        max_attempts: 3,
        window: Duration::hours(1),
        block: Duration::hours(1),
    };

    /// 2FA設定開始: 1時間に10回
    pub const TWO_FACTOR_SETUP: RatePolicy = RatePolicy {
        max_attempts: 10,
        window: Duration::hours(1),
        block: Duration::hours(1),
    };

    /// 2FAコード検証: 15分間に5回
    pub const TWO_FACTOR_VERIFY: RatePolicy = RatePolicy {
        max_attempts: 5,
        window: Duration::minutes(15),
        block: Duration::minutes(15),
    };
}

/// check の判定結果
#[derive(Debug, Clone)]
pub struct RateLimitVerdict {
    pub allowed: bool,
    pub remaining: u32,
    pub reset_at: OffsetDateTime,
    pub blocked_until: Option<OffsetDateTime>,
}

#[derive(Debug)]
struct RateRecord {
    count: u32,
    reset_at: OffsetDateTime,
    blocked_until: Option<OffsetDateTime>,
}

/// 任意の文字列キー（IP・メール・ユーザーID+操作など）ごとの試行回数カウンター
///
/// プロセスローカルな状態であり、再起動で空に戻る（仕様上許容された制限）。
/// グローバル変数ではなく合成ルートが所有し、ハンドラーへ参照で渡す。
/// キーごとのインクリメントはロック越しに行われ、read-modify-write の競合で
/// 2リクエストが同時に上限をすり抜けることはない。
#[derive(Debug, Default)]
pub struct RateLimiter {
    records: Mutex<HashMap<String, RateRecord>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// 現在時刻で試行を記録し、許可可否を返す
    pub fn check(&self, key: &str, policy: &RatePolicy) -> RateLimitVerdict {
        self.check_at(key, policy, OffsetDateTime::now_utc())
    }

    /// 指定時刻で試行を記録（テストで時刻を決定的に進めるため分離）
    ///
    /// 1. ロックアウト中は何もインクリメントせず即拒否
    /// 2. レコードなし・ウィンドウ期限切れなら count=1 で新規ウィンドウ開始
    /// 3. それ以外はウィンドウ内でインクリメント
    /// 4. 上限超過で `blocked_until` を設定して拒否
    pub fn check_at(&self, key: &str, policy: &RatePolicy, now: OffsetDateTime) -> RateLimitVerdict {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let record = records.entry(key.to_string()).or_insert_with(|| RateRecord {
            count: 0,
            reset_at: now + policy.window,
            blocked_until: None,
        });

        if let Some(until) = record.blocked_until
            && until > now
        {
            return RateLimitVerdict {
                allowed: false,
                remaining: 0,
                reset_at: record.reset_at,
                blocked_until: Some(until),
            };
        }

        if record.count == 0 || record.reset_at <= now {
            // 新規ウィンドウ
            record.count = 1;
            record.reset_at = now + policy.window;
            record.blocked_until = None;
        } else {
            record.count += 1;
        }

        if record.count > policy.max_attempts {
            let until = now + policy.block;
            record.blocked_until = Some(until);
            return RateLimitVerdict {
                allowed: false,
                remaining: 0,
                reset_at: record.reset_at,
                blocked_until: Some(until),
            };
        }

        RateLimitVerdict {
            allowed: true,
            remaining: policy.max_attempts - record.count,
            reset_at: record.reset_at,
            blocked_until: None,
        }
    }

    /// キーの状態を無条件でクリア（認証成功時に過去の失敗を赦す）
    pub fn reset(&self, key: &str) {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        records.remove(key);
    }

    /// ウィンドウとロックアウトの両方が切れたキーを回収
    ///
    /// メモリ量を抑えるための掃除であり、実行されなくても判定の正しさには
    /// 影響しない。main が明示的に起動する周期タスクから呼ばれる。
    pub fn sweep(&self) -> usize {
        self.sweep_at(OffsetDateTime::now_utc())
    }

    pub fn sweep_at(&self, now: OffsetDateTime) -> usize {
        let mut records = self
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        let before = records.len();
        records.retain(|_, record| {
            record.reset_at > now || record.blocked_until.is_some_and(|until| until > now)
        });
        before - records.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> RatePolicy {
        RatePolicy {
            max_attempts: 5,
            window: Duration::minutes(15),
            block: Duration::minutes(15),
        }
    }

    #[test]
    fn test_countdown_then_lockout() {
        let limiter = RateLimiter::new();
        let policy = policy();
        let now = OffsetDateTime::now_utc();

        // 5回までは許可、remaining は 4,3,2,1,0 と単調減少
        for expected in [4u32, 3, 2, 1, 0] {
            let verdict = limiter.check_at("user@example.com", &policy, now);
            assert!(verdict.allowed);
            assert_eq!(verdict.remaining, expected);
        }

        // 6回目は拒否、blocked_until は未来
        let verdict = limiter.check_at("user@example.com", &policy, now);
        assert!(!verdict.allowed);
        assert_eq!(verdict.remaining, 0);
        assert!(verdict.blocked_until.unwrap() > now);
    }

    #[test]
    fn test_lockout_denies_without_increment() {
        let limiter = RateLimiter::new();
        let policy = policy();
        let now = OffsetDateTime::now_utc();

        for _ in 0..6 {
            limiter.check_at("key", &policy, now);
        }

        // ロック中の再試行は拒否されたまま、blocked_until は変わらない
        let first = limiter.check_at("key", &policy, now + Duration::minutes(1));
        let second = limiter.check_at("key", &policy, now + Duration::minutes(2));
        assert!(!first.allowed);
        assert!(!second.allowed);
        assert_eq!(first.blocked_until, second.blocked_until);
    }

    #[test]
    fn test_window_expiry_starts_fresh() {
        let limiter = RateLimiter::new();
        let policy = policy();
        let now = OffsetDateTime::now_utc();

        for _ in 0..5 {
            limiter.check_at("key", &policy, now);
        }

        // ウィンドウ経過後は新規ウィンドウとして count=1 から
        let later = now + Duration::minutes(16);
        let verdict = limiter.check_at("key", &policy, later);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 4);
        assert_eq!(verdict.reset_at, later + policy.window);
    }

    #[test]
    fn test_reset_clears_state() {
        let limiter = RateLimiter::new();
        let policy = policy();
        let now = OffsetDateTime::now_utc();

        for _ in 0..6 {
            limiter.check_at("key", &policy, now);
        }
        limiter.reset("key");

        let verdict = limiter.check_at("key", &policy, now);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 4);
    }

    #[test]
    fn test_keys_are_independent() {
        let limiter = RateLimiter::new();
        let policy = policy();
        let now = OffsetDateTime::now_utc();

        for _ in 0..6 {
            limiter.check_at("a", &policy, now);
        }

        let verdict = limiter.check_at("b", &policy, now);
        assert!(verdict.allowed);
        assert_eq!(verdict.remaining, 4);
    }

    #[test]
    fn test_sweep_evicts_only_fully_expired() {
        let limiter = RateLimiter::new();
        let policy = policy();
        let now = OffsetDateTime::now_utc();

        limiter.check_at("expired", &policy, now);
        for _ in 0..6 {
            limiter.check_at("locked", &policy, now + Duration::minutes(10));
        }

        // "expired" はウィンドウ切れ、"locked" はロックアウトがまだ生きている
        let evicted = limiter.sweep_at(now + Duration::minutes(16));
        assert_eq!(evicted, 1);

        // 掃除後もロック中キーの拒否は維持される
        let verdict = limiter.check_at("locked", &policy, now + Duration::minutes(16));
        assert!(!verdict.allowed);
    }

    #[test]
    fn test_correctness_without_sweep() {
        // 掃除が一度も走らなくても判定は正しい
        let limiter = RateLimiter::new();
        let policy = policy();
        let now = OffsetDateTime::now_utc();

        for _ in 0..5 {
            limiter.check_at("key", &policy, now);
        }
        assert!(!limiter.check_at("key", &policy, now).allowed);
        assert!(
            limiter
                .check_at("key", &policy, now + Duration::minutes(31))
                .allowed
        );
    }
}
