use async_trait::async_trait;
use sqlx::PgPool;
use uuid::Uuid;

use crate::models::User;

/// 認証情報ストアの抽象
///
/// 本番実装は Postgres（`UserRepository`）。合成ルートをDBなしで
/// テストするためのインメモリ実装はテストモジュール側にある。
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error>;

    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error>;

    /// 2FAを有効化: シークレット暗号文・バックアップコードハッシュ・フラグを
    /// 1ステートメントで書き込む（3カラム同時更新の不変条件を守る）
    async fn enable_two_factor(
        &self,
        user_id: Uuid,
        secret_encrypted: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), sqlx::Error>;

    /// 2FAを無効化: シークレット・コード・フラグを同時にクリア
    async fn disable_two_factor(&self, user_id: Uuid) -> Result<(), sqlx::Error>;

    /// 使用済みバックアップコードを1件削除（compare-and-set）
    ///
    /// 読み取り時のリストと現在のリストが一致する場合のみ書き込む。
    /// 同じコードを同時に使おうとした2リクエストのうち勝てるのは最大1つで、
    /// 負けた側には false が返る。
    async fn remove_backup_code(
        &self,
        user_id: Uuid,
        expected_hashes: &[String],
        index: usize,
    ) -> Result<bool, sqlx::Error>;
}

#[derive(Clone)]
pub struct UserRepository {
    pool: PgPool,
}

impl UserRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl CredentialStore for UserRepository {
    /// メールアドレスでユーザーを検索
    async fn find_by_email(&self, email: &str) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, name, role, password_hash, two_factor_enabled,
                   two_factor_secret, backup_codes, created_at, updated_at
            FROM users
            WHERE email = $1
            "#,
        )
        .bind(email)
        .fetch_optional(&self.pool)
        .await
    }

    /// ユーザーIDでユーザーを検索
    async fn find_by_id(&self, user_id: Uuid) -> Result<Option<User>, sqlx::Error> {
        sqlx::query_as::<_, User>(
            r#"
            SELECT id, email, name, role, password_hash, two_factor_enabled,
                   two_factor_secret, backup_codes, created_at, updated_at
            FROM users
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    async fn enable_two_factor(
        &self,
        user_id: Uuid,
        secret_encrypted: &str,
        backup_code_hashes: &[String],
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET two_factor_enabled = true,
                two_factor_secret = $2,
                backup_codes = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .bind(secret_encrypted)
        .bind(backup_code_hashes)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn disable_two_factor(&self, user_id: Uuid) -> Result<(), sqlx::Error> {
        sqlx::query(
            r#"
            UPDATE users
            SET two_factor_enabled = false,
                two_factor_secret = NULL,
                backup_codes = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn remove_backup_code(
        &self,
        user_id: Uuid,
        expected_hashes: &[String],
        index: usize,
    ) -> Result<bool, sqlx::Error> {
        if index >= expected_hashes.len() {
            return Ok(false);
        }

        let mut shortened = expected_hashes.to_vec();
        shortened.remove(index);

        // 読み取り時と同じ内容の場合のみ更新する compare-and-set
        let result = sqlx::query(
            r#"
            UPDATE users
            SET backup_codes = $3, updated_at = NOW()
            WHERE id = $1 AND backup_codes = $2
            "#,
        )
        .bind(user_id)
        .bind(expected_hashes)
        .bind(&shortened)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}
