use data_encoding::BASE32;
use rand::RngCore;
use totp_rs::{Algorithm, TOTP};

use crate::error::AppError;

/// TOTPのステップ秒数
const PERIOD: u64 = 30;
/// 許容する時刻ずれ（前後ステップ数）
const SKEW: u8 = 1;
/// コード桁数
const DIGITS: usize = 6;

/// TOTP (Time-based One-Time Password) サービス
///
/// # Security
/// - シークレット平文はログに出力しない
/// - 検証は前後1ステップ（±30秒）を常に同じ組で照合する
#[derive(Clone)]
pub struct TotpService {
    issuer: String,
}

impl TotpService {
    /// 新しい TotpService を作成
    ///
    /// # Arguments
    /// * `issuer` - TOTP発行者名（アプリ名）
    pub fn new(issuer: String) -> Self {
        Self { issuer }
    }

    /// 20バイトのランダムシークレットを生成し、Base32でエンコード
    pub fn generate_secret() -> String {
        let mut bytes = [0u8; 20];
        rand::rngs::OsRng.fill_bytes(&mut bytes);
        BASE32.encode(&bytes)
    }

    /// otpauth:// 形式のプロビジョニングURIを生成
    ///
    /// 発行者・ラベル・アルゴリズム(SHA1)・桁数(6)・ステップ(30秒)を含む。
    pub fn provisioning_uri(&self, secret: &str, account_label: &str) -> Result<String, AppError> {
        let totp = self.create_totp(secret, account_label)?;
        Ok(totp.get_url())
    }

    /// QRコードを生成（PNG形式、Base64エンコード）
    ///
    /// 表示専用の成果物であり、セキュリティ上の契約はURI側にある。
    pub fn qr_code_base64(&self, secret: &str, account_label: &str) -> Result<String, AppError> {
        let totp = self.create_totp(secret, account_label)?;

        totp.get_qr_base64().map_err(|e| {
            tracing::error!(error = %e, "QRコード生成エラー");
            AppError::Internal(anyhow::anyhow!("qr code generation error"))
        })
    }

    /// TOTPコードを現在時刻で検証
    ///
    /// # Note
    /// 前後1ステップの時間ウィンドウを許容（±30秒）。
    /// 不正なシークレット・コード形式は false（呼び出し側へエラーは返さない）。
    pub fn verify_code(&self, secret: &str, code: &str) -> bool {
        let now = match std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH) {
            Ok(d) => d.as_secs(),
            Err(e) => {
                tracing::error!(error = ?e, "システム時刻取得エラー");
                return false;
            }
        };
        self.verify_code_at(secret, code, now)
    }

    /// TOTPコードを指定時刻で検証（テストで時刻を固定するため分離）
    pub fn verify_code_at(&self, secret: &str, code: &str, unix_time: u64) -> bool {
        // 入力検証: コードは6桁の数字のみ
        if code.len() != DIGITS || !code.chars().all(|c| c.is_ascii_digit()) {
            return false;
        }

        let Ok(secret_bytes) = BASE32.decode(secret.as_bytes()) else {
            tracing::warn!("Base32として不正なシークレット（検証失敗として扱う）");
            return false;
        };

        let Ok(totp) = TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            PERIOD,
            secret_bytes,
            None,
            String::new(),
        ) else {
            tracing::warn!("TOTP構築不能なシークレット（検証失敗として扱う）");
            return false;
        };

        // check は skew の3エポック分を常に照合する
        totp.check(code, unix_time)
    }

    /// TOTP オブジェクトを作成（URI・QRコード生成用）
    fn create_totp(&self, secret: &str, account_label: &str) -> Result<TOTP, AppError> {
        let secret_bytes = BASE32.decode(secret.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレットのBase32デコードエラー");
            AppError::Internal(anyhow::anyhow!("invalid base32 secret"))
        })?;

        TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            PERIOD,
            secret_bytes,
            Some(self.issuer.clone()),
            account_label.to_string(),
        )
        .map_err(|e| {
            tracing::error!(error = %e, "TOTP作成エラー");
            AppError::Internal(anyhow::anyhow!("totp creation error"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_service() -> TotpService {
        TotpService::new("TestApp".to_string())
    }

    /// 指定時刻の正しいコードを計算するテストヘルパー
    fn code_at(secret: &str, unix_time: u64) -> String {
        let secret_bytes = BASE32.decode(secret.as_bytes()).unwrap();
        let totp = TOTP::new(
            Algorithm::SHA1,
            DIGITS,
            SKEW,
            PERIOD,
            secret_bytes,
            None,
            String::new(),
        )
        .unwrap();
        totp.generate(unix_time)
    }

    #[test]
    fn test_generate_secret() {
        let secret = TotpService::generate_secret();
        // Base32エンコードされた20バイト = 32文字
        assert_eq!(secret.len(), 32);
        assert!(
            secret
                .chars()
                .all(|c| "ABCDEFGHIJKLMNOPQRSTUVWXYZ234567".contains(c))
        );
    }

    #[test]
    fn test_provisioning_uri_contains_parameters() {
        let service = create_test_service();
        let secret = TotpService::generate_secret();

        let uri = service
            .provisioning_uri(&secret, "user@example.com")
            .unwrap();
        assert!(uri.starts_with("otpauth://totp/"));
        assert!(uri.contains("TestApp"));
        assert!(uri.contains(&secret));
    }

    #[test]
    fn test_qr_code_base64() {
        let service = create_test_service();
        let secret = TotpService::generate_secret();

        let qr = service.qr_code_base64(&secret, "user@example.com").unwrap();
        assert!(!qr.is_empty());
    }

    #[test]
    fn test_clock_skew_tolerance_boundaries() {
        let service = create_test_service();
        let secret = TotpService::generate_secret();
        // ステップ境界に揃えた時刻（30の倍数）
        let t: u64 = 1_700_000_010;
        assert_eq!(t % PERIOD, 0);

        let code = code_at(&secret, t);

        // ±30秒は許容、±60秒は拒否
        assert!(service.verify_code_at(&secret, &code, t));
        assert!(service.verify_code_at(&secret, &code, t - 30));
        assert!(service.verify_code_at(&secret, &code, t + 30));
        assert!(!service.verify_code_at(&secret, &code, t - 60));
        assert!(!service.verify_code_at(&secret, &code, t + 60));
    }

    #[test]
    fn test_verify_invalid_code_format() {
        let service = create_test_service();
        let secret = TotpService::generate_secret();

        // 6桁でない
        assert!(!service.verify_code(&secret, "12345"));
        // 数字以外を含む
        assert!(!service.verify_code(&secret, "12345a"));
        // 空
        assert!(!service.verify_code(&secret, ""));
    }

    #[test]
    fn test_verify_malformed_secret_returns_false() {
        let service = create_test_service();
        // Base32ではないシークレットはエラーではなく検証失敗
        assert!(!service.verify_code("not-base32-at-all!", "123456"));
        // 短すぎるシークレットも同様
        assert!(!service.verify_code("AAAA", "123456"));
    }
}
