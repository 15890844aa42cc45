use secrecy::SecretBox;
use serde::Deserialize;

#[derive(Debug, Deserialize)]
pub struct Config {
    pub database_url: SecretBox<String>,
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,

    // 2FA (TOTP) 設定
    /// TOTP発行者名（認証アプリに表示される）
    pub totp_issuer: String,

    // シークレット暗号化設定
    /// TOTPシークレット暗号化用マスターキー（32文字以上）
    pub encryption_master_key: SecretBox<String>,
    /// 鍵導出（PBKDF2-HMAC-SHA256）のイテレーション回数
    #[serde(default = "default_kdf_iterations")]
    pub kdf_iterations: u32,

    // レート制限設定
    /// 期限切れレコード掃除タスクの実行間隔（秒）
    #[serde(default = "default_rate_limit_sweep_interval_secs")]
    pub rate_limit_sweep_interval_secs: u64,
}

const DEFAULT_HOST: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 3000;
const DEFAULT_KDF_ITERATIONS: u32 = 100_000;
const DEFAULT_RATE_LIMIT_SWEEP_INTERVAL_SECS: u64 = 300;

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_kdf_iterations() -> u32 {
    DEFAULT_KDF_ITERATIONS
}

fn default_rate_limit_sweep_interval_secs() -> u64 {
    DEFAULT_RATE_LIMIT_SWEEP_INTERVAL_SECS
}

impl Config {
    pub fn load() -> Result<Self, envy::Error> {
        envy::from_env()
    }
}
