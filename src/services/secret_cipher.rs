use aes_gcm::{
    Aes256Gcm, KeyInit, Nonce,
    aead::{Aead, OsRng},
};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use pbkdf2::pbkdf2_hmac;
use rand::RngCore;
use sha2::Sha256;

use crate::error::AppError;

const SALT_LEN: usize = 16;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;

/// TOTPシークレット保存用の対称暗号（AEAD）
///
/// # Security
/// - 暗号化のたびに新しいソルトとnonceを生成（鍵・nonceの再利用なし）
/// - 暗号鍵はマスターキーから PBKDF2-HMAC-SHA256 で都度導出
///   （マスターキーが静的でも事前計算攻撃が成立しない）
/// - ブロブ形式: salt(16) + nonce(12) + tag(16) + ciphertext を base64 エンコード
/// - 復号はタグ検証込み。改ざん・鍵不一致はエラー（フェイルクローズド）
#[derive(Clone)]
pub struct SecretCipher {
    master_key: Vec<u8>,
    iterations: u32,
}

impl SecretCipher {
    /// 新しい SecretCipher を作成
    ///
    /// # Arguments
    /// * `master_key` - 長期マスターキー（32文字以上）
    /// * `iterations` - PBKDF2 のイテレーション回数
    pub fn new(master_key: &str, iterations: u32) -> Result<Self, AppError> {
        if master_key.len() < 32 {
            tracing::error!(len = master_key.len(), "マスターキーが短すぎる");
            return Err(AppError::Internal(anyhow::anyhow!(
                "encryption master key must be at least 32 characters"
            )));
        }
        if iterations == 0 {
            return Err(AppError::Internal(anyhow::anyhow!(
                "kdf iterations must be positive"
            )));
        }

        Ok(Self {
            master_key: master_key.as_bytes().to_vec(),
            iterations,
        })
    }

    /// ソルトから暗号鍵を導出
    fn derive_key(&self, salt: &[u8]) -> [u8; 32] {
        let mut key = [0u8; 32];
        pbkdf2_hmac::<Sha256>(&self.master_key, salt, self.iterations, &mut key);
        key
    }

    /// 平文を暗号化し base64 ブロブを返す
    pub fn encrypt(&self, plaintext: &str) -> Result<String, AppError> {
        let mut salt = [0u8; SALT_LEN];
        OsRng.fill_bytes(&mut salt);

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let key = self.derive_key(&salt);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        // aes-gcm は ciphertext の末尾にタグを付けて返す
        let ct_and_tag = cipher.encrypt(nonce, plaintext.as_bytes()).map_err(|e| {
            tracing::error!(error = ?e, "シークレット暗号化エラー");
            AppError::Internal(anyhow::anyhow!("encryption error"))
        })?;
        let (ciphertext, tag) = ct_and_tag.split_at(ct_and_tag.len() - TAG_LEN);

        // salt + nonce + tag + ciphertext の固定順で結合
        let mut blob = Vec::with_capacity(SALT_LEN + NONCE_LEN + TAG_LEN + ciphertext.len());
        blob.extend_from_slice(&salt);
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(tag);
        blob.extend_from_slice(ciphertext);

        Ok(STANDARD.encode(blob))
    }

    /// base64 ブロブを復号
    ///
    /// # Errors
    /// 不正な形式・タグ不一致は `AppError::Integrity`（改ざんまたは破損の疑い）
    pub fn decrypt(&self, blob: &str) -> Result<String, AppError> {
        let raw = STANDARD.decode(blob).map_err(|e| {
            tracing::error!(error = ?e, "暗号ブロブのbase64デコードエラー");
            AppError::Integrity(anyhow::anyhow!("malformed ciphertext blob"))
        })?;

        if raw.len() < SALT_LEN + NONCE_LEN + TAG_LEN {
            tracing::error!(len = raw.len(), "暗号ブロブが短すぎる");
            return Err(AppError::Integrity(anyhow::anyhow!(
                "ciphertext blob too short"
            )));
        }

        let (salt, rest) = raw.split_at(SALT_LEN);
        let (nonce_bytes, rest) = rest.split_at(NONCE_LEN);
        let (tag, ciphertext) = rest.split_at(TAG_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        let key = self.derive_key(salt);
        let cipher = Aes256Gcm::new_from_slice(&key).map_err(|e| {
            tracing::error!(error = ?e, "AES-GCM暗号化器の初期化エラー");
            AppError::Internal(anyhow::anyhow!("cipher initialization error"))
        })?;

        // aes-gcm の期待する ciphertext + tag の並びに戻す
        let mut ct_and_tag = Vec::with_capacity(ciphertext.len() + TAG_LEN);
        ct_and_tag.extend_from_slice(ciphertext);
        ct_and_tag.extend_from_slice(tag);

        let plaintext = cipher.decrypt(nonce, ct_and_tag.as_ref()).map_err(|_| {
            // タグ不一致は改ざんの可能性があるため詳細を返さない
            tracing::error!("シークレット復号エラー（タグ検証失敗）");
            AppError::Integrity(anyhow::anyhow!("tag verification failed"))
        })?;

        String::from_utf8(plaintext).map_err(|e| {
            tracing::error!(error = ?e, "復号データのUTF-8変換エラー");
            AppError::Integrity(anyhow::anyhow!("invalid utf8 after decryption"))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // テストではKDFを軽くする（デフォルトの10万回は遅い）
    const TEST_ITERATIONS: u32 = 1_000;

    fn create_test_cipher() -> SecretCipher {
        SecretCipher::new("0123456789abcdef0123456789abcdef", TEST_ITERATIONS).unwrap()
    }

    #[test]
    fn test_roundtrip() {
        let cipher = create_test_cipher();
        let plaintext = "JBSWY3DPEHPK3PXPJBSWY3DPEHPK3PXP";

        let blob = cipher.encrypt(plaintext).unwrap();
        let decrypted = cipher.decrypt(&blob).unwrap();
        assert_eq!(plaintext, decrypted);
    }

    #[test]
    fn test_roundtrip_empty_string() {
        let cipher = create_test_cipher();
        let blob = cipher.encrypt("").unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), "");
    }

    #[test]
    fn test_roundtrip_long_input() {
        let cipher = create_test_cipher();
        let plaintext = "x".repeat(64);
        let blob = cipher.encrypt(&plaintext).unwrap();
        assert_eq!(cipher.decrypt(&blob).unwrap(), plaintext);
    }

    #[test]
    fn test_fresh_salt_and_nonce_per_call() {
        let cipher = create_test_cipher();
        let blob1 = cipher.encrypt("same input").unwrap();
        let blob2 = cipher.encrypt("same input").unwrap();
        // ソルトとnonceが毎回変わるため同一平文でもブロブは一致しない
        assert_ne!(blob1, blob2);
    }

    #[test]
    fn test_tampered_blob_fails_closed() {
        use base64::{Engine as _, engine::general_purpose::STANDARD};

        let cipher = create_test_cipher();
        let blob = cipher.encrypt("secret value").unwrap();

        // 暗号文の末尾1バイトを反転
        let mut raw = STANDARD.decode(&blob).unwrap();
        let last = raw.len() - 1;
        raw[last] ^= 0xff;
        let tampered = STANDARD.encode(raw);

        let result = cipher.decrypt(&tampered);
        assert!(matches!(result, Err(AppError::Integrity(_))));
    }

    #[test]
    fn test_wrong_key_fails_closed() {
        let cipher = create_test_cipher();
        let blob = cipher.encrypt("secret value").unwrap();

        let other =
            SecretCipher::new("ffffffffffffffffffffffffffffffff", TEST_ITERATIONS).unwrap();
        assert!(matches!(other.decrypt(&blob), Err(AppError::Integrity(_))));
    }

    #[test]
    fn test_malformed_blob() {
        let cipher = create_test_cipher();
        assert!(matches!(
            cipher.decrypt("not-base64!!!"),
            Err(AppError::Integrity(_))
        ));
        // 復号可能な長さに満たないブロブ
        assert!(matches!(
            cipher.decrypt("AAAA"),
            Err(AppError::Integrity(_))
        ));
    }

    #[test]
    fn test_new_with_short_master_key() {
        let result = SecretCipher::new("too short", TEST_ITERATIONS);
        assert!(result.is_err());
    }
}
