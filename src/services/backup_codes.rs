use argon2::password_hash::SaltString;
use argon2::password_hash::rand_core::OsRng;
use argon2::{Argon2, PasswordHash, PasswordHasher, PasswordVerifier};
use rand::RngCore;

use crate::error::AppError;

/// 1回の登録で発行するバックアップコード数
pub const BACKUP_CODE_COUNT: usize = 8;
/// ハイフン区切り前のコード長
const CODE_LEN: usize = 8;
/// 読み間違えやすい 0/O/1/I を除いた英数字32文字
const CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// バックアップコードを8個生成
///
/// 形式は `XXXX-XXXX`（転記しやすいよう4文字ずつ区切る）。
///
/// # Security
/// 乱数源は OS の CSPRNG。汎用PRNGは使わないこと。
pub fn generate_codes() -> Vec<String> {
    (0..BACKUP_CODE_COUNT).map(|_| generate_one()).collect()
}

fn generate_one() -> String {
    let mut bytes = [0u8; CODE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut bytes);

    // アルファベットが32文字（256の約数）なので剰余で偏りは出ない
    let chars: Vec<u8> = bytes
        .iter()
        .map(|b| CODE_ALPHABET[*b as usize % CODE_ALPHABET.len()])
        .collect();

    format!(
        "{}-{}",
        std::str::from_utf8(&chars[..4]).unwrap_or_default(),
        std::str::from_utf8(&chars[4..]).unwrap_or_default()
    )
}

/// コード群をそれぞれ独立ソルトの argon2id でハッシュ化
///
/// 返却順は入力順。順序に意味はなく、照合にのみ使う。
pub fn hash_codes(codes: &[String]) -> Result<Vec<String>, AppError> {
    let argon2 = Argon2::default();

    codes
        .iter()
        .map(|code| {
            let salt = SaltString::generate(&mut OsRng);
            argon2
                .hash_password(code.as_bytes(), &salt)
                .map(|h| h.to_string())
                .map_err(|e| {
                    tracing::error!(error = ?e, "バックアップコードのハッシュ生成エラー");
                    AppError::Internal(anyhow::anyhow!("backup code hash error"))
                })
        })
        .collect()
}

/// 候補コードを保存済みハッシュ群と照合し、最初に一致したインデックスを返す
///
/// 一致が見つかっても走査は打ち切らない（コストを位置に依存させない）。
/// 不一致は `None`。呼び出し側は一致時に該当エントリを必ず1件だけ削除して
/// 永続化すること（バックアップコードは厳密に1回限り）。
pub fn consume_code(stored_hashes: &[String], candidate: &str) -> Option<usize> {
    let normalized = normalize(candidate)?;
    let argon2 = Argon2::default();

    let mut matched: Option<usize> = None;
    for (index, hash) in stored_hashes.iter().enumerate() {
        let Ok(parsed) = PasswordHash::new(hash) else {
            tracing::error!(index, "パース不能なバックアップコードハッシュ");
            continue;
        };
        let ok = argon2
            .verify_password(normalized.as_bytes(), &parsed)
            .is_ok();
        if ok && matched.is_none() {
            matched = Some(index);
        }
    }

    matched
}

/// 入力の正規化: 空白・ハイフンを除去して大文字化し、正規形式に戻す
fn normalize(candidate: &str) -> Option<String> {
    let stripped: String = candidate
        .chars()
        .filter(|c| !c.is_whitespace() && *c != '-')
        .collect::<String>()
        .to_uppercase();

    if stripped.len() != CODE_LEN {
        return None;
    }

    Some(format!("{}-{}", &stripped[..4], &stripped[4..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generate_codes_format() {
        let codes = generate_codes();
        assert_eq!(codes.len(), BACKUP_CODE_COUNT);

        for code in &codes {
            assert_eq!(code.len(), 9);
            assert_eq!(&code[4..5], "-");
            for c in code.chars().filter(|c| *c != '-') {
                assert!(CODE_ALPHABET.contains(&(c as u8)), "unexpected char: {c}");
            }
        }
    }

    #[test]
    fn test_consume_finds_each_code_once() {
        let codes = vec!["AAAA-BBBB".to_string(), "CCCC-DDDD".to_string()];
        let mut hashes = hash_codes(&codes).unwrap();

        let index = consume_code(&hashes, "CCCC-DDDD").unwrap();
        assert_eq!(index, 1);

        // 呼び出し側の契約どおり、一致エントリを削除してから再照合
        hashes.remove(index);
        assert_eq!(consume_code(&hashes, "CCCC-DDDD"), None);
        // 残りのコードは引き続き使える
        assert_eq!(consume_code(&hashes, "AAAA-BBBB"), Some(0));
    }

    #[test]
    fn test_consume_normalizes_input() {
        let codes = vec!["AAAA-BBBB".to_string()];
        let hashes = hash_codes(&codes).unwrap();

        // 小文字・空白・ハイフン抜けを許容
        assert_eq!(consume_code(&hashes, " aaaa-bbbb "), Some(0));
        assert_eq!(consume_code(&hashes, "AAAABBBB"), Some(0));
        assert_eq!(consume_code(&hashes, "aaaa bbbb"), Some(0));
    }

    #[test]
    fn test_consume_no_match() {
        let codes = vec!["AAAA-BBBB".to_string()];
        let hashes = hash_codes(&codes).unwrap();

        assert_eq!(consume_code(&hashes, "ZZZZ-ZZZZ"), None);
        // 長さ不正は照合前に弾く
        assert_eq!(consume_code(&hashes, "AAA"), None);
        assert_eq!(consume_code(&hashes, ""), None);
    }
}
