use crate::error::{ProxyError, Result as AppResult};
use sha2::{Digest, Sha256};

// 轻量可逆混淆：以配置密钥+固定盐做异或，再十六进制编码。
// 非强加密，仅保证密钥不以明文落盘。
fn xor_bytes(data: &[u8], key: &[u8]) -> Vec<u8> {
    if key.is_empty() {
        return data.to_vec();
    }
    data.iter()
        .enumerate()
        .map(|(i, b)| b ^ key[i % key.len()])
        .collect()
}

fn to_hex(bytes: &[u8]) -> String {
    let mut s = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        s.push_str(&format!("{:02x}", b));
    }
    s
}

#[allow(clippy::manual_is_multiple_of)]
fn from_hex(s: &str) -> AppResult<Vec<u8>> {
    if s.len() % 2 != 0 {
        return Err(ProxyError::Config("Invalid hex length".into()));
    }
    let mut out = Vec::with_capacity(s.len() / 2);
    let bytes = s.as_bytes();
    for i in (0..s.len()).step_by(2) {
        let hi = (bytes[i] as char)
            .to_digit(16)
            .ok_or_else(|| ProxyError::Config("Invalid hex".into()))?;
        let lo = (bytes[i + 1] as char)
            .to_digit(16)
            .ok_or_else(|| ProxyError::Config("Invalid hex".into()))?;
        out.push(((hi << 4) | lo) as u8);
    }
    Ok(out)
}

/// Encrypts key values for logs/storage and computes the deterministic
/// hash used for reverse lookup.
#[derive(Clone)]
pub struct Encryptor {
    key_material: Vec<u8>,
}

impl Encryptor {
    pub fn new(secret: &str) -> Self {
        let mut v = Vec::from(secret.as_bytes());
        v.extend_from_slice(b"::keygate");
        Self { key_material: v }
    }

    pub fn encrypt(&self, plain: &str) -> AppResult<String> {
        if plain.is_empty() {
            return Err(ProxyError::Config("cannot encrypt empty value".into()));
        }
        Ok(to_hex(&xor_bytes(plain.as_bytes(), &self.key_material)))
    }

    #[allow(dead_code)]
    pub fn decrypt(&self, data: &str) -> AppResult<String> {
        let bytes = from_hex(data)?;
        let plain = xor_bytes(&bytes, &self.key_material);
        String::from_utf8(plain)
            .map_err(|e| ProxyError::Config(format!("Invalid UTF-8 after decrypt: {}", e)))
    }

    /// Deterministic, non-reversible digest of a key value.
    pub fn hash(&self, plain: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(&self.key_material);
        hasher.update(plain.as_bytes());
        to_hex(&hasher.finalize())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encrypt_roundtrip() {
        let enc = Encryptor::new("secret");
        let cipher = enc.encrypt("sk-test-123").unwrap();
        assert_ne!(cipher, "sk-test-123");
        assert_eq!(enc.decrypt(&cipher).unwrap(), "sk-test-123");
    }

    #[test]
    fn hash_is_deterministic_and_secret_bound() {
        let a = Encryptor::new("secret");
        let b = Encryptor::new("other");
        assert_eq!(a.hash("sk-x"), a.hash("sk-x"));
        assert_ne!(a.hash("sk-x"), b.hash("sk-x"));
        assert_ne!(a.hash("sk-x"), a.hash("sk-y"));
    }

    #[test]
    fn rejects_empty_plaintext() {
        let enc = Encryptor::new("secret");
        assert!(enc.encrypt("").is_err());
    }
}
