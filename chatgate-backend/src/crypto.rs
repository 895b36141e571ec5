//! Secret encryption for stored API keys, and password hashing

use base64::Engine;
use hmac::{Hmac, Mac};
use rand::RngCore;
use sha1::Sha1;
use thiserror::Error;

type HmacSha1 = Hmac<Sha1>;

const SALT_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum CipherError {
    #[error("invalid cipher key: {0}")]
    InvalidKey(String),
    #[error("ciphertext is not valid base64")]
    Encoding,
    #[error("encryption failed: {0}")]
    Encrypt(String),
    #[error("decryption failed: {0}")]
    Decrypt(String),
    #[error("plaintext is not valid UTF-8")]
    Utf8,
}

/// Symmetric view over whatever scheme protects secrets at rest
pub trait SecretCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError>;
    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError>;
}

/// ECIES over secp256k1; ciphertexts are stored as standard base64.
pub struct EciesCipher {
    secret: [u8; 32],
    public: [u8; 65],
}

impl EciesCipher {
    pub fn from_hex(secret_hex: &str) -> Result<Self, CipherError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
        let secret = ecies::SecretKey::parse_slice(&bytes)
            .map_err(|e| CipherError::InvalidKey(format!("{:?}", e)))?;
        let public = ecies::PublicKey::from_secret_key(&secret);

        Ok(Self {
            secret: secret.serialize(),
            public: public.serialize(),
        })
    }
}

impl SecretCipher for EciesCipher {
    fn encrypt(&self, plaintext: &str) -> Result<String, CipherError> {
        let sealed = ecies::encrypt(&self.public, plaintext.as_bytes())
            .map_err(|e| CipherError::Encrypt(format!("{:?}", e)))?;
        Ok(base64::engine::general_purpose::STANDARD.encode(sealed))
    }

    fn decrypt(&self, ciphertext: &str) -> Result<String, CipherError> {
        let sealed = base64::engine::general_purpose::STANDARD
            .decode(ciphertext.trim())
            .map_err(|_| CipherError::Encoding)?;
        let opened = ecies::decrypt(&self.secret, &sealed)
            .map_err(|e| CipherError::Decrypt(format!("{:?}", e)))?;
        String::from_utf8(opened).map_err(|_| CipherError::Utf8)
    }
}

/// Stored hash scheme tag
const PASSWORD_SCHEME: &str = "pbkdf2-sha1";
/// PBKDF2 rounds for new hashes; older hashes carry their own count
pub const PASSWORD_ITERATIONS: u32 = 100_000;

/// Hash a password as `pbkdf2-sha1$iterations$salt_hex$hash_hex`.
///
/// PBKDF2-HMAC-SHA1 over the password peppered with the server secret.
pub fn hash_password(secret_key: &str, password: &str) -> Result<String, CipherError> {
    hash_with_iterations(secret_key, password, PASSWORD_ITERATIONS)
}

fn hash_with_iterations(
    secret_key: &str,
    password: &str,
    iterations: u32,
) -> Result<String, CipherError> {
    let mut salt = [0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let derived = stretch(secret_key, &salt, password, iterations)?;
    Ok(format!(
        "{}${}${}${}",
        PASSWORD_SCHEME,
        iterations,
        hex::encode(salt),
        hex::encode(derived)
    ))
}

pub fn verify_password(secret_key: &str, password: &str, stored: &str) -> bool {
    let parts: Vec<&str> = stored.split('$').collect();
    let [scheme, iterations, salt_hex, hash_hex] = parts.as_slice() else {
        return false;
    };
    if *scheme != PASSWORD_SCHEME {
        return false;
    }
    let Ok(iterations) = iterations.parse::<u32>() else {
        return false;
    };
    if iterations == 0 {
        return false;
    }
    let (Ok(salt), Ok(expected)) = (hex::decode(salt_hex), hex::decode(hash_hex)) else {
        return false;
    };

    match stretch(secret_key, &salt, password, iterations) {
        Ok(derived) => constant_time_eq(&derived, &expected),
        Err(_) => false,
    }
}

/// Single-block PBKDF2 (RFC 8018) with HMAC-SHA1 as the PRF. The PRF key is
/// HMAC(secret_key, password), so a leaked table is useless without the secret.
fn stretch(
    secret_key: &str,
    salt: &[u8],
    password: &str,
    iterations: u32,
) -> Result<Vec<u8>, CipherError> {
    let mut pepper = HmacSha1::new_from_slice(secret_key.as_bytes())
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;
    pepper.update(password.as_bytes());
    let peppered = pepper.finalize().into_bytes();

    let prf = HmacSha1::new_from_slice(&peppered)
        .map_err(|e| CipherError::InvalidKey(e.to_string()))?;

    let mut round = prf.clone();
    round.update(salt);
    round.update(&1u32.to_be_bytes());
    let mut u = round.finalize().into_bytes();
    let mut derived = u.to_vec();

    for _ in 1..iterations {
        let mut round = prf.clone();
        round.update(&u);
        u = round.finalize().into_bytes();
        for (out, byte) in derived.iter_mut().zip(u.iter()) {
            *out ^= byte;
        }
    }
    Ok(derived)
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    a.len() == b.len() && a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub const TEST_KEY: &str = "4c0883a69102937d6231471b5dbb6204fe5129617082792ae468d01a3f362318";

    #[test]
    fn test_ecies_roundtrip_and_tamper() {
        let cipher = EciesCipher::from_hex(TEST_KEY).unwrap();
        let sealed = cipher.encrypt("sk-live-123").unwrap();
        assert_ne!(sealed, "sk-live-123");
        assert_eq!(cipher.decrypt(&sealed).unwrap(), "sk-live-123");

        assert!(matches!(cipher.decrypt("not base64!"), Err(CipherError::Encoding)));
        let garbage = base64::engine::general_purpose::STANDARD.encode([7u8; 40]);
        assert!(matches!(cipher.decrypt(&garbage), Err(CipherError::Decrypt(_))));
    }

    #[test]
    fn test_rejects_bad_key() {
        assert!(EciesCipher::from_hex("zz").is_err());
        assert!(EciesCipher::from_hex(&"00".repeat(32)).is_err());
    }

    #[test]
    fn test_password_hash_verifies() {
        let stored = hash_password("server-secret", "hunter22").unwrap();
        assert!(verify_password("server-secret", "hunter22", &stored));
        assert!(!verify_password("server-secret", "hunter23", &stored));
        assert!(!verify_password("other-secret", "hunter22", &stored));
        assert!(!verify_password("server-secret", "hunter22", "garbage"));
        assert!(stored.starts_with("pbkdf2-sha1$100000$"));
    }

    #[test]
    fn test_password_hash_is_stretched() {
        // Each stored hash carries its own work factor
        let cheap = hash_with_iterations("server-secret", "hunter22", 2).unwrap();
        assert!(verify_password("server-secret", "hunter22", &cheap));

        let tampered = cheap.replacen("$2$", "$3$", 1);
        assert!(!verify_password("server-secret", "hunter22", &tampered));

        let zero = cheap.replacen("$2$", "$0$", 1);
        assert!(!verify_password("server-secret", "hunter22", &zero));

        // The legacy single-MAC layout is no longer accepted
        assert!(!verify_password("server-secret", "hunter22", "00ff$abcd"));
    }

    #[test]
    fn test_stretch_rounds_change_output() {
        // One round equals a plain HMAC over salt || INT(1)
        let one = stretch("k", b"salt", "pw", 1).unwrap();
        assert_eq!(one.len(), 20);
        let two = stretch("k", b"salt", "pw", 2).unwrap();
        assert_ne!(one, two);
    }
}
