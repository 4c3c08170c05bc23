use anyhow::{anyhow, Result};
use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use openssl::hash::MessageDigest;
use openssl::pkey::PKey;
use openssl::sign::Signer;
use openssl::symm::{decrypt, encrypt, Cipher};

/// Size of an AES-256 key (256 bits = 32 bytes)
pub const AES_256_KEY_SIZE: usize = 32; // 256 bits
/// Size of the AES-CFB initialisation vector prepended to ciphertexts
pub const AES_CFB_IV_SIZE: usize = 16; // one AES block
/// Random bytes behind each per-key secret
pub const KEY_SECRET_SIZE: usize = 32;
/// Filler used when a configured secret is shorter than an AES key
pub const SECRET_PAD_BYTE: u8 = b'x';

const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Right-pad with `x`, then truncate, so any configured secret becomes an AES-256 key
pub fn pad_secret(secret: &[u8]) -> [u8; AES_256_KEY_SIZE] {
    let mut key = [SECRET_PAD_BYTE; AES_256_KEY_SIZE];
    let len = secret.len().min(AES_256_KEY_SIZE);
    key[..len].copy_from_slice(&secret[..len]);
    key
}

/// Setting code under which a key's encrypted auth key is stored
pub fn setting_code(authority_id: &str, key_id: &str) -> String {
    format!("{}/{}", authority_id, key_id)
}

/// AES-256-CFB encryption with a fresh random IV prepended to the ciphertext
pub fn encrypt_cfb(key: &[u8], plaintext: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AES_256_KEY_SIZE {
        return Err(anyhow!(
            "AES-256 key must be {} bytes, got {}",
            AES_256_KEY_SIZE,
            key.len()
        ));
    }
    let mut iv = [0u8; AES_CFB_IV_SIZE];
    openssl::rand::rand_bytes(&mut iv).map_err(|e| anyhow!("Failed to generate IV: {}", e))?;

    let ciphertext = encrypt(Cipher::aes_256_cfb128(), key, Some(&iv), plaintext)
        .map_err(|e| anyhow!("AES-CFB encryption failed: {}", e))?;

    let mut data = Vec::with_capacity(AES_CFB_IV_SIZE + ciphertext.len());
    data.extend_from_slice(&iv);
    data.extend_from_slice(&ciphertext);
    Ok(data)
}

/// Reverse of [`encrypt_cfb`]; the first block of `data` is the IV
pub fn decrypt_cfb(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    if key.len() != AES_256_KEY_SIZE {
        return Err(anyhow!(
            "AES-256 key must be {} bytes, got {}",
            AES_256_KEY_SIZE,
            key.len()
        ));
    }
    let iv = data
        .get(..AES_CFB_IV_SIZE)
        .ok_or_else(|| anyhow!("Ciphertext too short to contain IV"))?;
    let ciphertext = &data[AES_CFB_IV_SIZE..];

    decrypt(Cipher::aes_256_cfb128(), key, Some(iv), ciphertext)
        .map_err(|e| anyhow!("AES-CFB decryption failed: {}", e))
}

/// [`encrypt_cfb`] with standard base64 output, the form stored in the database
pub fn encrypt_to_base64(key: &[u8], plaintext: &[u8]) -> Result<String> {
    Ok(STANDARD.encode(encrypt_cfb(key, plaintext)?))
}

pub fn decrypt_from_base64(key: &[u8], encoded: &str) -> Result<Vec<u8>> {
    let data = STANDARD
        .decode(encoded.trim())
        .map_err(|e| anyhow!("Invalid base64 ciphertext: {}", e))?;
    decrypt_cfb(key, &data)
}

pub fn hmac_sha256(key: &[u8], data: &[u8]) -> Result<Vec<u8>> {
    let pkey = PKey::hmac(key).map_err(|e| anyhow!("Failed to create HMAC key: {}", e))?;
    let mut signer = Signer::new(MessageDigest::sha256(), &pkey)
        .map_err(|e| anyhow!("Failed to create HMAC signer: {}", e))?;
    signer
        .update(data)
        .map_err(|e| anyhow!("HMAC update failed: {}", e))?;
    signer
        .sign_to_vec()
        .map_err(|e| anyhow!("HMAC computation failed: {}", e))
}

/// Fresh per-key secret: random bytes in URL-safe base64
pub fn generate_key_secret() -> Result<String> {
    let mut secret = [0u8; KEY_SECRET_SIZE];
    openssl::rand::rand_bytes(&mut secret)
        .map_err(|e| anyhow!("Failed to generate key secret: {}", e))?;
    Ok(URL_SAFE_NO_PAD.encode(secret))
}

/// Random alphanumeric token of `len` characters
pub fn random_token(len: usize) -> Result<String> {
    let mut bytes = vec![0u8; len];
    openssl::rand::rand_bytes(&mut bytes)
        .map_err(|e| anyhow!("Failed to generate random token: {}", e))?;
    Ok(bytes
        .iter()
        .map(|b| TOKEN_ALPHABET[*b as usize % TOKEN_ALPHABET.len()] as char)
        .collect())
}
