//! Hybrid public-key encryption of task payloads.
//!
//! Layout: `ephemeral_pk (65) || nonce (16) || tag (16) || ciphertext`.
//! The symmetric key is HKDF-SHA256 over `ephemeral_pk || shared_point`,
//! both uncompressed, with no salt and no info, feeding AES-256-GCM with a
//! 16-byte nonce.
use aes_gcm::{
    aead::{consts::U16, Aead, KeyInit},
    aes::Aes256,
    AesGcm, Nonce,
};
use hkdf::Hkdf;
use k256::{
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};
use rand::Rng;
use sha2::Sha256;

use crate::keys::random_secret;

type Cipher = AesGcm<Aes256, U16>;

const PUBLIC_KEY_LEN: usize = 65;
const NONCE_LEN: usize = 16;
const TAG_LEN: usize = 16;
pub const OVERHEAD: usize = PUBLIC_KEY_LEN + NONCE_LEN + TAG_LEN;

#[derive(Debug, thiserror::Error)]
pub enum EciesError {
    #[error("ciphertext shorter than the {OVERHEAD} byte header")]
    TooShort,
    #[error("invalid ephemeral public key")]
    InvalidPublicKey,
    #[error("key derivation failed")]
    Kdf,
    #[error("aead failure")]
    Aead,
}

fn shared_point(secret: &SecretKey, public: &PublicKey) -> [u8; PUBLIC_KEY_LEN] {
    let point = (public.to_projective() * *secret.to_nonzero_scalar()).to_affine();
    let encoded = point.to_encoded_point(false);
    let mut out = [0u8; PUBLIC_KEY_LEN];
    out.copy_from_slice(encoded.as_bytes());
    out
}

fn derive_key(ephemeral: &[u8], shared: &[u8]) -> Result<[u8; 32], EciesError> {
    let mut master = Vec::with_capacity(ephemeral.len() + shared.len());
    master.extend_from_slice(ephemeral);
    master.extend_from_slice(shared);
    let hk = Hkdf::<Sha256>::new(None, &master);
    let mut key = [0u8; 32];
    hk.expand(&[], &mut key).map_err(|_| EciesError::Kdf)?;
    Ok(key)
}

pub fn encrypt(receiver: &PublicKey, plaintext: &[u8]) -> Result<Vec<u8>, EciesError> {
    let ephemeral = random_secret();
    let ephemeral_pk = ephemeral.public_key().to_encoded_point(false);
    let shared = shared_point(&ephemeral, receiver);
    let key = derive_key(ephemeral_pk.as_bytes(), &shared)?;

    let mut nonce = [0u8; NONCE_LEN];
    rand::rng().fill(&mut nonce);
    let cipher = Cipher::new_from_slice(&key).map_err(|_| EciesError::Kdf)?;
    // aes-gcm appends the tag, the wire format wants it before the ciphertext
    let sealed = cipher
        .encrypt(Nonce::<U16>::from_slice(&nonce), plaintext)
        .map_err(|_| EciesError::Aead)?;
    let (body, tag) = sealed.split_at(sealed.len() - TAG_LEN);

    let mut out = Vec::with_capacity(OVERHEAD + body.len());
    out.extend_from_slice(ephemeral_pk.as_bytes());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(tag);
    out.extend_from_slice(body);
    Ok(out)
}

pub fn decrypt(receiver: &SecretKey, data: &[u8]) -> Result<Vec<u8>, EciesError> {
    if data.len() < OVERHEAD {
        return Err(EciesError::TooShort);
    }
    let (ephemeral_pk, rest) = data.split_at(PUBLIC_KEY_LEN);
    let (nonce, rest) = rest.split_at(NONCE_LEN);
    let (tag, body) = rest.split_at(TAG_LEN);

    let ephemeral = PublicKey::from_sec1_bytes(ephemeral_pk)
        .map_err(|_| EciesError::InvalidPublicKey)?;
    let shared = shared_point(receiver, &ephemeral);
    let key = derive_key(ephemeral_pk, &shared)?;

    let mut sealed = Vec::with_capacity(body.len() + TAG_LEN);
    sealed.extend_from_slice(body);
    sealed.extend_from_slice(tag);
    let cipher = Cipher::new_from_slice(&key).map_err(|_| EciesError::Kdf)?;
    cipher
        .decrypt(Nonce::<U16>::from_slice(nonce), sealed.as_slice())
        .map_err(|_| EciesError::Aead)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let secret = random_secret();
        let sealed = encrypt(&secret.public_key(), b"fn main() {}").unwrap();
        assert_eq!(sealed.len(), OVERHEAD + 12);
        assert_eq!(decrypt(&secret, &sealed).unwrap(), b"fn main() {}");
    }

    #[test]
    fn test_empty_plaintext() {
        let secret = random_secret();
        let sealed = encrypt(&secret.public_key(), b"").unwrap();
        assert_eq!(sealed.len(), OVERHEAD);
        assert!(decrypt(&secret, &sealed).unwrap().is_empty());
    }

    #[test]
    fn test_wrong_receiver() {
        let secret = random_secret();
        let sealed = encrypt(&secret.public_key(), b"payload").unwrap();
        assert!(matches!(
            decrypt(&random_secret(), &sealed),
            Err(EciesError::Aead)
        ));
    }

    #[test]
    fn test_tampered_and_short() {
        let secret = random_secret();
        let mut sealed = encrypt(&secret.public_key(), b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(decrypt(&secret, &sealed), Err(EciesError::Aead)));
        assert!(matches!(
            decrypt(&secret, &sealed[..OVERHEAD - 1]),
            Err(EciesError::TooShort)
        ));
        sealed[0] = 0x07;
        assert!(matches!(
            decrypt(&secret, &sealed),
            Err(EciesError::InvalidPublicKey)
        ));
    }
}
