//! Participant identities: secp256k1 keys, ledger addresses and digests.
use anyhow::Context;
use k256::{
    ecdsa::{RecoveryId, Signature, SigningKey, VerifyingKey},
    elliptic_curve::sec1::ToEncodedPoint,
    PublicKey, SecretKey,
};
use rand::Rng;
use sha2::Sha256;
use sha3::{Digest, Keccak256};

use crate::types::{Address, EncryptionKey, Hash32};

pub fn keccak256(data: &[u8]) -> Hash32 {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

/// The content commitment recorded on the ledger for inputs and outputs.
pub fn commitment(data: &[u8]) -> Hash32 {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Hash32(hasher.finalize().into())
}

// last 20 bytes of keccak over the uncompressed point without its tag byte
pub fn address_of(key: &PublicKey) -> Address {
    let point = key.to_encoded_point(false);
    let digest = keccak256(&point.as_bytes()[1..]);
    let mut address = [0u8; 20];
    address.copy_from_slice(&digest.0[12..]);
    Address(address)
}

pub fn encryption_key_of(key: &PublicKey) -> EncryptionKey {
    let point = key.to_encoded_point(false);
    let mut raw = [0u8; 64];
    raw.copy_from_slice(&point.as_bytes()[1..]);
    EncryptionKey(raw)
}

pub fn public_key_from_encryption_key(key: &EncryptionKey) -> Result<PublicKey, k256::elliptic_curve::Error> {
    let mut sec1 = [0u8; 65];
    sec1[0] = 0x04;
    sec1[1..].copy_from_slice(&key.0);
    PublicKey::from_sec1_bytes(&sec1)
}

pub fn random_secret() -> SecretKey {
    let mut rng = rand::rng();
    loop {
        let mut bytes = [0u8; 32];
        rng.fill(&mut bytes);
        // zero or >= the group order is rejected, just draw again
        if let Ok(secret) = SecretKey::from_slice(&bytes) {
            return secret;
        }
    }
}

/// Recovers the signer of a 32-byte prehash from an `r || s || v` signature.
/// `v` may be given as 0/1 or in the legacy 27/28 form.
pub fn recover(prehash: &Hash32, signature: &[u8]) -> Option<PublicKey> {
    if signature.len() != 65 {
        return None;
    }
    let sig = Signature::from_slice(&signature[..64]).ok()?;
    let v = match signature[64] {
        v @ (0 | 1) => v,
        v @ (27 | 28) => v - 27,
        _ => return None,
    };
    let recid = RecoveryId::from_byte(v)?;
    let verifying = VerifyingKey::recover_from_prehash(&prehash.0, &sig, recid).ok()?;
    Some(PublicKey::from(&verifying))
}

/// A participant's key pair.
#[derive(Clone)]
pub struct Identity {
    secret: SecretKey,
    address: Address,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl Identity {
    pub fn new(secret: SecretKey) -> Self {
        let address = address_of(&secret.public_key());
        Identity { secret, address }
    }

    pub fn random() -> Self {
        Identity::new(random_secret())
    }

    pub fn from_hex(hex_key: &str) -> anyhow::Result<Self> {
        let bytes = hex::decode(hex_key.trim().trim_start_matches("0x"))
            .context("private key is not valid hex")?;
        let secret = SecretKey::from_slice(&bytes)
            .map_err(|_| anyhow::Error::msg("private key is not a valid secp256k1 scalar"))?;
        Ok(Identity::new(secret))
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }

    pub fn public_key(&self) -> PublicKey {
        self.secret.public_key()
    }

    pub fn encryption_key(&self) -> EncryptionKey {
        encryption_key_of(&self.public_key())
    }

    /// Signs a 32-byte prehash, producing `r || s || v` with `v` in {0, 1}.
    pub fn sign(&self, prehash: &Hash32) -> Result<[u8; 65], k256::ecdsa::Error> {
        let signing = SigningKey::from(&self.secret);
        let (sig, recid) = signing.sign_prehash_recoverable(&prehash.0)?;
        let mut out = [0u8; 65];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        Ok(out)
    }
}
