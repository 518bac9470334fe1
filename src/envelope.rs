//! Signed and encrypted frames exchanged between a task's owner and its host.
//!
//! `task_id (32) || ciphertext || signature (65)`, where the ciphertext is
//! the payload sealed to the recipient's key and the signature covers
//! `keccak256(task_id || ciphertext)`.
use k256::{PublicKey, SecretKey};

use crate::{
    ecies::{self, EciesError},
    keys::{self, Identity},
    types::{Address, Hash32, TaskId},
};

pub const TASK_ID_LEN: usize = 32;
pub const SIGNATURE_LEN: usize = 65;
pub const MIN_ENVELOPE_LEN: usize = TASK_ID_LEN + SIGNATURE_LEN;

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("envelope is {0} bytes, need at least {MIN_ENVELOPE_LEN}")]
    TooShort(usize),
    #[error("signature does not recover to a public key")]
    SignatureRecovery,
    #[error("signed by `{actual}`, expected `{expected}`")]
    CounterpartyMismatch { expected: Address, actual: Address },
    #[error("encryption failed: {0}")]
    Encryption(EciesError),
    #[error("decryption failed: {0}")]
    Decryption(EciesError),
    #[error("signing failed: {0}")]
    Signing(#[from] k256::ecdsa::Error),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
#[error("payload hashes to `{actual}`, ledger has `{expected}`")]
pub struct CommitmentError {
    pub expected: Hash32,
    pub actual: Hash32,
}

/// A decoded envelope.
#[derive(Debug)]
pub struct Opened {
    pub task_id: TaskId,
    pub payload: Vec<u8>,
    // handy for replying: the reply is sealed to the key that signed the request
    pub signer: PublicKey,
    pub signer_address: Address,
}

fn signing_digest(task_id: &[u8], ciphertext: &[u8]) -> Hash32 {
    let mut signed = Vec::with_capacity(task_id.len() + ciphertext.len());
    signed.extend_from_slice(task_id);
    signed.extend_from_slice(ciphertext);
    keys::keccak256(&signed)
}

pub fn encode(
    task_id: &TaskId,
    recipient: &PublicKey,
    payload: &[u8],
    sender: &Identity,
) -> Result<Vec<u8>, EnvelopeError> {
    let ciphertext = ecies::encrypt(recipient, payload).map_err(EnvelopeError::Encryption)?;
    let digest = signing_digest(task_id.as_bytes(), &ciphertext);
    let signature = sender.sign(&digest)?;

    let mut frame = Vec::with_capacity(MIN_ENVELOPE_LEN + ciphertext.len());
    frame.extend_from_slice(task_id.as_bytes());
    frame.extend_from_slice(&ciphertext);
    frame.extend_from_slice(&signature);
    Ok(frame)
}

/// Reads the task id off a frame without touching the rest.
pub fn task_id_of(frame: &[u8]) -> Result<TaskId, EnvelopeError> {
    if frame.len() < MIN_ENVELOPE_LEN {
        return Err(EnvelopeError::TooShort(frame.len()));
    }
    let mut id = [0u8; TASK_ID_LEN];
    id.copy_from_slice(&frame[..TASK_ID_LEN]);
    Ok(Hash32(id))
}

/// Verifies the signer is `expected_signer`, then decrypts.
/// Nothing is decrypted for a frame from the wrong party.
pub fn decode(
    frame: &[u8],
    expected_signer: &Address,
    receiver: &SecretKey,
) -> Result<Opened, EnvelopeError> {
    let task_id = task_id_of(frame)?;
    let signer = verify_signer(frame, expected_signer)?;
    let ciphertext = &frame[TASK_ID_LEN..frame.len() - SIGNATURE_LEN];

    let payload = ecies::decrypt(receiver, ciphertext).map_err(EnvelopeError::Decryption)?;
    Ok(Opened {
        task_id,
        payload,
        signer,
        signer_address: *expected_signer,
    })
}

/// Checks the frame was signed by `expected_signer` and returns the signing
/// key. Needs no secret, so a relay can run it too.
pub fn verify_signer(frame: &[u8], expected_signer: &Address) -> Result<PublicKey, EnvelopeError> {
    let task_id = task_id_of(frame)?;
    let (signed, signature) = frame.split_at(frame.len() - SIGNATURE_LEN);
    let digest = signing_digest(task_id.as_bytes(), &signed[TASK_ID_LEN..]);
    let signer = keys::recover(&digest, signature).ok_or(EnvelopeError::SignatureRecovery)?;
    let signer_address = keys::address_of(&signer);
    if signer_address != *expected_signer {
        return Err(EnvelopeError::CounterpartyMismatch {
            expected: *expected_signer,
            actual: signer_address,
        });
    }
    Ok(signer)
}

pub fn verify_commitment(plaintext: &[u8], expected: &Hash32) -> Result<(), CommitmentError> {
    let actual = keys::commitment(plaintext);
    if actual != *expected {
        return Err(CommitmentError {
            expected: *expected,
            actual,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn parties() -> (Identity, Identity) {
        (Identity::random(), Identity::random())
    }

    #[test]
    fn test_encode_decode() {
        let (owner, host) = parties();
        let task_id = keys::keccak256(b"task");
        let frame = encode(&task_id, &host.public_key(), b"input bytes", &owner).unwrap();

        assert_eq!(task_id_of(&frame).unwrap(), task_id);
        let opened = decode(&frame, &owner.address(), host.secret()).unwrap();
        assert_eq!(opened.task_id, task_id);
        assert_eq!(opened.payload, b"input bytes");
        assert_eq!(opened.signer_address, owner.address());
        assert_eq!(opened.signer, owner.public_key());
    }

    #[test]
    fn test_empty_payload() {
        let (owner, host) = parties();
        let frame = encode(&Hash32::ZERO, &host.public_key(), b"", &owner).unwrap();
        let opened = decode(&frame, &owner.address(), host.secret()).unwrap();
        assert!(opened.payload.is_empty());
    }

    #[test]
    fn test_wrong_signer_rejected() {
        let (owner, host) = parties();
        let frame = encode(&Hash32::ZERO, &host.public_key(), b"x", &owner).unwrap();
        let stranger = Identity::random();
        match decode(&frame, &stranger.address(), host.secret()) {
            Err(EnvelopeError::CounterpartyMismatch { expected, actual }) => {
                assert_eq!(expected, stranger.address());
                assert_eq!(actual, owner.address());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_wrong_receiver_fails_decryption() {
        let (owner, host) = parties();
        let frame = encode(&Hash32::ZERO, &host.public_key(), b"x", &owner).unwrap();
        let other = Identity::random();
        assert!(matches!(
            decode(&frame, &owner.address(), other.secret()),
            Err(EnvelopeError::Decryption(_))
        ));
    }

    #[test]
    fn test_short_frames() {
        let (_, host) = parties();
        assert!(matches!(
            decode(&[0u8; MIN_ENVELOPE_LEN - 1], &Address::default(), host.secret()),
            Err(EnvelopeError::TooShort(96))
        ));
        assert!(matches!(task_id_of(&[]), Err(EnvelopeError::TooShort(0))));
        // long enough, but the empty ciphertext cannot be opened
        let frame = [1u8; MIN_ENVELOPE_LEN];
        assert!(decode(&frame, &Address::default(), host.secret()).is_err());
    }

    #[test]
    fn test_verify_signer_without_secret() {
        let (owner, host) = parties();
        let frame = encode(&Hash32([5u8; 32]), &host.public_key(), b"x", &owner).unwrap();
        assert_eq!(verify_signer(&frame, &owner.address()).unwrap(), owner.public_key());
        assert!(matches!(
            verify_signer(&frame, &host.address()),
            Err(EnvelopeError::CounterpartyMismatch { .. })
        ));
        assert!(matches!(
            verify_signer(&frame[..MIN_ENVELOPE_LEN - 1], &owner.address()),
            Err(EnvelopeError::TooShort(_))
        ));
    }

    #[test]
    fn test_commitment() {
        let expected = keys::commitment(b"input");
        assert!(verify_commitment(b"input", &expected).is_ok());
        let err = verify_commitment(b"inpuT", &expected).unwrap_err();
        assert_eq!(err.expected, expected);
        assert_eq!(err.actual, keys::commitment(b"inpuT"));
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(16))]

        // any single flipped byte must make the frame unusable for the receiver
        #[test]
        fn prop_tampered_frame_rejected(payload in proptest::collection::vec(any::<u8>(), 0..64), pos in any::<prop::sample::Index>()) {
            let (owner, host) = parties();
            let task_id = keys::keccak256(&payload);
            let mut frame = encode(&task_id, &host.public_key(), &payload, &owner).unwrap();
            let at = pos.index(frame.len());
            frame[at] ^= 0x80;
            prop_assert!(decode(&frame, &owner.address(), host.secret()).is_err());
        }
    }
}
