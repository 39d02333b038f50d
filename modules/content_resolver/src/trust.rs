//! Artifact trust policy.
//!
//! Under the `Signed` policy an artifact must end with a 64-byte detached
//! ed25519 signature over everything before it, made with the configured
//! release key. The signature is stripped before the payload is handed on.
//! Under `Any` the artifact passes through untouched.

use ed25519_dalek::{Signature, VerifyingKey, PUBLIC_KEY_LENGTH, SIGNATURE_LENGTH};

#[derive(Debug, thiserror::Error)]
pub enum TrustError {
    #[error("release key is not valid hex: {0}")]
    BadKeyHex(String),

    #[error("release key must be {PUBLIC_KEY_LENGTH} bytes, got {0}")]
    BadKeyLength(usize),

    #[error("release key is not a valid ed25519 public key")]
    BadKey,

    #[error("artifact of {0} bytes is too short to carry a signature")]
    TooShort(usize),

    #[error("artifact signature does not verify against the release key")]
    BadSignature,
}

#[derive(Clone, Debug)]
pub enum TrustPolicy {
    /// Accept any resolved artifact as-is
    Any,

    /// Require a trailing detached signature from the release key
    Signed { release_key: VerifyingKey },
}

impl TrustPolicy {
    /// Build the `Signed` policy from a hex-encoded public key
    pub fn signed_from_hex(text: &str) -> Result<Self, TrustError> {
        let text = text.trim();
        let bytes =
            hex::decode(text).map_err(|_| TrustError::BadKeyHex(text.to_string()))?;
        let bytes: [u8; PUBLIC_KEY_LENGTH] =
            bytes.try_into().map_err(|v: Vec<u8>| TrustError::BadKeyLength(v.len()))?;
        let release_key = VerifyingKey::from_bytes(&bytes).map_err(|_| TrustError::BadKey)?;
        Ok(Self::Signed { release_key })
    }

    /// Check an artifact against the policy and return the payload to deploy
    pub fn admit<'a>(&self, artifact: &'a [u8]) -> Result<&'a [u8], TrustError> {
        match self {
            Self::Any => Ok(artifact),
            Self::Signed { release_key } => {
                if artifact.len() < SIGNATURE_LENGTH {
                    return Err(TrustError::TooShort(artifact.len()));
                }
                let (payload, sig_bytes) = artifact.split_at(artifact.len() - SIGNATURE_LENGTH);
                let sig_bytes: [u8; SIGNATURE_LENGTH] =
                    sig_bytes.try_into().map_err(|_| TrustError::BadSignature)?;
                let signature = Signature::from_bytes(&sig_bytes);
                release_key
                    .verify_strict(payload, &signature)
                    .map_err(|_| TrustError::BadSignature)?;
                Ok(payload)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::{Signer, SigningKey};
    use rand::rngs::OsRng;

    fn to_hex(bytes: &[u8]) -> String {
        hex::encode(bytes)
    }

    #[test]
    fn any_policy_passes_everything_through() {
        let policy = TrustPolicy::Any;
        assert_eq!(policy.admit(b"anything at all").unwrap(), b"anything at all");
        assert_eq!(policy.admit(b"").unwrap(), b"");
    }

    #[test]
    fn signed_policy_accepts_a_valid_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let policy = TrustPolicy::signed_from_hex(&to_hex(key.verifying_key().as_bytes())).unwrap();

        let payload = b"ECHO v2 binary".to_vec();
        let mut artifact = payload.clone();
        artifact.extend_from_slice(&key.sign(&payload).to_bytes());

        assert_eq!(policy.admit(&artifact).unwrap(), payload.as_slice());
    }

    #[test]
    fn signed_policy_rejects_tampering() {
        let key = SigningKey::generate(&mut OsRng);
        let policy = TrustPolicy::signed_from_hex(&to_hex(key.verifying_key().as_bytes())).unwrap();

        let payload = b"ECHO v2 binary".to_vec();
        let mut artifact = payload.clone();
        artifact.extend_from_slice(&key.sign(&payload).to_bytes());
        artifact[0] ^= 1;

        assert!(matches!(policy.admit(&artifact), Err(TrustError::BadSignature)));
    }

    #[test]
    fn signed_policy_rejects_short_artifacts() {
        let key = SigningKey::generate(&mut OsRng);
        let policy = TrustPolicy::signed_from_hex(&to_hex(key.verifying_key().as_bytes())).unwrap();
        assert!(matches!(policy.admit(b"tiny"), Err(TrustError::TooShort(4))));
    }

    #[test]
    fn bad_release_keys_are_rejected() {
        assert!(matches!(
            TrustPolicy::signed_from_hex("zz"),
            Err(TrustError::BadKeyHex(_))
        ));
        assert!(matches!(
            TrustPolicy::signed_from_hex("abcd"),
            Err(TrustError::BadKeyLength(2))
        ));
    }
}
