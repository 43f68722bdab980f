//! PKCE material and per-attempt identifiers for the OAuth authorization
//! request.

use base64::engine::general_purpose::{STANDARD, URL_SAFE_NO_PAD};
use base64::Engine;
use rand::RngCore;
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Generates a cryptographically random code verifier.
///
/// 32 random bytes, base64url without padding (RFC 7636 compliant length).
pub fn generate_code_verifier() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Computes the S256 code challenge for a verifier.
///
/// `challenge = BASE64URL(SHA256(verifier))`, unpadded.
pub fn generate_code_challenge(verifier: &str) -> String {
    let hash = Sha256::digest(verifier.as_bytes());
    URL_SAFE_NO_PAD.encode(hash)
}

/// Generates a random GUID-format identifier with proper RFC 4122 version
/// and variant bits, used for nonces and correlation ids.
pub fn generate_guid() -> String {
    Uuid::new_v4().to_string()
}

/// Encodes the opaque `state` parameter: base64 of a small JSON object
/// carrying a fresh id and the interaction-type tag.
pub fn encode_state(interaction_type: &str) -> String {
    let payload = serde_json::json!({
        "id": generate_guid(),
        "meta": { "interactionType": interaction_type },
    });
    STANDARD.encode(payload.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_verifier_shape() {
        let verifier = generate_code_verifier();
        // 32 bytes -> 43 base64url chars, no padding
        assert_eq!(verifier.len(), 43);
        assert!(verifier
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        assert_ne!(verifier, generate_code_verifier());
    }

    #[test]
    fn test_challenge_is_sha256_of_verifier() {
        let verifier = generate_code_verifier();
        let challenge = generate_code_challenge(&verifier);

        let expected = URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()));
        assert_eq!(challenge, expected);
        assert!(!challenge.ends_with('='));
    }

    #[test]
    fn test_challenge_known_vector() {
        // RFC 7636 appendix B
        let challenge = generate_code_challenge("dBjftJeZ4CVP-mB92K27uhbUJU1p1r_wW1gFWFOEjXk");
        assert_eq!(challenge, "E9Melhoa2OwvFrEMTJguCHaoeK1t8URWbuGJSstw-cM");
    }

    #[test]
    fn test_guid_format_and_bits() {
        let guid = generate_guid();
        assert_eq!(guid.len(), 36);
        let parts: Vec<&str> = guid.split('-').collect();
        assert_eq!(parts.len(), 5);
        // Version nibble
        assert!(parts[2].starts_with('4'));
        // Variant nibble is one of 8, 9, a, b
        let variant = parts[3].chars().next().unwrap();
        assert!(matches!(variant, '8' | '9' | 'a' | 'b'), "variant {variant}");

        assert_ne!(guid, generate_guid());
    }

    #[test]
    fn test_state_decodes_to_tagged_json() {
        let state = encode_state("silent");
        let decoded = STANDARD.decode(&state).unwrap();
        let value: serde_json::Value = serde_json::from_slice(&decoded).unwrap();
        assert_eq!(value["meta"]["interactionType"], "silent");
        assert_eq!(value["id"].as_str().unwrap().len(), 36);
    }
}
