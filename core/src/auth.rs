use sha2::{Digest, Sha256};

/// Prefix carried by every issued API key.
pub const API_KEY_PREFIX: &str = "coach_sk_";

/// SHA-256 hex digest of a token string.
pub fn hash_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(hasher.finalize())
}

/// Whether a bearer token has the API key shape (`coach_sk_` + non-empty secret).
pub fn is_api_key(token: &str) -> bool {
    token
        .strip_prefix(API_KEY_PREFIX)
        .is_some_and(|rest| !rest.is_empty())
}

/// Extract the first 8 chars after `coach_sk_` for display/identification.
pub fn key_prefix(full_key: &str) -> String {
    full_key
        .strip_prefix(API_KEY_PREFIX)
        .map(|rest| rest.chars().take(8).collect())
        .unwrap_or_default()
}

/// Short, non-reversible label for a caller-supplied provider key, safe to log.
pub fn provider_key_fingerprint(key: &str) -> String {
    hash_token(key).chars().take(12).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_hex_digest() {
        let hash = hash_token("coach_sk_abc");
        assert_eq!(hash.len(), 64);
        assert_eq!(hash, hash_token("coach_sk_abc"));
        assert_ne!(hash, hash_token("coach_sk_abd"));
    }

    #[test]
    fn api_key_shape_requires_prefix_and_secret() {
        assert!(is_api_key("coach_sk_0123456789abcdef"));
        assert!(!is_api_key("coach_sk_"));
        assert!(!is_api_key("other_sk_0123"));
        assert!(!is_api_key(""));
    }

    #[test]
    fn key_prefix_takes_first_eight_secret_chars() {
        assert_eq!(key_prefix("coach_sk_0123456789abcdef"), "01234567");
        assert_eq!(key_prefix("not-a-key"), "");
    }

    #[test]
    fn provider_fingerprint_does_not_leak_key() {
        let fingerprint = provider_key_fingerprint("AIzaSyExampleKey");
        assert_eq!(fingerprint.len(), 12);
        assert!(!fingerprint.contains("AIza"));
    }
}
