//! Share tokens: generation and digest checks.
//!
//! A token is 32 bytes from the OS RNG, base64url without padding. Only its
//! BLAKE3 digest is stored. `blake3::Hash` compares in constant time.

use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use rand::{RngCore, rngs::OsRng};

const TOKEN_BYTES: usize = 32;

/// Encoded length of a token (43 chars for 32 bytes).
pub const TOKEN_LEN: usize = (TOKEN_BYTES * 4).div_ceil(3);

pub fn generate_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

pub fn token_digest(token: &str) -> blake3::Hash {
    blake3::hash(token.as_bytes())
}

/// Constant-time comparison of a stored hex digest against a candidate.
pub fn digest_matches(stored_hex: &str, candidate: &blake3::Hash) -> bool {
    match blake3::Hash::from_hex(stored_hex) {
        Ok(stored) => stored == *candidate,
        Err(_) => false,
    }
}

/// Cheap shape check; anything else cannot be one of our tokens.
pub fn is_well_formed(token: &str) -> bool {
    token.len() == TOKEN_LEN
        && token
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn tokens_are_well_formed_and_distinct() {
        let tokens: HashSet<String> = (0..256).map(|_| generate_token()).collect();
        assert_eq!(tokens.len(), 256);
        assert!(tokens.iter().all(|token| is_well_formed(token)));
        assert!(tokens.iter().all(|token| token.len() == 43));
    }

    #[test]
    fn digest_matches_only_the_exact_token() {
        let token = generate_token();
        let stored = token_digest(&token).to_hex().to_string();

        assert!(digest_matches(&stored, &token_digest(&token)));
        assert!(!digest_matches(&stored, &token_digest(&token[..42])));
        assert!(!digest_matches(&stored, &token_digest(&generate_token())));
        assert!(!digest_matches("not-hex", &token_digest(&token)));
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(!is_well_formed(""));
        assert!(!is_well_formed("short"));
        assert!(!is_well_formed(&"+".repeat(TOKEN_LEN)));
    }
}
