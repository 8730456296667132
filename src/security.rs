//! Хеширование API-токенов и проверка прав.

use rand::distr::{Alphanumeric, SampleString};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256, Sha384, Sha512};
use std::fmt;
use std::str::FromStr;

pub const TOKEN_PREFIX: &str = "vsa_";
const TOKEN_RANDOM_LEN: usize = 48;
const DISPLAY_PREFIX_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HashAlgorithm {
    #[default]
    Sha256,
    Sha384,
    Sha512,
}

impl fmt::Display for HashAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            HashAlgorithm::Sha256 => "sha256",
            HashAlgorithm::Sha384 => "sha384",
            HashAlgorithm::Sha512 => "sha512",
        };
        f.write_str(name)
    }
}

impl FromStr for HashAlgorithm {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "sha256" => Ok(HashAlgorithm::Sha256),
            "sha384" => Ok(HashAlgorithm::Sha384),
            "sha512" => Ok(HashAlgorithm::Sha512),
            other => Err(anyhow::anyhow!("Неизвестный алгоритм хеширования: {}", other)),
        }
    }
}

/// Хеш токена в нижнем hex. Детерминирован для пары (токен, алгоритм).
pub fn hash_api_token(token: &str, algorithm: HashAlgorithm) -> String {
    let bytes = token.trim().as_bytes();
    match algorithm {
        HashAlgorithm::Sha256 => hex::encode(Sha256::digest(bytes)),
        HashAlgorithm::Sha384 => hex::encode(Sha384::digest(bytes)),
        HashAlgorithm::Sha512 => hex::encode(Sha512::digest(bytes)),
    }
}

pub fn generate_api_token() -> String {
    format!(
        "{}{}",
        TOKEN_PREFIX,
        Alphanumeric.sample_string(&mut rand::rng(), TOKEN_RANDOM_LEN)
    )
}

/// Видимая часть токена для списка в админке.
pub fn display_prefix(token: &str) -> String {
    token.chars().take(DISPLAY_PREFIX_LEN).collect()
}

/// `*` даёт всё, `users:*` любые действия над ресурсом, иначе нужно точное совпадение.
pub fn permission_granted(granted: &[String], required: &str) -> bool {
    let (resource, _) = required.split_once(':').unwrap_or((required, ""));
    granted.iter().any(|perm| {
        let perm = perm.trim();
        perm == "*"
            || perm == required
            || perm
                .strip_suffix(":*")
                .is_some_and(|prefix| prefix == resource)
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hashing_is_deterministic_per_algorithm() {
        let token = "vsa_example";
        for algorithm in [HashAlgorithm::Sha256, HashAlgorithm::Sha384, HashAlgorithm::Sha512] {
            assert_eq!(hash_api_token(token, algorithm), hash_api_token(token, algorithm));
        }
    }

    #[test]
    fn algorithms_produce_distinct_digests_of_expected_length() {
        let token = "vsa_example";
        let sha256 = hash_api_token(token, HashAlgorithm::Sha256);
        let sha384 = hash_api_token(token, HashAlgorithm::Sha384);
        let sha512 = hash_api_token(token, HashAlgorithm::Sha512);
        assert_eq!(sha256.len(), 64);
        assert_eq!(sha384.len(), 96);
        assert_eq!(sha512.len(), 128);
        assert!(sha256.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn known_sha256_vector() {
        assert_eq!(
            hash_api_token("abc", HashAlgorithm::Sha256),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }

    #[test]
    fn surrounding_whitespace_is_ignored() {
        assert_eq!(
            hash_api_token("  token\n", HashAlgorithm::Sha256),
            hash_api_token("token", HashAlgorithm::Sha256)
        );
    }

    #[test]
    fn generated_tokens_have_prefix_and_differ() {
        let a = generate_api_token();
        let b = generate_api_token();
        assert!(a.starts_with(TOKEN_PREFIX));
        assert_eq!(a.len(), TOKEN_PREFIX.len() + TOKEN_RANDOM_LEN);
        assert_ne!(a, b);
        assert_eq!(display_prefix(&a).len(), DISPLAY_PREFIX_LEN);
    }

    #[test]
    fn parses_algorithm_names() {
        assert_eq!("SHA384".parse::<HashAlgorithm>().unwrap(), HashAlgorithm::Sha384);
        assert!("md5".parse::<HashAlgorithm>().is_err());
    }

    #[test]
    fn permission_matching() {
        let granted = vec!["users:read".to_string(), "polls:*".to_string()];
        assert!(permission_granted(&granted, "users:read"));
        assert!(!permission_granted(&granted, "users:write"));
        assert!(permission_granted(&granted, "polls:write"));
        assert!(!permission_granted(&granted, "pollsx:write"));
        assert!(permission_granted(&["*".to_string()], "tokens:write"));
        assert!(!permission_granted(&[], "users:read"));
    }
}
