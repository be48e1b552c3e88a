use std::fmt::Display;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use data_encoding::HEXLOWER;
use hmac::{Hmac, Mac};
use rand::distributions::{Distribution, Uniform};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use thiserror::Error;

use super::ElectionId;

pub const LENGTH: usize = 6;

type HmacSha256 = Hmac<Sha256>;

/// A one-time confirmation code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Code {
    code: [u8; LENGTH],
}

impl Code {
    /// Generate a random code.
    pub fn random() -> Self {
        let mut code = [0; LENGTH];
        let digit_dist = Uniform::from(0..=9);
        let mut rng = rand::thread_rng();
        for digit in &mut code {
            *digit = digit_dist.sample(&mut rng);
        }
        Self { code }
    }

    /// Keyed digest of this code for the given election. Codes are only ever
    /// stored in this form.
    pub fn digest(&self, election: ElectionId, secret: &[u8]) -> String {
        HEXLOWER.encode(&Self::mac(&self.code, election, secret).finalize().into_bytes())
    }

    /// Constant-time check of this code against a stored digest.
    pub fn matches(&self, election: ElectionId, secret: &[u8], digest: &str) -> bool {
        let Ok(expected) = HEXLOWER.decode(digest.as_bytes()) else {
            return false;
        };
        Self::mac(&self.code, election, secret)
            .verify_slice(&expected)
            .is_ok()
    }

    fn mac(code: &[u8; LENGTH], election: ElectionId, secret: &[u8]) -> HmacSha256 {
        // HMAC accepts keys of any length.
        let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC takes any key length");
        mac.update(&election.0.to_be_bytes());
        mac.update(code);
        mac
    }
}

impl Display for Code {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for digit in self.code {
            write!(formatter, "{digit}")?;
        }
        Ok(())
    }
}

impl FromStr for Code {
    type Err = ParseError;

    fn from_str(string: &str) -> Result<Self, Self::Err> {
        let len = string.chars().count();
        if len != LENGTH {
            return Err(Self::Err::InvalidLength(len));
        }
        let mut code = [0; LENGTH];
        for (digit, c) in code.iter_mut().zip(string.chars()) {
            *digit = c.to_digit(10).ok_or(Self::Err::InvalidChar(c))? as u8;
        }
        Ok(Self { code })
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum ParseError {
    #[error("code must contain exactly 6 characters")]
    InvalidLength(usize),
    #[error("code must contain only digits")]
    InvalidChar(char),
}

/// An issued reset confirmation code, as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetCode {
    pub election_id: ElectionId,
    pub issued_to: String,
    pub code_digest: String,
    pub expire_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_and_display() {
        let code: Code = "012345".parse().unwrap();
        assert_eq!(code.to_string(), "012345");
        assert_eq!("12345".parse::<Code>(), Err(ParseError::InvalidLength(5)));
        assert_eq!("12a456".parse::<Code>(), Err(ParseError::InvalidChar('a')));
    }

    #[test]
    fn random_codes_are_digits() {
        for _ in 0..20 {
            let code = Code::random().to_string();
            assert_eq!(code.len(), LENGTH);
            assert!(code.chars().all(|c| c.is_ascii_digit()));
        }
    }

    #[test]
    fn digest_is_bound_to_election_and_secret() {
        let code: Code = "424242".parse().unwrap();
        let digest = code.digest(ElectionId(1), b"secret");

        assert!(code.matches(ElectionId(1), b"secret", &digest));
        assert!(!code.matches(ElectionId(2), b"secret", &digest));
        assert!(!code.matches(ElectionId(1), b"other", &digest));
        assert!(!"424243"
            .parse::<Code>()
            .unwrap()
            .matches(ElectionId(1), b"secret", &digest));
        assert!(!code.matches(ElectionId(1), b"secret", "not hex"));
    }
}
