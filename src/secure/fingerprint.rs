//! Certificate fingerprints used to identify peers.

use crate::error::Error;
use ring::digest::{digest, SHA256, SHA256_OUTPUT_LEN};
use rustls::pki_types::CertificateDer;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// SHA-256 digest of a DER-encoded certificate.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; SHA256_OUTPUT_LEN]);

impl Fingerprint {
    pub const SEPARATOR: char = ':';

    pub fn from_bytes(bytes: [u8; SHA256_OUTPUT_LEN]) -> Self {
        Self(bytes)
    }

    /// Fingerprint of a DER certificate.
    pub fn of_certificate(cert: &CertificateDer<'_>) -> Self {
        Self::of_der(cert.as_ref())
    }

    pub fn of_der(der: &[u8]) -> Self {
        let hash = digest(&SHA256, der);
        let mut bytes = [0u8; SHA256_OUTPUT_LEN];
        bytes.copy_from_slice(hash.as_ref());
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Upper-case hex, bytes joined by `separator` if given.
    pub fn format(&self, separator: Option<char>) -> String {
        let mut out = String::with_capacity(self.0.len() * 3);
        for (i, byte) in self.0.iter().enumerate() {
            if i > 0 {
                if let Some(separator) = separator {
                    out.push(separator);
                }
            }
            out.push_str(&format!("{byte:02X}"));
        }
        out
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format(Some(Self::SEPARATOR)))
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({self})")
    }
}

/// Accepts hex in either case, with or without `:` (or space, `-`)
/// separators between bytes.
impl FromStr for Fingerprint {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits: Vec<u8> = s
            .bytes()
            .filter(|b| !matches!(b, b':' | b' ' | b'-'))
            .collect();
        if digits.len() != SHA256_OUTPUT_LEN * 2 {
            return Err(Error::InvalidFingerprint(s.to_string()));
        }

        let mut bytes = [0u8; SHA256_OUTPUT_LEN];
        for (byte, pair) in bytes.iter_mut().zip(digits.chunks(2)) {
            let hi = hex_value(pair[0]).ok_or_else(|| Error::InvalidFingerprint(s.to_string()))?;
            let lo = hex_value(pair[1]).ok_or_else(|| Error::InvalidFingerprint(s.to_string()))?;
            *byte = (hi << 4) | lo;
        }
        Ok(Self(bytes))
    }
}

fn hex_value(digit: u8) -> Option<u8> {
    match digit {
        b'0'..=b'9' => Some(digit - b'0'),
        b'a'..=b'f' => Some(digit - b'a' + 10),
        b'A'..=b'F' => Some(digit - b'A' + 10),
        _ => None,
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_upper_case_with_separator() {
        let fp = Fingerprint::from_bytes([0xab; SHA256_OUTPUT_LEN]);
        let text = fp.to_string();
        assert!(text.starts_with("AB:AB:"));
        assert_eq!(text.len(), SHA256_OUTPUT_LEN * 3 - 1);
        assert_eq!(fp.format(None), "AB".repeat(SHA256_OUTPUT_LEN));
        assert!(fp.format(Some('-')).contains("AB-AB"));
    }

    #[test]
    fn parses_any_case_and_separator() {
        let fp = Fingerprint::of_der(b"certificate bytes");
        let lower = fp.format(None).to_lowercase();
        assert_eq!(lower.parse::<Fingerprint>().unwrap(), fp);
        assert_eq!(fp.to_string().parse::<Fingerprint>().unwrap(), fp);
    }

    #[test]
    fn rejects_wrong_length_and_non_hex() {
        assert!("AB:CD".parse::<Fingerprint>().is_err());
        let not_hex = "ZZ".repeat(SHA256_OUTPUT_LEN);
        assert!(matches!(
            not_hex.parse::<Fingerprint>(),
            Err(Error::InvalidFingerprint(_))
        ));
    }

    #[test]
    fn digest_is_sha256() {
        // SHA-256 of the empty input
        let fp = Fingerprint::of_der(b"");
        assert!(fp.format(None).starts_with("E3B0C44298FC1C14"));
    }
}
