//! Request fingerprinting
//!
//! Derives the stable cache key root for a [`GenerationRequest`]. Fields are normalized
//! before hashing so that requests differing only in case, surrounding whitespace,
//! Unicode composition or keyword order collide.

use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fmt;
use unicode_normalization::UnicodeNormalization;

use crate::types::{GenerationRequest, StageId};

/// Number of source characters that take part in the hash.
pub const CONTENT_PREFIX_CHARS: usize = 1000;

const KEY_PREFIX: &str = "gen_";
const KEY_HEX_CHARS: usize = 16;

/// Normalized view of the fields that identify a unit of work.
#[derive(Debug, Serialize)]
struct NormalizedFields<'a> {
    product_name: String,
    content_prefix: String,
    keywords: Vec<String>,
    language: String,
    profile: &'a str,
    launch_date: Option<String>,
}

impl<'a> NormalizedFields<'a> {
    fn from_request(request: &'a GenerationRequest) -> Self {
        let mut keywords: Vec<String> = request
            .keywords()
            .iter()
            .map(|k| normalize_text(k))
            .filter(|k| !k.is_empty())
            .collect();
        keywords.sort();
        keywords.dedup();

        Self {
            product_name: normalize_text(request.product_name()),
            content_prefix: request.content().chars().take(CONTENT_PREFIX_CHARS).collect(),
            keywords,
            language: normalize_text(request.language()),
            profile: request.profile().as_str(),
            launch_date: request.launch_date().map(|d| d.to_string()),
        }
    }
}

/// NFC-normalized, lowercased text with whitespace runs collapsed to one space.
pub fn normalize_text(value: &str) -> String {
    value
        .nfc()
        .collect::<String>()
        .to_lowercase()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// SHA-256 fingerprint of a request's normalized fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Fingerprint([u8; 32]);

impl Fingerprint {
    pub fn of(request: &GenerationRequest) -> Self {
        let fields = NormalizedFields::from_request(request);
        // Serializing a derived struct of Strings cannot fail.
        let encoded = serde_json::to_vec(&fields).unwrap_or_default();
        let digest = Sha256::digest(&encoded);
        let mut bytes = [0u8; 32];
        bytes.copy_from_slice(&digest);
        Fingerprint(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Whole-result cache key: `gen_` followed by the first 16 hex characters.
    pub fn generation_key(&self) -> String {
        let hex = self.to_hex();
        format!("{}{}", KEY_PREFIX, &hex[..KEY_HEX_CHARS])
    }

    /// Stage cache key: `<generation key>_<stage id>`.
    pub fn stage_key(&self, stage: StageId) -> String {
        format!("{}_{}", self.generation_key(), stage.as_str())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.generation_key())
    }
}
