//! Core domain model and content fingerprinting for the HC4 downloader.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset};
use md5::{Digest, Md5};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hc4-core";

/// Collection language, keyed by its ISO 639-3 code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Language {
    #[serde(rename = "zho")]
    Chinese,
    #[serde(rename = "rus")]
    Russian,
    #[serde(rename = "fas")]
    Persian,
}

impl Language {
    pub const ALL: [Language; 3] = [Language::Chinese, Language::Russian, Language::Persian];

    pub fn code(self) -> &'static str {
        match self {
            Language::Chinese => "zho",
            Language::Russian => "rus",
            Language::Persian => "fas",
        }
    }

    pub fn display_name(self) -> &'static str {
        match self {
            Language::Chinese => "Chinese",
            Language::Russian => "Russian",
            Language::Persian => "Persian",
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.code())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("unknown language code `{0}`")]
pub struct UnknownLanguage(pub String);

impl FromStr for Language {
    type Err = UnknownLanguage;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Language::ALL
            .into_iter()
            .find(|lang| lang.code().eq_ignore_ascii_case(s.trim()))
            .ok_or_else(|| UnknownLanguage(s.to_string()))
    }
}

/// One line of a per-language id manifest, tagged with the language whose
/// manifest it came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub document_id: String,
    pub source_archive: String,
    pub expected_fingerprint: String,
    pub language: Language,
}

/// Article recovered from one archive record. Serialized as one line of a
/// per-language log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractedDocument {
    pub id: String,
    #[serde(rename = "cc_file")]
    pub source_archive: String,
    pub time: Option<DateTime<FixedOffset>>,
    pub title: String,
    pub text: String,
    pub url: String,
}

impl ExtractedDocument {
    pub fn fingerprint(&self) -> String {
        fingerprint(&self.title, &self.text)
    }
}

/// Content fingerprint over trimmed title + trimmed text (hex MD5).
///
/// Historical manifests store exactly this digest, so the normalization must
/// never change.
pub fn fingerprint(title: &str, text: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(strip_edges(title).as_bytes());
    hasher.update(strip_edges(text).as_bytes());
    hex::encode(hasher.finalize())
}

/// Unicode whitespace plus the ASCII separators U+001C..=U+001F, the set the
/// stored digests were trimmed with.
fn strip_edges(value: &str) -> &str {
    value.trim_matches(|c: char| c.is_whitespace() || ('\u{1c}'..='\u{1f}').contains(&c))
}
