//! Language tag matching across ISO 639 standards.
//!
//! Media containers mix ISO 639-1 (`de`), 639-2/T (`deu`) and 639-2/B
//! (`ger`) freely, so every comparison in the policy layer goes through
//! [`languages_match`], which is symmetric and alias-aware.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::job::StatusParseError;

/// Preferred display form for language codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LanguageStandard {
    /// Two-letter codes (`de`).
    Iso639_1,
    /// Terminological three-letter codes (`deu`).
    #[default]
    Iso639_2T,
    /// Bibliographic three-letter codes (`ger`).
    Iso639_2B,
}

impl FromStr for LanguageStandard {
    type Err = StatusParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "iso639-1" | "iso639_1" | "639-1" => Ok(Self::Iso639_1),
            "iso639-2t" | "iso639_2t" | "639-2t" | "639-2" => Ok(Self::Iso639_2T),
            "iso639-2b" | "iso639_2b" | "639-2b" => Ok(Self::Iso639_2B),
            other => Err(StatusParseError::new("language standard", other)),
        }
    }
}

impl fmt::Display for LanguageStandard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Iso639_1 => "iso639-1",
            Self::Iso639_2T => "iso639-2t",
            Self::Iso639_2B => "iso639-2b",
        };
        f.write_str(s)
    }
}

/// (639-1, 639-2/T, 639-2/B) triples for the languages that actually show up
/// in media libraries. 639-2/B is empty where it equals the /T form.
const LANGUAGE_TABLE: &[(&str, &str, &str)] = &[
    ("en", "eng", ""),
    ("de", "deu", "ger"),
    ("fr", "fra", "fre"),
    ("es", "spa", ""),
    ("it", "ita", ""),
    ("ja", "jpn", ""),
    ("zh", "zho", "chi"),
    ("ko", "kor", ""),
    ("ru", "rus", ""),
    ("pt", "por", ""),
    ("nl", "nld", "dut"),
    ("pl", "pol", ""),
    ("sv", "swe", ""),
    ("no", "nor", ""),
    ("da", "dan", ""),
    ("fi", "fin", ""),
    ("cs", "ces", "cze"),
    ("hu", "hun", ""),
    ("tr", "tur", ""),
    ("ar", "ara", ""),
    ("he", "heb", ""),
    ("hi", "hin", ""),
    ("th", "tha", ""),
    ("vi", "vie", ""),
    ("uk", "ukr", ""),
    ("ro", "ron", "rum"),
    ("el", "ell", "gre"),
    ("", "und", ""),
];

/// Map any known alias to the 639-2/T form, or return the lowercased input
/// unchanged if the code is not in the table.
pub fn canonical_language(code: &str) -> String {
    let lowered = code.trim().to_ascii_lowercase();
    for (one, two_t, two_b) in LANGUAGE_TABLE {
        if lowered == *one || lowered == *two_t || lowered == *two_b {
            return (*two_t).to_string();
        }
    }
    lowered
}

/// True when two language tags name the same language under any of the
/// ISO 639-1 / 639-2/T / 639-2/B spellings. Comparison of unknown codes
/// falls back to case-insensitive equality, so the relation stays symmetric
/// and transitive.
pub fn languages_match(a: &str, b: &str) -> bool {
    canonical_language(a) == canonical_language(b)
}

/// Render a code in the requested display standard. Unknown codes pass
/// through unchanged; codes without a distinct form in the requested
/// standard fall back to 639-2/T.
pub fn display_language(code: &str, standard: LanguageStandard) -> String {
    let canonical = canonical_language(code);
    for (one, two_t, two_b) in LANGUAGE_TABLE {
        if canonical == *two_t {
            return match standard {
                LanguageStandard::Iso639_1 if !one.is_empty() => (*one).to_string(),
                LanguageStandard::Iso639_2B if !two_b.is_empty() => (*two_b).to_string(),
                _ => (*two_t).to_string(),
            };
        }
    }
    canonical
}
