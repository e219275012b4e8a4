//! Locale codes for localized text.
//!
//! Each supported ISO 639-1 code maps to a stable one-byte id; 0 means
//! "no locale" (all locales when reading).

use lazy_static::lazy_static;
use rustc_hash::FxHashMap;

/// Wire id meaning "no locale".
pub const NO_LOCALE: u8 = 0;

// Append only: the position is the wire id.
const CODES: &[&str] = &[
    "aa", "ab", "af", "ak", "am", "ar", "as", "az", "be", "bg", "bn", "bo", "bs", "ca", "cs",
    "cy", "da", "de", "el", "en", "eo", "es", "et", "eu", "fa", "fi", "fo", "fr", "ga", "gd",
    "gl", "gu", "he", "hi", "hr", "hu", "hy", "id", "is", "it", "ja", "ka", "kk", "km", "kn",
    "ko", "ku", "ky", "la", "lb", "lo", "lt", "lv", "mi", "mk", "ml", "mn", "mr", "ms", "mt",
    "my", "nb", "ne", "nl", "nn", "no", "pa", "pl", "ps", "pt", "ro", "ru", "sa", "sk", "sl",
    "so", "sq", "sr", "sv", "sw", "ta", "te", "tg", "th", "tk", "tl", "tr", "uk", "ur", "uz",
    "vi", "xh", "yi", "yo", "zh", "zu",
];

lazy_static! {
    static ref CODE_IDS: FxHashMap<&'static str, u8> = CODES
        .iter()
        .enumerate()
        .map(|(i, code)| (*code, (i + 1) as u8))
        .collect();
}

/// Returns the wire id of a locale code.
pub fn locale_id(code: &str) -> Option<u8> {
    CODE_IDS.get(code).copied()
}

/// Returns the locale code of a wire id.
pub fn locale_code(id: u8) -> Option<&'static str> {
    if id == NO_LOCALE {
        return None;
    }
    CODES.get(id as usize - 1).copied()
}

/// A locale enabled in a schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Locale {
    pub code: String,
    pub id: u8,
    /// Wire ids tried in order when this locale has no value.
    pub fallback: Vec<u8>,
    pub required: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_locale_roundtrip() {
        for code in CODES {
            let id = locale_id(code).unwrap();
            assert_ne!(id, NO_LOCALE);
            assert_eq!(locale_code(id), Some(*code));
        }
        assert_eq!(locale_id("xx"), None);
        assert_eq!(locale_code(NO_LOCALE), None);
    }
}
