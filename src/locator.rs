//! Locators: the opaque `<hex-hash>+<size>[+<hints>...]` tokens that name blocks.

use crate::prelude::*;

/// An opaque, ASCII locator of the form `<hex-hash>+<size>[+<hints>...]`.
///
/// The hash is the canonical identity of the block; the size is its exact
/// byte length; anything after the second `+` is an opaque hint forwarded to
/// the upstream gateway untouched.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Locator {
    raw: String,
    hash_end: usize,
    size_end: usize,
}

impl Locator {
    /// Parse and validate a locator string.
    ///
    /// Validation is deliberately narrow: the hash must be non-empty
    /// lowercase-or-uppercase hex, and the size must be a valid `u64`. Hints
    /// are not interpreted at all.
    pub fn parse(raw: impl Into<String>) -> Result<Locator, CacheError> {
        let raw = raw.into();
        let mut parts = raw.splitn(3, '+');
        let hash = parts.next().unwrap_or("");
        let size = parts.next();

        if hash.is_empty() || !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidLocator {
                locator: raw,
                reason: "missing or non-hex hash".into(),
            });
        }
        let size = match size {
            Some(s) => s,
            None => {
                return Err(CacheError::InvalidLocator {
                    locator: raw,
                    reason: "missing size hint".into(),
                })
            }
        };
        if size.is_empty() || !size.bytes().all(|b| b.is_ascii_digit()) || size.parse::<u64>().is_err() {
            return Err(CacheError::InvalidLocator {
                locator: raw,
                reason: format!("invalid size hint {size:?}"),
            });
        }

        let hash_end = hash.len();
        let size_end = hash_end + 1 + size.len();
        let mut raw = raw;
        raw[..hash_end].make_ascii_lowercase();
        Ok(Locator {
            raw,
            hash_end,
            size_end,
        })
    }

    /// The canonical hex hash, lowercased at construction so it can be used
    /// directly as a path/bucket component.
    pub fn hash(&self) -> &str {
        &self.raw[..self.hash_end]
    }

    /// The block's declared byte length.
    pub fn size(&self) -> u64 {
        self.raw[self.hash_end + 1..self.size_end]
            .parse()
            .expect("validated at construction")
    }

    /// `<hash>+<size>`, with any trailing hints stripped. This is what
    /// appears in the committed file name.
    pub fn hash_and_size(&self) -> &str {
        &self.raw[..self.size_end]
    }

    /// The full locator text, hints included.
    pub fn as_str(&self) -> &str {
        &self.raw
    }

    /// Build a locator from a hash and size, with no hints. Used after a
    /// write commits, to construct the locator for the bytes actually
    /// written (the hash the caller asked for may have been absent).
    pub fn from_hash_and_size(hash: &str, size: u64) -> Locator {
        let mut raw = format!("{hash}+{size}");
        let hash_end = hash.len();
        raw[..hash_end].make_ascii_lowercase();
        let size_end = raw.len();
        Locator {
            raw,
            hash_end,
            size_end,
        }
    }
}

impl std::fmt::Display for Locator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.raw)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn parses_basic_locator() {
        let l = Locator::parse("abc123+16").unwrap();
        assert_eq!(l.hash(), "abc123");
        assert_eq!(l.size(), 16);
        assert_eq!(l.hash_and_size(), "abc123+16");
    }

    #[test]
    fn parses_hints() {
        let l = Locator::parse("abc123+16+A1234@fedcba").unwrap();
        assert_eq!(l.hash(), "abc123");
        assert_eq!(l.size(), 16);
        assert_eq!(l.hash_and_size(), "abc123+16");
        assert_eq!(l.as_str(), "abc123+16+A1234@fedcba");
    }

    #[test]
    fn rejects_missing_size() {
        assert!(Locator::parse("abc123").is_err());
    }

    #[test]
    fn rejects_non_hex_hash() {
        assert!(Locator::parse("not-hex!+16").is_err());
    }

    #[test]
    fn rejects_non_numeric_size() {
        assert!(Locator::parse("abc123+sixteen").is_err());
    }

    #[test]
    fn lowercases_uppercase_hash() {
        let l = Locator::parse("ABC123+16").unwrap();
        assert_eq!(l.hash(), "abc123");
        assert_eq!(l.hash_and_size(), "abc123+16");
        assert_eq!(l.as_str(), "abc123+16");
    }

    #[test]
    fn lowercases_hash_in_hints_preserving_case() {
        let l = Locator::parse("ABC123+16+Hint").unwrap();
        assert_eq!(l.hash(), "abc123");
        assert_eq!(l.as_str(), "abc123+16+Hint");
    }
}
