//! Peer nickname validation.
//!
//! A nick is `prefix + version + hash + padding`, e.g. `J5` followed by ten
//! base58 characters and `O` padding up to sixteen characters. The pad
//! character sits outside the base58 alphabet, so the hash/pad boundary is
//! unambiguous. Key derivation happens elsewhere; only the shape is checked
//! here.

use rand::Rng;

/// Bitcoin base58 alphabet (no `0`, `O`, `I`, `l`).
pub const BASE58_ALPHABET: &str = "123456789ABCDEFGHJKLMNPQRSTUVWXYZabcdefghijkmnopqrstuvwxyz";

/// Why a string is not a nick. Variants follow the order checks run in.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum NickError {
    #[error("nick must start with {expected:?}")]
    BadPrefix { expected: String },
    #[error("hash segment must be {expected} base58 characters")]
    BadHash { expected: usize },
    #[error("nick must be {expected} characters long, got {actual}")]
    BadLength { expected: usize, actual: usize },
    #[error("padding must consist of {pad:?} only")]
    BadPadding { pad: char },
    #[error("nick is empty or contains a reserved character")]
    Reserved,
}

/// The nick shape accepted by the directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NickFormat {
    pub prefix: String,
    pub version: char,
    pub hash_len: usize,
    pub pad: char,
    pub total_len: usize,
}

impl Default for NickFormat {
    fn default() -> Self {
        Self {
            prefix: "J".into(),
            version: '5',
            hash_len: 10,
            pad: 'O',
            total_len: 16,
        }
    }
}

impl NickFormat {
    /// `prefix + version`, e.g. `"J5"`.
    pub fn header(&self) -> String {
        format!("{}{}", self.prefix, self.version)
    }

    /// Check `s` against this format. Checks run in a fixed order: header,
    /// hash segment, total length, padding.
    pub fn validate(&self, s: &str) -> Result<(), NickError> {
        let header = self.header();
        let Some(rest) = s.strip_prefix(header.as_str()) else {
            return Err(NickError::BadPrefix { expected: header });
        };

        let hash: Vec<char> = rest.chars().take(self.hash_len).collect();
        if hash.len() != self.hash_len || !hash.iter().all(|c| BASE58_ALPHABET.contains(*c)) {
            return Err(NickError::BadHash {
                expected: self.hash_len,
            });
        }

        let actual = s.chars().count();
        if actual != self.total_len {
            return Err(NickError::BadLength {
                expected: self.total_len,
                actual,
            });
        }

        if !rest.chars().skip(self.hash_len).all(|c| c == self.pad) {
            return Err(NickError::BadPadding { pad: self.pad });
        }

        Ok(())
    }

    pub fn is_valid(&self, s: &str) -> bool {
        self.validate(s).is_ok()
    }

    /// Build a nick from a hash segment, padding it to the full length.
    pub fn compose(&self, hash: &str) -> String {
        let mut nick = self.header();
        nick.push_str(hash);
        while nick.chars().count() < self.total_len {
            nick.push(self.pad);
        }
        nick
    }

    /// A nick with a random hash segment. Used by clients that have no
    /// derived nick of their own (the orderbook watcher).
    pub fn random(&self) -> String {
        let alphabet: Vec<char> = BASE58_ALPHABET.chars().collect();
        let mut rng = rand::thread_rng();
        let hash: String = (0..self.hash_len)
            .map(|_| alphabet[rng.gen_range(0..alphabet.len())])
            .collect();
        self.compose(&hash)
    }
}

/// Validate against the default format.
pub fn is_valid_nick(s: &str) -> bool {
    NickFormat::default().is_valid(s)
}

/// Minimal check applied when strict validation is off: the nick must still
/// be usable as a line field and a peer-list key.
pub fn validate_loose(s: &str) -> Result<(), NickError> {
    if s.is_empty()
        || s == crate::directory::line::PUBLIC
        || s.chars().any(|c| matches!(c, '!' | ';' | ',') || c.is_whitespace())
    {
        return Err(NickError::Reserved);
    }
    Ok(())
}
