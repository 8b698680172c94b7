//! User ID definition.

use rand::Rng;

use crate::IdError;

/// Characters a user ID may contain.
pub const USER_ID_ALPHABET: &[u8] =
    b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Number of characters in a user ID.
pub const USER_ID_LEN: usize = 5;

/// Short opaque identifier returned alongside a provisioned bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UserId([u8; USER_ID_LEN]);

impl UserId {
    /// Generates a fresh ID from the given random source.
    ///
    /// Each character is drawn uniformly from [`USER_ID_ALPHABET`].
    #[must_use]
    pub fn generate<R: Rng + ?Sized>(rng: &mut R) -> Self {
        let mut bytes = [0u8; USER_ID_LEN];
        for b in &mut bytes {
            *b = USER_ID_ALPHABET[rng.random_range(0..USER_ID_ALPHABET.len())];
        }
        Self(bytes)
    }

    /// Parses an ID from a string.
    pub fn parse(s: &str) -> Result<Self, IdError> {
        if s.is_empty() {
            return Err(IdError::Empty);
        }

        if s.len() != USER_ID_LEN {
            return Err(IdError::InvalidLength {
                expected: USER_ID_LEN,
                actual: s.chars().count(),
            });
        }

        let mut bytes = [0u8; USER_ID_LEN];
        for (slot, c) in bytes.iter_mut().zip(s.chars()) {
            if !c.is_ascii_alphanumeric() {
                return Err(IdError::InvalidCharacter(c));
            }
            *slot = c as u8;
        }

        Ok(Self(bytes))
    }

    /// Returns the ID as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        // Only ASCII alphanumerics are ever stored.
        std::str::from_utf8(&self.0).unwrap_or_default()
    }
}

impl std::fmt::Display for UserId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for UserId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl AsRef<str> for UserId {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl serde::Serialize for UserId {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> serde::Deserialize<'de> for UserId {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        Self::parse(&s).map_err(serde::de::Error::custom)
    }
}

// =============================================================================
// Tests
// =============================================================================
