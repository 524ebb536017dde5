//! Containers for secret material that is wiped on drop.
//!
//! Neither container prints its contents: `Debug` shows only the length, so a
//! stray `{:?}` in a log line cannot leak key bytes.

use std::fmt;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// A 32-byte secret value that is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveBytes32([u8; 32]);

impl SensitiveBytes32 {
    pub fn new(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        let bytes: [u8; 32] = slice.try_into().ok()?;
        Some(Self(bytes))
    }

    /// True if every byte is zero.
    pub fn is_zero(&self) -> bool {
        self.0.iter().fold(0u8, |acc, b| acc | b) == 0
    }
}

impl AsRef<[u8]> for SensitiveBytes32 {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SensitiveBytes32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SensitiveBytes32([REDACTED; 32])")
    }
}

/// A variable-length secret buffer that is zeroized when dropped.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SensitiveVec(Vec<u8>);

impl SensitiveVec {
    pub fn new(data: Vec<u8>) -> Self {
        Self(data)
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl AsRef<[u8]> for SensitiveVec {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Debug for SensitiveVec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SensitiveVec([REDACTED; {}])", self.0.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_debug_is_redacted() {
        let secret = SensitiveBytes32::new([0xAB; 32]);
        let rendered = format!("{:?}", secret);
        assert!(!rendered.contains("ab"));
        assert!(!rendered.contains("171"));
        assert!(rendered.contains("REDACTED"));

        let buf = SensitiveVec::new(vec![7u8; 5]);
        assert_eq!(format!("{:?}", buf), "SensitiveVec([REDACTED; 5])");
    }

    #[test]
    fn test_from_slice_length() {
        assert!(SensitiveBytes32::from_slice(&[1u8; 31]).is_none());
        assert!(SensitiveBytes32::from_slice(&[1u8; 32]).is_some());
    }

    #[test]
    fn test_is_zero() {
        assert!(SensitiveBytes32::new([0u8; 32]).is_zero());
        let mut bytes = [0u8; 32];
        bytes[31] = 1;
        assert!(!SensitiveBytes32::new(bytes).is_zero());
    }
}
