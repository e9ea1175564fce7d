//! Heap-allocated ("long") strings, addressed through `Value`'s string tag.
//!
//! Short strings (<=6 ASCII bytes) never reach this module — they live
//! packed inline inside the `Value` word itself (see `value.rs`). Everything
//! longer, or containing non-ASCII bytes, is boxed here and reached through
//! the VM's interning table so equal content always produces the same
//! `Value` word (`hamt.rs`'s `get_string`).
//!
//! Grounded on `original_source/object.h`'s flexible-array-member `String`
//! struct (`length`, cached `hash`, inline `chars`) and on
//! `crates/runtime/src/seqstring.rs`'s content-based `PartialEq`.

use std::fmt;

/// A heap string: owned bytes plus a cached FNV-1a hash used both for HAMT
/// lookups and as a fast pre-check before the full byte comparison.
pub struct GlintString {
    bytes: Box<[u8]>,
    pub hash: u32,
}

/// FNV-1a, 32-bit, matching the hash the original's `hamt_get_string` uses
/// to key the string-interning table.
pub fn fnv1a_hash(bytes: &[u8]) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c_9dc5;
    const PRIME: u32 = 0x0100_0193;
    let mut hash = OFFSET_BASIS;
    for &b in bytes {
        hash ^= b as u32;
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

impl GlintString {
    pub fn new(bytes: Vec<u8>) -> Self {
        let hash = fnv1a_hash(&bytes);
        GlintString {
            bytes: bytes.into_boxed_slice(),
            hash,
        }
    }

    pub fn from_str(s: &str) -> Self {
        Self::new(s.as_bytes().to_vec())
    }

    pub fn as_str(&self) -> &str {
        // Glint source is required to be valid UTF-8 (see the lexer); bytes
        // produced by concatenation/repetition of valid strings stay valid.
        std::str::from_utf8(&self.bytes).expect("GlintString bytes are valid UTF-8")
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// True byte-for-byte equality, used by the interning table to detect a
    /// true duplicate versus a hash collision.
    pub fn content_eq(&self, other: &GlintString) -> bool {
        self.hash == other.hash && self.bytes == other.bytes
    }
}

impl fmt::Debug for GlintString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "GlintString({:?})", self.as_str())
    }
}

/// `a * b`: string concatenation, or string-times-number repetition — the
/// dual meaning `op_multiply` gives the `*` operator over strings.
pub fn concatenate(a: &str, b: &str) -> GlintString {
    let mut bytes = Vec::with_capacity(a.len() + b.len());
    bytes.extend_from_slice(a.as_bytes());
    bytes.extend_from_slice(b.as_bytes());
    GlintString::new(bytes)
}

/// `s ** n`: repeat `s` `n` times (`n` truncated towards zero; `n <= 0`
/// yields the empty string), the meaning `op_exponent` gives `**` over a
/// string left-hand side.
pub fn repeat(s: &str, n: f64) -> GlintString {
    if n <= 0.0 {
        return GlintString::new(Vec::new());
    }
    let count = n.trunc() as usize;
    GlintString::new(s.as_bytes().repeat(count))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable() {
        let a = GlintString::from_str("hello world");
        let b = GlintString::from_str("hello world");
        assert_eq!(a.hash, b.hash);
        assert!(a.content_eq(&b));
    }

    #[test]
    fn different_content_usually_differs() {
        let a = GlintString::from_str("abc");
        let b = GlintString::from_str("abd");
        assert!(!a.content_eq(&b));
    }

    #[test]
    fn concatenate_joins_bytes() {
        let s = concatenate("foo", "bar");
        assert_eq!(s.as_str(), "foobar");
    }

    #[test]
    fn repeat_multiplies_and_truncates() {
        assert_eq!(repeat("ab", 3.0).as_str(), "ababab");
        assert_eq!(repeat("ab", 2.9).as_str(), "abab");
        assert_eq!(repeat("ab", 0.0).as_str(), "");
        assert_eq!(repeat("ab", -1.0).as_str(), "");
    }
}
