//! Bounded, inline tag strings.
//!
//! A [`BoundedTag`] holds at most `N - 1` bytes of UTF-8 so that its fixed-width
//! encoding always carries a NUL terminator. Longer inputs are silently truncated
//! at the last character boundary that fits; this is the only place truncation happens.

use core::{
    fmt::{self, Debug, Display},
    marker::PhantomData,
    ops::Deref,
};

use serde::{
    de::{self, SeqAccess, Visitor},
    ser::SerializeTuple,
    Deserialize, Deserializer, Serialize, Serializer,
};

/// A tag string stored inline in `N` bytes.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundedTag<const N: usize> {
    len: usize,
    bytes: [u8; N],
}

impl<const N: usize> BoundedTag<N> {
    /// The number of bytes a tag can hold, excluding the terminator.
    pub const CAPACITY: usize = N - 1;

    /// The empty tag.
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            len: 0,
            bytes: [0; N],
        }
    }

    /// Create a new tag from `s`, truncating it if it does not fit.
    #[must_use]
    pub fn new(s: &str) -> Self {
        let mut tag = Self::empty();
        tag.set(s);
        tag
    }

    /// Replace the contents of this tag, truncating if needed.
    pub fn set(&mut self, s: &str) {
        let len = floor_char_boundary(s, Self::CAPACITY);
        self.bytes[..len].copy_from_slice(&s.as_bytes()[..len]);
        self.bytes[len..].fill(0);
        self.len = len;
    }

    /// Build a tag from a NUL-padded byte buffer, as found in fixed-width encodings.
    ///
    /// Invalid UTF-8 is replaced, everything after the first NUL is ignored.
    #[must_use]
    pub fn from_nul_padded(raw: &[u8]) -> Self {
        let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
        Self::new(&String::from_utf8_lossy(&raw[..end]))
    }

    /// The tag as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        core::str::from_utf8(&self.bytes[..self.len]).unwrap_or_default()
    }

    /// The raw, NUL-padded buffer.
    #[must_use]
    pub fn as_padded_bytes(&self) -> &[u8; N] {
        &self.bytes
    }

    /// Returns `true` if the tag holds no text.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Length in bytes.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }
}

/// Largest index `<= max` that lies on a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    if s.len() <= max {
        return s.len();
    }
    let mut idx = max;
    while !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

impl<const N: usize> Default for BoundedTag<N> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<const N: usize> Deref for BoundedTag<N> {
    type Target = str;

    fn deref(&self) -> &str {
        self.as_str()
    }
}

impl<const N: usize> AsRef<str> for BoundedTag<N> {
    fn as_ref(&self) -> &str {
        self.as_str()
    }
}

impl<const N: usize> From<&str> for BoundedTag<N> {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl<const N: usize> PartialEq<str> for BoundedTag<N> {
    fn eq(&self, other: &str) -> bool {
        self.as_str() == other
    }
}

impl<const N: usize> PartialEq<&str> for BoundedTag<N> {
    fn eq(&self, other: &&str) -> bool {
        self.as_str() == *other
    }
}

impl<const N: usize> Debug for BoundedTag<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        Debug::fmt(self.as_str(), f)
    }
}

impl<const N: usize> Display for BoundedTag<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed-width serde form of a [`BoundedTag`]: exactly `N` bytes, no length prefix.
///
/// `serde` only derives arrays up to 32 elements, so this goes through a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FixedTag<const N: usize>(pub BoundedTag<N>);

impl<const N: usize> Serialize for FixedTag<N> {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let mut tup = serializer.serialize_tuple(N)?;
        for b in self.0.as_padded_bytes() {
            tup.serialize_element(b)?;
        }
        tup.end()
    }
}

struct FixedTagVisitor<const N: usize>(PhantomData<[u8; N]>);

impl<'de, const N: usize> Visitor<'de> for FixedTagVisitor<N> {
    type Value = FixedTag<N>;

    fn expecting(&self, formatter: &mut fmt::Formatter) -> fmt::Result {
        write!(formatter, "a NUL-padded tag of {N} bytes")
    }

    fn visit_seq<A>(self, mut seq: A) -> Result<Self::Value, A::Error>
    where
        A: SeqAccess<'de>,
    {
        let mut raw = [0_u8; N];
        for (i, slot) in raw.iter_mut().enumerate() {
            *slot = seq
                .next_element()?
                .ok_or_else(|| de::Error::invalid_length(i, &self))?;
        }
        Ok(FixedTag(BoundedTag::from_nul_padded(&raw)))
    }
}

impl<'de, const N: usize> Deserialize<'de> for FixedTag<N> {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        deserializer.deserialize_tuple(N, FixedTagVisitor::<N>(PhantomData))
    }
}

#[cfg(test)]
mod tests {
    use super::{BoundedTag, FixedTag};

    #[test]
    fn test_truncates_at_capacity() {
        let tag = BoundedTag::<8>::new("KernelModule");
        assert_eq!(tag.as_str(), "KernelM");
        assert_eq!(tag.len(), BoundedTag::<8>::CAPACITY);
        assert_eq!(tag.as_padded_bytes()[7], 0);
    }

    #[test]
    fn test_truncates_on_char_boundary() {
        // 'é' is two bytes, it must not be cut in half.
        let tag = BoundedTag::<5>::new("abcé");
        assert_eq!(tag.as_str(), "abc");
    }

    #[test]
    fn test_set_clears_tail() {
        let mut tag = BoundedTag::<16>::new("LongerTagName");
        tag.set("A");
        assert_eq!(tag, "A");
        assert!(tag.as_padded_bytes()[1..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_from_nul_padded() {
        let mut raw = [0_u8; 32];
        raw[..6].copy_from_slice(b"Alloc1");
        raw[8] = b'x';
        let tag = BoundedTag::<128>::from_nul_padded(&raw);
        assert_eq!(tag, "Alloc1");
    }

    #[test]
    fn test_fixed_tag_is_fixed_width() {
        let short = postcard::to_allocvec(&FixedTag(BoundedTag::<32>::new("a"))).unwrap();
        let long = postcard::to_allocvec(&FixedTag(BoundedTag::<32>::new("abcdefghijk"))).unwrap();
        assert_eq!(short.len(), 32);
        assert_eq!(long.len(), 32);

        let back: FixedTag<32> = postcard::from_bytes(&long).unwrap();
        assert_eq!(back.0, "abcdefghijk");
    }
}
