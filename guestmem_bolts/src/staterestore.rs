//! Stores and restores subsystem state as a flat stream of named, versioned sections.
//!
//! Every section starts with a [`SectionHeader`] and is followed by `postcard`-encoded
//! values. Readers check the name, then branch on the stored version to decode older layouts.

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::Error;

/// The header written in front of every section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SectionHeader {
    /// The section name, checked on read
    pub name: String,
    /// The layout version the section was written with
    pub version: u8,
}

/// Serializes sections into a growing buffer.
#[derive(Debug, Default)]
pub struct StateWriter {
    buf: Vec<u8>,
}

impl StateWriter {
    /// Create an empty [`StateWriter`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Start a new section.
    pub fn section(&mut self, name: &str, version: u8) -> Result<(), Error> {
        self.write(&SectionHeader {
            name: name.into(),
            version,
        })
    }

    /// Append one value.
    pub fn write<T>(&mut self, value: &T) -> Result<(), Error>
    where
        T: Serialize + ?Sized,
    {
        let encoded = postcard::to_allocvec(value)?;
        self.buf.extend_from_slice(&encoded);
        Ok(())
    }

    /// The number of bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.buf.len()
    }

    /// Returns `true` if nothing was written yet.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Finish writing and hand out the buffer.
    #[must_use]
    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }
}

/// Reads sections back from a buffer produced by a [`StateWriter`].
#[derive(Debug)]
pub struct StateReader<'a> {
    buf: &'a [u8],
}

impl<'a> StateReader<'a> {
    /// Create a new [`StateReader`] over `buf`.
    #[must_use]
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    /// Enter the section called `name`, returning its version.
    ///
    /// Fails with [`Error::InvalidSnapshot`] if the name differs or the version
    /// is outside `min_version..=max_version`.
    pub fn section(&mut self, name: &str, min_version: u8, max_version: u8) -> Result<u8, Error> {
        let header: SectionHeader = self.read().map_err(|err| {
            Error::invalid_snapshot(format!("missing section header for `{name}`: {err}"))
        })?;
        if header.name != name {
            return Err(Error::invalid_snapshot(format!(
                "expected section `{name}`, found `{}`",
                header.name
            )));
        }
        if header.version < min_version || header.version > max_version {
            return Err(Error::invalid_snapshot(format!(
                "section `{name}` has version {}, supported are {min_version}..={max_version}",
                header.version
            )));
        }
        Ok(header.version)
    }

    /// Read one value.
    pub fn read<T>(&mut self) -> Result<T, Error>
    where
        T: DeserializeOwned,
    {
        let (value, rest) = postcard::take_from_bytes::<T>(self.buf)?;
        self.buf = rest;
        Ok(value)
    }

    /// Bytes not consumed yet.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.buf.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{StateReader, StateWriter};
    use crate::Error;

    #[test]
    fn test_sections_roundtrip() {
        let mut writer = StateWriter::new();
        writer.section("Outer", 2).unwrap();
        writer.write(&3_i32).unwrap();
        writer.write(&0x0880_0000_u32).unwrap();
        let bytes = writer.into_bytes();

        let mut reader = StateReader::new(&bytes);
        assert_eq!(reader.section("Outer", 1, 2).unwrap(), 2);
        assert_eq!(reader.read::<i32>().unwrap(), 3);
        assert_eq!(reader.read::<u32>().unwrap(), 0x0880_0000);
        assert_eq!(reader.remaining(), 0);
    }

    #[test]
    fn test_wrong_name_or_version() {
        let mut writer = StateWriter::new();
        writer.section("Block", 4).unwrap();
        let bytes = writer.into_bytes();

        let err = StateReader::new(&bytes).section("Slab", 1, 4).unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(..)));
        let err = StateReader::new(&bytes).section("Block", 1, 3).unwrap_err();
        assert!(matches!(err, Error::InvalidSnapshot(..)));
    }

    #[test]
    fn test_truncated() {
        let mut reader = StateReader::new(&[]);
        assert!(reader.read::<u64>().is_err());
    }
}
