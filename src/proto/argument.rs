//! Argument decomposition for incoming frames.
//!
//! Helper to decompose a payload byte slice into typed structures and
//! NUL-terminated names. Fixed-size values are copied out, so the buffer
//! needs no particular alignment.

use zerocopy::FromBytes;

pub(crate) struct ArgumentIterator<'a> {
    data: &'a [u8],
}

impl<'a> ArgumentIterator<'a> {
    /// Create a new argument iterator for the given byte slice.
    pub(crate) fn new(data: &'a [u8]) -> ArgumentIterator<'a> {
        ArgumentIterator { data }
    }

    /// Returns the size of the remaining data.
    pub(crate) fn len(&self) -> usize {
        self.data.len()
    }

    /// Fetch a typed argument. Returns `None` if there's not enough data
    /// left.
    pub(crate) fn fetch<T: FromBytes>(&mut self) -> Option<T> {
        let (value, rest) = T::read_from_prefix(self.data).ok()?;
        self.data = rest;
        Some(value)
    }

    /// Fetch a NUL-terminated UTF-8 string. Returns `None` if no
    /// terminator is found or the bytes are not valid UTF-8.
    pub(crate) fn fetch_str(&mut self) -> Option<&'a str> {
        let len = memchr::memchr(0, self.data)?;
        let (out, rest) = self.data.split_at(len);
        self.data = &rest[1..];
        std::str::from_utf8(out).ok()
    }
}
