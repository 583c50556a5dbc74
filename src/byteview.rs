/*
 * This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 */
//! Bounds-checked views over the working buffer.
//!
//! Unlike the emulator this crate is descended from, there is no 4GiB
//! reserved address space here: the working buffer is an ordinary growable
//! `Vec<u8>` representing the kernel collection file on disk (and, by
//! extension, its in-memory layout once the bootloader maps it 1:1). What
//! survives from the ancestor design is the *shape* of the accessors: every
//! read or write goes through a narrow set of bounds-checked helpers so that
/// a malformed offset anywhere in the nine components turns into an
/// [crate::error::Error::InputMalformed] or
/// [crate::error::Error::Overflow], never a panic or a silent
/// out-of-bounds read.
use crate::error::{Error, Result};

/// A read-only view into a byte buffer, carrying the offset it was taken at
/// so error messages can report a useful location.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    bytes: &'a [u8],
    base_offset: usize,
}

impl<'a> ByteView<'a> {
    pub fn new(bytes: &'a [u8]) -> Self {
        ByteView { bytes, base_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &'a [u8] {
        self.bytes
    }

    /// Absolute offset (in the original buffer) of byte 0 of this view.
    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    /// Take a sub-view `[offset, offset+len)`, bounds-checked.
    pub fn slice(&self, operation: &'static str, offset: usize, len: usize) -> Result<ByteView<'a>> {
        let end = offset.checked_add(len).ok_or(Error::Overflow {
            operation,
            offset: (self.base_offset + offset) as u64,
        })?;
        let bytes = self.bytes.get(offset..end).ok_or_else(|| Error::InputMalformed {
            operation,
            detail: format!(
                "range {:#x}..{:#x} out of bounds (buffer is {:#x} bytes)",
                offset, end, self.bytes.len()
            ),
        })?;
        Ok(ByteView { bytes, base_offset: self.base_offset + offset })
    }

    pub fn read_u8(&self, operation: &'static str, offset: usize) -> Result<u8> {
        Ok(self.slice(operation, offset, 1)?.bytes[0])
    }

    pub fn read_u16_le(&self, operation: &'static str, offset: usize) -> Result<u16> {
        let s = self.slice(operation, offset, 2)?;
        Ok(u16::from_le_bytes(s.bytes.try_into().unwrap()))
    }

    pub fn read_u32_le(&self, operation: &'static str, offset: usize) -> Result<u32> {
        let s = self.slice(operation, offset, 4)?;
        Ok(u32::from_le_bytes(s.bytes.try_into().unwrap()))
    }

    pub fn read_u64_le(&self, operation: &'static str, offset: usize) -> Result<u64> {
        let s = self.slice(operation, offset, 8)?;
        Ok(u64::from_le_bytes(s.bytes.try_into().unwrap()))
    }

    pub fn read_cstr(&self, operation: &'static str, offset: usize) -> Result<&'a str> {
        let rest = self.bytes.get(offset..).ok_or_else(|| Error::InputMalformed {
            operation,
            detail: format!("string offset {:#x} out of bounds", offset),
        })?;
        let nul = rest.iter().position(|&b| b == 0).ok_or_else(|| Error::InputMalformed {
            operation,
            detail: "unterminated string".to_string(),
        })?;
        std::str::from_utf8(&rest[..nul]).map_err(|_| Error::InputMalformed {
            operation,
            detail: "string is not valid UTF-8".to_string(),
        })
    }
}

/// A mutable view into the working buffer, for in-place patching.
pub struct ByteViewMut<'a> {
    bytes: &'a mut [u8],
    base_offset: usize,
}

impl<'a> ByteViewMut<'a> {
    pub fn new(bytes: &'a mut [u8]) -> Self {
        ByteViewMut { bytes, base_offset: 0 }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        self.bytes
    }

    pub fn base_offset(&self) -> usize {
        self.base_offset
    }

    pub fn slice_mut(&mut self, operation: &'static str, offset: usize, len: usize) -> Result<&mut [u8]> {
        let end = offset.checked_add(len).ok_or(Error::Overflow {
            operation,
            offset: (self.base_offset + offset) as u64,
        })?;
        self.bytes.get_mut(offset..end).ok_or_else(|| Error::InputMalformed {
            operation,
            detail: format!(
                "range {:#x}..{:#x} out of bounds (buffer is {:#x} bytes)",
                offset, end, self.bytes.len()
            ),
        })
    }

    pub fn write_bytes(&mut self, operation: &'static str, offset: usize, data: &[u8]) -> Result<()> {
        self.slice_mut(operation, offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    pub fn write_u32_le(&mut self, operation: &'static str, offset: usize, value: u32) -> Result<()> {
        self.write_bytes(operation, offset, &value.to_le_bytes())
    }

    pub fn write_u64_le(&mut self, operation: &'static str, offset: usize, value: u64) -> Result<()> {
        self.write_bytes(operation, offset, &value.to_le_bytes())
    }
}

pub mod checksum {
    //! CRC32 (kext catalog entries) and SHA-384 (whole-image digest, as used
    //! by the CLI harness when it reports what it read) helpers.

    pub fn crc32(data: &[u8]) -> u32 {
        crc32fast::hash(data)
    }

    pub fn sha384(data: &[u8]) -> [u8; 48] {
        use sha2::{Digest, Sha384};
        let mut hasher = Sha384::new();
        hasher.update(data);
        let digest = hasher.finalize();
        let mut out = [0u8; 48];
        out.copy_from_slice(&digest);
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_in_bounds() {
        let buf = [1u8, 2, 3, 4, 5, 6, 7, 8];
        let view = ByteView::new(&buf);
        let sub = view.slice("test", 2, 4).unwrap();
        assert_eq!(sub.as_slice(), &[3, 4, 5, 6]);
    }

    #[test]
    fn slice_out_of_bounds_is_malformed() {
        let buf = [1u8, 2, 3];
        let view = ByteView::new(&buf);
        assert!(matches!(view.slice("test", 1, 10), Err(Error::InputMalformed { .. })));
    }

    #[test]
    fn read_u32_round_trip() {
        let buf = 0xdeadbeefu32.to_le_bytes();
        let view = ByteView::new(&buf);
        assert_eq!(view.read_u32_le("test", 0).unwrap(), 0xdeadbeef);
    }

    #[test]
    fn write_then_read() {
        let mut buf = [0u8; 8];
        let mut view = ByteViewMut::new(&mut buf);
        view.write_u32_le("test", 4, 42).unwrap();
        assert_eq!(ByteView::new(&buf).read_u32_le("test", 4).unwrap(), 42);
    }

    #[test]
    fn crc32_is_stable() {
        assert_eq!(checksum::crc32(b"kext"), checksum::crc32(b"kext"));
        assert_ne!(checksum::crc32(b"kext"), checksum::crc32(b"kexu"));
    }
}
