//! Checksum-safe packet mutation contract.
//!
//! The engine rewrites headers exclusively through [`PacketEditor`]: raw
//! byte stores plus incremental L3/L4 checksum fixups. [`BufEditor`] is the
//! in-process implementation over a contiguous packet buffer; a deployment
//! wrapping a kernel datapath supplies its own implementation with the same
//! semantics.

use crate::error::NatError;
use crate::packet::checksum::{csum_replace, csum_replace32};

/// Behavior flags for an L4 checksum fixup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CsumFlags {
    /// The delta touches pseudo-header bytes (addresses). The arithmetic is
    /// identical for a software buffer; implementations backed by hardware
    /// offload need the distinction.
    pub pseudo_header: bool,
    /// UDP "no checksum" handling: a stored zero is left alone, and an
    /// update that produces zero is written as `0xffff`.
    pub mangled_zero: bool,
}

impl CsumFlags {
    pub const NONE: CsumFlags = CsumFlags { pseudo_header: false, mangled_zero: false };
    pub const PSEUDO: CsumFlags = CsumFlags { pseudo_header: true, mangled_zero: false };
}

/// Mutation interface handed to the translation paths.
///
/// `old`/`new` values are the big-endian interpretation of the affected
/// field bytes; `size` is the field width in bytes (2 or 4). Wider deltas
/// are expressed as multiple calls.
pub trait PacketEditor {
    /// Reads bytes at `offset` into `buf`.
    fn load(&self, offset: usize, buf: &mut [u8]) -> Result<(), NatError>;

    /// Overwrites bytes at `offset`.
    fn store_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), NatError>;

    /// Fixes up a plain (non-pseudo-header) checksum at `csum_offset` for a
    /// field changing from `old` to `new`.
    fn l3_csum_replace(
        &mut self,
        csum_offset: usize,
        old: u32,
        new: u32,
        size: usize,
    ) -> Result<(), NatError>;

    /// Fixes up a transport checksum at `csum_offset`.
    fn l4_csum_replace(
        &mut self,
        csum_offset: usize,
        old: u32,
        new: u32,
        size: usize,
        flags: CsumFlags,
    ) -> Result<(), NatError>;

    /// Convenience big-endian u16 read.
    fn load_u16(&self, offset: usize) -> Result<u16, NatError> {
        let mut b = [0u8; 2];
        self.load(offset, &mut b)?;
        Ok(u16::from_be_bytes(b))
    }

    /// Convenience big-endian u64 read.
    fn load_u64(&self, offset: usize) -> Result<u64, NatError> {
        let mut b = [0u8; 8];
        self.load(offset, &mut b)?;
        Ok(u64::from_be_bytes(b))
    }
}

/// [`PacketEditor`] over a contiguous packet byte buffer.
pub struct BufEditor<'a> {
    buf: &'a mut [u8],
}

impl<'a> BufEditor<'a> {
    pub fn new(buf: &'a mut [u8]) -> Self {
        Self { buf }
    }

    fn slice(&self, offset: usize, len: usize) -> Result<&[u8], NatError> {
        self.buf
            .get(offset..offset + len)
            .ok_or(NatError::EditOutOfBounds(offset))
    }

    fn slice_mut(&mut self, offset: usize, len: usize) -> Result<&mut [u8], NatError> {
        self.buf
            .get_mut(offset..offset + len)
            .ok_or(NatError::EditOutOfBounds(offset))
    }

    fn read_csum(&self, offset: usize) -> Result<u16, NatError> {
        let b = self.slice(offset, 2)?;
        Ok(u16::from_be_bytes([b[0], b[1]]))
    }

    fn write_csum(&mut self, offset: usize, check: u16) -> Result<(), NatError> {
        self.slice_mut(offset, 2)?.copy_from_slice(&check.to_be_bytes());
        Ok(())
    }

    fn apply_delta(check: u16, old: u32, new: u32, size: usize) -> Result<u16, NatError> {
        match size {
            2 => Ok(csum_replace(check, old as u16, new as u16)),
            4 => Ok(csum_replace32(check, old, new)),
            other => Err(NatError::BadFieldSize(other)),
        }
    }
}

impl PacketEditor for BufEditor<'_> {
    fn load(&self, offset: usize, buf: &mut [u8]) -> Result<(), NatError> {
        buf.copy_from_slice(self.slice(offset, buf.len())?);
        Ok(())
    }

    fn store_bytes(&mut self, offset: usize, data: &[u8]) -> Result<(), NatError> {
        self.slice_mut(offset, data.len())?.copy_from_slice(data);
        Ok(())
    }

    fn l3_csum_replace(
        &mut self,
        csum_offset: usize,
        old: u32,
        new: u32,
        size: usize,
    ) -> Result<(), NatError> {
        let check = self.read_csum(csum_offset)?;
        let check = Self::apply_delta(check, old, new, size)?;
        self.write_csum(csum_offset, check)
    }

    fn l4_csum_replace(
        &mut self,
        csum_offset: usize,
        old: u32,
        new: u32,
        size: usize,
        flags: CsumFlags,
    ) -> Result<(), NatError> {
        let check = self.read_csum(csum_offset)?;
        if flags.mangled_zero && check == 0 {
            // UDP with no checksum: leave it that way.
            return Ok(());
        }
        let mut check = Self::apply_delta(check, old, new, size)?;
        if flags.mangled_zero && check == 0 {
            check = 0xffff;
        }
        self.write_csum(csum_offset, check)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum::internet_checksum;

    /// 20-byte IPv4 header with a valid checksum.
    fn sample_ipv4_header() -> Vec<u8> {
        let mut hdr = vec![
            0x45, 0x00, 0x00, 0x54, 0x1c, 0x46, 0x40, 0x00, 0x40, 0x06, 0x00, 0x00, 0x0a, 0x00,
            0x00, 0x05, 0x01, 0x01, 0x01, 0x01,
        ];
        let check = internet_checksum(&hdr);
        hdr[10..12].copy_from_slice(&check.to_be_bytes());
        hdr
    }

    #[test]
    fn test_store_bytes_and_load_roundtrip() {
        let mut buf = vec![0u8; 16];
        let mut editor = BufEditor::new(&mut buf);
        editor.store_bytes(4, &[1, 2, 3, 4]).unwrap();
        assert_eq!(editor.load_u16(4).unwrap(), 0x0102);
        assert_eq!(editor.load_u64(4).unwrap(), 0x0102_0304_0000_0000);
    }

    #[test]
    fn test_out_of_bounds_is_error() {
        let mut buf = vec![0u8; 8];
        let mut editor = BufEditor::new(&mut buf);
        assert!(matches!(
            editor.store_bytes(7, &[1, 2]),
            Err(NatError::EditOutOfBounds(7))
        ));
        assert!(editor.load_u16(8).is_err());
        assert!(editor.l3_csum_replace(7, 0, 1, 2).is_err());
    }

    #[test]
    fn test_bad_field_size_rejected() {
        let mut buf = vec![0u8; 8];
        let mut editor = BufEditor::new(&mut buf);
        assert!(matches!(
            editor.l3_csum_replace(0, 0, 1, 3),
            Err(NatError::BadFieldSize(3))
        ));
    }

    #[test]
    fn test_l3_replace_keeps_header_checksum_valid() {
        let mut hdr = sample_ipv4_header();
        let old_src = u32::from_be_bytes([hdr[12], hdr[13], hdr[14], hdr[15]]);
        let new_src = u32::from_be_bytes([203, 0, 113, 1]);

        let mut editor = BufEditor::new(&mut hdr);
        editor.store_bytes(12, &new_src.to_be_bytes()).unwrap();
        editor.l3_csum_replace(10, old_src, new_src, 4).unwrap();

        // A valid IPv4 header sums to zero including its checksum field.
        assert_eq!(internet_checksum(&hdr), 0, "header checksum must stay valid");
    }

    #[test]
    fn test_mangled_zero_skips_absent_udp_checksum() {
        let mut buf = vec![0u8; 8];
        let mut editor = BufEditor::new(&mut buf);
        editor
            .l4_csum_replace(6, 0x1234, 0x4321, 2, CsumFlags { pseudo_header: true, mangled_zero: true })
            .unwrap();
        assert_eq!(u16::from_be_bytes([buf[6], buf[7]]), 0, "zero checksum untouched");
    }

    #[test]
    fn test_mangled_zero_never_writes_zero() {
        // Choose old/new so that the update would land exactly on zero.
        let mut buf = vec![0u8; 2];
        buf.copy_from_slice(&0x00ffu16.to_be_bytes());
        // csum_replace(0x00ff, m, m') == 0 requires ~(~0x00ff + ~m + m') == 0.
        // With m = 0xff00 and m' = 0x0000: ~0x00ff=0xff00, ~m=0x00ff,
        // 0xff00 ⊞ 0x00ff = 0xffff, ⊞ 0 = 0xffff, ~0xffff = 0.
        let mut editor = BufEditor::new(&mut buf);
        editor
            .l4_csum_replace(0, 0xff00, 0x0000, 2, CsumFlags { pseudo_header: false, mangled_zero: true })
            .unwrap();
        assert_eq!(
            u16::from_be_bytes([buf[0], buf[1]]),
            0xffff,
            "mangled-zero rewrites 0 to 0xffff"
        );
    }

    #[test]
    fn test_non_mangled_may_write_zero() {
        let mut buf = vec![0u8; 2];
        buf.copy_from_slice(&0x00ffu16.to_be_bytes());
        let mut editor = BufEditor::new(&mut buf);
        editor.l4_csum_replace(0, 0xff00, 0x0000, 2, CsumFlags::NONE).unwrap();
        assert_eq!(u16::from_be_bytes([buf[0], buf[1]]), 0);
    }
}
