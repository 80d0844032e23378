//! CRC algorithms used on the wire.
//!
//! Both checksums are computed with the `crc` crate's const tables rather
//! than a hand-rolled bit loop: `CRC_16_IBM_3740` is the CCITT-FALSE variant
//! (poly `0x1021`, init `0xFFFF`, no reflection, no xorout) and matches the
//! framed-packet CRC bit-for-bit; `CRC_32_ISO_HDLC` is the reflected
//! "zip"-style CRC-32 the bootloader uses over a staged image.

use crc::{Crc, Digest, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
static CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-16-CCITT over `type || length || seq || payload`, transmitted little-endian.
pub fn crc16(data: &[u8]) -> u16 {
    CRC16.checksum(data)
}

/// CRC-32 over a staged firmware image, as computed by the bootloader before
/// it invokes the RAM-resident copy routine.
pub fn crc32(data: &[u8]) -> u32 {
    CRC32.checksum(data)
}

/// A running CRC-32 accumulator for input too large, or too awkward, to hold
/// in memory at once — e.g. a staged firmware image the bootloader reads
/// back from flash in fixed-size blocks. `update()` per block, `finalize()`
/// once all blocks are in.
pub fn crc32_digest() -> Digest<'static, u32> {
    CRC32.digest()
}
