//! In-band serial bootloader (spec §4.2 "bootloader"), entered via
//! `CMD_BOOTLOADER` or a boot-time pin check. Receives firmware as a stream
//! of chunks over the same UART the application protocol uses, stages each
//! chunk into a scratch flash region behind a running XOR checksum, and on
//! the terminator hands off to [`FirmwareInstaller`] to copy the staged
//! image over the running application and reset.
//!
//! Wire format and constants are grounded directly in the original
//! `bootloader.c`'s chunked transfer, not in spec.md (which only names the
//! module).

use brewos_shared::crc::crc32_digest;
use embedded_storage::nor_flash::NorFlash;
use heapless::Vec;

/// Starts a chunk: `0x55 0xAA` then `chunk_num(u32 LE)`, `size(u16 LE)`, data, `xor_checksum(u8)`.
const CHUNK_MAGIC: [u8; 2] = [0x55, 0xAA];
/// Sent in place of a chunk header once the whole image has been transferred.
const TERMINATOR_MAGIC: [u8; 2] = [0xAA, 0x55];
/// Per-chunk acknowledgement byte.
const CHUNK_ACK: u8 = 0xAA;
/// Per-chunk negative acknowledgement byte, followed by an error code.
const CHUNK_NACK: u8 = 0xFF;
/// Bootloader-entry READY marker: sent once when the serial bootloader is
/// first entered (`CMD_BOOTLOADER` or a boot-time pin check), before any
/// chunks stream, to tell the host it may start the chunked transfer.
pub const BOOT_ACK: [u8; 4] = [0xB0, 0x07, 0xAC, 0x4B];

pub const MAX_CHUNK_DATA: usize = 256;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum ChunkError {
    BadMagic,
    ChecksumMismatch,
    ChunkTooLarge,
    OutOfSequence { expected: u32, got: u32 },
}

impl ChunkError {
    /// Wire error code sent after [`CHUNK_NACK`].
    pub fn code(self) -> u8 {
        match self {
            ChunkError::BadMagic => 1,
            ChunkError::ChecksumMismatch => 2,
            ChunkError::ChunkTooLarge => 3,
            ChunkError::OutOfSequence { .. } => 4,
        }
    }
}

/// One parsed chunk header, payload still owned by the caller's receive buffer.
pub struct ChunkHeader {
    pub chunk_num: u32,
    pub size: u16,
}

/// Parse and checksum-verify a single chunk from a raw byte slice already
/// known to start right after the `0x55 0xAA` magic. `frame` is
/// `chunk_num(4) + size(2) + data(size) + xor_checksum(1)`.
pub fn parse_chunk(frame: &[u8], expected_chunk_num: u32) -> Result<(ChunkHeader, &[u8]), ChunkError> {
    if frame.len() < 7 {
        return Err(ChunkError::BadMagic);
    }
    let chunk_num = u32::from_le_bytes([frame[0], frame[1], frame[2], frame[3]]);
    let size = u16::from_le_bytes([frame[4], frame[5]]) as usize;
    if size > MAX_CHUNK_DATA {
        return Err(ChunkError::ChunkTooLarge);
    }
    if frame.len() < 6 + size + 1 {
        return Err(ChunkError::BadMagic);
    }
    if chunk_num != expected_chunk_num {
        return Err(ChunkError::OutOfSequence {
            expected: expected_chunk_num,
            got: chunk_num,
        });
    }
    let data = &frame[6..6 + size];
    let received_checksum = frame[6 + size];
    let computed = xor_checksum(&frame[0..6 + size]);
    if computed != received_checksum {
        return Err(ChunkError::ChecksumMismatch);
    }
    Ok((ChunkHeader { chunk_num, size: size as u16 }, data))
}

fn xor_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc ^ b)
}

/// Byte-level framer: feed raw bytes, get back magic-delimited frames.
/// Mirrors the chunk/terminator framing `bootloader_receive_firmware`'s main
/// loop implements by hand over a blocking UART read.
pub struct ChunkReceiver<const MAX_FRAME: usize = 264> {
    buf: Vec<u8, MAX_FRAME>,
    magic: [u8; 2],
    have_magic: bool,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum FrameEvent {
    Chunk,
    Terminator,
}

impl<const MAX_FRAME: usize> ChunkReceiver<MAX_FRAME> {
    pub const fn new() -> Self {
        Self {
            buf: Vec::new(),
            magic: [0, 0],
            have_magic: false,
        }
    }

    /// Feed one byte. Returns `Some(FrameEvent)` once a complete frame (chunk
    /// or terminator) has been buffered; the caller then reads
    /// [`Self::frame`] before calling [`Self::reset`] for the next one.
    pub fn push_byte(&mut self, b: u8) -> Option<FrameEvent> {
        if !self.have_magic {
            self.magic[0] = self.magic[1];
            self.magic[1] = b;
            if self.magic == CHUNK_MAGIC {
                self.have_magic = true;
                self.buf.clear();
            } else if self.magic == TERMINATOR_MAGIC {
                self.have_magic = false;
                return Some(FrameEvent::Terminator);
            }
            return None;
        }
        if self.buf.push(b).is_err() {
            // Overran the frame buffer; resync on the next magic pair.
            self.have_magic = false;
            self.magic = [0, 0];
            return None;
        }
        if self.buf.len() >= 6 {
            let size = u16::from_le_bytes([self.buf[4], self.buf[5]]) as usize;
            if self.buf.len() == 6 + size + 1 {
                self.have_magic = false;
                return Some(FrameEvent::Chunk);
            }
        }
        None
    }

    pub fn frame(&self) -> &[u8] {
        &self.buf
    }

    pub fn reset(&mut self) {
        self.buf.clear();
        self.have_magic = false;
        self.magic = [0, 0];
    }
}

impl<const MAX_FRAME: usize> Default for ChunkReceiver<MAX_FRAME> {
    fn default() -> Self {
        Self::new()
    }
}

/// Staging-area writer: accumulates chunks into a scratch flash region via
/// whatever `NorFlash` the board provides, tracking the next expected chunk
/// number and the running byte offset.
pub struct StagingWriter<F: NorFlash> {
    flash: F,
    base_offset: u32,
    next_chunk: u32,
    written: u32,
}

impl<F: NorFlash> StagingWriter<F> {
    pub fn new(flash: F, base_offset: u32) -> Self {
        Self {
            flash,
            base_offset,
            next_chunk: 0,
            written: 0,
        }
    }

    /// Erase the whole staging region before the transfer begins. `len` must
    /// be erase-size aligned per the underlying flash's `ERASE_SIZE`.
    pub fn erase_region(&mut self, len: u32) -> Result<(), F::Error> {
        self.flash.erase(self.base_offset, self.base_offset + len)
    }

    /// Validate and stage one received chunk frame (post-magic bytes).
    /// Returns the ack byte to send back, or a NACK code on failure.
    pub fn accept_chunk(&mut self, frame: &[u8]) -> Result<(), ChunkError> {
        let (_header, data) = parse_chunk(frame, self.next_chunk)?;
        self.flash
            .write(self.base_offset + self.written, data)
            .map_err(|_| ChunkError::ChunkTooLarge)?;
        self.written += data.len() as u32;
        self.next_chunk += 1;
        Ok(())
    }

    pub fn bytes_written(&self) -> u32 {
        self.written
    }

    /// Verify the staged image's CRC-32 against the value the sender
    /// announced before streaming chunks (mirrors `crc32_calculate` over the
    /// assembled image in the original before `copy_firmware_to_main`).
    pub fn verify(&mut self, expected_crc: u32, scratch: &mut [u8]) -> Result<(), ChunkError> {
        let mut digest = crc32_digest();
        let mut remaining = self.written;
        let mut offset = 0u32;
        while remaining > 0 {
            let n = core::cmp::min(remaining as usize, scratch.len());
            self.flash
                .read(self.base_offset + offset, &mut scratch[..n])
                .map_err(|_| ChunkError::ChunkTooLarge)?;
            digest.update(&scratch[..n]);
            offset += n as u32;
            remaining -= n as u32;
        }
        if digest.finalize() == expected_crc {
            Ok(())
        } else {
            Err(ChunkError::ChecksumMismatch)
        }
    }
}

/// Copies a verified staged image from the scratch region over the running
/// application's flash region and resets into it. This step is necessarily
/// chip-specific — on the original's RP2040 it runs from RAM with
/// interrupts disabled and calls BootROM flash functions resolved through a
/// fixed-address function table, the same pattern `legacy-hal`'s
/// `flash::Flash` uses for its own `ROM_API_TABLE_ROOT` lookups. A concrete
/// board crate implements this trait against its own BootROM/HAL; this
/// crate only sequences the chunk protocol.
pub trait FirmwareInstaller {
    type Error;

    /// Copy `len` bytes from `staging_offset` to the application flash
    /// region's start, verifying as it goes, then perform a hard reset.
    /// Does not return on success.
    fn install_and_reset(&mut self, staging_offset: u32, len: u32) -> Result<core::convert::Infallible, Self::Error>;
}

#[cfg(test)]
mod tests {
    use super::*;

    /// In-memory `NorFlash` backing the `verify()` tests; real boards supply
    /// one over their own internal or external flash.
    struct MockFlash {
        data: std::vec::Vec<u8>,
    }

    impl MockFlash {
        fn new(size: usize) -> Self {
            Self {
                data: std::vec![0xFFu8; size],
            }
        }
    }

    #[derive(Debug)]
    struct MockFlashError;

    impl embedded_storage::nor_flash::NorFlashError for MockFlashError {
        fn kind(&self) -> embedded_storage::nor_flash::NorFlashErrorKind {
            embedded_storage::nor_flash::NorFlashErrorKind::Other
        }
    }

    impl embedded_storage::nor_flash::ErrorType for MockFlash {
        type Error = MockFlashError;
    }

    impl embedded_storage::nor_flash::ReadNorFlash for MockFlash {
        const READ_SIZE: usize = 1;

        fn read(&mut self, offset: u32, bytes: &mut [u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            bytes.copy_from_slice(&self.data[offset..offset + bytes.len()]);
            Ok(())
        }

        fn capacity(&self) -> usize {
            self.data.len()
        }
    }

    impl NorFlash for MockFlash {
        const WRITE_SIZE: usize = 1;
        const ERASE_SIZE: usize = 1;

        fn erase(&mut self, from: u32, to: u32) -> Result<(), Self::Error> {
            for b in &mut self.data[from as usize..to as usize] {
                *b = 0xFF;
            }
            Ok(())
        }

        fn write(&mut self, offset: u32, bytes: &[u8]) -> Result<(), Self::Error> {
            let offset = offset as usize;
            self.data[offset..offset + bytes.len()].copy_from_slice(bytes);
            Ok(())
        }
    }

    fn build_chunk_frame(chunk_num: u32, data: &[u8]) -> Vec<u8, 264> {
        let mut frame: Vec<u8, 264> = Vec::new();
        frame.extend_from_slice(&chunk_num.to_le_bytes()).unwrap();
        frame.extend_from_slice(&(data.len() as u16).to_le_bytes()).unwrap();
        frame.extend_from_slice(data).unwrap();
        let checksum = xor_checksum(&frame);
        frame.push(checksum).unwrap();
        frame
    }

    #[test]
    fn parses_well_formed_chunk() {
        let data = [1u8, 2, 3, 4];
        let frame = build_chunk_frame(0, &data);
        let (header, parsed_data) = parse_chunk(&frame, 0).unwrap();
        assert_eq!(header.chunk_num, 0);
        assert_eq!(header.size, 4);
        assert_eq!(parsed_data, &data);
    }

    #[test]
    fn rejects_checksum_mismatch() {
        let mut frame = build_chunk_frame(0, &[1, 2, 3]);
        *frame.last_mut().unwrap() ^= 0xFF;
        assert_eq!(parse_chunk(&frame, 0), Err(ChunkError::ChecksumMismatch));
    }

    #[test]
    fn rejects_out_of_sequence_chunk() {
        let frame = build_chunk_frame(5, &[1, 2, 3]);
        assert_eq!(
            parse_chunk(&frame, 0),
            Err(ChunkError::OutOfSequence { expected: 0, got: 5 })
        );
    }

    #[test]
    fn chunk_receiver_emits_chunk_event_on_full_frame() {
        let mut recv: ChunkReceiver<264> = ChunkReceiver::new();
        let frame = build_chunk_frame(0, &[9, 9, 9]);
        let mut event = None;
        for &b in CHUNK_MAGIC.iter() {
            event = recv.push_byte(b);
        }
        assert_eq!(event, None);
        for &b in frame.iter() {
            event = recv.push_byte(b);
        }
        assert_eq!(event, Some(FrameEvent::Chunk));
        assert_eq!(recv.frame(), &frame[..]);
    }

    #[test]
    fn chunk_receiver_emits_terminator_event() {
        let mut recv: ChunkReceiver<264> = ChunkReceiver::new();
        let mut event = None;
        for &b in TERMINATOR_MAGIC.iter() {
            event = recv.push_byte(b);
        }
        assert_eq!(event, Some(FrameEvent::Terminator));
    }

    #[test]
    fn chunk_receiver_resyncs_after_overrun() {
        let mut recv: ChunkReceiver<8> = ChunkReceiver::new();
        for &b in CHUNK_MAGIC.iter() {
            recv.push_byte(b);
        }
        for _ in 0..20 {
            recv.push_byte(0x00);
        }
        // Buffer overran and resynced; a fresh terminator should still be recognised.
        let mut event = None;
        for &b in TERMINATOR_MAGIC.iter() {
            event = recv.push_byte(b);
        }
        assert_eq!(event, Some(FrameEvent::Terminator));
    }

    #[test]
    fn verify_succeeds_on_image_larger_than_scratch_and_the_old_4096_byte_cap() {
        let image_len = 6_000usize;
        let image: std::vec::Vec<u8> = (0..image_len).map(|i| (i % 256) as u8).collect();
        let expected_crc = brewos_shared::crc::crc32(&image);

        let mut writer = StagingWriter::new(MockFlash::new(image_len), 0);
        for (chunk_num, chunk) in image.chunks(MAX_CHUNK_DATA).enumerate() {
            let frame = build_chunk_frame(chunk_num as u32, chunk);
            writer.accept_chunk(&frame).unwrap();
        }

        let mut scratch = [0u8; 64];
        assert!(writer.verify(expected_crc, &mut scratch).is_ok());
    }

    #[test]
    fn verify_rejects_a_corrupted_image() {
        let image = [7u8; 8_192];
        let expected_crc = brewos_shared::crc::crc32(&image);

        let mut writer = StagingWriter::new(MockFlash::new(image.len()), 0);
        for (chunk_num, chunk) in image.chunks(MAX_CHUNK_DATA).enumerate() {
            let frame = build_chunk_frame(chunk_num as u32, chunk);
            writer.accept_chunk(&frame).unwrap();
        }

        let mut scratch = [0u8; 256];
        assert_eq!(writer.verify(expected_crc ^ 1, &mut scratch), Err(ChunkError::ChecksumMismatch));
    }
}
