//! Length-prefixed framing of datagrams on a reliable byte stream.
//!
//! Every frame is a variable-width length prefix followed by that many
//! payload bytes. Bit 7 of the first prefix byte distinguishes data frames
//! (set) from padding frames (clear); padding is skipped on read, which
//! lets a writer hide datagram boundaries behind cover traffic. Bit 6 of
//! the first byte and bit 7 of every later byte are continuation flags;
//! the length accumulates big-endian in a 6-bit group followed by 7-bit
//! groups. A prefix is at most 3 bytes, so a frame carries at most
//! [`MAX_FRAME_PAYLOAD`] bytes. Non-minimal prefixes are legal on decode;
//! the padding writer relies on them to hit exact wire totals.

pub mod packet;

use std::io::{self, Read, Write};

use thiserror::Error;

/// Largest payload a single frame can carry (20 bits of length).
pub const MAX_FRAME_PAYLOAD: usize = 0xfffff;

/// Longest legal length prefix in bytes.
const MAX_PREFIX_LEN: usize = 3;

#[derive(Error, Debug)]
pub enum FrameError {
    /// Payload exceeds [`MAX_FRAME_PAYLOAD`], or a prefix ran past three
    /// bytes on decode.
    #[error("frame length prefix too long")]
    TooLong,

    /// The frame carries more bytes than the destination buffer holds.
    /// The destination was filled completely and the rest of the frame was
    /// consumed, so the stream remains aligned on the next frame.
    #[error("buffer too short for {frame_len}-byte frame")]
    ShortBuffer { frame_len: usize },

    /// The stream ended cleanly before any prefix byte.
    #[error("end of stream")]
    Eof,

    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

fn read_byte<R: Read>(r: &mut R) -> io::Result<Option<u8>> {
    let mut b = [0u8; 1];
    loop {
        match r.read(&mut b) {
            Ok(0) => return Ok(None),
            Ok(_) => return Ok(Some(b[0])),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
}

/// Decodes one length prefix. Returns the data/padding flag and the length.
fn read_prefix<R: Read>(r: &mut R) -> Result<(bool, usize), FrameError> {
    let b0 = read_byte(r)?.ok_or(FrameError::Eof)?;
    let is_data = b0 & 0x80 != 0;
    let mut len = (b0 & 0x3f) as usize;
    let mut more = b0 & 0x40 != 0;
    let mut prefix_len = 1;
    while more {
        prefix_len += 1;
        if prefix_len > MAX_PREFIX_LEN {
            return Err(FrameError::TooLong);
        }
        let b = read_byte(r)?
            .ok_or_else(|| FrameError::Io(io::ErrorKind::UnexpectedEof.into()))?;
        len = len << 7 | (b & 0x7f) as usize;
        more = b & 0x80 != 0;
    }
    Ok((is_data, len))
}

/// Encodes `len` into a prefix of exactly `width` bytes. The caller
/// guarantees `len` fits `width` (6 bits for the first byte, 7 for each
/// additional one).
fn encode_prefix(is_data: bool, len: usize, width: usize) -> ([u8; 3], usize) {
    debug_assert!((1..=MAX_PREFIX_LEN).contains(&width));
    let flag: u8 = if is_data { 0x80 } else { 0x00 };
    let mut b = [0u8; 3];
    match width {
        1 => b[0] = flag | (len as u8 & 0x3f),
        2 => {
            b[0] = flag | 0x40 | ((len >> 7) as u8 & 0x3f);
            b[1] = len as u8 & 0x7f;
        }
        _ => {
            b[0] = flag | 0x40 | ((len >> 14) as u8 & 0x3f);
            b[1] = 0x80 | ((len >> 7) as u8 & 0x7f);
            b[2] = len as u8 & 0x7f;
        }
    }
    (b, width)
}

fn minimal_width(len: usize) -> usize {
    if len <= 0x3f {
        1
    } else if len <= 0x1fff {
        2
    } else {
        3
    }
}

fn discard<R: Read>(r: &mut R, n: usize) -> Result<(), FrameError> {
    let copied = io::copy(&mut r.by_ref().take(n as u64), &mut io::sink())?;
    if copied < n as u64 {
        return Err(FrameError::Io(io::ErrorKind::UnexpectedEof.into()));
    }
    Ok(())
}

/// Writes one data frame carrying `p`. Returns the number of wire bytes
/// written (prefix plus payload).
pub fn write_data<W: Write>(w: &mut W, p: &[u8]) -> Result<usize, FrameError> {
    if p.len() > MAX_FRAME_PAYLOAD {
        return Err(FrameError::TooLong);
    }
    let (prefix, width) = encode_prefix(true, p.len(), minimal_width(p.len()));
    w.write_all(&prefix[..width])?;
    w.write_all(p)?;
    Ok(width + p.len())
}

/// Writes padding frames totalling exactly `n` wire bytes, prefix
/// inclusive. Budgets larger than one frame can express are split across
/// multiple frames; exact totals are reached by widening the prefix.
pub fn write_padding<W: Write>(w: &mut W, n: usize) -> Result<usize, FrameError> {
    let mut remaining = n;
    while remaining > 0 {
        let chunk = remaining.min(MAX_FRAME_PAYLOAD + MAX_PREFIX_LEN);
        let payload = max_data_for_size(chunk);
        let width = chunk - payload;
        let (prefix, width) = encode_prefix(false, payload, width);
        w.write_all(&prefix[..width])?;
        io::copy(&mut io::repeat(0).take(payload as u64), w)?;
        remaining -= chunk;
    }
    Ok(n)
}

/// Reads the next data frame into `p`, skipping any padding frames that
/// precede it. Returns the payload length.
///
/// Errors: [`FrameError::Eof`] when the stream ends cleanly before a
/// prefix byte; `Io` with `UnexpectedEof` when it ends mid-frame;
/// [`FrameError::TooLong`] for a prefix past three bytes;
/// [`FrameError::ShortBuffer`] when the frame exceeds `p` — in that case
/// `p` has been filled completely and the remainder of the frame consumed,
/// so a subsequent call starts at the next frame.
pub fn read_data<R: Read>(r: &mut R, p: &mut [u8]) -> Result<usize, FrameError> {
    loop {
        let (is_data, len) = read_prefix(r)?;
        if !is_data {
            discard(r, len)?;
            continue;
        }
        if len > p.len() {
            r.read_exact(p)?;
            discard(r, len - p.len())?;
            return Err(FrameError::ShortBuffer { frame_len: len });
        }
        r.read_exact(&mut p[..len])?;
        return Ok(len);
    }
}

/// Greatest payload length whose frame (prefix included) fits in `size`
/// wire bytes.
///
/// Panics when `size` is zero; no frame fits in an empty budget and a
/// zero budget is a caller bug.
pub fn max_data_for_size(size: usize) -> usize {
    assert!(size != 0, "frame size budget must be nonzero");
    match size {
        s if s < 0x3f + 2 => s - 1,
        s if s < 0x1fff + 2 => s - 2,
        s if s < 0xfffff + 4 => s - 3,
        _ => MAX_FRAME_PAYLOAD,
    }
}
