//! Frame assembly from a connection's byte stream.
//!
//! Bytes arrive in arbitrary chunks. `FrameAssembler` buffers them and
//! yields complete frames according to a `Framing` strategy:
//!
//! ```text
//! Delimiter:        USER alice\r\nPASS secret\r\n   -> "USER alice", "PASS secret"
//! Length (decimal): 5\r\nhello                      -> "hello"
//! Length (u32):     00 00 00 05 h e l l o           -> "hello"
//! ```
//!
//! Partial frames are never surfaced. A delimiter at the start of the buffer
//! yields an empty frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Deserialize;
use thiserror::Error;

/// Longest decimal length header accepted (digits only).
const MAX_DECIMAL_DIGITS: usize = 20;

const CRLF: &[u8] = b"\r\n";

/// Header format for length-prefixed framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LengthHeader {
    /// ASCII decimal length followed by `\r\n`.
    Decimal,
    /// 2-byte big-endian length.
    U16,
    /// 4-byte big-endian length.
    U32,
}

/// How a byte stream is cut into frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Framing {
    /// Frames end at the given (non-empty) delimiter.
    Delimiter(Bytes),
    /// Frames carry a length header followed by exactly that many bytes.
    LengthPrefixed(LengthHeader),
}

impl Framing {
    /// `\r\n` line framing.
    pub fn crlf() -> Self {
        Framing::Delimiter(Bytes::from_static(CRLF))
    }

    /// Largest payload the header can describe, if bounded.
    pub fn max_payload(&self) -> Option<usize> {
        match self {
            Framing::LengthPrefixed(LengthHeader::U16) => Some(u16::MAX as usize),
            Framing::LengthPrefixed(LengthHeader::U32) => Some(u32::MAX as usize),
            _ => None,
        }
    }

    /// Encode one payload into its wire form.
    ///
    /// Fails with `Oversize` when a binary header cannot hold the payload
    /// length.
    pub fn encode(&self, payload: &[u8]) -> Result<Bytes, FrameError> {
        if let Some(limit) = self.max_payload() {
            if payload.len() > limit {
                return Err(FrameError::Oversize { limit });
            }
        }
        let out = match self {
            Framing::Delimiter(delim) => {
                let mut out = BytesMut::with_capacity(payload.len() + delim.len());
                out.put_slice(payload);
                out.put_slice(delim);
                out
            }
            Framing::LengthPrefixed(LengthHeader::Decimal) => {
                let header = format!("{}\r\n", payload.len());
                let mut out = BytesMut::with_capacity(header.len() + payload.len());
                out.put_slice(header.as_bytes());
                out.put_slice(payload);
                out
            }
            Framing::LengthPrefixed(LengthHeader::U16) => {
                let mut out = BytesMut::with_capacity(2 + payload.len());
                out.put_u16(payload.len() as u16);
                out.put_slice(payload);
                out
            }
            Framing::LengthPrefixed(LengthHeader::U32) => {
                let mut out = BytesMut::with_capacity(4 + payload.len());
                out.put_u32(payload.len() as u32);
                out.put_slice(payload);
                out
            }
        };
        Ok(out.freeze())
    }
}

/// Errors produced while assembling frames.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    /// A frame exceeds the configured maximum size. The stream cannot be
    /// resynchronised; the connection should be closed.
    #[error("frame exceeds {limit} bytes")]
    Oversize { limit: usize },
    /// A length header could not be parsed. The header line was consumed.
    #[error("invalid length header")]
    InvalidHeader,
    /// Delimiter framing was configured with an empty delimiter.
    #[error("empty frame delimiter")]
    EmptyDelimiter,
}

impl FrameError {
    /// Whether the stream can continue after this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, FrameError::InvalidHeader)
    }
}

/// Per-connection frame assembler.
#[derive(Debug)]
pub struct FrameAssembler {
    framing: Framing,
    buf: BytesMut,
    max_frame_size: usize,
    /// Delimiter framing: bytes already scanned without finding a delimiter.
    scanned: usize,
    /// Decimal framing: discarding an overlong header line up to its `\r\n`.
    skipping_header: bool,
    /// Set after a fatal error; no further frames are produced.
    poisoned: bool,
}

impl FrameAssembler {
    /// Create an assembler with the given strategy and frame size limit.
    pub fn new(framing: Framing, max_frame_size: usize) -> Self {
        Self {
            framing,
            buf: BytesMut::with_capacity(512),
            max_frame_size,
            scanned: 0,
            skipping_header: false,
            poisoned: false,
        }
    }

    /// Append bytes and iterate over every frame now complete.
    ///
    /// The iterator is lazy; frames left unconsumed stay buffered and are
    /// returned by the next `feed` or `next_frame` call.
    pub fn feed(&mut self, data: &[u8]) -> Frames<'_> {
        self.buf.extend_from_slice(data);
        Frames { assembler: self }
    }

    /// Extract the next complete frame from buffered bytes.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, FrameError> {
        if self.poisoned {
            return Ok(None);
        }
        let result = match self.framing {
            Framing::Delimiter(ref delim) if delim.is_empty() => Err(FrameError::EmptyDelimiter),
            Framing::Delimiter(ref delim) => {
                let delim = delim.clone();
                self.next_delimited(&delim)
            }
            Framing::LengthPrefixed(header) => self.next_length_prefixed(header),
        };
        if matches!(result, Err(ref e) if !e.is_recoverable()) {
            self.poisoned = true;
        }
        result
    }

    /// Bytes buffered but not yet framed.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    fn next_delimited(&mut self, delim: &[u8]) -> Result<Option<Bytes>, FrameError> {
        // Resume just before the scanned prefix in case a delimiter straddles it.
        let start = self.scanned.saturating_sub(delim.len() - 1);
        match find(&self.buf[start..], delim) {
            Some(rel) => {
                let pos = start + rel;
                if pos > self.max_frame_size {
                    return Err(FrameError::Oversize {
                        limit: self.max_frame_size,
                    });
                }
                let frame = self.buf.split_to(pos).freeze();
                self.buf.advance(delim.len());
                self.scanned = 0;
                Ok(Some(frame))
            }
            None => {
                self.scanned = self.buf.len();
                // The pending frame is at least this long.
                let pending = self.buf.len().saturating_sub(delim.len() - 1);
                if pending > self.max_frame_size {
                    return Err(FrameError::Oversize {
                        limit: self.max_frame_size,
                    });
                }
                Ok(None)
            }
        }
    }

    fn next_length_prefixed(&mut self, header: LengthHeader) -> Result<Option<Bytes>, FrameError> {
        let (header_len, body_len) = match header {
            LengthHeader::Decimal if self.skipping_header => return self.skip_header_line(),
            LengthHeader::Decimal => match find(&self.buf, CRLF) {
                Some(line_end) => match parse_decimal(&self.buf[..line_end]) {
                    Some(len) => (line_end + CRLF.len(), len),
                    None => {
                        self.buf.advance(line_end + CRLF.len());
                        return Err(FrameError::InvalidHeader);
                    }
                },
                // Too long to be a valid header whatever follows.
                None if self.buf.len() > MAX_DECIMAL_DIGITS + 1 => {
                    self.skipping_header = true;
                    return self.skip_header_line();
                }
                None => return Ok(None),
            },
            LengthHeader::U16 => {
                if self.buf.len() < 2 {
                    return Ok(None);
                }
                (2, u16::from_be_bytes([self.buf[0], self.buf[1]]) as usize)
            }
            LengthHeader::U32 => {
                if self.buf.len() < 4 {
                    return Ok(None);
                }
                let raw = [self.buf[0], self.buf[1], self.buf[2], self.buf[3]];
                (4, u32::from_be_bytes(raw) as usize)
            }
        };

        if body_len > self.max_frame_size {
            return Err(FrameError::Oversize {
                limit: self.max_frame_size,
            });
        }
        if self.buf.len() < header_len + body_len {
            return Ok(None);
        }

        self.buf.advance(header_len);
        Ok(Some(self.buf.split_to(body_len).freeze()))
    }

    /// Drop header bytes until the line ends, then report it once.
    fn skip_header_line(&mut self) -> Result<Option<Bytes>, FrameError> {
        match find(&self.buf, CRLF) {
            Some(line_end) => {
                self.buf.advance(line_end + CRLF.len());
                self.skipping_header = false;
                Err(FrameError::InvalidHeader)
            }
            None => {
                // A trailing `\r` may be the first half of the terminator.
                let keep = usize::from(self.buf.last() == Some(&b'\r'));
                let drop = self.buf.len() - keep;
                self.buf.advance(drop);
                Ok(None)
            }
        }
    }
}

/// Parse a decimal header line: 1 to `MAX_DECIMAL_DIGITS` ASCII digits.
fn parse_decimal(line: &[u8]) -> Option<usize> {
    if line.is_empty() || line.len() > MAX_DECIMAL_DIGITS || !line.iter().all(u8::is_ascii_digit) {
        return None;
    }
    std::str::from_utf8(line).ok()?.parse().ok()
}

/// Lazy iterator over the frames completed by a `feed` call.
pub struct Frames<'a> {
    assembler: &'a mut FrameAssembler,
}

impl Iterator for Frames<'_> {
    type Item = Result<Bytes, FrameError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.assembler.next_frame().transpose()
    }
}

/// Position of the first occurrence of `needle` in `haystack`.
fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || haystack.len() < needle.len() {
        return None;
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn collect(asm: &mut FrameAssembler, data: &[u8]) -> Vec<Bytes> {
        asm.feed(data).map(|f| f.unwrap()).collect()
    }

    #[test]
    fn test_delimiter_multiple_frames() {
        let mut asm = FrameAssembler::new(Framing::crlf(), 1024);
        let frames = collect(&mut asm, b"USER alice\r\nPASS secret\r\nQU");
        assert_eq!(frames, vec!["USER alice", "PASS secret"]);
        assert_eq!(asm.buffered(), 2);

        let frames = collect(&mut asm, b"IT\r\n");
        assert_eq!(frames, vec!["QUIT"]);
        assert_eq!(asm.buffered(), 0);
    }

    #[test]
    fn test_delimiter_split_across_feeds() {
        let mut asm = FrameAssembler::new(Framing::crlf(), 1024);
        assert!(collect(&mut asm, b"NOOP\r").is_empty());
        assert_eq!(collect(&mut asm, b"\n"), vec!["NOOP"]);
    }

    #[test]
    fn test_empty_frame_surfaced() {
        let mut asm = FrameAssembler::new(Framing::crlf(), 1024);
        let frames = collect(&mut asm, b"\r\nabc\r\n\r\n");
        assert_eq!(frames, vec!["", "abc", ""]);
    }

    #[test]
    fn test_four_byte_delimiter() {
        let delim = Framing::Delimiter(Bytes::from_static(b"\r\n\r\n"));
        let mut asm = FrameAssembler::new(delim, 1024);
        assert!(collect(&mut asm, b"Host: a\r\nX: b\r\n").is_empty());
        let frames = collect(&mut asm, b"\r\nnext");
        assert_eq!(frames, vec!["Host: a\r\nX: b"]);
        assert_eq!(asm.buffered(), 4);
    }

    #[test]
    fn test_delimiter_oversize() {
        let mut asm = FrameAssembler::new(Framing::crlf(), 8);
        let mut frames = asm.feed(b"0123456789");
        assert_eq!(frames.next(), Some(Err(FrameError::Oversize { limit: 8 })));
        assert_eq!(frames.next(), None);

        // Exactly at the limit is fine, even when the delimiter is still pending.
        let mut asm = FrameAssembler::new(Framing::crlf(), 8);
        assert!(collect(&mut asm, b"01234567\r").is_empty());
        assert_eq!(collect(&mut asm, b"\n"), vec!["01234567"]);
    }

    #[test]
    fn test_decimal_length() {
        let framing = Framing::LengthPrefixed(LengthHeader::Decimal);
        let mut asm = FrameAssembler::new(framing, 1024);
        assert!(collect(&mut asm, b"5\r\nhel").is_empty());
        assert_eq!(collect(&mut asm, b"lo3\r\nabc"), vec!["hello", "abc"]);
        assert_eq!(collect(&mut asm, b"0\r\n"), vec![""]);
    }

    #[test]
    fn test_decimal_invalid_header_recovers() {
        let framing = Framing::LengthPrefixed(LengthHeader::Decimal);
        let mut asm = FrameAssembler::new(framing, 1024);
        let results: Vec<_> = asm.feed(b"abc\r\n2\r\nok").collect();
        assert_eq!(
            results,
            vec![Err(FrameError::InvalidHeader), Ok(Bytes::from_static(b"ok"))]
        );
    }

    #[test]
    fn test_binary_length_headers() {
        let mut asm = FrameAssembler::new(Framing::LengthPrefixed(LengthHeader::U16), 1024);
        assert!(collect(&mut asm, &[0x00]).is_empty());
        assert_eq!(collect(&mut asm, &[0x02, b'h', b'i']), vec!["hi"]);

        let mut asm = FrameAssembler::new(Framing::LengthPrefixed(LengthHeader::U32), 4);
        let mut frames = asm.feed(&[0, 0, 0, 9]);
        assert_eq!(frames.next(), Some(Err(FrameError::Oversize { limit: 4 })));
    }

    #[test]
    fn test_encode_matches_framing() {
        for framing in [
            Framing::crlf(),
            Framing::LengthPrefixed(LengthHeader::Decimal),
            Framing::LengthPrefixed(LengthHeader::U16),
            Framing::LengthPrefixed(LengthHeader::U32),
        ] {
            let wire = framing.encode(b"payload").unwrap();
            let mut asm = FrameAssembler::new(framing, 1024);
            assert_eq!(collect(&mut asm, &wire), vec!["payload"]);
        }
    }

    #[test]
    fn test_encode_rejects_payload_header_cannot_describe() {
        let framing = Framing::LengthPrefixed(LengthHeader::U16);
        assert_eq!(
            framing.encode(&[b'a'; 70_000]),
            Err(FrameError::Oversize { limit: 65_535 })
        );
        let wire = framing.encode(&[b'a'; 65_535]).unwrap();
        assert_eq!(&wire[..2], &[0xff, 0xff]);
        assert_eq!(wire.len(), 65_537);
        assert_eq!(Framing::crlf().max_payload(), None);
    }

    #[test]
    fn test_overlong_decimal_header_independent_of_split() {
        let wire: &[u8] = b"0000000000000000000005\r\nhello";
        let framing = Framing::LengthPrefixed(LengthHeader::Decimal);

        let mut whole = FrameAssembler::new(framing.clone(), 1024);
        let expected: Vec<_> = whole.feed(wire).collect();
        assert_eq!(expected, vec![Err(FrameError::InvalidHeader)]);

        for cut in 1..wire.len() {
            let mut asm = FrameAssembler::new(framing.clone(), 1024);
            let mut results: Vec<_> = asm.feed(&wire[..cut]).collect();
            results.extend(asm.feed(&wire[cut..]));
            assert_eq!(results, expected, "split at {cut}");
            assert_eq!(asm.buffered(), whole.buffered(), "split at {cut}");
        }

        // The stream is back in sync after the bad header.
        let mut asm = FrameAssembler::new(framing, 1024);
        let mut results: Vec<_> = asm.feed(&wire[..22]).collect();
        results.extend(asm.feed(b"\r\n2\r\nok"));
        assert_eq!(
            results,
            vec![Err(FrameError::InvalidHeader), Ok(Bytes::from_static(b"ok"))]
        );
    }

    #[test]
    fn test_twenty_digit_header_accepted() {
        let framing = Framing::LengthPrefixed(LengthHeader::Decimal);
        let mut asm = FrameAssembler::new(framing, 1024);
        assert_eq!(collect(&mut asm, b"00000000000000000002\r\nhi"), vec!["hi"]);
    }

    #[test]
    fn test_empty_delimiter_is_fatal() {
        let mut asm = FrameAssembler::new(Framing::Delimiter(Bytes::new()), 1024);
        let results: Vec<_> = asm.feed(b"abc").collect();
        assert_eq!(results, vec![Err(FrameError::EmptyDelimiter)]);
        assert!(asm.feed(b"def").next().is_none());
    }

    #[test]
    fn test_find() {
        assert_eq!(find(b"abc\r\ndef", CRLF), Some(3));
        assert_eq!(find(b"no crlf here", CRLF), None);
        assert_eq!(find(b"\r", CRLF), None);
    }
}
