//! Stream framing: read extraction and length-prefixed slices.
//!
//! Stream reads are satisfied from a per-connection receive buffer. Each
//! call to [`extract_read`] either produces one complete payload (consuming
//! it from the buffer), asks for more bytes, or reports a framing error.
//!
//! Slice framing splits one payload into slices of at most `slice_size`
//! bytes, each preceded by a 4-byte big-endian length. A slice shorter than
//! `slice_size` ends the message, so a payload whose length is an exact
//! multiple of `slice_size` is terminated by a zero-length slice.

use crate::alloc::IoBytes;
use crate::buffer::ByteBuffer;
use crate::error::SocketErrorKind;
use bytes::Bytes;

pub const SLICE_HEADER_SIZE: usize = 4;

/// How a stream read is delimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadMode {
    /// Up to (not including) the delimiter; the delimiter is consumed.
    Delimited(Vec<u8>),
    /// Exactly this many bytes.
    Exact(usize),
    /// Whatever is buffered, once at least one byte is.
    Available,
    /// One slice-framed message.
    Sliced,
}

impl ReadMode {
    /// Mode for a `read(n, delim)` request on a connection.
    #[must_use]
    pub fn from_request(count: usize, delim: &[u8], chunked_read: bool) -> Self {
        if !delim.is_empty() {
            Self::Delimited(delim.to_vec())
        } else if count > 0 {
            Self::Exact(count)
        } else if chunked_read {
            Self::Sliced
        } else {
            Self::Available
        }
    }
}

/// Try to take one payload out of `buf`.
///
/// `max` bounds how many bytes a read may need before it is rejected as
/// read-message-too-big.
pub fn extract_read(
    buf: &mut ByteBuffer,
    mode: &ReadMode,
    max: usize,
    slice_size: usize,
) -> Result<Option<ByteBuffer>, SocketErrorKind> {
    match mode {
        ReadMode::Delimited(delim) => match find(buf.data(), delim) {
            Some(at) => {
                let payload = ByteBuffer::from(&buf.data()[..at]);
                buf.consume(at + delim.len());
                Ok(Some(payload))
            }
            None if buf.len() > max => Err(SocketErrorKind::ReadMessageTooBig),
            None => Ok(None),
        },
        ReadMode::Exact(n) => {
            if *n > max {
                return Err(SocketErrorKind::ReadMessageTooBig);
            }
            if buf.len() < *n {
                return Ok(None);
            }
            let payload = ByteBuffer::from(&buf.data()[..*n]);
            buf.consume(*n);
            Ok(Some(payload))
        }
        ReadMode::Available => {
            if buf.is_empty() {
                return Ok(None);
            }
            let payload = ByteBuffer::from(buf.data());
            buf.consume(payload.len());
            Ok(Some(payload))
        }
        ReadMode::Sliced => take_sliced(buf, slice_size, max),
    }
}

/// Reassemble one slice-framed message from the front of `buf`.
pub fn take_sliced(
    buf: &mut ByteBuffer,
    slice_size: usize,
    max: usize,
) -> Result<Option<ByteBuffer>, SocketErrorKind> {
    let data = buf.data();
    let mut offset = 0;
    let mut total = 0;
    let mut slices: Vec<(usize, usize)> = Vec::new();
    loop {
        let Some(header) = data.get(offset..offset + SLICE_HEADER_SIZE) else {
            return Ok(None);
        };
        let len = u32::from_be_bytes([header[0], header[1], header[2], header[3]]) as usize;
        if len > slice_size {
            return Err(SocketErrorKind::FrameBadSize);
        }
        total += len;
        if total > max {
            return Err(SocketErrorKind::ReadMessageTooBig);
        }
        let start = offset + SLICE_HEADER_SIZE;
        if data.len() < start + len {
            return Ok(None);
        }
        slices.push((start, len));
        offset = start + len;
        if len < slice_size {
            break;
        }
    }

    let mut payload = ByteBuffer::with_capacity(total);
    for (start, len) in slices {
        payload.write_back(&data[start..start + len]);
    }
    buf.consume(offset);
    Ok(Some(payload))
}

/// Append the slice framing of `payload` to `out`.
pub fn push_slices(payload: &Bytes, slice_size: usize, out: &mut Vec<IoBytes>) {
    let slice_size = slice_size.max(1);
    let mut offset = 0;
    while offset < payload.len() {
        let end = (offset + slice_size).min(payload.len());
        out.push(slice_header(end - offset));
        out.push(IoBytes::new(payload.slice(offset..end)));
        offset = end;
    }
    if payload.len() % slice_size == 0 {
        out.push(slice_header(0));
    }
}

/// Number of fragments [`push_slices`] produces.
#[must_use]
pub fn slice_fragment_count(len: usize, slice_size: usize) -> usize {
    let slice_size = slice_size.max(1);
    let full = len.div_ceil(slice_size) * 2;
    if len % slice_size == 0 {
        full + 1
    } else {
        full
    }
}

fn slice_header(len: usize) -> IoBytes {
    IoBytes::new(Bytes::copy_from_slice(&(len as u32).to_be_bytes()))
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.len() == 1 {
        return haystack.iter().position(|&b| b == needle[0]);
    }
    haystack.windows(needle.len()).position(|w| w == needle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn buffer(bytes: &[u8]) -> ByteBuffer {
        ByteBuffer::from(bytes)
    }

    fn flatten(frags: &[IoBytes]) -> Vec<u8> {
        frags.iter().flat_map(|f| f.as_ref().to_vec()).collect()
    }

    #[test]
    fn delimiter_is_excluded_and_consumed() {
        let mut buf = buffer(b"ping\r\npong\r\n");
        let mode = ReadMode::from_request(0, b"\r\n", false);
        let first = extract_read(&mut buf, &mode, 1024, 16).unwrap().unwrap();
        assert_eq!(first.data(), b"ping");
        let second = extract_read(&mut buf, &mode, 1024, 16).unwrap().unwrap();
        assert_eq!(second.data(), b"pong");
        assert!(extract_read(&mut buf, &mode, 1024, 16).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn delimiter_read_too_big() {
        let mut buf = buffer(&[b'a'; 65]);
        let mode = ReadMode::Delimited(b"\n".to_vec());
        assert_eq!(
            extract_read(&mut buf, &mode, 64, 16).unwrap_err(),
            SocketErrorKind::ReadMessageTooBig
        );
    }

    #[test]
    fn exact_waits_for_enough_bytes() {
        let mut buf = buffer(b"abc");
        let mode = ReadMode::from_request(5, b"", false);
        assert!(extract_read(&mut buf, &mode, 1024, 16).unwrap().is_none());
        buf.write_back(b"defg");
        let got = extract_read(&mut buf, &mode, 1024, 16).unwrap().unwrap();
        assert_eq!(got.data(), b"abcde");
        assert_eq!(buf.data(), b"fg");
    }

    #[test]
    fn available_takes_everything() {
        let mut buf = ByteBuffer::new();
        let mode = ReadMode::from_request(0, b"", false);
        assert_eq!(mode, ReadMode::Available);
        assert!(extract_read(&mut buf, &mode, 1024, 16).unwrap().is_none());
        buf.write_back(b"xyz");
        let got = extract_read(&mut buf, &mode, 1024, 16).unwrap().unwrap();
        assert_eq!(got.data(), b"xyz");
        assert!(buf.is_empty());
    }

    #[test]
    fn slices_reassemble() {
        let payload = Bytes::from_static(b"0123456789");
        let mut frags = Vec::new();
        push_slices(&payload, 4, &mut frags);
        // 4 + 4 + 2 bytes, last slice short so no terminator
        assert_eq!(frags.len(), 6);
        assert_eq!(frags.len(), slice_fragment_count(10, 4));

        let mut wire = buffer(&flatten(&frags));
        wire.write_back(b"trailing");
        let got = take_sliced(&mut wire, 4, 1024).unwrap().unwrap();
        assert_eq!(got.data(), b"0123456789");
        assert_eq!(wire.data(), b"trailing");
    }

    #[test]
    fn exact_multiple_gets_zero_terminator() {
        let payload = Bytes::from_static(b"abcdefgh");
        let mut frags = Vec::new();
        push_slices(&payload, 4, &mut frags);
        assert_eq!(frags.len(), 5);
        assert_eq!(frags.last().unwrap().as_ref(), &[0, 0, 0, 0]);
        assert_eq!(frags.len(), slice_fragment_count(8, 4));

        let mut wire = buffer(&flatten(&frags));
        let got = take_sliced(&mut wire, 4, 1024).unwrap().unwrap();
        assert_eq!(got.data(), b"abcdefgh");
        assert!(wire.is_empty());
    }

    #[test]
    fn partial_slices_wait() {
        let payload = Bytes::from_static(b"abcdefgh");
        let mut frags = Vec::new();
        push_slices(&payload, 4, &mut frags);
        let wire = flatten(&frags);

        let mut buf = buffer(&wire[..wire.len() - 1]);
        assert!(take_sliced(&mut buf, 4, 1024).unwrap().is_none());
        assert_eq!(buf.len(), wire.len() - 1);
    }

    #[test]
    fn oversize_slice_header_is_rejected() {
        let mut buf = buffer(&[0, 0, 0, 9, 1, 2]);
        assert_eq!(
            take_sliced(&mut buf, 4, 1024).unwrap_err(),
            SocketErrorKind::FrameBadSize
        );
    }
}
