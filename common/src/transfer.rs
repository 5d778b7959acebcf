//! Chunked transfer engine.
//!
//! Every multi-byte value on the wire goes through this module: fixed-width text
//! fields, big-endian lengths and bulk payloads. Both ends of a transfer size their
//! chunks the same way, full [`CHUNK_SIZE`] chunks followed by one final chunk of
//! exactly the remaining byte count.

use std::io::{self, Read, Write};

use crate::{
    error::{ProtocolError, TransferError},
    protocol::{ResponseCode, CHUNK_SIZE, SIZE_INTEGER, SIZE_LONG},
};

/// Fills `buf` completely, tolerating short reads and `Interrupted`.
///
/// Fails with [`TransferError::UnexpectedEof`] if the stream ends first.
pub fn read_exact_n<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<(), TransferError> {
    let filled = fill_until_eof(reader, buf)?;
    if filled < buf.len() {
        return Err(TransferError::UnexpectedEof {
            expected: buf.len() as u64,
            received: filled as u64,
        });
    }
    Ok(())
}

/// Reads into `buf` until it is full or the stream ends, returning the count.
pub fn fill_until_eof<R: Read + ?Sized>(reader: &mut R, buf: &mut [u8]) -> Result<usize, TransferError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(filled)
}

/// Reads a full fixed-width field.
pub fn read_field<R: Read + ?Sized>(reader: &mut R, width: usize) -> Result<Vec<u8>, TransferError> {
    let mut raw = vec![0u8; width];
    read_exact_n(reader, &mut raw)?;
    Ok(raw)
}

/// Reads a fixed-width text field and strips its NUL padding.
pub fn read_text_field<R: Read + ?Sized>(reader: &mut R, width: usize) -> Result<String, TransferError> {
    let raw = read_field(reader, width)?;
    Ok(trim_padding(&raw))
}

/// Drops every NUL byte and decodes the rest as (lossy) UTF-8.
pub fn trim_padding(raw: &[u8]) -> String {
    let text: Vec<u8> = raw.iter().copied().filter(|b| *b != 0).collect();
    String::from_utf8_lossy(&text).into_owned()
}

/// NUL pads `value` to `width` bytes. Values wider than the field are rejected.
pub fn pad_field(value: &str, width: usize, field: &'static str) -> Result<Vec<u8>, ProtocolError> {
    let bytes = value.as_bytes();
    if bytes.len() > width {
        return Err(ProtocolError::FieldTooLong {
            field,
            len: bytes.len(),
            width,
        });
    }
    let mut padded = vec![0u8; width];
    padded[..bytes.len()].copy_from_slice(bytes);
    Ok(padded)
}

/// Encodes an 8-byte transfer length.
pub fn encode_len64(value: i64) -> [u8; SIZE_LONG] {
    value.to_be_bytes()
}

/// Decodes an 8-byte transfer length.
pub fn decode_len64(bytes: [u8; SIZE_LONG]) -> i64 {
    i64::from_be_bytes(bytes)
}

/// Encodes a 4-byte output length.
pub fn encode_len32(value: u32) -> [u8; SIZE_INTEGER] {
    value.to_be_bytes()
}

/// Decodes a 4-byte output length.
pub fn decode_len32(bytes: [u8; SIZE_INTEGER]) -> u32 {
    u32::from_be_bytes(bytes)
}

pub fn read_len64<R: Read + ?Sized>(reader: &mut R) -> Result<i64, TransferError> {
    let mut bytes = [0u8; SIZE_LONG];
    read_exact_n(reader, &mut bytes)?;
    Ok(decode_len64(bytes))
}

pub fn write_len64<W: Write + ?Sized>(writer: &mut W, value: i64) -> Result<(), TransferError> {
    writer.write_all(&encode_len64(value))?;
    Ok(())
}

pub fn read_len32<R: Read + ?Sized>(reader: &mut R) -> Result<u32, TransferError> {
    let mut bytes = [0u8; SIZE_INTEGER];
    read_exact_n(reader, &mut bytes)?;
    Ok(decode_len32(bytes))
}

pub fn write_len32<W: Write + ?Sized>(writer: &mut W, value: u32) -> Result<(), TransferError> {
    writer.write_all(&encode_len32(value))?;
    Ok(())
}

/// Converts a byte count into the 8-byte wire length.
pub fn to_len64(len: u64) -> Result<i64, TransferError> {
    i64::try_from(len).map_err(|_| TransferError::LengthOverflow(len))
}

/// Converts a byte count into the 4-byte wire length.
pub fn to_len32(len: u64) -> Result<u32, TransferError> {
    u32::try_from(len).map_err(|_| TransferError::LengthOverflow(len))
}

/// Reads one raw byte: a command or a status.
pub fn read_byte<R: Read + ?Sized>(reader: &mut R) -> Result<u8, TransferError> {
    let mut byte = [0u8; 1];
    read_exact_n(reader, &mut byte)?;
    Ok(byte[0])
}

pub fn write_status<W: Write + ?Sized>(writer: &mut W, code: ResponseCode) -> Result<(), TransferError> {
    writer.write_all(&[code.as_byte()])?;
    writer.flush()?;
    Ok(())
}

/// A reply slot that carries either a value or, on failure, a lone status byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply<T> {
    Value(T),
    Status(u8),
}

fn read_reply<R: Read + ?Sized, const N: usize>(reader: &mut R) -> Result<Reply<[u8; N]>, TransferError> {
    let mut bytes = [0u8; N];
    match fill_until_eof(reader, &mut bytes)? {
        n if n == N => Ok(Reply::Value(bytes)),
        1 => Ok(Reply::Status(bytes[0])),
        received => Err(TransferError::UnexpectedEof {
            expected: N as u64,
            received: received as u64,
        }),
    }
}

/// Reads an 8-byte length, or the status byte the agent sends in its place.
pub fn read_len64_reply<R: Read + ?Sized>(reader: &mut R) -> Result<Reply<i64>, TransferError> {
    Ok(match read_reply::<R, SIZE_LONG>(reader)? {
        Reply::Value(bytes) => Reply::Value(decode_len64(bytes)),
        Reply::Status(code) => Reply::Status(code),
    })
}

/// Reads a 4-byte length, or the status byte the agent sends in its place.
pub fn read_len32_reply<R: Read + ?Sized>(reader: &mut R) -> Result<Reply<u32>, TransferError> {
    Ok(match read_reply::<R, SIZE_INTEGER>(reader)? {
        Reply::Value(bytes) => Reply::Value(decode_len32(bytes)),
        Reply::Status(code) => Reply::Status(code),
    })
}

/// Moves exactly `len` bytes from `source` to `sink` in [`CHUNK_SIZE`] chunks.
pub fn copy_exact<R, W>(source: &mut R, sink: &mut W, len: u64) -> Result<u64, TransferError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    copy_exact_chunked(source, sink, len, CHUNK_SIZE)
}

/// Moves exactly `len` bytes using chunks of at most `chunk_size` bytes.
///
/// The last chunk carries only the remaining bytes. A source that ends early fails
/// with the overall byte counts, not the per-chunk ones.
pub fn copy_exact_chunked<R, W>(
    source: &mut R,
    sink: &mut W,
    len: u64,
    chunk_size: usize,
) -> Result<u64, TransferError>
where
    R: Read + ?Sized,
    W: Write + ?Sized,
{
    let chunk_size = chunk_size.max(1);
    let mut chunk = vec![0u8; usize::try_from(len).map_or(chunk_size, |l| l.min(chunk_size))];
    let mut remaining = len;

    while remaining > 0 {
        let n = remaining.min(chunk_size as u64) as usize;
        let buf = &mut chunk[..n];
        match read_exact_n(source, buf) {
            Ok(()) => {}
            Err(TransferError::UnexpectedEof { received, .. }) => {
                return Err(TransferError::UnexpectedEof {
                    expected: len,
                    received: len - remaining + received,
                });
            }
            Err(e) => return Err(e),
        }
        sink.write_all(buf)?;
        remaining -= n as u64;
    }

    sink.flush()?;
    Ok(len)
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use super::*;

    /// Hands out at most `step` bytes per read call.
    struct Trickle<'a> {
        data: &'a [u8],
        step: usize,
    }

    impl Read for Trickle<'_> {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let n = self.step.min(buf.len()).min(self.data.len());
            buf[..n].copy_from_slice(&self.data[..n]);
            self.data = &self.data[n..];
            Ok(n)
        }
    }

    /// Records the size of every write call.
    #[derive(Default)]
    struct ChunkLog {
        data:   Vec<u8>,
        writes: Vec<usize>,
    }

    impl Write for ChunkLog {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.data.extend_from_slice(buf);
            self.writes.push(buf.len());
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 + 7) as u8).collect()
    }

    #[test]
    fn read_exact_survives_partial_reads() {
        let data = pattern(300);
        let mut reader = Trickle { data: &data, step: 7 };
        let mut buf = vec![0u8; 300];
        read_exact_n(&mut reader, &mut buf).unwrap();
        assert_eq!(buf, data);
    }

    #[test]
    fn read_exact_reports_short_stream() {
        let mut reader = Cursor::new(vec![1u8; 10]);
        let mut buf = [0u8; 16];
        match read_exact_n(&mut reader, &mut buf) {
            Err(TransferError::UnexpectedEof { expected, received }) => {
                assert_eq!(expected, 16);
                assert_eq!(received, 10);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
    }

    #[test]
    fn exact_chunk_is_a_single_write() {
        let data = pattern(1024);
        let mut sink = ChunkLog::default();
        let moved = copy_exact(&mut Cursor::new(&data), &mut sink, 1024).unwrap();
        assert_eq!(moved, 1024);
        assert_eq!(sink.writes, vec![1024]);
        assert_eq!(sink.data, data);
    }

    #[test]
    fn one_past_a_chunk_ends_with_a_one_byte_chunk() {
        let data = pattern(1025);
        let mut sink = ChunkLog::default();
        copy_exact(&mut Cursor::new(&data), &mut sink, 1025).unwrap();
        assert_eq!(sink.writes, vec![1024, 1]);
        assert_eq!(sink.data, data);
    }

    #[test]
    fn copy_never_reads_past_the_declared_length() {
        let data = pattern(3000);
        let mut source = Cursor::new(&data);
        let mut sink = ChunkLog::default();
        copy_exact(&mut source, &mut sink, 2049).unwrap();
        assert_eq!(sink.writes, vec![1024, 1024, 1]);
        assert_eq!(source.position(), 2049);
    }

    #[test]
    fn copy_zero_bytes_touches_nothing() {
        let mut sink = ChunkLog::default();
        let moved = copy_exact(&mut Cursor::new(Vec::new()), &mut sink, 0).unwrap();
        assert_eq!(moved, 0);
        assert!(sink.writes.is_empty());
    }

    #[test]
    fn copy_from_trickling_source() {
        let data = pattern(5000);
        let mut source = Trickle { data: &data, step: 333 };
        let mut sink = ChunkLog::default();
        copy_exact(&mut source, &mut sink, 5000).unwrap();
        assert_eq!(sink.data, data);
        assert_eq!(sink.writes, vec![1024, 1024, 1024, 1024, 904]);
    }

    #[test]
    fn short_source_reports_overall_counts() {
        let data = pattern(1500);
        let mut sink = ChunkLog::default();
        match copy_exact(&mut Cursor::new(&data), &mut sink, 2000) {
            Err(TransferError::UnexpectedEof { expected, received }) => {
                assert_eq!(expected, 2000);
                assert_eq!(received, 1500);
            }
            other => panic!("expected UnexpectedEof, got {other:?}"),
        }
        assert_eq!(sink.data.len(), 1024);
    }

    #[test]
    fn text_fields_are_padded_and_trimmed() {
        let padded = pad_field("/sdcard/test.txt", 256, "filename").unwrap();
        assert_eq!(padded.len(), 256);
        assert!(padded[16..].iter().all(|b| *b == 0));

        let text = read_text_field(&mut Cursor::new(padded), 256).unwrap();
        assert_eq!(text, "/sdcard/test.txt");
    }

    #[test]
    fn full_width_field_has_no_padding_to_trim() {
        let value = "x".repeat(512);
        let padded = pad_field(&value, 512, "command").unwrap();
        assert_eq!(read_text_field(&mut Cursor::new(padded), 512).unwrap(), value);
    }

    #[test]
    fn over_wide_fields_are_rejected() {
        let value = "a".repeat(257);
        assert_eq!(
            pad_field(&value, 256, "filename"),
            Err(ProtocolError::FieldTooLong {
                field: "filename",
                len:   257,
                width: 256,
            })
        );
    }

    #[test]
    fn field_reader_consumes_exactly_the_width() {
        let mut wire = pad_field("ls", 512, "command").unwrap();
        wire.extend_from_slice(b"rest");
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_text_field(&mut cursor, 512).unwrap(), "ls");
        assert_eq!(cursor.position(), 512);
    }

    #[test]
    fn lengths_are_big_endian() {
        assert_eq!(encode_len64(1025), [0, 0, 0, 0, 0, 0, 0x04, 0x01]);
        assert_eq!(encode_len32(1025), [0, 0, 0x04, 0x01]);
        assert_eq!(decode_len64([0xff; 8]), -1);
        assert_eq!(decode_len32([0, 1, 0, 0]), 65536);

        let mut wire = Vec::new();
        write_len64(&mut wire, 1 << 40).unwrap();
        write_len32(&mut wire, 7).unwrap();
        let mut cursor = Cursor::new(wire);
        assert_eq!(read_len64(&mut cursor).unwrap(), 1 << 40);
        assert_eq!(read_len32(&mut cursor).unwrap(), 7);
    }

    #[test]
    fn reply_distinguishes_value_and_status() {
        let mut value = Cursor::new(encode_len64(42).to_vec());
        assert_eq!(read_len64_reply(&mut value).unwrap(), Reply::Value(42));

        let mut status = Cursor::new(vec![ResponseCode::NotFound.as_byte()]);
        assert_eq!(read_len64_reply(&mut status).unwrap(), Reply::Status(0xff));

        let mut truncated = Cursor::new(vec![0u8; 3]);
        assert!(matches!(
            read_len32_reply(&mut truncated),
            Err(TransferError::UnexpectedEof { expected: 4, received: 3 })
        ));
    }

    #[test]
    fn length_conversions_guard_the_wire_width() {
        assert_eq!(to_len32(u32::MAX as u64).unwrap(), u32::MAX);
        assert!(matches!(
            to_len32(u32::MAX as u64 + 1),
            Err(TransferError::LengthOverflow(_))
        ));
        assert!(matches!(to_len64(u64::MAX), Err(TransferError::LengthOverflow(_))));
    }
}
