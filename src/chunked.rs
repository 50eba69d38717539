//! Decoder for the AWS streaming signed-payload body framing.
//!
//! Clients that sign each chunk (`x-amz-content-sha256:
//! STREAMING-AWS4-HMAC-SHA256-PAYLOAD` and friends) send bodies framed as:
//!
//! ```text
//! <hex-size>[;chunk-signature=<sig>]\r\n
//! <size bytes of data>\r\n
//! ...
//! 0[;chunk-signature=<sig>]\r\n
//! [trailer-name:value\r\n]*
//! \r\n
//! ```
//!
//! [`ChunkedReader`] strips that framing and yields the plain payload as an
//! [`AsyncRead`]. Signatures are parsed past but not verified.

use std::io;
use std::pin::Pin;
use std::task::{ready, Context, Poll};

use pin_project_lite::pin_project;
use thiserror::Error;
use tokio::io::{AsyncBufRead, AsyncRead, ReadBuf};

/// Largest chunk size accepted from a chunk header (16 MiB).
pub const MAX_CHUNK_SIZE: u64 = 16 * 1024 * 1024;

/// Prefix of `x-amz-content-sha256` values that announce chunked framing.
pub const STREAMING_PAYLOAD_PREFIX: &str = "STREAMING-";

/// Chunk header lines longer than this are rejected as malformed.
const MAX_HEADER_LINE: usize = 4096;

/// Whether a request body with the given `x-amz-content-sha256` value uses
/// the streaming chunked framing.
pub fn is_streaming_payload(content_sha256: &str) -> bool {
    content_sha256.starts_with(STREAMING_PAYLOAD_PREFIX)
}

/// Framing errors. Surfaced through `io::Error` with kind `InvalidData`;
/// use [`ChunkError::from_io`] to recover the typed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ChunkError {
    #[error("invalid chunk format")]
    InvalidChunkFormat,

    #[error("chunk size {size} exceeds maximum of {max} bytes", max = MAX_CHUNK_SIZE)]
    ChunkTooLarge { size: u64 },
}

impl ChunkError {
    /// Extract a `ChunkError` carried inside an `io::Error`, if any.
    pub fn from_io(err: &io::Error) -> Option<ChunkError> {
        err.get_ref()
            .and_then(|inner| inner.downcast_ref::<ChunkError>())
            .copied()
    }
}

impl From<ChunkError> for io::Error {
    fn from(err: ChunkError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    /// Expecting `<hex-size>[;ext...]\r\n`.
    Header,
    /// Inside chunk data with this many bytes left.
    Data { remaining: u64 },
    /// Expecting the CR (or bare LF) that ends chunk data.
    DataEnd,
    /// Saw CR after chunk data, expecting LF.
    DataEndLf,
    /// After the zero-size chunk; discarding trailer lines until a blank one.
    Trailers,
    Done,
    Failed(ChunkError),
}

pin_project! {
    /// Pull-based decoder over a buffered reader of framed bytes.
    ///
    /// Each `poll_read` copies as much of the current chunk as both the
    /// caller's buffer and the underlying buffer allow; the next header is
    /// only parsed once the current chunk is exhausted. Once a framing error
    /// is returned, every later read returns the same error.
    #[derive(Debug)]
    pub struct ChunkedReader<R> {
        #[pin]
        inner: R,
        state: State,
        line: Vec<u8>,
    }
}

impl<R> ChunkedReader<R>
where
    R: AsyncBufRead,
{
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            state: State::Header,
            line: Vec::new(),
        }
    }

    pub fn into_inner(self) -> R {
        self.inner
    }
}

impl<R> AsyncRead for ChunkedReader<R>
where
    R: AsyncBufRead,
{
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut this = self.project();
        loop {
            match *this.state {
                State::Done => return Poll::Ready(Ok(())),
                State::Failed(err) => return Poll::Ready(Err(err.into())),
                State::Header => {
                    let line =
                        match ready!(poll_read_line(this.inner.as_mut(), this.line, cx)) {
                            Ok(line) => line,
                            Err(err) => return Poll::Ready(Err(fail(this.state, err))),
                        };
                    // End of input between chunks is a lenient close.
                    let Some(line) = line else {
                        *this.state = State::Done;
                        continue;
                    };
                    match parse_chunk_size(&line) {
                        Ok(0) => *this.state = State::Trailers,
                        Ok(size) => *this.state = State::Data { remaining: size },
                        Err(err) => {
                            *this.state = State::Failed(err);
                            return Poll::Ready(Err(err.into()));
                        }
                    }
                }
                State::Data { remaining } => {
                    if buf.remaining() == 0 {
                        return Poll::Ready(Ok(()));
                    }
                    let copied = {
                        let available = ready!(this.inner.as_mut().poll_fill_buf(cx))?;
                        if available.is_empty() {
                            return Poll::Ready(Err(io::Error::new(
                                io::ErrorKind::UnexpectedEof,
                                "body ended inside a chunk",
                            )));
                        }
                        let n = available
                            .len()
                            .min(buf.remaining())
                            .min(usize::try_from(remaining).unwrap_or(usize::MAX));
                        buf.put_slice(&available[..n]);
                        n
                    };
                    this.inner.as_mut().consume(copied);
                    let remaining = remaining - copied as u64;
                    *this.state = if remaining == 0 {
                        State::DataEnd
                    } else {
                        State::Data { remaining }
                    };
                    return Poll::Ready(Ok(()));
                }
                State::DataEnd | State::DataEndLf => {
                    let byte = {
                        let available = ready!(this.inner.as_mut().poll_fill_buf(cx))?;
                        match available.first() {
                            Some(&b) => b,
                            None => {
                                return Poll::Ready(Err(fail(
                                    this.state,
                                    ChunkError::InvalidChunkFormat.into(),
                                )))
                            }
                        }
                    };
                    let next = match (*this.state, byte) {
                        (State::DataEnd, b'\r') => State::DataEndLf,
                        (_, b'\n') => State::Header,
                        _ => {
                            *this.state = State::Failed(ChunkError::InvalidChunkFormat);
                            return Poll::Ready(Err(ChunkError::InvalidChunkFormat.into()));
                        }
                    };
                    this.inner.as_mut().consume(1);
                    *this.state = next;
                }
                State::Trailers => {
                    let line =
                        match ready!(poll_read_line(this.inner.as_mut(), this.line, cx)) {
                            Ok(line) => line,
                            Err(err) => return Poll::Ready(Err(fail(this.state, err))),
                        };
                    match line {
                        Some(line) if !line.is_empty() => {}
                        _ => *this.state = State::Done,
                    }
                }
            }
        }
    }
}

/// Latch a framing error into the state so later reads repeat it. Plain
/// I/O errors from the underlying reader pass through without latching.
fn fail(state: &mut State, err: io::Error) -> io::Error {
    if let Some(chunk_err) = ChunkError::from_io(&err) {
        *state = State::Failed(chunk_err);
    }
    err
}

/// Read one `\n`-terminated line into `line`, returning it without the line
/// ending. Returns `None` at end of input when nothing was buffered; a final
/// unterminated line is returned as-is.
fn poll_read_line<R>(
    mut reader: Pin<&mut R>,
    line: &mut Vec<u8>,
    cx: &mut Context<'_>,
) -> Poll<io::Result<Option<Vec<u8>>>>
where
    R: AsyncBufRead + ?Sized,
{
    loop {
        let (complete, used) = {
            let available = ready!(reader.as_mut().poll_fill_buf(cx))?;
            if available.is_empty() {
                if line.is_empty() {
                    return Poll::Ready(Ok(None));
                }
                (true, 0)
            } else if let Some(pos) = available.iter().position(|&b| b == b'\n') {
                line.extend_from_slice(&available[..pos]);
                (true, pos + 1)
            } else {
                line.extend_from_slice(available);
                (false, available.len())
            }
        };
        reader.as_mut().consume(used);

        if line.len() > MAX_HEADER_LINE {
            line.clear();
            return Poll::Ready(Err(ChunkError::InvalidChunkFormat.into()));
        }
        if complete {
            if line.last() == Some(&b'\r') {
                line.pop();
            }
            return Poll::Ready(Ok(Some(std::mem::take(line))));
        }
    }
}

/// Parse the hex size from a chunk header line, ignoring any `;ext=value`
/// extensions.
fn parse_chunk_size(line: &[u8]) -> Result<u64, ChunkError> {
    let size_field = match line.iter().position(|&b| b == b';') {
        Some(pos) => &line[..pos],
        None => line,
    };
    let size_field = size_field.trim_ascii();
    if size_field.is_empty() || !size_field.iter().all(u8::is_ascii_hexdigit) {
        return Err(ChunkError::InvalidChunkFormat);
    }

    let mut size: u64 = 0;
    for &digit in size_field {
        let value = (digit as char)
            .to_digit(16)
            .ok_or(ChunkError::InvalidChunkFormat)?;
        size = size
            .checked_mul(16)
            .and_then(|shifted| shifted.checked_add(u64::from(value)))
            .ok_or(ChunkError::ChunkTooLarge { size: u64::MAX })?;
    }
    if size > MAX_CHUNK_SIZE {
        return Err(ChunkError::ChunkTooLarge { size });
    }
    Ok(size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, BufReader};

    async fn decode(input: &[u8]) -> io::Result<Vec<u8>> {
        let mut reader = ChunkedReader::new(input);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await?;
        Ok(out)
    }

    fn encode(chunks: &[&[u8]]) -> Vec<u8> {
        let mut out = Vec::new();
        for chunk in chunks {
            out.extend_from_slice(format!("{:x};chunk-signature=abc123\r\n", chunk.len()).as_bytes());
            out.extend_from_slice(chunk);
            out.extend_from_slice(b"\r\n");
        }
        out.extend_from_slice(b"0;chunk-signature=final\r\n\r\n");
        out
    }

    #[tokio::test]
    async fn test_single_chunk() {
        let input = b"5;chunk-signature=abc\r\nhello\r\n0;chunk-signature=def\r\n\r\n";
        assert_eq!(decode(input).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_multiple_chunks() {
        let input = b"5;chunk-signature=x\r\nhello\r\n6;chunk-signature=y\r\n world\r\n0;chunk-signature=z\r\n\r\n";
        assert_eq!(decode(input).await.unwrap(), b"hello world");
    }

    #[tokio::test]
    async fn test_chunk_without_signature() {
        let input = b"5\r\nhello\r\n0\r\n\r\n";
        assert_eq!(decode(input).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_large_chunk() {
        let payload = vec![b'a'; 1000];
        let input = encode(&[&payload]);
        assert!(input.starts_with(b"3e8;"));
        assert_eq!(decode(&input).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_empty_body() {
        assert!(decode(b"0;chunk-signature=abc\r\n\r\n").await.unwrap().is_empty());
        assert!(decode(b"").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_small_caller_reads() {
        let input = encode(&[b"hello", b" wonderful", b" world"]);
        let mut reader = ChunkedReader::new(&input[..]);
        let mut out = Vec::new();
        let mut small = [0u8; 3];
        loop {
            let n = reader.read(&mut small).await.unwrap();
            if n == 0 {
                break;
            }
            assert!(n <= 3);
            out.extend_from_slice(&small[..n]);
        }
        assert_eq!(out, b"hello wonderful world");
    }

    #[tokio::test]
    async fn test_one_byte_underlying_reads() {
        let input = encode(&[b"abc", b"defgh"]);
        let inner = BufReader::with_capacity(1, &input[..]);
        let mut reader = ChunkedReader::new(inner);
        let mut out = Vec::new();
        reader.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"abcdefgh");
    }

    #[tokio::test]
    async fn test_trailing_headers_are_discarded() {
        let input = b"5;chunk-signature=a\r\nhello\r\n0;chunk-signature=b\r\nx-amz-checksum-crc32:AAAAAA==\r\nx-amz-trailer-signature:ff\r\n\r\n";
        assert_eq!(decode(input).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_missing_final_blank_line_is_lenient() {
        let input = b"5;chunk-signature=a\r\nhello\r\n0;chunk-signature=b\r\n";
        assert_eq!(decode(input).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_uppercase_hex_size() {
        let payload = vec![b'z'; 0xAB];
        let mut input = b"AB;chunk-signature=sig\r\n".to_vec();
        input.extend_from_slice(&payload);
        input.extend_from_slice(b"\r\n0\r\n\r\n");
        assert_eq!(decode(&input).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_binary_payload() {
        let payload: Vec<u8> = (0..=255u8).chain([b'\r', b'\n', 0, b'\r']).collect();
        let input = encode(&[&payload]);
        assert_eq!(decode(&input).await.unwrap(), payload);
    }

    #[tokio::test]
    async fn test_multiple_extensions() {
        let input = b"5;chunk-signature=abc;foo=bar\r\nhello\r\n0;chunk-signature=def\r\n\r\n";
        assert_eq!(decode(input).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_bare_lf_after_data() {
        let input = b"5;chunk-signature=a\r\nhello\n0\r\n\r\n";
        assert_eq!(decode(input).await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn test_invalid_hex_size() {
        let err = decode(b"zz;chunk-signature=abc\r\nhello\r\n").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
        assert_eq!(ChunkError::from_io(&err), Some(ChunkError::InvalidChunkFormat));
    }

    #[tokio::test]
    async fn test_empty_size_field() {
        let err = decode(b";chunk-signature=abc\r\n").await.unwrap_err();
        assert_eq!(ChunkError::from_io(&err), Some(ChunkError::InvalidChunkFormat));
    }

    #[tokio::test]
    async fn test_chunk_too_large_before_any_data() {
        let input = b"1000001;chunk-signature=abc\r\nhello\r\n";
        let mut reader = ChunkedReader::new(&input[..]);
        let mut buf = [0u8; 16];
        let err = reader.read(&mut buf).await.unwrap_err();
        assert_eq!(
            ChunkError::from_io(&err),
            Some(ChunkError::ChunkTooLarge { size: 0x100_0001 })
        );

        // The error is sticky.
        let err = reader.read(&mut buf).await.unwrap_err();
        assert!(matches!(
            ChunkError::from_io(&err),
            Some(ChunkError::ChunkTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn test_overflowing_size_is_too_large() {
        let err = decode(b"ffffffffffffffffffff\r\n").await.unwrap_err();
        assert!(matches!(
            ChunkError::from_io(&err),
            Some(ChunkError::ChunkTooLarge { .. })
        ));
    }

    #[test]
    fn test_max_chunk_size_header_is_accepted() {
        assert_eq!(parse_chunk_size(b"1000000;chunk-signature=x"), Ok(MAX_CHUNK_SIZE));
    }

    #[tokio::test]
    async fn test_missing_crlf_after_data() {
        let err = decode(b"5;chunk-signature=a\r\nhelloXX0\r\n\r\n").await.unwrap_err();
        assert_eq!(ChunkError::from_io(&err), Some(ChunkError::InvalidChunkFormat));
    }

    #[tokio::test]
    async fn test_truncated_chunk_data() {
        let err = decode(b"a;chunk-signature=a\r\nhello").await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn test_is_streaming_payload() {
        let cases = [
            ("STREAMING-AWS4-HMAC-SHA256-PAYLOAD", true),
            ("STREAMING-UNSIGNED-PAYLOAD-TRAILER", true),
            ("STREAMING-AWS4-HMAC-SHA256-PAYLOAD-TRAILER", true),
            ("UNSIGNED-PAYLOAD", false),
            ("e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855", false),
            ("streaming-aws4-hmac-sha256-payload", false),
            ("", false),
        ];
        for (value, expected) in cases {
            assert_eq!(is_streaming_payload(value), expected, "value: {value:?}");
        }
    }
}
