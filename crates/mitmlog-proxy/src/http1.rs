//! Byte-exact HTTP/1.1 message framing.
//!
//! The plaintext relay forwards messages verbatim, so the readers here keep
//! every byte they consume and only parse as much as needed to find where a
//! message ends. Heads are buffered; bodies are passed on piece by piece as
//! they arrive.

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::RelayError;

/// Upper bound on a message head (request/status line plus headers).
pub const MAX_HEAD_SIZE: usize = 64 * 1024;

/// Upper bound on a chunk-size or trailer line.
const MAX_LINE_SIZE: usize = 8 * 1024;

const MAX_HEADERS: usize = 128;

/// Start line of a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestHead {
    /// Request method.
    pub method: String,
    /// Request target as sent.
    pub target: String,
}

/// What the relay needs to know about a response once it has been copied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResponseHead {
    /// Status code.
    pub status: u16,
    /// The body ran until the upstream closed the connection.
    pub close_delimited: bool,
}

impl ResponseHead {
    /// Interim response that is followed by another one for the same request.
    pub fn is_interim(&self) -> bool {
        is_interim(self.status)
    }

    /// Upstream switched protocols; the stream is no longer HTTP.
    pub fn is_upgrade(&self) -> bool {
        self.status == 101
    }
}

/// One complete request as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRequest {
    /// Request method.
    pub method: String,
    /// Request target as sent.
    pub target: String,
    /// Head and body bytes exactly as received.
    pub bytes: Vec<u8>,
}

/// One complete response as read from the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawResponse {
    /// Status code.
    pub status: u16,
    /// Head and body bytes exactly as received.
    pub bytes: Vec<u8>,
    /// The body ran until the upstream closed the connection.
    pub close_delimited: bool,
}

impl RawResponse {
    /// Interim response that is followed by another one for the same request.
    pub fn is_interim(&self) -> bool {
        is_interim(self.status)
    }

    /// Upstream switched protocols; the stream is no longer HTTP.
    pub fn is_upgrade(&self) -> bool {
        self.status == 101
    }
}

fn is_interim(status: u16) -> bool {
    (100..200).contains(&status) && status != 101
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BodyKind {
    Empty,
    Length(u64),
    Chunked,
    UntilClose,
}

/// Framing-relevant headers.
#[derive(Debug, Default)]
struct Framing {
    transfer_encoding: bool,
    chunked: bool,
    content_length: Option<u64>,
}

impl Framing {
    fn from_headers(headers: &[httparse::Header<'_>]) -> Result<Self, RelayError> {
        let mut framing = Framing::default();

        for header in headers {
            if header.name.eq_ignore_ascii_case("transfer-encoding") {
                let value = std::str::from_utf8(header.value)
                    .map_err(|_| RelayError::UnsupportedTransferEncoding)?;
                framing.transfer_encoding = true;
                // Only the final coding decides whether the body is chunked
                framing.chunked = value
                    .rsplit(',')
                    .next()
                    .map(|coding| coding.trim().eq_ignore_ascii_case("chunked"))
                    .unwrap_or(false);
            } else if header.name.eq_ignore_ascii_case("content-length") {
                let length = parse_content_length(header.value)?;
                match framing.content_length {
                    Some(previous) if previous != length => {
                        return Err(RelayError::InvalidContentLength)
                    }
                    _ => framing.content_length = Some(length),
                }
            }
        }

        Ok(framing)
    }
}

/// Plain ASCII digits; a sign or anything else is rejected.
fn parse_content_length(value: &[u8]) -> Result<u64, RelayError> {
    let value = std::str::from_utf8(value)
        .map_err(|_| RelayError::InvalidContentLength)?
        .trim();
    if value.is_empty() || !value.bytes().all(|b| b.is_ascii_digit()) {
        return Err(RelayError::InvalidContentLength);
    }
    value.parse().map_err(|_| RelayError::InvalidContentLength)
}

/// Size from a chunk-size line, ignoring extensions.
fn parse_chunk_size(line: &[u8]) -> Result<u64, RelayError> {
    let line = std::str::from_utf8(line).map_err(|_| RelayError::InvalidChunk)?;
    let size = line
        .trim_end_matches(['\r', '\n'])
        .split(';')
        .next()
        .map(str::trim)
        .unwrap_or_default();
    if size.is_empty() || !size.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(RelayError::InvalidChunk);
    }
    u64::from_str_radix(size, 16).map_err(|_| RelayError::InvalidChunk)
}

fn parse_request_head(head: &[u8]) -> Result<(RequestHead, BodyKind), RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut request = httparse::Request::new(&mut headers);
    if request.parse(head)?.is_partial() {
        return Err(RelayError::Truncated);
    }

    let framing = Framing::from_headers(request.headers)?;
    let body = if framing.chunked {
        BodyKind::Chunked
    } else if framing.transfer_encoding {
        return Err(RelayError::UnsupportedTransferEncoding);
    } else {
        match framing.content_length {
            Some(0) | None => BodyKind::Empty,
            Some(length) => BodyKind::Length(length),
        }
    };

    let start = RequestHead {
        method: request.method.unwrap_or_default().to_string(),
        target: request.path.unwrap_or_default().to_string(),
    };
    Ok((start, body))
}

fn parse_response_head(head: &[u8], request_method: &str) -> Result<(u16, BodyKind), RelayError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut response = httparse::Response::new(&mut headers);
    if response.parse(head)?.is_partial() {
        return Err(RelayError::Truncated);
    }

    let status = response.code.unwrap_or_default();
    let framing = Framing::from_headers(response.headers)?;
    let body = if request_method.eq_ignore_ascii_case("HEAD")
        || (100..200).contains(&status)
        || status == 204
        || status == 304
    {
        BodyKind::Empty
    } else if framing.chunked {
        BodyKind::Chunked
    } else if framing.transfer_encoding {
        BodyKind::UntilClose
    } else {
        match framing.content_length {
            Some(0) => BodyKind::Empty,
            Some(length) => BodyKind::Length(length),
            None => BodyKind::UntilClose,
        }
    };

    Ok((status, body))
}

/// Reads one request into memory.
///
/// Returns `Ok(None)` when the peer closed cleanly before sending anything.
pub async fn read_request<R>(reader: &mut R) -> Result<Option<RawRequest>, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut bytes = Vec::new();
    let Some(head) = copy_request(reader, &mut bytes).await? else {
        return Ok(None);
    };

    Ok(Some(RawRequest {
        method: head.method,
        target: head.target,
        bytes,
    }))
}

/// Copies one request from `reader` to `writer` without altering it.
///
/// The head is written once complete, the body as it arrives. Returns
/// `Ok(None)` when the peer closed cleanly before sending anything.
pub async fn copy_request<R, W>(reader: &mut R, writer: &mut W) -> Result<Option<RequestHead>, RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    if !read_head(reader, &mut head).await? {
        return Ok(None);
    }
    let (start, body) = parse_request_head(&head)?;

    writer.write_all(&head).await?;
    writer.flush().await?;
    copy_body(reader, writer, body).await?;

    Ok(Some(start))
}

/// Reads one response to a request made with `request_method` into memory.
pub async fn read_response<R>(reader: &mut R, request_method: &str) -> Result<RawResponse, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let mut bytes = Vec::new();
    let head = copy_response(reader, &mut bytes, request_method).await?;

    Ok(RawResponse {
        status: head.status,
        bytes,
        close_delimited: head.close_delimited,
    })
}

/// Copies one response from `reader` to `writer` without altering it.
///
/// Bytes already written stay written if the body turns out truncated.
pub async fn copy_response<R, W>(
    reader: &mut R,
    writer: &mut W,
    request_method: &str,
) -> Result<ResponseHead, RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut head = Vec::new();
    if !read_head(reader, &mut head).await? {
        return Err(RelayError::NoResponse);
    }
    let (status, body) = parse_response_head(&head, request_method)?;

    writer.write_all(&head).await?;
    writer.flush().await?;
    copy_body(reader, writer, body).await?;

    Ok(ResponseHead {
        status,
        close_delimited: body == BodyKind::UntilClose,
    })
}

/// Appends a message head to `buf`.
///
/// Returns `false` on a clean EOF before the first byte. Empty lines ahead of
/// the start line are skipped.
async fn read_head<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<bool, RelayError>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let start = buf.len();
        let budget = (MAX_HEAD_SIZE + 1).saturating_sub(start) as u64;
        let read = (&mut *reader).take(budget).read_until(b'\n', buf).await?;

        if read == 0 {
            if buf.is_empty() {
                return Ok(false);
            }
            return Err(RelayError::Truncated);
        }
        if buf.len() > MAX_HEAD_SIZE {
            return Err(RelayError::HeadTooLarge(MAX_HEAD_SIZE));
        }
        if !buf.ends_with(b"\n") {
            return Err(RelayError::Truncated);
        }

        let line = &buf[start..];
        if line == b"\r\n" || line == b"\n" {
            if start == 0 {
                buf.clear();
                continue;
            }
            return Ok(true);
        }
    }
}

async fn copy_body<R, W>(reader: &mut R, writer: &mut W, kind: BodyKind) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match kind {
        BodyKind::Empty => Ok(()),
        BodyKind::Length(length) => copy_exact(reader, writer, length).await,
        BodyKind::Chunked => copy_chunked(reader, writer).await,
        BodyKind::UntilClose => copy_until_close(reader, writer).await,
    }
}

async fn copy_chunked<R, W>(reader: &mut R, writer: &mut W) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut line = Vec::new();
    loop {
        line.clear();
        read_line(reader, &mut line).await?;
        let size = parse_chunk_size(&line)?;
        writer.write_all(&line).await?;

        if size == 0 {
            // Trailer section ends with an empty line
            loop {
                line.clear();
                read_line(reader, &mut line).await?;
                writer.write_all(&line).await?;
                if line == b"\r\n" || line == b"\n" {
                    writer.flush().await?;
                    return Ok(());
                }
            }
        }

        copy_exact(reader, writer, size).await?;

        line.clear();
        read_line(reader, &mut line).await?;
        if line != b"\r\n" {
            return Err(RelayError::InvalidChunk);
        }
        writer.write_all(&line).await?;
        writer.flush().await?;
    }
}

async fn read_line<R>(reader: &mut R, buf: &mut Vec<u8>) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
{
    let read = (&mut *reader)
        .take(MAX_LINE_SIZE as u64)
        .read_until(b'\n', buf)
        .await?;

    if read == 0 || !buf.ends_with(b"\n") {
        if read == MAX_LINE_SIZE {
            return Err(RelayError::InvalidChunk);
        }
        return Err(RelayError::Truncated);
    }
    Ok(())
}

/// Copies exactly `length` bytes, flushing after every piece read.
async fn copy_exact<R, W>(reader: &mut R, writer: &mut W, mut length: u64) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    while length > 0 {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Err(RelayError::Truncated);
        }
        let n = available
            .len()
            .min(usize::try_from(length).unwrap_or(usize::MAX));

        writer.write_all(&available[..n]).await?;
        reader.consume(n);
        writer.flush().await?;
        length -= n as u64;
    }
    Ok(())
}

async fn copy_until_close<R, W>(reader: &mut R, writer: &mut W) -> Result<(), RelayError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        let n = available.len();

        writer.write_all(available).await?;
        reader.consume(n);
        writer.flush().await?;
    }
}
