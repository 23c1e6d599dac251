//! JSON-lines framing over Unix sockets.
//!
//! Every message is one JSON document terminated by `\n`. The server side
//! answers each request line with exactly one response line.

use serde::Serialize;
use serde::de::DeserializeOwned;
use std::future::Future;
use std::io::{Error, ErrorKind};
use std::path::Path;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixStream;

pub const DEFAULT_MAX_LINE_BYTES: usize = 1024 * 1024;

/// Read one JSON line, rejecting lines longer than `max_bytes`.
///
/// Returns `Ok(None)` on a clean EOF. Blank lines are skipped.
pub async fn read_json_line_with_limit<R, T>(
    reader: &mut R,
    max_bytes: usize,
) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    loop {
        let mut buf = Vec::new();
        // One byte over the limit is enough to know the line is too long.
        let limit = u64::try_from(max_bytes).unwrap_or(u64::MAX).saturating_add(1);
        let n = (&mut *reader).take(limit).read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Ok(None);
        }

        let line_len = buf.strip_suffix(b"\n").map_or(buf.len(), <[u8]>::len);
        if line_len > max_bytes {
            if !buf.ends_with(b"\n") {
                discard_rest_of_line(reader).await?;
            }
            return Err(Error::new(
                ErrorKind::InvalidData,
                format!("json line exceeds max length ({max_bytes} bytes)"),
            ));
        }

        let text =
            std::str::from_utf8(&buf).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
        if text.trim().is_empty() {
            continue;
        }

        return serde_json::from_str::<T>(text)
            .map(Some)
            .map_err(|e| Error::new(ErrorKind::InvalidData, e));
    }
}

async fn discard_rest_of_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let chunk = reader.fill_buf().await?;
        if chunk.is_empty() {
            return Ok(());
        }
        if let Some(pos) = chunk.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = chunk.len();
        reader.consume(len);
    }
}

pub async fn read_json_line<R, T>(reader: &mut R) -> std::io::Result<Option<T>>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    read_json_line_with_limit(reader, DEFAULT_MAX_LINE_BYTES).await
}

pub async fn write_json_line<W, T>(writer: &mut W, value: &T) -> std::io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut line =
        serde_json::to_vec(value).map_err(|e| Error::new(ErrorKind::InvalidData, e))?;
    line.push(b'\n');
    writer.write_all(&line).await?;
    writer.flush().await
}

/// Serve request/response pairs on one connection until the peer closes it.
///
/// Lines that fail to parse are answered with `invalid_response` and the
/// connection stays open.
pub async fn serve_jsonl_connection<Req, Resp, F, Fut, InvalidResp>(
    stream: UnixStream,
    handler: F,
    invalid_response: InvalidResp,
) -> std::io::Result<()>
where
    Req: DeserializeOwned,
    Resp: Serialize,
    F: Fn(Req) -> Fut,
    Fut: Future<Output = Resp>,
    InvalidResp: Fn(Error) -> Resp,
{
    let (reader, mut writer) = stream.into_split();
    let mut reader = BufReader::new(reader);

    loop {
        let request = match read_json_line::<_, Req>(&mut reader).await {
            Ok(Some(request)) => request,
            Ok(None) => break,
            Err(e) if e.kind() == ErrorKind::InvalidData => {
                write_json_line(&mut writer, &invalid_response(e)).await?;
                continue;
            }
            Err(e) => return Err(e),
        };

        let response = handler(request).await;
        write_json_line(&mut writer, &response).await?;
    }

    Ok(())
}

/// Send one request to the socket at `path` and wait for its response.
pub async fn request<Req, Resp>(path: impl AsRef<Path>, req: &Req) -> std::io::Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    let stream = UnixStream::connect(path.as_ref()).await?;
    let (reader, mut writer) = stream.into_split();
    write_json_line(&mut writer, req).await?;

    let mut reader = BufReader::new(reader);
    read_json_line(&mut reader).await?.ok_or_else(|| {
        Error::new(
            ErrorKind::UnexpectedEof,
            "server closed the connection without responding",
        )
    })
}

/// [`request`] bounded by `timeout`.
pub async fn request_with_timeout<Req, Resp>(
    path: impl AsRef<Path>,
    req: &Req,
    timeout: Duration,
) -> std::io::Result<Resp>
where
    Req: Serialize,
    Resp: DeserializeOwned,
{
    match tokio::time::timeout(timeout, request(path, req)).await {
        Ok(result) => result,
        Err(_) => Err(Error::new(
            ErrorKind::TimedOut,
            format!("no response within {}s", timeout.as_secs()),
        )),
    }
}
