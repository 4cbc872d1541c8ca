//! Newline-delimited JSON framing shared by the command channel and the relay.

use std::io;

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};

/// Serialize `value` as one line and flush it.
pub async fn write_line<W, T>(writer: &mut W, value: &T) -> io::Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let mut json =
        serde_json::to_string(value).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    json.push('\n');
    writer.write_all(json.as_bytes()).await?;
    writer.flush().await
}

/// Read the next non-empty line. EOF is reported as `UnexpectedEof`.
pub async fn read_line<R>(reader: &mut R) -> io::Result<String>
where
    R: AsyncBufRead + Unpin,
{
    let mut line = String::new();
    loop {
        line.clear();
        let n = reader.read_line(&mut line).await?;
        if n == 0 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "peer closed connection",
            ));
        }
        if !line.trim().is_empty() {
            return Ok(line);
        }
    }
}

/// Read one line and decode it, treating a decode failure as a broken stream.
pub async fn read_json<R, T>(reader: &mut R) -> io::Result<T>
where
    R: AsyncBufRead + Unpin,
    T: DeserializeOwned,
{
    let line = read_line(reader).await?;
    serde_json::from_str(&line).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{Value, json};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn lines_are_newline_terminated_json() {
        let mut buf = Vec::new();
        write_line(&mut buf, &json!({"cmd": "ping"})).await.unwrap();
        assert_eq!(buf, b"{\"cmd\":\"ping\"}\n");
    }

    #[tokio::test]
    async fn blank_lines_are_skipped() {
        let input: &[u8] = b"\n  \n{\"cmd\":\"get\"}\n";
        let mut reader = BufReader::new(input);
        let value: Value = read_json(&mut reader).await.unwrap();
        assert_eq!(value["cmd"], "get");
    }

    #[tokio::test]
    async fn eof_is_unexpected() {
        let input: &[u8] = b"";
        let mut reader = BufReader::new(input);
        let err = read_line(&mut reader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }
}
