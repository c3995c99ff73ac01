// Copyright (C) 2025 Joseph Sacchini
//
// This program is free software: you can redistribute it and/or modify it under
// the terms of the GNU Affero General Public License as published by the Free
// Software Foundation, version 3.
//
// This program is distributed in the hope that it will be useful, but WITHOUT
// ANY WARRANTY; without even the implied warranty of MERCHANTABILITY or FITNESS
// FOR A PARTICULAR PURPOSE. See the GNU Affero General Public License for more
// details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Length-free JSON-newline framing, shared by the IPC server and the
//! plugin RPC transport: one `serde_json`-encodable value per line.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, thiserror::Error)]
pub enum FramingError {
    #[error("connection closed")]
    Closed,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Read one newline-terminated JSON value from `reader`. Returns
/// `Err(FramingError::Closed)` on EOF with no bytes read.
pub async fn read_frame<R, T>(reader: &mut BufReader<R>) -> Result<T, FramingError>
where
    R: tokio::io::AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut line = String::new();
    let n = reader.read_line(&mut line).await?;
    if n == 0 {
        return Err(FramingError::Closed);
    }
    Ok(serde_json::from_str(line.trim_end())?)
}

/// Write `value` as one line of JSON terminated by `\n`, flushing
/// immediately so the peer observes it without buffering delay.
pub async fn write_frame<W, T>(writer: &mut W, value: &T) -> Result<(), FramingError>
where
    W: tokio::io::AsyncWrite + Unpin,
    T: Serialize,
{
    let mut rendered = serde_json::to_string(value)?;
    rendered.push('\n');
    writer.write_all(rendered.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn round_trips_a_value() {
        let mut buf = Vec::new();
        write_frame(&mut buf, &json!({"a": 1})).await.unwrap();
        assert_eq!(buf, b"{\"a\":1}\n");

        let mut reader = BufReader::new(buf.as_slice());
        let value: serde_json::Value = read_frame(&mut reader).await.unwrap();
        assert_eq!(value, json!({"a": 1}));
    }

    #[tokio::test]
    async fn empty_stream_is_closed() {
        let mut reader = BufReader::new(&b""[..]);
        let result: Result<serde_json::Value, FramingError> = read_frame(&mut reader).await;
        assert!(matches!(result, Err(FramingError::Closed)));
    }
}
