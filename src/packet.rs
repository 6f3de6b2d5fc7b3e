//! Wire frames.
//!
//! One frame carries one command plus its argument array:
//!
//! ```text
//! +-----------+-----------+--------------+--------------+
//! | u32 (BE)  | u32 (BE)  | command json | args json    |
//! | body len  | cmd len   |              |              |
//! +-----------+-----------+--------------+--------------+
//! ```
//!
//! The command section is length-delimited on its own so a broker can route
//! a frame without parsing the arguments, and fan-out forwards the received
//! bytes untouched (`Bytes` buffers are reference-counted; one frame in, N
//! writes out, zero re-encodes).

use bytes::{BufMut, Bytes, BytesMut};
use serde_json::Value;
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::command::Command;
use crate::error::{BusError, Result};

/// Upper bound on one frame body, guarding against corrupt length prefixes.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Byte stream that can carry frames (TCP or UDS, behind one object).
pub(crate) trait FrameStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Unpin> FrameStream for T {}

/// One encoded command + args unit, held in its full wire form.
#[derive(Debug, Clone)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Serialize a command and its arguments into a frame.
    pub fn encode(command: &Command, args: &[Value]) -> Result<Frame> {
        let cmd = serde_json::to_vec(command)?;
        let args = serde_json::to_vec(args)?;
        let body_len = 4 + cmd.len() + args.len();
        if body_len > MAX_FRAME_SIZE {
            return Err(BusError::Io(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body of {body_len} bytes exceeds limit"),
            )));
        }
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.put_u32(cmd.len() as u32);
        buf.put_slice(&cmd);
        buf.put_slice(&args);
        Ok(Frame {
            bytes: buf.freeze(),
        })
    }

    /// Decode only the command section.
    pub fn command(&self) -> Result<Command> {
        Ok(serde_json::from_slice(self.command_section()?)?)
    }

    /// Decode only the argument array.
    pub fn args(&self) -> Result<Vec<Value>> {
        let start = 8 + self.command_len()?;
        Ok(serde_json::from_slice(&self.bytes[start..])?)
    }

    /// Decode the whole frame.
    pub fn decode(&self) -> Result<(Command, Vec<Value>)> {
        Ok((self.command()?, self.args()?))
    }

    /// Full wire form, outer length prefix included. Cloning is cheap.
    pub fn bytes(&self) -> Bytes {
        self.bytes.clone()
    }

    /// Total size on the wire.
    pub fn wire_len(&self) -> usize {
        self.bytes.len()
    }

    fn command_len(&self) -> Result<usize> {
        let raw: [u8; 4] = self.bytes[4..8]
            .try_into()
            .map_err(|_| truncated("command length"))?;
        Ok(u32::from_be_bytes(raw) as usize)
    }

    fn command_section(&self) -> Result<&[u8]> {
        let len = self.command_len()?;
        self.bytes
            .get(8..8 + len)
            .ok_or_else(|| truncated("command section"))
    }

    /// Read one frame. `Ok(None)` on a cleanly closed stream.
    pub async fn read_from<R>(reader: &mut R) -> io::Result<Option<Frame>>
    where
        R: AsyncRead + Unpin,
    {
        let body_len = match reader.read_u32().await {
            Ok(len) => len as usize,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e),
        };
        if body_len < 4 || body_len > MAX_FRAME_SIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("frame body length {body_len} out of bounds"),
            ));
        }
        let mut buf = BytesMut::with_capacity(4 + body_len);
        buf.put_u32(body_len as u32);
        buf.resize(4 + body_len, 0);
        reader.read_exact(&mut buf[4..]).await?;
        Ok(Some(Frame {
            bytes: buf.freeze(),
        }))
    }

    /// Write the frame and flush.
    pub async fn write_to<W>(&self, writer: &mut W) -> io::Result<()>
    where
        W: AsyncWrite + Unpin,
    {
        writer.write_all(&self.bytes).await?;
        writer.flush().await
    }
}

fn truncated(what: &str) -> BusError {
    BusError::Io(io::Error::new(
        io::ErrorKind::InvalidData,
        format!("truncated frame: {what}"),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{Command, Peer, ProcessInfo, ProcessKind};
    use serde_json::json;

    fn sample_command() -> Command {
        Command::message("news", Peer::new(ProcessInfo::current(ProcessKind::Node)))
    }

    #[tokio::test]
    async fn test_frame_round_trips_over_a_stream() {
        let command = sample_command();
        let args = vec![json!({"headline": "hello"}), json!(42)];
        let frame = Frame::encode(&command, &args).unwrap();

        let (mut a, mut b) = tokio::io::duplex(1024);
        frame.write_to(&mut a).await.unwrap();
        drop(a);

        let received = Frame::read_from(&mut b).await.unwrap().unwrap();
        assert_eq!(received.wire_len(), frame.wire_len());
        let (cmd, got_args) = received.decode().unwrap();
        assert_eq!(cmd, command);
        assert_eq!(got_args, args);

        // stream is now cleanly closed
        assert!(Frame::read_from(&mut b).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_command_section_decodes_without_args() {
        let command = sample_command();
        let frame = Frame::encode(&command, &[json!("payload")]).unwrap();
        assert_eq!(frame.command().unwrap(), command);
        assert_eq!(frame.args().unwrap(), vec![json!("payload")]);
    }

    #[tokio::test]
    async fn test_oversized_length_prefix_is_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);
        AsyncWriteExt::write_u32(&mut a, (MAX_FRAME_SIZE + 1) as u32)
            .await
            .unwrap();
        let err = Frame::read_from(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_torn_frame_surfaces_an_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        AsyncWriteExt::write_u32(&mut a, 100).await.unwrap();
        AsyncWriteExt::write_all(&mut a, &[1, 2, 3]).await.unwrap();
        drop(a);
        assert!(Frame::read_from(&mut b).await.is_err());
    }
}
