//! Frame layer and handshake.
//!
//! Every frame on the wire is a varint length prefix followed by that many
//! payload bytes. One logical RPC message is two consecutive frames: the
//! encoded [`Header`], then the body. The very first bytes on a connection
//! are not a frame but the handshake: one JSON-encoded [`Options`] record
//! terminated by a newline, after which the negotiated codec takes over.
//!
//! A connection is split into a buffered read half and a buffered write
//! half. Each side of a session owns exactly one read half; a write half
//! has a single owner at a time (a dedicated write task, or a slot behind
//! a mutex) so concurrent senders cannot interleave messages.

use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};

use crate::codec::Encoding;
use crate::error::Error;

/// First field of every handshake; connections that do not open with it
/// are not speaking this protocol.
pub const MAGIC: u32 = 0x3bef5c;

/// Maximum varint width for a length prefix.
const MAX_VARINT_LEN: usize = 10;

/// Frames longer than this are rejected without being read.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

/// Per-call message header, exchanged in both directions.
///
/// The server echoes `seq` so responses can be matched to requests in any
/// order. An empty `error` means success; on failures the body is an empty
/// sentinel frame and `error` carries the message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Header {
    /// Dotted endpoint name, `"Service.Method"`.
    pub service_method: String,
    /// Connection-scoped sequence number chosen by the client.
    pub seq: u64,
    /// Error message; empty on success.
    pub error: String,
}

/// Handshake record, the first datum on every connection.
///
/// Durations ride the wire as integer nanoseconds so the record stays a
/// flat JSON object of numbers and strings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Options {
    pub magic: u32,
    /// Codec tag for everything after the handshake, see [`Encoding`].
    pub codec_type: String,
    /// Budget for connect + handshake on the dialing side; zero disables.
    #[serde(with = "duration_ns")]
    pub connect_timeout: Duration,
    /// Per-request handler budget enforced by the server; zero disables.
    #[serde(with = "duration_ns")]
    pub handle_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            magic: MAGIC,
            codec_type: Encoding::Postcard.tag().to_string(),
            connect_timeout: Duration::from_secs(10),
            handle_timeout: Duration::ZERO,
        }
    }
}

impl Options {
    /// Default options with a different codec.
    pub fn with_codec(encoding: Encoding) -> Self {
        Options {
            codec_type: encoding.tag().to_string(),
            ..Options::default()
        }
    }
}

mod duration_ns {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_nanos() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let ns = u64::deserialize(d)?;
        Ok(Duration::from_nanos(ns))
    }
}

/// Encode a u64 as a varint. Returns the number of bytes written.
fn encode_varint(mut value: u64, buf: &mut [u8; MAX_VARINT_LEN]) -> usize {
    let mut i = 0;
    loop {
        let byte = (value & 0x7F) as u8;
        value >>= 7;
        if value == 0 {
            buf[i] = byte;
            return i + 1;
        }
        buf[i] = byte | 0x80;
        i += 1;
    }
}

/// Outcome of reading a length prefix.
enum Prefix {
    Len(u64),
    /// Stream ended cleanly before any prefix byte: graceful close.
    CleanEof,
}

/// Buffered, framed read half of a connection.
pub struct FrameReader {
    reader: BufReader<Box<dyn AsyncRead + Send + Unpin>>,
}

impl FrameReader {
    pub fn new<R>(reader: R) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        FrameReader {
            reader: BufReader::new(Box::new(reader)),
        }
    }

    /// Read the newline-terminated handshake record.
    pub async fn read_handshake(&mut self) -> Result<Options, Error> {
        let mut line = Vec::new();
        let n = self.reader.read_until(b'\n', &mut line).await?;
        if n == 0 {
            return Err(Error::TruncatedFrame);
        }
        serde_json::from_slice(&line).map_err(|e| Error::Decode(e.to_string()))
    }

    async fn read_prefix(&mut self) -> Result<Prefix, Error> {
        let mut value: u64 = 0;
        let mut shift: u32 = 0;
        for bytes_read in 0..MAX_VARINT_LEN {
            let mut byte = [0u8; 1];
            match self.reader.read_exact(&mut byte).await {
                Ok(_) => {}
                Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    if bytes_read == 0 {
                        return Ok(Prefix::CleanEof);
                    }
                    return Err(Error::TruncatedFrame);
                }
                Err(e) => return Err(e.into()),
            }
            value |= ((byte[0] & 0x7F) as u64) << shift;
            if byte[0] & 0x80 == 0 {
                return Ok(Prefix::Len(value));
            }
            shift += 7;
        }
        Err(Error::VarintOverflow)
    }

    /// Read one frame. `None` means the peer closed cleanly between frames.
    pub async fn read_frame(&mut self) -> Result<Option<Vec<u8>>, Error> {
        let len = match self.read_prefix().await? {
            Prefix::CleanEof => return Ok(None),
            Prefix::Len(len) => len as usize,
        };
        if len > MAX_FRAME_LEN {
            return Err(Error::FrameTooLarge {
                len,
                max: MAX_FRAME_LEN,
            });
        }
        let mut payload = vec![0u8; len];
        match self.reader.read_exact(&mut payload).await {
            Ok(_) => Ok(Some(payload)),
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => Err(Error::TruncatedFrame),
            Err(e) => Err(e.into()),
        }
    }

    /// Read and decode a message header. `None` means clean EOF.
    pub async fn read_header(&mut self, encoding: Encoding) -> Result<Option<Header>, Error> {
        match self.read_frame().await? {
            None => Ok(None),
            Some(bytes) => encoding.decode(&bytes).map(Some),
        }
    }

    /// Read the body frame that must follow a header frame.
    ///
    /// EOF here is never clean: the peer hung up in the middle of a
    /// message. Callers that want to discard a body simply drop the bytes.
    pub async fn read_body(&mut self) -> Result<Vec<u8>, Error> {
        match self.read_frame().await? {
            None => Err(Error::TruncatedFrame),
            Some(bytes) => Ok(bytes),
        }
    }
}

/// Buffered, framed write half of a connection.
pub struct FrameWriter {
    writer: BufWriter<Box<dyn AsyncWrite + Send + Unpin>>,
}

impl FrameWriter {
    pub fn new<W>(writer: W) -> Self
    where
        W: AsyncWrite + Send + Unpin + 'static,
    {
        FrameWriter {
            writer: BufWriter::new(Box::new(writer)),
        }
    }

    /// Write the newline-terminated handshake record and flush.
    pub async fn write_handshake(&mut self, options: &Options) -> Result<(), Error> {
        let mut line = serde_json::to_vec(options).map_err(|e| Error::Encode(e.to_string()))?;
        line.push(b'\n');
        self.writer.write_all(&line).await?;
        self.writer.flush().await?;
        Ok(())
    }

    async fn write_frame(&mut self, payload: &[u8]) -> Result<(), Error> {
        let mut prefix = [0u8; MAX_VARINT_LEN];
        let prefix_len = encode_varint(payload.len() as u64, &mut prefix);
        self.writer.write_all(&prefix[..prefix_len]).await?;
        if !payload.is_empty() {
            self.writer.write_all(payload).await?;
        }
        Ok(())
    }

    /// Write one complete message (header frame + body frame) and flush.
    ///
    /// The caller must hold whatever lock serializes writes on this
    /// connection for the whole call, so the two frames stay adjacent.
    pub async fn write_message(
        &mut self,
        encoding: Encoding,
        header: &Header,
        body: &[u8],
    ) -> Result<(), Error> {
        let header_bytes = encoding.encode(header)?;
        self.write_frame(&header_bytes).await?;
        self.write_frame(body).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Shut the write half down, flushing buffered bytes first.
    pub async fn shutdown(&mut self) -> Result<(), Error> {
        self.writer.shutdown().await?;
        Ok(())
    }
}

/// Split a bidirectional stream into framed halves.
pub fn split<S>(stream: S) -> (FrameReader, FrameWriter)
where
    S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
{
    let (r, w) = tokio::io::split(stream);
    (FrameReader::new(r), FrameWriter::new(w))
}

#[cfg(test)]
mod tests {
    use super::*;

    // The writer side owns its whole duplex stream so dropping it closes
    // the connection and the reader observes EOF.
    fn pipe() -> (FrameReader, FrameWriter) {
        let (a, b) = tokio::io::duplex(64 * 1024);
        (FrameReader::new(a), FrameWriter::new(b))
    }

    #[test]
    fn varint_widths() {
        let mut buf = [0u8; MAX_VARINT_LEN];
        assert_eq!(encode_varint(0, &mut buf), 1);
        assert_eq!(encode_varint(127, &mut buf), 1);
        assert_eq!(encode_varint(128, &mut buf), 2);
        assert_eq!(encode_varint(u64::MAX, &mut buf), 10);
    }

    #[tokio::test]
    async fn message_round_trip() {
        let (mut reader, mut writer) = pipe();
        let header = Header {
            service_method: "Foo.Sum".to_string(),
            seq: 7,
            error: String::new(),
        };
        writer
            .write_message(Encoding::Postcard, &header, b"hello")
            .await
            .unwrap();
        let got = reader
            .read_header(Encoding::Postcard)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, header);
        assert_eq!(reader.read_body().await.unwrap(), b"hello");
    }

    #[tokio::test]
    async fn empty_body_frame() {
        let (mut reader, mut writer) = pipe();
        writer
            .write_message(Encoding::Json, &Header::default(), &[])
            .await
            .unwrap();
        reader.read_header(Encoding::Json).await.unwrap().unwrap();
        assert!(reader.read_body().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn clean_eof_between_frames() {
        let (mut reader, writer) = pipe();
        drop(writer);
        assert!(reader.read_frame().await.unwrap().is_none());
        assert!(reader
            .read_header(Encoding::Postcard)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn eof_where_a_body_is_due_is_truncation() {
        let (mut reader, mut writer) = pipe();
        writer
            .write_message(Encoding::Postcard, &Header::default(), b"x")
            .await
            .unwrap();
        drop(writer);
        reader
            .read_header(Encoding::Postcard)
            .await
            .unwrap()
            .unwrap();
        reader.read_body().await.unwrap();
        assert!(matches!(reader.read_body().await, Err(Error::TruncatedFrame)));
    }

    #[tokio::test]
    async fn truncated_varint_is_an_error() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(a);
        // A continuation bit with no following byte, then the stream dies.
        b.write_all(&[0x80]).await.unwrap();
        drop(b);
        assert!(matches!(reader.read_frame().await, Err(Error::TruncatedFrame)));
    }

    #[tokio::test]
    async fn overlong_varint_is_rejected() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(a);
        b.write_all(&[0x80; 10]).await.unwrap();
        assert!(matches!(reader.read_frame().await, Err(Error::VarintOverflow)));
    }

    #[tokio::test]
    async fn oversize_frame_is_rejected() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(a);
        let mut prefix = [0u8; MAX_VARINT_LEN];
        let n = encode_varint((MAX_FRAME_LEN + 1) as u64, &mut prefix);
        b.write_all(&prefix[..n]).await.unwrap();
        assert!(matches!(
            reader.read_frame().await,
            Err(Error::FrameTooLarge { .. })
        ));
    }

    #[tokio::test]
    async fn handshake_round_trip() {
        let (mut reader, mut writer) = pipe();
        let options = Options {
            handle_timeout: Duration::from_millis(250),
            ..Options::default()
        };
        writer.write_handshake(&options).await.unwrap();
        let got = reader.read_handshake().await.unwrap();
        assert_eq!(got.magic, MAGIC);
        assert_eq!(got.codec_type, "application/postcard");
        assert_eq!(got.connect_timeout, Duration::from_secs(10));
        assert_eq!(got.handle_timeout, Duration::from_millis(250));
    }

    #[test]
    fn handshake_is_a_flat_json_record() {
        let options = Options::default();
        let line = serde_json::to_value(&options).unwrap();
        assert_eq!(line["magic"], MAGIC);
        assert_eq!(line["connect_timeout"], 10_000_000_000u64);
        assert_eq!(line["handle_timeout"], 0);
    }

    #[tokio::test]
    async fn garbage_handshake_fails_decode() {
        let (a, mut b) = tokio::io::duplex(64);
        let mut reader = FrameReader::new(a);
        b.write_all(b"not json\n").await.unwrap();
        assert!(matches!(reader.read_handshake().await, Err(Error::Decode(_))));
    }
}
