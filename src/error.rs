use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;

/// Error type shared by every layer of the crate.
///
/// Errors that terminate a connection fan out to every pending call on it,
/// so the type is `Clone`; I/O errors are wrapped in an `Arc` to keep that
/// cheap. Errors observable by a peer travel as plain strings in the
/// response header, which is why several variants carry no structured
/// payload beyond their message.
#[derive(Debug, Clone)]
pub enum Error {
    /// A call was attempted (or a second close issued) on a client that is
    /// closing or has shut down.
    Shutdown,
    /// Connect + handshake did not finish within the configured timeout.
    ConnectTimeout(Duration),
    /// The handshake named a codec tag no built-in codec answers to.
    UnknownCodec(String),
    /// The handshake magic did not match.
    InvalidMagic(u32),
    /// The request named no "Service.Method" pair.
    InvalidServiceMethod,
    /// The service half of the dotted name is not registered.
    ServiceNotFound,
    /// The method half of the dotted name is not registered.
    MethodNotFound,
    /// A service with the same name is already registered.
    DuplicateService,
    /// The peer reported an error in the response header.
    Remote(String),
    /// Transport-level failure.
    Io(Arc<io::Error>),
    /// Value could not be encoded with the connection codec.
    Encode(String),
    /// Value could not be decoded with the connection codec.
    Decode(String),
    /// The response header arrived but its body could not be read.
    ReadBody(String),
    /// A frame length prefix exceeded the configured maximum.
    FrameTooLarge { len: usize, max: usize },
    /// The stream ended in the middle of a frame or its length prefix.
    TruncatedFrame,
    /// A frame length prefix ran past the maximum varint width.
    VarintOverflow,
    /// Discovery has no servers to hand out.
    NoAvailableServers,
    /// Discovery was asked for a selection mode it does not implement.
    UnsupportedSelectMode,
    /// Registry HTTP round trip failed.
    Registry(String),
    /// An XClient address did not parse as `protocol@addr`.
    BadAddress(String),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Shutdown => write!(f, "connection is shut down"),
            Error::ConnectTimeout(d) => {
                write!(f, "rpc client: connect timeout: expect within {:?}", d)
            }
            Error::UnknownCodec(tag) => write!(f, "rpc: invalid codec type {}", tag),
            Error::InvalidMagic(m) => write!(f, "rpc server: invalid magic number {:#x}", m),
            Error::InvalidServiceMethod => {
                write!(f, "rpc server: service/method request ill-formed")
            }
            Error::ServiceNotFound => write!(f, "rpc server: cannot find service"),
            Error::MethodNotFound => write!(f, "rpc server: cannot find method"),
            Error::DuplicateService => write!(f, "rpc server: service already registered"),
            Error::Remote(msg) => write!(f, "{}", msg),
            Error::Io(e) => write!(f, "rpc: io error: {}", e),
            Error::Encode(msg) => write!(f, "rpc: encode error: {}", msg),
            Error::Decode(msg) => write!(f, "rpc: decode error: {}", msg),
            Error::ReadBody(msg) => write!(f, "reading body: {}", msg),
            Error::FrameTooLarge { len, max } => {
                write!(f, "rpc: frame of {} bytes exceeds maximum of {}", len, max)
            }
            Error::TruncatedFrame => write!(f, "rpc: stream ended mid-frame"),
            Error::VarintOverflow => write!(f, "rpc: frame length prefix exceeded 10 bytes"),
            Error::NoAvailableServers => write!(f, "rpc discovery: no available servers"),
            Error::UnsupportedSelectMode => {
                write!(f, "rpc discovery: not supported select mode")
            }
            Error::Registry(msg) => write!(f, "rpc registry: {}", msg),
            Error::BadAddress(addr) => {
                write!(
                    f,
                    "rpc client: invalid address format {}, expect protocol@addr",
                    addr
                )
            }
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Io(e) => Some(e.as_ref()),
            _ => None,
        }
    }
}

impl From<io::Error> for Error {
    fn from(e: io::Error) -> Self {
        Error::Io(Arc::new(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boundary_messages() {
        assert_eq!(Error::Shutdown.to_string(), "connection is shut down");
        assert_eq!(
            Error::MethodNotFound.to_string(),
            "rpc server: cannot find method"
        );
        assert_eq!(
            Error::ConnectTimeout(Duration::from_secs(10)).to_string(),
            "rpc client: connect timeout: expect within 10s"
        );
        assert_eq!(
            Error::NoAvailableServers.to_string(),
            "rpc discovery: no available servers"
        );
    }

    #[test]
    fn remote_is_verbatim() {
        let e = Error::Remote("division by zero".to_string());
        assert_eq!(e.to_string(), "division by zero");
    }

    #[test]
    fn io_source_is_preserved() {
        let e = Error::from(io::Error::new(io::ErrorKind::BrokenPipe, "pipe"));
        assert!(std::error::Error::source(&e).is_some());
        let cloned = e.clone();
        assert!(cloned.to_string().contains("pipe"));
    }
}
