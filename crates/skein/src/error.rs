use std::io;
use std::sync::Arc;

use skein_wire::NetFault;

/// The error string that carries an orderly shutdown across the wire. The
/// decoder maps it back to [`SessionError::EndOfSession`].
pub(crate) const END_OF_SESSION_MSG: &str = "end of session";

/// Direction of a net-chan endpoint. `(name, Send)` and `(name, Recv)` are
/// distinct endpoints on the same session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Recv,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Send => write!(f, "Send"),
            Direction::Recv => write!(f, "Recv"),
        }
    }
}

/// Error returned by [`Session::open_send`](crate::Session::open_send) and
/// [`Session::open_recv`](crate::Session::open_recv).
///
/// Open errors are local: they are not communicated to the peer, they do
/// not latch the session error and the session keeps working.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum OpenError {
    #[error("net-chan {name:?} already open for {dir}")]
    AlreadyOpen { name: String, dir: Direction },
    #[error("net-chan name of {len} bytes exceeds the 500 byte limit")]
    NameTooLong { len: usize },
    #[error("receive buffer capacity must be at least 1")]
    ZeroBufferCapacity,
}

/// The error that terminated a session.
///
/// The first error latched wins; it is what [`Session::err`](crate::Session::err)
/// returns, what the peer is told, and what triggers pipeline shutdown.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// Orderly shutdown, initiated locally by [`Session::quit`](crate::Session::quit)
    /// or received from the peer.
    #[error("end of session")]
    EndOfSession,
    /// The peer broke the protocol: missing hello, traffic for a closed
    /// net-chan, an oversized name, and the like.
    #[error("protocol violation: {0}")]
    Protocol(String),
    /// A channel id that is out of range or collides with a live entry.
    #[error("invalid channel id {0}")]
    InvalidId(u32),
    /// An incoming frame exceeded the receive size limit.
    #[error("message too big: frame of {size} bytes exceeds the {limit} byte limit")]
    MessageTooLarge { size: usize, limit: usize },
    /// The peer sent beyond its advertised window, or granted a
    /// non-positive credit.
    #[error("credit violation: {0}")]
    CreditViolation(String),
    /// The peer introduced a fresh id while leaving too many closed slots
    /// unreused.
    #[error("peer does not reuse ids of closed net-chans")]
    ReusePolicy,
    /// Too many net-chans announced by the peer but never opened locally.
    #[error("too many half-open net-chans")]
    TooManyHalfOpen,
    /// The peer signalled an error.
    #[error("peer error: {0}")]
    Peer(String),
    /// The peer signalled a transport-like error.
    #[error("peer network error: {msg}")]
    Net {
        msg: String,
        is_timeout: bool,
        is_temporary: bool,
    },
    /// A value or payload failed to (de)serialize.
    #[error("codec error: {0}")]
    Codec(String),
    /// The underlying transport failed.
    #[error("transport error: {0}")]
    Transport(Arc<io::Error>),
    /// An application-supplied shutdown reason, passed to
    /// [`Session::quit_with`](crate::Session::quit_with). Crosses the wire
    /// verbatim and surfaces on the peer as [`SessionError::Peer`].
    #[error("{0}")]
    App(String),
}

impl SessionError {
    /// An application-defined shutdown reason.
    pub fn app(msg: impl Into<String>) -> Self {
        SessionError::App(msg.into())
    }

    /// The transport-like view of this error, if it has one. Errors with a
    /// fault cross the wire as `NetError` frames so the timeout/temporary
    /// bits survive; everything else becomes a plain `Error` frame.
    pub(crate) fn net_fault(&self) -> Option<NetFault> {
        match self {
            SessionError::Net {
                msg,
                is_timeout,
                is_temporary,
            } => Some(NetFault {
                message: msg.clone(),
                is_timeout: *is_timeout,
                is_temporary: *is_temporary,
            }),
            SessionError::Transport(e) => Some(NetFault {
                message: e.to_string(),
                is_timeout: matches!(
                    e.kind(),
                    io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock
                ),
                is_temporary: matches!(
                    e.kind(),
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                ),
            }),
            _ => None,
        }
    }
}

impl From<io::Error> for SessionError {
    fn from(e: io::Error) -> Self {
        SessionError::Transport(Arc::new(e))
    }
}

impl From<skein_wire::FrameError> for SessionError {
    fn from(e: skein_wire::FrameError) -> Self {
        match e {
            skein_wire::FrameError::TooBig { size, limit } => {
                SessionError::MessageTooLarge { size, limit }
            }
            skein_wire::FrameError::Header(msg) => SessionError::Protocol(msg),
            skein_wire::FrameError::Io(e) => SessionError::from(e),
        }
    }
}

impl From<skein_wire::PayloadError> for SessionError {
    fn from(e: skein_wire::PayloadError) -> Self {
        SessionError::Codec(e.to_string())
    }
}
