//! Session lifecycle and error arbitration.
//!
//! A session couples one transport to two symmetric pipelines:
//!
//! ```text
//!  ----> sender loops ----> encoder ==[bytes]==> decoder ----> receiver loops ---->
//!        [send table]                                          [recv table]
//!        credit dispatch <-- decoder <==[bytes]== encoder <--- credit refunds
//! ```
//!
//! There is no cycle: each pipeline shares a table with its companion task
//! instead of talking to it through queues, and only the encoder and
//! decoder straddle the transport. Termination therefore runs in pipeline
//! order: some party latches the session error, the loops and dispatchers
//! notice the done flag and stop feeding the encoder, the encoder drains,
//! reports the error to the peer and closes the transport, the decoder
//! dies on the closed transport, and the dispatchers drain out behind it.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tracing::debug;

use skein_wire::{FrameReader, FrameWriter, DEFAULT_MSG_SIZE_LIMIT, MAX_NAME_LEN, MIN_MSG_SIZE_LIMIT};

use crate::decode::Decoder;
use crate::encode::Encoder;
use crate::error::{OpenError, SessionError};
use crate::recv::{run_data_dispatch, RecvShared};
use crate::send::{run_credit_dispatch, SendShared};
use crate::signal::{ErrorCell, Flag};
use crate::QUEUE_CAP;

/// How long `quit` waits for the encoder to deliver the goodbye before
/// force-closing the transport.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Process-wide session counter, used as a log field only.
static SESSION_ID: AtomicU64 = AtomicU64::new(0);

/// A net-chan session over one transport connection.
///
/// Cloning is cheap; all clones drive the same session. The transport can
/// be anything full-duplex, ordered and reliable that implements
/// `AsyncRead + AsyncWrite`: a TCP stream, a Unix socket, an in-memory
/// duplex pipe. Each end of a connection gets exactly one session.
///
/// Must be created inside a Tokio runtime: construction spawns the
/// pipeline tasks.
#[derive(Clone)]
pub struct Session {
    shared: Arc<Shared>,
}

struct Shared {
    id: u64,
    errors: Arc<ErrorCell>,
    done: Flag,
    closed: Flag,
    hard_close: Flag,
    send: Arc<SendShared>,
    recv: Arc<RecvShared>,
}

impl Session {
    /// Start a session on `transport` with the default message size limit.
    pub fn new<T>(transport: T) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        Self::with_msg_size_limit(transport, DEFAULT_MSG_SIZE_LIMIT)
    }

    /// Like [`new`](Session::new), but bounds the size of incoming
    /// messages. A frame larger than the limit aborts the session with
    /// [`SessionError::MessageTooLarge`]. The limit is clamped below to
    /// [`MIN_MSG_SIZE_LIMIT`].
    pub fn with_msg_size_limit<T>(transport: T, msg_size_limit: usize) -> Session
    where
        T: AsyncRead + AsyncWrite + Send + Sync + 'static,
    {
        let msg_size_limit = msg_size_limit.max(MIN_MSG_SIZE_LIMIT);
        let id = SESSION_ID.fetch_add(1, Ordering::Relaxed) + 1;

        let (read_half, write_half) = tokio::io::split(transport);

        let errors = Arc::new(ErrorCell::new());
        let done = errors.done_flag();
        let closed = Flag::new();
        let hard_close = Flag::new();

        let (elements_tx, elements_rx) = mpsc::channel(QUEUE_CAP);
        let (credits_out_tx, credits_out_rx) = mpsc::channel(QUEUE_CAP);
        let (data_in_tx, data_in_rx) = mpsc::channel(QUEUE_CAP);
        let (credits_in_tx, credits_in_rx) = mpsc::channel(QUEUE_CAP);

        let send = Arc::new(SendShared::new(
            id,
            elements_tx,
            done.clone(),
            errors.clone(),
        ));
        let recv = Arc::new(RecvShared::new(id, credits_out_tx, done.clone()));

        let encoder = Encoder::new(
            id,
            FrameWriter::new(write_half),
            elements_rx,
            credits_out_rx,
            errors.clone(),
            done.clone(),
            hard_close.clone(),
            closed.clone(),
        );
        let decoder = Decoder::new(
            id,
            FrameReader::new(read_half, msg_size_limit),
            recv.endpoints.clone(),
            data_in_tx,
            credits_in_tx,
            errors.clone(),
            done.clone(),
        );

        tokio::spawn(encoder.run());
        tokio::spawn(decoder.run());
        tokio::spawn(run_credit_dispatch(send.clone(), credits_in_rx, errors.clone()));
        tokio::spawn(run_data_dispatch(recv.clone(), data_in_rx, errors.clone()));

        debug!(session = id, msg_size_limit, "session started");

        Session {
            shared: Arc::new(Shared {
                id,
                errors,
                done,
                closed,
                hard_close,
                send,
                recv,
            }),
        }
    }

    /// Open a net-chan for sending. `source` is the receiving half of the
    /// user's queue: values the user sends into the matching `Sender<T>`
    /// go out on this net-chan in order; dropping the `Sender<T>` closes
    /// it, and the peer's queue closes once every value is delivered.
    ///
    /// Errors are local (see [`OpenError`]); they never terminate the
    /// session. Opening the same name twice for sending fails, but the
    /// same name may be open in both directions at once.
    pub fn open_send<T>(&self, name: &str, source: mpsc::Receiver<T>) -> Result<(), OpenError>
    where
        T: Serialize + Send + 'static,
    {
        if name.len() > MAX_NAME_LEN {
            return Err(OpenError::NameTooLong { len: name.len() });
        }
        self.shared.send.open(name.to_owned(), source)
    }

    /// Open a net-chan for receiving with a window of `buf_cap` values.
    /// `sink` is the sending half of the user's queue; the user's
    /// `Receiver<T>` yields the peer's values in order and then `None`
    /// once the peer closes. `buf_cap` bounds how far the peer may run
    /// ahead of the user draining the queue.
    pub fn open_recv<T>(
        &self,
        name: &str,
        sink: mpsc::Sender<T>,
        buf_cap: usize,
    ) -> Result<(), OpenError>
    where
        T: DeserializeOwned + Send + 'static,
    {
        if name.len() > MAX_NAME_LEN {
            return Err(OpenError::NameTooLong { len: name.len() });
        }
        if buf_cap == 0 {
            return Err(OpenError::ZeroBufferCapacity);
        }
        self.shared.recv.open(name.to_owned(), sink, buf_cap)
    }

    /// The error that terminated this session, if any. Stable once set:
    /// the first latched error wins and is what the peer was told.
    /// After [`done`](Session::done) resolves this is always `Some`; note
    /// that an orderly shutdown surfaces here as
    /// [`SessionError::EndOfSession`].
    pub fn err(&self) -> Option<SessionError> {
        self.shared.errors.get()
    }

    /// Resolves when the session is terminating, for composing with
    /// `select!` around sends and receives on user queues.
    pub async fn done(&self) {
        self.shared.done.wait().await;
    }

    /// Whether the session has started terminating.
    pub fn is_terminated(&self) -> bool {
        self.shared.done.is_fired()
    }

    /// Orderly shutdown: latches [`SessionError::EndOfSession`], tells the
    /// peer, and closes the transport. The peer winds down with
    /// `EndOfSession` too if the goodbye arrives intact. Returns within
    /// the shutdown grace period regardless of peer liveness; safe to call
    /// multiple times, from multiple tasks.
    pub async fn quit(&self) {
        self.quit_with(SessionError::EndOfSession).await;
    }

    /// Like [`quit`](Session::quit) but latches `err` as the session
    /// error. Use [`SessionError::app`] for application-defined reasons;
    /// the string surfaces on the peer as [`SessionError::Peer`].
    pub async fn quit_with(&self, err: SessionError) {
        self.shared.errors.latch(err);
        let closed = self.shared.closed.clone();
        tokio::select! {
            _ = closed.wait() => {}
            _ = tokio::time::sleep(SHUTDOWN_GRACE) => {
                // The encoder did not get the goodbye out in time; cut the
                // transport out from under it.
                debug!(session = self.shared.id, "shutdown grace expired, forcing close");
                self.shared.hard_close.fire();
                closed.wait().await;
            }
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.shared.id)
            .field("terminated", &self.is_terminated())
            .finish()
    }
}
