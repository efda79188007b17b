//! The encoder task: owns the outbound half of the transport.
//!
//! The encoder does not consult the session error while running; it
//! services its two input queues until the done flag tells it the
//! pipelines upstream are winding down, drains whatever they already
//! queued, and only then reports the latched error to the peer and closes
//! the transport. That ordering is what makes orderly net-chan closes
//! lossless: everything a sender loop managed to queue goes out first.

use std::sync::Arc;

use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use skein_wire::{encode_payload, FrameWriter, MsgType, WANT_BATCH_SIZE};

use crate::error::SessionError;
use crate::message::{CreditMsg, Element};
use crate::signal::{ErrorCell, Flag};

pub(crate) struct Encoder<W> {
    session: u64,
    frames: FrameWriter<W>,
    elements: mpsc::Receiver<Element>,
    credits: mpsc::Receiver<CreditMsg>,
    errors: Arc<ErrorCell>,
    done: Flag,
    hard_close: Flag,
    closed: Flag,
    /// Set on the first write failure; later writes become no-ops while
    /// the queues keep draining.
    dead: bool,
}

impl<W: AsyncWrite + Unpin + Send> Encoder<W> {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session: u64,
        frames: FrameWriter<W>,
        elements: mpsc::Receiver<Element>,
        credits: mpsc::Receiver<CreditMsg>,
        errors: Arc<ErrorCell>,
        done: Flag,
        hard_close: Flag,
        closed: Flag,
    ) -> Self {
        Self {
            session,
            frames,
            elements,
            credits,
            errors,
            done,
            hard_close,
            closed,
            dead: false,
        }
    }

    pub async fn run(mut self) {
        let hard_close = self.hard_close.clone();
        tokio::select! {
            _ = self.run_inner() => {}
            _ = hard_close.wait() => {
                debug!(session = self.session, "encoder forced down");
            }
        }
        // The transport is released exactly once, whichever way we got
        // here; quit waits on this flag.
        self.closed.fire();
        debug!(session = self.session, "encoder stopped");
    }

    async fn run_inner(&mut self) {
        self.write(MsgType::Hello, 0, &[]).await;
        loop {
            // Flush the pending micro-batch when nothing is immediately
            // ready, or when it has grown past the soft byte threshold.
            if self.frames.bytes_since_flush() >= WANT_BATCH_SIZE
                || (self.frames.bytes_since_flush() > 0
                    && self.elements.is_empty()
                    && self.credits.is_empty())
            {
                self.flush().await;
            }
            tokio::select! {
                maybe = self.elements.recv() => match maybe {
                    Some(elem) => self.write_element(elem).await,
                    None => break,
                },
                maybe = self.credits.recv() => match maybe {
                    Some(cred) => self.write_credit(cred).await,
                    None => break,
                },
                _ = self.done.wait() => break,
            }
        }
        // Upstream is winding down; drain what it already queued.
        while let Ok(elem) = self.elements.try_recv() {
            self.write_element(elem).await;
        }
        while let Ok(cred) = self.credits.try_recv() {
            self.write_credit(cred).await;
        }
        self.write_trailer().await;
        self.flush().await;
        let _ = self.frames.shutdown().await;
    }

    async fn write_element(&mut self, elem: Element) {
        match elem {
            Element::Batch { id, payload } => {
                trace!(session = self.session, id, bytes = payload.len(), "element out");
                self.write(MsgType::Element, id, &payload).await;
            }
            Element::Close { id } => {
                trace!(session = self.session, id, "close out");
                self.write(MsgType::Close, id, &[]).await;
            }
        }
    }

    async fn write_credit(&mut self, cred: CreditMsg) {
        match cred.name {
            Some(name) => match encode_payload(&(cred.incr, name)) {
                Ok(payload) => self.write(MsgType::InitCredit, cred.id, &payload).await,
                Err(e) => self.fail(SessionError::Codec(e.to_string())),
            },
            None => match encode_payload(&cred.incr) {
                Ok(payload) => self.write(MsgType::Credit, cred.id, &payload).await,
                Err(e) => self.fail(SessionError::Codec(e.to_string())),
            },
        }
    }

    /// The last frame tells the peer why the session ended. Errors that
    /// carry a transport-like fault keep their timeout/temporary bits;
    /// everything else crosses as its error string.
    async fn write_trailer(&mut self) {
        let err = self.errors.get().unwrap_or(SessionError::EndOfSession);
        match err.net_fault() {
            Some(fault) => match encode_payload(&fault) {
                Ok(payload) => self.write(MsgType::NetError, 0, &payload).await,
                Err(e) => self.fail(SessionError::Codec(e.to_string())),
            },
            None => match encode_payload(&err.to_string()) {
                Ok(payload) => self.write(MsgType::Error, 0, &payload).await,
                Err(e) => self.fail(SessionError::Codec(e.to_string())),
            },
        }
    }

    async fn write(&mut self, msg_type: MsgType, chan_id: u32, payload: &[u8]) {
        if self.dead {
            return;
        }
        if let Err(e) = self.frames.write_frame(msg_type, chan_id, payload).await {
            self.fail(SessionError::from(e));
        }
    }

    async fn flush(&mut self) {
        if self.dead {
            return;
        }
        if let Err(e) = self.frames.flush().await {
            self.fail(SessionError::from(e));
        }
    }

    fn fail(&mut self, err: SessionError) {
        self.dead = true;
        self.errors.latch(err);
    }
}
