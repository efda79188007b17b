//! The decoder task: owns the inbound half of the transport.
//!
//! The first frame must be a hello; after that the decoder dispatches on
//! the message type, validating ids, credits and names before anything
//! reaches the tables. It terminates on any read error or violation,
//! latches the terminal error (first latch wins) and drops its queues
//! toward the managers, which drain and exit in pipeline order.

use std::sync::{Arc, Mutex};

use tokio::io::AsyncRead;
use tokio::sync::mpsc;
use tracing::debug;

use skein_wire::{decode_payload, FrameReader, Header, MsgClass, MsgType, NetFault, MAX_NAME_LEN};

use crate::error::{SessionError, END_OF_SESSION_MSG};
use crate::message::{CreditMsg, RecvEvent};
use crate::recv::EndpointTable;
use crate::signal::{ErrorCell, Flag};

pub(crate) struct Decoder<R> {
    session: u64,
    frames: FrameReader<R>,
    endpoints: Arc<Mutex<EndpointTable>>,
    to_recv: mpsc::Sender<RecvEvent>,
    to_send: mpsc::Sender<CreditMsg>,
    errors: Arc<ErrorCell>,
    done: Flag,
}

impl<R: AsyncRead + Unpin + Send> Decoder<R> {
    pub fn new(
        session: u64,
        frames: FrameReader<R>,
        endpoints: Arc<Mutex<EndpointTable>>,
        to_recv: mpsc::Sender<RecvEvent>,
        to_send: mpsc::Sender<CreditMsg>,
        errors: Arc<ErrorCell>,
        done: Flag,
    ) -> Self {
        Self {
            session,
            frames,
            endpoints,
            to_recv,
            to_send,
            errors,
            done,
        }
    }

    pub async fn run(mut self) {
        let err = match self.run_inner().await {
            Ok(()) => SessionError::EndOfSession,
            Err(err) => err,
        };
        self.errors.latch(err);
        debug!(session = self.session, "decoder stopped");
        // Dropping to_recv/to_send here closes the dispatch inputs.
    }

    async fn run_inner(&mut self) -> Result<(), SessionError> {
        let (header, _payload) = self.read_frame().await?;
        if MsgType::classify(header.msg_type) != MsgClass::Known(MsgType::Hello) {
            return Err(SessionError::Protocol(format!(
                "expected hello message, got msg_type {}",
                header.msg_type
            )));
        }
        loop {
            let (header, payload) = self.read_frame().await?;
            match MsgType::classify(header.msg_type) {
                MsgClass::Known(msg_type) => {
                    self.dispatch(msg_type, header.chan_id, payload).await?
                }
                // Reserved but unused: skip the frame.
                MsgClass::Reserved(_) => {}
                MsgClass::Invalid(raw) => {
                    return Err(SessionError::Protocol(format!(
                        "received message with invalid type {raw}"
                    )));
                }
            }
        }
    }

    async fn dispatch(
        &mut self,
        msg_type: MsgType,
        chan_id: u32,
        payload: Vec<u8>,
    ) -> Result<(), SessionError> {
        match msg_type {
            MsgType::Hello => Err(SessionError::Protocol(
                "unexpected hello message after handshake".into(),
            )),

            MsgType::Element => {
                // The element type is only known for announced ids; the
                // table itself stages the payload.
                if !self.endpoints.lock().unwrap().contains(chan_id) {
                    return Err(SessionError::InvalidId(chan_id));
                }
                self.forward_recv(RecvEvent::Data {
                    id: chan_id,
                    payload,
                })
                .await
            }

            MsgType::InitElement => {
                // Announcement rides on the credit path; this frame is
                // tolerated for compatibility and otherwise inert.
                let name: String = decode_payload(&payload)?;
                check_name(&name)?;
                Ok(())
            }

            MsgType::Close => self.forward_recv(RecvEvent::Eos { id: chan_id }).await,

            MsgType::Credit => {
                let incr: u32 = decode_payload(&payload)?;
                check_incr(incr)?;
                self.forward_send(CreditMsg {
                    id: chan_id,
                    incr,
                    name: None,
                })
                .await
            }

            MsgType::InitCredit => {
                let (incr, name): (u32, String) = decode_payload(&payload)?;
                check_incr(incr)?;
                check_name(&name)?;
                self.forward_send(CreditMsg {
                    id: chan_id,
                    incr,
                    name: Some(name),
                })
                .await
            }

            MsgType::Error => {
                let message: String = decode_payload(&payload)?;
                if message == END_OF_SESSION_MSG {
                    Err(SessionError::EndOfSession)
                } else {
                    Err(SessionError::Peer(message))
                }
            }

            MsgType::NetError => {
                let fault: NetFault = decode_payload(&payload)?;
                Err(SessionError::Net {
                    msg: fault.message,
                    is_timeout: fault.is_timeout,
                    is_temporary: fault.is_temporary,
                })
            }
        }
    }

    async fn read_frame(&mut self) -> Result<(Header, Vec<u8>), SessionError> {
        tokio::select! {
            result = self.frames.read_frame() => result.map_err(SessionError::from),
            // The session is terminating; surface the inert sentinel, the
            // real error is already latched.
            _ = self.done.wait() => Err(SessionError::EndOfSession),
        }
    }

    async fn forward_recv(&self, event: RecvEvent) -> Result<(), SessionError> {
        tokio::select! {
            result = self.to_recv.send(event) => {
                result.map_err(|_| SessionError::EndOfSession)
            }
            _ = self.done.wait() => Err(SessionError::EndOfSession),
        }
    }

    async fn forward_send(&self, cred: CreditMsg) -> Result<(), SessionError> {
        tokio::select! {
            result = self.to_send.send(cred) => {
                result.map_err(|_| SessionError::EndOfSession)
            }
            _ = self.done.wait() => Err(SessionError::EndOfSession),
        }
    }
}

fn check_incr(incr: u32) -> Result<(), SessionError> {
    if incr == 0 {
        return Err(SessionError::CreditViolation(
            "credit with non-positive value received".into(),
        ));
    }
    Ok(())
}

fn check_name(name: &str) -> Result<(), SessionError> {
    if name.len() > MAX_NAME_LEN {
        return Err(SessionError::Protocol(format!(
            "net-chan name of {} bytes exceeds the {MAX_NAME_LEN} byte limit",
            name.len()
        )));
    }
    Ok(())
}
