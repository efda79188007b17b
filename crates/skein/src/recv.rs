//! The receive pipeline: the receive table, the endpoint (type) table the
//! decoder consults, the data dispatch task and the per-net-chan receiver
//! loops.
//!
//! The receiver side assigns channel ids. Opening a net-chan allocates an
//! id (reusing the lowest freed slot first), registers a typed endpoint
//! that knows how to decode and stage batches for that id, and announces
//! the net-chan to the peer with an initial credit carrying the name and
//! the window.
//!
//! Staging is the flow-control invariant made concrete: the staging queue
//! holds at most `buf_cap` batches, the peer may have at most `buf_cap`
//! unrefunded values in flight, and every batch holds at least one value,
//! so staging a batch can never block. A blocked stage means the peer
//! overran its window.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use serde::de::DeserializeOwned;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::{debug, trace};

use crate::error::{Direction, OpenError, SessionError};
use crate::message::{CreditMsg, RecvEvent};
use crate::signal::{ErrorCell, Flag};

/// A type-erased receive endpoint. The decoder and the data dispatch know
/// channel ids and raw payload bytes; the endpoint installed at
/// `open_recv` time knows the element type.
pub(crate) trait RecvEndpoint: Send + Sync {
    /// Decode a batch payload and stage it without blocking.
    fn deliver(&self, payload: &[u8]) -> Result<(), DeliverError>;
    /// Close the staging queue. Already-staged batches still drain.
    fn close(&self);
}

pub(crate) enum DeliverError {
    /// The payload did not decode as a batch of the element type.
    Decode(String),
    /// The staging queue was full: the peer exceeded its window.
    Overflow,
    /// The receiver loop is already gone (session shutdown race).
    Closed,
}

struct TypedEndpoint<T> {
    staging: Mutex<Option<mpsc::Sender<Vec<T>>>>,
}

impl<T: DeserializeOwned + Send> RecvEndpoint for TypedEndpoint<T> {
    fn deliver(&self, payload: &[u8]) -> Result<(), DeliverError> {
        let (batch, rest): (Vec<T>, &[u8]) =
            postcard::take_from_bytes(payload).map_err(|e| DeliverError::Decode(e.to_string()))?;
        if !rest.is_empty() {
            return Err(DeliverError::Decode(format!(
                "{} trailing bytes after batch",
                rest.len()
            )));
        }
        let staging = self.staging.lock().unwrap();
        match staging.as_ref() {
            Some(tx) => match tx.try_send(batch) {
                Ok(()) => Ok(()),
                Err(TrySendError::Full(_)) => Err(DeliverError::Overflow),
                Err(TrySendError::Closed(_)) => Err(DeliverError::Closed),
            },
            None => Err(DeliverError::Closed),
        }
    }

    fn close(&self) {
        self.staging.lock().unwrap().take();
    }
}

/// Maps live channel ids to their endpoints. Shared between the receive
/// table and the decoder, behind its own lock; whoever takes both locks
/// takes the table lock first.
pub(crate) struct EndpointTable {
    endpoints: HashMap<u32, Arc<dyn RecvEndpoint>>,
}

impl EndpointTable {
    fn new() -> Self {
        Self {
            endpoints: HashMap::new(),
        }
    }

    pub fn contains(&self, id: u32) -> bool {
        self.endpoints.contains_key(&id)
    }
}

struct RecvEntry {
    name: String,
    endpoint: Arc<dyn RecvEndpoint>,
}

struct RecvTable {
    entries: HashMap<u32, RecvEntry>,
    open_names: HashSet<String>,
    /// Freed ids, reused lowest-first before minting a fresh one.
    free_ids: BTreeSet<u32>,
    next_id: u32,
}

impl RecvTable {
    fn new() -> Self {
        Self {
            entries: HashMap::new(),
            open_names: HashSet::new(),
            free_ids: BTreeSet::new(),
            next_id: 0,
        }
    }

    fn allocate_id(&mut self) -> u32 {
        if let Some(id) = self.free_ids.pop_first() {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

pub(crate) struct RecvShared {
    session: u64,
    table: Mutex<RecvTable>,
    pub(crate) endpoints: Arc<Mutex<EndpointTable>>,
    to_encoder: mpsc::Sender<CreditMsg>,
    done: Flag,
}

impl RecvShared {
    pub fn new(session: u64, to_encoder: mpsc::Sender<CreditMsg>, done: Flag) -> Self {
        Self {
            session,
            table: Mutex::new(RecvTable::new()),
            endpoints: Arc::new(Mutex::new(EndpointTable::new())),
            to_encoder,
            done,
        }
    }

    /// Open a net-chan for receiving. Synchronous: allocates the id,
    /// registers the endpoint and spawns the receiver loop, which
    /// announces the net-chan with the initial credit.
    pub fn open<T: DeserializeOwned + Send + 'static>(
        &self,
        name: String,
        sink: mpsc::Sender<T>,
        buf_cap: usize,
    ) -> Result<(), OpenError> {
        let id;
        {
            let mut table = self.table.lock().unwrap();
            if table.open_names.contains(&name) {
                return Err(OpenError::AlreadyOpen {
                    name,
                    dir: Direction::Recv,
                });
            }
            id = table.allocate_id();
            let (staging_tx, staging_rx) = mpsc::channel(buf_cap);
            let endpoint = Arc::new(TypedEndpoint {
                staging: Mutex::new(Some(staging_tx)),
            });
            table.open_names.insert(name.clone());
            table.entries.insert(
                id,
                RecvEntry {
                    name: name.clone(),
                    endpoint: endpoint.clone(),
                },
            );
            self.endpoints.lock().unwrap().endpoints.insert(id, endpoint);

            let receiver = ReceiverLoop {
                session: self.session,
                id,
                name,
                buf_cap: buf_cap as u32,
                staging: staging_rx,
                sink,
                to_encoder: self.to_encoder.clone(),
                done: self.done.clone(),
            };
            tokio::spawn(receiver.run());
        }
        trace!(session = self.session, id, "net-chan opened for receiving");
        Ok(())
    }

    /// Route one decoder event into the table. Violations are
    /// session-fatal.
    pub fn handle_event(&self, event: RecvEvent) -> Result<(), SessionError> {
        match event {
            RecvEvent::Data { id, payload } => {
                let endpoint = {
                    let table = self.table.lock().unwrap();
                    table.entries.get(&id).map(|entry| entry.endpoint.clone())
                };
                let Some(endpoint) = endpoint else {
                    return Err(SessionError::Protocol(format!(
                        "data arrived for closed net-chan {id}"
                    )));
                };
                match endpoint.deliver(&payload) {
                    Ok(()) => Ok(()),
                    Err(DeliverError::Overflow) => Err(SessionError::CreditViolation(
                        "peer sent more than its credit allowed".into(),
                    )),
                    Err(DeliverError::Decode(msg)) => Err(SessionError::Codec(msg)),
                    // Receiver loop already exited; the session is on its
                    // way down and the value no longer matters.
                    Err(DeliverError::Closed) => Ok(()),
                }
            }
            RecvEvent::Eos { id } => {
                let entry = {
                    let mut table = self.table.lock().unwrap();
                    let Some(entry) = table.entries.remove(&id) else {
                        return Err(SessionError::Protocol(format!(
                            "end of stream arrived for closed net-chan {id}"
                        )));
                    };
                    self.endpoints.lock().unwrap().endpoints.remove(&id);
                    table.open_names.remove(&entry.name);
                    table.free_ids.insert(id);
                    entry
                };
                entry.endpoint.close();
                debug!(session = self.session, id, "net-chan end of stream");
                Ok(())
            }
        }
    }
}

/// Routes data and end-of-stream events from the decoder into the receive
/// table.
pub(crate) async fn run_data_dispatch(
    shared: Arc<RecvShared>,
    mut events: mpsc::Receiver<RecvEvent>,
    errors: Arc<ErrorCell>,
) {
    let done = shared.done.clone();
    loop {
        tokio::select! {
            maybe = events.recv() => match maybe {
                Some(event) => {
                    if let Err(err) = shared.handle_event(event) {
                        errors.latch(err);
                        return;
                    }
                }
                // Decoder shut down.
                None => return,
            },
            _ = done.wait() => return,
        }
    }
}

struct ReceiverLoop<T> {
    session: u64,
    id: u32,
    name: String,
    buf_cap: u32,
    staging: mpsc::Receiver<Vec<T>>,
    sink: mpsc::Sender<T>,
    to_encoder: mpsc::Sender<CreditMsg>,
    done: Flag,
}

impl<T: Send + 'static> ReceiverLoop<T> {
    async fn run(mut self) {
        // Announce the net-chan: the initial credit carries the name and
        // advertises the window.
        let initial = CreditMsg {
            id: self.id,
            incr: self.buf_cap,
            name: Some(self.name.clone()),
        };
        if !self.push_credit(initial).await {
            return;
        }
        loop {
            tokio::select! {
                maybe = self.staging.recv() => match maybe {
                    Some(mut batch) => {
                        // Coalesce one ready follow-up batch, then refund
                        // exactly what we pulled out of staging before
                        // forwarding anything.
                        if let Ok(more) = self.staging.try_recv() {
                            batch.extend(more);
                        }
                        let refund = batch.len() as u32;
                        if refund > 0 {
                            let cred = CreditMsg { id: self.id, incr: refund, name: None };
                            if !self.push_credit(cred).await {
                                return;
                            }
                        }
                        for value in batch {
                            // Forward-first bias: a value that can be
                            // delivered right now beats a concurrent
                            // shutdown.
                            tokio::select! {
                                biased;
                                result = self.sink.send(value) => {
                                    if result.is_err() {
                                        // The user dropped their receiver.
                                        // Keep draining so the peer's
                                        // accounting stays intact.
                                    }
                                }
                                _ = self.done.wait() => return,
                            }
                        }
                    }
                    // End of stream: dropping the sink closes the user
                    // queue after everything delivered so far.
                    None => {
                        trace!(session = self.session, id = self.id, "receiver loop closed");
                        return;
                    }
                },
                _ = self.done.wait() => return,
            }
        }
    }

    async fn push_credit(&self, cred: CreditMsg) -> bool {
        tokio::select! {
            result = self.to_encoder.send(cred) => result.is_ok(),
            _ = self.done.wait() => false,
        }
    }
}
