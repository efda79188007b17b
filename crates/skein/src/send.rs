//! The send pipeline: the send table, the credit dispatch task and the
//! per-net-chan sender loops.
//!
//! A net-chan becomes sendable through a rendezvous between two events
//! that can happen in either order: the local user opening the name, and
//! the peer's initial credit arriving with the id the peer chose.
//!
//! 1. Initial credit first: the id slot is reserved with the advertised
//!    window and marked half-open until the user opens the name.
//! 2. Local open first: the user's queue is parked in a pending record
//!    keyed by name (no id yet). When the initial credit arrives, the
//!    record is promoted into the id slot and the sender loop starts.
//!
//! Each active id runs one sender loop that owns the credit counter and
//! the user queue. It only pulls user values while it holds credit, so a
//! stalled receiver backpressures the producer through the local queue.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, Weak};

use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use skein_wire::{batch_payload, MAX_HALF_OPEN, MAX_HOLES, WANT_BATCH_SIZE};

use crate::error::{Direction, OpenError, SessionError};
use crate::message::{CreditMsg, Element};
use crate::signal::{ErrorCell, Flag};
use crate::QUEUE_CAP;

/// Spawns the typed sender loop for a pending open once the peer has
/// assigned an id and an initial credit; returns the loop's credit inbox.
type Launcher = Box<dyn FnOnce(u32, u32) -> mpsc::Sender<u32> + Send>;

pub(crate) enum SendSlot {
    /// Closed net-chan; the id is reserved until the peer reuses it.
    Vacant,
    /// Initial credit arrived, local open still missing.
    HalfOpen { name: String, credit: u32 },
    /// Sender loop running.
    Active {
        name: String,
        credits: mpsc::Sender<u32>,
    },
}

pub(crate) struct SendTable {
    /// Dense id space: the peer assigns ids as indices into this table.
    pub slots: Vec<SendSlot>,
    /// Locally opened net-chans still waiting for their initial credit.
    pending: HashMap<String, Launcher>,
    /// Names opened locally for sending, across all states.
    open_names: HashSet<String>,
}

impl SendTable {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            pending: HashMap::new(),
            open_names: HashSet::new(),
        }
    }

    fn slot_id_by_name(&self, name: &str) -> Option<usize> {
        self.slots.iter().position(|slot| match slot {
            SendSlot::HalfOpen { name: n, .. } | SendSlot::Active { name: n, .. } => n == name,
            SendSlot::Vacant => false,
        })
    }

    /// Count the holes and half-open entries the peer has forced us to
    /// keep. Both are bounded to keep a misbehaving peer from growing the
    /// table without end.
    fn sanity_counters(&self) -> (usize, usize) {
        let mut holes = 0;
        let mut half_open = 0;
        for slot in &self.slots {
            match slot {
                SendSlot::Vacant => holes += 1,
                SendSlot::HalfOpen { .. } => half_open += 1,
                SendSlot::Active { .. } => {}
            }
        }
        (holes, half_open)
    }
}

pub(crate) struct SendShared {
    session: u64,
    pub(crate) table: Arc<Mutex<SendTable>>,
    to_encoder: mpsc::Sender<Element>,
    done: Flag,
    errors: Arc<ErrorCell>,
}

impl SendShared {
    pub fn new(
        session: u64,
        to_encoder: mpsc::Sender<Element>,
        done: Flag,
        errors: Arc<ErrorCell>,
    ) -> Self {
        Self {
            session,
            table: Arc::new(Mutex::new(SendTable::new())),
            to_encoder,
            done,
            errors,
        }
    }

    /// Open a net-chan for sending. Synchronous: only the table changes
    /// here; the sender loop starts now or when the initial credit lands.
    pub fn open<T: Serialize + Send + 'static>(
        &self,
        name: String,
        source: mpsc::Receiver<T>,
    ) -> Result<(), OpenError> {
        let mut table = self.table.lock().unwrap();
        if table.open_names.contains(&name) {
            return Err(OpenError::AlreadyOpen {
                name,
                dir: Direction::Send,
            });
        }

        if let Some(idx) = table.slot_id_by_name(&name) {
            // The initial credit got here first; resolve the rendezvous.
            let SendSlot::HalfOpen { credit, .. } =
                std::mem::replace(&mut table.slots[idx], SendSlot::Vacant)
            else {
                unreachable!("open_names said the name is not open");
            };
            let credits = spawn_sender(
                self.session,
                idx as u32,
                credit,
                source,
                self.to_encoder.clone(),
                self.done.clone(),
                self.errors.clone(),
                Arc::downgrade(&self.table),
            );
            table.slots[idx] = SendSlot::Active {
                name: name.clone(),
                credits,
            };
            table.open_names.insert(name);
            return Ok(());
        }

        // No id yet; park a launcher until the peer announces one.
        let session = self.session;
        let to_encoder = self.to_encoder.clone();
        let done = self.done.clone();
        let errors = self.errors.clone();
        let weak_table = Arc::downgrade(&self.table);
        table.open_names.insert(name.clone());
        table.pending.insert(
            name,
            Box::new(move |id, credit| {
                spawn_sender(
                    session, id, credit, source, to_encoder, done, errors, weak_table,
                )
            }),
        );
        Ok(())
    }

    /// A refill credit from the decoder.
    pub async fn handle_credit(&self, cred: CreditMsg) -> Result<(), SessionError> {
        let credits = {
            let mut table = self.table.lock().unwrap();
            let Some(slot) = table.slots.get_mut(cred.id as usize) else {
                return Err(SessionError::InvalidId(cred.id));
            };
            match slot {
                // The net-chan just closed locally; the credit crossed the
                // close on the wire. Not a fault.
                SendSlot::Vacant => return Ok(()),
                // Not open locally yet: bank the credit in the slot.
                SendSlot::HalfOpen { credit, .. } => {
                    *credit = credit.saturating_add(cred.incr);
                    return Ok(());
                }
                SendSlot::Active { credits, .. } => credits.clone(),
            }
        };
        // Forward outside the lock. A loop that already quit dropped its
        // inbox; the failed send is the same race as the vacant slot.
        tokio::select! {
            _ = credits.send(cred.incr) => {}
            _ = self.done.wait() => {}
        }
        Ok(())
    }

    /// An initial credit from the decoder: the peer opened `name` for
    /// receiving and assigned it `id`.
    pub fn handle_init_credit(
        &self,
        id: u32,
        incr: u32,
        name: String,
    ) -> Result<(), SessionError> {
        let mut table = self.table.lock().unwrap();

        if table.slot_id_by_name(&name).is_some() {
            return Err(SessionError::Protocol(format!(
                "initial credit arrived for already open net-chan {name:?}"
            )));
        }

        let (holes, half_open) = table.sanity_counters();
        if half_open > MAX_HALF_OPEN {
            return Err(SessionError::TooManyHalfOpen);
        }

        let idx = id as usize;
        if idx == table.slots.len() {
            if holes > MAX_HOLES {
                return Err(SessionError::ReusePolicy);
            }
            table.slots.push(SendSlot::Vacant);
        } else if idx < table.slots.len() {
            if !matches!(table.slots[idx], SendSlot::Vacant) {
                return Err(SessionError::InvalidId(id));
            }
        } else {
            return Err(SessionError::InvalidId(id));
        }

        if let Some(launch) = table.pending.remove(&name) {
            // The user already opened this name; start its sender loop.
            let credits = launch(id, incr);
            table.slots[idx] = SendSlot::Active { name, credits };
        } else {
            trace!(
                session = self.session,
                id,
                name = %name,
                "net-chan announced before local open"
            );
            table.slots[idx] = SendSlot::HalfOpen { name, credit: incr };
        }
        Ok(())
    }
}

/// Routes credits from the decoder into the send table and the sender
/// loops. Credit errors are session-fatal.
pub(crate) async fn run_credit_dispatch(
    shared: Arc<SendShared>,
    mut credits: mpsc::Receiver<CreditMsg>,
    errors: Arc<ErrorCell>,
) {
    let done = shared.done.clone();
    loop {
        tokio::select! {
            maybe = credits.recv() => match maybe {
                Some(cred) => {
                    let result = match cred.name.clone() {
                        Some(name) => shared.handle_init_credit(cred.id, cred.incr, name),
                        None => shared.handle_credit(cred).await,
                    };
                    if let Err(err) = result {
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

#[allow(clippy::too_many_arguments)]
fn spawn_sender<T: Serialize + Send + 'static>(
    session: u64,
    id: u32,
    initial_credit: u32,
    source: mpsc::Receiver<T>,
    to_encoder: mpsc::Sender<Element>,
    done: Flag,
    errors: Arc<ErrorCell>,
    table: Weak<Mutex<SendTable>>,
) -> mpsc::Sender<u32> {
    let (credit_tx, credit_rx) = mpsc::channel(QUEUE_CAP);
    let sender = SenderLoop {
        session,
        id,
        credit: u64::from(initial_credit),
        source,
        credits: credit_rx,
        credits_open: true,
        to_encoder,
        done,
        errors,
        table,
    };
    tokio::spawn(sender.run());
    credit_tx
}

struct SenderLoop<T> {
    session: u64,
    id: u32,
    credit: u64,
    source: mpsc::Receiver<T>,
    credits: mpsc::Receiver<u32>,
    credits_open: bool,
    to_encoder: mpsc::Sender<Element>,
    done: Flag,
    errors: Arc<ErrorCell>,
    table: Weak<Mutex<SendTable>>,
}

impl<T: Serialize + Send + 'static> SenderLoop<T> {
    async fn run(mut self) {
        trace!(session = self.session, id = self.id, "sender loop started");
        loop {
            tokio::select! {
                maybe = self.credits.recv(), if self.credits_open => match maybe {
                    Some(incr) => self.credit += u64::from(incr),
                    None => self.credits_open = false,
                },
                _ = self.done.wait() => return,
                // Only consume user values while we hold credit.
                maybe = self.source.recv(), if self.credit > 0 => match maybe {
                    Some(first) => {
                        if !self.send_batch(first).await {
                            return;
                        }
                    }
                    None => {
                        self.finish().await;
                        return;
                    }
                },
            }
        }
    }

    /// Build a batch starting from `first`, coalescing whatever is already
    /// sitting in the user queue, bounded by the credit in hand and by the
    /// byte budget. Never waits for a batch to grow.
    async fn send_batch(&mut self, first: T) -> bool {
        let mut items = match postcard::to_stdvec(&first) {
            Ok(bytes) => bytes,
            Err(e) => {
                self.errors.latch(SessionError::Codec(e.to_string()));
                return false;
            }
        };
        let mut count: u32 = 1;
        while u64::from(count) < self.credit && items.len() < WANT_BATCH_SIZE {
            match self.source.try_recv() {
                Ok(value) => match postcard::to_stdvec(&value) {
                    Ok(bytes) => {
                        items.extend_from_slice(&bytes);
                        count += 1;
                    }
                    Err(e) => {
                        self.errors.latch(SessionError::Codec(e.to_string()));
                        return false;
                    }
                },
                Err(_) => break,
            }
        }
        self.credit -= u64::from(count);
        let payload = batch_payload(count, &items);
        self.push(Element::Batch {
            id: self.id,
            payload,
        })
        .await
    }

    /// Push an element to the encoder while keeping the credit inbox
    /// serviced; a slow encoder must not back credits up into the decoder.
    async fn push(&mut self, elem: Element) -> bool {
        loop {
            tokio::select! {
                permit = self.to_encoder.reserve() => match permit {
                    Ok(permit) => {
                        permit.send(elem);
                        return true;
                    }
                    Err(_) => return false,
                },
                maybe = self.credits.recv(), if self.credits_open => match maybe {
                    Some(incr) => self.credit += u64::from(incr),
                    None => self.credits_open = false,
                },
                _ = self.done.wait() => return false,
            }
        }
    }

    /// The user closed the queue: emit end-of-stream, then clear the slot
    /// so the peer may reuse the id.
    async fn finish(&mut self) {
        if !self.push(Element::Close { id: self.id }).await {
            return;
        }
        if let Some(table) = self.table.upgrade() {
            let mut table = table.lock().unwrap();
            if let Some(slot) = table.slots.get_mut(self.id as usize) {
                let old = std::mem::replace(slot, SendSlot::Vacant);
                if let SendSlot::Active { name, .. } = old {
                    table.open_names.remove(&name);
                }
            }
        }
        debug!(session = self.session, id = self.id, "net-chan closed");
    }
}
