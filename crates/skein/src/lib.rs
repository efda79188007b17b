#![deny(unsafe_code)]

//! Multiplexed typed net-chans over a single bytestream.
//!
//! A [`Session`] couples one full-duplex transport to any number of named,
//! uni-directional streams of typed values ("net-chans"). One side opens a
//! net-chan for sending with [`Session::open_send`], handing over the
//! receiving half of a local [`tokio::sync::mpsc`] queue; the peer opens
//! the same name for receiving with [`Session::open_recv`]. Values flow in
//! FIFO order per net-chan, bounded by a credit scheme the receiver drives:
//! the receiver advertises a window when it opens, and refunds credit as it
//! consumes values, so a slow consumer backpressures the producer without
//! any global coordination.
//!
//! Closing the sending queue closes the receiving queue on the peer once
//! every in-flight value has been delivered. Session-level failures
//! (protocol violations, transport errors, [`Session::quit`]) are latched
//! once per session and tear the pipelines down in order, telling the peer
//! why.
//!
//! ```no_run
//! # async fn demo(conn: tokio::io::DuplexStream) {
//! use skein::Session;
//! use tokio::sync::mpsc;
//!
//! let session = Session::new(conn);
//! let (tx, rx) = mpsc::channel::<u64>(16);
//! session.open_send("meter.readings", rx).unwrap();
//! tx.send(42).await.unwrap();
//! drop(tx); // closes the net-chan once 42 is delivered
//! # }
//! ```

mod decode;
mod encode;
mod error;
mod message;
mod recv;
mod send;
mod session;
mod signal;

pub use error::{Direction, OpenError, SessionError};
pub use session::Session;

pub use skein_wire::{DEFAULT_MSG_SIZE_LIMIT, MAX_NAME_LEN, MIN_MSG_SIZE_LIMIT};

/// Capacity of the queues between the pipeline tasks. A tuning constant:
/// the protocol is correct for any positive capacity.
pub(crate) const QUEUE_CAP: usize = 8;
