//! Messages flowing between the pipeline tasks.

/// From a sender loop to the encoder.
#[derive(Debug)]
pub(crate) enum Element {
    /// One or more values for a net-chan, already encoded as the payload of
    /// an element frame (a postcard sequence of the element type).
    Batch { id: u32, payload: Vec<u8> },
    /// End of stream for a net-chan.
    Close { id: u32 },
}

/// From a receiver loop to the encoder, and from the decoder to the
/// send-side credit dispatch.
///
/// A credit with a name is an initial credit: it announces a net-chan and
/// advertises the receive window. Without a name it is a refill.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct CreditMsg {
    pub id: u32,
    pub incr: u32,
    pub name: Option<String>,
}

/// From the decoder to the receive-side data dispatch.
#[derive(Debug)]
pub(crate) enum RecvEvent {
    /// An element frame's payload, to be decoded by the endpoint for `id`.
    Data { id: u32, payload: Vec<u8> },
    /// End of stream for `id`.
    Eos { id: u32 },
}
