//! Stream-number framing.
//!
//! Every message on the multiplexed channel starts with one byte naming the
//! logical stream it belongs to. Stream 0 carries the forwarded bytes,
//! stream 1 carries errors reported by the remote side.

/// Logical stream carrying forwarded data
pub const DATA_STREAM: u8 = 0;

/// Logical stream carrying remote error reports
pub const ERROR_STREAM: u8 = 1;

/// A decoded channel message borrowing its payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frame<'a> {
    pub stream: u8,
    pub payload: &'a [u8],
}

impl<'a> Frame<'a> {
    /// Split a received message into stream number and payload.
    ///
    /// Returns `None` for an empty message, which carries no stream number.
    pub fn decode(message: &'a [u8]) -> Option<Self> {
        let (&stream, payload) = message.split_first()?;
        Some(Frame { stream, payload })
    }

    pub fn is_data(&self) -> bool {
        self.stream == DATA_STREAM
    }
}

/// Prefix a locally read chunk with the data stream number.
pub fn encode_data(chunk: &[u8]) -> Vec<u8> {
    let mut message = Vec::with_capacity(chunk.len() + 1);
    message.push(DATA_STREAM);
    message.extend_from_slice(chunk);
    message
}
