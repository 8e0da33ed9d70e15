use bytes::Bytes;

use crate::messages::PeerMessage;
use crate::types::CommId;

/// Outbound capability of the daemon. Sends may happen while a
/// transaction's mutex is held, so an implementation must queue and must
/// never call back into the daemon synchronously.
///
/// Delivery is best-effort: anything handed to the transport may be
/// dropped, duplicated, or reordered, and the coordinator retries from
/// its background tick.
pub trait Transport: Send + Sync {
    /// Ship a peer message to another daemon.
    fn send(&self, to: CommId, msg: PeerMessage);

    /// Return an already-encoded reply to a client. Replies are cached
    /// per slot, so a duplicate retry replays identical bytes.
    fn reply(&self, to: CommId, response: Bytes);
}
