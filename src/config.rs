use crate::packet;
use anyhow::bail;
use std::time::Duration;

/// Tuning knobs for a transport engine.
///
/// Both ends of a conversation must agree on `max_payload` - the wire record
///  has a fixed size derived from it.
pub struct RudpConfig {
    /// Sliding-window depth: the number of packets that may be in flight to
    ///  one peer before further sends are queued.
    pub window: usize,

    /// Per-packet payload cap in bytes. Higher-level fragmentation is the
    ///  application's business; a longer payload is rejected at the send call.
    pub max_payload: usize,

    /// How often an unacknowledged packet is retransmitted before the peer is
    ///  reported dead via a `Timeout` event.
    pub max_retransmissions: u32,

    /// Delay before an unacknowledged packet is sent again.
    pub retransmission_timeout: Duration,

    /// Debug hook simulating a lossy substrate: every outgoing packet is
    ///  dropped with probability 1/N. `0` disables the hook.
    pub drop_one_in: u32,
}

impl Default for RudpConfig {
    fn default() -> RudpConfig {
        RudpConfig {
            window: 3,
            max_payload: 1000,
            max_retransmissions: 5,
            retransmission_timeout: Duration::from_millis(2000),
            drop_one_in: 0,
        }
    }
}

impl RudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.window == 0 {
            bail!("window must hold at least one packet");
        }
        if self.window >= (u32::MAX / 4) as usize {
            // the duplicate-ACK check relies on the window being far smaller
            //  than half the sequence space
            bail!("window of {} is too deep for modular sequence comparison", self.window);
        }
        if self.max_payload == 0 {
            bail!("max payload must be positive");
        }
        if self.max_payload > i32::MAX as usize {
            bail!("max payload of {} does not fit the wire format's length field", self.max_payload);
        }
        if self.retransmission_timeout.is_zero() {
            bail!("retransmission timeout must be positive");
        }
        Ok(())
    }

    /// Full size of one wire record: header plus the padded payload area.
    pub fn record_len(&self) -> usize {
        packet::HEADER_LEN + self.max_payload
    }
}
