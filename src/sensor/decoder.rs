//! Pure decoder turning successive sensor bitmasks into per-channel edges.
//!
//! One bit per channel, set while the channel is touched. Comparing the
//! previous and current masks yields discrete start/end events, so the
//! decoder is deterministic and testable without hardware.
//!
//! Known limitation: a touch that starts and ends entirely between two
//! consecutive polls shows up as a start immediately followed by an end with
//! zero apparent duration. Duration precision is bounded by the poll
//! interval; the decoder does not try to reconstruct anything finer.

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum Transition {
    Start,
    End,
}

/// One edge on one channel, produced by [`decode_transitions`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TouchTransition {
    pub channel: u8,
    pub transition: Transition,
}

/// Compare `prev` and `curr` masks and return the edges, ordered by channel
/// index ascending. Unchanged channels produce no event.
pub fn decode_transitions(prev: u16, curr: u16, channels: u8) -> Vec<TouchTransition> {
    let changed = prev ^ curr;
    let mut events = Vec::new();

    for channel in 0..channels.min(16) {
        let bit = 1u16 << channel;
        if changed & bit == 0 {
            continue;
        }
        let transition = if curr & bit != 0 {
            Transition::Start
        } else {
            Transition::End
        };
        events.push(TouchTransition {
            channel,
            transition,
        });
    }

    events
}
