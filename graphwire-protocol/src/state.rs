//! Connection-scoped transfer state shared between the input and worker sides.
//!
//! The in-flight message counter and the dechunker's mid-message flag are
//! packed into a single atomic word. Bit 0 holds the mid-message flag and
//! the remaining bits hold the counter, so decrementing the counter yields
//! both values as one consistent snapshot.

use crate::error::ProtocolError;
use std::sync::atomic::{AtomicU64, Ordering};

const MID_MESSAGE: u64 = 1;
const IN_FLIGHT_UNIT: u64 = 2;

/// Result of completing one in-flight message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Completion {
    /// Messages still in flight after this completion.
    pub remaining: u64,
    /// Whether the dechunker was mid-message at the time of completion.
    pub mid_message: bool,
}

impl Completion {
    /// Output should be flushed only when nothing is in flight and no
    /// further message is partially received.
    pub fn should_flush(&self) -> bool {
        self.remaining == 0 && !self.mid_message
    }
}

/// In-flight counter and mid-message flag for one connection.
#[derive(Debug, Default)]
pub struct TransferState {
    bits: AtomicU64,
}

impl TransferState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a message handed to the session layer. Returns the new count.
    pub fn message_started(&self) -> u64 {
        let prev = self.bits.fetch_add(IN_FLIGHT_UNIT, Ordering::AcqRel);
        (prev >> 1) + 1
    }

    /// Records the completion of a message.
    ///
    /// Fails without modifying state if no message is in flight.
    pub fn message_completed(&self) -> Result<Completion, ProtocolError> {
        let prev = self
            .bits
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |bits| {
                bits.checked_sub(IN_FLIGHT_UNIT)
            })
            .map_err(|_| {
                ProtocolError::Framing("message completed with none in flight".to_string())
            })?;
        let next = prev - IN_FLIGHT_UNIT;
        Ok(Completion {
            remaining: next >> 1,
            mid_message: next & MID_MESSAGE != 0,
        })
    }

    /// Sets or clears the mid-message flag.
    pub fn set_mid_message(&self, mid_message: bool) {
        if mid_message {
            self.bits.fetch_or(MID_MESSAGE, Ordering::AcqRel);
        } else {
            self.bits.fetch_and(!MID_MESSAGE, Ordering::AcqRel);
        }
    }

    /// Returns whether a message is partially received.
    pub fn is_mid_message(&self) -> bool {
        self.bits.load(Ordering::Acquire) & MID_MESSAGE != 0
    }

    /// Returns the number of in-flight messages.
    pub fn in_flight(&self) -> u64 {
        self.bits.load(Ordering::Acquire) >> 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_initial_state() {
        let state = TransferState::new();
        assert_eq!(state.in_flight(), 0);
        assert!(!state.is_mid_message());
    }

    #[test]
    fn test_start_and_complete() {
        let state = TransferState::new();
        assert_eq!(state.message_started(), 1);
        assert_eq!(state.message_started(), 2);

        let completion = state.message_completed().unwrap();
        assert_eq!(completion.remaining, 1);
        assert!(!completion.should_flush());

        let completion = state.message_completed().unwrap();
        assert_eq!(completion.remaining, 0);
        assert!(completion.should_flush());
    }

    #[test]
    fn test_completion_snapshots_mid_message() {
        let state = TransferState::new();
        state.message_started();
        state.set_mid_message(true);

        let completion = state.message_completed().unwrap();
        assert_eq!(completion.remaining, 0);
        assert!(completion.mid_message);
        assert!(!completion.should_flush());

        // The flag survives counter updates.
        assert!(state.is_mid_message());
        state.set_mid_message(false);
        assert!(!state.is_mid_message());
    }

    #[test]
    fn test_completion_without_start_is_rejected() {
        let state = TransferState::new();
        state.set_mid_message(true);

        let result = state.message_completed();
        assert!(matches!(result, Err(ProtocolError::Framing(_))));

        // Neither the counter nor the flag were disturbed.
        assert_eq!(state.in_flight(), 0);
        assert!(state.is_mid_message());
    }

    #[test]
    fn test_concurrent_updates_never_go_negative() {
        let state = Arc::new(TransferState::new());
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        state.message_started();
                        state.set_mid_message(true);
                        state.set_mid_message(false);
                        state.message_completed().unwrap();
                    }
                })
            })
            .collect();

        for thread in threads {
            thread.join().unwrap();
        }

        assert_eq!(state.in_flight(), 0);
        assert!(!state.is_mid_message());
    }
}
