//! RT-safe invariant signaling for real-time audio paths.
//!
//! This module provides a two-tier invariant system:
//! - **Tier 1 (RT-safe)**: Lock-free signaling of event IDs from the audio callback
//! - **Tier 2 (Non-RT)**: Draining, counting and contract testing on the control thread
//!
//! # Design Philosophy
//!
//! RT code **signals facts**. Non-RT code **judges correctness**.
//!
//! The scheduler never logs. It pushes one `u8` per event into an SPSC ring;
//! the engine drains the ring in `poll()` and turns the ids into statistics,
//! diagnostics and `tracing` events.
//!
//! # Example
//!
//! ```
//! use pdcore::invariant_rt::*;
//!
//! let (mut tx, mut rx) = new_invariant_queue();
//! signal_invariant(&mut tx, INV_BLOCK_RENDERED);
//!
//! let signals = drain_invariant_signals(&mut rx);
//! assert!(signals.contains(&INV_BLOCK_RENDERED));
//! ```

use rtrb::{Consumer, Producer, RingBuffer};

// ============================================================================
// RT-Safe Event IDs (Tier 1)
// ============================================================================

/// A block was rendered (bound or silent).
pub const INV_BLOCK_RENDERED: u8 = 1;

/// A new runtime was installed at a block boundary.
pub const INV_GRAPH_SWAPPED: u8 = 2;

/// The bound runtime was removed at a block boundary.
pub const INV_GRAPH_UNBOUND: u8 = 3;

/// A message reached at least one receiver.
pub const INV_MESSAGE_APPLIED: u8 = 4;

/// A message named a target the bound runtime does not declare.
pub const INV_MESSAGE_UNROUTED: u8 = 5;

/// Non-finite samples were replaced with zero during a block.
pub const INV_SAMPLES_SANITIZED: u8 = 6;

/// A block was rendered with no runtime bound.
pub const INV_SILENCE_RENDERED: u8 = 7;

/// The retirement ring was full and a runtime was freed in the audio context.
pub const INV_RETIRE_OVERFLOW: u8 = 8;

// ============================================================================
// Invariant Signal Queue
// ============================================================================

/// Capacity for the signal queue.
///
/// Every rendered block pushes at least one id, so at 48 kHz / 64 frames
/// (750 blocks/s) the queue fills after about 1.3 s without a drain, and
/// less when messages or swaps add ids. Ids pushed while it is full are lost.
pub const INVARIANT_QUEUE_CAPACITY: usize = 1024;

/// Creates a new signal queue pair.
///
/// Returns (producer for RT, consumer for the control thread).
pub fn new_invariant_queue() -> (Producer<u8>, Consumer<u8>) {
    RingBuffer::new(INVARIANT_QUEUE_CAPACITY)
}

/// Signals an event from the RT path.
///
/// # RT Safety
/// - No allocation
/// - No locking
/// - No panics
/// - If the queue is full, the signal is dropped (preferable to blocking)
#[inline]
pub fn signal_invariant(tx: &mut Producer<u8>, id: u8) {
    let _ = tx.push(id);
}

// ============================================================================
// Non-RT Verification (Tier 2)
// ============================================================================

/// Drains all pending signals from the queue.
pub fn drain_invariant_signals(rx: &mut Consumer<u8>) -> Vec<u8> {
    let mut signals = Vec::with_capacity(rx.slots());
    while let Ok(id) = rx.pop() {
        signals.push(id);
    }
    signals
}

/// Counts occurrences of each ID in a signal list.
pub fn count_invariant_signals(signals: &[u8]) -> [usize; 256] {
    let mut counts = [0usize; 256];
    for &id in signals {
        counts[id as usize] += 1;
    }
    counts
}

/// Contract verification: asserts that required signals were seen.
///
/// # Panics
/// Panics if any required ID was not signaled at least once.
#[cfg(any(test, feature = "ppt"))]
pub fn contract_test_rt(contract_name: &str, signals: &[u8], required: &[u8]) {
    let counts = count_invariant_signals(signals);
    let missing: Vec<&str> = required
        .iter()
        .filter(|&&id| counts[id as usize] == 0)
        .map(|&id| invariant_name(id))
        .collect();

    if !missing.is_empty() {
        let present: std::collections::BTreeSet<&str> =
            signals.iter().map(|&id| invariant_name(id)).collect();
        panic!(
            "RT Contract '{}' missing invariants: {:?}. Present: {:?}",
            contract_name, missing, present
        );
    }
}

/// Maps an ID to a human-readable name (for diagnostics only).
pub const fn invariant_name(id: u8) -> &'static str {
    match id {
        INV_BLOCK_RENDERED => "BLOCK_RENDERED",
        INV_GRAPH_SWAPPED => "GRAPH_SWAPPED",
        INV_GRAPH_UNBOUND => "GRAPH_UNBOUND",
        INV_MESSAGE_APPLIED => "MESSAGE_APPLIED",
        INV_MESSAGE_UNROUTED => "MESSAGE_UNROUTED",
        INV_SAMPLES_SANITIZED => "SAMPLES_SANITIZED",
        INV_SILENCE_RENDERED => "SILENCE_RENDERED",
        INV_RETIRE_OVERFLOW => "RETIRE_OVERFLOW",
        _ => "UNKNOWN",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invariant_queue_roundtrip() {
        let (mut tx, mut rx) = new_invariant_queue();

        signal_invariant(&mut tx, INV_BLOCK_RENDERED);
        signal_invariant(&mut tx, INV_MESSAGE_APPLIED);
        signal_invariant(&mut tx, INV_BLOCK_RENDERED);

        let signals = drain_invariant_signals(&mut rx);
        assert_eq!(
            signals,
            vec![INV_BLOCK_RENDERED, INV_MESSAGE_APPLIED, INV_BLOCK_RENDERED]
        );
    }

    #[test]
    fn test_count_invariant_signals() {
        let signals = vec![INV_BLOCK_RENDERED, INV_BLOCK_RENDERED, INV_GRAPH_SWAPPED];
        let counts = count_invariant_signals(&signals);
        assert_eq!(counts[INV_BLOCK_RENDERED as usize], 2);
        assert_eq!(counts[INV_GRAPH_SWAPPED as usize], 1);
        assert_eq!(counts[INV_GRAPH_UNBOUND as usize], 0);
    }

    #[test]
    #[should_panic(expected = "missing invariants")]
    fn test_contract_fails_when_invariants_missing() {
        contract_test_rt(
            "incomplete contract",
            &[INV_BLOCK_RENDERED],
            &[INV_BLOCK_RENDERED, INV_MESSAGE_APPLIED],
        );
    }

    #[test]
    fn test_queue_handles_overflow_gracefully() {
        let (mut tx, mut rx) = new_invariant_queue();
        for _ in 0..INVARIANT_QUEUE_CAPACITY + 100 {
            signal_invariant(&mut tx, INV_BLOCK_RENDERED);
        }
        assert_eq!(drain_invariant_signals(&mut rx).len(), INVARIANT_QUEUE_CAPACITY);
    }

    #[test]
    fn test_invariant_names() {
        assert_eq!(invariant_name(INV_SAMPLES_SANITIZED), "SAMPLES_SANITIZED");
        assert_eq!(invariant_name(255), "UNKNOWN");
    }
}
