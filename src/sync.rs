//! Inter-worker hand-off primitives
//!
//! One `Synchronizer` sits between each adjacent worker pair. It carries
//! two things in opposite directions: the downstream worker's synced bit
//! position travels upstream as a stop bound (a single atomic, polled
//! between blocks), and the upstream worker's resolved 32 KiB context
//! travels downstream under a mutex + condvar.
//!
//! `OrderedWriter` serializes chunk emission: workers finish decoding in
//! any order, but bytes reach the output strictly in stream order.

use std::io::{self, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::Duration;

pub const STOP_UNSET: u64 = u64::MAX;

/// How long blocked workers sleep between abort-flag checks.
const WAIT_TICK: Duration = Duration::from_millis(50);

/// Cooperative cancellation: set once by the first failing worker, checked
/// by every blocking wait.
#[derive(Default)]
pub struct AbortFlag(AtomicBool);

impl AbortFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Default)]
struct HandOff {
    context: Option<Vec<u8>>,
    stopped_at: u64,
}

pub struct Synchronizer {
    stop_after: AtomicU64,
    state: Mutex<HandOff>,
    cond: Condvar,
}

impl Default for Synchronizer {
    fn default() -> Self {
        Synchronizer {
            stop_after: AtomicU64::new(STOP_UNSET),
            state: Mutex::new(HandOff::default()),
            cond: Condvar::new(),
        }
    }
}

impl Synchronizer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Called by the downstream worker once it has synced: the upstream
    /// worker must stop at or after this bit position.
    pub fn set_stop(&self, bitpos: u64) {
        self.stop_after.store(bitpos, Ordering::Release);
    }

    pub fn clear_stop(&self) {
        self.stop_after.store(STOP_UNSET, Ordering::Relaxed);
    }

    /// Polled by the upstream worker between blocks.
    pub fn stop_pos(&self) -> u64 {
        self.stop_after.load(Ordering::Acquire)
    }

    /// Post the resolved context and the bit position the upstream worker
    /// stopped at. Blocks while a previous hand-off has not been taken
    /// yet. Returns false when aborted.
    pub fn put_context(&self, ctx: Vec<u8>, stopped_at: u64, abort: &AbortFlag) -> bool {
        let mut state = self.state.lock().unwrap();
        while state.context.is_some() {
            if abort.is_set() {
                return false;
            }
            state = self.cond.wait_timeout(state, WAIT_TICK).unwrap().0;
        }
        state.context = Some(ctx);
        state.stopped_at = stopped_at;
        self.cond.notify_all();
        true
    }

    /// Take the posted context, blocking until one is available. Returns
    /// None when aborted.
    pub fn get_context(&self, abort: &AbortFlag) -> Option<(Vec<u8>, u64)> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(ctx) = state.context.take() {
                let stopped_at = state.stopped_at;
                self.cond.notify_all();
                return Some((ctx, stopped_at));
            }
            if abort.is_set() {
                return None;
            }
            state = self.cond.wait_timeout(state, WAIT_TICK).unwrap().0;
        }
    }
}

struct WriterState<W> {
    next_seq: u64,
    writer: W,
}

/// Writer shared by all workers: chunk `seq` may only be written once
/// chunks `0..seq` have been.
pub struct OrderedWriter<W: Write> {
    state: Mutex<WriterState<W>>,
    cond: Condvar,
    written: AtomicU64,
    poisoned: AtomicBool,
}

impl<W: Write> OrderedWriter<W> {
    pub fn new(writer: W) -> Self {
        OrderedWriter {
            state: Mutex::new(WriterState {
                next_seq: 0,
                writer,
            }),
            cond: Condvar::new(),
            written: AtomicU64::new(0),
            poisoned: AtomicBool::new(false),
        }
    }

    /// Write the parts of chunk `seq` in stream order.
    pub fn write(&self, seq: u64, parts: &[&[u8]]) -> io::Result<()> {
        let mut state = self.state.lock().unwrap();
        while state.next_seq != seq {
            if self.poisoned.load(Ordering::Acquire) {
                return Err(io::Error::new(io::ErrorKind::BrokenPipe, "output aborted"));
            }
            state = self.cond.wait_timeout(state, WAIT_TICK).unwrap().0;
        }
        let result = if self.poisoned.load(Ordering::Acquire) {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "output aborted"))
        } else {
            let mut res = Ok(());
            for part in parts {
                if let Err(e) = state.writer.write_all(part) {
                    res = Err(e);
                    break;
                }
                self.written.fetch_add(part.len() as u64, Ordering::Relaxed);
            }
            res
        };
        // Advance the chain even on failure so later workers fail fast
        // instead of blocking forever.
        state.next_seq = seq + 1;
        self.cond.notify_all();
        result
    }

    /// Stop the pipeline: every pending and future write fails.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::Release);
        self.cond.notify_all();
    }

    pub fn written(&self) -> u64 {
        self.written.load(Ordering::Relaxed)
    }

    pub fn finish(self) -> io::Result<W> {
        let mut state = self.state.into_inner().unwrap();
        state.writer.flush()?;
        Ok(state.writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn context_hand_off_round_trip() {
        let sync = Synchronizer::new();
        let abort = AbortFlag::new();
        thread::scope(|scope| {
            scope.spawn(|| {
                assert!(sync.put_context(vec![1, 2, 3], 4242, &abort));
            });
            let (ctx, stopped_at) = sync.get_context(&abort).unwrap();
            assert_eq!(ctx, vec![1, 2, 3]);
            assert_eq!(stopped_at, 4242);
        });
    }

    #[test]
    fn stop_position_defaults_unset() {
        let sync = Synchronizer::new();
        assert_eq!(sync.stop_pos(), STOP_UNSET);
        sync.set_stop(123);
        assert_eq!(sync.stop_pos(), 123);
        sync.clear_stop();
        assert_eq!(sync.stop_pos(), STOP_UNSET);
    }

    #[test]
    fn get_context_observes_abort() {
        let sync = Synchronizer::new();
        let abort = AbortFlag::new();
        abort.set();
        assert!(sync.get_context(&abort).is_none());
    }

    #[test]
    fn ordered_writer_orders_out_of_order_writes() {
        let writer = OrderedWriter::new(Vec::new());
        thread::scope(|scope| {
            for seq in (0..8u64).rev() {
                let writer = &writer;
                scope.spawn(move || {
                    let part = [b'0' + seq as u8];
                    writer.write(seq, &[&part]).unwrap();
                });
            }
        });
        assert_eq!(writer.written(), 8);
        let out = writer.finish().unwrap();
        assert_eq!(out, b"01234567");
    }

    #[test]
    fn poison_unblocks_waiters() {
        let writer = OrderedWriter::new(Vec::new());
        thread::scope(|scope| {
            let w = &writer;
            scope.spawn(move || {
                // seq 1 can never proceed; poison must release it.
                assert!(w.write(1, &[b"late"]).is_err());
            });
            writer.poison();
        });
        assert_eq!(writer.written(), 0);
    }
}
