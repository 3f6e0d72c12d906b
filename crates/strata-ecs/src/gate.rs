//! Reentrant reader/writer gate guarding a storage's critical sections.
//!
//! The gate carries no data. It serializes writers, lets readers share, and
//! lets the thread that owns the write side re-enter both reads and writes
//! (nested batches, merges that create entities, predicates that read the
//! storage back). Read sections may nest too. Upgrading a read section to a
//! write section is a programming error and panics instead of deadlocking.

use std::collections::HashMap;
use std::thread::{self, ThreadId};

use parking_lot::{Condvar, Mutex};

#[derive(Debug, Default)]
struct GateState {
    writer: Option<ThreadId>,
    write_depth: usize,
    waiting_writers: usize,
    readers: HashMap<ThreadId, usize>,
}

#[derive(Debug, Default)]
pub(crate) struct Gate {
    state: Mutex<GateState>,
    changed: Condvar,
}

impl Gate {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Enter a read section.
    pub(crate) fn read(&self) -> GateReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_depth += 1;
            return GateReadGuard {
                gate: self,
                under_writer: true,
            };
        }
        if let Some(depth) = state.readers.get_mut(&me) {
            *depth += 1;
            return GateReadGuard {
                gate: self,
                under_writer: false,
            };
        }
        while state.writer.is_some() || state.waiting_writers > 0 {
            self.changed.wait(&mut state);
        }
        state.readers.insert(me, 1);
        GateReadGuard {
            gate: self,
            under_writer: false,
        }
    }

    /// Enter a write section.
    ///
    /// # Panics
    ///
    /// Panics when the current thread is inside a read section.
    pub(crate) fn write(&self) -> GateWriteGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_depth += 1;
            return GateWriteGuard { gate: self };
        }
        if state.readers.contains_key(&me) {
            drop(state);
            panic!("storage write attempted from inside a read section on the same thread");
        }
        state.waiting_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            self.changed.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = Some(me);
        state.write_depth = 1;
        GateWriteGuard { gate: self }
    }

    /// Whether the current thread owns the write side.
    pub(crate) fn is_writer(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    fn leave_write(&self) {
        let mut state = self.state.lock();
        state.write_depth -= 1;
        if state.write_depth == 0 {
            state.writer = None;
            self.changed.notify_all();
        }
    }

    fn leave_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(depth) = state.readers.get_mut(&me) {
            *depth -= 1;
            if *depth == 0 {
                state.readers.remove(&me);
                if state.readers.is_empty() {
                    self.changed.notify_all();
                }
            }
        }
    }
}

/// Read section; released on drop.
#[must_use]
pub(crate) struct GateReadGuard<'a> {
    gate: &'a Gate,
    under_writer: bool,
}

impl Drop for GateReadGuard<'_> {
    fn drop(&mut self) {
        if self.under_writer {
            self.gate.leave_write();
        } else {
            self.gate.leave_read();
        }
    }
}

/// Write section; released on drop, including during unwinding.
#[must_use]
pub(crate) struct GateWriteGuard<'a> {
    gate: &'a Gate,
}

impl Drop for GateWriteGuard<'_> {
    fn drop(&mut self) {
        self.gate.leave_write();
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn writer_reenters_reads_and_writes() {
        let gate = Gate::new();
        let outer = gate.write();
        {
            let _inner = gate.write();
            let _read = gate.read();
            assert!(gate.is_writer());
        }
        assert!(gate.is_writer());
        drop(outer);
        assert!(!gate.is_writer());
    }

    #[test]
    fn nested_reads_do_not_block() {
        let gate = Gate::new();
        let _a = gate.read();
        let _b = gate.read();
        assert!(!gate.is_writer());
    }

    #[test]
    #[should_panic(expected = "read section")]
    fn upgrade_panics() {
        let gate = Gate::new();
        let _read = gate.read();
        let _write = gate.write();
    }

    #[test]
    fn writers_are_exclusive() {
        let gate = Arc::new(Gate::new());
        let inside = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let gate = Arc::clone(&gate);
                let inside = Arc::clone(&inside);
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        let _w = gate.write();
                        assert_eq!(inside.fetch_add(1, Ordering::SeqCst), 0);
                        std::thread::sleep(Duration::from_micros(10));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }

    #[test]
    fn guard_released_on_panic() {
        let gate = Arc::new(Gate::new());
        let g = Arc::clone(&gate);
        let result = std::thread::spawn(move || {
            let _w = g.write();
            panic!("boom");
        })
        .join();
        assert!(result.is_err());
        let _w = gate.write();
    }
}
