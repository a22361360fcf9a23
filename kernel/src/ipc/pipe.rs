//! Kernel byte pipe
//!
//! A unidirectional stream between a writer endpoint and a reader
//! endpoint sharing one page-sized ring buffer. Head and tail are free
//! running counters (data in flight = tail - head). Blocking is by
//! condition: writers park on not-full, readers on not-empty. Peer
//! liveness decides EOF (reader side) and broken-pipe (writer side), and
//! the ring storage is dropped once both ends are closed.

use alloc::boxed::Box;
use alloc::sync::Arc;

use spin::Mutex;

use crate::arch;
use crate::error::{KernelError, Result};
use crate::io::{Control, Io, IoRef, IoRefCount};
use crate::memory::PAGE_SIZE;
use crate::task::Condition;

const PIPE_BUF_SIZE: usize = PAGE_SIZE;

struct PipeState {
    /// Freed (dropped) once both ends are closed.
    buf: Option<Box<[u8; PIPE_BUF_SIZE]>>,
    head: u64,
    tail: u64,
    reader_open: bool,
    writer_open: bool,
}

impl PipeState {
    fn available(&self) -> u64 {
        self.tail - self.head
    }

    fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    fn is_full(&self) -> bool {
        self.available() == PIPE_BUF_SIZE as u64
    }

    fn push(&mut self, byte: u8) {
        let tail = self.tail;
        self.buf.as_mut().expect("push on a freed pipe")[tail as usize % PIPE_BUF_SIZE] =
            byte;
        self.tail = tail + 1;
    }

    fn pop(&mut self) -> u8 {
        let head = self.head;
        let byte =
            self.buf.as_ref().expect("pop on a freed pipe")[head as usize % PIPE_BUF_SIZE];
        self.head = head + 1;
        byte
    }
}

struct PipeShared {
    state: Mutex<PipeState>,
    not_empty: Condition,
    not_full: Condition,
}

pub struct PipeWriter {
    refs: IoRefCount,
    shared: Arc<PipeShared>,
}

pub struct PipeReader {
    refs: IoRefCount,
    shared: Arc<PipeShared>,
}

/// Create a connected pipe; returns `(writer, reader)`.
pub fn create_pipe() -> (IoRef, IoRef) {
    let shared = Arc::new(PipeShared {
        state: Mutex::new(PipeState {
            buf: Some(Box::new([0u8; PIPE_BUF_SIZE])),
            head: 0,
            tail: 0,
            reader_open: true,
            writer_open: true,
        }),
        not_empty: Condition::new("pipe.notempty"),
        not_full: Condition::new("pipe.notfull"),
    });

    let writer = IoRef::new(Arc::new(PipeWriter {
        refs: IoRefCount::new(),
        shared: shared.clone(),
    }));
    let reader = IoRef::new(Arc::new(PipeReader {
        refs: IoRefCount::new(),
        shared,
    }));
    (writer, reader)
}

fn maybe_free(state: &mut PipeState) {
    if !state.reader_open && !state.writer_open {
        state.buf.take();
    }
}

impl Io for PipeWriter {
    fn refs(&self) -> &IoRefCount {
        &self.refs
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        enum Step {
            Pushed,
            Full,
            Broken,
        }

        if buf.is_empty() {
            return Ok(0);
        }

        // An already-severed pipe fails before any byte moves.
        if !self.shared.state.lock().reader_open {
            return Err(KernelError::BrokenPipe);
        }

        let mut written = 0;
        while written < buf.len() {
            // Check, push, and park all happen inside one interrupts-off
            // window, so neither a drain nor a close can slip between
            // the predicate and the action.
            let pie = arch::disable_interrupts();
            let step = {
                let mut state = self.shared.state.lock();
                if !state.reader_open {
                    Step::Broken
                } else if state.is_full() {
                    Step::Full
                } else {
                    state.push(buf[written]);
                    Step::Pushed
                }
            };
            match step {
                Step::Pushed => {
                    arch::restore_interrupts(pie);
                    written += 1;
                    // Let the reader start draining at every page-sized
                    // chunk rather than only at the end.
                    if written % PIPE_BUF_SIZE == 0 {
                        self.shared.not_empty.broadcast();
                    }
                }
                Step::Full => {
                    self.shared.not_full.wait();
                    arch::restore_interrupts(pie);
                }
                Step::Broken => {
                    arch::restore_interrupts(pie);
                    if written > 0 {
                        self.shared.not_empty.broadcast();
                        return Ok(written);
                    }
                    return Err(KernelError::BrokenPipe);
                }
            }
        }

        self.shared.not_empty.broadcast();
        Ok(written)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            // Writer end reports the space left in the ring.
            Control::GetEnd => {
                let state = self.shared.state.lock();
                Ok(PIPE_BUF_SIZE as u64 - state.available())
            }
            _ => Err(KernelError::NotSupported),
        }
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        state.writer_open = false;
        maybe_free(&mut state);
        drop(state);
        // Pending readers must wake to observe EOF.
        self.shared.not_empty.broadcast();
    }
}

impl Io for PipeReader {
    fn refs(&self) -> &IoRefCount {
        &self.refs
    }

    fn read(&self, buf: &mut [u8]) -> Result<usize> {
        enum Step {
            Data,
            Eof,
            Empty,
        }

        if buf.is_empty() {
            return Ok(0);
        }

        // Wait for data or writer departure. The predicate and the park
        // share one interrupts-off window per pass.
        loop {
            let pie = arch::disable_interrupts();
            let step = {
                let state = self.shared.state.lock();
                if !state.is_empty() {
                    Step::Data
                } else if !state.writer_open {
                    Step::Eof
                } else {
                    Step::Empty
                }
            };
            match step {
                Step::Data => {
                    arch::restore_interrupts(pie);
                    break;
                }
                Step::Eof => {
                    arch::restore_interrupts(pie);
                    return Ok(0);
                }
                Step::Empty => {
                    self.shared.not_empty.wait();
                    arch::restore_interrupts(pie);
                }
            }
        }

        // Drain what is there; the writer can only add bytes, never
        // remove them.
        let mut filled = 0;
        while filled < buf.len() {
            let mut state = self.shared.state.lock();
            if state.is_empty() {
                break;
            }
            buf[filled] = state.pop();
            filled += 1;
        }

        self.shared.not_full.broadcast();
        Ok(filled)
    }

    fn control(&self, cmd: Control) -> Result<u64> {
        match cmd {
            Control::GetBlockSize => Ok(1),
            // Reader end reports the bytes ready to read.
            Control::GetEnd => Ok(self.shared.state.lock().available()),
            _ => Err(KernelError::NotSupported),
        }
    }

    fn close(&self) {
        let mut state = self.shared.state.lock();
        state.reader_open = false;
        maybe_free(&mut state);
        drop(state);
        // Pending writers must wake to observe the broken pipe.
        self.shared.not_full.broadcast();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bytes_arrive_in_order() {
        let (w, r) = create_pipe();
        let data: alloc::vec::Vec<u8> = (0..200u16).map(|i| (i % 251) as u8).collect();
        assert_eq!(w.write(&data).unwrap(), 200);

        let mut first = [0u8; 80];
        let mut rest = [0u8; 200];
        assert_eq!(r.read(&mut first).unwrap(), 80);
        let n = r.read(&mut rest).unwrap();
        assert_eq!(n, 120);
        assert_eq!(&first[..], &data[..80]);
        assert_eq!(&rest[..n], &data[80..]);
    }

    #[test]
    fn test_reader_sees_eof_after_writer_closes() {
        let (w, r) = create_pipe();
        w.write(b"tail").unwrap();
        drop(w);

        let mut buf = [0u8; 8];
        assert_eq!(r.read(&mut buf).unwrap(), 4);
        assert_eq!(&buf[..4], b"tail");
        // Writer gone and ring drained: EOF, not a block.
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_write_after_reader_closes_is_broken_pipe() {
        let (w, r) = create_pipe();
        drop(r);
        assert_eq!(w.write(b"x"), Err(KernelError::BrokenPipe));
    }

    #[test]
    fn test_get_end_reports_both_sides() {
        let (w, r) = create_pipe();
        w.write(&[0u8; 100]).unwrap();
        assert_eq!(r.control(Control::GetEnd).unwrap(), 100);
        assert_eq!(
            w.control(Control::GetEnd).unwrap(),
            (PIPE_BUF_SIZE - 100) as u64
        );
        assert_eq!(r.block_size(), 1);
        assert_eq!(w.block_size(), 1);
    }

    #[test]
    fn test_dup_of_an_end_keeps_it_alive() {
        let (w, r) = create_pipe();
        let w2 = w.clone();
        drop(w);
        // One writer reference remains; the reader must not see EOF.
        w2.write(b"ok").unwrap();
        let mut buf = [0u8; 2];
        assert_eq!(r.read(&mut buf).unwrap(), 2);
        drop(w2);
        assert_eq!(r.read(&mut buf).unwrap(), 0);
    }
}
