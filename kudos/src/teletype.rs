//! A teletype (TTY) interface for character-based I/O.
//!
//! The console is the device behind file descriptors 0 and 1 and carries
//! the process termination messages. [`StdTty`] forwards to the host
//! terminal; [`PipeTty`] is an in-memory console that tests script and
//! inspect.

use std::collections::VecDeque;
use std::sync::Arc;

use crate::sync::SpinLock;
use crate::KernelError;

/// A generic character-based input/output device.
pub trait Teletype: Send {
    /// Writes data to the teletype, returning the bytes written.
    fn write(&mut self, data: &[u8]) -> Result<usize, KernelError>;

    /// Reads data into `data`, returning the bytes read.
    fn read(&mut self, data: &mut [u8]) -> Result<usize, KernelError>;
}

/// The host terminal.
pub struct StdTty;

impl Teletype for StdTty {
    fn write(&mut self, data: &[u8]) -> Result<usize, KernelError> {
        print!("{}", String::from_utf8_lossy(data));
        Ok(data.len())
    }

    fn read(&mut self, _data: &mut [u8]) -> Result<usize, KernelError> {
        // No interactive input on the host console.
        Ok(0)
    }
}

struct PipeInner {
    input: VecDeque<u8>,
    output: Vec<u8>,
}

/// An in-memory console.
///
/// Clones share the same buffers, so a test keeps one clone, hands the
/// other to the kernel, and later inspects what the machine printed.
#[derive(Clone)]
pub struct PipeTty {
    inner: Arc<SpinLock<PipeInner>>,
}

impl PipeTty {
    pub fn new() -> Self {
        PipeTty {
            inner: Arc::new(SpinLock::new(PipeInner {
                input: VecDeque::new(),
                output: Vec::new(),
            })),
        }
    }

    /// Queues bytes for the machine to read from fd 0.
    pub fn feed_input(&self, bytes: &[u8]) {
        self.inner.lock().input.extend(bytes.iter().copied());
    }

    /// Everything the machine has written so far.
    pub fn output(&self) -> Vec<u8> {
        self.inner.lock().output.clone()
    }

    /// Everything written so far, as text.
    pub fn output_string(&self) -> String {
        String::from_utf8_lossy(&self.output()).into_owned()
    }
}

impl Default for PipeTty {
    fn default() -> Self {
        Self::new()
    }
}

impl Teletype for PipeTty {
    fn write(&mut self, data: &[u8]) -> Result<usize, KernelError> {
        self.inner.lock().output.extend_from_slice(data);
        Ok(data.len())
    }

    fn read(&mut self, data: &mut [u8]) -> Result<usize, KernelError> {
        let mut inner = self.inner.lock();
        let mut n = 0;
        while n < data.len() {
            match inner.input.pop_front() {
                Some(b) => {
                    data[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pipe_round_trip() {
        let tty = PipeTty::new();
        let mut dev = tty.clone();
        dev.write(b"hello").unwrap();
        assert_eq!(tty.output_string(), "hello");

        tty.feed_input(b"abc");
        let mut buf = [0u8; 8];
        assert_eq!(dev.read(&mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
    }
}
