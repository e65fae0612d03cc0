//! Packet link: framing recovery and the per-device reader loop.
//!
//! A [`Link`] owns one [`Transport`] and runs a background reader thread
//! that scans the byte stream for JSON frames, decodes them into
//! [`Packet`]s and hands them to the driver over a channel. Malformed
//! frames are dropped (logged at debug), never surfaced as errors.
//!
//! The serial stream may start mid-packet after a device restart, so the
//! framer discards everything before a `{` start marker and then reads
//! through the matching `}`. Payloads are base64 strings, so braces never
//! nest and the first `}` always terminates the frame.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, trace};

use crate::error::Result;
use crate::port::Transport;
use crate::protocol::packet::Packet;

/// Reader poll interval; also bounds how long shutdown can take.
const READ_POLL: Duration = Duration::from_millis(1);

/// Incremental scan-resync framer for the JSON envelope stream.
#[derive(Debug, Default)]
pub struct JsonFramer {
    buf: Vec<u8>,
    in_frame: bool,
}

impl JsonFramer {
    /// Create an empty framer.
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes, returning every complete frame they finish.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<Vec<u8>> {
        let mut frames = Vec::new();
        for &byte in bytes {
            if !self.in_frame {
                // Resync: drop garbage until a start marker.
                if byte == b'{' {
                    self.in_frame = true;
                    self.buf.clear();
                    self.buf.push(byte);
                }
                continue;
            }
            self.buf.push(byte);
            if byte == b'}' {
                frames.push(std::mem::take(&mut self.buf));
                self.in_frame = false;
            }
        }
        frames
    }
}

/// Bidirectional packet link over one exclusively-owned transport.
pub struct Link {
    transport: Arc<Mutex<Box<dyn Transport>>>,
    name: String,
    rx: Receiver<Packet>,
    stop: Arc<AtomicBool>,
    reader: Option<JoinHandle<()>>,
}

impl Link {
    /// Wrap a transport and start its reader loop.
    pub fn new(transport: Box<dyn Transport>) -> Self {
        let name = transport.name().to_string();
        let transport = Arc::new(Mutex::new(transport));
        let stop = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let reader = thread::spawn({
            let transport = Arc::clone(&transport);
            let stop = Arc::clone(&stop);
            move || read_loop(&transport, &stop, &tx)
        });

        Self {
            transport,
            name,
            rx,
            stop,
            reader: Some(reader),
        }
    }

    /// Port name this link is attached to.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Send one packet, fire and forget.
    pub fn send(&self, packet: &Packet) -> Result<()> {
        trace!("{} <- {:02x?}", self.name, packet.command);
        self.lock_transport().write_bytes(&packet.encode())
    }

    /// Wait up to `timeout` for the next inbound packet.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<Packet> {
        match self.rx.recv_timeout(timeout) {
            Ok(packet) => Some(packet),
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Drain without blocking.
    pub fn try_recv(&self) -> Option<Packet> {
        self.rx.try_recv().ok()
    }

    /// Stop the reader and close the transport. The reader observes the
    /// stop flag within one poll interval.
    pub fn close(&mut self) {
        self.stop.store(true, Ordering::Relaxed);
        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
        if let Err(e) = self.lock_transport().close() {
            debug!("{}: close error ignored: {e}", self.name);
        }
    }

    #[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
    fn lock_transport(&self) -> MutexGuard<'_, Box<dyn Transport>> {
        self.transport.lock().unwrap()
    }
}

impl Drop for Link {
    fn drop(&mut self) {
        self.close();
    }
}

#[allow(clippy::unwrap_used)] // lock poisoning means a panic already happened
fn read_loop(
    transport: &Mutex<Box<dyn Transport>>,
    stop: &AtomicBool,
    tx: &Sender<Packet>,
) {
    let mut framer = JsonFramer::new();
    let mut buf = [0u8; 256];

    while !stop.load(Ordering::Relaxed) {
        let read = {
            let mut port = transport.lock().unwrap();
            if !port.is_open() {
                drop(port);
                thread::sleep(READ_POLL);
                continue;
            }
            port.read_available(&mut buf)
        };

        let n = match read {
            Ok(n) => n,
            Err(e) => {
                debug!("read error, resyncing: {e}");
                thread::sleep(READ_POLL);
                continue;
            }
        };

        if n == 0 {
            thread::sleep(READ_POLL);
            continue;
        }

        for frame in framer.push(&buf[..n]) {
            match Packet::decode(&frame) {
                Ok(packet) => {
                    if tx.send(packet).is_err() {
                        return; // driver side gone
                    }
                }
                Err(e) => debug!("dropping malformed frame: {e}"),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Instant;

    /// Port that is open and silent; counts the writes it receives.
    struct IdlePort {
        writes: Arc<AtomicUsize>,
    }

    impl Transport for IdlePort {
        fn name(&self) -> &str {
            "idle0"
        }

        fn is_open(&self) -> bool {
            true
        }

        fn write_bytes(&mut self, _buf: &[u8]) -> Result<()> {
            self.writes.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }

        fn read_available(&mut self, _buf: &mut [u8]) -> Result<usize> {
            Ok(0)
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_send_not_stalled_by_silent_reader() {
        let writes = Arc::new(AtomicUsize::new(0));
        let link = Link::new(Box::new(IdlePort {
            writes: Arc::clone(&writes),
        }));

        // The reader polls the silent line the whole time; every send must
        // still go out immediately instead of queueing behind a read.
        let started = Instant::now();
        for _ in 0..20 {
            link.send(&Packet::new(0x28, 0xFFF, 0xFFF, Vec::new())).unwrap();
        }
        assert_eq!(writes.load(Ordering::Relaxed), 20);
        assert!(
            started.elapsed() < Duration::from_millis(500),
            "sends stalled behind the reader: {:?}",
            started.elapsed()
        );
        drop(link);
    }

    #[test]
    fn test_framer_resyncs_mid_stream() {
        let mut framer = JsonFramer::new();
        // Tail of a previous frame, then a whole one.
        let frames = framer.push(b"4095,\"l\":2}{\"c\":10,\"s\":1,\"d\":0,\"b\":\"\",\"l\":0}");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0], b"{\"c\":10,\"s\":1,\"d\":0,\"b\":\"\",\"l\":0}");
    }

    #[test]
    fn test_framer_handles_split_frames() {
        let mut framer = JsonFramer::new();
        assert!(framer.push(b"{\"c\":10,\"s\":1,").is_empty());
        let frames = framer.push(b"\"d\":0,\"b\":\"\",\"l\":0}{\"c\":5");
        assert_eq!(frames.len(), 1);
        assert!(framer.push(b",\"s\":2,\"d\":0,\"b\":\"\",\"l\":0}").len() == 1);
    }

    #[test]
    fn test_framer_discards_leading_garbage() {
        let mut framer = JsonFramer::new();
        let frames = framer.push(b"\x00\xffnoise{\"c\":1,\"s\":0,\"d\":0,\"b\":\"\",\"l\":0}");
        assert_eq!(frames.len(), 1);
    }
}
