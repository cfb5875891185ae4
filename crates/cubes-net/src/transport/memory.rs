//! In-process transport: two byte pipes cross-wired into a duplex stream.
//!
//! Used when the server is embedded in the client process, and by tests as a
//! fake network that needs no ports.

use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

use super::{Transport, TransportServer, closed_error, read_timeout};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// One direction of a memory connection, carrying written buffers as chunks.
///
/// Closing drops the only sender: readers drain what was already sent and
/// then see end of stream.
#[derive(Debug)]
struct Pipe {
    sender: Mutex<Option<Sender<Vec<u8>>>>,
    receiver: Receiver<Vec<u8>>,
}

impl Pipe {
    fn new() -> Arc<Self> {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Arc::new(Self {
            sender: Mutex::new(Some(sender)),
            receiver,
        })
    }

    fn close(&self) {
        lock(&self.sender).take();
    }
}

struct PipeReader {
    chunks: Receiver<Vec<u8>>,
    /// Unread tail of the last chunk, shared by every reader of this end.
    leftover: Arc<Mutex<Vec<u8>>>,
    timeout: Arc<Mutex<Option<Duration>>>,
}

impl Read for PipeReader {
    fn read(&mut self, out: &mut [u8]) -> io::Result<usize> {
        if out.is_empty() {
            return Ok(0);
        }
        let mut leftover = lock(&self.leftover);
        while leftover.is_empty() {
            let timeout = *lock(&self.timeout);
            let chunk = match timeout {
                Some(timeout) => self.chunks.recv_timeout(timeout),
                None => self.chunks.recv().map_err(|_| RecvTimeoutError::Disconnected),
            };
            match chunk {
                Ok(chunk) => *leftover = chunk,
                Err(RecvTimeoutError::Timeout) => {
                    return Err(io::Error::new(io::ErrorKind::TimedOut, "read timed out"));
                }
                Err(RecvTimeoutError::Disconnected) => return Ok(0),
            }
        }
        let n = out.len().min(leftover.len());
        out[..n].copy_from_slice(&leftover[..n]);
        leftover.drain(..n);
        Ok(n)
    }
}

struct PipeWriter {
    pipe: Arc<Pipe>,
}

impl Write for PipeWriter {
    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let broken = || io::Error::new(io::ErrorKind::BrokenPipe, "pipe closed");
        let sender = lock(&self.pipe.sender);
        let sender = sender.as_ref().ok_or_else(broken)?;
        if !data.is_empty() {
            sender.send(data.to_vec()).map_err(|_| broken())?;
        }
        Ok(data.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

/// One end of an in-process duplex connection.
#[derive(Debug)]
pub struct MemoryTransport {
    incoming: Arc<Pipe>,
    outgoing: Arc<Pipe>,
    leftover: Arc<Mutex<Vec<u8>>>,
    timeout: Arc<Mutex<Option<Duration>>>,
    remote: String,
    closed: AtomicBool,
}

impl MemoryTransport {
    /// Two connected ends. Each end's `remote_address` is the other's name.
    pub fn pair(a: &str, b: &str) -> (MemoryTransport, MemoryTransport) {
        let a_to_b = Pipe::new();
        let b_to_a = Pipe::new();
        let end = |incoming: &Arc<Pipe>, outgoing: &Arc<Pipe>, remote: &str| MemoryTransport {
            incoming: incoming.clone(),
            outgoing: outgoing.clone(),
            leftover: Arc::new(Mutex::new(Vec::new())),
            timeout: Arc::new(Mutex::new(None)),
            remote: format!("memory:{remote}"),
            closed: AtomicBool::new(false),
        };
        (end(&b_to_a, &a_to_b, b), end(&a_to_b, &b_to_a, a))
    }
}

impl Transport for MemoryTransport {
    fn reader(&self) -> io::Result<Box<dyn Read + Send>> {
        Ok(Box::new(PipeReader {
            chunks: self.incoming.receiver.clone(),
            leftover: self.leftover.clone(),
            timeout: self.timeout.clone(),
        }))
    }

    fn writer(&self) -> io::Result<Box<dyn Write + Send>> {
        Ok(Box::new(PipeWriter {
            pipe: self.outgoing.clone(),
        }))
    }

    fn set_read_timeout(&self, timeout: Option<Duration>) -> io::Result<()> {
        *lock(&self.timeout) = read_timeout(timeout);
        Ok(())
    }

    fn remote_address(&self) -> String {
        self.remote.clone()
    }

    fn is_connected(&self) -> bool {
        !self.closed.load(Ordering::Acquire)
    }

    fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.incoming.close();
        self.outgoing.close();
    }
}

/// Hands out client ends connected to a [`MemoryTransportServer`].
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    name: String,
    pending: Sender<Option<MemoryTransport>>,
    closed: Arc<AtomicBool>,
    next_client: Arc<AtomicU64>,
}

impl MemoryConnector {
    /// Open a new connection. The server end is queued for `accept`.
    pub fn connect(&self) -> io::Result<MemoryTransport> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                format!("memory server {} is closed", self.name),
            ));
        }
        let client = format!(
            "{}-client-{}",
            self.name,
            self.next_client.fetch_add(1, Ordering::Relaxed)
        );
        let (client_end, server_end) = MemoryTransport::pair(&client, &self.name);
        self.pending
            .send(Some(server_end))
            .map_err(|_| closed_error("memory server"))?;
        Ok(client_end)
    }
}

/// In-process listener.
#[derive(Debug)]
pub struct MemoryTransportServer {
    connector: MemoryConnector,
    accepted: Receiver<Option<MemoryTransport>>,
}

impl MemoryTransportServer {
    pub fn new(name: &str) -> Self {
        let (pending, accepted) = crossbeam_channel::unbounded();
        Self {
            connector: MemoryConnector {
                name: name.to_string(),
                pending,
                closed: Arc::new(AtomicBool::new(false)),
                next_client: Arc::new(AtomicU64::new(1)),
            },
            accepted,
        }
    }

    /// A handle clients use to reach this server.
    pub fn connector(&self) -> MemoryConnector {
        self.connector.clone()
    }
}

impl TransportServer for MemoryTransportServer {
    fn accept(&self) -> io::Result<Box<dyn Transport>> {
        if self.connector.closed.load(Ordering::Acquire) {
            return Err(closed_error("memory server"));
        }
        match self.accepted.recv() {
            Ok(Some(transport)) => Ok(Box::new(transport)),
            // The wake-up marker sent by `close`, or every sender gone.
            Ok(None) | Err(_) => Err(closed_error("memory server")),
        }
    }

    fn local_address(&self) -> String {
        format!("memory:{}", self.connector.name)
    }

    fn close(&self) {
        if self.connector.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let _ = self.connector.pending.send(None);
        // Connections nobody will accept.
        while let Ok(Some(transport)) = self.accepted.try_recv() {
            transport.close();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_pair_is_duplex() {
        let (a, b) = MemoryTransport::pair("a", "b");
        a.writer().unwrap().write_all(b"ping").unwrap();
        b.writer().unwrap().write_all(b"pong").unwrap();

        let mut buf = [0u8; 4];
        b.reader().unwrap().read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"ping");
        a.reader().unwrap().read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"pong");
        assert_eq!(a.remote_address(), "memory:b");
    }

    #[test]
    fn test_close_gives_peer_eof_after_buffered_bytes() {
        let (a, b) = MemoryTransport::pair("a", "b");
        a.writer().unwrap().write_all(&[7]).unwrap();
        a.close();

        let mut reader = b.reader().unwrap();
        let mut buf = [0u8; 4];
        assert_eq!(reader.read(&mut buf).unwrap(), 1);
        assert_eq!(reader.read(&mut buf).unwrap(), 0);
        assert!(b.writer().unwrap().write_all(&[1]).is_err());
        assert!(!a.is_connected());
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let (a, _b) = MemoryTransport::pair("a", "b");
        let mut reader = a.reader().unwrap();
        let handle = thread::spawn(move || {
            let mut buf = [0u8; 1];
            reader.read(&mut buf).unwrap()
        });
        thread::sleep(Duration::from_millis(20));
        a.close();
        assert_eq!(handle.join().unwrap(), 0);
    }

    #[test]
    fn test_read_timeout() {
        let (a, b) = MemoryTransport::pair("a", "b");
        a.set_read_timeout(Some(Duration::from_millis(20))).unwrap();
        let mut buf = [0u8; 1];
        let err = a.reader().unwrap().read(&mut buf).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        // Zero means no timeout, so a later write is still picked up.
        a.set_read_timeout(Some(Duration::ZERO)).unwrap();
        let writer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(40));
            b.writer().unwrap().write_all(&[9]).unwrap();
        });
        assert_eq!(a.reader().unwrap().read(&mut buf).unwrap(), 1);
        assert_eq!(buf, [9]);
        writer.join().unwrap();
    }

    #[test]
    fn test_partial_chunk_survives_reader_handles() {
        let (a, b) = MemoryTransport::pair("a", "b");
        a.writer().unwrap().write_all(&[1, 2, 3]).unwrap();

        let mut one = [0u8; 1];
        b.reader().unwrap().read_exact(&mut one).unwrap();
        assert_eq!(one, [1]);

        let mut rest = [0u8; 2];
        b.reader().unwrap().read_exact(&mut rest).unwrap();
        assert_eq!(rest, [2, 3]);
    }

    #[test]
    fn test_server_accepts_connector_clients() {
        let server = MemoryTransportServer::new("local");
        let connector = server.connector();
        let client = connector.connect().unwrap();
        let accepted = server.accept().unwrap();

        client.writer().unwrap().write_all(&[42]).unwrap();
        let mut buf = [0u8; 1];
        accepted.reader().unwrap().read_exact(&mut buf).unwrap();
        assert_eq!(buf, [42]);
        assert_eq!(accepted.remote_address(), "memory:local-client-1");
    }

    #[test]
    fn test_close_unblocks_accept_and_refuses_connects() {
        let server = Arc::new(MemoryTransportServer::new("local"));
        let acceptor = server.clone();
        let handle = thread::spawn(move || acceptor.accept().is_err());
        thread::sleep(Duration::from_millis(20));
        server.close();
        assert!(handle.join().unwrap());
        assert!(server.connector().connect().is_err());
    }
}
