//! TCP client connections and the guarded client list.
//!
//! Wire format: all integers little-endian. On connect a client receives
//! the initialization snapshot (magic, camera count, per-camera codec
//! headers and parameters); afterwards it receives framed compressed frames
//! indefinitely. Any bytes a client sends are a disconnect request.

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpStream};

use parking_lot::Mutex;

/// First u32 of the initialization snapshot.
pub const STREAM_MAGIC: u32 = 0x12345678;

/// One connected downstream client.
pub struct Client {
    stream: TcpStream,
    peer: SocketAddr,
}

impl Client {
    pub fn new(stream: TcpStream, peer: SocketAddr) -> Self {
        Self { stream, peer }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Zero-timeout readability check. Any readable byte (or EOF, or a
    /// socket error) is a disconnect request; no payload is interpreted.
    pub fn wants_disconnect(&mut self) -> bool {
        let mut probe = [0u8; 4];
        if self.stream.set_nonblocking(true).is_err() {
            return true;
        }
        let verdict = match self.stream.read(&mut probe) {
            Ok(_) => true,
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => false,
            Err(_) => true,
        };
        if self.stream.set_nonblocking(false).is_err() {
            return true;
        }
        verdict
    }

    /// Write one framed compressed frame and flush.
    pub fn send_frame(&mut self, meta_frame_index: u32, frame_id: u32, blob: &[u8]) -> std::io::Result<()> {
        self.stream.write_all(&meta_frame_index.to_le_bytes())?;
        self.stream.write_all(&frame_id.to_le_bytes())?;
        self.stream.write_all(blob)?;
        self.stream.flush()
    }

    /// Close the connection, logging failures (used during shutdown).
    pub fn close(self) {
        if let Err(e) = self.stream.shutdown(std::net::Shutdown::Both) {
            log::warn!("Error disconnecting client {}: {}", self.peer, e);
        }
    }
}

/// The mutable client list. Insertions happen only from the acceptor,
/// removals only from the broadcaster; the broadcaster holds the lock for
/// the duration of one frame's fan-out.
#[derive(Default)]
pub struct ClientList {
    clients: Mutex<Vec<Client>>,
}

impl ClientList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, client: Client) {
        self.clients.lock().push(client);
    }

    pub fn len(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn lock(&self) -> parking_lot::MutexGuard<'_, Vec<Client>> {
        self.clients.lock()
    }

    /// Disconnect everyone; per-client errors are logged, never propagated.
    pub fn close_all(&self) {
        for client in self.clients.lock().drain(..) {
            log::debug!("Disconnecting client {}", client.peer());
            client.close();
        }
    }
}
