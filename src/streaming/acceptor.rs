//! Client accept loop.
//!
//! New connections receive the initialization snapshot (magic, camera
//! count, per-camera codec headers and parameters, all captured once at
//! startup) and are then inserted into the client list. A failure while
//! sending the snapshot drops the socket; a partial client is never added.

use std::io::Write;
use std::net::{TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::wire::{Client, ClientList};
use crate::error::Result;

pub struct Acceptor {
    shutdown: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl Acceptor {
    /// Spawn the accept loop on an already-bound listener. `snapshot` is
    /// the complete initialization preamble, frozen at server start.
    pub fn spawn(
        listener: TcpListener,
        snapshot: Arc<Vec<u8>>,
        clients: Arc<ClientList>,
        shutdown: Arc<AtomicBool>,
    ) -> Result<Self> {
        listener.set_nonblocking(true)?;
        let loop_shutdown = Arc::clone(&shutdown);
        let thread = thread::Builder::new()
            .name("acceptor".to_string())
            .spawn(move || {
                accept_loop(&listener, &snapshot, &clients, &loop_shutdown);
                log::debug!("Acceptor thread exiting");
            })?;
        Ok(Self {
            shutdown,
            thread: Some(thread),
        })
    }

    /// Signal cancellation and join.
    pub fn stop(mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("Acceptor thread panicked during shutdown");
        }
    }
}

impl Drop for Acceptor {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn accept_loop(
    listener: &TcpListener,
    snapshot: &[u8],
    clients: &ClientList,
    shutdown: &AtomicBool,
) {
    while !shutdown.load(Ordering::Relaxed) {
        match listener.accept() {
            Ok((stream, peer)) => {
                log::info!("Client connected: {}", peer);
                match initialize_client(stream, snapshot) {
                    Ok(client) => {
                        // The snapshot is fully on the wire; only now does
                        // the client become visible to the broadcaster.
                        clients.push(client);
                        log::debug!("Client {} added ({} connected)", peer, clients.len());
                    }
                    Err(e) => {
                        log::warn!("Disconnecting new client {}: {}", peer, e);
                    }
                }
            }
            Err(ref e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                thread::sleep(Duration::from_millis(50));
            }
            Err(e) => {
                log::error!("Accept error: {}", e);
                thread::sleep(Duration::from_millis(50));
            }
        }
    }
}

fn initialize_client(mut stream: TcpStream, snapshot: &[u8]) -> std::io::Result<Client> {
    let peer = stream.peer_addr()?;
    stream.set_nodelay(true)?;
    stream.write_all(snapshot)?;
    stream.flush()?;
    Ok(Client::new(stream, peer))
}
