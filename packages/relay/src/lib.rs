#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Routes packets between emulated nodes over TCP.
//!
//! Each emulator connects, announces the port it identifies itself by and is
//! assigned the lowest free address. Packets for an address that is down are
//! queued and handed to the next connection that claims it, so a node that
//! crashes and reconnects loses nothing sent to it in the meantime.
//!
//! Either side may close a connection. The closing side sends a FIN and keeps
//! reading until the other side answers with its own. The emulator always
//! ends with a second FIN, sent after returning everything it could not
//! deliver; those packets are queued ahead of anything sent to the address
//! since the close began.

use std::{
    net::SocketAddr,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use conn::ConnHandle;
use relaynet_packet::{Address, Packet, PacketError};
use table::Table;
use thiserror::Error;
use tokio::{
    io::AsyncReadExt as _,
    net::{TcpListener, TcpStream, ToSocketAddrs, tcp::OwnedReadHalf},
};

mod conn;
mod table;

/// Announced ports below this are refused.
pub const MIN_PORT: u16 = 1024;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// A shared view of the relay's address table.
#[derive(Debug, Clone, Default)]
pub struct RelayState {
    table: Arc<Mutex<Table>>,
}

impl RelayState {
    fn lock(&self) -> MutexGuard<'_, Table> {
        self.table.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Addresses currently held by a connection.
    #[must_use]
    pub fn live_addresses(&self) -> Vec<Address> {
        self.lock().live()
    }

    /// Packets waiting for `addr` to be claimed.
    #[must_use]
    pub fn queued(&self, addr: Address) -> Vec<Packet> {
        self.lock().queued(addr)
    }
}

pub struct Relay {
    listener: TcpListener,
    state: RelayState,
}

impl Relay {
    /// # Errors
    ///
    /// * If the listener fails to bind
    pub async fn bind(addr: impl ToSocketAddrs) -> Result<Self, RelayError> {
        Ok(Self {
            listener: TcpListener::bind(addr).await?,
            state: RelayState::default(),
        })
    }

    /// # Errors
    ///
    /// * If the listener's address cannot be read
    pub fn local_addr(&self) -> Result<SocketAddr, RelayError> {
        Ok(self.listener.local_addr()?)
    }

    #[must_use]
    pub fn state(&self) -> RelayState {
        self.state.clone()
    }

    /// Accepts connections forever, serving each on its own task.
    ///
    /// # Errors
    ///
    /// * If accepting a connection fails
    pub async fn run(self) -> Result<(), RelayError> {
        log::info!("Relay listening on {}", self.listener.local_addr()?);

        loop {
            let (stream, peer) = self.listener.accept().await?;
            log::debug!("run: accepted connection from {peer}");

            let state = self.state.clone();
            tokio::spawn(async move {
                if let Err(e) = serve(stream, peer, state).await {
                    log::warn!("Connection from {peer} failed: {e}");
                }
            });
        }
    }
}

async fn serve(mut stream: TcpStream, peer: SocketAddr, state: RelayState) -> Result<(), RelayError> {
    stream.set_nodelay(true)?;
    let port = stream.read_u16().await?;
    let announced = SocketAddr::new(peer.ip(), port);

    let (reader, writer) = stream.into_split();
    let id = state.lock().next_id();
    let (conn, writer_task) = ConnHandle::spawn(id, announced, writer);

    let accepted = if port < MIN_PORT {
        log::warn!("Refusing {peer}: illegal port {port}");
        None
    } else {
        let addr = state.lock().accept(conn.clone());
        if addr.is_none() {
            log::warn!("Refusing {peer}: no free address");
        }
        addr
    };

    let result = if let Some(addr) = accepted {
        log::info!("Node {addr} connected from {announced}");
        let result = forward(reader, addr, &conn, &state).await;
        state.lock().closed(addr, conn.id());
        log::info!("Node {addr} disconnected");
        conn.close();
        result
    } else {
        conn.reject();
        Ok(())
    };

    if let Err(e) = writer_task.await {
        log::debug!("serve: writer task failed: {e:?}");
    }
    result
}

/// Routes everything the node sends until its side of the close handshake
/// is done.
///
/// The node closes with two FINs. Whatever it sends between them is what it
/// received but never delivered, and goes back into the address's queue.
/// Our own FIN goes out at the node's first one, unless we already sent it
/// (preemption), in which case the two FINs may cross.
async fn forward(
    mut reader: OwnedReadHalf,
    addr: Address,
    conn: &ConnHandle,
    state: &RelayState,
) -> Result<(), RelayError> {
    let mut closing = false;

    while let Some(packet) = Packet::read_from_async(&mut reader).await? {
        if packet.is_fin() {
            if closing {
                log::debug!("forward: close handshake done for node {addr}");
                break;
            }
            closing = true;

            // Marked down before the echo, so traffic arriving meanwhile is
            // queued behind whatever the node hands back.
            log::debug!(
                "forward: node {addr} is closing finished={}",
                conn.is_finished()
            );
            state.lock().release(addr, conn.id());
            conn.finish(addr);
            continue;
        }

        let mut table = state.lock();
        if closing && packet.dest() == addr {
            table.bounce(addr, conn.id(), packet);
        } else {
            table.route(addr, packet);
        }
    }

    Ok(())
}
