use std::{
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use bytes::Bytes;
use relaynet_packet::{Address, BROADCAST, Packet};
use tokio::{
    io::AsyncWriteExt as _,
    net::tcp::OwnedWriteHalf,
    sync::mpsc,
    task::JoinHandle,
};

#[derive(Debug)]
pub(crate) enum Outbound {
    Frame(Bytes),
    Close,
}

/// The relay's side of one emulator connection. Every clone feeds the same
/// writer task, so frames are written in the order they were queued.
#[derive(Debug, Clone)]
pub(crate) struct ConnHandle {
    id: u64,
    peer: SocketAddr,
    outbox: mpsc::UnboundedSender<Outbound>,
    finished: Arc<AtomicBool>,
}

impl ConnHandle {
    pub(crate) fn new(id: u64, peer: SocketAddr, outbox: mpsc::UnboundedSender<Outbound>) -> Self {
        Self {
            id,
            peer,
            outbox,
            finished: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Creates a handle and the task writing its frames to `writer`.
    pub(crate) fn spawn(id: u64, peer: SocketAddr, writer: OwnedWriteHalf) -> (Self, JoinHandle<()>) {
        let (outbox, rx) = mpsc::unbounded_channel();
        (Self::new(id, peer, outbox), tokio::spawn(write_frames(writer, rx)))
    }

    pub(crate) const fn id(&self) -> u64 {
        self.id
    }

    /// The peer's IP with the port it announced during the handshake.
    pub(crate) const fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.finished.load(Ordering::SeqCst)
    }

    /// Queues `packet` for the node. Returns `false` once the connection is
    /// finished.
    pub(crate) fn send(&self, packet: &Packet) -> bool {
        !self.is_finished() && self.outbox.send(Outbound::Frame(packet.pack())).is_ok()
    }

    /// Answers the handshake with the assigned address.
    pub(crate) fn assign(&self, addr: Address) {
        let _ = self
            .outbox
            .send(Outbound::Frame(Bytes::copy_from_slice(&[addr])));
    }

    /// Answers the handshake with a refusal and closes.
    pub(crate) fn reject(&self) {
        self.assign(BROADCAST);
        self.close();
    }

    /// Sends this side's FIN for `addr`. Later application sends fail. Only
    /// the first call has an effect.
    pub(crate) fn finish(&self, addr: Address) {
        if self.finished.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self
            .outbox
            .send(Outbound::Frame(Packet::fin(addr).pack()));
    }

    /// Stops the writer once everything queued so far is written.
    pub(crate) fn close(&self) {
        self.finished.store(true, Ordering::SeqCst);
        let _ = self.outbox.send(Outbound::Close);
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Outbound>) {
    while let Some(Outbound::Frame(frame)) = outbox.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            log::debug!("write_frames: failed to write frame: {e:?}");
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("write_frames: failed to shut down: {e:?}");
    }
}
