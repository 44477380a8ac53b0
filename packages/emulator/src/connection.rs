//! The emulator's link to the relay.
//!
//! A receiver task deframes packets into a [`flume`] inbox that the round
//! loop drains synchronously. A single writer task owns the write half, so
//! frames queued from the round loop never interleave.

use std::sync::atomic::{AtomicBool, Ordering};

use bytes::Bytes;
use relaynet_manager::{Address, BROADCAST, Packet};
use tokio::{
    io::{AsyncReadExt as _, AsyncWriteExt as _},
    net::{
        TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::Runtime,
    sync::mpsc,
    task::JoinHandle,
};

use crate::{EmulatorConfig, EmulatorError};

/// One item taken off the socket.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Inbound {
    Packet(Packet),
    /// The relay closed its side with a FIN.
    Fin,
    /// The socket ended or failed without a FIN.
    Closed,
}

/// What we know about the relay's side of the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Peer {
    Open,
    SentFin,
    Gone,
}

pub(crate) struct Connection {
    addr: Address,
    outbox: mpsc::UnboundedSender<Bytes>,
    inbox: flume::Receiver<Inbound>,
    finished: AtomicBool,
    peer: Peer,
    writer: JoinHandle<()>,
    reader: JoinHandle<()>,
}

impl Connection {
    /// Connects to the relay and performs the address handshake.
    ///
    /// # Errors
    ///
    /// * If the relay cannot be reached
    /// * If the relay refuses to assign an address
    pub(crate) async fn connect(config: &EmulatorConfig) -> Result<Self, EmulatorError> {
        let mut stream = TcpStream::connect((config.relay_host.as_str(), config.relay_port)).await?;
        stream.set_nodelay(true)?;

        let port = match config.local_port {
            Some(port) => port,
            None => stream.local_addr()?.port(),
        };
        log::debug!(
            "connect: connected to relay {}:{} announcing port={port}",
            config.relay_host,
            config.relay_port
        );

        stream.write_u16(port).await?;
        let addr = stream.read_u8().await?;
        if addr == BROADCAST {
            return Err(EmulatorError::Rejected { port });
        }
        log::info!("Relay assigned address {addr}");

        let (reader, writer) = stream.into_split();
        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let (inbox_tx, inbox) = flume::unbounded();

        Ok(Self {
            addr,
            outbox,
            inbox,
            finished: AtomicBool::new(false),
            peer: Peer::Open,
            writer: tokio::spawn(write_frames(writer, outbox_rx)),
            reader: tokio::spawn(read_frames(reader, inbox_tx)),
        })
    }

    pub(crate) const fn addr(&self) -> Address {
        self.addr
    }

    pub(crate) const fn peer(&self) -> Peer {
        self.peer
    }

    /// Queues `packet` for the relay. Returns `false` once the connection
    /// is finished.
    pub(crate) fn send(&self, packet: &Packet) -> bool {
        if self.finished.load(Ordering::SeqCst) {
            return false;
        }
        self.outbox.send(packet.pack()).is_ok()
    }

    /// Takes everything received so far, stopping at a FIN or the end of the
    /// stream.
    pub(crate) fn drain(&mut self) -> Vec<Inbound> {
        let mut drained = vec![];
        if self.peer != Peer::Open {
            return drained;
        }

        for inbound in self.inbox.try_iter() {
            match inbound {
                Inbound::Fin => self.peer = Peer::SentFin,
                Inbound::Closed => self.peer = Peer::Gone,
                Inbound::Packet(_) => {}
            }
            let done = self.peer != Peer::Open;
            drained.push(inbound);
            if done {
                break;
            }
        }

        drained
    }

    /// Closes the connection without losing packets.
    ///
    /// Our side always sends two FINs. The first opens the close; unless the
    /// relay already sent its FIN we then wait for it. Everything in
    /// `bounce`, followed by whatever arrived meanwhile, is then handed back
    /// to the relay, which queues it for this address, and the second FIN
    /// ends the exchange. The relay treats everything between our two FINs
    /// as returned packets, so crossing FINs lose nothing.
    pub(crate) fn close(mut self, runtime: &Runtime, bounce: Vec<Packet>) {
        self.finished.store(true, Ordering::SeqCst);
        let fin = Packet::fin(self.addr).pack();
        let mut returned = vec![];

        if self.peer != Peer::Gone {
            log::debug!("close: sending FIN addr={} peer={:?}", self.addr, self.peer);
            let _ = self.outbox.send(fin.clone());
        }
        while self.peer == Peer::Open {
            match self.inbox.recv() {
                Ok(Inbound::Packet(packet)) => returned.push(packet),
                Ok(Inbound::Fin) => self.peer = Peer::SentFin,
                Ok(Inbound::Closed) | Err(_) => self.peer = Peer::Gone,
            }
        }

        if self.peer == Peer::Gone {
            log::warn!(
                "close: relay went away, dropping {} undelivered packets",
                returned.len() + bounce.len()
            );
        } else {
            log::debug!(
                "close: returning {} packets to the relay addr={}",
                returned.len() + bounce.len(),
                self.addr
            );
            // `bounce` was received in earlier drains than `returned`.
            for packet in bounce.into_iter().chain(returned) {
                let _ = self.outbox.send(packet.pack());
            }
            let _ = self.outbox.send(fin);
        }

        let Self {
            outbox,
            writer,
            reader,
            ..
        } = self;
        drop(outbox);
        runtime.block_on(async move {
            if let Err(e) = writer.await {
                log::debug!("close: writer task failed: {e:?}");
            }
            reader.abort();
        });
    }
}

async fn write_frames(mut writer: OwnedWriteHalf, mut outbox: mpsc::UnboundedReceiver<Bytes>) {
    while let Some(frame) = outbox.recv().await {
        if let Err(e) = writer.write_all(&frame).await {
            log::debug!("write_frames: failed to write frame: {e:?}");
            return;
        }
    }
    if let Err(e) = writer.shutdown().await {
        log::debug!("write_frames: failed to shut down: {e:?}");
    }
}

async fn read_frames(mut reader: OwnedReadHalf, inbox: flume::Sender<Inbound>) {
    loop {
        let inbound = match Packet::read_from_async(&mut reader).await {
            Ok(Some(packet)) if packet.is_fin() => Inbound::Fin,
            Ok(Some(packet)) => Inbound::Packet(packet),
            Ok(None) => Inbound::Closed,
            Err(e) => {
                log::warn!("read_frames: dropping connection: {e}");
                Inbound::Closed
            }
        };

        let done = !matches!(inbound, Inbound::Packet(_));
        if inbox.send(inbound).is_err() || done {
            return;
        }
    }
}
