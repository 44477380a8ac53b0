//! The relay's address table.

use std::{
    collections::{BTreeMap, VecDeque},
    mem,
};

use relaynet_packet::{Address, BROADCAST, Packet};

use crate::conn::ConnHandle;

/// Everything the relay knows about one address. Packets for an address that
/// is down wait in `down_queue` for the next connection to claim it.
#[derive(Debug, Default)]
pub(crate) struct NodeContainer {
    up: bool,
    conn: Option<ConnHandle>,
    down_queue: VecDeque<Packet>,
    closing: Option<Closing>,
}

/// A connection that lost the address and is still handing packets back.
/// Those were sent before anything queued after it went down, so they go in
/// at `at`, ahead of that traffic.
#[derive(Debug, Clone, Copy)]
struct Closing {
    id: u64,
    at: usize,
}

impl NodeContainer {
    fn send(&mut self, packet: Packet) {
        if self.up
            && let Some(conn) = &self.conn
            && conn.send(&packet)
        {
            return;
        }
        self.down_queue.push_back(packet);
    }

    fn bounce(&mut self, id: u64, packet: Packet) {
        if !self.up
            && let Some(closing) = self.closing.as_mut()
            && closing.id == id
        {
            self.down_queue.insert(closing.at, packet);
            closing.at += 1;
            return;
        }
        self.send(packet);
    }

    fn quit(&mut self, addr: Address) {
        self.up = false;
        if let Some(conn) = self.conn.take() {
            self.closing = Some(Closing {
                id: conn.id(),
                at: self.down_queue.len(),
            });
            conn.finish(addr);
        }
    }

    /// Hands the address to `conn`, flushing the down-queue to it first.
    /// Packets a preempted connection still returns go straight to `conn`.
    fn restart(&mut self, addr: Address, conn: ConnHandle) {
        self.quit(addr);
        self.closing = None;
        self.up = true;
        self.conn = Some(conn);
        for packet in mem::take(&mut self.down_queue) {
            self.send(packet);
        }
    }

    fn is_current(&self, id: u64) -> bool {
        self.conn.as_ref().is_some_and(|conn| conn.id() == id)
    }

    /// Free for a new connection: down, with no connection still closing.
    fn is_free(&self) -> bool {
        !self.up && self.closing.is_none()
    }
}

#[derive(Debug, Default)]
pub(crate) struct Table {
    nodes: BTreeMap<Address, NodeContainer>,
    next_id: u64,
}

impl Table {
    pub(crate) const fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    /// The lowest address nobody holds.
    pub(crate) fn free_addr(&self) -> Option<Address> {
        (0..BROADCAST).find(|addr| self.nodes.get(addr).is_none_or(NodeContainer::is_free))
    }

    /// Registers `conn`. A live connection announced from the same IP and
    /// port is evicted and `conn` takes over its address; otherwise `conn`
    /// gets the lowest free address.
    ///
    /// Returns `None` when every address is taken.
    pub(crate) fn accept(&mut self, conn: ConnHandle) -> Option<Address> {
        let stale = self
            .nodes
            .iter()
            .find(|(_, node)| {
                node.up
                    && node
                        .conn
                        .as_ref()
                        .is_some_and(|old| old.peer() == conn.peer())
            })
            .map(|(addr, _)| *addr);
        if let Some(addr) = stale {
            log::info!("Node {addr} preempted by a new connection from {}", conn.peer());
        }

        let addr = match stale {
            Some(addr) => addr,
            None => self.free_addr()?,
        };
        conn.assign(addr);
        self.nodes.entry(addr).or_default().restart(addr, conn);
        Some(addr)
    }

    /// Routes a packet read from the connection holding `from`.
    ///
    /// A broadcast goes to every other known address, readdressed to each
    /// recipient.
    pub(crate) fn route(&mut self, from: Address, packet: Packet) {
        if packet.is_broadcast() {
            for (addr, node) in self.nodes.iter_mut().filter(|(addr, _)| **addr != from) {
                node.send(packet.readdressed(*addr));
            }
            return;
        }

        let dest = packet.dest();
        let node = self.nodes.entry(dest).or_default();
        if !node.up {
            log::debug!("route: queueing packet for down node {dest}");
        }
        node.send(packet);
    }

    /// Takes back a packet connection `id` received for `addr` but never
    /// delivered. While the address is down it is queued ahead of anything
    /// that arrived after the connection started closing.
    pub(crate) fn bounce(&mut self, addr: Address, id: u64, packet: Packet) {
        self.nodes.entry(addr).or_default().bounce(id, packet);
    }

    /// Marks `addr` down if connection `id` still holds it, and sends that
    /// connection a FIN. The address stays reserved until [`Self::closed`].
    pub(crate) fn release(&mut self, addr: Address, id: u64) {
        if let Some(node) = self.nodes.get_mut(&addr)
            && node.is_current(id)
        {
            node.quit(addr);
        }
    }

    /// Connection `id` is gone: it no longer holds or reserves `addr`.
    pub(crate) fn closed(&mut self, addr: Address, id: u64) {
        self.release(addr, id);
        if let Some(node) = self.nodes.get_mut(&addr)
            && node.closing.is_some_and(|closing| closing.id == id)
        {
            node.closing = None;
        }
    }

    pub(crate) fn live(&self) -> Vec<Address> {
        self.nodes
            .iter()
            .filter(|(_, node)| node.up)
            .map(|(addr, _)| *addr)
            .collect()
    }

    pub(crate) fn queued(&self, addr: Address) -> Vec<Packet> {
        self.nodes
            .get(&addr)
            .map(|node| node.down_queue.iter().cloned().collect())
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use std::net::{Ipv4Addr, SocketAddr};

    use bytes::Bytes;
    use pretty_assertions::assert_eq;
    use tokio::sync::mpsc;

    use crate::conn::Outbound;

    use super::*;

    fn conn(
        table: &mut Table,
        port: u16,
    ) -> (ConnHandle, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let peer = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
        (ConnHandle::new(table.next_id(), peer, tx), rx)
    }

    fn frames(rx: &mut mpsc::UnboundedReceiver<Outbound>) -> Vec<Bytes> {
        let mut frames = vec![];
        while let Ok(outbound) = rx.try_recv() {
            if let Outbound::Frame(frame) = outbound {
                frames.push(frame);
            }
        }
        frames
    }

    fn packet(dest: Address, src: Address, text: &'static str) -> Packet {
        Packet::new(dest, src, 0, text).unwrap()
    }

    #[test_log::test]
    fn free_addr_is_the_lowest_address_not_up() {
        let mut table = Table::default();
        assert_eq!(table.free_addr(), Some(0));

        let mut ids = vec![];
        for port in 5000..5003 {
            let (conn, _rx) = conn(&mut table, port);
            ids.push(conn.id());
            table.accept(conn);
        }
        assert_eq!(table.free_addr(), Some(3));

        table.closed(1, ids[1]);
        assert_eq!(table.free_addr(), Some(1));
        assert_eq!(table.live(), vec![0, 2]);
    }

    #[test_log::test]
    fn closing_address_stays_reserved_until_closed() {
        let mut table = Table::default();
        let (first, _first_rx) = conn(&mut table, 5000);
        let id = first.id();
        table.accept(first);

        table.release(0, id);
        assert!(table.live().is_empty());
        assert_eq!(table.free_addr(), Some(1));

        table.closed(0, id);
        assert_eq!(table.free_addr(), Some(0));
    }

    #[test_log::test]
    fn returned_packets_go_ahead_of_later_traffic() {
        let mut table = Table::default();
        let (a, _a_rx) = conn(&mut table, 5000);
        let id = a.id();
        table.accept(a);
        let (b, _b_rx) = conn(&mut table, 5001);
        table.accept(b);

        table.release(0, id);
        table.route(1, packet(0, 1, "late"));
        table.bounce(0, id, packet(0, 1, "first"));
        table.route(1, packet(0, 1, "later"));
        table.bounce(0, id, packet(0, 1, "second"));
        table.closed(0, id);

        assert_eq!(
            table.queued(0),
            vec![
                packet(0, 1, "first"),
                packet(0, 1, "second"),
                packet(0, 1, "late"),
                packet(0, 1, "later"),
            ]
        );
    }

    #[test_log::test]
    fn preempted_connection_returns_packets_to_its_successor() {
        let mut table = Table::default();
        let (old, _old_rx) = conn(&mut table, 5000);
        let old_id = old.id();
        table.accept(old);
        let (new, mut new_rx) = conn(&mut table, 5000);
        assert_eq!(table.accept(new), Some(0));

        table.bounce(0, old_id, packet(0, 1, "undelivered"));

        assert_eq!(
            frames(&mut new_rx),
            vec![Bytes::from_static(&[0]), packet(0, 1, "undelivered").pack()]
        );
        assert!(table.queued(0).is_empty());
    }

    #[test_log::test]
    fn no_free_addr_once_every_address_is_up() {
        let mut table = Table::default();
        let mut receivers = vec![];
        for port in 0..u16::from(BROADCAST) {
            let (conn, rx) = conn(&mut table, 5000 + port);
            receivers.push(rx);
            assert_eq!(table.accept(conn), Some(Address::try_from(port).unwrap()));
        }

        assert_eq!(table.free_addr(), None);
        let (extra, _rx) = conn(&mut table, 9000);
        assert_eq!(table.accept(extra), None);
    }

    #[test_log::test]
    fn handshake_reply_precedes_queued_packets() {
        let mut table = Table::default();
        table.route(0, packet(1, 0, "first"));
        table.route(0, packet(1, 0, "second"));
        assert_eq!(table.queued(1).len(), 2);

        let (first, _first_rx) = conn(&mut table, 5000);
        assert_eq!(table.accept(first), Some(0));
        let (second, mut rx) = conn(&mut table, 5001);
        assert_eq!(table.accept(second), Some(1));

        assert_eq!(
            frames(&mut rx),
            vec![
                Bytes::from_static(&[1]),
                packet(1, 0, "first").pack(),
                packet(1, 0, "second").pack(),
            ]
        );
        assert!(table.queued(1).is_empty());
    }

    #[test_log::test]
    fn same_peer_and_port_preempts_the_live_connection() {
        let mut table = Table::default();
        let (old, mut old_rx) = conn(&mut table, 5000);
        assert_eq!(table.accept(old.clone()), Some(0));

        let (new, mut new_rx) = conn(&mut table, 5000);
        assert_eq!(table.accept(new), Some(0));

        assert!(old.is_finished());
        assert_eq!(
            frames(&mut old_rx),
            vec![Bytes::from_static(&[0]), Packet::fin(0).pack()]
        );
        assert_eq!(frames(&mut new_rx), vec![Bytes::from_static(&[0])]);
        assert_eq!(table.live(), vec![0]);
    }

    #[test_log::test]
    fn broadcast_skips_the_sender_and_queues_for_down_nodes() {
        let mut table = Table::default();
        let mut receivers = vec![];
        let mut ids = vec![];
        for port in 5000..5003 {
            let (conn, rx) = conn(&mut table, port);
            ids.push(conn.id());
            table.accept(conn);
            receivers.push(rx);
        }
        table.closed(2, ids[2]);
        for rx in &mut receivers {
            frames(rx);
        }

        table.route(0, packet(BROADCAST, 0, "all"));

        assert!(frames(&mut receivers[0]).is_empty());
        assert_eq!(frames(&mut receivers[1]), vec![packet(1, 0, "all").pack()]);
        assert!(frames(&mut receivers[2]).is_empty());
        assert_eq!(table.queued(2), vec![packet(2, 0, "all")]);
    }

    #[test_log::test]
    fn release_ignores_connections_that_lost_the_address() {
        let mut table = Table::default();
        let (old, _old_rx) = conn(&mut table, 5000);
        table.accept(old.clone());
        let (new, _new_rx) = conn(&mut table, 5000);
        table.accept(new);

        table.release(0, old.id());

        assert_eq!(table.live(), vec![0]);
    }
}
