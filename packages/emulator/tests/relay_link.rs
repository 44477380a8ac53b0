use std::{
    cell::RefCell,
    io::{Read as _, Write as _, empty},
    net::{TcpListener, TcpStream},
    path::Path,
    rc::Rc,
    thread::{self, JoinHandle},
    time::Duration,
};

use pretty_assertions::assert_eq;
use relaynet_emulator::{Emulator, EmulatorConfig, EmulatorError};
use relaynet_manager::{
    Address, BROADCAST, Context, FailureLvl, FailureRates, ManagerConfig, Node, NodeResult, Packet,
};
use serial_test::serial;

const ASSIGNED: Address = 3;
const PEER: Address = 7;

type Seen = Rc<RefCell<Vec<String>>>;

struct Probe {
    addr: Address,
    seen: Seen,
}

impl Node for Probe {
    type Timer = String;

    fn start(&mut self, _ctx: &mut dyn Context<String>) -> NodeResult {
        Ok(())
    }

    fn on_receive(
        &mut self,
        ctx: &mut dyn Context<String>,
        from: Address,
        _protocol: u8,
        payload: &[u8],
    ) -> NodeResult {
        let text = String::from_utf8_lossy(payload);
        self.seen
            .borrow_mut()
            .push(format!("{} {}<-{from}:{text}", ctx.now(), self.addr));
        Ok(())
    }

    fn on_command(&mut self, ctx: &mut dyn Context<String>, command: &str) -> NodeResult {
        let words = command.split_whitespace().collect::<Vec<_>>();
        match words.as_slice() {
            ["send", to, text] => ctx.send(to.parse().unwrap(), 0, text.as_bytes()).unwrap(),
            ["bcast", text] => ctx.broadcast(0, text.as_bytes()).unwrap(),
            _ => panic!("unknown command: {command}"),
        }
        Ok(())
    }

    fn on_timeout(&mut self, _ctx: &mut dyn Context<String>, _timer: String) -> NodeResult {
        Ok(())
    }

    fn failure_rates() -> FailureRates {
        FailureRates::reliable()
    }
}

fn probes(seen: &Seen) -> impl FnMut(Address) -> Probe + use<> {
    let seen = seen.clone();
    move |addr| Probe {
        addr,
        seen: seen.clone(),
    }
}

fn config(storage: &Path) -> ManagerConfig {
    let mut config = ManagerConfig::new();
    config
        .failure_lvl(FailureLvl::Nothing)
        .seed(1)
        .storage_root(storage);
    config
}

fn link(relay_port: u16) -> EmulatorConfig {
    let mut link = EmulatorConfig::new();
    link.relay_port(relay_port)
        .local_port(5000)
        .round_interval(Duration::from_millis(20));
    link
}

/// A single-connection stand-in for the relay: performs the handshake,
/// assigning `assign`, then hands the socket to `script`.
fn fake_relay<R: Send + 'static>(
    assign: Address,
    script: impl FnOnce(TcpStream) -> R + Send + 'static,
) -> (u16, JoinHandle<R>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();

    let handle = thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        let mut announced = [0_u8; 2];
        stream.read_exact(&mut announced).unwrap();
        assert_eq!(u16::from_be_bytes(announced), 5000);
        stream.write_all(&[assign]).unwrap();
        script(stream)
    });

    (port, handle)
}

/// Answers every packet as if `PEER` echoed it, and plays the responder's
/// side of the close handshake.
fn echo_until_closed(mut stream: TcpStream) -> Vec<Packet> {
    let mut received = vec![];
    let mut fins = 0;

    while let Some(packet) = Packet::read_from(&mut stream).unwrap() {
        if packet.is_fin() {
            fins += 1;
            received.push(packet);
            if fins == 2 {
                break;
            }
            stream.write_all(&Packet::fin(ASSIGNED).pack()).unwrap();
            continue;
        }

        // Packets bounced during the close are only collected.
        if fins == 0 {
            let reply =
                Packet::new(ASSIGNED, PEER, packet.protocol(), packet.payload().clone()).unwrap();
            stream.write_all(&reply.pack()).unwrap();
        }
        received.push(packet);
    }

    received
}

fn echo_script() -> String {
    format!("send {PEER} hi\n{}", "time\n".repeat(10))
}

#[test_log::test]
#[serial]
fn rejected_handshake_is_an_error() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let (port, relay) = fake_relay(BROADCAST, |_stream| ());

    let mut emulator = Emulator::with_input(&config(dir.path()), link(port), empty(), probes(&seen))
        .unwrap()
        .with_script("echo never\n")
        .unwrap();
    let result = emulator.run();

    assert!(matches!(result, Err(EmulatorError::Rejected { port: 5000 })));
    assert_eq!(emulator.addr(), None);
    relay.join().unwrap();
}

#[test_log::test]
#[serial]
fn packets_round_trip_through_the_relay_and_close_cleanly() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let (port, relay) = fake_relay(ASSIGNED, echo_until_closed);

    let mut emulator = Emulator::with_input(&config(dir.path()), link(port), empty(), probes(&seen))
        .unwrap()
        .with_script(&echo_script())
        .unwrap();
    emulator.run().unwrap();

    assert_eq!(emulator.addr(), Some(ASSIGNED));
    assert_eq!(emulator.packets_sent(), 1);
    let seen = seen.borrow();
    assert_eq!(seen.len(), 1);
    assert!(seen[0].ends_with("3<-7:hi"), "{seen:?}");

    assert_eq!(
        relay.join().unwrap(),
        vec![
            Packet::new(PEER, ASSIGNED, 0, "hi").unwrap(),
            Packet::fin(ASSIGNED),
            Packet::fin(ASSIGNED),
        ]
    );
}

#[test_log::test]
#[serial]
fn broadcast_leaves_as_one_packet() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let (port, relay) = fake_relay(ASSIGNED, echo_until_closed);

    let mut emulator = Emulator::with_input(&config(dir.path()), link(port), empty(), probes(&seen))
        .unwrap()
        .with_script("bcast all\n")
        .unwrap();
    emulator.run().unwrap();

    assert_eq!(emulator.packets_sent(), 1);
    assert_eq!(
        relay.join().unwrap()[0],
        Packet::new(BROADCAST, ASSIGNED, 0, "all").unwrap()
    );
}

#[test_log::test]
#[serial]
fn fin_from_the_relay_crashes_the_node() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let (port, relay) = fake_relay(ASSIGNED, |mut stream| {
        stream.write_all(&Packet::fin(ASSIGNED).pack()).unwrap();
        read_until_closed(&mut stream)
    });

    let mut emulator = Emulator::with_input(&config(dir.path()), link(port), empty(), probes(&seen))
        .unwrap()
        .with_script(&"time\n".repeat(5))
        .unwrap();
    emulator.run().unwrap();

    assert!(!emulator.is_live());
    assert_eq!(
        relay.join().unwrap(),
        vec![Packet::fin(ASSIGNED), Packet::fin(ASSIGNED)]
    );
}

/// Delays every packet it is sent, forever.
struct Hoarder {
    seen: Seen,
}

impl Node for Hoarder {
    type Timer = String;

    fn start(&mut self, _ctx: &mut dyn Context<String>) -> NodeResult {
        Ok(())
    }

    fn on_receive(
        &mut self,
        _ctx: &mut dyn Context<String>,
        from: Address,
        _protocol: u8,
        payload: &[u8],
    ) -> NodeResult {
        self.seen
            .borrow_mut()
            .push(format!("{from}:{}", String::from_utf8_lossy(payload)));
        Ok(())
    }

    fn on_command(&mut self, ctx: &mut dyn Context<String>, command: &str) -> NodeResult {
        ctx.send(PEER, 0, command.as_bytes()).unwrap();
        Ok(())
    }

    fn on_timeout(&mut self, _ctx: &mut dyn Context<String>, _timer: String) -> NodeResult {
        Ok(())
    }

    fn failure_rates() -> FailureRates {
        FailureRates {
            delay: 1.0,
            ..FailureRates::reliable()
        }
    }
}

/// Reads until the emulator's closing FIN, the second one.
fn read_until_closed(stream: &mut TcpStream) -> Vec<Packet> {
    let mut received = vec![];
    let mut fins = 0;
    while let Some(packet) = Packet::read_from(stream).unwrap() {
        fins += usize::from(packet.is_fin());
        received.push(packet);
        if fins == 2 {
            break;
        }
    }
    received
}

#[test_log::test]
#[serial]
fn failing_node_hands_delayed_packets_back_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let seen = Seen::default();
    let (port, relay) = fake_relay(ASSIGNED, |mut stream| {
        let go = Packet::read_from(&mut stream).unwrap().unwrap();
        for text in ["p1", "p2"] {
            let packet = Packet::new(ASSIGNED, PEER, 0, text).unwrap();
            stream.write_all(&packet.pack()).unwrap();
        }

        let fin = Packet::read_from(&mut stream).unwrap().unwrap();
        assert!(fin.is_fin());
        stream.write_all(&Packet::fin(ASSIGNED).pack()).unwrap();

        let mut received = vec![go, fin];
        received.extend(read_until_closed(&mut stream));
        received
    });

    let script = format!("go
{}fail
time
time
", "time
".repeat(4));
    let mut emulator = Emulator::with_input(&config(dir.path()), link(port), empty(), {
        let seen = seen.clone();
        move |_addr| Hoarder { seen: seen.clone() }
    })
    .unwrap()
    .with_script(&script)
    .unwrap();
    emulator.run().unwrap();

    assert!(!emulator.is_live());
    assert!(seen.borrow().is_empty());
    assert_eq!(
        relay.join().unwrap(),
        vec![
            Packet::new(PEER, ASSIGNED, 0, "go").unwrap(),
            Packet::fin(ASSIGNED),
            Packet::new(ASSIGNED, PEER, 0, "p1").unwrap(),
            Packet::new(ASSIGNED, PEER, 0, "p2").unwrap(),
            Packet::fin(ASSIGNED),
        ]
    );
}

#[test_log::test]
#[serial]
fn recorded_run_replays_without_a_relay() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("emulator.replay");
    let recorded = Seen::default();
    let (port, relay) = fake_relay(ASSIGNED, echo_until_closed);

    let mut record = config(dir.path());
    record.replay_output(&log);
    let mut emulator = Emulator::with_input(&record, link(port), empty(), probes(&recorded))
        .unwrap()
        .with_script(&echo_script())
        .unwrap();
    emulator.run().unwrap();
    relay.join().unwrap();
    let recorded_rounds = emulator.now();
    drop(emulator);

    let replayed = Seen::default();
    let mut replay = config(dir.path());
    replay.replay_input(&log);
    // Nothing listens here; a replay never connects.
    let mut emulator = Emulator::with_input(&replay, link(1), empty(), probes(&replayed))
        .unwrap()
        .with_script(&echo_script())
        .unwrap();
    emulator.run().unwrap();

    assert_eq!(emulator.addr(), Some(ASSIGNED));
    assert_eq!(emulator.now(), recorded_rounds);
    assert_eq!(*replayed.borrow(), *recorded.borrow());
}
