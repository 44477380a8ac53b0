#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Runs one node per process, connected to its peers through a relay.
//!
//! The round loop is the simulator's with a single local node. Packets from
//! the relay are buffered by a background task and delivered at the start of
//! the next round, subject to the same drop, delay and crash decisions.
//! Inbound packets and the assigned address are the only inputs besides the
//! operator's, so recording them makes an emulated run replayable without a
//! relay.

use std::{
    collections::VecDeque,
    fs,
    io::{self, BufRead, BufReader},
    ops::ControlFlow,
    path::PathBuf,
    time::Duration,
};

use connection::{Connection, Inbound};
use context::EmuContext;
use relaynet_manager::{
    Address, Context, Event, ManagerConfig, ManagerCore, Node, NodeResult, Packet, ReplayError,
    commands::{self, CommandError, CommandMode},
};
use thiserror::Error;
use tokio::runtime::Runtime;

mod connection;
mod context;

pub const DEFAULT_RELAY_PORT: u16 = 8888;

#[derive(Debug, Error)]
pub enum EmulatorError {
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error("Relay refused to assign an address to port {port}")]
    Rejected { port: u16 },
}

/// Where the relay lives and how this process introduces itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmulatorConfig {
    pub relay_host: String,
    pub relay_port: u16,
    /// Announced during the handshake. Defaults to the socket's own port.
    pub local_port: Option<u16>,
    /// Pause after each scripted round.
    pub round_interval: Duration,
}

impl Default for EmulatorConfig {
    fn default() -> Self {
        Self::new()
    }
}

impl EmulatorConfig {
    #[must_use]
    pub fn new() -> Self {
        Self {
            relay_host: "127.0.0.1".to_string(),
            relay_port: DEFAULT_RELAY_PORT,
            local_port: None,
            round_interval: Duration::from_millis(100),
        }
    }

    pub fn relay_host(&mut self, host: impl Into<String>) -> &mut Self {
        self.relay_host = host.into();
        self
    }

    pub const fn relay_port(&mut self, port: u16) -> &mut Self {
        self.relay_port = port;
        self
    }

    pub const fn local_port(&mut self, port: u16) -> &mut Self {
        self.local_port = Some(port);
        self
    }

    pub const fn round_interval(&mut self, interval: Duration) -> &mut Self {
        self.round_interval = interval;
        self
    }
}

enum Commands<T> {
    Script(VecDeque<Event<T>>),
    Keyboard,
}

/// Emulates a single instance of `N`.
pub struct Emulator<N: Node, F> {
    core: ManagerCore<N::Timer>,
    factory: F,
    link: EmulatorConfig,
    runtime: Runtime,
    addr: Option<Address>,
    node: Option<N>,
    conn: Option<Connection>,
    /// Inbound packets held back by a delay decision.
    in_transit: Vec<Packet>,
    /// Inbound packets that found the node crashed, returned to the relay
    /// when the connection closes.
    undelivered: Vec<Packet>,
    commands: Commands<N::Timer>,
    storage_root: PathBuf,
    failed_this_round: bool,
    /// The relay closed our connection; sends are discarded until the node
    /// reconnects. Tracked from the inbound records so a replay agrees.
    relay_closed: bool,
    max_rounds: Option<u64>,
    started: bool,
    stopped: bool,
}

impl<N: Node, F: FnMut(Address) -> N> Emulator<N, F> {
    /// Builds an emulator that prompts on stdin.
    ///
    /// # Errors
    ///
    /// * If the command file cannot be read or parsed
    /// * If the replay logs cannot be opened
    /// * If the async runtime cannot be created
    pub fn new(
        config: &ManagerConfig,
        link: EmulatorConfig,
        factory: F,
    ) -> Result<Self, EmulatorError> {
        Self::with_input(config, link, BufReader::new(io::stdin()), factory)
    }

    /// Builds an emulator that reads operator input from `lines`.
    ///
    /// # Errors
    ///
    /// * If the command file cannot be read or parsed
    /// * If the replay logs cannot be opened
    /// * If the async runtime cannot be created
    pub fn with_input(
        config: &ManagerConfig,
        link: EmulatorConfig,
        lines: impl BufRead + Send + 'static,
        factory: F,
    ) -> Result<Self, EmulatorError> {
        let commands = match &config.command_file {
            Some(path) => {
                log::debug!("with_input: reading commands from path={}", path.display());
                Commands::Script(parse_script(&fs::read_to_string(path)?)?)
            }
            None => Commands::Keyboard,
        };

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;

        let replay = config.open_replay(lines)?;
        log::info!(
            "Starting emulation seed={} failure_lvl={} relay={}:{}",
            replay.seed(),
            config.failure_lvl.as_ref(),
            link.relay_host,
            link.relay_port
        );

        Ok(Self {
            core: ManagerCore::new(
                config.failure_lvl,
                N::failure_rates(),
                replay,
                config.open_partial_trace(),
            ),
            factory,
            link,
            runtime,
            addr: None,
            node: None,
            conn: None,
            in_transit: vec![],
            undelivered: vec![],
            commands,
            storage_root: config.storage_root.clone(),
            failed_this_round: false,
            relay_closed: false,
            max_rounds: config.max_rounds,
            started: false,
            stopped: false,
        })
    }

    /// Replaces the command source with `script`.
    ///
    /// # Errors
    ///
    /// * If the script does not parse
    pub fn with_script(mut self, script: &str) -> Result<Self, CommandError> {
        self.commands = Commands::Script(parse_script(script)?);
        Ok(self)
    }

    #[must_use]
    pub const fn now(&self) -> u64 {
        self.core.now()
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.core.seed()
    }

    #[must_use]
    pub const fn packets_sent(&self) -> u64 {
        self.core.packets_sent()
    }

    /// The address assigned by the relay, once the node has started.
    #[must_use]
    pub const fn addr(&self) -> Option<Address> {
        self.addr
    }

    #[must_use]
    pub const fn node(&self) -> Option<&N> {
        self.node.as_ref()
    }

    #[must_use]
    pub const fn is_live(&self) -> bool {
        self.node.is_some()
    }

    /// Starts the node, then runs rounds until the script is exhausted and
    /// nothing is left in flight, until `exit`, or until the replay log ends.
    ///
    /// # Errors
    ///
    /// * If the relay cannot be reached or rejects the node
    /// * If operator input or the replay logs cannot be read
    pub fn run(&mut self) -> Result<(), EmulatorError> {
        let result = loop {
            match self.step() {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break Ok(()),
                Err(EmulatorError::Replay(ReplayError::EndOfLog)) => {
                    println!("Reached end of deterministic replay. Stopping...");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        self.stop();
        result
    }

    /// Runs a single round, starting the node first if this is the first
    /// one.
    ///
    /// # Errors
    ///
    /// * If the relay cannot be reached or rejects the node
    /// * If operator input or the replay logs cannot be read
    pub fn step(&mut self) -> Result<ControlFlow<()>, EmulatorError> {
        if !self.started {
            self.started = true;
            self.start_node()?;
        }
        if self.stopped || self.is_idle() {
            return Ok(ControlFlow::Break(()));
        }
        if let Some(max) = self.max_rounds
            && self.core.now() >= max
        {
            log::debug!("step: reached max_rounds={max}");
            return Ok(ControlFlow::Break(()));
        }

        println!("\nTime: {}", self.core.now());

        let mut events = self.next_commands()?;
        self.check_in_transit(&mut events)?;
        events.extend(self.core.take_due_timeouts().into_iter().map(Event::Timeout));
        self.check_crash(&mut events)?;

        let flow = self.execute(events)?;
        if self.node.is_none() {
            self.disconnect();
        }
        if flow.is_break() {
            return Ok(ControlFlow::Break(()));
        }

        self.core.advance();
        if self.node.is_some() {
            self.trace(&format!("TIMESTEP time:{}", self.core.now()));
        }

        if matches!(self.commands, Commands::Script(_)) && !self.core.input().is_replaying() {
            std::thread::sleep(self.link.round_interval);
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Prints the run summary, closes the relay connection and flushes the
    /// traces and the replay log. Only the first call has an effect.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        println!("Emulation exiting.\n{}", self.core.stop_summary());
        if let Some(addr) = self.addr {
            if self.node.is_some() {
                println!("{addr}: running");
                self.trace("STOPPED");
            } else {
                println!("{addr}: failed");
            }
        }

        self.disconnect();
        self.core.flush_trace();
        if let Err(e) = self.core.input().flush() {
            log::error!("stop: failed to flush replay log: {e:?}");
        }
    }

    fn is_idle(&self) -> bool {
        matches!(&self.commands, Commands::Script(script) if script.is_empty())
            && self.in_transit.is_empty()
            && self.core.pending_timeouts() == 0
    }

    fn next_commands(&mut self) -> Result<Vec<Event<N::Timer>>, EmulatorError> {
        let mut events = vec![];

        if let Commands::Script(script) = &mut self.commands {
            while let Some(event) = script.pop_front() {
                if matches!(event, Event::Time) {
                    break;
                }
                events.push(event);
            }
            return Ok(events);
        }

        println!(
            "Please input a sequence of commands terminated by a blank line or the TIME command:"
        );
        loop {
            let Some(line) = self.core.input().read_line()? else {
                log::debug!("next_commands: operator input closed, draining remaining work");
                self.commands = Commands::Script(VecDeque::new());
                break;
            };
            if line.trim().is_empty() {
                break;
            }

            match commands::parse_line(&line, self.command_mode()) {
                Ok(parsed) => {
                    let end_of_round = parsed.iter().any(|event| matches!(event, Event::Time));
                    events.extend(
                        parsed
                            .into_iter()
                            .filter(|event| !matches!(event, Event::Time)),
                    );
                    if end_of_round {
                        break;
                    }
                }
                Err(e) => println!("{e}"),
            }
        }

        Ok(events)
    }

    fn command_mode(&self) -> CommandMode {
        CommandMode::Emulation {
            local: self.addr.unwrap_or_default(),
        }
    }

    /// Collects this round's inbound packets, live or from the replay log,
    /// and records them. A FIN from the relay becomes a failure of the local
    /// node.
    fn receive(&mut self) -> Result<(Vec<Packet>, bool), ReplayError> {
        let mut packets = vec![];
        let mut closed = false;

        if self.core.input().is_replaying() {
            while let Some(packet) = self.core.input().next_packet()? {
                closed |= packet.is_fin();
                if !packet.is_fin() {
                    packets.push(packet);
                }
            }
        } else if let Some(conn) = &mut self.conn {
            let addr = conn.addr();
            for inbound in conn.drain() {
                match inbound {
                    Inbound::Packet(packet) => packets.push(packet),
                    Inbound::Fin | Inbound::Closed => {
                        log::info!("Relay closed the connection of node {addr}");
                        closed = true;
                    }
                }
            }
        }

        for packet in &packets {
            self.core.input().record_packet(packet)?;
        }
        if closed && let Some(addr) = self.addr {
            self.core.input().record_packet(&Packet::fin(addr))?;
        }
        self.core.input().record_round_end()?;

        Ok((packets, closed))
    }

    fn check_in_transit(&mut self, events: &mut Vec<Event<N::Timer>>) -> Result<(), ReplayError> {
        let (received, closed) = self.receive()?;

        let mut packets = std::mem::take(&mut self.in_transit);
        packets.extend(received);
        let plan = self.core.decide_in_transit(packets)?;

        if self.node.is_some() {
            for packet in &plan.dropped {
                self.trace(&format!("DROP {}", packet.to_trace_string()));
            }
            for packet in &plan.delayed {
                self.trace(&format!("DELAY {}", packet.to_trace_string()));
            }
        }

        self.in_transit = plan.delayed;
        events.extend(plan.deliver.into_iter().map(Event::Delivery));
        if closed && let Some(addr) = self.addr {
            self.relay_closed = true;
            events.push(Event::Failure(addr));
        }

        Ok(())
    }

    fn check_crash(&mut self, events: &mut Vec<Event<N::Timer>>) -> Result<(), ReplayError> {
        let Some(addr) = self.addr else {
            return Ok(());
        };
        let (live, crashed) = if self.node.is_some() {
            (vec![addr], vec![])
        } else {
            (vec![], vec![addr])
        };
        let plan = self.core.decide_crashes(&live, &crashed)?;

        events.extend(plan.fail.into_iter().map(Event::Failure));
        events.extend(plan.start.into_iter().map(Event::Start));
        Ok(())
    }

    fn execute(&mut self, events: Vec<Event<N::Timer>>) -> Result<ControlFlow<()>, EmulatorError> {
        let events = self.core.order_events(events)?;
        self.failed_this_round = false;

        for event in events {
            if self.handle(event)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    fn handle(&mut self, event: Event<N::Timer>) -> Result<ControlFlow<()>, EmulatorError> {
        match event {
            Event::Failure(_) => self.fail_node(),
            Event::Start(_) => self.start_node()?,
            Event::Exit => return Ok(ControlFlow::Break(())),
            Event::Command { command, .. } => {
                if self.node.is_none() {
                    log::debug!("handle: ignoring command for crashed node");
                    return Ok(ControlFlow::Continue(()));
                }
                self.trace(&format!("COMMAND {command}"));
                self.dispatch(|node, ctx| node.on_command(ctx, &command))?;
            }
            Event::Echo(text) => println!("{text}"),
            Event::Time => {}
            Event::Delivery(packet) => {
                if self.node.is_none() {
                    self.undelivered.push(packet);
                    return Ok(ControlFlow::Continue(()));
                }
                self.trace(&format!("RECVD {}", packet.to_trace_string()));
                self.dispatch(|node, ctx| {
                    node.on_receive(ctx, packet.src(), packet.protocol(), packet.payload())
                })?;
            }
            Event::Timeout(timeout) => {
                if self.failed_this_round || self.node.is_none() {
                    log::debug!("handle: skipping canceled timeout {timeout}");
                    return Ok(ControlFlow::Continue(()));
                }
                self.trace(&format!("TIMEOUT {timeout}"));
                self.dispatch(|node, ctx| node.on_timeout(ctx, timeout.into_timer()))?;
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Connects (or reconnects) to the relay and builds a fresh node.
    fn start_node(&mut self) -> Result<(), EmulatorError> {
        self.fail_node();
        self.disconnect();

        let addr = self.connect()?;
        log::debug!("start_node: addr={addr}");
        self.addr = Some(addr);
        self.node = Some((self.factory)(addr));
        self.core.reset_vtime(addr);
        self.trace("START");

        self.dispatch(|node, ctx| node.start(ctx))
    }

    fn connect(&mut self) -> Result<Address, EmulatorError> {
        let addr = if self.core.input().is_replaying() {
            self.core.input().next_addr()?
        } else {
            let conn = self.runtime.block_on(Connection::connect(&self.link))?;
            let addr = conn.addr();
            self.conn = Some(conn);
            addr
        };

        self.core.input().record_addr(addr)?;
        self.relay_closed = false;
        Ok(addr)
    }

    fn fail_node(&mut self) {
        let Some(mut node) = self.node.take() else {
            return;
        };

        log::debug!("fail_node: addr={:?}", self.addr);
        node.on_fail();
        if let Some(addr) = self.addr {
            self.core.log_event(addr, "FAILURE");
            self.core.cancel_timeouts(addr);
        }
        self.failed_this_round = true;
    }

    /// Closes the relay connection, handing back every packet the node did
    /// not get to see.
    fn disconnect(&mut self) {
        let mut bounce = std::mem::take(&mut self.undelivered);
        bounce.append(&mut self.in_transit);

        let Some(conn) = self.conn.take() else {
            return;
        };
        log::debug!(
            "disconnect: closing addr={} peer={:?} bouncing={}",
            conn.addr(),
            conn.peer(),
            bounce.len()
        );
        conn.close(&self.runtime, bounce);
    }

    /// Runs one upcall on the local node, then any timers it registered with
    /// a non-positive delay, and fails the node if it crashed along the way.
    fn dispatch(
        &mut self,
        upcall: impl FnOnce(&mut N, &mut dyn Context<N::Timer>) -> NodeResult,
    ) -> Result<(), EmulatorError> {
        let (Some(node), Some(addr)) = (self.node.as_mut(), self.addr) else {
            return Ok(());
        };

        let mut ctx = EmuContext {
            addr,
            core: &mut self.core,
            conn: self.conn.as_ref(),
            relay_closed: self.relay_closed,
            storage_root: &self.storage_root,
            immediate: VecDeque::new(),
            crashed: false,
            fatal: None,
        };

        let mut result = upcall(node, &mut ctx);
        while result.is_ok() && !ctx.crashed {
            let Some(timer) = ctx.immediate.pop_front() else {
                break;
            };
            ctx.trace(&format!("TIMEOUT fire-time:{} {timer:?}", ctx.core.now()));
            result = node.on_timeout(&mut ctx, timer);
        }

        let crashed = result.is_err() || ctx.crashed;
        if let Some(e) = ctx.fatal.take() {
            return Err(e.into());
        }
        if crashed {
            self.fail_node();
        }

        Ok(())
    }

    fn trace(&mut self, event: &str) {
        if let Some(addr) = self.addr {
            self.core.log_event(addr, event);
        }
    }
}

/// Script lines carry no addresses; the local address is filled in when the
/// events run.
fn parse_script<T>(script: &str) -> Result<VecDeque<Event<T>>, CommandError> {
    commands::parse_script(script, CommandMode::Emulation { local: 0 })
}
