#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Single-process, single-threaded discrete-event simulator.
//!
//! Every virtual node lives in one process and the simulator moves packets
//! between them. Time advances in rounds. Each round collects:
//!
//! 1. the operator's commands (from a script or the keyboard)
//! 2. the in-transit packets that were neither dropped nor delayed
//! 3. the timeouts that came due
//! 4. the crash and recovery decisions
//!
//! and executes them in a random (or operator chosen) order.

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    fs,
    io::{self, BufRead, BufReader},
    ops::ControlFlow,
    path::PathBuf,
};

use context::{SimContext, TotalOrder, trace};
use relaynet_manager::{
    Address, Context, Event, MAX_ADDRESS, ManagerConfig, ManagerCore, Node, NodeResult, Packet,
    ReplayError,
    commands::{self, CommandError, CommandMode},
};
use thiserror::Error;

mod context;

#[derive(Debug, Error)]
pub enum SimulatorError {
    #[error(transparent)]
    Replay(#[from] ReplayError),
    #[error(transparent)]
    Command(#[from] CommandError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

enum Commands<T> {
    /// Pre-parsed events; `time` separates the rounds.
    Script(VecDeque<Event<T>>),
    /// Prompt for each round's commands.
    Keyboard,
}

/// Simulates many instances of `N`, built on demand by a factory.
pub struct Simulator<N: Node, F> {
    core: ManagerCore<N::Timer>,
    factory: F,
    nodes: BTreeMap<Address, N>,
    crashed: BTreeSet<Address>,
    /// Packets that reached a crashed node, redelivered once it restarts.
    held: BTreeMap<Address, Vec<Packet>>,
    in_transit: Vec<Packet>,
    commands: Commands<N::Timer>,
    total: TotalOrder,
    storage_root: PathBuf,
    failed_this_round: BTreeSet<Address>,
    max_rounds: Option<u64>,
    stopped: bool,
}

impl<N: Node, F: FnMut(Address) -> N> Simulator<N, F> {
    /// Builds a simulator that prompts on stdin.
    ///
    /// # Errors
    ///
    /// * If the command file cannot be read or parsed
    /// * If the replay logs cannot be opened
    pub fn new(config: &ManagerConfig, factory: F) -> Result<Self, SimulatorError> {
        Self::with_input(config, BufReader::new(io::stdin()), factory)
    }

    /// Builds a simulator that reads operator input from `lines`.
    ///
    /// # Errors
    ///
    /// * If the command file cannot be read or parsed
    /// * If the replay logs cannot be opened
    pub fn with_input(
        config: &ManagerConfig,
        lines: impl BufRead + Send + 'static,
        factory: F,
    ) -> Result<Self, SimulatorError> {
        let commands = match &config.command_file {
            Some(path) => {
                log::debug!("with_input: reading commands from path={}", path.display());
                Commands::Script(commands::parse_script(
                    &fs::read_to_string(path)?,
                    CommandMode::Simulation,
                )?)
            }
            None => Commands::Keyboard,
        };

        let replay = config.open_replay(lines)?;
        log::info!(
            "Starting simulation seed={} failure_lvl={}",
            replay.seed(),
            config.failure_lvl.as_ref()
        );

        Ok(Self {
            core: ManagerCore::new(
                config.failure_lvl,
                N::failure_rates(),
                replay,
                config.open_partial_trace(),
            ),
            factory,
            nodes: BTreeMap::new(),
            crashed: BTreeSet::new(),
            held: BTreeMap::new(),
            in_transit: vec![],
            commands,
            total: TotalOrder::new(config.open_total_trace()),
            storage_root: config.storage_root.clone(),
            failed_this_round: BTreeSet::new(),
            max_rounds: config.max_rounds,
            stopped: false,
        })
    }

    /// Replaces the command source with `script`.
    ///
    /// # Errors
    ///
    /// * If the script does not parse
    pub fn with_script(mut self, script: &str) -> Result<Self, CommandError> {
        self.commands = Commands::Script(commands::parse_script(script, CommandMode::Simulation)?);
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

    #[must_use]
    pub fn node(&self, addr: Address) -> Option<&N> {
        self.nodes.get(&addr)
    }

    pub fn live_nodes(&self) -> impl Iterator<Item = Address> + '_ {
        self.nodes.keys().copied()
    }

    pub fn crashed_nodes(&self) -> impl Iterator<Item = Address> + '_ {
        self.crashed.iter().copied()
    }

    #[must_use]
    pub fn in_transit(&self) -> &[Packet] {
        &self.in_transit
    }

    /// Packets waiting for `addr` to restart.
    #[must_use]
    pub fn held(&self, addr: Address) -> &[Packet] {
        self.held.get(&addr).map(Vec::as_slice).unwrap_or_default()
    }

    #[must_use]
    pub fn pending_timeouts(&self) -> usize {
        self.core.pending_timeouts()
    }

    /// Runs rounds until the script is exhausted and nothing is left in
    /// flight, until `exit`, or until the replay log ends, then stops.
    ///
    /// # Errors
    ///
    /// * If operator input or the replay logs cannot be read
    pub fn run(&mut self) -> Result<(), SimulatorError> {
        let result = loop {
            match self.step() {
                Ok(ControlFlow::Continue(())) => {}
                Ok(ControlFlow::Break(())) => break Ok(()),
                Err(SimulatorError::Replay(ReplayError::EndOfLog)) => {
                    println!("Reached end of deterministic replay. Stopping...");
                    break Ok(());
                }
                Err(e) => break Err(e),
            }
        };

        self.stop();
        result
    }

    /// Runs a single round.
    ///
    /// Returns [`ControlFlow::Break`] once the run is over.
    ///
    /// # Errors
    ///
    /// * If operator input or the replay logs cannot be read
    pub fn step(&mut self) -> Result<ControlFlow<()>, SimulatorError> {
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

        if self.execute(events)?.is_break() {
            return Ok(ControlFlow::Break(()));
        }

        self.core.advance();
        let event = format!("TIMESTEP time:{}", self.core.now());
        for addr in self.nodes.keys().copied().collect::<Vec<_>>() {
            self.trace(addr, &event);
        }

        Ok(ControlFlow::Continue(()))
    }

    /// Prints the run summary and the final state of every node, then
    /// flushes the traces and the replay log. Only the first call has an
    /// effect.
    pub fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        println!("Simulation exiting.\n{}", self.core.stop_summary());
        for addr in self.nodes.keys().copied().collect::<Vec<_>>() {
            println!("{addr}: running");
            self.trace(addr, "STOPPED");
        }
        for addr in &self.crashed {
            println!("{addr}: failed");
        }

        self.core.flush_trace();
        self.total.flush();
        if let Err(e) = self.core.input().flush() {
            log::error!("stop: failed to flush replay log: {e:?}");
        }
    }

    fn is_idle(&self) -> bool {
        matches!(&self.commands, Commands::Script(script) if script.is_empty())
            && self.in_transit.is_empty()
            && self.core.pending_timeouts() == 0
    }

    fn next_commands(&mut self) -> Result<Vec<Event<N::Timer>>, SimulatorError> {
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

            match commands::parse_line(&line, CommandMode::Simulation) {
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

    fn check_in_transit(&mut self, events: &mut Vec<Event<N::Timer>>) -> Result<(), ReplayError> {
        let plan = self.core.decide_in_transit(std::mem::take(&mut self.in_transit))?;

        for packet in &plan.dropped {
            self.trace_transit(packet, "DROP");
        }
        for packet in &plan.delayed {
            self.trace_transit(packet, "DELAY");
        }

        self.in_transit = plan.delayed;
        events.extend(plan.deliver.into_iter().map(Event::Delivery));
        Ok(())
    }

    fn trace_transit(&mut self, packet: &Packet, what: &str) {
        // The destination may have failed while the packet was in flight.
        if self.nodes.contains_key(&packet.dest()) {
            self.trace(
                packet.dest(),
                &format!("{what} {}", packet.to_trace_string()),
            );
        }
    }

    fn check_crash(&mut self, events: &mut Vec<Event<N::Timer>>) -> Result<(), ReplayError> {
        let live = self.nodes.keys().copied().collect::<Vec<_>>();
        let crashed = self.crashed.iter().copied().collect::<Vec<_>>();
        let plan = self.core.decide_crashes(&live, &crashed)?;

        events.extend(plan.fail.into_iter().map(Event::Failure));
        events.extend(plan.start.into_iter().map(Event::Start));
        Ok(())
    }

    fn execute(&mut self, events: Vec<Event<N::Timer>>) -> Result<ControlFlow<()>, SimulatorError> {
        let events = self.core.order_events(events)?;
        self.failed_this_round.clear();

        for event in events {
            if self.handle(event)?.is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    fn handle(&mut self, event: Event<N::Timer>) -> Result<ControlFlow<()>, SimulatorError> {
        match event {
            Event::Failure(addr) => {
                if self.nodes.contains_key(&addr) {
                    self.fail_node(addr);
                } else if !self.crashed.contains(&addr) {
                    log::warn!("Node address {addr} is invalid.");
                }
            }
            Event::Start(addr) => self.start_node(addr)?,
            Event::Exit => return Ok(ControlFlow::Break(())),
            Event::Command { addr, command } => self.command_node(addr, &command)?,
            Event::Echo(text) => println!("{text}"),
            Event::Time => {}
            Event::Delivery(packet) => self.deliver(packet)?,
            Event::Timeout(timeout) => {
                let owner = timeout.owner();
                if self.failed_this_round.contains(&owner) || !self.nodes.contains_key(&owner) {
                    log::debug!("handle: skipping canceled timeout {timeout}");
                    return Ok(ControlFlow::Continue(()));
                }
                self.trace(owner, &format!("TIMEOUT {timeout}"));
                self.dispatch(owner, |node, ctx| node.on_timeout(ctx, timeout.into_timer()))?;
            }
        }

        Ok(ControlFlow::Continue(()))
    }

    fn start_node(&mut self, addr: Address) -> Result<(), SimulatorError> {
        if addr > MAX_ADDRESS {
            println!("Invalid new node address: {addr}");
            return Ok(());
        }
        if self.nodes.contains_key(&addr) {
            self.fail_node(addr);
        }

        log::debug!("start_node: addr={addr}");
        let node = (self.factory)(addr);
        self.crashed.remove(&addr);
        self.nodes.insert(addr, node);
        self.core.reset_vtime(addr);
        self.trace(addr, "START");

        if let Some(held) = self.held.remove(&addr) {
            log::debug!("start_node: requeueing {} held packets for addr={addr}", held.len());
            self.in_transit.extend(held);
        }

        self.dispatch(addr, |node, ctx| node.start(ctx))
    }

    fn fail_node(&mut self, addr: Address) {
        let Some(mut node) = self.nodes.remove(&addr) else {
            return;
        };

        log::debug!("fail_node: addr={addr}");
        node.on_fail();
        self.trace(addr, "FAILURE");
        self.crashed.insert(addr);
        self.core.cancel_timeouts(addr);
        self.failed_this_round.insert(addr);
    }

    fn command_node(&mut self, addr: Address, command: &str) -> Result<(), SimulatorError> {
        if self.crashed.contains(&addr) {
            log::debug!("command_node: ignoring command for crashed node {addr}");
            return Ok(());
        }
        if !self.nodes.contains_key(&addr) {
            log::warn!("Node address {addr} is invalid.");
            return Ok(());
        }

        self.trace(addr, &format!("COMMAND {command}"));
        self.dispatch(addr, |node, ctx| node.on_command(ctx, command))
    }

    fn deliver(&mut self, packet: Packet) -> Result<(), SimulatorError> {
        let dest = packet.dest();
        if self.crashed.contains(&dest) {
            log::debug!("deliver: holding packet for crashed node {dest}");
            self.held.entry(dest).or_default().push(packet);
            return Ok(());
        }
        if !self.nodes.contains_key(&dest) {
            log::warn!("Node address {dest} is invalid.");
            return Ok(());
        }

        self.core.merge_vtime(dest, packet.src());
        self.trace(dest, &format!("RECVD {}", packet.to_trace_string()));
        self.dispatch(dest, |node, ctx| {
            node.on_receive(ctx, packet.src(), packet.protocol(), packet.payload())
        })
    }

    /// Runs one upcall on `addr`, then any timers it registered with a
    /// non-positive delay, and fails the node if it crashed along the way.
    fn dispatch(
        &mut self,
        addr: Address,
        upcall: impl FnOnce(&mut N, &mut dyn Context<N::Timer>) -> NodeResult,
    ) -> Result<(), SimulatorError> {
        let Some(mut node) = self.nodes.remove(&addr) else {
            return Ok(());
        };

        let peers = self
            .nodes
            .keys()
            .chain(&self.crashed)
            .copied()
            .collect::<Vec<_>>();

        let mut ctx = SimContext {
            addr,
            core: &mut self.core,
            total: &mut self.total,
            in_transit: &mut self.in_transit,
            peers,
            storage_root: &self.storage_root,
            immediate: VecDeque::new(),
            crashed: false,
            fatal: None,
        };

        let mut result = upcall(&mut node, &mut ctx);
        while result.is_ok() && !ctx.crashed {
            let Some(timer) = ctx.immediate.pop_front() else {
                break;
            };
            ctx.trace(&format!("TIMEOUT fire-time:{} {timer:?}", ctx.core.now()));
            result = node.on_timeout(&mut ctx, timer);
        }

        let crashed = result.is_err() || ctx.crashed;
        let fatal = ctx.fatal.take();
        self.nodes.insert(addr, node);

        if let Some(e) = fatal {
            return Err(e.into());
        }
        if crashed {
            self.fail_node(addr);
        }

        Ok(())
    }

    fn trace(&mut self, addr: Address, event: &str) {
        trace(&mut self.core, &mut self.total, addr, event);
    }
}
