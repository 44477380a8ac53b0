//! Scheduler state and decisions shared by the simulator and emulator.

use std::collections::{BTreeMap, BTreeSet};

use bytes::Bytes;
use rand::{Rng as _, SeedableRng as _, rngs::SmallRng, seq::SliceRandom as _};
use relaynet_replay::{Replay, ReplayError};
use relaynet_trace::{TraceLogger, VectorTime};

use crate::{Address, Event, FailureLvl, FailureRates, MAX_ADDRESS, Packet, SendError, Timeout};

/// Outcome of the in-transit step of a round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TransitPlan {
    /// Packets handed to their destination this round.
    pub deliver: Vec<Packet>,
    /// Packets kept in transit for the next round.
    pub delayed: Vec<Packet>,
    pub dropped: Vec<Packet>,
}

/// Outcome of the crash step of a round.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct CrashPlan {
    pub fail: Vec<Address>,
    pub start: Vec<Address>,
}

/// State owned by every scheduler: the logical clock, the failure policy,
/// pending timeouts, vector clocks and the partially ordered trace.
///
/// Every non-deterministic decision goes through here. RNG decisions use a
/// [`SmallRng`] seeded from the replay seed, and operator decisions read
/// their answers through the [`Replay`] input so they are recorded and
/// replayed like any other input.
pub struct ManagerCore<T> {
    time: u64,
    failure_lvl: FailureLvl,
    rates: FailureRates,
    rng: SmallRng,
    input: Replay,
    timeouts: Vec<Timeout<T>>,
    next_timeout_id: u64,
    packets_sent: u64,
    vtimes: BTreeMap<Address, VectorTime>,
    partial: TraceLogger,
}

impl<T> ManagerCore<T> {
    #[must_use]
    pub fn new(
        failure_lvl: FailureLvl,
        rates: FailureRates,
        input: Replay,
        partial: TraceLogger,
    ) -> Self {
        let seed = input.seed();
        log::debug!("new: failure_lvl={failure_lvl:?} rates={rates:?} seed={seed}");

        Self {
            time: 0,
            failure_lvl,
            rates: rates.clamped(),
            rng: SmallRng::seed_from_u64(seed),
            input,
            timeouts: vec![],
            next_timeout_id: 0,
            packets_sent: 0,
            vtimes: BTreeMap::new(),
            partial,
        }
    }

    #[must_use]
    pub const fn now(&self) -> u64 {
        self.time
    }

    pub const fn advance(&mut self) {
        self.time += 1;
    }

    #[must_use]
    pub const fn failure_lvl(&self) -> FailureLvl {
        self.failure_lvl
    }

    #[must_use]
    pub const fn rates(&self) -> FailureRates {
        self.rates
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.input.seed()
    }

    #[must_use]
    pub const fn packets_sent(&self) -> u64 {
        self.packets_sent
    }

    pub const fn input(&mut self) -> &mut Replay {
        &mut self.input
    }

    /// Checks a send request and builds its packet. Does not count the send;
    /// each scheduler counts the physical packets it emits with
    /// [`ManagerCore::count_send`].
    ///
    /// # Errors
    ///
    /// * If `from` is not a node address
    /// * If the payload does not fit in a packet
    pub fn validate_send(
        &self,
        from: Address,
        to: Address,
        protocol: u8,
        payload: &[u8],
    ) -> Result<Packet, SendError> {
        if from > MAX_ADDRESS {
            return Err(SendError::InvalidAddress(from));
        }
        Ok(Packet::new(to, from, protocol, Bytes::copy_from_slice(payload))?)
    }

    pub const fn count_send(&mut self) {
        self.packets_sent += 1;
    }

    /// Registers a timeout for `owner`.
    ///
    /// Returns the timer back if `delay` is not positive, in which case the
    /// caller must fire it as soon as the current upcall returns.
    pub fn add_timeout(&mut self, owner: Address, delay: i64, timer: T) -> Option<T> {
        let Ok(delay) = u64::try_from(delay) else {
            return Some(timer);
        };
        if delay == 0 {
            return Some(timer);
        }

        let id = self.next_timeout_id;
        self.next_timeout_id += 1;
        let fire_time = self.time + delay;
        log::trace!("add_timeout: id={id} owner={owner} fire_time={fire_time}");
        self.timeouts.push(Timeout::new(id, owner, fire_time, timer));
        None
    }

    /// Removes and returns every timeout due at or before now, in
    /// registration order.
    pub fn take_due_timeouts(&mut self) -> Vec<Timeout<T>> {
        let now = self.time;
        let (due, pending) = std::mem::take(&mut self.timeouts)
            .into_iter()
            .partition(|timeout| timeout.fire_time() <= now);
        self.timeouts = pending;
        due
    }

    /// Drops every pending timeout owned by `owner`, returning how many
    /// were canceled.
    pub fn cancel_timeouts(&mut self, owner: Address) -> usize {
        let before = self.timeouts.len();
        self.timeouts.retain(|timeout| timeout.owner() != owner);
        let canceled = before - self.timeouts.len();
        if canceled > 0 {
            log::debug!("cancel_timeouts: owner={owner} canceled={canceled}");
        }
        canceled
    }

    #[must_use]
    pub fn pending_timeouts(&self) -> usize {
        self.timeouts.len()
    }

    /// Gives `addr` a fresh vector clock.
    pub fn reset_vtime(&mut self, addr: Address) {
        self.vtimes.insert(addr, VectorTime::default());
    }

    /// Causal delivery rule: `dest` catches up with everything `src` had seen.
    pub fn merge_vtime(&mut self, dest: Address, src: Address) {
        let Some(src_time) = self.vtimes.get(&src).cloned() else {
            return;
        };
        self.vtimes.entry(dest).or_default().update_to(&src_time);
    }

    #[must_use]
    pub fn vtime(&self, addr: Address) -> Option<&VectorTime> {
        self.vtimes.get(&addr)
    }

    /// Steps `addr`'s own clock component and writes `event` to the
    /// partially ordered trace.
    ///
    /// Returns the trace line without its timestamp so callers can reuse it
    /// for other traces.
    pub fn log_event(&mut self, addr: Address, event: &str) -> String {
        let line = format!("node:{addr} {event}");
        let vtime = self.vtimes.entry(addr).or_default();
        vtime.step(usize::from(addr));
        self.partial.log(&*vtime, &line);
        line
    }

    pub fn flush_trace(&mut self) {
        self.partial.flush();
    }

    /// Returns `true` with the given probability.
    pub fn roll(&mut self, probability: f64) -> bool {
        self.rng.random::<f64>() < probability
    }

    pub fn shuffle<E>(&mut self, items: &mut [E]) {
        items.shuffle(&mut self.rng);
    }

    /// Prints `prompt` and reads the operator's answer.
    ///
    /// # Errors
    ///
    /// * If the replay log is exhausted or unreadable
    pub fn prompt(&mut self, prompt: &str) -> Result<Option<String>, ReplayError> {
        println!("{prompt}");
        self.input.read_line()
    }

    /// Asks the operator to pick entries of a list of `len` items.
    ///
    /// Invalid or out of range entries are reported and ignored.
    ///
    /// # Errors
    ///
    /// * If the replay log is exhausted or unreadable
    pub fn prompt_indices(&mut self, prompt: &str, len: usize) -> Result<BTreeSet<usize>, ReplayError> {
        let answer = self.prompt(prompt)?.unwrap_or_default();
        let mut picked = BTreeSet::new();

        for token in answer.split_whitespace() {
            match token.parse::<usize>() {
                Ok(index) if index < len => {
                    picked.insert(index);
                }
                _ => println!("Ignoring invalid index: {token}"),
            }
        }

        Ok(picked)
    }

    /// Asks the operator to pick addresses out of `candidates`.
    ///
    /// # Errors
    ///
    /// * If the replay log is exhausted or unreadable
    pub fn prompt_addresses(
        &mut self,
        prompt: &str,
        candidates: &[Address],
    ) -> Result<Vec<Address>, ReplayError> {
        let answer = self.prompt(prompt)?.unwrap_or_default();
        let mut picked = vec![];

        for token in answer.split_whitespace() {
            match token.parse::<Address>() {
                Ok(addr) if candidates.contains(&addr) && !picked.contains(&addr) => {
                    picked.push(addr);
                }
                _ => println!("Ignoring invalid address: {token}"),
            }
        }

        Ok(picked)
    }

    /// Asks a yes/no question. Anything starting with `y` is a yes.
    ///
    /// # Errors
    ///
    /// * If the replay log is exhausted or unreadable
    pub fn prompt_yes_no(&mut self, prompt: &str) -> Result<bool, ReplayError> {
        Ok(self
            .prompt(prompt)?
            .is_some_and(|answer| answer.trim_start().starts_with('y')))
    }

    /// Decides which in-transit packets are dropped, delayed or delivered.
    ///
    /// Below [`FailureLvl::Drop`] every packet is dropped independently with
    /// the drop rate, otherwise the operator chooses. Below
    /// [`FailureLvl::Delay`] each surviving packet is delayed with the delay
    /// rate re-normalized against the drop rate, otherwise the operator
    /// chooses.
    ///
    /// # Errors
    ///
    /// * If an operator answer cannot be read
    pub fn decide_in_transit(&mut self, packets: Vec<Packet>) -> Result<TransitPlan, ReplayError> {
        let mut plan = TransitPlan::default();
        if packets.is_empty() {
            return Ok(plan);
        }

        let survivors = if self.failure_lvl < FailureLvl::Drop {
            let mut survivors = vec![];
            for packet in packets {
                if self.roll(self.rates.drop) {
                    println!("Randomly dropping: {packet}");
                    plan.dropped.push(packet);
                } else {
                    survivors.push(packet);
                }
            }
            survivors
        } else {
            print_listing("The following messages are in transit:", &packets);
            let drop = self.prompt_indices(
                "Which should be dropped? (space delimited list or just press enter to drop none)",
                packets.len(),
            )?;
            split_by_index(packets, &drop, &mut plan.dropped)
        };

        if self.failure_lvl < FailureLvl::Delay {
            let delay = if self.rates.drop < 1.0 {
                self.rates.delay / (1.0 - self.rates.drop)
            } else {
                0.0
            };
            for packet in survivors {
                if self.roll(delay) {
                    println!("Randomly delaying: {packet}");
                    plan.delayed.push(packet);
                } else {
                    plan.deliver.push(packet);
                }
            }
        } else if !survivors.is_empty() {
            print_listing("The following messages are still in transit:", &survivors);
            let delay = self.prompt_indices(
                "Which should be delayed? (space delimited list or just press enter to delay none)",
                survivors.len(),
            )?;
            plan.deliver = split_by_index(survivors, &delay, &mut plan.delayed);
        }

        Ok(plan)
    }

    /// Decides which live nodes crash and which crashed nodes restart.
    ///
    /// # Errors
    ///
    /// * If an operator answer cannot be read
    pub fn decide_crashes(
        &mut self,
        live: &[Address],
        crashed: &[Address],
    ) -> Result<CrashPlan, ReplayError> {
        let mut plan = CrashPlan::default();

        if self.failure_lvl < FailureLvl::Crash {
            for &addr in live {
                if self.roll(self.rates.failure) {
                    println!("Randomly failing: {addr}");
                    plan.fail.push(addr);
                }
            }
            for &addr in crashed {
                if self.roll(self.rates.recovery) {
                    println!("Randomly recovering: {addr}");
                    plan.start.push(addr);
                }
            }
            return Ok(plan);
        }

        if !live.is_empty() {
            println!("Live nodes: {}", join(live));
            plan.fail = self.prompt_addresses(
                "Crash which nodes? (space delimited list or just press enter to crash none)",
                live,
            )?;
        }
        if !crashed.is_empty() {
            println!("Crashed nodes: {}", join(crashed));
            plan.start = self.prompt_addresses(
                "Restart which nodes? (space delimited list or just press enter to restart none)",
                crashed,
            )?;
        }

        Ok(plan)
    }

    /// Decides whether `addr` crashes before the storage operation
    /// `description`.
    ///
    /// # Errors
    ///
    /// * If an operator answer cannot be read
    pub fn decide_write_crash(&mut self, addr: Address, description: &str) -> Result<bool, ReplayError> {
        if self.failure_lvl < FailureLvl::Crash {
            let crash = self.roll(self.rates.failure);
            if crash {
                println!("Randomly failing before write: {addr}");
            }
            return Ok(crash);
        }

        self.prompt_yes_no(&format!("Crash node {addr} before {description}? (y/n)"))
    }

    /// Summary printed when a run stops.
    #[must_use]
    pub fn stop_summary(&self) -> String {
        let mut summary = format!("Number of packets sent: {}", self.packets_sent);
        if self.failure_lvl != FailureLvl::Everything {
            summary.push_str(&format!("\nRandom seed: {}", self.seed()));
        }
        summary
    }
}

impl<T: std::fmt::Debug> ManagerCore<T> {
    /// Orders a round's events: shuffled by the RNG, or in an operator-chosen
    /// order under [`FailureLvl::Everything`].
    ///
    /// The operator must list every event exactly once. A blank answer keeps
    /// the listed order.
    ///
    /// # Errors
    ///
    /// * If an operator answer cannot be read
    pub fn order_events(&mut self, mut events: Vec<Event<T>>) -> Result<Vec<Event<T>>, ReplayError> {
        if self.failure_lvl < FailureLvl::Everything {
            self.shuffle(&mut events);
            if !events.is_empty() {
                print_listing("Executing with order:", &events);
            }
            return Ok(events);
        }

        if events.len() < 2 {
            return Ok(events);
        }

        loop {
            print_listing("The following events will occur this round:", &events);
            let Some(answer) = self.prompt(
                "In what order should they occur? (space delimited list or just press enter for the listed order)",
            )?
            else {
                return Ok(events);
            };

            if answer.trim().is_empty() {
                return Ok(events);
            }

            if let Some(order) = parse_order(&answer, events.len()) {
                let mut slots = events.into_iter().map(Some).collect::<Vec<_>>();
                return Ok(order
                    .into_iter()
                    .filter_map(|index| slots[index].take())
                    .collect());
            }

            println!("Not all of the events were specified!");
        }
    }
}

fn parse_order(answer: &str, len: usize) -> Option<Vec<usize>> {
    let mut seen = BTreeSet::new();
    let order = answer
        .split_whitespace()
        .map(|token| token.parse::<usize>().ok().filter(|index| *index < len))
        .collect::<Option<Vec<_>>>()?;

    (order.len() == len && order.iter().all(|index| seen.insert(*index))).then_some(order)
}

fn split_by_index(items: Vec<Packet>, picked: &BTreeSet<usize>, into: &mut Vec<Packet>) -> Vec<Packet> {
    let mut rest = vec![];
    for (i, item) in items.into_iter().enumerate() {
        if picked.contains(&i) {
            into.push(item);
        } else {
            rest.push(item);
        }
    }
    rest
}

fn print_listing<E: std::fmt::Display>(title: &str, items: &[E]) {
    println!("{title}");
    for (i, item) in items.iter().enumerate() {
        println!("{i}: {item}");
    }
}

fn join(addrs: &[Address]) -> String {
    addrs
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(" ")
}
