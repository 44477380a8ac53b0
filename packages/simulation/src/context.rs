use std::{
    collections::VecDeque,
    fmt,
    path::{Path, PathBuf},
};

use relaynet_manager::{
    Address, BROADCAST, Context, ManagerCore, NodeResult, Packet, ReplayError, SendError,
};
use relaynet_trace::TraceLogger;

/// The totally ordered trace. The simulator is single threaded, so a
/// global counter orders every event.
pub(crate) struct TotalOrder {
    log: TraceLogger,
    counter: u64,
}

impl TotalOrder {
    pub(crate) const fn new(log: TraceLogger) -> Self {
        Self { log, counter: 0 }
    }

    pub(crate) fn log(&mut self, line: &str) {
        self.log.log(self.counter, line);
        self.counter += 1;
    }

    pub(crate) fn flush(&mut self) {
        self.log.flush();
    }
}

/// Writes `event` for `addr` to both traces.
pub(crate) fn trace<T>(core: &mut ManagerCore<T>, total: &mut TotalOrder, addr: Address, event: &str) {
    let line = core.log_event(addr, event);
    total.log(&line);
}

/// What a node sees of the simulator during one upcall.
pub(crate) struct SimContext<'a, T> {
    pub(crate) addr: Address,
    pub(crate) core: &'a mut ManagerCore<T>,
    pub(crate) total: &'a mut TotalOrder,
    pub(crate) in_transit: &'a mut Vec<Packet>,
    /// Broadcast targets: every live node but the caller, then every crashed
    /// node.
    pub(crate) peers: Vec<Address>,
    pub(crate) storage_root: &'a Path,
    /// Timers registered with a non-positive delay.
    pub(crate) immediate: VecDeque<T>,
    pub(crate) crashed: bool,
    pub(crate) fatal: Option<ReplayError>,
}

impl<T> SimContext<'_, T> {
    pub(crate) fn trace(&mut self, event: &str) {
        trace(self.core, self.total, self.addr, event);
    }

    fn emit(&mut self, packet: Packet) {
        self.core.count_send();
        self.trace(&format!("SEND {}", packet.to_trace_string()));
        self.in_transit.push(packet);
    }
}

impl<T: fmt::Debug> Context<T> for SimContext<'_, T> {
    fn addr(&self) -> Address {
        self.addr
    }

    fn now(&self) -> u64 {
        self.core.now()
    }

    fn send(&mut self, to: Address, protocol: u8, payload: &[u8]) -> Result<(), SendError> {
        let packet = self.core.validate_send(self.addr, to, protocol, payload)?;
        if self.crashed {
            log::debug!("send: node {} already crashed, discarding {packet}", self.addr);
            return Ok(());
        }

        if to == BROADCAST {
            for dest in self.peers.clone() {
                self.emit(packet.readdressed(dest));
            }
        } else {
            self.emit(packet);
        }

        Ok(())
    }

    fn add_timeout(&mut self, delay: i64, timer: T) {
        if self.crashed {
            return;
        }
        if let Some(timer) = self.core.add_timeout(self.addr, delay, timer) {
            self.immediate.push_back(timer);
        }
    }

    fn log_event(&mut self, event: &str) {
        self.trace(&format!("USER-EVENT {event}"));
    }

    fn check_write_crash(&mut self, description: &str) -> NodeResult {
        if self.crashed {
            return Err(self.crash());
        }

        match self.core.decide_write_crash(self.addr, description) {
            Ok(false) => return Ok(()),
            Ok(true) => {}
            Err(e) => {
                log::debug!("check_write_crash: unable to decide for node {}: {e}", self.addr);
                self.fatal = Some(e);
            }
        }

        self.crashed = true;
        Err(self.crash())
    }

    fn storage_write_event(&mut self, description: &str) {
        self.trace(&format!("WRITE {description}"));
    }

    fn storage_read_event(&mut self, description: &str) {
        self.trace(&format!("READ {description}"));
    }

    fn storage_dir(&self) -> PathBuf {
        self.storage_root.join(self.addr.to_string())
    }
}
