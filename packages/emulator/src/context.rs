use std::{
    collections::VecDeque,
    fmt,
    path::{Path, PathBuf},
};

use relaynet_manager::{Address, Context, ManagerCore, NodeResult, ReplayError, SendError};

use crate::connection::Connection;

/// What the local node sees of the emulator during one upcall.
pub(crate) struct EmuContext<'a, T> {
    pub(crate) addr: Address,
    pub(crate) core: &'a mut ManagerCore<T>,
    /// `None` while replaying.
    pub(crate) conn: Option<&'a Connection>,
    pub(crate) relay_closed: bool,
    pub(crate) storage_root: &'a Path,
    pub(crate) immediate: VecDeque<T>,
    pub(crate) crashed: bool,
    pub(crate) fatal: Option<ReplayError>,
}

impl<T> EmuContext<'_, T> {
    pub(crate) fn trace(&mut self, event: &str) {
        self.core.log_event(self.addr, event);
    }
}

impl<T: fmt::Debug> Context<T> for EmuContext<'_, T> {
    fn addr(&self) -> Address {
        self.addr
    }

    fn now(&self) -> u64 {
        self.core.now()
    }

    /// A broadcast leaves as a single packet; the relay fans it out.
    fn send(&mut self, to: Address, protocol: u8, payload: &[u8]) -> Result<(), SendError> {
        let packet = self.core.validate_send(self.addr, to, protocol, payload)?;
        if self.crashed {
            log::debug!("send: node {} already crashed, discarding {packet}", self.addr);
            return Ok(());
        }

        if self.relay_closed {
            log::debug!("send: relay closed the connection, discarding {packet}");
            return Ok(());
        }

        self.core.count_send();
        self.trace(&format!("SEND {}", packet.to_trace_string()));

        if let Some(conn) = self.conn
            && !conn.send(&packet)
        {
            log::warn!("send: relay connection closed, {packet} was not sent");
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
                log::debug!("check_write_crash: unable to decide: {e}");
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

#[cfg(test)]
mod tests {
    use std::io::empty;

    use pretty_assertions::assert_eq;
    use relaynet_manager::{FailureLvl, FailureRates, ManagerConfig, Replay};

    use super::*;

    fn core() -> ManagerCore<()> {
        ManagerCore::new(
            FailureLvl::Nothing,
            FailureRates::reliable(),
            Replay::live(1, empty()),
            ManagerConfig::new().open_partial_trace(),
        )
    }

    fn context(core: &mut ManagerCore<()>, relay_closed: bool) -> EmuContext<'_, ()> {
        EmuContext {
            addr: 2,
            core,
            conn: None,
            relay_closed,
            storage_root: Path::new("storage"),
            immediate: VecDeque::new(),
            crashed: false,
            fatal: None,
        }
    }

    #[test_log::test]
    fn sends_after_the_relay_closed_are_not_counted() {
        let mut core = core();

        context(&mut core, true).send(5, 0, b"lost").unwrap();
        assert_eq!(core.packets_sent(), 0);

        context(&mut core, false).send(5, 0, b"sent").unwrap();
        assert_eq!(core.packets_sent(), 1);
    }
}
