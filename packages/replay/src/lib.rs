#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions)]

//! Deterministic record and replay of a run's external inputs.
//!
//! A replay log starts with the 8 byte big-endian RNG seed, followed by a
//! stream of framed [`Packet`]s in the order the inputs were consumed:
//!
//! * the address assigned at startup (a `REPLAY` packet of kind
//!   [`ReplayKind::Addr`] whose destination is the address)
//! * every line of operator input ([`ReplayKind::User`], the line as payload)
//! * every inbound packet, verbatim
//! * a [`ReplayKind::Null`] sentinel closing each round's batch of inbound
//!   packets, so replay can tell "no more packets this round" apart from
//!   "not arrived yet"
//!
//! Recording and replaying may be combined, replaying one log while
//! recording another.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{BufRead, BufReader, BufWriter, ErrorKind, Read, Write},
    path::{Path, PathBuf},
};

use relaynet_packet::{Address, BROADCAST, MAX_PAYLOAD_SIZE, Packet, PacketError};
use strum_macros::{FromRepr, IntoStaticStr};
use thiserror::Error;

/// Protocol values of `REPLAY` control packets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, IntoStaticStr)]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum ReplayKind {
    /// End of the current round's inbound packets.
    Null = 0,
    /// Address assigned by the relay.
    Addr = 1,
    /// One line of operator input.
    User = 2,
}

#[derive(Debug, Error)]
pub enum ReplayError {
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Packet(#[from] PacketError),
    #[error("Replay output file {} already exists", .0.display())]
    OutputExists(PathBuf),
    #[error("Reached end of deterministic replay")]
    EndOfLog,
    #[error("Expected a {expected} record in the replay log but found {found}")]
    Unexpected {
        expected: &'static str,
        found: String,
    },
}

/// Source of every non-deterministic input a scheduler consumes.
///
/// In live mode lines come from the wrapped line source (normally stdin). In
/// replay mode they come from the replay log instead, and when recording each
/// consumed input is appended to the output log.
pub struct Replay {
    seed: u64,
    input: Option<Box<dyn Read + Send>>,
    output: Option<Box<dyn Write + Send>>,
    lines: Box<dyn BufRead + Send>,
}

impl fmt::Debug for Replay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Replay")
            .field("seed", &self.seed)
            .field("replaying", &self.is_replaying())
            .field("recording", &self.is_recording())
            .finish_non_exhaustive()
    }
}

impl Replay {
    /// Live input with no recording.
    #[must_use]
    pub fn live(seed: u64, lines: impl BufRead + Send + 'static) -> Self {
        Self {
            seed,
            input: None,
            output: None,
            lines: Box::new(lines),
        }
    }

    /// Opens the replay input and/or output logs.
    ///
    /// When `input` is given its recorded seed replaces `seed`. When `output`
    /// is given the file must not exist yet.
    ///
    /// # Errors
    ///
    /// * If `output` already exists
    /// * If either file cannot be opened
    /// * If the input log is too short to hold a seed
    pub fn open(
        seed: u64,
        input: Option<&Path>,
        output: Option<&Path>,
        lines: impl BufRead + Send + 'static,
    ) -> Result<Self, ReplayError> {
        let input = input
            .map(|path| {
                log::debug!("open: replaying from path={}", path.display());
                File::open(path).map(|file| Box::new(BufReader::new(file)) as Box<dyn Read + Send>)
            })
            .transpose()?;

        let output = output
            .map(|path| {
                log::debug!("open: recording to path={}", path.display());
                OpenOptions::new()
                    .write(true)
                    .create_new(true)
                    .open(path)
                    .map(|file| Box::new(BufWriter::new(file)) as Box<dyn Write + Send>)
                    .map_err(|e| {
                        if e.kind() == ErrorKind::AlreadyExists {
                            ReplayError::OutputExists(path.to_path_buf())
                        } else {
                            ReplayError::Io(e)
                        }
                    })
            })
            .transpose()?;

        Self::from_streams(seed, input, output, lines)
    }

    /// Builds a replay over arbitrary streams.
    ///
    /// # Errors
    ///
    /// * If the input log is too short to hold a seed
    /// * If the seed cannot be written to the output log
    pub fn from_streams(
        seed: u64,
        mut input: Option<Box<dyn Read + Send>>,
        mut output: Option<Box<dyn Write + Send>>,
        lines: impl BufRead + Send + 'static,
    ) -> Result<Self, ReplayError> {
        let seed = match &mut input {
            Some(input) => {
                let mut raw = [0u8; 8];
                input.read_exact(&mut raw).map_err(|e| {
                    if e.kind() == ErrorKind::UnexpectedEof {
                        ReplayError::EndOfLog
                    } else {
                        ReplayError::Io(e)
                    }
                })?;
                let recorded = u64::from_be_bytes(raw);
                log::debug!("from_streams: using recorded seed={recorded}");
                recorded
            }
            None => seed,
        };

        if let Some(output) = &mut output {
            output.write_all(&seed.to_be_bytes())?;
        }

        Ok(Self {
            seed,
            input,
            output,
            lines: Box::new(lines),
        })
    }

    #[must_use]
    pub const fn seed(&self) -> u64 {
        self.seed
    }

    #[must_use]
    pub const fn is_replaying(&self) -> bool {
        self.input.is_some()
    }

    #[must_use]
    pub const fn is_recording(&self) -> bool {
        self.output.is_some()
    }

    /// Reads one line of operator input, without its line terminator.
    ///
    /// Returns `Ok(None)` when the live line source is exhausted.
    ///
    /// # Errors
    ///
    /// * [`ReplayError::EndOfLog`] if the replay log is exhausted
    /// * If the replay log holds something other than a line here
    /// * If reading or recording fails
    pub fn read_line(&mut self) -> Result<Option<String>, ReplayError> {
        let line = if self.is_replaying() {
            let packet = self.next_record(ReplayKind::User)?;
            String::from_utf8_lossy(packet.payload()).into_owned()
        } else {
            let mut line = String::new();
            loop {
                line.clear();
                if self.lines.read_line(&mut line)? == 0 {
                    return Ok(None);
                }
                let trimmed = line.trim_end_matches(['\n', '\r']).len();
                line.truncate(trimmed);
                if line.len() <= MAX_PAYLOAD_SIZE {
                    break line;
                }
                log::warn!(
                    "Ignoring input line of {} bytes, the limit is {MAX_PAYLOAD_SIZE}",
                    line.len()
                );
            }
        };

        self.record(&Packet::replay(
            BROADCAST,
            ReplayKind::User as u8,
            line.clone().into_bytes(),
        )?)?;

        Ok(Some(line))
    }

    /// Returns the address recorded at startup.
    ///
    /// # Errors
    ///
    /// * [`ReplayError::EndOfLog`] if the replay log is exhausted
    /// * If the next record is not an address assignment
    pub fn next_addr(&mut self) -> Result<Address, ReplayError> {
        Ok(self.next_record(ReplayKind::Addr)?.dest())
    }

    /// Records the address assigned by the relay.
    ///
    /// # Errors
    ///
    /// * If writing the record fails
    pub fn record_addr(&mut self, addr: Address) -> Result<(), ReplayError> {
        self.record(&Packet::replay(addr, ReplayKind::Addr as u8, Vec::new())?)
    }

    /// Returns the next recorded inbound packet of the current round, or
    /// `None` once the round's sentinel is reached.
    ///
    /// # Errors
    ///
    /// * [`ReplayError::EndOfLog`] if the replay log is exhausted
    /// * If the log holds an operator line or address here
    pub fn next_packet(&mut self) -> Result<Option<Packet>, ReplayError> {
        let packet = self.read_record()?;

        if !packet.is_replay() {
            return Ok(Some(packet));
        }

        match ReplayKind::from_repr(packet.protocol()) {
            Some(ReplayKind::Null) => Ok(None),
            other => Err(unexpected(ReplayKind::Null, other, &packet)),
        }
    }

    /// Records one inbound packet.
    ///
    /// # Errors
    ///
    /// * If writing the record fails
    pub fn record_packet(&mut self, packet: &Packet) -> Result<(), ReplayError> {
        self.record(packet)
    }

    /// Records the end of the current round's inbound packets.
    ///
    /// # Errors
    ///
    /// * If writing the record fails
    pub fn record_round_end(&mut self) -> Result<(), ReplayError> {
        self.record(&Packet::replay(
            BROADCAST,
            ReplayKind::Null as u8,
            Vec::new(),
        )?)
    }

    /// # Errors
    ///
    /// * If flushing the output log fails
    pub fn flush(&mut self) -> Result<(), ReplayError> {
        if let Some(output) = &mut self.output {
            output.flush()?;
        }
        Ok(())
    }

    fn record(&mut self, packet: &Packet) -> Result<(), ReplayError> {
        if let Some(output) = &mut self.output {
            output.write_all(&packet.pack())?;
        }
        Ok(())
    }

    fn read_record(&mut self) -> Result<Packet, ReplayError> {
        let Some(input) = &mut self.input else {
            return Err(ReplayError::Unexpected {
                expected: "replay log",
                found: "live input".to_string(),
            });
        };

        Packet::read_from(input)?.ok_or(ReplayError::EndOfLog)
    }

    fn next_record(&mut self, kind: ReplayKind) -> Result<Packet, ReplayError> {
        let packet = self.read_record()?;
        let found = packet
            .is_replay()
            .then(|| ReplayKind::from_repr(packet.protocol()))
            .flatten();

        if found == Some(kind) {
            Ok(packet)
        } else {
            Err(unexpected(kind, found, &packet))
        }
    }
}

impl Drop for Replay {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::warn!("drop: failed to flush replay log: {e:?}");
        }
    }
}

fn unexpected(expected: ReplayKind, found: Option<ReplayKind>, packet: &Packet) -> ReplayError {
    ReplayError::Unexpected {
        expected: expected.into(),
        found: found.map_or_else(
            || packet.to_string(),
            |kind| <&'static str>::from(kind).to_string(),
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, empty};

    use pretty_assertions::assert_eq;

    use super::*;

    #[test_log::test]
    fn live_mode_reads_lines_without_terminators() {
        let mut replay = Replay::live(5, Cursor::new("fail 1\r\n0 hello\n"));

        assert_eq!(replay.seed(), 5);
        assert!(!replay.is_replaying());
        assert_eq!(replay.read_line().unwrap().as_deref(), Some("fail 1"));
        assert_eq!(replay.read_line().unwrap().as_deref(), Some("0 hello"));
        assert_eq!(replay.read_line().unwrap(), None);
    }

    #[test_log::test]
    fn overlong_lines_are_skipped() {
        let input = format!("{}\nfail 1\n", "x".repeat(MAX_PAYLOAD_SIZE + 1));
        let mut replay = Replay::live(5, Cursor::new(input));

        assert_eq!(replay.read_line().unwrap().as_deref(), Some("fail 1"));
        assert_eq!(replay.read_line().unwrap(), None);
    }

    #[test_log::test]
    fn recorded_inputs_replay_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run.replay");
        let inbound = Packet::new(3, 1, 4, &b"ping"[..]).unwrap();

        {
            let mut recorder =
                Replay::open(42, None, Some(log_path.as_path()), Cursor::new("start 0\ntime\n")).unwrap();
            recorder.record_addr(3).unwrap();
            assert_eq!(recorder.read_line().unwrap().as_deref(), Some("start 0"));
            recorder.record_packet(&inbound).unwrap();
            recorder.record_round_end().unwrap();
            recorder.record_round_end().unwrap();
            assert_eq!(recorder.read_line().unwrap().as_deref(), Some("time"));
        }

        let mut player = Replay::open(0, Some(log_path.as_path()), None, empty()).unwrap();

        assert_eq!(player.seed(), 42);
        assert_eq!(player.next_addr().unwrap(), 3);
        assert_eq!(player.read_line().unwrap().as_deref(), Some("start 0"));
        assert_eq!(player.next_packet().unwrap(), Some(inbound));
        assert_eq!(player.next_packet().unwrap(), None);
        assert_eq!(player.next_packet().unwrap(), None);
        assert_eq!(player.read_line().unwrap().as_deref(), Some("time"));
        assert!(matches!(player.read_line(), Err(ReplayError::EndOfLog)));
    }

    #[test_log::test]
    fn existing_output_is_a_hard_error() {
        let dir = tempfile::tempdir().unwrap();
        let log_path = dir.path().join("run.replay");
        std::fs::write(&log_path, b"old").unwrap();

        let err = Replay::open(1, None, Some(log_path.as_path()), empty()).unwrap_err();

        assert!(matches!(err, ReplayError::OutputExists(path) if path == log_path));
        assert_eq!(std::fs::read(&log_path).unwrap(), b"old");
    }

    #[test_log::test]
    fn replaying_while_recording_copies_the_log() {
        let dir = tempfile::tempdir().unwrap();
        let first = dir.path().join("first.replay");
        let second = dir.path().join("second.replay");

        {
            let mut recorder = Replay::open(9, None, Some(first.as_path()), Cursor::new("echo hi\n")).unwrap();
            recorder.read_line().unwrap();
        }
        {
            let mut both = Replay::open(0, Some(first.as_path()), Some(second.as_path()), empty()).unwrap();
            assert_eq!(both.read_line().unwrap().as_deref(), Some("echo hi"));
        }

        assert_eq!(std::fs::read(&first).unwrap(), std::fs::read(&second).unwrap());
    }

    #[test_log::test]
    fn mismatched_record_kind_is_reported() {
        let mut log = 7u64.to_be_bytes().to_vec();
        log.extend_from_slice(&Packet::replay(BROADCAST, ReplayKind::User as u8, &b"x"[..]).unwrap().pack());

        let mut player =
            Replay::from_streams(0, Some(Box::new(Cursor::new(log))), None, empty()).unwrap();

        assert!(matches!(
            player.next_packet(),
            Err(ReplayError::Unexpected { expected: "NULL", found }) if found == "USER"
        ));
    }

    #[test_log::test]
    fn short_log_has_no_seed() {
        let result = Replay::from_streams(0, Some(Box::new(Cursor::new(vec![0u8; 3]))), None, empty());

        assert!(matches!(result, Err(ReplayError::EndOfLog)));
    }
}
