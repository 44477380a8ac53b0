//! Per-node persistent files.
//!
//! Every mutating operation first gives the scheduler a chance to crash the
//! node (so algorithms can be tested against crashes between writes) and
//! every operation is recorded through the storage audit hooks.

use std::{
    fs::{self, OpenOptions},
    io::Write as _,
    path::PathBuf,
};

use thiserror::Error;

use crate::{Context, NodeCrash};

#[derive(Debug, Error)]
pub enum StorageError {
    #[error(transparent)]
    Crash(#[from] NodeCrash),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// Returns the crash signal if the node was crashed by this operation.
    #[must_use]
    pub const fn crash(&self) -> Option<NodeCrash> {
        match self {
            Self::Crash(crash) => Some(*crash),
            Self::Io(_) => None,
        }
    }
}

/// File access scoped to the calling node's storage directory.
pub struct Storage<'a, T> {
    ctx: &'a mut dyn Context<T>,
}

impl<'a, T> Storage<'a, T> {
    #[must_use]
    pub fn new(ctx: &'a mut dyn Context<T>) -> Self {
        Self { ctx }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.ctx.storage_dir().join(name)
    }

    /// Replaces the contents of `name`.
    ///
    /// # Errors
    ///
    /// * If the node is crashed before the write
    /// * If the file cannot be written
    pub fn write(&mut self, name: &str, contents: &[u8]) -> Result<(), StorageError> {
        self.ctx.check_write_crash(&format!("write {name}"))?;
        fs::create_dir_all(self.ctx.storage_dir())?;
        fs::write(self.path(name), contents)?;
        self.ctx.storage_write_event(&format!("write {name}"));
        Ok(())
    }

    /// Appends to `name`, creating it if needed.
    ///
    /// # Errors
    ///
    /// * If the node is crashed before the write
    /// * If the file cannot be written
    pub fn append(&mut self, name: &str, contents: &[u8]) -> Result<(), StorageError> {
        self.ctx.check_write_crash(&format!("append {name}"))?;
        fs::create_dir_all(self.ctx.storage_dir())?;
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.path(name))?
            .write_all(contents)?;
        self.ctx.storage_write_event(&format!("append {name}"));
        Ok(())
    }

    /// # Errors
    ///
    /// * If the file cannot be read
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>, StorageError> {
        self.ctx.storage_read_event(&format!("read {name}"));
        Ok(fs::read(self.path(name))?)
    }

    /// # Errors
    ///
    /// * If the file cannot be read or is not UTF-8
    pub fn read_to_string(&mut self, name: &str) -> Result<String, StorageError> {
        self.ctx.storage_read_event(&format!("read {name}"));
        Ok(fs::read_to_string(self.path(name))?)
    }

    #[must_use]
    pub fn exists(&self, name: &str) -> bool {
        self.path(name).exists()
    }

    /// # Errors
    ///
    /// * If the node is crashed before the delete
    /// * If the file cannot be removed
    pub fn delete(&mut self, name: &str) -> Result<(), StorageError> {
        self.ctx.check_write_crash(&format!("delete {name}"))?;
        fs::remove_file(self.path(name))?;
        self.ctx.storage_write_event(&format!("delete {name}"));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use pretty_assertions::assert_eq;

    use crate::{Address, NodeResult, SendError};

    use super::*;

    struct Recorder {
        dir: PathBuf,
        crash_on: Option<&'static str>,
        events: Vec<String>,
    }

    impl Recorder {
        fn new(dir: &Path) -> Self {
            Self {
                dir: dir.to_path_buf(),
                crash_on: None,
                events: vec![],
            }
        }
    }

    impl Context<()> for Recorder {
        fn addr(&self) -> Address {
            4
        }

        fn now(&self) -> u64 {
            0
        }

        fn send(&mut self, _to: Address, _protocol: u8, _payload: &[u8]) -> Result<(), SendError> {
            Ok(())
        }

        fn add_timeout(&mut self, _delay: i64, _timer: ()) {}

        fn log_event(&mut self, event: &str) {
            self.events.push(event.to_string());
        }

        fn check_write_crash(&mut self, description: &str) -> NodeResult {
            self.events.push(format!("CHECK {description}"));
            if self.crash_on == Some(description) {
                return Err(self.crash());
            }
            Ok(())
        }

        fn storage_write_event(&mut self, description: &str) {
            self.events.push(format!("WRITE {description}"));
        }

        fn storage_read_event(&mut self, description: &str) {
            self.events.push(format!("READ {description}"));
        }

        fn storage_dir(&self) -> PathBuf {
            self.dir.join("4")
        }
    }

    #[test_log::test]
    fn writes_are_checked_then_audited() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Recorder::new(dir.path());

        let mut storage = Storage::<()>::new(&mut ctx);
        storage.write("log", b"a").unwrap();
        storage.append("log", b"b").unwrap();
        assert_eq!(storage.read_to_string("log").unwrap(), "ab");
        assert!(storage.exists("log"));
        storage.delete("log").unwrap();
        assert!(!storage.exists("log"));

        assert_eq!(
            ctx.events,
            vec![
                "CHECK write log",
                "WRITE write log",
                "CHECK append log",
                "WRITE append log",
                "READ read log",
                "CHECK delete log",
                "WRITE delete log",
            ]
        );
    }

    #[test_log::test]
    fn crash_before_write_leaves_file_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut ctx = Recorder::new(dir.path());
        Storage::<()>::new(&mut ctx).write("state", b"old").unwrap();
        ctx.crash_on = Some("write state");

        let err = Storage::<()>::new(&mut ctx).write("state", b"new").unwrap_err();

        assert_eq!(err.crash(), Some(NodeCrash::new(4)));
        assert_eq!(std::fs::read(dir.path().join("4").join("state")).unwrap(), b"old");
    }
}
