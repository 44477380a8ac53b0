use std::{
    fmt,
    fs::File,
    io::{BufWriter, Write},
    path::Path,
};

/// Line-oriented writer for Synoptic trace files.
///
/// Each record is written as `<time> <event>` followed by a newline, where
/// `<time>` is either a vector clock (partially ordered trace) or a global
/// counter (totally ordered trace). A logger whose destination could not be
/// opened is disabled and silently drops records, so tracing never stops a
/// run.
pub struct TraceLogger {
    out: Option<Box<dyn Write + Send>>,
}

impl fmt::Debug for TraceLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TraceLogger")
            .field("enabled", &self.is_enabled())
            .finish()
    }
}

impl Default for TraceLogger {
    fn default() -> Self {
        Self::disabled()
    }
}

impl TraceLogger {
    #[must_use]
    pub fn new(out: impl Write + Send + 'static) -> Self {
        Self {
            out: Some(Box::new(out)),
        }
    }

    #[must_use]
    pub const fn disabled() -> Self {
        Self { out: None }
    }

    /// Creates (or truncates) `path` and logs to it.
    ///
    /// Failing to create the file is reported with `log::warn!` and yields a
    /// disabled logger.
    #[must_use]
    pub fn create(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref();
        match File::create(path) {
            Ok(file) => {
                log::debug!("create: writing trace to path={}", path.display());
                Self::new(BufWriter::new(file))
            }
            Err(e) => {
                log::warn!(
                    "create: unable to open trace file path={}: {e:?}",
                    path.display()
                );
                Self::disabled()
            }
        }
    }

    #[must_use]
    pub const fn is_enabled(&self) -> bool {
        self.out.is_some()
    }

    /// Appends one `<time> <event>` record.
    pub fn log(&mut self, time: impl fmt::Display, event: impl fmt::Display) {
        let Some(out) = &mut self.out else {
            return;
        };

        if let Err(e) = writeln!(out, "{time} {event}") {
            log::warn!("log: failed to write trace record, disabling trace: {e:?}");
            self.out = None;
        }
    }

    pub fn flush(&mut self) {
        if let Some(out) = &mut self.out
            && let Err(e) = out.flush()
        {
            log::warn!("flush: failed to flush trace: {e:?}");
        }
    }
}

impl Drop for TraceLogger {
    fn drop(&mut self) {
        self.flush();
    }
}
