//! Pseudo-terminal process spawning.
//!
//! Agent binaries are run inside a pty so they behave as they would in an
//! interactive terminal (line buffering, interrupt handling). This module
//! hides the pty library behind two small traits:
//!
//! - [`PtySpawner`] turns a [`SpawnCommand`] into a [`SpawnedProcess`]
//! - [`PtyChild`] is the handle used to poll and kill the process
//!
//! [`NativePtySpawner`] is the real implementation. Tests substitute their
//! own spawner so adapter behaviour can be driven without a subprocess.

use portable_pty::{native_pty_system, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use std::io::{self, Read, Write};
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur while starting a process.
#[derive(Debug, Error)]
pub enum SpawnError {
    #[error("failed to open pseudo-terminal: {0}")]
    Pty(String),

    #[error("failed to spawn {program}: {message}")]
    Spawn { program: String, message: String },

    #[error("failed to attach to pseudo-terminal: {0}")]
    Attach(String),
}

/// Exit status reported when a process terminates.
///
/// `code` is `None` when the platform could not report one (for example
/// the process was killed by a signal).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ProcessExit {
    pub code: Option<i32>,
}

/// A fully resolved command line ready to be spawned.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpawnCommand {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl SpawnCommand {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            env: Vec::new(),
        }
    }

    /// Set the working directory.
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Add an environment variable. Later entries win.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env
            .extend(vars.into_iter().map(|(k, v)| (k.into(), v.into())));
        self
    }

    /// Value of an environment variable set on this command.
    pub fn env_value(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Handle to a running child process.
pub trait PtyChild: Send {
    /// Poll for exit without blocking.
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>>;

    /// Kill the process (and its process group where supported).
    fn kill(&mut self) -> io::Result<()>;

    fn process_id(&self) -> Option<u32>;
}

/// A process running inside a pseudo-terminal.
///
/// `reader` yields everything the process writes to the terminal; `writer`
/// feeds the terminal's input.
pub struct SpawnedProcess {
    pub reader: Box<dyn Read + Send>,
    pub writer: Box<dyn Write + Send>,
    pub child: Box<dyn PtyChild>,
}

/// Something that can start processes inside a pseudo-terminal.
pub trait PtySpawner: Send + Sync {
    fn spawn(&self, command: &SpawnCommand) -> Result<SpawnedProcess, SpawnError>;
}

/// [`PtySpawner`] backed by the operating system's pty implementation.
#[derive(Debug, Clone, Copy)]
pub struct NativePtySpawner {
    pub cols: u16,
    pub rows: u16,
}

impl Default for NativePtySpawner {
    fn default() -> Self {
        // Wide enough that most JSON lines are not wrapped by the terminal.
        Self {
            cols: 32767,
            rows: 40,
        }
    }
}

impl PtySpawner for NativePtySpawner {
    fn spawn(&self, command: &SpawnCommand) -> Result<SpawnedProcess, SpawnError> {
        let pair = native_pty_system()
            .openpty(PtySize {
                rows: self.rows,
                cols: self.cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SpawnError::Pty(e.to_string()))?;

        let mut builder = CommandBuilder::new(&command.program);
        builder.args(&command.args);
        if let Some(cwd) = &command.cwd {
            builder.cwd(cwd);
        }
        for (key, value) in &command.env {
            builder.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(builder)
            .map_err(|e| SpawnError::Spawn {
                program: command.program.clone(),
                message: e.to_string(),
            })?;
        // Only the child should hold the slave side, otherwise the reader
        // never sees end-of-file.
        drop(pair.slave);

        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SpawnError::Attach(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SpawnError::Attach(e.to_string()))?;

        log::debug!(
            "spawned {} (pid {:?}) in pty",
            command.program,
            child.process_id()
        );

        Ok(SpawnedProcess {
            reader,
            writer,
            child: Box::new(NativeChild {
                child,
                _master: pair.master,
            }),
        })
    }
}

struct NativeChild {
    child: Box<dyn portable_pty::Child + Send + Sync>,
    // Closing the master hangs up the terminal, so it lives as long as the child.
    _master: Box<dyn MasterPty + Send>,
}

impl PtyChild for NativeChild {
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(self.child.try_wait()?.map(|status| ProcessExit {
            code: i32::try_from(status.exit_code()).ok(),
        }))
    }

    fn kill(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        if let Some(pid) = self.child.process_id() {
            // The pty makes the child a session leader, so its pid is also
            // its process group id.
            unsafe {
                libc::killpg(pid as libc::pid_t, libc::SIGKILL);
            }
        }
        match self.child.kill() {
            Ok(()) => Ok(()),
            // Already reaped by the group kill above.
            Err(e) if e.kind() == io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e),
        }
    }

    fn process_id(&self) -> Option<u32> {
        self.child.process_id()
    }
}

// ============================================================================
// TESTS
// ============================================================================
