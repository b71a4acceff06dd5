//! Test doubles shared by the adapter and manager tests.

use crate::adapter::{AdapterServices, Completion, FailureKind, PermissionRequestEvent, ProgressUpdate};
use crate::provider::{BinaryResolver, Credentials, CredentialProvider, ResolvedBinary};
use crate::spawn::{ProcessExit, PtyChild, PtySpawner, SpawnCommand, SpawnError, SpawnedProcess};
use crate::task::{TaskCallbacks, TaskMessage, TaskStatus};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

pub const WAIT: Duration = Duration::from_secs(5);

/// Poll `condition` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    condition()
}

// ============================================================================
// Fake process
// ============================================================================

struct ProcessShared {
    command: SpawnCommand,
    output: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    written: Mutex<Vec<u8>>,
    exit: Mutex<Option<ProcessExit>>,
    killed: AtomicBool,
}

/// Test-side handle to a spawned fake process.
#[derive(Clone)]
pub struct FakeProcess {
    shared: Arc<ProcessShared>,
}

impl FakeProcess {
    pub fn command(&self) -> &SpawnCommand {
        &self.shared.command
    }

    /// Write `text` to the process's terminal output.
    pub fn emit(&self, text: &str) {
        if let Some(tx) = self.shared.output.lock().unwrap().as_ref() {
            let _ = tx.send(text.as_bytes().to_vec());
        }
    }

    pub fn emit_bytes(&self, bytes: &[u8]) {
        if let Some(tx) = self.shared.output.lock().unwrap().as_ref() {
            let _ = tx.send(bytes.to_vec());
        }
    }

    /// Close the terminal (EOF) and exit with `code`.
    pub fn exit(&self, code: Option<i32>) {
        self.shared.output.lock().unwrap().take();
        *self.shared.exit.lock().unwrap() = Some(ProcessExit { code });
    }

    /// Exit but keep the terminal open, as when a grandchild holds it.
    pub fn exit_keeping_output_open(&self, code: Option<i32>) {
        *self.shared.exit.lock().unwrap() = Some(ProcessExit { code });
    }

    /// Everything written to the process's input.
    pub fn written(&self) -> String {
        String::from_utf8_lossy(&self.shared.written.lock().unwrap()).into_owned()
    }

    pub fn was_killed(&self) -> bool {
        self.shared.killed.load(Ordering::SeqCst)
    }
}

struct ChannelReader {
    rx: mpsc::Receiver<Vec<u8>>,
    pending: Vec<u8>,
}

impl Read for ChannelReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.pending.is_empty() {
            match self.rx.recv() {
                Ok(chunk) => self.pending = chunk,
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.pending.len());
        buf[..n].copy_from_slice(&self.pending[..n]);
        self.pending.drain(..n);
        Ok(n)
    }
}

struct SharedWriter(Arc<ProcessShared>);

impl Write for SharedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.written.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

struct FakeChild(Arc<ProcessShared>);

impl PtyChild for FakeChild {
    fn try_wait(&mut self) -> io::Result<Option<ProcessExit>> {
        Ok(*self.0.exit.lock().unwrap())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.0.killed.store(true, Ordering::SeqCst);
        self.0.output.lock().unwrap().take();
        self.0.exit.lock().unwrap().get_or_insert(ProcessExit { code: None });
        Ok(())
    }

    fn process_id(&self) -> Option<u32> {
        Some(4242)
    }
}

// ============================================================================
// Fake spawner
// ============================================================================

/// Records every spawn and hands out [`FakeProcess`] handles.
#[derive(Default)]
pub struct FakeSpawner {
    processes: Mutex<Vec<FakeProcess>>,
    spawned: Condvar,
    fail_with: Option<String>,
}

impl FakeSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn failing(message: &str) -> Arc<Self> {
        Arc::new(Self {
            fail_with: Some(message.to_string()),
            ..Self::default()
        })
    }

    pub fn spawn_count(&self) -> usize {
        self.processes.lock().unwrap().len()
    }

    /// The `index`-th spawned process, waiting for it if necessary.
    pub fn process(&self, index: usize) -> FakeProcess {
        let guard = self.processes.lock().unwrap();
        let (guard, _) = self
            .spawned
            .wait_timeout_while(guard, WAIT, |p| p.len() <= index)
            .unwrap();
        guard
            .get(index)
            .cloned()
            .unwrap_or_else(|| panic!("process {} was never spawned", index))
    }
}

impl PtySpawner for FakeSpawner {
    fn spawn(&self, command: &SpawnCommand) -> Result<SpawnedProcess, SpawnError> {
        if let Some(message) = &self.fail_with {
            return Err(SpawnError::Spawn {
                program: command.program.clone(),
                message: message.clone(),
            });
        }

        let (tx, rx) = mpsc::channel();
        let shared = Arc::new(ProcessShared {
            command: command.clone(),
            output: Mutex::new(Some(tx)),
            written: Mutex::new(Vec::new()),
            exit: Mutex::new(None),
            killed: AtomicBool::new(false),
        });

        self.processes.lock().unwrap().push(FakeProcess {
            shared: Arc::clone(&shared),
        });
        self.spawned.notify_all();

        Ok(SpawnedProcess {
            reader: Box::new(ChannelReader {
                rx,
                pending: Vec::new(),
            }),
            writer: Box::new(SharedWriter(Arc::clone(&shared))),
            child: Box::new(FakeChild(shared)),
        })
    }
}

// ============================================================================
// Collaborators
// ============================================================================

pub struct StaticResolver(pub Result<ResolvedBinary, String>);

impl StaticResolver {
    pub fn found() -> Arc<Self> {
        Arc::new(Self(Ok(ResolvedBinary {
            command: "/opt/agent/bin/agent".to_string(),
            args: Vec::new(),
        })))
    }

    pub fn missing() -> Arc<Self> {
        Arc::new(Self(Err("agent not found on PATH".to_string())))
    }
}

impl BinaryResolver for StaticResolver {
    fn resolve(&self) -> Result<ResolvedBinary, String> {
        self.0.clone()
    }
}

pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn credentials(&self) -> Result<Credentials, String> {
        Ok(Credentials::default())
    }
}

pub fn services(spawner: Arc<FakeSpawner>) -> AdapterServices {
    AdapterServices::new(spawner, StaticResolver::found()).with_credentials(Arc::new(NoCredentials))
}

// ============================================================================
// Recording callbacks
// ============================================================================

#[derive(Debug, Clone, PartialEq)]
pub enum Recorded {
    Message(String, TaskMessage),
    Progress(ProgressUpdate),
    ToolUse(String, String),
    ToolResult(String, Option<String>, bool),
    Permission(PermissionRequestEvent),
    Complete(String, Completion),
    Error(String, FailureKind, String),
    Status(String, TaskStatus),
    Debug(String, String),
}

#[derive(Default)]
pub struct RecordingCallbacks {
    events: Mutex<Vec<Recorded>>,
}

impl RecordingCallbacks {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Recorded> {
        self.events.lock().unwrap().clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().unwrap().len()
    }

    pub fn completions(&self, task_id: &str) -> Vec<Completion> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Complete(id, c) if id == task_id => Some(c),
                _ => None,
            })
            .collect()
    }

    pub fn errors(&self, task_id: &str) -> Vec<(FailureKind, String)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Error(id, kind, message) if id == task_id => Some((kind, message)),
                _ => None,
            })
            .collect()
    }

    pub fn statuses(&self) -> Vec<(String, TaskStatus)> {
        self.events()
            .into_iter()
            .filter_map(|e| match e {
                Recorded::Status(id, status) => Some((id, status)),
                _ => None,
            })
            .collect()
    }

    fn push(&self, event: Recorded) {
        self.events.lock().unwrap().push(event);
    }
}

impl TaskCallbacks for RecordingCallbacks {
    fn on_message(&self, task_id: &str, message: &TaskMessage) {
        self.push(Recorded::Message(task_id.to_string(), message.clone()));
    }

    fn on_progress(&self, update: &ProgressUpdate) {
        self.push(Recorded::Progress(update.clone()));
    }

    fn on_tool_use(&self, task_id: &str, name: &str, _input: &Value) {
        self.push(Recorded::ToolUse(task_id.to_string(), name.to_string()));
    }

    fn on_tool_result(&self, task_id: &str, name: Option<&str>, _output: &Value, is_error: bool) {
        self.push(Recorded::ToolResult(
            task_id.to_string(),
            name.map(str::to_string),
            is_error,
        ));
    }

    fn on_permission_request(&self, request: &PermissionRequestEvent) {
        self.push(Recorded::Permission(request.clone()));
    }

    fn on_complete(&self, task_id: &str, completion: &Completion) {
        self.push(Recorded::Complete(task_id.to_string(), completion.clone()));
    }

    fn on_error(&self, task_id: &str, kind: FailureKind, message: &str) {
        self.push(Recorded::Error(task_id.to_string(), kind, message.to_string()));
    }

    fn on_status_change(&self, task_id: &str, status: TaskStatus) {
        self.push(Recorded::Status(task_id.to_string(), status));
    }

    fn on_debug(&self, task_id: &str, message: &str, _data: Option<&Value>) {
        self.push(Recorded::Debug(task_id.to_string(), message.to_string()));
    }
}
