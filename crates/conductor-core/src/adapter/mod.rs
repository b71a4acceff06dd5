//! Process adapter: one agent subprocess per task.
//!
//! # Lifecycle
//!
//! ```text
//! new ──start──► setup (resolve, provision, credentials, config)
//!                  │
//!                  ▼
//!               spawn ──► pump thread:  pty read → decode → strip → parser → events
//!                  │      exit watcher: try_wait every 100ms
//!                  ▼
//!        EOF + exit observed ──► handle_exit ──► Complete / Error
//! ```
//!
//! `cancel` kills immediately and silences the adapter; `interrupt` asks the
//! agent to stop and lets it exit on its own. `dispose` releases everything
//! and is safe to call any number of times.
//!
//! Events go out on the `std::sync::mpsc` channel given to [`ProcessAdapter::new`].
//! At most one terminal event (`Complete` or `Error`) is ever sent.

mod config;
mod evaluate;
mod event;

pub use config::{
    build_env, AdapterServices, BridgePorts, TaskConfig, AGENT_CONFIG_ENV, PERMISSION_PORT_ENV,
    QUESTION_PORT_ENV, TASK_ID_ENV,
};
pub use evaluate::{evaluate, evaluate_with_timeout, EVALUATION_TIMEOUT};
pub use event::{
    AdapterEvent, Completion, CompletionStatus, FailureKind, PermissionKind,
    PermissionRequestEvent, ProgressStage, ProgressUpdate,
};

use crate::bridge::{new_request_id, QUESTION_PREFIX};
use crate::logging::{self, Direction, TranscriptHandle};
use crate::shell::build_spawn_command;
use crate::spawn::{ProcessExit, PtyChild, SpawnError};
use crate::stream::{AnsiStripper, FinishReason, ParseOutput, StreamMessage, StreamParser, Utf8Decoder};
use crate::task::{Task, TaskMessage, TaskStatus};
use serde_json::Value;
use std::io::{self, Read, Write};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};
use thiserror::Error;

/// How often the exit watcher polls the child.
const EXIT_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// How long to wait for the output stream to drain after the process exits.
const EXIT_GRACE: Duration = Duration::from_secs(2);

const INTERRUPT_BYTE: &[u8] = &[0x03];

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("adapter has been disposed")]
    Disposed,

    #[error("agent binary not found: {0}")]
    BinaryNotFound(String),

    #[error("setup step '{step}' failed: {message}")]
    Setup { step: String, message: String },

    #[error(transparent)]
    Spawn(#[from] SpawnError),

    #[error("agent process is not running")]
    NotRunning,

    #[error("failed to write to agent: {0}")]
    Io(#[from] io::Error),

    #[error("timed out after {0:?}")]
    Timeout(Duration),

    #[error("agent failed: {0}")]
    Failed(String),
}

impl AdapterError {
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            AdapterError::BinaryNotFound(_) => FailureKind::BinaryNotFound,
            AdapterError::Setup { .. } => FailureKind::Setup,
            AdapterError::Spawn(_) => FailureKind::Spawn,
            AdapterError::Failed(_) => FailureKind::Process,
            _ => FailureKind::Other,
        }
    }
}

struct AdapterState {
    task: Task,
    current_session_id: Option<String>,
    has_completed: bool,
    is_disposed: bool,
    was_interrupted: bool,
    /// Real assistant text has been seen since the last step boundary.
    text_in_step: bool,
    child: Option<Box<dyn PtyChild>>,
    writer: Option<Box<dyn Write + Send>>,
    sender: Option<Sender<AdapterEvent>>,
    transcript: TranscriptHandle,
    /// Bumped on every start/cancel/dispose so stale threads stop.
    generation: u64,
    exit_status: Option<ProcessExit>,
    stream_closed: bool,
    exit_handled: bool,
}

impl AdapterState {
    fn emit(&self, event: AdapterEvent) {
        let Some(sender) = &self.sender else {
            return;
        };
        if let Ok(json) = serde_json::to_string(&event) {
            logging::write_line(&self.transcript, Direction::Event, &json);
        }
        let _ = sender.send(event);
    }

    /// Send a terminal event unless one was already sent.
    fn finish(&mut self, event: AdapterEvent) {
        if self.has_completed {
            log::debug!("task {} already completed, dropping {:?}", self.task.id, event);
            return;
        }
        self.has_completed = true;
        let status = match &event {
            AdapterEvent::Complete(c) => match c.status {
                CompletionStatus::Success => TaskStatus::Completed,
                CompletionStatus::Interrupted => TaskStatus::Interrupted,
                CompletionStatus::Error => TaskStatus::Failed,
            },
            _ => TaskStatus::Failed,
        };
        self.task.set_status(status);
        log::info!("task {} finished: {}", self.task.id, status);
        self.emit(event);
    }

    fn completion(&self, status: CompletionStatus, error: Option<String>) -> AdapterEvent {
        AdapterEvent::Complete(Completion {
            status,
            session_id: self.current_session_id.clone(),
            error,
        })
    }

    fn kill_child(&mut self) {
        if let Some(mut child) = self.child.take() {
            if let Err(e) = child.kill() {
                log::warn!("failed to kill agent for task {}: {}", self.task.id, e);
            }
        }
        self.writer = None;
    }
}

struct AdapterInner {
    task_id: String,
    services: AdapterServices,
    state: Mutex<AdapterState>,
    parser: Mutex<StreamParser>,
}

/// Owns one agent subprocess for one task.
///
/// Cheap to clone; clones share the same process.
#[derive(Clone)]
pub struct ProcessAdapter {
    inner: Arc<AdapterInner>,
}

impl ProcessAdapter {
    pub fn new(task_id: impl Into<String>, services: AdapterServices, events: Sender<AdapterEvent>) -> Self {
        let task_id = task_id.into();
        let state = AdapterState {
            task: Task::new(task_id.clone(), "", TaskStatus::Queued),
            current_session_id: None,
            has_completed: false,
            is_disposed: false,
            was_interrupted: false,
            text_in_step: false,
            child: None,
            writer: None,
            sender: Some(events),
            transcript: logging::disabled(),
            generation: 0,
            exit_status: None,
            stream_closed: false,
            exit_handled: false,
        };
        Self {
            inner: Arc::new(AdapterInner {
                task_id,
                services,
                state: Mutex::new(state),
                parser: Mutex::new(StreamParser::new()),
            }),
        }
    }

    pub fn task_id(&self) -> &str {
        &self.inner.task_id
    }

    /// Prepare and spawn the agent.
    ///
    /// Returns once the process is running; output is handled on background
    /// threads. A failure here means the agent never started.
    pub fn start(&self, config: TaskConfig) -> Result<Task, AdapterError> {
        let result = self.inner.start(&config);
        if let Err(err) = &result {
            log::warn!("task {} failed to start: {}", self.inner.task_id, err);
            if !matches!(err, AdapterError::Disposed) {
                self.inner.state().task.set_status(TaskStatus::Failed);
            }
        }
        result
    }

    /// Write a line of input to the agent.
    pub fn send_response(&self, text: &str) -> Result<(), AdapterError> {
        let mut state = self.inner.state();
        if state.is_disposed {
            return Err(AdapterError::Disposed);
        }
        let writer = state.writer.as_mut().ok_or(AdapterError::NotRunning)?;
        writer.write_all(format!("{}\n", text).as_bytes())?;
        writer.flush()?;
        logging::write_line(&state.transcript, Direction::Stdin, text);
        Ok(())
    }

    /// Kill the agent immediately. No further events are sent.
    pub fn cancel(&self) {
        let mut state = self.inner.state();
        state.generation += 1;
        state.sender = None;
        state.kill_child();
        state.has_completed = true;
        if !state.task.status.is_terminal() {
            state.task.set_status(TaskStatus::Cancelled);
        }
        logging::write_line(&state.transcript, Direction::Event, "cancelled");
        log::info!("task {} cancelled", self.inner.task_id);
    }

    /// Ask the agent to stop. It is expected to exit on its own; a clean
    /// exit afterwards completes the task as interrupted.
    pub fn interrupt(&self) -> Result<(), AdapterError> {
        {
            let mut state = self.inner.state();
            if state.is_disposed {
                return Err(AdapterError::Disposed);
            }
            let writer = state.writer.as_mut().ok_or(AdapterError::NotRunning)?;
            writer.write_all(INTERRUPT_BYTE)?;
            writer.flush()?;
            state.was_interrupted = true;
            logging::write_line(&state.transcript, Direction::Stdin, "^C");
        }
        log::info!("task {} interrupted", self.inner.task_id);

        if cfg!(windows) {
            // Answer cmd.exe's "Terminate batch job (Y/N)?" prompt.
            let inner = Arc::clone(&self.inner);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(100));
                let mut state = inner.state();
                if let Some(writer) = state.writer.as_mut() {
                    let _ = writer.write_all(b"Y\r\n");
                    let _ = writer.flush();
                }
            });
        }
        Ok(())
    }

    /// Release the process and all state. Safe to call repeatedly.
    pub fn dispose(&self) {
        {
            let mut state = self.inner.state();
            if state.is_disposed {
                return;
            }
            state.is_disposed = true;
            state.generation += 1;
            state.kill_child();
            state.sender = None;
            state.task.messages.clear();
        }
        self.inner.parser().reset();
        log::debug!("task {} adapter disposed", self.inner.task_id);
    }

    /// Fail the task because of something observed outside the agent's own
    /// output (e.g. a provider error found in a companion log).
    pub fn report_external_error(&self, message: impl Into<String>) {
        let message = message.into();
        log::warn!("task {} external error: {}", self.inner.task_id, message);
        let mut state = self.inner.state();
        let event = state.completion(CompletionStatus::Error, Some(message));
        state.finish(event);
    }

    pub fn snapshot(&self) -> Task {
        self.inner.state().task.clone()
    }

    pub fn session_id(&self) -> Option<String> {
        self.inner.state().current_session_id.clone()
    }

    pub fn is_running(&self) -> bool {
        self.inner.state().child.is_some()
    }

    pub fn is_disposed(&self) -> bool {
        self.inner.state().is_disposed
    }
}

impl AdapterInner {
    fn state(&self) -> MutexGuard<'_, AdapterState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn parser(&self) -> MutexGuard<'_, StreamParser> {
        self.parser.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, generation: u64) -> bool {
        self.state().generation == generation
    }

    fn progress(&self, stage: ProgressStage, message: impl Into<String>) {
        let update = ProgressUpdate {
            task_id: self.task_id.clone(),
            stage,
            message: message.into(),
        };
        self.state().emit(AdapterEvent::Progress(update));
    }

    fn ensure_not_disposed(&self) -> Result<(), AdapterError> {
        if self.state().is_disposed {
            return Err(AdapterError::Disposed);
        }
        Ok(())
    }

    fn start(self: &Arc<Self>, config: &TaskConfig) -> Result<Task, AdapterError> {
        let generation = {
            let mut state = self.state();
            if state.is_disposed {
                return Err(AdapterError::Disposed);
            }
            state.kill_child();
            state.task = Task::new(self.task_id.clone(), config.prompt.clone(), TaskStatus::Running);
            state.task.set_status(TaskStatus::Running);
            state.current_session_id = None;
            state.has_completed = false;
            state.was_interrupted = false;
            state.text_in_step = false;
            state.exit_status = None;
            state.stream_closed = false;
            state.exit_handled = false;
            state.transcript =
                logging::open_transcript(self.services.log_dir.as_deref(), &self.task_id);
            state.generation += 1;
            state.generation
        };
        self.parser().reset();

        self.progress(ProgressStage::Starting, "Locating agent");
        let binary = self
            .services
            .resolver
            .resolve()
            .map_err(AdapterError::BinaryNotFound)?;

        for step in &self.services.setup_steps {
            self.ensure_not_disposed()?;
            self.progress(ProgressStage::Provisioning, format!("Preparing {}", step.name()));
            step.run(&|line| self.progress(ProgressStage::Provisioning, line))
                .map_err(|message| AdapterError::Setup {
                    step: step.name().to_string(),
                    message,
                })?;
        }
        self.ensure_not_disposed()?;

        self.progress(ProgressStage::Configuring, "Preparing configuration");
        let credentials = self
            .services
            .credentials
            .credentials()
            .map_err(|message| AdapterError::Setup {
                step: "credentials".to_string(),
                message,
            })?;
        let working_dir = config.working_dir.as_deref();
        let config_path = self
            .services
            .config_generator
            .generate(&self.task_id, working_dir, &credentials)
            .map_err(|message| AdapterError::Setup {
                step: "config".to_string(),
                message,
            })?;

        let command = build_spawn_command(
            &binary,
            &config.build_args(),
            working_dir,
            self.services.shell_prefix.as_deref(),
        )
        .map_err(|message| AdapterError::Setup {
            step: "command".to_string(),
            message,
        })?
        .envs(build_env(
            &self.task_id,
            &credentials,
            self.services.bridge_ports,
            config_path.as_deref(),
        ));

        self.progress(ProgressStage::Spawning, "Starting agent");
        log::info!("task {}: spawning {} {:?}", self.task_id, command.program, command.args);
        let process = self.services.spawner.spawn(&command)?;

        let snapshot = {
            let mut state = self.state();
            if state.is_disposed || state.generation != generation {
                // Disposed or cancelled while we were setting up.
                let mut child = process.child;
                let _ = child.kill();
                return Err(AdapterError::Disposed);
            }
            state.child = Some(process.child);
            state.writer = Some(process.writer);
            logging::write_line(
                &state.transcript,
                Direction::Event,
                &format!("spawned {} {:?}", command.program, command.args),
            );
            state.task.clone()
        };

        let reader = process.reader;
        let pump = Arc::clone(self);
        thread::spawn(move || pump.pump(reader, generation));
        let watcher = Arc::clone(self);
        thread::spawn(move || watcher.watch_exit(generation));

        Ok(snapshot)
    }

    // ------------------------------------------------------------------
    // Output
    // ------------------------------------------------------------------

    fn pump(&self, mut reader: Box<dyn Read + Send>, generation: u64) {
        let mut decoder = Utf8Decoder::new();
        let mut stripper = AnsiStripper::new();
        let mut buf = [0u8; 8192];

        loop {
            match reader.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    if !self.is_current(generation) {
                        return;
                    }
                    let text = stripper.strip(&decoder.decode(&buf[..n]));
                    if text.is_empty() {
                        continue;
                    }
                    log::debug!("task {} stdout: {}", self.task_id, text.trim_end());
                    let transcript = self.state().transcript.clone();
                    logging::write_line(&transcript, Direction::Stdout, text.trim_end());

                    let outputs = self.parser().feed(&text);
                    self.handle_outputs(outputs);
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO once the terminal is hung up.
                    log::debug!("task {} pty read ended: {}", self.task_id, e);
                    break;
                }
            }
        }

        if !self.is_current(generation) {
            return;
        }
        let outputs = self.parser().flush();
        self.handle_outputs(outputs);
        self.on_stream_closed(generation);
    }

    fn handle_outputs(&self, outputs: Vec<ParseOutput>) {
        for output in outputs {
            match output {
                ParseOutput::Message(message) => self.handle_message(message),
                ParseOutput::Error(error) => {
                    log::warn!("task {}: {}", self.task_id, error);
                    self.state().emit(AdapterEvent::Debug {
                        message: format!("Unparseable agent output: {}", error),
                        data: None,
                    });
                }
            }
        }
    }

    fn handle_message(&self, message: StreamMessage) {
        let mut state = self.state();
        if state.sender.is_none() {
            return;
        }

        if state.current_session_id.is_none() {
            if let Some(session_id) = message.session_id() {
                log::info!("task {} session {}", self.task_id, session_id);
                state.current_session_id = Some(session_id.to_string());
                state.task.session_id = Some(session_id.to_string());
            }
        }

        match message {
            StreamMessage::StepStart { .. } => {
                state.text_in_step = false;
                state.emit(self.progress_event(ProgressStage::Init, "Agent session started"));
            }
            StreamMessage::Text { text, .. } => {
                let msg = TaskMessage::assistant(text);
                if !msg.content.is_empty() {
                    state.text_in_step = true;
                    state.task.messages.push(msg.clone());
                }
                state.emit(AdapterEvent::Message(msg));
            }
            StreamMessage::ToolCall { tool, input, .. } => {
                state.emit(AdapterEvent::ToolUse {
                    name: tool.clone(),
                    input: input.clone(),
                });
                state.emit(self.progress_event(ProgressStage::ToolUse, format!("Using {}", tool)));
                if is_question_tool(&tool) {
                    state.emit(AdapterEvent::PermissionRequest(PermissionRequestEvent {
                        request_id: new_request_id(QUESTION_PREFIX),
                        task_id: self.task_id.clone(),
                        kind: PermissionKind::Question,
                        question: question_text(&input),
                        tool_name: tool,
                        input,
                    }));
                }
            }
            StreamMessage::ToolUse {
                tool,
                description,
                state: tool_state,
                ..
            } => {
                if let Some(description) = description {
                    if !state.text_in_step {
                        // Narration stands in for missing text but does not
                        // count as text itself.
                        let narration = TaskMessage::assistant(description);
                        state.task.messages.push(narration.clone());
                        state.emit(AdapterEvent::Message(narration));
                    }
                }

                let input = tool_state.input.clone().unwrap_or(Value::Null);
                let msg = TaskMessage::tool(tool.clone(), input.clone());
                state.task.messages.push(msg.clone());
                state.emit(AdapterEvent::Message(msg));
                state.emit(AdapterEvent::ToolUse {
                    name: tool.clone(),
                    input,
                });
                state.emit(self.progress_event(ProgressStage::ToolUse, format!("Using {}", tool)));

                if tool_state.is_finished() {
                    let output = tool_state
                        .output
                        .clone()
                        .or_else(|| tool_state.error.clone().map(Value::String))
                        .unwrap_or(Value::Null);
                    state.emit(AdapterEvent::ToolResult {
                        name: Some(tool),
                        output,
                        is_error: tool_state.is_error(),
                    });
                }
            }
            StreamMessage::ToolResult { tool, output, .. } => {
                state.emit(AdapterEvent::ToolResult {
                    name: tool,
                    output,
                    is_error: false,
                });
            }
            StreamMessage::StepFinish { reason, .. } => {
                state.text_in_step = false;
                match reason {
                    FinishReason::Stop | FinishReason::EndTurn => {
                        let event = state.completion(CompletionStatus::Success, None);
                        state.finish(event);
                    }
                    FinishReason::Error => {
                        let event = state.completion(
                            CompletionStatus::Error,
                            Some("Agent step finished with an error".to_string()),
                        );
                        state.finish(event);
                    }
                    FinishReason::ToolUse => {}
                    FinishReason::Other(reason) => {
                        log::debug!("task {} step finished: {}", self.task_id, reason);
                    }
                }
            }
            StreamMessage::Error { message, .. } => {
                let event = state.completion(CompletionStatus::Error, Some(message));
                state.finish(event);
            }
            StreamMessage::Other { message_type, raw } => {
                log::debug!("task {} unhandled message type {}", self.task_id, message_type);
                state.emit(AdapterEvent::Debug {
                    message: format!("Unhandled message type: {}", message_type),
                    data: Some(raw),
                });
            }
        }
    }

    fn progress_event(&self, stage: ProgressStage, message: impl Into<String>) -> AdapterEvent {
        AdapterEvent::Progress(ProgressUpdate {
            task_id: self.task_id.clone(),
            stage,
            message: message.into(),
        })
    }

    // ------------------------------------------------------------------
    // Exit
    // ------------------------------------------------------------------

    fn watch_exit(&self, generation: u64) {
        let mut exited_at: Option<Instant> = None;
        loop {
            thread::sleep(EXIT_POLL_INTERVAL);
            let mut state = self.state();
            if state.generation != generation {
                return;
            }

            if exited_at.is_none() {
                let Some(child) = state.child.as_mut() else {
                    return;
                };
                match child.try_wait() {
                    Ok(Some(exit)) => {
                        log::debug!("task {} agent exited: {:?}", self.task_id, exit.code);
                        state.exit_status = Some(exit);
                    }
                    Ok(None) => continue,
                    Err(e) => {
                        log::warn!("task {} lost track of agent: {}", self.task_id, e);
                        state.exit_status = Some(ProcessExit { code: None });
                    }
                }
                exited_at = Some(Instant::now());
            }

            let grace_over = exited_at.is_some_and(|at| at.elapsed() >= EXIT_GRACE);
            if state.stream_closed || grace_over {
                drop(state);
                self.handle_exit_once(generation);
                return;
            }
        }
    }

    fn on_stream_closed(&self, generation: u64) {
        let exited = {
            let mut state = self.state();
            if state.generation != generation {
                return;
            }
            state.stream_closed = true;
            state.exit_status.is_some()
        };
        if exited {
            self.handle_exit_once(generation);
        }
    }

    fn handle_exit_once(&self, generation: u64) {
        let mut state = self.state();
        if state.generation != generation || state.exit_handled {
            return;
        }
        state.exit_handled = true;
        let code = state.exit_status.and_then(|e| e.code);
        state.child = None;
        state.writer = None;
        handle_exit(&mut state, code);
    }
}

/// Turn the agent's exit code into the task's terminal event.
fn handle_exit(state: &mut AdapterState, code: Option<i32>) {
    if state.has_completed {
        return;
    }
    let event = match code {
        Some(0) if state.was_interrupted => state.completion(CompletionStatus::Interrupted, None),
        Some(0) => state.completion(CompletionStatus::Success, None),
        Some(code) => AdapterEvent::Error {
            kind: FailureKind::Process,
            message: describe_exit_code(code),
        },
        None => AdapterEvent::Error {
            kind: FailureKind::Process,
            message: "Agent terminated without an exit code".to_string(),
        },
    };
    state.finish(event);
}

fn describe_exit_code(code: i32) -> String {
    let hint = match code {
        126 => Some("agent binary is not executable"),
        127 => Some("command not found"),
        130 => Some("interrupted"),
        137 => Some("killed, possibly out of memory"),
        _ => None,
    };
    match hint {
        Some(hint) => format!("Agent exited with code {} ({})", code, hint),
        None => format!("Agent exited with code {}", code),
    }
}

fn is_question_tool(tool: &str) -> bool {
    matches!(
        tool.to_ascii_lowercase().as_str(),
        "askuserquestion" | "ask_user_question" | "question"
    )
}

fn question_text(input: &Value) -> Option<String> {
    input
        .get("question")
        .or_else(|| input.pointer("/questions/0/question"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

// ============================================================================
// TESTS
// ============================================================================
