//! Conductor daemon - runs agent tasks from the console.
//!
//! Starts the permission/question bridge servers, submits the prompts given
//! on the command line, and reads commands from stdin until every task has
//! finished (or, with `--interactive`, until `quit`).

mod console;

use clap::Parser;
use conductor_core::adapter::{evaluate, AdapterServices, BridgePorts, TaskConfig};
use conductor_core::bridge::{
    ActiveTaskSource, PermissionBridge, QuestionAnswer, QuestionBridge,
};
use conductor_core::event_bus::EventBus;
use conductor_core::provider::PathBinaryResolver;
use conductor_core::provision::BinaryDownload;
use conductor_core::spawn::NativePtySpawner;
use conductor_core::task::{
    new_task_id, TaskCallbacks, TaskManager, TaskManagerConfig, TaskStatus,
    DEFAULT_MAX_CONCURRENT_TASKS,
};
use conductor_http::{permission_router, question_router, try_start_bridge_server};
use console::{describe_bridge_event, Command, ConsoleCallbacks, HELP};
use std::collections::HashSet;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::mpsc;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;

// ============================================================================
// CLI Definition
// ============================================================================

/// Conductor - supervised AI agent tasks
#[derive(Parser, Debug)]
#[command(name = "conductor", version, about)]
struct Cli {
    /// Prompts to run, one task each
    prompts: Vec<String>,

    /// Maximum number of agents running at once
    #[arg(long, default_value_t = DEFAULT_MAX_CONCURRENT_TASKS)]
    max_concurrent: usize,

    /// Agent executable to look up on PATH
    #[arg(long, default_value = "opencode")]
    agent_binary: String,

    /// Explicit path to the agent executable
    #[arg(long)]
    agent_path: Option<PathBuf>,

    #[arg(long)]
    model: Option<String>,

    /// Agent profile to run under
    #[arg(long)]
    agent: Option<String>,

    /// Continue an earlier session
    #[arg(long)]
    session: Option<String>,

    #[arg(long)]
    working_dir: Option<PathBuf>,

    /// Write per-task transcripts here
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// Run the agent through a login shell, e.g. "zsh -l -c"
    #[arg(long)]
    shell_prefix: Option<String>,

    #[arg(long, default_value_t = 9226)]
    permission_port: u16,

    #[arg(long, default_value_t = 9227)]
    question_port: u16,

    /// Download a companion binary before each run if it is missing
    #[arg(long, requires = "companion_path")]
    companion_url: Option<String>,

    /// Where the companion binary lives
    #[arg(long)]
    companion_path: Option<PathBuf>,

    /// Run the first prompt once and print only the reply
    #[arg(long)]
    evaluate: bool,

    /// Keep reading commands after all tasks finish
    #[arg(short, long)]
    interactive: bool,

    /// Print tool calls as well as messages
    #[arg(short, long)]
    verbose: bool,
}

impl Cli {
    fn task_config(&self, prompt: &str) -> TaskConfig {
        let mut config = TaskConfig::new(prompt);
        config.working_dir = self.working_dir.clone();
        config.model = self.model.clone();
        config.agent = self.agent.clone();
        config.resume_session_id = self.session.clone();
        config
    }

    fn services(&self, ports: BridgePorts) -> AdapterServices {
        let mut resolver = PathBinaryResolver::new(&self.agent_binary);
        if let Some(path) = &self.agent_path {
            resolver = resolver.with_path(path);
        }

        let mut services = AdapterServices::new(Arc::new(NativePtySpawner::default()), Arc::new(resolver))
            .with_bridge_ports(ports);
        if let Some(prefix) = &self.shell_prefix {
            services = services.with_shell_prefix(prefix.clone());
        }
        if let Some(dir) = &self.log_dir {
            services = services.with_log_dir(dir.clone());
        }
        if let (Some(url), Some(path)) = (&self.companion_url, &self.companion_path) {
            services = services.with_setup_step(Arc::new(BinaryDownload::new(
                "companion",
                url.clone(),
                path.clone(),
            )));
        }
        services
    }
}

/// The bridges are built before the manager they ask for the active task.
#[derive(Default)]
struct ManagerSlot(OnceLock<TaskManager>);

impl ActiveTaskSource for ManagerSlot {
    fn active_task_id(&self) -> Option<String> {
        self.0.get().and_then(TaskManager::active_task_id)
    }
}

struct App {
    cli: Cli,
    manager: TaskManager,
    permission: Arc<PermissionBridge>,
    question: Arc<QuestionBridge>,
    callbacks: Arc<dyn TaskCallbacks>,
    submitted: Vec<String>,
    outstanding: HashSet<String>,
}

impl App {
    fn submit(&mut self, prompt: &str) {
        let task_id = new_task_id();
        match self
            .manager
            .submit(task_id.clone(), self.cli.task_config(prompt), Arc::clone(&self.callbacks))
        {
            Ok(task) => {
                println!("[{}] {}: {}", task.id, task.status, prompt);
                self.submitted.push(task_id.clone());
                self.outstanding.insert(task_id);
            }
            Err(e) => println!("could not submit: {}", e),
        }
    }

    /// Returns `false` when the user asked to quit.
    fn handle(&mut self, command: Command) -> bool {
        let result = match command {
            Command::Submit(prompt) => {
                self.submit(&prompt);
                Ok(())
            }
            Command::Allow(id) => self.answer_permission(&id, true),
            Command::Deny(id) => self.answer_permission(&id, false),
            Command::Choose(id, options) => self.answer_question(&id, QuestionAnswer::selected(options)),
            Command::Answer(id, text) => self.answer_question(&id, QuestionAnswer::custom(text)),
            Command::Skip(id) => self.answer_question(&id, QuestionAnswer::denied()),
            Command::Send(task_id, text) => self
                .manager
                .send_response(&task_id, &text)
                .map_err(|e| e.to_string()),
            Command::Interrupt(task_id) => self.manager.interrupt(&task_id).map_err(|e| e.to_string()),
            Command::Cancel(task_id) => {
                let result = self.manager.cancel(&task_id).map_err(|e| e.to_string());
                if result.is_ok() {
                    println!("[{}] cancelled", task_id);
                    self.outstanding.remove(&task_id);
                }
                result
            }
            Command::Forget(task_id) => self
                .manager
                .remove_task(&task_id)
                .map(|_| self.submitted.retain(|id| *id != task_id))
                .map_err(|e| e.to_string()),
            Command::Status => {
                self.print_status();
                Ok(())
            }
            Command::Quit => return false,
        };
        if let Err(e) = result {
            println!("{}", e);
        }
        true
    }

    fn answer_permission(&self, request_id: &str, allowed: bool) -> Result<(), String> {
        if self.permission.respond(request_id, allowed) {
            Ok(())
        } else {
            Err(format!("no pending permission request {}", request_id))
        }
    }

    fn answer_question(&self, request_id: &str, answer: QuestionAnswer) -> Result<(), String> {
        if self.question.respond(request_id, answer) {
            Ok(())
        } else {
            Err(format!("no pending question {}", request_id))
        }
    }

    fn print_status(&self) {
        println!(
            "{} running, {} queued (limit {})",
            self.manager.active_count(),
            self.manager.queued_count(),
            self.manager.max_concurrent_tasks()
        );
        for id in &self.submitted {
            if let Some(task) = self.manager.get_task(id) {
                println!(
                    "  {}  {:<11} {} messages  {}",
                    task.id,
                    task.status.as_str(),
                    task.messages.len(),
                    task.prompt
                );
            }
        }
    }

    fn any_failed(&self) -> bool {
        self.submitted.iter().any(|id| {
            self.manager
                .get_task(id)
                .is_some_and(|t| t.status == TaskStatus::Failed)
        })
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();

    let result = if cli.evaluate {
        run_evaluation(cli).await
    } else {
        run(cli).await
    };
    match result {
        Ok(code) => code,
        Err(e) => {
            log::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_evaluation(cli: Cli) -> Result<ExitCode, String> {
    let prompt = cli
        .prompts
        .first()
        .cloned()
        .ok_or_else(|| "--evaluate needs a prompt".to_string())?;
    let services = cli.services(BridgePorts::default());
    let config = cli.task_config(&prompt);

    let reply = tokio::task::spawn_blocking(move || evaluate(&services, config))
        .await
        .map_err(|e| format!("evaluation panicked: {}", e))?
        .map_err(|e| e.to_string())?;
    println!("{}", reply);
    Ok(ExitCode::SUCCESS)
}

async fn run(cli: Cli) -> Result<ExitCode, String> {
    let events = Arc::new(EventBus::new());
    let slot = Arc::new(ManagerSlot::default());
    let permission = Arc::new(PermissionBridge::new(Arc::clone(&events), slot.clone()));
    let question = Arc::new(QuestionBridge::new(Arc::clone(&events), slot.clone()));

    let permission_server = try_start_bridge_server(
        permission_router(Arc::clone(&permission)),
        cli.permission_port,
        "permission",
    );
    let question_server = try_start_bridge_server(
        question_router(Arc::clone(&question)),
        cli.question_port,
        "question",
    );
    let ports = BridgePorts {
        permission: permission_server
            .as_ref()
            .and_then(|s| s.local_addr())
            .map(|a| a.port()),
        question: question_server
            .as_ref()
            .and_then(|s| s.local_addr())
            .map(|a| a.port()),
    };

    let manager = TaskManager::new(
        TaskManagerConfig {
            max_concurrent_tasks: cli.max_concurrent.max(1),
        },
        cli.services(ports),
    );
    let _ = slot.0.set(manager.clone());

    let mut bridge_events = events.subscribe();
    tokio::spawn(async move {
        loop {
            match bridge_events.recv().await {
                Ok(event) => {
                    if let Some(line) = describe_bridge_event(&event) {
                        println!("{}", line);
                    }
                }
                Err(RecvError::Lagged(n)) => log::warn!("missed {} bridge events", n),
                Err(RecvError::Closed) => break,
            }
        }
    });

    let (finished_tx, finished_rx) = mpsc::channel();
    let mut app = App {
        manager,
        permission,
        question,
        callbacks: Arc::new(ConsoleCallbacks::new(cli.verbose, finished_tx)),
        submitted: Vec::new(),
        outstanding: HashSet::new(),
        cli,
    };

    for prompt in app.cli.prompts.clone() {
        app.submit(&prompt);
    }
    if app.cli.interactive {
        println!("{}", HELP);
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut stdin_open = true;
    let mut tick = tokio::time::interval(Duration::from_millis(200));

    loop {
        tokio::select! {
            line = lines.next_line(), if stdin_open => match line {
                Ok(Some(line)) if line.trim().is_empty() => {}
                Ok(Some(line)) => match Command::parse(&line) {
                    Ok(command) => {
                        if !app.handle(command) {
                            break;
                        }
                    }
                    Err(e) => println!("{}", e),
                },
                Ok(None) => stdin_open = false,
                Err(e) => {
                    log::warn!("stdin closed: {}", e);
                    stdin_open = false;
                }
            },
            _ = tokio::signal::ctrl_c() => {
                println!("stopping");
                break;
            }
            _ = tick.tick() => {
                for id in finished_rx.try_iter() {
                    app.outstanding.remove(&id);
                }
                let waiting_for_user = app.cli.interactive && stdin_open;
                if app.outstanding.is_empty() && !waiting_for_user {
                    break;
                }
            }
        }
    }

    app.manager.shutdown();
    app.permission.cancel_all();
    app.question.cancel_all();
    drop(permission_server);
    drop(question_server);

    Ok(if app.any_failed() {
        ExitCode::FAILURE
    } else {
        ExitCode::SUCCESS
    })
}
