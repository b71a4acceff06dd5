//! Task configuration and the services an adapter runs with.

use crate::provider::{
    BinaryResolver, ConfigGenerator, CredentialProvider, Credentials, EnvCredentialProvider,
    NoopConfigGenerator, SetupStep,
};
use crate::spawn::PtySpawner;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Tells tool servers which task they are working for.
pub const TASK_ID_ENV: &str = "CONDUCTOR_TASK_ID";
pub const PERMISSION_PORT_ENV: &str = "CONDUCTOR_PERMISSION_PORT";
pub const QUESTION_PORT_ENV: &str = "CONDUCTOR_QUESTION_PORT";
/// Path of the generated agent config, when there is one.
pub const AGENT_CONFIG_ENV: &str = "CONDUCTOR_AGENT_CONFIG";

/// What to run for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TaskConfig {
    pub prompt: String,
    pub working_dir: Option<PathBuf>,
    pub model: Option<String>,
    /// Agent profile to run under.
    pub agent: Option<String>,
    /// Continue an earlier (e.g. interrupted) session.
    pub resume_session_id: Option<String>,
}

impl TaskConfig {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn resume_session(mut self, session_id: impl Into<String>) -> Self {
        self.resume_session_id = Some(session_id.into());
        self
    }

    /// `run <prompt> --format json [--model m] [--session id] [--agent profile]`
    pub fn build_args(&self) -> Vec<String> {
        let mut args = vec![
            "run".to_string(),
            self.prompt.clone(),
            "--format".to_string(),
            "json".to_string(),
        ];
        let optional = [
            ("--model", &self.model),
            ("--session", &self.resume_session_id),
            ("--agent", &self.agent),
        ];
        for (flag, value) in optional {
            if let Some(value) = value.as_deref().filter(|v| !v.is_empty()) {
                args.push(flag.to_string());
                args.push(value.to_string());
            }
        }
        args
    }
}

/// Ports of the local bridge servers, passed on to tool servers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BridgePorts {
    pub permission: Option<u16>,
    pub question: Option<u16>,
}

/// Environment for the agent process.
pub fn build_env(
    task_id: &str,
    credentials: &Credentials,
    ports: BridgePorts,
    config_path: Option<&Path>,
) -> Vec<(String, String)> {
    let mut env: Vec<(String, String)> = credentials
        .env
        .iter()
        .chain(&credentials.base_urls)
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();

    env.push((TASK_ID_ENV.to_string(), task_id.to_string()));
    if let Some(port) = ports.permission {
        env.push((PERMISSION_PORT_ENV.to_string(), port.to_string()));
    }
    if let Some(port) = ports.question {
        env.push((QUESTION_PORT_ENV.to_string(), port.to_string()));
    }
    if let Some(path) = config_path {
        env.push((AGENT_CONFIG_ENV.to_string(), path.to_string_lossy().into_owned()));
    }
    env
}

/// Everything an adapter needs from its host, shared by all tasks.
#[derive(Clone)]
pub struct AdapterServices {
    pub spawner: Arc<dyn PtySpawner>,
    pub resolver: Arc<dyn BinaryResolver>,
    pub credentials: Arc<dyn CredentialProvider>,
    pub config_generator: Arc<dyn ConfigGenerator>,
    /// Run in order before every spawn.
    pub setup_steps: Vec<Arc<dyn SetupStep>>,
    pub shell_prefix: Option<String>,
    /// Transcript directory; `None` disables transcripts.
    pub log_dir: Option<PathBuf>,
    pub bridge_ports: BridgePorts,
}

impl AdapterServices {
    pub fn new(spawner: Arc<dyn PtySpawner>, resolver: Arc<dyn BinaryResolver>) -> Self {
        Self {
            spawner,
            resolver,
            credentials: Arc::new(EnvCredentialProvider),
            config_generator: Arc::new(NoopConfigGenerator),
            setup_steps: Vec::new(),
            shell_prefix: None,
            log_dir: None,
            bridge_ports: BridgePorts::default(),
        }
    }

    pub fn with_credentials(mut self, provider: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = provider;
        self
    }

    pub fn with_config_generator(mut self, generator: Arc<dyn ConfigGenerator>) -> Self {
        self.config_generator = generator;
        self
    }

    pub fn with_setup_step(mut self, step: Arc<dyn SetupStep>) -> Self {
        self.setup_steps.push(step);
        self
    }

    pub fn with_shell_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.shell_prefix = Some(prefix.into());
        self
    }

    pub fn with_log_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.log_dir = Some(dir.into());
        self
    }

    pub fn with_bridge_ports(mut self, ports: BridgePorts) -> Self {
        self.bridge_ports = ports;
        self
    }
}
