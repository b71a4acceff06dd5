//! Collaborators the process adapter depends on.
//!
//! Everything that touches user settings, credential storage or the
//! agent's own config format sits behind one of these traits so the
//! adapter can be driven by whatever host embeds it.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Executable to run, plus any arguments that must precede the task's own.
///
/// A script-based agent resolves to e.g. `node` with the script path as
/// its first argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedBinary {
    pub command: String,
    pub args: Vec<String>,
}

/// Locates the agent executable.
pub trait BinaryResolver: Send + Sync {
    fn resolve(&self) -> Result<ResolvedBinary, String>;
}

/// Environment forwarded to the agent for model access.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    /// API keys and similar secrets, keyed by environment variable name.
    pub env: BTreeMap<String, String>,
    /// Provider endpoint overrides, keyed by environment variable name.
    pub base_urls: BTreeMap<String, String>,
}

impl Credentials {
    pub fn is_empty(&self) -> bool {
        self.env.is_empty() && self.base_urls.is_empty()
    }
}

pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> Result<Credentials, String>;
}

/// Writes the agent's config file for one task.
///
/// Returns the path to pass to the agent, or `None` to let it use its own
/// defaults.
pub trait ConfigGenerator: Send + Sync {
    fn generate(
        &self,
        task_id: &str,
        working_dir: Option<&Path>,
        credentials: &Credentials,
    ) -> Result<Option<PathBuf>, String>;
}

/// One provisioning step run before the agent is spawned.
///
/// `report` receives human-readable progress lines.
pub trait SetupStep: Send + Sync {
    fn name(&self) -> &str;
    fn run(&self, report: &dyn Fn(&str)) -> Result<(), String>;
}

// ============================================================================
// Defaults
// ============================================================================

/// Resolves an explicitly configured path, or searches `PATH` for a name.
#[derive(Debug, Clone)]
pub struct PathBinaryResolver {
    name: String,
    explicit: Option<PathBuf>,
}

impl PathBinaryResolver {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            explicit: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.explicit = Some(path.into());
        self
    }

    fn search_path(&self) -> Option<PathBuf> {
        let path = std::env::var_os("PATH")?;
        let names: Vec<String> = if cfg!(windows) {
            ["", ".exe", ".cmd", ".bat"]
                .iter()
                .map(|ext| format!("{}{}", self.name, ext))
                .collect()
        } else {
            vec![self.name.clone()]
        };

        std::env::split_paths(&path)
            .flat_map(|dir| names.iter().map(move |name| dir.join(name)))
            .find(|candidate| is_executable(candidate))
    }
}

impl BinaryResolver for PathBinaryResolver {
    fn resolve(&self) -> Result<ResolvedBinary, String> {
        let found = match &self.explicit {
            Some(path) if is_executable(path) => path.clone(),
            Some(path) => return Err(format!("{} not found at {}", self.name, path.display())),
            None => self
                .search_path()
                .ok_or_else(|| format!("{} not found on PATH", self.name))?,
        };

        Ok(ResolvedBinary {
            command: found.to_string_lossy().into_owned(),
            args: Vec::new(),
        })
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    path.metadata()
        .map(|m| m.is_file() && m.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Provider API key variables forwarded from the host environment.
pub const API_KEY_VARS: &[&str] = &[
    "ANTHROPIC_API_KEY",
    "OPENAI_API_KEY",
    "GOOGLE_GENERATIVE_AI_API_KEY",
    "OPENROUTER_API_KEY",
    "GROQ_API_KEY",
    "XAI_API_KEY",
    "DEEPSEEK_API_KEY",
    "MISTRAL_API_KEY",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_REGION",
];

/// Provider endpoint variables forwarded from the host environment.
pub const BASE_URL_VARS: &[&str] = &[
    "ANTHROPIC_BASE_URL",
    "OPENAI_BASE_URL",
    "OLLAMA_HOST",
    "AZURE_OPENAI_ENDPOINT",
];

/// Forwards [`API_KEY_VARS`] and [`BASE_URL_VARS`] that are set and non-empty.
#[derive(Debug, Clone, Default)]
pub struct EnvCredentialProvider;

impl EnvCredentialProvider {
    fn collect(vars: &[&str], lookup: impl Fn(&str) -> Option<String>) -> BTreeMap<String, String> {
        vars.iter()
            .filter_map(|name| {
                lookup(name)
                    .filter(|v| !v.trim().is_empty())
                    .map(|v| (name.to_string(), v))
            })
            .collect()
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Credentials {
        Credentials {
            env: Self::collect(API_KEY_VARS, &lookup),
            base_urls: Self::collect(BASE_URL_VARS, &lookup),
        }
    }
}

impl CredentialProvider for EnvCredentialProvider {
    fn credentials(&self) -> Result<Credentials, String> {
        Ok(Self::from_lookup(|name| std::env::var(name).ok()))
    }
}

/// Leaves the agent on its own configuration.
#[derive(Debug, Clone, Default)]
pub struct NoopConfigGenerator;

impl ConfigGenerator for NoopConfigGenerator {
    fn generate(
        &self,
        _task_id: &str,
        _working_dir: Option<&Path>,
        _credentials: &Credentials,
    ) -> Result<Option<PathBuf>, String> {
        Ok(None)
    }
}

// ============================================================================
// TESTS
// ============================================================================
