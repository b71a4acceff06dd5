//! Platform-aware command line building.
//!
//! Agents are spawned with a native argv wherever possible, so arguments
//! (including the user's prompt) are never re-interpreted by a shell.
//! Shell wrapping is used only when it is required:
//!
//! - on Windows, `.cmd` / `.bat` shims cannot be executed directly and are
//!   run through `cmd.exe /C`
//! - when the operator configures a shell prefix (e.g. `/bin/zsh -l -c`) to
//!   pick up a login environment; the command is then quoted with `shlex`

use crate::provider::ResolvedBinary;
use crate::spawn::SpawnCommand;
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Platform {
    Unix,
    Windows,
}

impl Platform {
    fn current() -> Self {
        if cfg!(windows) {
            Platform::Windows
        } else {
            Platform::Unix
        }
    }

    fn path_separator(self) -> char {
        match self {
            Platform::Unix => ':',
            Platform::Windows => ';',
        }
    }
}

/// Build the command that runs `binary` with `args`.
///
/// The binary's own leading arguments (from [`ResolvedBinary::args`]) come
/// before `args`. The binary's directory is prepended to `PATH` so helper
/// runtimes installed next to it (node, etc.) are found.
pub fn build_spawn_command(
    binary: &ResolvedBinary,
    args: &[String],
    working_dir: Option<&Path>,
    shell_prefix: Option<&str>,
) -> Result<SpawnCommand, String> {
    let mut cmd = build_for_platform(binary, args, shell_prefix, Platform::current())?;

    if let Some(dir) = working_dir {
        cmd = cmd.cwd(dir);
    }
    if let Some(path) = path_with_binary_dir(&binary.command, Platform::current()) {
        cmd = cmd.env("PATH", path);
    }

    Ok(cmd)
}

fn build_for_platform(
    binary: &ResolvedBinary,
    args: &[String],
    shell_prefix: Option<&str>,
    platform: Platform,
) -> Result<SpawnCommand, String> {
    let argv: Vec<String> = binary.args.iter().chain(args).cloned().collect();

    if platform == Platform::Windows && is_batch_shim(&binary.command) {
        let mut cmd_args = vec!["/C".to_string(), binary.command.clone()];
        cmd_args.extend(argv);
        return Ok(SpawnCommand::new("cmd.exe", cmd_args));
    }

    match shell_prefix.map(str::trim).filter(|p| !p.is_empty()) {
        Some(prefix) if platform == Platform::Unix => wrap_in_shell(prefix, &binary.command, &argv),
        Some(_) => {
            log::debug!("shell prefix ignored on this platform");
            Ok(SpawnCommand::new(binary.command.clone(), argv))
        }
        None => Ok(SpawnCommand::new(binary.command.clone(), argv)),
    }
}

/// `<prefix...> '<quoted command>'`
fn wrap_in_shell(prefix: &str, program: &str, argv: &[String]) -> Result<SpawnCommand, String> {
    let prefix_parts =
        shlex::split(prefix).ok_or_else(|| format!("Invalid shell prefix: {}", prefix))?;
    let Some((shell_program, shell_args)) = prefix_parts.split_first() else {
        return Err("Empty shell prefix".to_string());
    };

    let mut command_parts = Vec::with_capacity(argv.len() + 1);
    command_parts.push(
        shlex::try_quote(program)
            .map_err(|_| format!("Invalid path: {}", program))?
            .into_owned(),
    );
    for arg in argv {
        command_parts.push(
            shlex::try_quote(arg)
                .map_err(|_| format!("Invalid argument: {}", arg))?
                .into_owned(),
        );
    }

    let mut args = shell_args.to_vec();
    args.push(command_parts.join(" "));
    Ok(SpawnCommand::new(shell_program.clone(), args))
}

fn is_batch_shim(command: &str) -> bool {
    let lower = command.to_ascii_lowercase();
    lower.ends_with(".cmd") || lower.ends_with(".bat")
}

/// `PATH` with the binary's parent directory in front, if it has one.
fn path_with_binary_dir(binary_path: &str, platform: Platform) -> Option<String> {
    let has_dir = match platform {
        Platform::Unix => binary_path.contains('/'),
        Platform::Windows => binary_path.contains('/') || binary_path.contains('\\'),
    };
    if !has_dir {
        return None;
    }

    let dir = Path::new(binary_path).parent()?.to_str()?;
    if dir.is_empty() {
        return None;
    }
    let existing = std::env::var("PATH").unwrap_or_default();
    Some(if existing.is_empty() {
        dir.to_string()
    } else {
        format!("{}{}{}", dir, platform.path_separator(), existing)
    })
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn binary(command: &str) -> ResolvedBinary {
        ResolvedBinary {
            command: command.to_string(),
            args: Vec::new(),
        }
    }

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    mod native {
        use super::*;

        #[test]
        fn passes_prompt_through_untouched() {
            let cmd = build_for_platform(
                &binary("/usr/bin/agent"),
                &args(&["run", "fix `rm -rf` and $HOME's \"quotes\""]),
                None,
                Platform::Unix,
            )
            .unwrap();

            assert_eq!(cmd.program, "/usr/bin/agent");
            assert_eq!(cmd.args, args(&["run", "fix `rm -rf` and $HOME's \"quotes\""]));
        }

        #[test]
        fn binary_args_come_first() {
            let resolved = ResolvedBinary {
                command: "node".to_string(),
                args: args(&["/opt/agent/cli.js"]),
            };
            let cmd = build_for_platform(&resolved, &args(&["run", "hi"]), None, Platform::Unix)
                .unwrap();
            assert_eq!(cmd.program, "node");
            assert_eq!(cmd.args, args(&["/opt/agent/cli.js", "run", "hi"]));
        }

        #[test]
        fn blank_prefix_is_ignored() {
            let cmd =
                build_for_platform(&binary("agent"), &args(&["run"]), Some("  "), Platform::Unix)
                    .unwrap();
            assert_eq!(cmd.program, "agent");
        }

        #[test]
        fn windows_exe_runs_directly() {
            let cmd = build_for_platform(
                &binary(r"C:\tools\agent.exe"),
                &args(&["run"]),
                None,
                Platform::Windows,
            )
            .unwrap();
            assert_eq!(cmd.program, r"C:\tools\agent.exe");
        }
    }

    mod wrapped {
        use super::*;

        #[test]
        fn custom_prefix_quotes_command() {
            let cmd = build_for_platform(
                &binary("/path/with spaces/agent"),
                &args(&["run", "it's done"]),
                Some("/bin/zsh -l -c"),
                Platform::Unix,
            )
            .unwrap();

            assert_eq!(cmd.program, "/bin/zsh");
            assert_eq!(cmd.args.len(), 3);
            assert_eq!(&cmd.args[..2], &args(&["-l", "-c"])[..]);
            // The inner command must split back to the original argv.
            let inner = shlex::split(&cmd.args[2]).unwrap();
            assert_eq!(inner, args(&["/path/with spaces/agent", "run", "it's done"]));
        }

        #[test]
        fn windows_batch_shim_uses_cmd() {
            let cmd = build_for_platform(
                &binary(r"C:\npm\agent.CMD"),
                &args(&["run", "hi"]),
                None,
                Platform::Windows,
            )
            .unwrap();
            assert_eq!(cmd.program, "cmd.exe");
            assert_eq!(cmd.args, args(&["/C", r"C:\npm\agent.CMD", "run", "hi"]));
        }

        #[test]
        fn prefix_ignored_on_windows() {
            let cmd = build_for_platform(
                &binary("agent.exe"),
                &args(&["run"]),
                Some("bash -c"),
                Platform::Windows,
            )
            .unwrap();
            assert_eq!(cmd.program, "agent.exe");
        }

        #[test]
        fn unbalanced_prefix_is_rejected() {
            let result =
                build_for_platform(&binary("agent"), &[], Some("bash \"-c"), Platform::Unix);
            assert!(result.is_err());
        }
    }

    mod path_env {
        use super::*;

        #[test]
        fn bare_name_leaves_path_alone() {
            assert_eq!(path_with_binary_dir("agent", Platform::Unix), None);
        }

        #[test]
        fn prepends_binary_dir() {
            let path = path_with_binary_dir("/opt/agent/bin/agent", Platform::Unix).unwrap();
            assert!(path.starts_with("/opt/agent/bin"));
        }

        #[test]
        fn build_sets_cwd_and_path() {
            let cmd = build_spawn_command(
                &binary("/opt/agent/bin/agent"),
                &args(&["run"]),
                Some(Path::new("/tmp")),
                None,
            )
            .unwrap();
            assert_eq!(cmd.cwd.as_deref(), Some(Path::new("/tmp")));
            assert!(cmd.env_value("PATH").unwrap().starts_with("/opt/agent/bin"));
        }
    }
}
