//! Console front end: prints task events and parses typed commands.

use conductor_core::adapter::{
    Completion, CompletionStatus, FailureKind, PermissionRequestEvent, ProgressUpdate,
};
use conductor_core::event_bus::BridgeEvent;
use conductor_core::task::{MessageKind, TaskCallbacks, TaskMessage, TaskStatus};
use serde_json::Value;
use std::sync::mpsc::Sender;

/// Prints every task event as one line on stdout.
pub struct ConsoleCallbacks {
    verbose: bool,
    /// Told about every task that reaches a terminal state.
    finished: Sender<String>,
}

impl ConsoleCallbacks {
    pub fn new(verbose: bool, finished: Sender<String>) -> Self {
        Self { verbose, finished }
    }

    fn done(&self, task_id: &str) {
        let _ = self.finished.send(task_id.to_string());
    }
}

impl TaskCallbacks for ConsoleCallbacks {
    fn on_message(&self, task_id: &str, message: &TaskMessage) {
        match message.kind {
            MessageKind::Assistant if !message.content.is_empty() => {
                println!("[{}] {}", task_id, message.content)
            }
            MessageKind::System => println!("[{}] ({})", task_id, message.content),
            _ => {}
        }
    }

    fn on_progress(&self, update: &ProgressUpdate) {
        println!("[{}] ... {}", update.task_id, update.message);
    }

    fn on_tool_use(&self, task_id: &str, name: &str, input: &Value) {
        if self.verbose {
            println!("[{}] tool {} {}", task_id, name, input);
        }
    }

    fn on_tool_result(&self, task_id: &str, name: Option<&str>, output: &Value, is_error: bool) {
        if is_error {
            println!("[{}] tool {} failed: {}", task_id, name.unwrap_or("?"), output);
        }
    }

    fn on_permission_request(&self, request: &PermissionRequestEvent) {
        println!(
            "[{}] agent asks: {}  (reply with: send {} <answer>)",
            request.task_id,
            request.question.as_deref().unwrap_or("(see tool input)"),
            request.task_id
        );
    }

    fn on_complete(&self, task_id: &str, completion: &Completion) {
        match completion.status {
            CompletionStatus::Success => println!("[{}] done", task_id),
            CompletionStatus::Interrupted => match &completion.session_id {
                Some(session) => println!("[{}] interrupted (session {})", task_id, session),
                None => println!("[{}] interrupted", task_id),
            },
            CompletionStatus::Error => println!(
                "[{}] failed: {}",
                task_id,
                completion.error.as_deref().unwrap_or("unknown error")
            ),
        }
        self.done(task_id);
    }

    fn on_error(&self, task_id: &str, kind: FailureKind, message: &str) {
        println!("[{}] error ({:?}): {}", task_id, kind, message);
        self.done(task_id);
    }

    fn on_status_change(&self, task_id: &str, status: TaskStatus) {
        println!("[{}] {}", task_id, status);
    }

    fn on_debug(&self, task_id: &str, message: &str, _data: Option<&Value>) {
        log::debug!("[{}] {}", task_id, message);
    }
}

/// One line of bridge request, as shown to the user.
pub fn describe_bridge_event(event: &BridgeEvent) -> Option<String> {
    match event {
        BridgeEvent::PermissionRequest {
            request_id,
            task_id,
            request,
        } => Some(format!(
            "[{}] permission {}: {} {}  (allow|deny {})",
            task_id,
            request_id,
            request.operation,
            request.paths().join(", "),
            request_id
        )),
        BridgeEvent::QuestionRequest {
            request_id,
            task_id,
            request,
        } => {
            let options: Vec<&str> = request.options.iter().map(|o| o.label.as_str()).collect();
            let choices = if options.is_empty() {
                String::new()
            } else {
                format!(" [{}]", options.join(" | "))
            };
            Some(format!(
                "[{}] question {}: {}{}  (choose|answer|skip {})",
                task_id, request_id, request.question, choices, request_id
            ))
        }
        BridgeEvent::Resolved {
            request_id,
            timed_out: true,
        } => Some(format!("request {} timed out", request_id)),
        BridgeEvent::Resolved { .. } => None,
    }
}

/// A command typed on stdin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Submit(String),
    Allow(String),
    Deny(String),
    /// Pick one or more of a question's options (comma separated).
    Choose(String, Vec<String>),
    Answer(String, String),
    Skip(String),
    Send(String, String),
    Interrupt(String),
    Cancel(String),
    /// Drop a finished task from the status list.
    Forget(String),
    Status,
    Quit,
}

pub const HELP: &str = "\
commands:
  submit <prompt>            run a new task
  allow <id> | deny <id>     answer a file permission request
  choose <id> <a,b>          pick question options
  answer <id> <text>         answer a question in your own words
  skip <id>                  decline a question
  send <task> <text>         type a line into a task's agent
  interrupt <task>           ask a task to stop
  cancel <task>              kill a task
  forget <task>              drop a finished task
  status                     list tasks
  quit";

impl Command {
    pub fn parse(line: &str) -> Result<Self, String> {
        let line = line.trim();
        let (verb, rest) = match line.split_once(char::is_whitespace) {
            Some((verb, rest)) => (verb, rest.trim()),
            None => (line, ""),
        };
        let (id, text) = match rest.split_once(char::is_whitespace) {
            Some((id, text)) => (id.to_string(), text.trim().to_string()),
            None => (rest.to_string(), String::new()),
        };

        let need_id = |id: String| {
            if id.is_empty() {
                Err(format!("{} needs an id", verb))
            } else {
                Ok(id)
            }
        };
        let need_text = |text: String| {
            if text.is_empty() {
                Err(format!("{} needs text", verb))
            } else {
                Ok(text)
            }
        };

        match verb {
            "submit" | "run" => need_text(rest.to_string()).map(Command::Submit),
            "allow" => need_id(id).map(Command::Allow),
            "deny" => need_id(id).map(Command::Deny),
            "choose" => {
                let id = need_id(id)?;
                let options: Vec<String> = need_text(text)?
                    .split(',')
                    .map(|o| o.trim().to_string())
                    .filter(|o| !o.is_empty())
                    .collect();
                Ok(Command::Choose(id, options))
            }
            "answer" => Ok(Command::Answer(need_id(id)?, need_text(text)?)),
            "skip" => need_id(id).map(Command::Skip),
            "send" => Ok(Command::Send(need_id(id)?, need_text(text)?)),
            "interrupt" => need_id(id).map(Command::Interrupt),
            "cancel" => need_id(id).map(Command::Cancel),
            "forget" | "rm" => need_id(id).map(Command::Forget),
            "status" | "ls" => Ok(Command::Status),
            "quit" | "exit" => Ok(Command::Quit),
            "" => Err("empty command".to_string()),
            other => Err(format!("unknown command: {}", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    mod parse {
        use super::*;

        #[test]
        fn submit_keeps_whole_prompt() {
            assert_eq!(
                Command::parse("submit fix the  failing test").unwrap(),
                Command::Submit("fix the  failing test".to_string())
            );
        }

        #[test]
        fn id_commands() {
            assert_eq!(
                Command::parse("allow perm_1").unwrap(),
                Command::Allow("perm_1".to_string())
            );
            assert_eq!(
                Command::parse("  cancel task_9 ").unwrap(),
                Command::Cancel("task_9".to_string())
            );
            assert_eq!(
                Command::parse("rm task_9").unwrap(),
                Command::Forget("task_9".to_string())
            );
        }

        #[test]
        fn choose_splits_options() {
            assert_eq!(
                Command::parse("choose question_1 Postgres, SQLite").unwrap(),
                Command::Choose(
                    "question_1".to_string(),
                    vec!["Postgres".to_string(), "SQLite".to_string()]
                )
            );
        }

        #[test]
        fn send_keeps_text() {
            assert_eq!(
                Command::parse("send task_1 yes, go ahead").unwrap(),
                Command::Send("task_1".to_string(), "yes, go ahead".to_string())
            );
        }

        #[test]
        fn missing_arguments() {
            assert!(Command::parse("allow").is_err());
            assert!(Command::parse("send task_1").is_err());
            assert!(Command::parse("submit").is_err());
            assert!(Command::parse("").is_err());
            assert!(Command::parse("frobnicate x").is_err());
        }
    }

    mod bridge_events {
        use super::*;
        use conductor_core::bridge::{PermissionRequest, QuestionOption, QuestionRequest};

        #[test]
        fn permission_line() {
            let event = BridgeEvent::PermissionRequest {
                request_id: "perm_1".to_string(),
                task_id: "task_1".to_string(),
                request: PermissionRequest {
                    operation: "delete".to_string(),
                    file_path: Some("a.txt".to_string()),
                    file_paths: None,
                    target_path: None,
                    content_preview: None,
                },
            };
            let line = describe_bridge_event(&event).unwrap();
            assert!(line.contains("delete a.txt"));
            assert!(line.contains("allow|deny perm_1"));
        }

        #[test]
        fn question_line_lists_options() {
            let event = BridgeEvent::QuestionRequest {
                request_id: "question_1".to_string(),
                task_id: "task_1".to_string(),
                request: QuestionRequest {
                    question: "Which DB?".to_string(),
                    header: None,
                    options: vec![
                        QuestionOption {
                            label: "Postgres".to_string(),
                            description: None,
                        },
                        QuestionOption {
                            label: "SQLite".to_string(),
                            description: None,
                        },
                    ],
                    multi_select: false,
                },
            };
            let line = describe_bridge_event(&event).unwrap();
            assert!(line.contains("Which DB? [Postgres | SQLite]"));
        }

        #[test]
        fn answered_resolution_is_silent() {
            let event = BridgeEvent::Resolved {
                request_id: "perm_1".to_string(),
                timed_out: false,
            };
            assert!(describe_bridge_event(&event).is_none());
        }
    }
}
