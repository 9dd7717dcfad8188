//! Interpreter for multi-session role programs.
//!
//! Each session is one [`RoleExecutor`] invocation named `<role>.<session>`.
//! Statements run in order; sessions inside a `parallel` block run on scoped
//! threads and are joined before the next statement. A block publishes its
//! outputs as named context only when every branch succeeded.

use std::collections::HashMap;
use std::path::Path;
use std::thread;

use anyhow::{Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::session_program::{SessionDecl, SessionProgram, Statement};
use crate::core::types::RoleExit;
use crate::io::atomic::write_atomic;
use crate::io::events::{EventKind, EventLedger};
use crate::io::executor::{RoleExecutor, RoleRequest, RoleRun};
use crate::io::process::role_log_path;
use crate::io::prompt::ContextSection;

pub struct ProgramRun<'a> {
    pub role: &'a str,
    pub program: &'a SessionProgram,
    /// Repository, timeouts and the role-level last-message file.
    pub base: &'a RoleRequest,
    pub iteration_dir: &'a Path,
    pub ledger: &'a EventLedger,
    pub iteration: u32,
}

/// Run every statement of `run.program`.
///
/// `render_prompt` builds a session prompt from its declaration and the
/// context it asked for. The returned [`RoleRun`] carries the first
/// unsuccessful exit, or success with the final statement's message.
#[instrument(skip_all, fields(role = run.role, sessions = run.program.session_count()))]
pub fn run_program<E, F>(executor: &E, run: &ProgramRun<'_>, render_prompt: F) -> Result<RoleRun>
where
    E: RoleExecutor + ?Sized,
    F: Fn(&SessionDecl, &[ContextSection]) -> Result<String> + Sync,
{
    let mut published: HashMap<String, String> = HashMap::new();
    let mut last_message = None;

    for statement in &run.program.statements {
        let sessions: &[SessionDecl] = match statement {
            Statement::Session(decl) => std::slice::from_ref(decl),
            Statement::Parallel { sessions, .. } => sessions,
        };

        let mut requests = Vec::with_capacity(sessions.len());
        for decl in sessions {
            let context = gather_context(decl, &published);
            requests.push(session_request(run, decl, render_prompt(decl, &context)?));
        }
        for request in &requests {
            run.ledger.emit(EventKind::SessionStart, run.iteration, |e| {
                e.role(request.name.clone())
            })?;
        }

        let results: Vec<Result<RoleRun>> = if requests.len() == 1 {
            vec![executor.run_role(&requests[0])]
        } else {
            debug!(branches = requests.len(), "running parallel block");
            thread::scope(|scope| {
                let handles: Vec<_> = requests
                    .iter()
                    .map(|request| scope.spawn(move || executor.run_role(request)))
                    .collect();
                handles
                    .into_iter()
                    .map(|handle| {
                        handle
                            .join()
                            .unwrap_or_else(|_| Err(anyhow!("session thread panicked")))
                    })
                    .collect()
            })
        };

        let mut runs = Vec::with_capacity(results.len());
        for (request, result) in requests.iter().zip(results) {
            let role_run = result?;
            run.ledger.emit(EventKind::SessionEnd, run.iteration, |e| {
                e.role(request.name.clone())
                    .status(role_run.exit.label())
                    .data(serde_json::json!({ "exit_code": role_run.exit.code() }))
            })?;
            runs.push(role_run);
        }

        if let Some(failed) = runs.iter().find(|r| !r.exit.is_success()) {
            warn!(exit = failed.exit.label(), "session block failed; nothing published");
            return Ok(RoleRun {
                exit: failed.exit.clone(),
                last_message: None,
            });
        }
        for (decl, role_run) in sessions.iter().zip(&runs) {
            published.insert(
                decl.name.clone(),
                role_run.last_message.clone().unwrap_or_default(),
            );
        }
        last_message = runs.last().and_then(|r| r.last_message.clone());
    }

    if let Some(message) = &last_message {
        write_atomic(&run.base.last_message_file, message.as_bytes())?;
    }
    Ok(RoleRun {
        exit: RoleExit::Success,
        last_message,
    })
}

fn gather_context(decl: &SessionDecl, published: &HashMap<String, String>) -> Vec<ContextSection> {
    decl.context
        .iter()
        .filter_map(|name| {
            published.get(name).map(|text| ContextSection {
                name: name.clone(),
                text: text.clone(),
            })
        })
        .collect()
}

fn session_request(run: &ProgramRun<'_>, decl: &SessionDecl, prompt: String) -> RoleRequest {
    let name = format!("{}.{}", run.role, decl.name);
    RoleRequest {
        prompt_file: run.iteration_dir.join(format!("{name}.prompt.md")),
        last_message_file: run.iteration_dir.join(format!("{name}.last_message.txt")),
        log_path: role_log_path(run.iteration_dir, &name),
        name,
        prompt,
        ..run.base.clone()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;
    use crate::core::session_program::parse_program;
    use crate::core::types::TimeoutKind;
    use crate::io::events::read_events;
    use crate::test_support::{ScriptedRole, ScriptedRoleExecutor};

    const PROGRAM: &str = "\
session plan prompt=plan.md
parallel {
  session api prompt=api.md context=plan
  session ui prompt=ui.md context=plan
}
session merge prompt=merge.md context=api,ui
";

    fn base(dir: &Path) -> RoleRequest {
        RoleRequest {
            name: "implementer".to_string(),
            repo: dir.to_path_buf(),
            prompt: String::new(),
            prompt_file: dir.join("implementer.prompt.md"),
            last_message_file: dir.join("implementer.last_message.txt"),
            log_path: dir.join("implementer.log"),
            max_timeout: Duration::from_secs(60),
            inactivity_timeout: Duration::from_secs(60),
        }
    }

    fn render(decl: &SessionDecl, context: &[ContextSection]) -> Result<String> {
        let names: Vec<&str> = context.iter().map(|c| c.text.as_str()).collect();
        Ok(format!("{} <- [{}]", decl.prompt, names.join(",")))
    }

    #[test]
    fn context_flows_between_statements() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = parse_program(PROGRAM).expect("parse");
        let executor = ScriptedRoleExecutor::new(vec![
            ScriptedRole::message("implementer.plan", "the plan"),
            ScriptedRole::message("implementer.api", "api out"),
            ScriptedRole::message("implementer.ui", "ui out"),
            ScriptedRole::message("implementer.merge", "merged <promise>DONE</promise>"),
        ]);
        let ledger = EventLedger::new(temp.path().join("events.jsonl"), "main", "run-1");
        let base = base(temp.path());

        let result = run_program(
            &executor,
            &ProgramRun {
                role: "implementer",
                program: &program,
                base: &base,
                iteration_dir: temp.path(),
                ledger: &ledger,
                iteration: 1,
            },
            render,
        )
        .expect("run");

        assert_eq!(result.exit, RoleExit::Success);
        assert_eq!(result.last_message.as_deref(), Some("merged <promise>DONE</promise>"));
        assert_eq!(
            std::fs::read_to_string(&base.last_message_file).expect("last message"),
            "merged <promise>DONE</promise>"
        );

        let prompts = executor.prompts();
        assert_eq!(prompts["implementer.api"], "api.md <- [the plan]");
        assert_eq!(prompts["implementer.merge"], "merge.md <- [api out,ui out]");

        let events = read_events(ledger.path()).expect("events");
        let starts = events.iter().filter(|e| e.event == EventKind::SessionStart).count();
        let ends = events.iter().filter(|e| e.event == EventKind::SessionEnd).count();
        assert_eq!((starts, ends), (4, 4));
    }

    #[test]
    fn failing_branch_fails_the_block_and_publishes_nothing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let program = parse_program(PROGRAM).expect("parse");
        let executor = ScriptedRoleExecutor::new(vec![
            ScriptedRole::message("implementer.plan", "the plan"),
            ScriptedRole::message("implementer.api", "api out"),
            ScriptedRole::exit("implementer.ui", RoleExit::TimedOut(TimeoutKind::Inactivity)),
        ]);
        let ledger = EventLedger::new(temp.path().join("events.jsonl"), "main", "run-1");
        let base = base(temp.path());

        let result = run_program(
            &executor,
            &ProgramRun {
                role: "implementer",
                program: &program,
                base: &base,
                iteration_dir: temp.path(),
                ledger: &ledger,
                iteration: 1,
            },
            render,
        )
        .expect("run");

        assert_eq!(result.exit, RoleExit::TimedOut(TimeoutKind::Inactivity));
        assert_eq!(result.last_message, None);
        assert!(!executor.prompts().contains_key("implementer.merge"));
        assert!(!base.last_message_file.exists());
    }
}
