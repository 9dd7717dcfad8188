//! Parser for multi-session role programs.
//!
//! A program is line-oriented:
//!
//! ```text
//! # comments and blank lines are ignored
//! session plan prompt=prompts/plan.md
//! parallel {
//!   session api prompt=prompts/api.md context=plan
//!   session ui prompt=prompts/ui.md context=plan
//! }
//! session merge prompt=prompts/merge.md context=api,ui
//! ```
//!
//! Each session becomes one supervised process. `context` names earlier
//! sessions whose output is appended to the session prompt. Sessions inside
//! one `parallel` block cannot reference each other.

use std::collections::HashSet;

use anyhow::{Result, anyhow, bail};

/// One `session` statement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDecl {
    pub name: String,
    /// Prompt path, relative to the repository root.
    pub prompt: String,
    pub context: Vec<String>,
    /// 1-indexed source line.
    pub line: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    Session(SessionDecl),
    Parallel {
        line: usize,
        sessions: Vec<SessionDecl>,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionProgram {
    pub statements: Vec<Statement>,
}

impl SessionProgram {
    pub fn session_count(&self) -> usize {
        self.statements
            .iter()
            .map(|stmt| match stmt {
                Statement::Session(_) => 1,
                Statement::Parallel { sessions, .. } => sessions.len(),
            })
            .sum()
    }
}

/// Parse and validate a session program.
pub fn parse_program(source: &str) -> Result<SessionProgram> {
    let mut statements = Vec::new();
    let mut open_block: Option<(usize, Vec<SessionDecl>)> = None;

    for (idx, raw) in source.lines().enumerate() {
        let line_no = idx + 1;
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        if line == "}" {
            let (start, sessions) = open_block
                .take()
                .ok_or_else(|| anyhow!("line {line_no}: '}}' without matching 'parallel {{'"))?;
            if sessions.is_empty() {
                bail!("line {start}: parallel block is empty");
            }
            statements.push(Statement::Parallel {
                line: start,
                sessions,
            });
            continue;
        }

        if let Some(rest) = line.strip_prefix("parallel") {
            if rest.trim() != "{" {
                bail!("line {line_no}: expected 'parallel {{'");
            }
            if open_block.is_some() {
                bail!("line {line_no}: nested parallel blocks are not supported");
            }
            open_block = Some((line_no, Vec::new()));
            continue;
        }

        let decl = parse_session(line, line_no)?;
        match open_block.as_mut() {
            Some((_, sessions)) => sessions.push(decl),
            None => statements.push(Statement::Session(decl)),
        }
    }

    if let Some((start, _)) = open_block {
        bail!("line {start}: parallel block is not closed");
    }
    if statements.is_empty() {
        bail!("program declares no sessions");
    }

    let program = SessionProgram { statements };
    validate_references(&program)?;
    Ok(program)
}

fn parse_session(line: &str, line_no: usize) -> Result<SessionDecl> {
    let mut parts = line.split_whitespace();
    if parts.next() != Some("session") {
        bail!("line {line_no}: expected 'session', 'parallel {{' or '}}'");
    }
    let name = parts
        .next()
        .ok_or_else(|| anyhow!("line {line_no}: session is missing a name"))?;
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
    {
        bail!("line {line_no}: invalid session name '{name}'");
    }

    let mut prompt = None;
    let mut context = Vec::new();
    for part in parts {
        let (key, value) = part
            .split_once('=')
            .ok_or_else(|| anyhow!("line {line_no}: expected key=value, got '{part}'"))?;
        match key {
            "prompt" => prompt = Some(value.to_string()),
            "context" => context.extend(
                value
                    .split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(str::to_string),
            ),
            other => bail!("line {line_no}: unknown session key '{other}'"),
        }
    }

    Ok(SessionDecl {
        name: name.to_string(),
        prompt: prompt
            .ok_or_else(|| anyhow!("line {line_no}: session '{name}' is missing prompt="))?,
        context,
        line: line_no,
    })
}

/// Names must be unique and context may only reference earlier statements.
fn validate_references(program: &SessionProgram) -> Result<()> {
    let mut published: HashSet<&str> = HashSet::new();
    let mut errors = Vec::new();

    for stmt in &program.statements {
        let decls: Vec<&SessionDecl> = match stmt {
            Statement::Session(decl) => vec![decl],
            Statement::Parallel { sessions, .. } => sessions.iter().collect(),
        };
        let mut block_names: HashSet<&str> = HashSet::new();
        for decl in &decls {
            if published.contains(decl.name.as_str()) || !block_names.insert(&decl.name) {
                errors.push(format!(
                    "line {}: duplicate session '{}'",
                    decl.line, decl.name
                ));
            }
            for dep in &decl.context {
                if !published.contains(dep.as_str()) {
                    errors.push(format!(
                        "line {}: session '{}' uses context '{}' which is not available yet",
                        decl.line, decl.name, dep
                    ));
                }
            }
        }
        published.extend(block_names);
    }

    if !errors.is_empty() {
        bail!("invalid session program:\n- {}", errors.join("\n- "));
    }
    Ok(())
}
