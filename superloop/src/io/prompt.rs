//! Role prompt assembly: the configured prompt file plus a loop footer.

use std::fs;
use std::path::Path;
use std::sync::LazyLock;

use anyhow::{Context, Result};
use minijinja::{Environment, context};
use serde::Serialize;

const ROLE_TEMPLATE: &str = include_str!("templates/role_prompt.md");

static ENGINE: LazyLock<PromptEngine> = LazyLock::new(PromptEngine::new);

/// Template engine wrapper around minijinja.
struct PromptEngine {
    env: Environment<'static>,
}

impl PromptEngine {
    fn new() -> Self {
        let mut env = Environment::new();
        env.add_template("role", ROLE_TEMPLATE)
            .expect("role prompt template should be valid");
        Self { env }
    }
}

/// Output of an earlier session handed to a later one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ContextSection {
    pub name: String,
    pub text: String,
}

#[derive(Debug, Clone)]
pub struct RolePromptInput<'a> {
    pub role: &'a str,
    pub loop_id: &'a str,
    pub iteration: u32,
    pub max_iterations: u32,
    pub spec_file: &'a str,
    pub completion_promise: &'a str,
    /// Loop state directory, relative to the repository root.
    pub state_dir: &'a str,
    pub body: &'a str,
    pub context: &'a [ContextSection],
}

pub fn render_role_prompt(input: &RolePromptInput<'_>) -> Result<String> {
    let template = ENGINE.env.get_template("role")?;
    let mut rendered = template.render(context! {
        role => input.role,
        loop_id => input.loop_id,
        iteration => input.iteration,
        max_iterations => input.max_iterations,
        spec_file => input.spec_file,
        completion_promise => input.completion_promise,
        state_dir => input.state_dir,
        body => input.body.trim_end(),
        context => input.context,
    })?;
    rendered.push('\n');
    Ok(rendered)
}

/// Read a prompt file relative to the repository root.
pub fn read_prompt_body(repo: &Path, rel: &str) -> Result<String> {
    let path = repo.join(rel);
    fs::read_to_string(&path).with_context(|| format!("read prompt {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input<'a>(context: &'a [ContextSection]) -> RolePromptInput<'a> {
        RolePromptInput {
            role: "implementer",
            loop_id: "main",
            iteration: 2,
            max_iterations: 5,
            spec_file: "SPEC.md",
            completion_promise: "DONE",
            state_dir: ".superloop/loops/main",
            body: "Implement the next task.\n\n",
            context,
        }
    }

    #[test]
    fn footer_names_loop_and_promise() {
        let prompt = render_role_prompt(&input(&[])).expect("render");
        assert!(prompt.starts_with("Implement the next task.\n\n<superloop>"));
        assert!(prompt.contains("iteration: 2 of 5"));
        assert!(prompt.contains("<promise>DONE</promise>"));
        assert!(!prompt.contains("<context"));
    }

    #[test]
    fn context_sections_follow_in_order() {
        let sections = vec![
            ContextSection {
                name: "plan".to_string(),
                text: "step one".to_string(),
            },
            ContextSection {
                name: "api".to_string(),
                text: "endpoints done".to_string(),
            },
        ];
        let prompt = render_role_prompt(&input(&sections)).expect("render");
        let plan = prompt.find("<context session=\"plan\">").expect("plan");
        let api = prompt.find("<context session=\"api\">").expect("api");
        assert!(plan < api);
        assert!(prompt.ends_with("endpoints done\n</context>\n"));
    }

    #[test]
    fn missing_prompt_file_names_the_path() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = read_prompt_body(temp.path(), "roles/none.md").unwrap_err();
        assert!(format!("{err:#}").contains("roles/none.md"));
    }
}
