//! Initialization helpers for `.superloop/` scaffolding.

use std::fs;
use std::path::Path;

use anyhow::{Context, Result, anyhow};

use crate::io::paths::SuperloopPaths;

const DEFAULT_CONFIG: &str = include_str!("templates/config.toml");

const ROLE_PROMPTS: &[(&str, &str)] = &[
    (
        "planner",
        "# Planner\n\nRead the feature spec and maintain `.superloop/loops/main/plan.md` as a\nmarkdown checklist (`- [ ]` / `- [x]`) of concrete tasks.\n",
    ),
    (
        "implementer",
        "# Implementer\n\nPick the next unchecked item from the plan, implement it, and tick it off.\n",
    ),
    (
        "tester",
        "# Tester\n\nRun the test suite, fix what you broke, and record remaining failures in the plan.\n",
    ),
    (
        "reviewer",
        "# Reviewer\n\nReview the changes against the spec. When every plan item is done and the\nwork is complete, end your final message with:\n\n<promise>SUPERLOOP_COMPLETE</promise>\n",
    ),
];

const GITIGNORE: &str = "state.json\nloops/\n";

/// Options for `init_superloop`.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// If true, overwrite existing scaffolding files.
    pub force: bool,
}

/// Create `.superloop/` scaffolding in `repo`.
///
/// Fails if `.superloop/config.toml` already exists unless `options.force` is set.
pub fn init_superloop(repo: &Path, options: &InitOptions) -> Result<SuperloopPaths> {
    let paths = SuperloopPaths::new(repo);
    if paths.root.exists() && !paths.root.is_dir() {
        return Err(anyhow!(
            "superloop init: .superloop exists but is not a directory"
        ));
    }
    if paths.config.exists() && !options.force {
        return Err(anyhow!(
            "superloop init: .superloop/config.toml already exists (use --force to overwrite)"
        ));
    }

    write_file(&paths.config, DEFAULT_CONFIG)?;
    write_file(&paths.root.join(".gitignore"), GITIGNORE)?;
    for (role, prompt) in ROLE_PROMPTS {
        let path = paths.roles_dir.join(format!("{role}.md"));
        if path.exists() && !options.force {
            continue;
        }
        write_file(&path, prompt)?;
    }
    fs::create_dir_all(&paths.loops_dir)
        .with_context(|| format!("create directory {}", paths.loops_dir.display()))?;

    Ok(paths)
}

fn write_file(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    fs::write(path, contents).with_context(|| format!("write file {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::io::config::load_config;

    #[test]
    fn init_writes_a_loadable_config_and_role_prompts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_superloop(temp.path(), &InitOptions { force: false }).expect("init");

        let cfg = load_config(&paths.config).expect("default config is valid");
        assert_eq!(cfg.loops.len(), 1);
        assert_eq!(cfg.loops[0].roles.len(), 4);
        for role in &cfg.loops[0].roles {
            assert!(temp.path().join(&role.prompt).is_file(), "{}", role.prompt);
        }
        assert!(paths.loops_dir.is_dir());
    }

    #[test]
    fn init_without_force_refuses_existing_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        init_superloop(temp.path(), &InitOptions { force: false }).expect("init");
        let err = init_superloop(temp.path(), &InitOptions { force: false }).unwrap_err();
        assert!(err.to_string().contains("already exists"));
    }

    #[test]
    fn init_with_force_restores_config() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = init_superloop(temp.path(), &InitOptions { force: false }).expect("init");
        fs::write(&paths.config, "garbage").expect("write");

        init_superloop(temp.path(), &InitOptions { force: true }).expect("re-init");
        assert_eq!(fs::read_to_string(&paths.config).expect("read"), DEFAULT_CONFIG);
    }
}
