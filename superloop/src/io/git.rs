//! Git adapter used for working-tree fingerprints.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument};

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Tracked plus untracked-but-not-ignored files, relative to the workdir.
    #[instrument(skip_all)]
    pub fn list_files(&self) -> Result<Vec<String>> {
        let output = self.run_checked(&["ls-files", "-co", "--exclude-standard", "-z"])?;
        let files = parse_nul_separated(&output.stdout);
        debug!(count = files.len(), "listed working tree files");
        Ok(files)
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Split `-z` output into sorted, de-duplicated paths.
fn parse_nul_separated(stdout: &[u8]) -> Vec<String> {
    let mut files: Vec<String> = stdout
        .split(|b| *b == 0)
        .filter(|chunk| !chunk.is_empty())
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect();
    files.sort();
    files.dedup();
    files
}
