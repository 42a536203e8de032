//! Git and build steps for comparing two revisions of the server's source tree.
use std::{
    path::{Path, PathBuf},
    process::{Command, Output},
};

use tracing::{info, warn};

use crate::error::GitError;

/// A local checkout of the server sources.
#[derive(Debug, Clone)]
pub struct GitRepo {
    dir: PathBuf,
    venv: Option<PathBuf>,
}

impl GitRepo {
    /// Opens `dir`, failing unless it contains a `.git` entry.
    pub fn open(dir: impl AsRef<Path>, venv: Option<PathBuf>) -> Result<Self, GitError> {
        let dir = dir.as_ref();
        let dir = dir.canonicalize().unwrap_or_else(|_| dir.to_path_buf());
        if !dir.join(".git").exists() {
            return Err(GitError::NotARepository(dir.display().to_string()));
        }
        Ok(Self { dir, venv })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn git(&self, args: &[&str]) -> Result<String, GitError> {
        let mut command = Command::new("git");
        command.arg("-C").arg(&self.dir).args(args);
        let rendered = format!("git -C {} {}", self.dir.display(), args.join(" "));
        let output = run_captured(&mut command, &rendered)?;
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }

    pub fn fetch_tags(&self) -> Result<(), GitError> {
        info!("Fetching tags from origin...");
        self.git(&["fetch", "origin", "--tags"]).map(|_| ())
    }

    /// Checks out a branch, tag, or commit and returns the short commit hash.
    pub fn checkout(&self, reference: &str) -> Result<String, GitError> {
        info!("Checking out '{reference}'...");
        self.git(&["checkout", reference])?;
        let commit = self.current_commit()?;
        info!("Now at commit {commit}");
        Ok(commit)
    }

    /// Pulls with `--rebase` unless `reference` looks like a commit hash.
    ///
    /// Returns whether a pull happened. Pull failures are logged, not raised.
    pub fn pull(&self, reference: &str) -> bool {
        if looks_like_commit(reference) {
            info!("Ref '{reference}' looks like a commit hash, skipping pull");
            return false;
        }

        info!("Pulling latest changes for '{reference}'...");
        match self.git(&["pull", "--rebase"]) {
            Ok(_) => true,
            Err(err) => {
                warn!("Pull failed: {err}");
                false
            }
        }
    }

    /// Builds native extensions in place with the virtualenv's python.
    pub fn build(&self) -> Result<(), GitError> {
        let python = self
            .venv
            .as_ref()
            .map(|venv| venv.join("bin").join("python").display().to_string())
            .unwrap_or_else(|| "python".to_string());

        let rendered = format!("{python} setup.py build_ext --inplace");
        info!("Building with: {rendered}");

        let mut command = Command::new(&python);
        command
            .args(["setup.py", "build_ext", "--inplace"])
            .current_dir(&self.dir);
        run_captured(&mut command, &rendered)?;

        info!("Build completed successfully");
        Ok(())
    }

    /// Current branch name, or `HEAD` when detached.
    pub fn current_branch(&self) -> Result<String, GitError> {
        self.git(&["rev-parse", "--abbrev-ref", "HEAD"])
    }

    /// Short hash of `HEAD`.
    pub fn current_commit(&self) -> Result<String, GitError> {
        self.git(&["rev-parse", "--short", "HEAD"])
    }

    /// Whether the working tree has uncommitted changes.
    pub fn is_dirty(&self) -> Result<bool, GitError> {
        self.git(&["status", "--porcelain"])
            .map(|status| !status.is_empty())
    }
}

fn run_captured(command: &mut Command, rendered: &str) -> Result<Output, GitError> {
    let output = command.output().map_err(|source| GitError::Spawn {
        command: rendered.to_string(),
        source,
    })?;

    if !output.status.success() {
        return Err(GitError::CommandFailed {
            command: rendered.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output)
}

/// 7 to 40 lowercase hex characters.
pub fn looks_like_commit(reference: &str) -> bool {
    (7..=40).contains(&reference.len())
        && reference
            .chars()
            .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::tempdir;

    fn git_in(dir: &Path, args: &[&str]) {
        let status = Command::new("git")
            .arg("-C")
            .arg(dir)
            .args(["-c", "user.email=bench@example.com", "-c", "user.name=bench"])
            .args(args)
            .status()
            .unwrap();
        assert!(status.success(), "git {args:?} failed");
    }

    fn init_repo(dir: &Path) -> Option<GitRepo> {
        if !crate::server::tool_available("git") {
            return None;
        }
        git_in(dir, &["init", "-q"]);
        git_in(dir, &["checkout", "-q", "-b", "bench"]);
        git_in(dir, &["commit", "-q", "--allow-empty", "-m", "init"]);
        Some(GitRepo::open(dir, None).unwrap())
    }

    #[test]
    fn commit_hashes_are_detected() {
        assert!(looks_like_commit("abc1234"));
        assert!(looks_like_commit("0123456789abcdef0123456789abcdef01234567"));
        assert!(!looks_like_commit("abc123"));
        assert!(!looks_like_commit("main"));
        assert!(!looks_like_commit("ABC1234"));
        assert!(!looks_like_commit("v0.10.1"));
    }

    #[test]
    fn open_rejects_plain_directory() {
        let dir = tempdir().unwrap();
        assert!(matches!(
            GitRepo::open(dir.path(), None),
            Err(GitError::NotARepository(_))
        ));
    }

    #[test]
    fn reports_branch_commit_and_dirty_state() {
        let dir = tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()) else {
            return;
        };

        assert_eq!(repo.current_branch().unwrap(), "bench");
        let commit = repo.current_commit().unwrap();
        assert!(looks_like_commit(&commit));
        assert!(!repo.is_dirty().unwrap());

        fs::write(dir.path().join("file.txt"), "x").unwrap();
        assert!(repo.is_dirty().unwrap());
    }

    #[test]
    fn checkout_of_commit_detaches_head() {
        let dir = tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()) else {
            return;
        };
        let commit = repo.current_commit().unwrap();

        assert_eq!(repo.checkout(&commit).unwrap(), commit);
        assert_eq!(repo.current_branch().unwrap(), "HEAD");
    }

    #[test]
    fn checkout_of_unknown_ref_carries_stderr() {
        let dir = tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()) else {
            return;
        };
        match repo.checkout("no-such-branch") {
            Err(GitError::CommandFailed { stderr, .. }) => assert!(!stderr.is_empty()),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn pull_skips_hashes_and_swallows_failures() {
        let dir = tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()) else {
            return;
        };
        assert!(!repo.pull("abc1234"));
        // No remote configured.
        assert!(!repo.pull("bench"));
    }

    #[test]
    fn build_failure_is_reported() {
        let dir = tempdir().unwrap();
        let Some(repo) = init_repo(dir.path()) else {
            return;
        };
        let repo = GitRepo {
            venv: Some(dir.path().join("missing-venv")),
            ..repo
        };
        assert!(matches!(repo.build(), Err(GitError::Spawn { .. })));
    }
}
