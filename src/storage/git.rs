//! Git backing for federation data
//!
//! Federation data is committed to a dedicated branch in a second working
//! copy of the content repository, so data commits never touch the content
//! checkout. Drives the `git` CLI through `tokio::process`.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;

use crate::config::GitConfig;
use crate::error::AppError;

/// Dedicated checkout of the federation data branch
#[derive(Debug)]
pub struct GitBacking {
    workdir: PathBuf,
    branch: String,
    content_branch: String,
    author_name: String,
    author_email: String,
    /// Set when the checkout lives in a temp dir owned by this process
    temp_dir: std::sync::Mutex<Option<tempfile::TempDir>>,
}

/// Result of preparing the checkout
#[derive(Debug)]
pub struct Checkout {
    pub backing: GitBacking,
    /// The data branch did not exist remotely and was created locally
    pub created_branch: bool,
}

/// Embed HTTPS credentials in a remote URL when configured
fn authenticated_remote(config: &GitConfig, repository: &str) -> Result<String, AppError> {
    let (Some(username), Some(password)) = (&config.username, &config.password) else {
        return Ok(repository.to_string());
    };

    let mut url = url::Url::parse(repository)
        .map_err(|e| AppError::Config(format!("storage.git.repository is not a URL: {}", e)))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Ok(repository.to_string());
    }
    url.set_username(username)
        .and_then(|_| url.set_password(Some(password)))
        .map_err(|_| AppError::Config("cannot embed git credentials in URL".to_string()))?;
    Ok(url.to_string())
}

async fn run_git(dir: Option<&Path>, args: &[&str]) -> Result<String, AppError> {
    let mut cmd = Command::new("git");
    if let Some(dir) = dir {
        cmd.arg("-C").arg(dir);
    }
    cmd.args(args)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = cmd
        .output()
        .await
        .map_err(|e| AppError::Storage(format!("failed to run git: {}", e)))?;

    if !output.status.success() {
        let subcommand = args
            .iter()
            .find(|arg| !arg.starts_with('-') && !arg.contains('='))
            .copied()
            .unwrap_or("git");
        return Err(AppError::Storage(format!(
            "git {} failed: {}",
            subcommand,
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

impl GitBacking {
    /// Clone the data branch, or create it from the content branch
    pub async fn checkout(config: &GitConfig) -> Result<Checkout, AppError> {
        let repository = config.repository.as_deref().ok_or_else(|| {
            AppError::Config("storage.git.repository is required for git backing".to_string())
        })?;
        let remote = authenticated_remote(config, repository)?;

        let (workdir, temp_dir) = match &config.checkout_path {
            Some(path) => {
                tokio::fs::create_dir_all(path)
                    .await
                    .map_err(|e| AppError::Storage(format!("cannot create checkout dir: {}", e)))?;
                (path.clone(), None)
            }
            None => {
                let temp = tempfile::Builder::new()
                    .prefix("folio-federation-")
                    .tempdir()
                    .map_err(|e| AppError::Storage(format!("cannot create temp dir: {}", e)))?;
                (temp.path().to_path_buf(), Some(temp))
            }
        };

        let backing = Self {
            workdir,
            branch: config.branch.clone(),
            content_branch: config.content_branch.clone(),
            author_name: config.author_name.clone(),
            author_email: config.author_email.clone(),
            temp_dir: std::sync::Mutex::new(temp_dir),
        };

        let created_branch = backing.prepare(&remote).await?;
        Ok(Checkout {
            backing,
            created_branch,
        })
    }

    /// Returns true when the data branch had to be created
    async fn prepare(&self, remote: &str) -> Result<bool, AppError> {
        let workdir = self.workdir.to_string_lossy().into_owned();

        if self.workdir.join(".git").exists() {
            tracing::info!(path = %workdir, "Reusing existing federation checkout");
            if let Err(error) = self.git(&["fetch", "origin"]).await {
                tracing::warn!(%error, "Failed to fetch federation checkout");
            }
            return match self.git(&["checkout", &self.branch]).await {
                Ok(_) => Ok(false),
                Err(_) => {
                    self.git(&["checkout", "-b", &self.branch]).await?;
                    Ok(true)
                }
            };
        }

        let cloned = run_git(
            None,
            &["clone", "--branch", &self.branch, remote, &workdir],
        )
        .await;

        match cloned {
            Ok(_) => {
                tracing::info!(branch = %self.branch, path = %workdir, "Cloned federation data branch");
                Ok(false)
            }
            Err(error) => {
                tracing::info!(
                    branch = %self.branch,
                    %error,
                    "Federation data branch not found, creating it"
                );
                run_git(
                    None,
                    &["clone", "--branch", &self.content_branch, remote, &workdir],
                )
                .await?;
                self.git(&["checkout", "-b", &self.branch]).await?;
                Ok(true)
            }
        }
    }

    async fn git(&self, args: &[&str]) -> Result<String, AppError> {
        run_git(Some(&self.workdir), args).await
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Merge the content branch into the data branch; failures are logged
    async fn merge_content_branch(&self) {
        if let Err(error) = self.git(&["fetch", "origin", &self.content_branch]).await {
            tracing::warn!(%error, "Failed to fetch content branch");
            return;
        }

        let merged = self
            .git(&[
                "-c",
                &format!("user.name={}", self.author_name),
                "-c",
                &format!("user.email={}", self.author_email),
                "merge",
                "--no-edit",
                "FETCH_HEAD",
            ])
            .await;

        if let Err(error) = merged {
            tracing::warn!(%error, "Failed to merge content branch, continuing without it");
            if let Err(abort_error) = self.git(&["merge", "--abort"]).await {
                tracing::debug!(error = %abort_error, "No merge to abort");
            }
        }
    }

    /// Stage, commit and push everything under `data_dir`
    ///
    /// Returns false when there was nothing to commit. Push failures are
    /// logged and do not fail the commit.
    pub async fn commit(&self, data_dir: &str, message: &str) -> Result<bool, AppError> {
        self.merge_content_branch().await;

        self.git(&["add", "-A", "--", data_dir]).await?;
        let status = self.git(&["status", "--porcelain", "--", data_dir]).await?;
        if status.trim().is_empty() {
            tracing::debug!("No federation data changes to commit");
            return Ok(false);
        }

        self.git(&[
            "-c",
            &format!("user.name={}", self.author_name),
            "-c",
            &format!("user.email={}", self.author_email),
            "commit",
            "-m",
            message,
        ])
        .await?;

        if let Err(error) = self.git(&["push", "-u", "origin", &self.branch]).await {
            tracing::warn!(%error, branch = %self.branch, "Failed to push federation data");
        }

        Ok(true)
    }

    /// Remove a temporary checkout. Persistent checkouts are left in place.
    pub fn cleanup(&self) {
        let temp = self
            .temp_dir
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .take();
        if let Some(temp) = temp {
            let path = temp.path().to_path_buf();
            if let Err(error) = temp.close() {
                tracing::warn!(%error, path = %path.display(), "Failed to remove federation checkout");
            }
        }
    }
}
