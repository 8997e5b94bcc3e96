//! File transfer over the system `ssh` client.
//!
//! Uploads stream the file through `cat` on the remote side, so no local
//! temporary file is needed. Authentication is whatever the user's ssh
//! configuration provides (agent, keys); password prompts are disabled.

use crate::backend::FileTransfer;
use crate::error::{Error, Result};
use std::io::Write;
use std::process::{Command, Output, Stdio};

/// [`FileTransfer`] backed by `ssh <user>@<host>`.
pub struct SshTransfer {
    user: String,
    ssh_path: String,
}

impl SshTransfer {
    /// Transfer files as `user`.
    pub fn new(user: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            ssh_path: "ssh".to_string(),
        }
    }

    /// Use a specific ssh binary.
    pub fn with_ssh_path(mut self, path: impl Into<String>) -> Self {
        self.ssh_path = path.into();
        self
    }

    fn command(&self, host: &str, remote: &str) -> Command {
        let destination = format!("{}@{host}", self.user);
        let mut cmd = Command::new(&self.ssh_path);
        cmd.args([
            "-o",
            "BatchMode=yes",
            "-o",
            "StrictHostKeyChecking=accept-new",
            destination.as_str(),
            remote,
        ]);
        cmd
    }

    fn check(host: &str, path: &str, output: &Output) -> Result<()> {
        if output.status.success() {
            return Ok(());
        }
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if stderr.contains("No such file") {
            return Err(Error::NotFound {
                what: format!("{host}:{path}"),
            });
        }
        Err(Error::Transfer {
            host: host.to_string(),
            path: path.to_string(),
            message: stderr,
        })
    }
}

/// Single-quote a path for the remote shell.
fn quote(path: &str) -> String {
    format!("'{}'", path.replace('\'', r"'\''"))
}

impl FileTransfer for SshTransfer {
    fn upload(&self, host: &str, path: &str, contents: &[u8]) -> Result<()> {
        let mut child = self
            .command(host, &format!("cat > {}", quote(path)))
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(contents)?;
        }

        let output = child.wait_with_output()?;
        log::debug!("uploaded {} bytes to {host}:{path}", contents.len());
        Self::check(host, path, &output)
    }

    fn remove(&self, host: &str, path: &str) -> Result<()> {
        let output = self
            .command(host, &format!("rm {}", quote(path)))
            .output()?;
        Self::check(host, path, &output)
    }
}
