//! Remote command execution over ssh.

use std::borrow::Cow;
use std::process::Stdio;

use anyhow::Context;
use jiji_client::entities::server::ServerRef;

/// The outcome of one remote command.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommandResult {
  pub code: i64,
  pub stdout: String,
  pub stderr: String,
}

impl CommandResult {
  pub fn success(&self) -> bool {
    self.code == 0
  }

  /// Combined output for error reporting, stderr first.
  pub fn combined(&self) -> String {
    match (
      self.stderr.trim().is_empty(),
      self.stdout.trim().is_empty(),
    ) {
      (false, false) => {
        format!("{}\n{}", self.stderr.trim(), self.stdout.trim())
      }
      (false, true) => self.stderr.trim().to_string(),
      (true, false) => self.stdout.trim().to_string(),
      (true, true) => String::new(),
    }
  }
}

/// Executes POSIX sh snippets against one host.
///
/// The deployment engine is generic over this, so tests drive it
/// with a scripted double instead of a live connection.
#[allow(async_fn_in_trait)]
pub trait RemoteShell {
  /// The server name this shell targets.
  fn host(&self) -> &str;

  /// Run the snippet, capturing exit code and output.
  /// Err means the host could not be reached at all.
  async fn execute_command(
    &self,
    cmd: &str,
  ) -> anyhow::Result<CommandResult>;
}

/// Production shell: shells out to the local `ssh` binary.
#[derive(Debug, Clone)]
pub struct SshShell {
  server: ServerRef,
}

impl SshShell {
  pub fn new(server: ServerRef) -> SshShell {
    SshShell { server }
  }

  fn ssh_args(&self) -> Vec<String> {
    let mut args = vec![
      String::from("-o"),
      String::from("BatchMode=yes"),
      String::from("-o"),
      String::from("StrictHostKeyChecking=accept-new"),
      String::from("-p"),
      self.server.port.to_string(),
    ];
    if let Some(key_file) = &self.server.key_file {
      args.push(String::from("-i"));
      args.push(key_file.display().to_string());
    }
    if let Some(proxy_jump) = &self.server.proxy_jump {
      args.push(String::from("-J"));
      args.push(proxy_jump.clone());
    }
    args.push(format!("{}@{}", self.server.user, self.server.host));
    args
  }
}

impl RemoteShell for SshShell {
  fn host(&self) -> &str {
    &self.server.name
  }

  async fn execute_command(
    &self,
    cmd: &str,
  ) -> anyhow::Result<CommandResult> {
    let mut args = self.ssh_args();
    args.push(
      shell_escape::escape(Cow::Borrowed(cmd)).into_owned(),
    );
    let output = tokio::process::Command::new("ssh")
      .args(&args)
      .stdin(Stdio::null())
      .output()
      .await
      .with_context(|| {
        format!("Failed to spawn ssh to {}", self.server.host)
      })?;
    // 255 is ssh's own connection failure code.
    let code = output.status.code().unwrap_or(-1) as i64;
    if code == 255 {
      return Err(anyhow::anyhow!(
        "Host {} unreachable over ssh | {}",
        self.server.host,
        String::from_utf8_lossy(&output.stderr).trim()
      ));
    }
    Ok(CommandResult {
      code,
      stdout: String::from_utf8_lossy(&output.stdout).to_string(),
      stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
  }
}

/// Scripted shell double for deployment tests: canned results by
/// command substring, full transcript recorded.
#[cfg(test)]
pub mod testing {
  use std::sync::Mutex;

  use super::{CommandResult, RemoteShell};

  pub struct RecordingShell {
    host: String,
    rules: Vec<(String, CommandResult)>,
    commands: Mutex<Vec<String>>,
    unreachable: bool,
  }

  impl RecordingShell {
    pub fn new(host: &str) -> RecordingShell {
      RecordingShell {
        host: host.to_string(),
        rules: Vec::new(),
        commands: Mutex::new(Vec::new()),
        unreachable: false,
      }
    }

    pub fn unreachable(host: &str) -> RecordingShell {
      RecordingShell {
        unreachable: true,
        ..RecordingShell::new(host)
      }
    }

    /// First matching rule wins; unmatched commands succeed with
    /// empty output.
    pub fn rule(
      mut self,
      pattern: &str,
      code: i64,
      stdout: &str,
      stderr: &str,
    ) -> RecordingShell {
      self.rules.push((
        pattern.to_string(),
        CommandResult {
          code,
          stdout: stdout.to_string(),
          stderr: stderr.to_string(),
        },
      ));
      self
    }

    pub fn commands(&self) -> Vec<String> {
      self.commands.lock().unwrap().clone()
    }
  }

  impl RemoteShell for RecordingShell {
    fn host(&self) -> &str {
      &self.host
    }

    async fn execute_command(
      &self,
      cmd: &str,
    ) -> anyhow::Result<CommandResult> {
      if self.unreachable {
        return Err(anyhow::anyhow!(
          "Host {} unreachable over ssh",
          self.host
        ));
      }
      self.commands.lock().unwrap().push(cmd.to_string());
      for (pattern, result) in &self.rules {
        if cmd.contains(pattern.as_str()) {
          return Ok(result.clone());
        }
      }
      Ok(CommandResult::default())
    }
  }
}

#[cfg(test)]
mod tests {
  use jiji_client::entities::server::{
    ServerConfig, ServerRef, SshConfig,
  };

  use super::*;

  #[test]
  fn ssh_args_carry_credentials() {
    let ssh = SshConfig {
      user: String::from("deploy"),
      port: 2222,
      key_file: Some(std::path::PathBuf::from("/keys/id")),
      proxy_jump: Some(String::from("bastion")),
    };
    let server = ServerRef::resolve(
      "web-1",
      &ServerConfig {
        host: String::from("10.0.0.1"),
        arch: Default::default(),
        user: None,
        port: None,
        key_file: None,
        proxy_jump: None,
      },
      &ssh,
    );
    let shell = SshShell::new(server);
    let args = shell.ssh_args();
    assert!(args.contains(&String::from("BatchMode=yes")));
    assert!(args.windows(2).any(|w| w[0] == "-p" && w[1] == "2222"));
    assert!(args.windows(2).any(|w| w[0] == "-i" && w[1] == "/keys/id"));
    assert!(
      args.windows(2).any(|w| w[0] == "-J" && w[1] == "bastion")
    );
    assert_eq!(args.last().unwrap(), "deploy@10.0.0.1");
  }
}
