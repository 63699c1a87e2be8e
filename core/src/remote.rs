//! Remote sessions
//!
//! A [`Connector`] opens one long-lived shell per run. Sessions expose raw
//! byte streams so the multiplexer can feed scripts while output is read.

use async_trait::async_trait;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};
use tracing::{debug, instrument};

use crate::{Error, Host, Result, SshTarget, Transport};

/// Open remote shell
pub struct Session {
    pub stdin: Box<dyn AsyncWrite + Send + Unpin>,
    pub stdout: Box<dyn AsyncRead + Send + Unpin>,
    pub stderr: Box<dyn AsyncRead + Send + Unpin>,
    pub handle: Box<dyn SessionHandle>,
}

/// Lifecycle of an open session
#[async_trait]
pub trait SessionHandle: Send {
    /// Wait for the session to end, returning its exit code if any
    async fn wait(&mut self) -> Result<Option<i32>>;

    /// Tear the session down, ending both output streams
    async fn close(&mut self) -> Result<()>;
}

/// Session factory
#[async_trait]
pub trait Connector: Send + Sync {
    /// Open a session running `bootstrap` on the other side
    async fn connect(&self, bootstrap: &str) -> Result<Session>;

    /// Human readable destination, for logs
    fn describe(&self) -> String;
}

/// Child process backing a session
struct ChildHandle {
    child: Child,
}

#[async_trait]
impl SessionHandle for ChildHandle {
    async fn wait(&mut self) -> Result<Option<i32>> {
        let status = self.child.wait().await?;
        Ok(status.code())
    }

    async fn close(&mut self) -> Result<()> {
        match self.child.kill().await {
            Ok(()) => Ok(()),
            // Already gone
            Err(e) if e.kind() == std::io::ErrorKind::InvalidInput => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

pub(crate) fn spawn_session(mut command: Command) -> Result<Session> {
    let mut child = command
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| Error::Transport(format!("Failed to spawn session: {}", e)))?;

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| Error::Transport("session has no stdin".into()))?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| Error::Transport("session has no stdout".into()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| Error::Transport("session has no stderr".into()))?;

    Ok(Session {
        stdin: Box::new(stdin),
        stdout: Box::new(stdout),
        stderr: Box::new(stderr),
        handle: Box::new(ChildHandle { child }),
    })
}

/// Sessions through the system `ssh` client
pub struct SshConnector {
    target: SshTarget,
    connect_timeout: Duration,
}

impl SshConnector {
    /// Create a new SSH connector
    pub fn new(target: SshTarget, connect_timeout: Duration) -> Self {
        Self {
            target,
            connect_timeout,
        }
    }

    fn command(&self, bootstrap: &str) -> Command {
        let mut ssh_cmd = Command::new("ssh");
        ssh_cmd
            .arg("-T")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new")
            .arg("-o")
            .arg(format!(
                "ConnectTimeout={}",
                self.connect_timeout.as_secs().max(1)
            ));

        for option in &self.target.options {
            ssh_cmd.arg("-o").arg(option);
        }

        if let Some(key_path) = &self.target.key_path {
            ssh_cmd.arg("-i").arg(key_path);
        }

        ssh_cmd
            .arg("-p")
            .arg(self.target.port.to_string())
            .arg(format!("{}@{}", self.target.user, self.target.host))
            .arg(bootstrap);
        ssh_cmd
    }
}

#[async_trait]
impl Connector for SshConnector {
    #[instrument(skip(self), fields(target = %self.describe()))]
    async fn connect(&self, bootstrap: &str) -> Result<Session> {
        debug!("Opening SSH session");
        spawn_session(self.command(bootstrap))
    }

    fn describe(&self) -> String {
        Transport::Ssh(self.target.clone()).display()
    }
}

/// Sessions in a local shell
#[derive(Default)]
pub struct LocalConnector;

#[async_trait]
impl Connector for LocalConnector {
    async fn connect(&self, bootstrap: &str) -> Result<Session> {
        debug!(bootstrap = %bootstrap, "Opening local session");
        let mut command = Command::new("sh");
        command.arg("-c").arg(bootstrap);
        spawn_session(command)
    }

    fn describe(&self) -> String {
        Transport::Local.display()
    }
}

/// Build the connector matching a host's transport
pub fn connector_for(host: &Host) -> Arc<dyn Connector> {
    match &host.transport {
        Transport::Local => Arc::new(LocalConnector),
        Transport::Ssh(target) => Arc::new(SshConnector::new(
            target.clone(),
            // Leave room for the run deadline after a slow dial
            host.connection_time_warn * 3,
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_ssh_command_line() {
        let connector = SshConnector::new(
            SshTarget {
                host: "db1.example.org".to_string(),
                port: 2222,
                user: "monitor".to_string(),
                key_path: Some(PathBuf::from("/etc/hostwatch/id_ed25519")),
                options: vec!["Compression=yes".to_string()],
            },
            Duration::from_secs(30),
        );
        let command = connector.command("bash -s --");
        let args: Vec<String> = command
            .as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect();

        assert_eq!(command.as_std().get_program(), "ssh");
        assert!(args.contains(&"ConnectTimeout=30".to_string()));
        assert!(args.contains(&"Compression=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
        assert!(args.windows(2).any(|w| w == ["-i", "/etc/hostwatch/id_ed25519"]));
        assert_eq!(
            &args[args.len() - 2..],
            ["monitor@db1.example.org", "bash -s --"]
        );
        assert_eq!(connector.describe(), "monitor@db1.example.org:2222");
    }

    #[tokio::test]
    async fn test_local_session_round_trip() {
        use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

        let mut session = LocalConnector.connect("bash -s --").await.unwrap();
        session.stdin.write_all(b"echo 'CPU: 3'\n").await.unwrap();
        drop(session.stdin);

        let mut lines = BufReader::new(session.stdout).lines();
        assert_eq!(lines.next_line().await.unwrap().as_deref(), Some("CPU: 3"));
        assert_eq!(session.handle.wait().await.unwrap(), Some(0));
    }
}
