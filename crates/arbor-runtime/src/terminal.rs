use std::collections::HashMap;
use std::process::Stdio;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use arbor_types::{TerminalOutputResponse, TerminalSessionInfo};
use arbor_workspace::{Workspace, WorkspaceError};

const OUTPUT_BUFFER_CAP: usize = 200_000;

#[derive(Debug, thiserror::Error)]
pub enum TerminalError {
    #[error("terminal session not found: {0}")]
    NotFound(String),
    #[error("shell must be an absolute path")]
    BadShell,
    #[error(transparent)]
    Workspace(#[from] WorkspaceError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
struct TerminalSession {
    id: String,
    cwd: String,
    shell: String,
    // Drained on every read: the buffer holds output since the last poll.
    output: Arc<RwLock<String>>,
    stdin: Arc<Mutex<ChildStdin>>,
    child: Arc<Mutex<Child>>,
    dims: Arc<RwLock<(u16, u16)>>,
}

/// Shell sessions reachable by id. The session id is the capability: any
/// caller holding it may read and write; create/close are serialized through
/// the sessions map.
#[derive(Clone)]
pub struct TerminalManager {
    workspace: Workspace,
    sessions: Arc<RwLock<HashMap<String, TerminalSession>>>,
}

impl TerminalManager {
    pub fn new(workspace: Workspace) -> Self {
        Self {
            workspace,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Spawn a shell with its cwd clamped inside the workspace.
    pub async fn create(
        &self,
        cwd: &str,
        shell: &str,
    ) -> Result<TerminalSessionInfo, TerminalError> {
        let shell = if shell.trim().is_empty() {
            "/bin/bash"
        } else {
            shell.trim()
        };
        if !shell.starts_with('/') {
            return Err(TerminalError::BadShell);
        }
        let cwd_path = if cwd.trim().is_empty() {
            self.workspace.root().to_path_buf()
        } else {
            self.workspace.resolve(cwd.trim())?
        };

        let mut command = Command::new(shell);
        if shell.ends_with("bash") {
            command.args(["--noprofile", "--norc", "-i"]);
        } else {
            command.arg("-i");
        }
        let mut child = command
            .current_dir(&cwd_path)
            .env("TERM", "xterm-256color")
            .env("PS1", r"\W $ ")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| std::io::Error::other("stdin unavailable"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| std::io::Error::other("stdout unavailable"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| std::io::Error::other("stderr unavailable"))?;

        let output = Arc::new(RwLock::new(String::new()));
        tokio::spawn(pump_stream(output.clone(), stdout));
        tokio::spawn(pump_stream(output.clone(), stderr));

        let session = TerminalSession {
            id: Uuid::new_v4().to_string(),
            cwd: cwd_path.display().to_string(),
            shell: shell.to_string(),
            output,
            stdin: Arc::new(Mutex::new(stdin)),
            child: Arc::new(Mutex::new(child)),
            dims: Arc::new(RwLock::new((80, 24))),
        };
        let info = self.info_of(&session, String::new()).await;
        self.sessions
            .write()
            .await
            .insert(session.id.clone(), session);
        Ok(info)
    }

    pub async fn write_input(&self, id: &str, data: &str) -> Result<(), TerminalError> {
        let session = self.session(id).await?;
        let mut stdin = session.stdin.lock().await;
        stdin.write_all(data.as_bytes()).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Return and clear everything buffered since the previous read.
    pub async fn read_output(&self, id: &str) -> Result<TerminalOutputResponse, TerminalError> {
        let session = self.session(id).await?;
        let output = {
            let mut buffer = session.output.write().await;
            std::mem::take(&mut *buffer)
        };
        let (alive, exit_code) = session_status(&session).await;
        Ok(TerminalOutputResponse {
            session_id: id.to_string(),
            output,
            alive,
            exit_code,
        })
    }

    /// Plain-pipe shells have no winsize; dimensions are recorded so clients
    /// agree on geometry.
    pub async fn resize(&self, id: &str, cols: u16, rows: u16) -> Result<(), TerminalError> {
        let session = self.session(id).await?;
        *session.dims.write().await = (cols, rows);
        Ok(())
    }

    pub async fn close(&self, id: &str) -> Result<(), TerminalError> {
        let session = self
            .sessions
            .write()
            .await
            .remove(id)
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))?;
        let mut child = session.child.lock().await;
        let _ = child.kill().await;
        Ok(())
    }

    pub async fn info(&self, id: &str) -> Result<TerminalSessionInfo, TerminalError> {
        let session = self.session(id).await?;
        let output = session.output.read().await.clone();
        Ok(self.info_of(&session, output).await)
    }

    async fn info_of(&self, session: &TerminalSession, output: String) -> TerminalSessionInfo {
        let (alive, exit_code) = session_status(session).await;
        TerminalSessionInfo {
            session_id: session.id.clone(),
            cwd: session.cwd.clone(),
            shell: session.shell.clone(),
            alive,
            exit_code,
            output,
        }
    }

    async fn session(&self, id: &str) -> Result<TerminalSession, TerminalError> {
        self.sessions
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| TerminalError::NotFound(id.to_string()))
    }
}

async fn session_status(session: &TerminalSession) -> (bool, Option<i32>) {
    let mut child = session.child.lock().await;
    match child.try_wait() {
        Ok(Some(status)) => (false, status.code()),
        Ok(None) => (true, None),
        Err(_) => (false, None),
    }
}

async fn pump_stream(
    output: Arc<RwLock<String>>,
    mut stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
) {
    let mut buf = vec![0u8; 4096];
    loop {
        let read = match stream.read(&mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(n) => n,
        };
        let chunk = String::from_utf8_lossy(&buf[..read]).to_string();
        let mut out = output.write().await;
        out.push_str(&chunk);
        // Keep the tail if a client stops polling.
        if out.len() > OUTPUT_BUFFER_CAP {
            let cut = out.len() - OUTPUT_BUFFER_CAP / 2;
            let tail = out.split_off(cut);
            *out = tail;
        }
    }
}
