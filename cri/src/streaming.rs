//! CRI streaming server for exec, attach, and port-forward.
//!
//! Kubernetes CRI uses a two-phase protocol for interactive operations:
//! 1. gRPC call registers a session and returns a streaming URL
//! 2. Kubelet connects to the URL over HTTP for the actual I/O
//!
//! Sessions are single-use tokens; either side closing the connection
//! tears down the channel without touching container lifecycle state.
//! Exec and attach bridge to synchronous command execution inside the
//! sandbox VM; port-forward proxies TCP straight to the VM's address.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::RwLock;
use tokio::time::Instant;

use kina_backend::VmBackend;

/// How long a registered session waits for kubelet to connect before
/// its token is invalidated.
const SESSION_TTL: Duration = Duration::from_secs(60);

/// A pending streaming session registered by a CRI gRPC call.
#[derive(Debug, Clone)]
pub struct StreamingSession {
    pub kind: SessionKind,
    /// Backend unit of the target sandbox.
    pub unit_id: String,
    /// Command to execute (exec only).
    pub cmd: Vec<String>,
    /// In-VM log path of the container (attach only).
    pub log_path: String,
    /// VM network address (port-forward only).
    pub network_address: String,
    /// Ports to forward (port-forward only).
    pub ports: Vec<i32>,
}

impl StreamingSession {
    pub fn exec(unit_id: impl Into<String>, cmd: Vec<String>) -> Self {
        Self {
            kind: SessionKind::Exec,
            unit_id: unit_id.into(),
            cmd,
            log_path: String::new(),
            network_address: String::new(),
            ports: vec![],
        }
    }

    pub fn attach(unit_id: impl Into<String>, log_path: impl Into<String>) -> Self {
        Self {
            kind: SessionKind::Attach,
            unit_id: unit_id.into(),
            cmd: vec![],
            log_path: log_path.into(),
            network_address: String::new(),
            ports: vec![],
        }
    }

    pub fn port_forward(network_address: impl Into<String>, ports: Vec<i32>) -> Self {
        Self {
            kind: SessionKind::PortForward,
            unit_id: String::new(),
            cmd: vec![],
            log_path: String::new(),
            network_address: network_address.into(),
            ports,
        }
    }
}

/// Type of CRI streaming session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionKind {
    Exec,
    Attach,
    PortForward,
}

type SessionMap = Arc<RwLock<HashMap<String, (StreamingSession, Instant)>>>;

/// Consume a token. Returns None for unknown tokens and for sessions
/// kubelet never picked up within the TTL.
async fn take_session(sessions: &SessionMap, token: &str) -> Option<StreamingSession> {
    let (session, registered) = sessions.write().await.remove(token)?;
    if registered.elapsed() >= SESSION_TTL {
        return None;
    }
    Some(session)
}

/// Streaming server handling HTTP connections from kubelet.
pub struct StreamingServer {
    addr: SocketAddr,
    backend: Arc<dyn VmBackend>,
    sessions: SessionMap,
}

impl StreamingServer {
    pub fn new(addr: SocketAddr, backend: Arc<dyn VmBackend>) -> Self {
        Self {
            addr,
            backend,
            sessions: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Get a handle for registering sessions.
    pub fn handle(&self) -> StreamingHandle {
        StreamingHandle {
            addr: self.addr,
            sessions: self.sessions.clone(),
        }
    }

    /// Start the streaming HTTP listener.
    pub async fn serve(self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(self.addr).await?;
        tracing::info!(addr = %self.addr, "CRI streaming server listening");

        loop {
            let (stream, peer) = listener.accept().await?;
            let sessions = self.sessions.clone();
            let backend = self.backend.clone();
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, peer, sessions, backend).await {
                    tracing::warn!(peer = %peer, error = %e, "Streaming connection failed");
                }
            });
        }
    }
}

/// Handle for registering streaming sessions from the gRPC services.
#[derive(Clone)]
pub struct StreamingHandle {
    addr: SocketAddr,
    sessions: SessionMap,
}

impl StreamingHandle {
    /// Register a session and return the URL kubelet should connect to.
    pub async fn register(&self, session: StreamingSession) -> String {
        let token = uuid::Uuid::new_v4().to_string();
        let kind = match session.kind {
            SessionKind::Exec => "exec",
            SessionKind::Attach => "attach",
            SessionKind::PortForward => "portforward",
        };
        let now = Instant::now();
        let mut sessions = self.sessions.write().await;
        // Drop tokens kubelet never came back for.
        sessions.retain(|_, entry| now.duration_since(entry.1) < SESSION_TTL);
        sessions.insert(token.clone(), (session, now));
        format!("http://{}/{}/{}", self.addr, kind, token)
    }

    #[cfg(test)]
    async fn take(&self, token: &str) -> Option<StreamingSession> {
        take_session(&self.sessions, token).await
    }

    #[cfg(test)]
    async fn session_count(&self) -> usize {
        self.sessions.read().await.len()
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    peer: SocketAddr,
    sessions: SessionMap,
    backend: Arc<dyn VmBackend>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let mut buf = vec![0u8; 8192];
    let n = stream.read(&mut buf).await?;
    let request = String::from_utf8_lossy(&buf[..n]);

    // Request line: GET /exec/<token> HTTP/1.1
    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        send_response(&mut stream, 400, "Bad Request").await?;
        return Ok(());
    }

    let segments: Vec<&str> = parts[1].trim_start_matches('/').split('/').collect();
    if segments.len() != 2 {
        send_response(&mut stream, 404, "Not Found").await?;
        return Ok(());
    }
    let token = segments[1];

    // One-shot: the token is consumed on first use.
    let session = match take_session(&sessions, token).await {
        Some(s) => s,
        None => {
            send_response(&mut stream, 404, "Session not found or expired").await?;
            return Ok(());
        }
    };

    tracing::info!(
        peer = %peer,
        kind = ?session.kind,
        unit_id = %session.unit_id,
        "Streaming session started"
    );

    match session.kind {
        SessionKind::Exec => handle_exec_stream(&mut stream, &session, &*backend).await,
        SessionKind::Attach => handle_attach_stream(&mut stream, &session, &*backend).await,
        SessionKind::PortForward => handle_port_forward_stream(&mut stream, &session).await,
    }
}

/// Run the command inside the VM and return captured output as JSON.
async fn handle_exec_stream(
    stream: &mut TcpStream,
    session: &StreamingSession,
    backend: &dyn VmBackend,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let engine = base64::engine::general_purpose::STANDARD;
    match backend.exec(&session.unit_id, &session.cmd).await {
        Ok(output) => {
            let body = format!(
                "{{\"exitCode\":{},\"stdout\":\"{}\",\"stderr\":\"{}\"}}",
                output.exit_code,
                engine.encode(&output.stdout),
                engine.encode(&output.stderr),
            );
            send_json(stream, &body).await?;
        }
        Err(e) => {
            send_response(stream, 502, &e.to_string()).await?;
        }
    }
    Ok(())
}

/// Attach delivers the container's captured log. The backend exposes no
/// interactive channel into the process, so this is output-only.
async fn handle_attach_stream(
    stream: &mut TcpStream,
    session: &StreamingSession,
    backend: &dyn VmBackend,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let upgrade =
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n";
    stream.write_all(upgrade.as_bytes()).await?;

    let cmd = vec!["cat".to_string(), session.log_path.clone()];
    match backend.exec(&session.unit_id, &cmd).await {
        Ok(output) => {
            stream.write_all(&output.stdout).await?;
        }
        Err(e) => {
            tracing::warn!(unit_id = %session.unit_id, error = %e, "Attach read failed");
        }
    }
    Ok(())
}

/// Proxy TCP bytes between kubelet and the VM's own address.
async fn handle_port_forward_stream(
    stream: &mut TcpStream,
    session: &StreamingSession,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let Some(port) = session.ports.first() else {
        send_response(stream, 400, "No ports specified").await?;
        return Ok(());
    };

    let target = format!("{}:{}", session.network_address, port);
    let vm_stream = match TcpStream::connect(&target).await {
        Ok(s) => s,
        Err(e) => {
            send_response(stream, 502, &format!("connect {}: {}", target, e)).await?;
            return Ok(());
        }
    };

    let upgrade =
        "HTTP/1.1 101 Switching Protocols\r\nConnection: Upgrade\r\nUpgrade: SPDY/3.1\r\n\r\n";
    stream.write_all(upgrade.as_bytes()).await?;

    let (mut client_read, mut client_write) = tokio::io::split(stream);
    let (mut vm_read, mut vm_write) = tokio::io::split(vm_stream);

    let client_to_vm = tokio::io::copy(&mut client_read, &mut vm_write);
    let vm_to_client = tokio::io::copy(&mut vm_read, &mut client_write);

    tokio::select! {
        r = client_to_vm => { let _ = r; }
        r = vm_to_client => { let _ = r; }
    }

    Ok(())
}

async fn send_json(stream: &mut TcpStream, body: &str) -> Result<(), std::io::Error> {
    let response = format!(
        "HTTP/1.1 200 OK\r\nContent-Type: application/json\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        body.len(),
        body,
    );
    stream.write_all(response.as_bytes()).await
}

async fn send_response(
    stream: &mut TcpStream,
    status: u16,
    body: &str,
) -> Result<(), std::io::Error> {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        502 => "Bad Gateway",
        _ => "Error",
    };
    let response = format!(
        "HTTP/1.1 {} {}\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status, status_text, body.len(), body,
    );
    stream.write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use kina_backend::mock::MockBackend;

    use super::*;

    fn server() -> StreamingServer {
        let addr: SocketAddr = "127.0.0.1:0".parse().unwrap();
        StreamingServer::new(addr, Arc::new(MockBackend::new()))
    }

    #[tokio::test]
    async fn test_register_exec_url() {
        let handle = server().handle();
        let url = handle
            .register(StreamingSession::exec("sb-1", vec!["ls".to_string()]))
            .await;
        assert!(url.starts_with("http://"));
        assert!(url.contains("/exec/"));
    }

    #[tokio::test]
    async fn test_register_attach_and_port_forward_urls() {
        let handle = server().handle();
        let attach = handle
            .register(StreamingSession::attach("sb-1", "/run/kina/c-1.log"))
            .await;
        assert!(attach.contains("/attach/"));

        let pf = handle
            .register(StreamingSession::port_forward("192.168.64.2", vec![8080]))
            .await;
        assert!(pf.contains("/portforward/"));
    }

    #[tokio::test]
    async fn test_session_is_single_use() {
        let handle = server().handle();
        let url = handle
            .register(StreamingSession::exec("sb-1", vec!["ls".to_string()]))
            .await;
        let token = url.rsplit('/').next().unwrap().to_string();

        assert!(handle.take(&token).await.is_some());
        assert!(handle.take(&token).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_unclaimed_session_expires() {
        let handle = server().handle();
        let url = handle
            .register(StreamingSession::exec("sb-1", vec!["ls".to_string()]))
            .await;
        let token = url.rsplit('/').next().unwrap().to_string();

        tokio::time::advance(SESSION_TTL + Duration::from_secs(1)).await;
        assert!(handle.take(&token).await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_register_sweeps_stale_sessions() {
        let handle = server().handle();
        handle
            .register(StreamingSession::exec("sb-1", vec!["ls".to_string()]))
            .await;
        tokio::time::advance(SESSION_TTL + Duration::from_secs(1)).await;

        handle
            .register(StreamingSession::attach("sb-1", "/run/kina/c-1.log"))
            .await;
        assert_eq!(handle.session_count().await, 1);
    }
}
