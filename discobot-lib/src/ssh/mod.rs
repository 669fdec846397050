//! SSH gateway: one listener, username == session ID.
//!
//! A handshake authenticates with the `none` method only; the username
//! routes to a running sandbox or the connection is rejected outright.
//! Session channels support shell (PTY attach), exec, and the sftp
//! subsystem; `direct-tcpip` channels tunnel through socat inside the
//! sandbox. Commands run as the sandbox's default user (`uid:gid` from
//! `user_info`).

pub mod hostkey;

use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;

use russh::server::{Auth, Config, Handler, Msg, Server, Session};
use russh::{Channel, ChannelId, CryptoVec, MethodSet};
use sandbox_runtime::{AttachOpts, ExecOpts, Provider, PtyControl, SandboxStatus};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};
use crate::model::SessionStatus;
use crate::store::Store;

const SFTP_SERVER: &str = "/usr/lib/openssh/sftp-server";

type SharedWriter = Arc<Mutex<Pin<Box<dyn tokio::io::AsyncWrite + Send>>>>;

pub struct SshGateway {
    store: Store,
    provider: Arc<dyn Provider>,
}

impl SshGateway {
    pub fn new(store: Store, provider: Arc<dyn Provider>) -> Self {
        Self { store, provider }
    }

    /// Serve until shutdown. The host key comes from `hostkey`.
    pub async fn run(
        mut self,
        addr: &str,
        host_key: russh_keys::PrivateKey,
        shutdown: CancellationToken,
    ) -> Result<()> {
        let config = Arc::new(Config {
            methods: MethodSet::NONE,
            keys: vec![host_key],
            ..Default::default()
        });
        let addr: SocketAddr = addr
            .parse()
            .map_err(|err| Error::Internal(format!("invalid SSH_ADDR '{addr}': {err}")))?;
        tracing::info!(%addr, "SSH gateway listening");
        tokio::select! {
            result = self.run_on_address(config, addr) => {
                result.map_err(|err| Error::Internal(format!("ssh server: {err}")))
            }
            _ = shutdown.cancelled() => Ok(()),
        }
    }
}

impl Server for SshGateway {
    type Handler = SshConnection;

    fn new_client(&mut self, peer: Option<SocketAddr>) -> SshConnection {
        SshConnection {
            store: self.store.clone(),
            provider: self.provider.clone(),
            peer,
            session_id: None,
            user_spec: String::new(),
            channels: HashMap::new(),
        }
    }
}

#[derive(Default)]
struct ChannelState {
    env: BTreeMap<String, String>,
    rows: u16,
    cols: u16,
    /// Write half of the in-sandbox process (shell, sftp), once started.
    stdin: Option<SharedWriter>,
    pty_control: Option<Box<dyn PtyControl>>,
}

pub struct SshConnection {
    store: Store,
    provider: Arc<dyn Provider>,
    peer: Option<SocketAddr>,
    /// Set at auth time; also the sandbox routing key.
    session_id: Option<String>,
    user_spec: String,
    channels: HashMap<ChannelId, ChannelState>,
}

impl SshConnection {
    fn reject() -> Auth {
        Auth::Reject {
            proceed_with_methods: None,
        }
    }

    fn session_id(&self) -> Result<&str> {
        self.session_id
            .as_deref()
            .ok_or_else(|| Error::Unauthorized("channel before auth".into()))
    }

    fn exec_opts(&self, channel: ChannelId) -> ExecOpts {
        ExecOpts {
            env: self
                .channels
                .get(&channel)
                .map(|state| state.env.clone())
                .unwrap_or_default(),
            stdin: None,
            user: self.user_spec.clone(),
        }
    }

    /// Pump process output to the channel, then propagate the exit status
    /// after all pending bytes are flushed (drain-on-close).
    fn pump_output(
        handle: russh::server::Handle,
        channel: ChannelId,
        mut stdout: Pin<Box<dyn tokio::io::AsyncRead + Send>>,
        exit: Pin<Box<dyn std::future::Future<Output = sandbox_runtime::Result<i64>> + Send>>,
    ) {
        tokio::spawn(async move {
            let mut buf = [0u8; 8192];
            loop {
                match stdout.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if handle
                            .data(channel, CryptoVec::from_slice(&buf[..n]))
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                }
            }
            let code = exit.await.unwrap_or(-1);
            let _ = handle
                .exit_status_request(channel, code.max(0) as u32)
                .await;
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
    }
}

#[async_trait::async_trait]
impl Handler for SshConnection {
    type Error = russh::Error;

    /// Username == session ID. Unknown sessions and stopped sandboxes are
    /// rejected, closing the connection right after the handshake.
    async fn auth_none(&mut self, user: &str) -> std::result::Result<Auth, Self::Error> {
        let session = match self.store.get_session(user).await {
            Ok(session) => session,
            Err(_) => {
                tracing::info!(user, peer = ?self.peer, "ssh auth rejected: unknown session");
                return Ok(Self::reject());
            }
        };
        if session.status != SessionStatus::Running {
            return Ok(Self::reject());
        }
        match self.provider.get(user).await {
            Ok(handle) if handle.status == SandboxStatus::Running => {}
            _ => return Ok(Self::reject()),
        }
        self.user_spec = self
            .provider
            .user_info(user)
            .await
            .map(|info| info.user_spec())
            .unwrap_or_default();
        self.session_id = Some(user.to_string());
        Ok(Auth::Accept)
    }

    async fn channel_open_session(
        &mut self,
        channel: Channel<Msg>,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        self.channels.insert(channel.id(), ChannelState::default());
        Ok(true)
    }

    async fn pty_request(
        &mut self,
        channel: ChannelId,
        term: &str,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _modes: &[(russh::Pty, u32)],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.cols = col_width.min(u16::MAX as u32) as u16;
            state.rows = row_height.min(u16::MAX as u32) as u16;
            state.env.insert("TERM".into(), term.to_string());
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn env_request(
        &mut self,
        channel: ChannelId,
        variable_name: &str,
        variable_value: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state
                .env
                .insert(variable_name.to_string(), variable_value.to_string());
        }
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn shell_request(
        &mut self,
        channel: ChannelId,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let session_id = match self.session_id() {
            Ok(id) => id.to_string(),
            Err(_) => {
                let _ = session.channel_failure(channel);
                return Ok(());
            }
        };
        let (env, rows, cols) = self
            .channels
            .get(&channel)
            .map(|s| (s.env.clone(), s.rows, s.cols))
            .unwrap_or_default();
        let opts = AttachOpts {
            env,
            rows,
            cols,
            user: self.user_spec.clone(),
        };
        match self.provider.attach(&session_id, opts).await {
            Ok(pty) => {
                if let Some(state) = self.channels.get_mut(&channel) {
                    state.stdin = Some(Arc::new(Mutex::new(pty.stdin)));
                    state.pty_control = Some(pty.control);
                }
                Self::pump_output(session.handle(), channel, pty.stdout, pty.exit);
                let _ = session.channel_success(channel);
            }
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "shell attach failed");
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn exec_request(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let session_id = match self.session_id() {
            Ok(id) => id.to_string(),
            Err(_) => {
                let _ = session.channel_failure(channel);
                return Ok(());
            }
        };
        // Malformed (non-UTF-8) commands degrade to a lossy string rather
        // than closing the connection.
        let command = String::from_utf8_lossy(data).to_string();
        let argv = vec!["/bin/sh".to_string(), "-c".to_string(), command];
        let opts = self.exec_opts(channel);
        let provider = self.provider.clone();
        let handle = session.handle();
        tokio::spawn(async move {
            match provider.exec(&session_id, &argv, opts).await {
                Ok(result) => {
                    if !result.stdout.is_empty() {
                        let _ = handle
                            .data(channel, CryptoVec::from_slice(&result.stdout))
                            .await;
                    }
                    if !result.stderr.is_empty() {
                        let _ = handle
                            .extended_data(channel, 1, CryptoVec::from_slice(&result.stderr))
                            .await;
                    }
                    let _ = handle
                        .exit_status_request(channel, result.exit_code.max(0) as u32)
                        .await;
                }
                Err(err) => {
                    let _ = handle
                        .extended_data(channel, 1, CryptoVec::from_slice(err.to_string().as_bytes()))
                        .await;
                    let _ = handle.exit_status_request(channel, 1).await;
                }
            }
            let _ = handle.eof(channel).await;
            let _ = handle.close(channel).await;
        });
        let _ = session.channel_success(channel);
        Ok(())
    }

    async fn subsystem_request(
        &mut self,
        channel: ChannelId,
        name: &str,
        session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if name != "sftp" {
            let _ = session.channel_failure(channel);
            return Ok(());
        }
        let session_id = match self.session_id() {
            Ok(id) => id.to_string(),
            Err(_) => {
                let _ = session.channel_failure(channel);
                return Ok(());
            }
        };
        let argv = vec![SFTP_SERVER.to_string()];
        let opts = self.exec_opts(channel);
        match self.provider.exec_stream(&session_id, &argv, opts).await {
            Ok(stream) => {
                if let Some(state) = self.channels.get_mut(&channel) {
                    state.stdin = Some(Arc::new(Mutex::new(stream.stdin)));
                }
                Self::pump_output(session.handle(), channel, stream.stdout, stream.exit);
                let _ = session.channel_success(channel);
            }
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "sftp subsystem failed");
                let _ = session.channel_failure(channel);
            }
        }
        Ok(())
    }

    async fn window_change_request(
        &mut self,
        channel: ChannelId,
        col_width: u32,
        row_height: u32,
        _pix_width: u32,
        _pix_height: u32,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        if let Some(state) = self.channels.get_mut(&channel) {
            state.cols = col_width.min(u16::MAX as u32) as u16;
            state.rows = row_height.min(u16::MAX as u32) as u16;
            if let Some(control) = &state.pty_control {
                let _ = control.resize(state.rows, state.cols).await;
            }
        }
        Ok(())
    }

    /// Client keystrokes / sftp packets flow into the process stdin.
    async fn data(
        &mut self,
        channel: ChannelId,
        data: &[u8],
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let writer = self
            .channels
            .get(&channel)
            .and_then(|state| state.stdin.clone());
        if let Some(writer) = writer {
            let mut writer = writer.lock().await;
            if writer.write_all(data).await.is_err() {
                tracing::debug!("stdin write failed; process likely exited");
            }
            let _ = writer.flush().await;
        }
        Ok(())
    }

    /// Half-close from the client: EOF the process stdin so it can drain
    /// and exit.
    async fn channel_eof(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        let writer = self
            .channels
            .get(&channel)
            .and_then(|state| state.stdin.clone());
        if let Some(writer) = writer {
            let _ = writer.lock().await.shutdown().await;
        }
        Ok(())
    }

    async fn channel_close(
        &mut self,
        channel: ChannelId,
        _session: &mut Session,
    ) -> std::result::Result<(), Self::Error> {
        self.channels.remove(&channel);
        Ok(())
    }

    /// Port forwarding: bridge the channel to socat inside the sandbox.
    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> std::result::Result<bool, Self::Error> {
        let Ok(session_id) = self.session_id() else {
            return Ok(false);
        };
        let session_id = session_id.to_string();
        let argv = vec![
            "socat".to_string(),
            "-".to_string(),
            format!("TCP:{host_to_connect}:{port_to_connect}"),
        ];
        let opts = ExecOpts {
            env: BTreeMap::new(),
            stdin: None,
            user: self.user_spec.clone(),
        };
        let stream = match self.provider.exec_stream(&session_id, &argv, opts).await {
            Ok(stream) => stream,
            Err(err) => {
                tracing::warn!(%session_id, error = %err, "direct-tcpip bridge failed");
                return Ok(false);
            }
        };
        tokio::spawn(async move {
            let mut channel_stream = channel.into_stream();
            let mut process = tokio::io::join(stream.stdout, stream.stdin);
            // Bidirectional copy flushes both sides before shutdown, so the
            // peer sees every pending byte.
            let _ = tokio::io::copy_bidirectional(&mut channel_stream, &mut process).await;
        });
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkspaceSource;
    use sandbox_runtime::{CreateOpts, MockProvider};

    async fn connection() -> (SshConnection, String) {
        let store = Store::open_in_memory().await.unwrap();
        let provider = Arc::new(MockProvider::new());

        let user = store.ensure_user("github", "1", "a").await.unwrap();
        let project = store.create_project("p", "P", &user.id).await.unwrap();
        let ws = store
            .create_workspace(&project.id, "main", "/tmp/ws", WorkspaceSource::Local, None)
            .await
            .unwrap();
        let session = store
            .create_session(&project.id, &ws.id, None, "s", None)
            .await
            .unwrap();
        store
            .update_session_status(&session.id, SessionStatus::Running, None)
            .await
            .unwrap();
        provider
            .create(&session.id, &CreateOpts::default())
            .await
            .unwrap();
        provider.start(&session.id).await.unwrap();

        let mut gateway = SshGateway::new(store, provider);
        (gateway.new_client(None), session.id)
    }

    #[tokio::test]
    async fn auth_accepts_running_session_usernames() {
        let (mut conn, session_id) = connection().await;
        let auth = conn.auth_none(&session_id).await.unwrap();
        assert!(matches!(auth, Auth::Accept));
        assert_eq!(conn.session_id.as_deref(), Some(session_id.as_str()));
        // uid:gid resolved from the sandbox's default user.
        assert_eq!(conn.user_spec, "1000:1000");
    }

    #[tokio::test]
    async fn auth_rejects_unknown_and_stopped_sessions() {
        let (mut conn, session_id) = connection().await;
        let auth = conn.auth_none("no-such-session").await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));

        conn.provider
            .stop(&session_id, std::time::Duration::from_secs(1))
            .await
            .unwrap();
        let auth = conn.auth_none(&session_id).await.unwrap();
        assert!(matches!(auth, Auth::Reject { .. }));
    }
}
