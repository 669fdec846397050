//! Docker backend: one container per session, agent-api port published to
//! the host, exec/attach over the Docker exec API.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use docktopus::bollard::container::{
    Config as BollardConfig, CreateContainerOptions, InspectContainerOptions,
    RemoveContainerOptions, StartContainerOptions, StopContainerOptions,
};
use docktopus::bollard::exec::{
    CreateExecOptions, ResizeExecOptions, StartExecOptions, StartExecResults,
};
use docktopus::bollard::image::CreateImageOptions;
use docktopus::bollard::models::{HostConfig, PortBinding, PortMap};
use docktopus::bollard::{API_DEFAULT_VERSION, Docker};
use futures::StreamExt;
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio_util::io::StreamReader;

use crate::config::RuntimeConfig;
use crate::error::{ProviderError, Result};
use crate::provider::{
    AttachOpts, CreateOpts, ExecOpts, ExecResult, ExecStream, Provider, ProxyRequest,
    ProxyResponse, Pty, PtyControl, SandboxHandle, SandboxStatus, UserInfo,
};

const SESSION_LABEL: &str = "discobot.session_id";
const OPTS_LABEL: &str = "discobot.opts_hash";

pub struct DockerProvider {
    config: RuntimeConfig,
    client: Docker,
    http: reqwest::Client,
    image_pulled: tokio::sync::OnceCell<()>,
}

impl DockerProvider {
    pub async fn connect(config: RuntimeConfig) -> Result<Self> {
        let client = match config.docker_host.as_deref() {
            Some(host) => Docker::connect_with_http(host, 120, API_DEFAULT_VERSION).map_err(
                |err| {
                    ProviderError::BackendUnavailable(format!(
                        "failed to connect to docker at {host}: {err}"
                    ))
                },
            )?,
            None => Docker::connect_with_local_defaults().map_err(|err| {
                ProviderError::BackendUnavailable(format!("failed to connect to docker: {err}"))
            })?,
        };
        // Redirects are never followed: the subdomain proxy contract forwards
        // them verbatim to the caller.
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ProviderError::Io(format!("failed to build HTTP client: {err}")))?;
        Ok(Self {
            config,
            client,
            http,
            image_pulled: tokio::sync::OnceCell::new(),
        })
    }

    fn client(&self) -> &Docker {
        &self.client
    }

    fn container_name(session_id: &str) -> String {
        format!("discobot-{session_id}")
    }

    /// Pull the sandbox image once per process if configured to do so.
    async fn ensure_image_pulled(&self, image: &str) -> Result<()> {
        let image = image.to_string();
        self.image_pulled
            .get_or_try_init(|| async {
                if self.config.pull_image {
                    let options = CreateImageOptions {
                        from_image: image.clone(),
                        ..Default::default()
                    };
                    let mut pull = self.client.create_image(Some(options), None, None);
                    while let Some(progress) = pull.next().await {
                        progress.map_err(|err| {
                            ProviderError::BackendUnavailable(format!(
                                "failed to pull image {image}: {err}"
                            ))
                        })?;
                    }
                }
                Ok::<(), ProviderError>(())
            })
            .await?;
        Ok(())
    }

    async fn inspect(
        &self,
        session_id: &str,
    ) -> Result<Option<docktopus::bollard::models::ContainerInspectResponse>> {
        let name = Self::container_name(session_id);
        match self
            .client()
            .inspect_container(&name, None::<InspectContainerOptions>)
            .await
        {
            Ok(inspect) => Ok(Some(inspect)),
            Err(docktopus::bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => Ok(None),
            Err(err) => Err(ProviderError::BackendUnavailable(format!(
                "failed to inspect container: {err}"
            ))),
        }
    }

    fn handle_from_inspect(
        &self,
        session_id: &str,
        inspect: &docktopus::bollard::models::ContainerInspectResponse,
    ) -> SandboxHandle {
        let status = match inspect.state.as_ref().and_then(|s| s.status.as_ref()) {
            Some(docktopus::bollard::models::ContainerStateStatusEnum::RUNNING) => {
                SandboxStatus::Running
            }
            Some(docktopus::bollard::models::ContainerStateStatusEnum::CREATED) => {
                SandboxStatus::Creating
            }
            _ => SandboxStatus::Stopped,
        };
        let http_port = inspect
            .network_settings
            .as_ref()
            .and_then(|settings| settings.ports.as_ref())
            .and_then(|ports| extract_host_port(ports, self.config.agent_port).ok());
        SandboxHandle {
            session_id: session_id.to_string(),
            status,
            host: http_port.map(|_| self.config.public_host.clone()),
            http_port,
        }
    }

    async fn agent_base_url(&self, session_id: &str) -> Result<String> {
        let inspect = self
            .inspect(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("no sandbox for '{session_id}'")))?;
        let handle = self.handle_from_inspect(session_id, &inspect);
        if handle.status != SandboxStatus::Running {
            return Err(ProviderError::NotRunning(format!(
                "sandbox for '{session_id}' is not running"
            )));
        }
        let port = handle.http_port.ok_or_else(|| {
            ProviderError::Io(format!("sandbox for '{session_id}' has no published port"))
        })?;
        Ok(format!("http://{}:{port}", self.config.public_host))
    }

    async fn start_exec(
        &self,
        session_id: &str,
        argv: &[String],
        env: &std::collections::BTreeMap<String, String>,
        user: &str,
        tty: bool,
        attach_stdin: bool,
    ) -> Result<(String, StartExecResults)> {
        let name = Self::container_name(session_id);
        let env_vars: Vec<String> = env.iter().map(|(k, v)| format!("{k}={v}")).collect();
        let options = CreateExecOptions {
            attach_stdin: Some(attach_stdin),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            tty: Some(tty),
            cmd: Some(argv.to_vec()),
            env: if env_vars.is_empty() {
                None
            } else {
                Some(env_vars)
            },
            user: if user.is_empty() {
                None
            } else {
                Some(user.to_string())
            },
            ..Default::default()
        };
        let created = self
            .client()
            .create_exec(&name, options)
            .await
            .map_err(|err| match err {
                docktopus::bollard::errors::Error::DockerResponseServerError {
                    status_code: 404,
                    ..
                } => ProviderError::NotFound(format!("no sandbox for '{session_id}'")),
                docktopus::bollard::errors::Error::DockerResponseServerError {
                    status_code: 409,
                    ..
                } => ProviderError::NotRunning(format!("sandbox for '{session_id}' is not running")),
                other => ProviderError::ExecFailed(format!("failed to create exec: {other}")),
            })?;
        let results = self
            .client()
            .start_exec(&created.id, Some(StartExecOptions::default()))
            .await
            .map_err(|err| ProviderError::ExecFailed(format!("failed to start exec: {err}")))?;
        Ok((created.id, results))
    }

    /// Poll the exec record until the process exits; yields its exit code.
    fn exec_waiter(
        &self,
        exec_id: String,
    ) -> impl std::future::Future<Output = Result<i64>> + Send + 'static {
        let client = self.client().clone();
        async move {
            loop {
                let inspect = client.inspect_exec(&exec_id).await.map_err(|err| {
                    ProviderError::ExecFailed(format!("failed to inspect exec: {err}"))
                })?;
                if inspect.running != Some(true) {
                    return Ok(inspect.exit_code.unwrap_or(-1));
                }
                tokio::time::sleep(Duration::from_millis(100)).await;
            }
        }
    }
}

/// Stable digest over creation parameters, stored as a container label so
/// re-creates can distinguish "same request again" from "conflicting request".
fn opts_hash(opts: &CreateOpts, image: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(image.as_bytes());
    for (k, v) in &opts.env {
        hasher.update(b"\0");
        hasher.update(k.as_bytes());
        hasher.update(b"=");
        hasher.update(v.as_bytes());
    }
    hasher.update(format!(
        "\0cpu={:?}\0mem={:?}\0ws={:?}\0vol={:?}",
        opts.cpu_cores, opts.memory_mb, opts.workspace_source, opts.data_volume
    ));
    let digest = hasher.finalize();
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn extract_host_port(ports: &PortMap, container_port: u16) -> Result<u16> {
    let key = format!("{container_port}/tcp");
    let bindings = ports
        .get(&key)
        .and_then(|v| v.as_ref())
        .ok_or_else(|| ProviderError::Io(format!("missing port bindings for {key}")))?;
    let host_port = bindings
        .first()
        .and_then(|binding| binding.host_port.as_ref())
        .ok_or_else(|| ProviderError::Io(format!("missing host port for {key}")))?;
    host_port
        .parse::<u16>()
        .map_err(|_| ProviderError::Io(format!("invalid host port for {key}")))
}

/// Map an attached exec's output frames into a plain byte reader.
/// Stderr frames are surfaced through tracing rather than the data path.
fn output_reader(
    output: impl futures::Stream<Item = std::result::Result<docktopus::bollard::container::LogOutput, docktopus::bollard::errors::Error>>
    + Send
    + 'static,
) -> impl tokio::io::AsyncRead + Send {
    let mapped = output.filter_map(|frame| async move {
        match frame {
            Ok(docktopus::bollard::container::LogOutput::StdErr { message }) => {
                tracing::debug!(len = message.len(), "exec stderr");
                None
            }
            Ok(frame) => Some(Ok(frame.into_bytes())),
            Err(err) => Some(Err(std::io::Error::other(err.to_string()))),
        }
    });
    StreamReader::new(Box::pin(mapped))
}

struct DockerPtyControl {
    client: Docker,
    exec_id: String,
}

#[async_trait]
impl PtyControl for DockerPtyControl {
    async fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        self.client
            .resize_exec(
                &self.exec_id,
                ResizeExecOptions {
                    height: rows,
                    width: cols,
                },
            )
            .await
            .map_err(|err| ProviderError::Io(format!("failed to resize pty: {err}")))
    }
}

#[async_trait]
impl Provider for DockerProvider {
    async fn create(&self, session_id: &str, opts: &CreateOpts) -> Result<SandboxHandle> {
        let image = if opts.image.is_empty() {
            self.config.image.clone()
        } else {
            opts.image.clone()
        };
        let hash = opts_hash(opts, &image);

        if let Some(existing) = self.inspect(session_id).await? {
            let existing_hash = existing
                .config
                .as_ref()
                .and_then(|c| c.labels.as_ref())
                .and_then(|l| l.get(OPTS_LABEL))
                .cloned()
                .unwrap_or_default();
            if existing_hash == hash {
                return Ok(self.handle_from_inspect(session_id, &existing));
            }
            return Err(ProviderError::AlreadyExists(format!(
                "sandbox for '{session_id}' exists with different parameters"
            )));
        }

        self.ensure_image_pulled(&image).await?;

        let mut port_bindings = PortMap::new();
        port_bindings.insert(
            format!("{}/tcp", self.config.agent_port),
            Some(vec![PortBinding {
                host_ip: Some("0.0.0.0".to_string()),
                host_port: None,
            }]),
        );
        let mut exposed_ports = HashMap::new();
        exposed_ports.insert(format!("{}/tcp", self.config.agent_port), HashMap::new());

        let mut binds = Vec::new();
        if let Some(src) = &opts.workspace_source {
            binds.push(format!("{src}:{}", self.config.workspace_mount));
        }
        if let Some(volume) = &opts.data_volume {
            binds.push(format!("{volume}:/data"));
        }

        let mut host_config = HostConfig {
            port_bindings: Some(port_bindings),
            binds: if binds.is_empty() { None } else { Some(binds) },
            ..Default::default()
        };
        if let Some(cpu) = opts.cpu_cores {
            host_config.nano_cpus = Some((cpu as i64) * 1_000_000_000);
        }
        if let Some(mem) = opts.memory_mb {
            host_config.memory = Some((mem as i64) * 1024 * 1024);
        }

        let mut labels = HashMap::new();
        labels.insert(SESSION_LABEL.to_string(), session_id.to_string());
        labels.insert(OPTS_LABEL.to_string(), hash);

        let env_vars: Vec<String> = opts.env.iter().map(|(k, v)| format!("{k}={v}")).collect();

        let config = BollardConfig {
            image: Some(image),
            env: Some(env_vars),
            exposed_ports: Some(exposed_ports),
            host_config: Some(host_config),
            labels: Some(labels),
            ..Default::default()
        };

        self.client()
            .create_container(
                Some(CreateContainerOptions {
                    name: Self::container_name(session_id),
                    platform: None,
                }),
                config,
            )
            .await
            .map_err(|err| {
                ProviderError::BackendUnavailable(format!("failed to create container: {err}"))
            })?;

        Ok(SandboxHandle {
            session_id: session_id.to_string(),
            status: SandboxStatus::Creating,
            host: None,
            http_port: None,
        })
    }

    async fn start(&self, session_id: &str) -> Result<SandboxHandle> {
        let name = Self::container_name(session_id);
        match self
            .client()
            .start_container(&name, None::<StartContainerOptions<String>>)
            .await
        {
            Ok(()) => {}
            // 304: already started; idempotent.
            Err(docktopus::bollard::errors::Error::DockerResponseServerError {
                status_code: 304,
                ..
            }) => {}
            Err(docktopus::bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => {
                return Err(ProviderError::NotFound(format!(
                    "no sandbox for '{session_id}'"
                )));
            }
            Err(err) => {
                return Err(ProviderError::BackendUnavailable(format!(
                    "failed to start container: {err}"
                )));
            }
        }

        let inspect = self
            .inspect(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("no sandbox for '{session_id}'")))?;
        let handle = self.handle_from_inspect(session_id, &inspect);
        let port = handle.http_port.ok_or_else(|| {
            ProviderError::Io(format!("sandbox for '{session_id}' has no published port"))
        })?;

        let health_url = format!("http://{}:{port}/health", self.config.public_host);
        let healthy = tokio::time::timeout(self.config.start_timeout, async {
            loop {
                if let Ok(resp) = self.http.get(&health_url).send().await
                    && resp.status().is_success()
                {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
        })
        .await;
        if healthy.is_err() {
            return Err(ProviderError::StartTimeout(format!(
                "agent-api for '{session_id}' not healthy after {:?}",
                self.config.start_timeout
            )));
        }
        Ok(handle)
    }

    async fn get(&self, session_id: &str) -> Result<SandboxHandle> {
        let inspect = self
            .inspect(session_id)
            .await?
            .ok_or_else(|| ProviderError::NotFound(format!("no sandbox for '{session_id}'")))?;
        Ok(self.handle_from_inspect(session_id, &inspect))
    }

    async fn stop(&self, session_id: &str, timeout: Duration) -> Result<()> {
        let name = Self::container_name(session_id);
        match self
            .client()
            .stop_container(
                &name,
                Some(StopContainerOptions {
                    t: timeout.as_secs() as i64,
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            Err(docktopus::bollard::errors::Error::DockerResponseServerError {
                status_code: 304 | 404,
                ..
            }) => Ok(()),
            Err(err) => Err(ProviderError::BackendUnavailable(format!(
                "failed to stop container: {err}"
            ))),
        }
    }

    async fn destroy(&self, session_id: &str) -> Result<()> {
        let name = Self::container_name(session_id);
        match self
            .client()
            .remove_container(
                &name,
                Some(RemoveContainerOptions {
                    force: true,
                    ..Default::default()
                }),
            )
            .await
        {
            Ok(()) => Ok(()),
            // Destroy is safe on unknown sessions.
            Err(docktopus::bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                ..
            }) => Ok(()),
            Err(err) => Err(ProviderError::BackendUnavailable(format!(
                "failed to remove container: {err}"
            ))),
        }
    }

    async fn exec(&self, session_id: &str, argv: &[String], opts: ExecOpts) -> Result<ExecResult> {
        let (exec_id, results) = self
            .start_exec(session_id, argv, &opts.env, &opts.user, false, true)
            .await?;
        let StartExecResults::Attached { mut output, mut input } = results else {
            return Err(ProviderError::ExecFailed("exec was not attached".into()));
        };

        if let Some(stdin) = opts.stdin {
            input
                .write_all(&stdin)
                .await
                .map_err(|err| ProviderError::Io(format!("failed to write stdin: {err}")))?;
        }
        let _ = input.shutdown().await;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        while let Some(frame) = output.next().await {
            match frame {
                Ok(docktopus::bollard::container::LogOutput::StdOut { message }) => {
                    stdout.extend_from_slice(&message);
                }
                Ok(docktopus::bollard::container::LogOutput::StdErr { message }) => {
                    stderr.extend_from_slice(&message);
                }
                Ok(docktopus::bollard::container::LogOutput::Console { message }) => {
                    stdout.extend_from_slice(&message);
                }
                Ok(_) => {}
                Err(err) => {
                    return Err(ProviderError::Io(format!("exec output error: {err}")));
                }
            }
        }
        let exit_code = self.exec_waiter(exec_id).await?;
        Ok(ExecResult {
            stdout: Bytes::from(stdout),
            stderr: Bytes::from(stderr),
            exit_code,
        })
    }

    async fn exec_stream(
        &self,
        session_id: &str,
        argv: &[String],
        opts: ExecOpts,
    ) -> Result<ExecStream> {
        let (exec_id, results) = self
            .start_exec(session_id, argv, &opts.env, &opts.user, false, true)
            .await?;
        let StartExecResults::Attached { output, input } = results else {
            return Err(ProviderError::ExecFailed("exec was not attached".into()));
        };
        Ok(ExecStream {
            stdin: Box::pin(input),
            stdout: Box::pin(output_reader(output)),
            exit: Box::pin(self.exec_waiter(exec_id)),
        })
    }

    async fn attach(&self, session_id: &str, opts: AttachOpts) -> Result<Pty> {
        let shell = vec!["/bin/sh".to_string(), "-l".to_string()];
        let (exec_id, results) = self
            .start_exec(session_id, &shell, &opts.env, &opts.user, true, true)
            .await?;
        let StartExecResults::Attached { output, input } = results else {
            return Err(ProviderError::ExecFailed("attach was not attached".into()));
        };
        let control = DockerPtyControl {
            client: self.client().clone(),
            exec_id: exec_id.clone(),
        };
        if opts.rows > 0 && opts.cols > 0 {
            let _ = control.resize(opts.rows, opts.cols).await;
        }
        // In tty mode all frames arrive on the console stream.
        let mapped = output.map(|frame| {
            frame
                .map(|f| f.into_bytes())
                .map_err(|err| std::io::Error::other(err.to_string()))
        });
        Ok(Pty {
            stdin: Box::pin(input),
            stdout: Box::pin(StreamReader::new(Box::pin(mapped))),
            control: Box::new(control),
            exit: Box::pin(self.exec_waiter(exec_id)),
        })
    }

    async fn http_proxy(&self, session_id: &str, req: ProxyRequest) -> Result<ProxyResponse> {
        let base = self.agent_base_url(session_id).await?;
        let url = format!("{base}{}", req.path);
        let method = reqwest::Method::from_bytes(req.method.as_bytes())
            .map_err(|_| ProviderError::Io(format!("invalid method '{}'", req.method)))?;
        let mut request = self.http.request(method, &url);
        for (name, value) in &req.headers {
            request = request.header(name, value);
        }
        if let Some(body) = req.body {
            request = request.body(reqwest::Body::wrap_stream(body));
        }
        let response = request.send().await.map_err(|err| {
            ProviderError::BackendUnavailable(format!("agent-api request failed: {err}"))
        })?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();
        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(|err| std::io::Error::other(err.to_string())));
        Ok(ProxyResponse {
            status,
            headers,
            body: Box::pin(body),
        })
    }

    async fn user_info(&self, session_id: &str) -> Result<UserInfo> {
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "printf '%s %s %s' \"$(id -un)\" \"$(id -u)\" \"$(id -g)\"".to_string(),
        ];
        let result = self.exec(session_id, &argv, ExecOpts::default()).await?;
        let text = String::from_utf8_lossy(&result.stdout);
        let mut parts = text.split_whitespace();
        let username = parts.next().unwrap_or("root").to_string();
        let uid = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        let gid = parts.next().and_then(|v| v.parse().ok()).unwrap_or(0);
        Ok(UserInfo { username, uid, gid })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opts_hash_is_order_insensitive_for_env() {
        let mut a = CreateOpts::default();
        a.env.insert("B".into(), "2".into());
        a.env.insert("A".into(), "1".into());
        let mut b = CreateOpts::default();
        b.env.insert("A".into(), "1".into());
        b.env.insert("B".into(), "2".into());
        assert_eq!(opts_hash(&a, "img"), opts_hash(&b, "img"));
    }

    #[test]
    fn opts_hash_differs_on_limits() {
        let a = CreateOpts::default();
        let b = CreateOpts {
            memory_mb: Some(1024),
            ..Default::default()
        };
        assert_ne!(opts_hash(&a, "img"), opts_hash(&b, "img"));
    }
}
