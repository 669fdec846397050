//! Control-plane server: wires the store, event broker, dispatcher,
//! completion proxy, HTTP API, subdomain proxy, and SSH gateway together.

use std::net::SocketAddr;
use std::sync::Arc;

use discobot_lib::api::{self, AppState};
use discobot_lib::completion::CompletionService;
use discobot_lib::events::EventBroker;
use discobot_lib::jobs::{Dispatcher, default_handlers};
use discobot_lib::session::SessionService;
use discobot_lib::ssh::{SshGateway, hostkey};
use discobot_lib::store::Store;
use discobot_lib::{ANONYMOUS_PROJECT_SLUG, ANONYMOUS_USER_ID, Config, SandboxBackend, subdomain};
use sandbox_runtime::{DockerProvider, MockProvider, Provider, RuntimeConfig};
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() {
    let config = Config::from_env();
    setup_log(&config.log_level);

    if let Err(err) = run(config).await {
        tracing::error!(error = %err, "fatal");
        std::process::exit(1);
    }
}

fn setup_log(level: &str) {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}

async fn run(config: Config) -> Result<(), Box<dyn std::error::Error>> {
    let store = Store::open(&config.db_url).await?;
    tracing::info!(db = %config.db_url, "store ready");

    let provider = build_provider(&config).await?;

    // In no-auth mode every request maps to the reserved anonymous user and
    // its default project; make sure both exist before serving.
    if !config.auth_enabled {
        let anonymous = store
            .ensure_user("anonymous", ANONYMOUS_USER_ID, "Anonymous")
            .await?;
        if store
            .get_project_by_slug(ANONYMOUS_PROJECT_SLUG)
            .await?
            .is_none()
        {
            store
                .create_project(ANONYMOUS_PROJECT_SLUG, "Default", &anonymous.id)
                .await?;
            tracing::info!("seeded anonymous default project");
        }
    }

    let shutdown = CancellationToken::new();

    let broker = EventBroker::new(
        store.clone(),
        config.sse_client_buffer,
        config.event_poll_interval,
        config.event_retention,
    )
    .await?;
    tokio::spawn(broker.clone().run_poller(shutdown.clone()));
    tokio::spawn(broker.clone().run_retention_gc(shutdown.clone()));

    // Hourly sweep of expired cookie sessions.
    {
        let store = store.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(3600));
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = ticker.tick() => {
                        match store.delete_expired_user_sessions().await {
                            Ok(0) => {}
                            Ok(n) => tracing::info!(deleted = n, "expired user sessions"),
                            Err(err) => tracing::warn!(error = %err, "user session sweep failed"),
                        }
                    }
                }
            }
        });
    }

    let sessions = SessionService::new(store.clone(), broker.clone(), provider.clone(), &config);
    let completions = CompletionService::new(
        store.clone(),
        broker.clone(),
        provider.clone(),
        config.start_timeout * 2,
    );

    let handlers = default_handlers(sessions.clone(), completions.clone(), config.commit_timeout);
    let dispatcher = Dispatcher::new(store.clone(), broker.clone(), &config, handlers);
    tracing::info!(server_id = %dispatcher.server_id(), "dispatcher starting");
    let dispatcher_task = tokio::spawn(dispatcher.clone().run(shutdown.clone()));

    let state = AppState {
        store: store.clone(),
        broker,
        provider: provider.clone(),
        sessions,
        completions,
        config: Arc::new(config.clone()),
    };

    // The subdomain proxy sits in front of the router: service hosts are
    // proxied into sandboxes, everything else reaches the API.
    let app = api::router(state.clone()).layer(axum::middleware::from_fn_with_state(
        state,
        subdomain::middleware,
    ));

    let listener = tokio::net::TcpListener::bind(&config.http_addr).await?;
    tracing::info!(addr = %config.http_addr, "HTTP listening");
    let http_shutdown = shutdown.clone();
    let http_task = tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(async move { http_shutdown.cancelled().await })
        .await
    });

    let ssh_task = match &config.ssh_addr {
        Some(ssh_addr) => {
            let host_key = hostkey::load_or_generate(&config.ssh_host_key_path)?;
            let gateway = SshGateway::new(store.clone(), provider.clone());
            let addr = ssh_addr.clone();
            let ssh_shutdown = shutdown.clone();
            Some(tokio::spawn(async move {
                if let Err(err) = gateway.run(&addr, host_key, ssh_shutdown).await {
                    tracing::error!(error = %err, "ssh gateway exited");
                }
            }))
        }
        None => {
            tracing::info!("SSH gateway disabled");
            None
        }
    };

    tokio::signal::ctrl_c().await?;
    tracing::info!("shutting down");
    shutdown.cancel();

    // The dispatcher releases its leader lease on the way out.
    let _ = dispatcher_task.await;
    let _ = http_task.await;
    if let Some(task) = ssh_task {
        let _ = task.await;
    }
    Ok(())
}

async fn build_provider(config: &Config) -> Result<Arc<dyn Provider>, Box<dyn std::error::Error>> {
    let runtime_config = RuntimeConfig {
        image: config.sandbox_image.clone(),
        start_timeout: config.start_timeout,
        ..RuntimeConfig::default()
    };
    match config.sandbox_backend {
        SandboxBackend::Docker => {
            let provider = DockerProvider::connect(runtime_config).await?;
            Ok(Arc::new(provider))
        }
        SandboxBackend::Mock => Ok(Arc::new(MockProvider::new())),
        // The backend contract supports a VM implementation; none ships in
        // this build.
        SandboxBackend::Vm => Err("SANDBOX_BACKEND=vm is not available in this build".into()),
    }
}
