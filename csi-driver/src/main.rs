//! ScaleIO CSI Driver
//!
//! Kubernetes CSI driver fronting a ScaleIO block-storage cluster via its
//! management gateway. Hosts the identity service plus the controller
//! and/or node services, selected at startup.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tokio::net::UnixListener;
use tokio::signal;
use tokio_stream::wrappers::UnixListenerStream;
use tonic::transport::Server;
use tracing::{Level, info};
use tracing_subscriber::FmtSubscriber;

use scaleio_csi::csi;
use scaleio_csi::interceptors::{InterceptorConfig, Pipeline};
use scaleio_csi::node::DiskByIdAttachments;
use scaleio_csi::{ControllerService, IdentityService, NodeService, Opts, Plugin, RoleMode};

/// CLI arguments for the CSI driver
#[derive(Parser, Debug)]
#[command(name = "scaleio-csi")]
#[command(about = "ScaleIO CSI Driver for Kubernetes")]
struct Args {
    /// CSI endpoint (unix:// socket path or tcp:// address)
    #[arg(long, env = "CSI_ENDPOINT", default_value = "unix:///var/run/csi/csi.sock")]
    endpoint: String,

    /// HTTP endpoint of the ScaleIO gateway
    #[arg(long, env = "X_CSI_SCALEIO_ENDPOINT", default_value = "")]
    gateway: String,

    /// User name for gateway authentication
    #[arg(long, env = "X_CSI_SCALEIO_USER", default_value = "admin")]
    user: String,

    /// Password for gateway authentication
    #[arg(long, env = "X_CSI_SCALEIO_PASSWORD", default_value = "")]
    password: String,

    /// Skip verification of the gateway's certificate chain and hostname
    #[arg(long, env = "X_CSI_SCALEIO_INSECURE", default_value = "false")]
    insecure: bool,

    /// Name of the ScaleIO system to interact with
    #[arg(long, env = "X_CSI_SCALEIO_SYSTEMNAME", default_value = "default")]
    system_name: String,

    /// GUID of the local SDC; discovered via drv_cfg when unset
    #[arg(long, env = "X_CSI_SCALEIO_SDCGUID")]
    sdc_guid: Option<String>,

    /// Thick-provision new volumes by default
    #[arg(long, env = "X_CSI_SCALEIO_THICKPROVISIONING", default_value = "false")]
    thick: bool,

    /// Private mount directory for node-side staging
    #[arg(
        long,
        env = "X_CSI_PRIVATE_MOUNT_DIR",
        default_value = "/dev/disk/csi-scaleio"
    )]
    private_mount_dir: PathBuf,

    /// Log inbound requests
    #[arg(long, env = "X_CSI_SCALEIO_REQ_LOGGING_ENABLED", default_value = "true")]
    req_logging: bool,

    /// Log outbound responses
    #[arg(long, env = "X_CSI_SCALEIO_REP_LOGGING_ENABLED", default_value = "true")]
    rep_logging: bool,

    /// Inject a request ID into each RPC
    #[arg(
        long,
        env = "X_CSI_SCALEIO_REQ_ID_INJECTION_ENABLED",
        default_value = "true"
    )]
    req_id_injection: bool,

    /// Validate requests against the protocol specification
    #[arg(
        long,
        env = "X_CSI_SCALEIO_SPEC_VALIDATION_ENABLED",
        default_value = "true"
    )]
    spec_validation: bool,

    /// Guard side-effecting RPCs against duplicate execution
    #[arg(long, env = "X_CSI_SCALEIO_IDEMPOTENCY_ENABLED", default_value = "true")]
    idempotency: bool,

    /// Require a referenced volume to exist before guarding an RPC for it
    #[arg(
        long,
        env = "X_CSI_SCALEIO_IDEMPOTENCY_REQUIRE_VOLUME",
        default_value = "true"
    )]
    idempotency_require_volume: bool,

    /// Idempotency wait/retention timeout in seconds (0 waits indefinitely)
    #[arg(long, env = "X_CSI_SCALEIO_IDEMPOTENCY_TIMEOUT", default_value = "0")]
    idempotency_timeout: u64,

    /// Host only the Node service
    #[arg(long, env = "X_CSI_SCALEIO_NODEONLY", default_value = "false")]
    node_only: bool,

    /// Host only the Controller service
    #[arg(long, env = "X_CSI_SCALEIO_CONTROLLERONLY", default_value = "false")]
    controller_only: bool,

    /// Force debug logging
    #[arg(long, env = "X_CSI_SCALEIO_DEBUG", default_value = "false")]
    debug: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Prometheus metrics HTTP address (e.g., 0.0.0.0:9091)
    /// If not set, metrics endpoint is disabled
    #[arg(long, env = "METRICS_ADDR")]
    metrics_addr: Option<String>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    // Initialize tracing
    let level = if args.debug {
        Level::DEBUG
    } else {
        match args.log_level.to_lowercase().as_str() {
            "trace" => Level::TRACE,
            "debug" => Level::DEBUG,
            "info" => Level::INFO,
            "warn" => Level::WARN,
            "error" => Level::ERROR,
            _ => Level::INFO,
        }
    };

    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if args.node_only && args.controller_only {
        return Err(format!(
            "Cannot specify both {} and {}",
            "X_CSI_SCALEIO_NODEONLY", "X_CSI_SCALEIO_CONTROLLERONLY"
        )
        .into());
    }
    let mode = match (args.node_only, args.controller_only) {
        (true, false) => RoleMode::Node,
        (false, true) => RoleMode::Controller,
        _ => RoleMode::Both,
    };

    // Initialize Prometheus metrics endpoint if configured
    if let Some(ref addr_str) = args.metrics_addr {
        let addr = addr_str
            .parse()
            .map_err(|e| format!("Invalid metrics address '{}': {}", addr_str, e))?;
        if let Err(e) = scaleio_csi::metrics::init_metrics(addr) {
            return Err(format!("Failed to initialize metrics: {}", e).into());
        }
    }

    info!(
        endpoint = %args.endpoint,
        gateway = %args.gateway,
        user = %args.user,
        password = if args.password.is_empty() { "" } else { "******" },
        system_name = %args.system_name,
        sdc_guid = args.sdc_guid.as_deref().unwrap_or(""),
        insecure = args.insecure,
        thick = args.thick,
        private_mount_dir = %args.private_mount_dir.display(),
        mode = ?mode,
        "Starting ScaleIO CSI Driver"
    );

    let client = sio_client::Client::new(&args.gateway, &args.user, &args.password, args.insecure)
        .map_err(|e| format!("unable to create gateway client: {}", e))?;

    let opts = Opts {
        endpoint: args.gateway.clone(),
        user: args.user.clone(),
        password: args.password.clone(),
        system_name: args.system_name.clone(),
        sdc_guid: args.sdc_guid.clone(),
        insecure: args.insecure,
        thick: args.thick,
        priv_dir: args.private_mount_dir.clone(),
    };
    let plugin = Arc::new(Plugin::new(opts, mode, Arc::new(client)));

    let interceptors = InterceptorConfig {
        request_id_injection: args.req_id_injection,
        request_logging: args.req_logging,
        response_logging: args.rep_logging,
        spec_validation: args.spec_validation,
        idempotency: args.idempotency,
        idempotency_require_volume: args.idempotency_require_volume,
        idempotency_timeout: Duration::from_secs(args.idempotency_timeout),
    };
    let pipeline = Arc::new(Pipeline::assemble(&interceptors, plugin.clone()));
    info!(layers = ?pipeline.layer_names(), "assembled interceptor pipeline");

    // Register the services: identity always, controller/node per role.
    let identity = IdentityService::new(plugin.clone(), pipeline.clone());
    let controller = mode.hosts_controller().then(|| {
        csi::controller_server::ControllerServer::new(ControllerService::new(
            plugin.clone(),
            pipeline.clone(),
        ))
    });
    let node = mode.hosts_node().then(|| {
        csi::node_server::NodeServer::new(NodeService::new(
            plugin.clone(),
            pipeline.clone(),
            Arc::new(DiskByIdAttachments::new()),
        ))
    });

    let router = Server::builder()
        .add_service(csi::identity_server::IdentityServer::new(identity))
        .add_optional_service(controller)
        .add_optional_service(node);

    if let Some(path) = args.endpoint.strip_prefix("unix://") {
        let path = Path::new(path);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        // Unlink a stale socket from a previous run.
        if path.exists() {
            fs::remove_file(path)?;
        }

        let listener = UnixListener::bind(path)?;
        let incoming = UnixListenerStream::new(listener);

        info!(endpoint = %args.endpoint, "serving");
        router
            .serve_with_incoming_shutdown(incoming, async {
                shutdown_signal().await;
                info!("Shutdown signal received, draining connections...");
            })
            .await?;
    } else if let Some(addr) = args.endpoint.strip_prefix("tcp://") {
        let addr = addr.parse()?;

        info!(endpoint = %args.endpoint, "serving");
        router
            .serve_with_shutdown(addr, async {
                shutdown_signal().await;
                info!("Shutdown signal received, draining connections...");
            })
            .await?;
    } else {
        return Err(format!(
            "unsupported endpoint '{}': expected unix:// or tcp://",
            args.endpoint
        )
        .into());
    }

    info!("ScaleIO CSI driver shutdown complete");
    Ok(())
}

/// Wait for shutdown signal (SIGTERM, SIGINT, or SIGHUP)
async fn shutdown_signal() {
    use signal::unix::{SignalKind, signal};

    // Install signal handlers, logging errors but continuing with available handlers
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGTERM handler: {}", e);
            None
        }
    };

    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGINT handler: {}", e);
            None
        }
    };

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => Some(s),
        Err(e) => {
            tracing::error!("Failed to install SIGHUP handler: {}", e);
            None
        }
    };

    // Wait for any signal - use pending() for handlers that failed to install
    tokio::select! {
        _ = async { sigterm.as_mut().unwrap().recv().await }, if sigterm.is_some() => {
            info!("Received SIGTERM");
        }
        _ = async { sigint.as_mut().unwrap().recv().await }, if sigint.is_some() => {
            info!("Received SIGINT");
        }
        _ = async { sighup.as_mut().unwrap().recv().await }, if sighup.is_some() => {
            info!("Received SIGHUP, shutting down");
        }
    }
}
