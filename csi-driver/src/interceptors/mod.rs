//! Request-interceptor pipeline.
//!
//! Every RPC passes through a fixed-order chain of wrapping behaviors before
//! its handler runs: (1) request-ID injection, (2) request/response logging,
//! (3) specification validation, (4) idempotency guarding. Each behavior is
//! independently toggled by [`InterceptorConfig`], evaluated once at
//! startup; a disabled behavior never changes the order of the others.
//!
//! Dispatch is typed: each request message implements [`CsiRequest`], and
//! [`Pipeline::call`] composes the enabled behaviors around the typed
//! handler future. No runtime reflection is involved.

pub mod idempotency;
pub mod requests;

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tonic::{Response, Status};
use tracing::{Instrument, info, info_span};
use uuid::Uuid;

use crate::metrics::OperationTimer;
use idempotency::IdempotencyGuard;
pub use requests::{CsiRequest, VolumeRef};

/// Protocol versions this plugin accepts.
pub const SUPPORTED_VERSIONS: [(u32, u32, u32); 1] = [(0, 1, 0)];

/// Looks up whether a referenced volume exists; implemented by the plugin
/// core against the gateway. Used by the idempotency layer's
/// require-volume check.
#[tonic::async_trait]
pub trait VolumeLookup: Send + Sync {
    async fn volume_exists(&self, volume: &VolumeRef) -> Result<bool, Status>;
}

/// Pipeline behavior toggles, resolved once at startup.
#[derive(Debug, Clone)]
pub struct InterceptorConfig {
    pub request_id_injection: bool,
    pub request_logging: bool,
    pub response_logging: bool,
    pub spec_validation: bool,
    pub idempotency: bool,
    /// Require a referenced volume to exist before admitting a guarded
    /// operation for it.
    pub idempotency_require_volume: bool,
    /// How long a duplicate caller waits for the in-flight execution, and
    /// how long completed results are retained. Zero waits indefinitely and
    /// retains nothing.
    pub idempotency_timeout: Duration,
}

impl Default for InterceptorConfig {
    fn default() -> Self {
        Self {
            request_id_injection: true,
            request_logging: true,
            response_logging: true,
            spec_validation: true,
            idempotency: true,
            idempotency_require_volume: true,
            idempotency_timeout: Duration::ZERO,
        }
    }
}

struct RequestIdInjector;

impl RequestIdInjector {
    fn next(&self) -> String {
        Uuid::new_v4().to_string()
    }
}

struct RpcLogger {
    requests: bool,
    responses: bool,
}

impl RpcLogger {
    fn request<R: CsiRequest>(&self, req: &R) {
        if self.requests {
            info!(method = req.method(), request = ?req, "request");
        }
    }

    fn response<T: fmt::Debug>(&self, method: &'static str, result: &Result<T, Status>) {
        if !self.responses {
            return;
        }
        match result {
            Ok(resp) => info!(method, response = ?resp, "response"),
            Err(status) => {
                info!(method, code = ?status.code(), error = %status.message(), "response")
            }
        }
    }
}

struct SpecValidator;

impl SpecValidator {
    fn check<R: CsiRequest>(&self, req: &R) -> Result<(), Status> {
        let version = req
            .version()
            .ok_or_else(|| Status::invalid_argument("request version is required"))?;

        let supported = SUPPORTED_VERSIONS
            .iter()
            .any(|&(major, minor, patch)| {
                version.major == major && version.minor == minor && version.patch == patch
            });
        if !supported {
            return Err(Status::invalid_argument(format!(
                "unsupported request version: {}.{}.{}",
                version.major, version.minor, version.patch
            )));
        }

        req.required_fields()
    }
}

struct IdempotencyLayer {
    guard: IdempotencyGuard,
    require_volume: bool,
    volumes: Arc<dyn VolumeLookup>,
}

impl IdempotencyLayer {
    async fn run<R, T, F, Fut>(&self, req: R, op: F) -> Result<T, Status>
    where
        R: CsiRequest,
        T: prost::Message + Default,
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let Some(key) = req.idempotency_key() else {
            return op(req).await;
        };

        if self.require_volume {
            if let Some(volume) = req.volume_ref() {
                if !self.volumes.volume_exists(&volume).await? {
                    if req.missing_volume_is_success() {
                        return Ok(T::default());
                    }
                    return Err(Status::not_found("volume not found"));
                }
            }
        }

        self.guard.run(&key, move || op(req)).await
    }
}

/// The assembled interceptor chain.
pub struct Pipeline {
    request_id: Option<RequestIdInjector>,
    logger: Option<RpcLogger>,
    validator: Option<SpecValidator>,
    idempotency: Option<IdempotencyLayer>,
}

impl Pipeline {
    /// Build the chain from configuration. Behaviors keep their fixed order
    /// regardless of which are enabled.
    pub fn assemble(config: &InterceptorConfig, volumes: Arc<dyn VolumeLookup>) -> Self {
        Self {
            request_id: config.request_id_injection.then_some(RequestIdInjector),
            logger: (config.request_logging || config.response_logging).then(|| RpcLogger {
                requests: config.request_logging,
                responses: config.response_logging,
            }),
            validator: config.spec_validation.then_some(SpecValidator),
            idempotency: config.idempotency.then(|| IdempotencyLayer {
                guard: IdempotencyGuard::new(config.idempotency_timeout),
                require_volume: config.idempotency_require_volume,
                volumes,
            }),
        }
    }

    /// Names of the enabled behaviors, in execution order.
    pub fn layer_names(&self) -> Vec<&'static str> {
        let mut names = Vec::new();
        if self.request_id.is_some() {
            names.push("request-id");
        }
        if self.logger.is_some() {
            names.push("logging");
        }
        if self.validator.is_some() {
            names.push("spec-validation");
        }
        if self.idempotency.is_some() {
            names.push("idempotency");
        }
        names
    }

    /// Run `op` for `req` with the enabled behaviors wrapped around it.
    pub async fn call<R, T, F, Fut>(&self, req: R, op: F) -> Result<Response<T>, Status>
    where
        R: CsiRequest,
        T: prost::Message + Default + fmt::Debug,
        F: FnOnce(R) -> Fut,
        Fut: Future<Output = Result<T, Status>>,
    {
        let method = req.method();
        let timer = OperationTimer::new(method);

        let request_id = match &self.request_id {
            Some(injector) => injector.next(),
            None => String::new(),
        };
        let span = info_span!("rpc", method, request_id = %request_id);

        let result = async {
            if let Some(logger) = &self.logger {
                logger.request(&req);
            }

            let result = async {
                if let Some(validator) = &self.validator {
                    validator.check(&req)?;
                }
                match &self.idempotency {
                    Some(idempotency) => idempotency.run(req, op).await,
                    None => op(req).await,
                }
            }
            .await;

            if let Some(logger) = &self.logger {
                logger.response(method, &result);
            }
            result
        }
        .instrument(span)
        .await;

        match result {
            Ok(resp) => {
                timer.success();
                Ok(Response::new(resp))
            }
            Err(status) => {
                timer.failure(&status.code().to_string());
                Err(status)
            }
        }
    }
}
