use crate::config::KubernetesConfig;
use crate::error::{Result, SchedulerError};
use async_trait::async_trait;
use hyper::Request;
use hyper::header::HeaderValue;
use hyper_util::rt::TokioExecutor;
use kube::{Client, Config, client::ConfigExt};
use pin_project::pin_project;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::time::sleep;
use tower::{Layer, Service};
use tracing::{debug, warn};

/// Single cell holding the current `Authorization` header value. Request
/// paths load it once per request; the refresh worker is the only writer.
#[derive(Default)]
pub struct AuthTokenCell {
    header: RwLock<Option<HeaderValue>>,
}

impl AuthTokenCell {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the stored token; `None` clears it.
    pub fn store(&self, token: Option<&str>) -> Result<()> {
        let header = match token {
            Some(token) => Some(
                HeaderValue::from_str(&format!("Bearer {token}"))
                    .map_err(|err| SchedulerError::AuthFailed(format!("bad token: {err}")))?,
            ),
            None => None,
        };
        if let Ok(mut guard) = self.header.write() {
            *guard = header;
        }
        Ok(())
    }

    fn load(&self) -> Option<HeaderValue> {
        self.header.read().ok().and_then(|guard| guard.clone())
    }

    #[must_use]
    pub fn is_set(&self) -> bool {
        self.load().is_some()
    }
}

/// Produces fresh Authorization tokens; the concrete derivation (exec
/// plugin, vault lookup, …) is configured outside this crate.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn fetch(&self) -> Result<String>;
}

/// Tower layer injecting the cell's Authorization header into every
/// apiserver request.
pub struct AuthLayer {
    cell: Arc<AuthTokenCell>,
}

impl AuthLayer {
    #[must_use]
    pub fn new(cell: Arc<AuthTokenCell>) -> Self {
        Self { cell }
    }
}

impl<S> Layer<S> for AuthLayer {
    type Service = AuthService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        AuthService {
            inner,
            cell: self.cell.clone(),
        }
    }
}

#[pin_project]
pub struct AuthService<S> {
    #[pin]
    inner: S,
    cell: Arc<AuthTokenCell>,
}

impl<S, ReqBody> Service<Request<ReqBody>> for AuthService<S>
where
    S: Service<Request<ReqBody>>,
    S::Response: Send + 'static,
    S::Error: Into<Box<dyn std::error::Error + Send + Sync>>,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future =
        Pin<Box<dyn Future<Output = core::result::Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<core::result::Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut req: Request<ReqBody>) -> Self::Future {
        if let Some(header) = self.cell.load() {
            req.headers_mut()
                .insert(hyper::header::AUTHORIZATION, header);
        }
        let fut = self.inner.call(req);
        Box::pin(fut)
    }
}

/// Build an apiserver client honoring the configured URL and timeouts,
/// with the token layer stacked ahead of kube's own auth.
pub async fn new(
    config: &KubernetesConfig,
    token_cell: Option<Arc<AuthTokenCell>>,
) -> Result<Client> {
    let mut kube_config = match &config.url {
        Some(url) => Config::new(
            url.parse()
                .map_err(|err| SchedulerError::Malformed(format!("bad apiserver url: {err}")))?,
        ),
        None => Config::infer().await?,
    };
    if let Some(ms) = config.http_options.conn_timeout {
        kube_config.connect_timeout = Some(Duration::from_millis(ms));
    }
    if let Some(ms) = config.http_options.socket_timeout {
        kube_config.read_timeout = Some(Duration::from_millis(ms));
    }

    let https = kube_config
        .rustls_https_connector()
        .map_err(|err| SchedulerError::Internal(err.to_string()))?;
    let auth_layer = kube_config
        .auth_layer()
        .map_err(|err| SchedulerError::AuthFailed(err.to_string()))?;
    let service = tower::ServiceBuilder::new()
        .option_layer(token_cell.map(AuthLayer::new))
        .layer(kube_config.base_uri_layer())
        .option_layer(auth_layer)
        .map_err(tower::BoxError::from)
        .service(hyper_util::client::legacy::Client::builder(TokioExecutor::new()).build(https));

    Ok(Client::new(service, kube_config.default_namespace))
}

/// Caches the apiserver client and rebuilds it on demand when an operation
/// reports an authentication failure.
pub struct ClientManager {
    config: KubernetesConfig,
    token_cell: Option<Arc<AuthTokenCell>>,
    client: tokio::sync::RwLock<Option<Client>>,
}

impl ClientManager {
    #[must_use]
    pub fn new(config: KubernetesConfig, token_cell: Option<Arc<AuthTokenCell>>) -> Self {
        Self {
            config,
            token_cell,
            client: tokio::sync::RwLock::new(None),
        }
    }

    /// Wrap an existing client; it is never rebuilt. Test harnesses hand in
    /// mock clients this way.
    #[must_use]
    pub fn from_client(client: Client) -> Self {
        Self {
            config: KubernetesConfig::default(),
            token_cell: None,
            client: tokio::sync::RwLock::new(Some(client)),
        }
    }

    pub async fn get(&self) -> Result<Client> {
        {
            let guard = self.client.read().await;
            if let Some(client) = guard.as_ref() {
                return Ok(client.clone());
            }
        }
        self.create().await
    }

    /// Force a rebuild after an auth error.
    pub async fn refresh(&self) -> Result<Client> {
        debug!("rebuilding apiserver client after auth failure");
        {
            let mut guard = self.client.write().await;
            *guard = None;
        }
        self.create().await
    }

    async fn create(&self) -> Result<Client> {
        let client = new(&self.config, self.token_cell.clone()).await?;
        let mut guard = self.client.write().await;
        *guard = Some(client.clone());
        Ok(client)
    }
}

/// Whether an operation error warrants one retry with a rebuilt client.
#[must_use]
pub const fn should_refresh_client(error: &SchedulerError) -> bool {
    error.is_auth()
}

/// Cooperative worker re-deriving the Authorization token on an interval.
pub fn spawn_token_refresh(
    cell: Arc<AuthTokenCell>,
    source: Arc<dyn TokenSource>,
    refresh_delay: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match source.fetch().await {
                Ok(token) => {
                    if let Err(err) = cell.store(Some(&token)) {
                        warn!("refusing refreshed token: {err}");
                    } else {
                        debug!("authorization token refreshed");
                    }
                }
                Err(err) => warn!("token refresh failed: {err}"),
            }
            sleep(refresh_delay).await;
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_token_cell_roundtrip() {
        let cell = AuthTokenCell::new();
        assert!(!cell.is_set());
        cell.store(Some("abc123")).unwrap();
        assert_eq!(
            cell.load().unwrap(),
            HeaderValue::from_static("Bearer abc123")
        );
        cell.store(None).unwrap();
        assert!(!cell.is_set());
    }

    #[test]
    fn test_token_cell_rejects_invalid_header_values() {
        let cell = AuthTokenCell::new();
        assert!(cell.store(Some("bad\ntoken")).is_err());
        assert!(!cell.is_set());
    }

    #[tokio::test]
    async fn test_refresh_worker_updates_cell() {
        struct StaticSource;

        #[async_trait]
        impl TokenSource for StaticSource {
            async fn fetch(&self) -> Result<String> {
                Ok("refreshed".to_string())
            }
        }

        let cell = Arc::new(AuthTokenCell::new());
        let handle = spawn_token_refresh(
            cell.clone(),
            Arc::new(StaticSource),
            Duration::from_secs(600),
        );
        for _ in 0..50 {
            if cell.is_set() {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert!(cell.is_set());
        handle.abort();
    }
}
