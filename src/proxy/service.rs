//! The proxy runtime: request handling, worker pool, janitor and lifecycle
//!
//! A [`Service`] owns the shared [`Runtime`], the bound listener and the
//! background task handles. The runtime moves through four states:
//! starting (construction), running, stopping (new upstream work refused
//! with 503 while queued work drains) and stopped (all tasks joined, the
//! listener shut down within its grace budget).

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Request, State};
use axum::response::Response;
use axum::Router;
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use tokio::net::TcpListener;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use super::{reply, Fingerprint, HttpUpstream, Settings, TokenCache, UpstreamCaller};
use crate::{Error, Result};

/// A queued upstream token request
///
/// The oneshot sender doubles as the completion signal: the waiting handler
/// owns the receiving half and returns whatever response arrives. A worker
/// that dies without replying drops the sender and the handler answers 503.
struct UpstreamJob {
    fingerprint: Fingerprint,
    reply_tx: oneshot::Sender<Response>,
}

/// Shared running state of the proxy
struct Runtime {
    cache: TokenCache,
    /// Producer side of the pool queue; `None` once the queue is closed
    jobs: RwLock<Option<mpsc::Sender<UpstreamJob>>>,
    stopping: AtomicBool,
    /// Set once the running context is cancelled; checked alongside the
    /// broadcast so late subscribers cannot miss the signal
    cancel_flag: AtomicBool,
    shutdown: broadcast::Sender<()>,
    /// First fatal error wins; later ones are dropped
    fatal: Mutex<Option<Error>>,
    request_timeout: Duration,
    janitor_period: Duration,
    caller: Arc<dyn UpstreamCaller>,
}

impl Runtime {
    fn new(
        settings: &Settings,
        caller: Arc<dyn UpstreamCaller>,
    ) -> (Arc<Self>, mpsc::Receiver<UpstreamJob>) {
        let (shutdown, _) = broadcast::channel(1);
        let (job_tx, job_rx) = mpsc::channel(1);

        let runtime = Arc::new(Self {
            cache: TokenCache::new(settings.cache_ttl),
            jobs: RwLock::new(Some(job_tx)),
            stopping: AtomicBool::new(false),
            cancel_flag: AtomicBool::new(false),
            shutdown,
            fatal: Mutex::new(None),
            request_timeout: settings.request_timeout,
            janitor_period: settings.cache_ttl,
            caller,
        });

        (runtime, job_rx)
    }

    fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::SeqCst)
    }

    /// Cancel the running context, waking the janitor and any worker mid-call
    fn cancel(&self) {
        self.cancel_flag.store(true, Ordering::SeqCst);
        let _ = self.shutdown.send(());
    }

    /// Resolve once the running context is cancelled
    ///
    /// Subscribes before checking the flag, so a cancellation from before
    /// the call is observed via the flag and one from after via the channel.
    async fn cancelled(&self) {
        let mut rx = self.shutdown.subscribe();
        if self.cancel_flag.load(Ordering::SeqCst) {
            return;
        }
        let _ = rx.recv().await;
    }

    /// Capture a fatal error and initiate shutdown; the first error is kept
    /// as the overall run result
    fn critical_error(&self, err: Error) {
        {
            let mut fatal = self.fatal.lock();
            if fatal.is_none() {
                *fatal = Some(err);
            }
        }
        self.cancel();
    }

    /// Refuse new upstream work and cancel the running context
    fn enter_stopping(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.cancel();
    }

    /// Drop the producer side of the pool queue so workers drain and exit
    fn close_queue(&self) {
        self.jobs.write().take();
    }

    /// Handle one inbound request end to end
    async fn handle(&self, req: Request) -> Response {
        let fingerprint = match Fingerprint::admit(req).await {
            Ok(fingerprint) => fingerprint,
            // Admission already produced the reply
            Err(response) => return response,
        };

        if let Some(entry) = self.cache.lookup(&fingerprint) {
            if entry.is_valid(Utc::now()) {
                return reply::from_entry(&entry);
            }
        }

        self.request_from_pool(fingerprint).await
    }

    /// Queue a cache miss for the worker pool and wait for its reply
    async fn request_from_pool(&self, fingerprint: Fingerprint) -> Response {
        if self.is_stopping() {
            return reply::service_unavailable();
        }

        info!(path = %fingerprint.path, "passing on upstream request");

        let Some(sender) = self.jobs.read().clone() else {
            return reply::service_unavailable();
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        let job = UpstreamJob {
            fingerprint,
            reply_tx,
        };

        if sender.send(job).await.is_err() {
            return reply::service_unavailable();
        }

        match reply_rx.await {
            Ok(response) => response,
            Err(_) => reply::service_unavailable(),
        }
    }

    /// Worker body: consume the pool queue until it closes
    async fn worker_loop(
        self: Arc<Self>,
        queue: Arc<tokio::sync::Mutex<mpsc::Receiver<UpstreamJob>>>,
    ) {
        loop {
            let job = { queue.lock().await.recv().await };
            match job {
                Some(job) => self.process_job(job).await,
                None => return,
            }
        }
    }

    /// Handle one queued job; a reply is sent on every exit path
    async fn process_job(&self, job: UpstreamJob) {
        let response = self.job_response(&job.fingerprint).await;
        let _ = job.reply_tx.send(response);
    }

    async fn job_response(&self, fingerprint: &Fingerprint) -> Response {
        if self.is_stopping() {
            return reply::service_unavailable();
        }

        // Another worker may have populated the entry between enqueue and
        // dequeue
        if let Some(entry) = self.cache.lookup(fingerprint) {
            if entry.is_valid(Utc::now()) {
                return reply::from_entry(&entry);
            }
        }

        self.fetch_upstream(fingerprint).await
    }

    /// Perform the upstream round-trip and consider the result for caching
    async fn fetch_upstream(&self, fingerprint: &Fingerprint) -> Response {
        let outcome = tokio::select! {
            outcome = tokio::time::timeout(
                self.request_timeout,
                self.caller.call(fingerprint),
            ) => outcome,
            () = self.cancelled() => {
                error!(path = %fingerprint.path, "upstream request cancelled");
                return reply::invalid();
            }
        };

        let upstream = match outcome {
            Ok(Ok(upstream)) => upstream,
            Ok(Err(err)) => {
                error!(path = %fingerprint.path, "send request: {err}");
                return reply::invalid();
            }
            Err(_) => {
                error!(path = %fingerprint.path, "upstream request timed out");
                return reply::invalid();
            }
        };

        // Transient server errors and rate-limit responses pass through
        // without populating the cache
        if upstream.status.as_u16() < 500 && upstream.status.as_u16() != 429 {
            self.cache.update(
                fingerprint.clone(),
                upstream.headers.clone(),
                upstream.body.clone(),
                upstream.status,
            );
        }

        reply::passthrough(upstream.status, &upstream.headers, upstream.body)
    }

    /// Janitor body: sweep expired entries every period until cancelled
    async fn janitor_loop(self: Arc<Self>) {
        loop {
            tokio::select! {
                () = tokio::time::sleep(self.janitor_period) => self.cache.clean(Utc::now()),
                () = self.cancelled() => return,
            }
        }
    }
}

/// Axum entry point; all routing happens in admission
async fn handle_request(State(runtime): State<Arc<Runtime>>, req: Request) -> Response {
    runtime.handle(req).await
}

/// The proxy service: bound listener, runtime and background tasks
pub struct Service {
    runtime: Arc<Runtime>,
    listener: TcpListener,
    tasks: Vec<JoinHandle<()>>,
    settings: Settings,
}

impl Service {
    /// Create a service talking HTTP to the configured endpoint
    ///
    /// # Errors
    ///
    /// Returns an error when the settings are invalid or the listen address
    /// cannot be bound.
    pub async fn new(settings: Settings) -> Result<Self> {
        let upstream = HttpUpstream::new(&settings.endpoint, settings.request_timeout)?;
        Self::with_upstream(settings, Arc::new(upstream)).await
    }

    /// Create a service with a custom upstream caller
    ///
    /// This is the injection seam: tests pass a deterministic responder
    /// instead of a live HTTP client.
    ///
    /// # Errors
    ///
    /// Returns an error when the settings are invalid or the listen address
    /// cannot be bound.
    pub async fn with_upstream(
        settings: Settings,
        caller: Arc<dyn UpstreamCaller>,
    ) -> Result<Self> {
        settings.validate()?;

        let listener = TcpListener::bind(&settings.listen_addr).await?;
        let (runtime, job_rx) = Runtime::new(&settings, caller);

        let mut tasks = Vec::with_capacity(settings.pool_size + 1);

        tasks.push(tokio::spawn({
            let runtime = Arc::clone(&runtime);
            async move { runtime.janitor_loop().await }
        }));

        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));
        for _ in 0..settings.pool_size {
            let runtime = Arc::clone(&runtime);
            let queue = Arc::clone(&job_rx);
            tasks.push(tokio::spawn(async move { runtime.worker_loop(queue).await }));
        }

        Ok(Self {
            runtime,
            listener,
            tasks,
            settings,
        })
    }

    /// Address the service is listening on
    ///
    /// # Errors
    ///
    /// Returns an error when the local address cannot be read from the
    /// socket.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Run the service until `shutdown` resolves or a fatal error occurs
    ///
    /// Teardown cancels the running context, refuses new upstream work,
    /// closes the pool queue, waits for the janitor and workers to drain and
    /// finally gives the HTTP listener `shutdown_grace` to finish in-flight
    /// connections.
    ///
    /// # Errors
    ///
    /// Returns the sticky fatal error when the listener failed, or an error
    /// when graceful shutdown exceeds its grace budget.
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send,
    {
        let addr = self.listener.local_addr()?;
        info!(addr = %addr, endpoint = %self.settings.endpoint, "http listening");

        let app = Router::new()
            .fallback(handle_request)
            .layer(TraceLayer::new_for_http())
            .with_state(Arc::clone(&self.runtime));

        let mut server_task = tokio::spawn({
            let runtime = Arc::clone(&self.runtime);
            let graceful = Arc::clone(&self.runtime);
            let server = axum::serve(self.listener, app).with_graceful_shutdown(async move {
                graceful.cancelled().await;
            });

            async move {
                if let Err(err) = server.await {
                    runtime.critical_error(err.into());
                }
            }
        });

        // Wait for an exit signal: external shutdown or a fatal error
        tokio::select! {
            () = shutdown => {}
            () = self.runtime.cancelled() => {}
        }

        info!("shutting down ...");
        self.runtime.enter_stopping();
        self.runtime.close_queue();

        // Completion barrier: janitor and all workers
        for task in self.tasks {
            let _ = task.await;
        }

        if let Some(err) = self.runtime.fatal.lock().take() {
            server_task.abort();
            return Err(err);
        }

        match tokio::time::timeout(self.settings.shutdown_grace, &mut server_task).await {
            Ok(_) => {
                info!("shutdown complete");
                Ok(())
            }
            Err(_) => {
                server_task.abort();
                Err(Error::Internal(
                    "graceful shutdown exceeded grace period".to_string(),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::{AuthMode, UpstreamReply};
    use async_trait::async_trait;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Method, StatusCode};
    use bytes::Bytes;
    use chrono::TimeDelta;
    use http::HeaderMap;
    use std::sync::atomic::AtomicUsize;

    /// Scripted upstream caller counting its invocations
    struct ScriptedUpstream {
        status: StatusCode,
        body: String,
        calls: AtomicUsize,
    }

    impl ScriptedUpstream {
        fn new(status: StatusCode, body: &str) -> Arc<Self> {
            Arc::new(Self {
                status,
                body: body.to_string(),
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl UpstreamCaller for ScriptedUpstream {
        async fn call(&self, _fingerprint: &Fingerprint) -> Result<UpstreamReply> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(UpstreamReply {
                status: self.status,
                headers: HeaderMap::new(),
                body: Bytes::from(self.body.clone()),
            })
        }
    }

    /// Upstream caller that always fails at the transport layer
    struct FailingUpstream;

    #[async_trait]
    impl UpstreamCaller for FailingUpstream {
        async fn call(&self, _fingerprint: &Fingerprint) -> Result<UpstreamReply> {
            Err(Error::Transport("connection refused".to_string()))
        }
    }

    fn test_settings() -> Settings {
        Settings {
            listen_addr: "127.0.0.1:0".to_string(),
            ..Settings::default().with_endpoint("test")
        }
    }

    fn fingerprint() -> Fingerprint {
        Fingerprint {
            path: "/something/token".to_string(),
            client_id: "123".to_string(),
            client_secret: "456".to_string(),
            username: "u1".to_string(),
            password: "p1".to_string(),
            scopes: "alpha bravo".to_string(),
            auth_mode: AuthMode::InBody,
        }
    }

    fn token_request() -> Request {
        Request::builder()
            .method(Method::POST)
            .uri("/something/token")
            .header(header::CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(Body::from(
                "client_id=123&client_secret=456&grant_type=password&password=p1&scope=alpha+bravo&username=u1",
            ))
            .unwrap()
    }

    async fn shutdown_now(service: Service) {
        service.run(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn runtime_mirrors_settings() {
        let settings = test_settings();
        let service = Service::with_upstream(
            settings.clone(),
            ScriptedUpstream::new(StatusCode::OK, "{}"),
        )
        .await
        .unwrap();

        assert!(!service.runtime.is_stopping());
        assert_eq!(service.runtime.request_timeout, settings.request_timeout);
        assert_eq!(service.runtime.janitor_period, settings.cache_ttl);

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn invalid_settings_are_rejected() {
        let result = Service::with_upstream(
            Settings::default(),
            ScriptedUpstream::new(StatusCode::OK, "{}"),
        )
        .await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn critical_error_is_sticky() {
        let service = Service::with_upstream(
            test_settings(),
            ScriptedUpstream::new(StatusCode::OK, "{}"),
        )
        .await
        .unwrap();

        service
            .runtime
            .critical_error(Error::Internal("first".to_string()));
        service
            .runtime
            .critical_error(Error::Internal("second".to_string()));

        let err = service.run(std::future::pending::<()>()).await.unwrap_err();
        assert!(err.to_string().contains("first"));
    }

    #[tokio::test]
    async fn cached_entry_served_without_upstream() {
        let upstream = ScriptedUpstream::new(StatusCode::OK, "{}");
        let service = Service::with_upstream(test_settings(), Arc::clone(&upstream) as _)
            .await
            .unwrap();

        service.runtime.cache.update(
            fingerprint(),
            HeaderMap::new(),
            Bytes::from_static(b"test"),
            StatusCode::OK,
        );

        let response = service.runtime.handle(token_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, &b"test"[..]);
        assert_eq!(upstream.calls(), 0);

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn expired_entry_triggers_upstream_fetch() {
        let upstream = ScriptedUpstream::new(StatusCode::OK, "{\"access_token\":\"fresh\"}");
        let service = Service::with_upstream(test_settings(), Arc::clone(&upstream) as _)
            .await
            .unwrap();

        service.runtime.cache.update(
            fingerprint(),
            HeaderMap::new(),
            Bytes::from_static(b"stale"),
            StatusCode::OK,
        );
        // Force the entry into the past so the handler treats it as a miss
        service
            .runtime
            .cache
            .force_expiry(&fingerprint(), Utc::now() - TimeDelta::hours(1));

        let response = service.runtime.handle(token_request()).await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(body, &b"{\"access_token\":\"fresh\"}"[..]);
        assert_eq!(upstream.calls(), 1);

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn upstream_failure_surfaces_as_bad_request() {
        let service = Service::with_upstream(test_settings(), Arc::new(FailingUpstream))
            .await
            .unwrap();

        let response = service.runtime.handle(token_request()).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let body = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(
            body,
            &b"{\"error\":\"bad request\",\"error_code\":400,\"error_description\":\"bad request\"}"[..]
        );
        // Nothing cached on transport failure
        assert!(service.runtime.cache.is_empty());

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn server_error_passes_through_uncached() {
        let upstream = ScriptedUpstream::new(StatusCode::INTERNAL_SERVER_ERROR, "boom");
        let service = Service::with_upstream(test_settings(), Arc::clone(&upstream) as _)
            .await
            .unwrap();

        let response = service.runtime.handle(token_request()).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert!(service.runtime.cache.is_empty());

        // A repeat request reaches the upstream again
        let _ = service.runtime.handle(token_request()).await;
        assert_eq!(upstream.calls(), 2);

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn rate_limit_passes_through_uncached() {
        let upstream = ScriptedUpstream::new(StatusCode::TOO_MANY_REQUESTS, "limited");
        let service = Service::with_upstream(test_settings(), Arc::clone(&upstream) as _)
            .await
            .unwrap();

        let response = service.runtime.handle(token_request()).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(service.runtime.cache.is_empty());

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn client_error_is_cached() {
        let upstream = ScriptedUpstream::new(StatusCode::UNAUTHORIZED, "denied");
        let service = Service::with_upstream(test_settings(), Arc::clone(&upstream) as _)
            .await
            .unwrap();

        let first = service.runtime.handle(token_request()).await;
        assert_eq!(first.status(), StatusCode::UNAUTHORIZED);

        // Second request is answered from the cache
        let second = service.runtime.handle(token_request()).await;
        assert_eq!(second.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(upstream.calls(), 1);

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn stopping_runtime_refuses_new_work() {
        let upstream = ScriptedUpstream::new(StatusCode::OK, "{}");
        let service = Service::with_upstream(test_settings(), Arc::clone(&upstream) as _)
            .await
            .unwrap();

        service.runtime.enter_stopping();

        let response = service.runtime.handle(token_request()).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(upstream.calls(), 0);

        shutdown_now(service).await;
    }

    #[tokio::test]
    async fn run_drains_all_tasks() {
        let service = Service::with_upstream(
            test_settings(),
            ScriptedUpstream::new(StatusCode::OK, "{}"),
        )
        .await
        .unwrap();

        let runtime = Arc::clone(&service.runtime);
        service.run(async {}).await.unwrap();

        // After run returns the pool queue is gone and the runtime is
        // stopping; only this handle keeps the runtime alive
        assert!(runtime.is_stopping());
        assert!(runtime.jobs.read().is_none());
    }
}
