//! Wiring of routers into the server's dispatch table.
//!
//! # Responsibilities
//! - Flatten mounted routers (declared, direct and nested endpoints)
//! - Keep the verb-dispatch table and the registry of top-level routers
//! - Discover routers from a directory through a [`RouteManifest`]
//! - Contain handler failures: errors and panics become `error` events and 500s
//!
//! # Design Decisions
//! - Flattening is recursive to any depth
//! - Registration order is deterministic; a repeated (verb, path) replaces the earlier one
//! - One bad route module aborts the whole directory load

use std::collections::BTreeMap;
use std::collections::{HashMap, HashSet};
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use axum::{body::Body, http::Request, response::Response, routing::MethodRouter};
use futures_util::FutureExt;

use crate::http::events::EventBus;
use crate::http::handler::RequestHandler;
use crate::http::response::{apply_rate_limit_headers, internal_error};
use crate::observability::metrics;
use crate::routing::annotations::RouteRegistry;
use crate::routing::endpoint::{BoxError, Endpoint, HandlerError, Verb};
use crate::routing::manifest::{MountedRouter, RouteManifest};
use crate::routing::path::to_axum_path;
use crate::routing::router::RouteSource;

const TITLE: &str = "EndpointManager";
const REGISTER_TITLE: &str = "Endpoints -> Router";

/// Failure while discovering route modules.
#[derive(Debug, thiserror::Error)]
pub enum DiscoveryError {
    #[error("failed to read route directory {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no route module named '{name}' is registered (found {path})")]
    UnknownModule { name: String, path: PathBuf },

    #[error("route module '{name}' failed to initialise: {source}")]
    Factory {
        name: String,
        #[source]
        source: BoxError,
    },
}

/// Path pattern -> verb -> endpoint.
#[derive(Debug, Clone, Default)]
pub struct DispatchTable {
    paths: BTreeMap<String, BTreeMap<Verb, Endpoint>>,
}

impl DispatchTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` at its own path, returning the endpoint it replaced.
    pub fn insert(&mut self, endpoint: Endpoint) -> Option<Endpoint> {
        self.paths
            .entry(endpoint.path().to_string())
            .or_default()
            .insert(endpoint.verb(), endpoint)
    }

    pub fn get(&self, verb: Verb, path: &str) -> Option<&Endpoint> {
        self.paths.get(path).and_then(|verbs| verbs.get(&verb))
    }

    pub fn iter(&self) -> impl Iterator<Item = &Endpoint> {
        self.paths.values().flat_map(|verbs| verbs.values())
    }

    /// Number of (verb, path) entries.
    pub fn len(&self) -> usize {
        self.paths.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Materialise the table as an axum router whose handlers all run through `requests`.
    ///
    /// Patterns that differ only in parameter names would collide inside axum;
    /// the first one (in path order) is kept and the others are skipped with a warning.
    /// A pattern whose wildcard is not its last segment is skipped the same way.
    pub fn into_router(self, requests: Arc<RequestHandler>) -> axum::Router {
        let mut app = axum::Router::new();
        let mut shapes: HashMap<String, String> = HashMap::new();

        for (path, verbs) in self.paths {
            let mut pattern = to_axum_path(&path);
            if !pattern.starts_with('/') {
                pattern.insert(0, '/');
            }

            if !wildcard_is_last(&pattern) {
                tracing::warn!(path = %path, "Skipping route pattern with a non-final wildcard");
                continue;
            }

            if let Some(existing) = shapes.get(&route_shape(&pattern)) {
                tracing::warn!(path = %path, conflicts_with = %existing, "Skipping conflicting route pattern");
                continue;
            }
            shapes.insert(route_shape(&pattern), path.clone());

            let mut method_router = MethodRouter::new();
            for (verb, endpoint) in verbs {
                let requests = Arc::clone(&requests);
                method_router = method_router.on(verb.filter(), move |request: Request<Body>| {
                    dispatch(Arc::clone(&requests), endpoint.clone(), request)
                });
            }
            app = app.route(&pattern, method_router);
        }

        app
    }
}

/// Whether a `{*rest}` segment, if any, ends the pattern.
fn wildcard_is_last(pattern: &str) -> bool {
    let segments: Vec<&str> = pattern.split('/').collect();
    segments
        .iter()
        .position(|segment| segment.starts_with("{*"))
        .map_or(true, |index| index + 1 == segments.len())
}

/// Pattern with parameter names erased, e.g. `/users/{}`.
fn route_shape(pattern: &str) -> String {
    pattern
        .split('/')
        .map(|segment| {
            if segment.starts_with("{*") {
                "{*}"
            } else if segment.starts_with('{') {
                "{}"
            } else {
                segment
            }
        })
        .collect::<Vec<_>>()
        .join("/")
}

/// Run `endpoint` through `requests`, turning failures into an `error` event and a 500.
pub async fn dispatch(requests: Arc<RequestHandler>, endpoint: Endpoint, request: Request<Body>) -> Response {
    let outcome = AssertUnwindSafe(requests.handle(request, &endpoint))
        .catch_unwind()
        .await;

    let error = match outcome {
        Ok(Ok(response)) => return response,
        Ok(Err(error)) => error,
        Err(panic) => HandlerError::from_panic(panic),
    };

    metrics::record_handler_error(error.kind());
    let mut response = internal_error(&error);
    if let Some(status) = error.rate_limit() {
        apply_rate_limit_headers(response.headers_mut(), status);
    }
    requests.context().events().error(Arc::new(error));
    response
}

/// Owns the dispatch table and the routers mounted on it.
pub struct EndpointManager {
    routers: BTreeMap<String, Arc<dyn RouteSource>>,
    table: DispatchTable,
    registry: Arc<RouteRegistry>,
    events: EventBus,
}

impl EndpointManager {
    pub fn new(registry: Arc<RouteRegistry>, events: EventBus) -> Self {
        Self {
            routers: BTreeMap::new(),
            table: DispatchTable::new(),
            registry,
            events,
        }
    }

    pub fn registry(&self) -> &Arc<RouteRegistry> {
        &self.registry
    }

    /// Top-level routers keyed by prefix.
    pub fn routers(&self) -> &BTreeMap<String, Arc<dyn RouteSource>> {
        &self.routers
    }

    pub fn table(&self) -> &DispatchTable {
        &self.table
    }

    pub fn into_table(self) -> DispatchTable {
        self.table
    }

    /// Register every endpoint of `router`. Returns how many were registered.
    pub fn add_router<R: RouteSource>(&mut self, router: Arc<R>) -> usize {
        let mounted = MountedRouter::new(&self.registry, router);
        self.mount(mounted)
    }

    pub fn mount(&mut self, mounted: MountedRouter) -> usize {
        let MountedRouter { source, declared } = mounted;

        let mut endpoints = declared;
        endpoints.extend(source.router().flatten());
        let count = endpoints.len();

        for endpoint in endpoints {
            if let Some(previous) = self.table.insert(endpoint) {
                tracing::debug!(verb = %previous.verb(), path = %previous.path(), "Endpoint replaced");
            }
        }

        let prefix = source.prefix().to_string();
        self.events
            .debug(REGISTER_TITLE, format!("Registered {} routes from '{}'", count, prefix));
        self.routers.insert(prefix, source);
        metrics::record_routes_registered(self.table.len());
        count
    }

    /// Instantiate and mount every factory of `manifest`, in order.
    pub fn load_manifest(&mut self, manifest: &RouteManifest) -> Result<usize, DiscoveryError> {
        let names: Vec<String> = manifest.names().map(str::to_string).collect();
        for name in &names {
            let mounted = self.instantiate(manifest, name, Path::new(name))?;
            self.mount(mounted);
        }
        Ok(names.len())
    }

    /// Mount the routers named by the files of `directory`. Returns how many were mounted.
    ///
    /// A path that is not a directory (a symlink to one included) is reported
    /// through a debug event and is not an error. Only regular files are read;
    /// of several files sharing a stem (`a.rs`, `a.ts`) the first in name order is mounted.
    pub async fn load(&mut self, directory: impl AsRef<Path>, manifest: &RouteManifest) -> Result<usize, DiscoveryError> {
        let directory = directory.as_ref();
        let io_error = |source| DiscoveryError::Io {
            path: directory.to_path_buf(),
            source,
        };

        let is_dir = match tokio::fs::symlink_metadata(directory).await {
            Ok(metadata) => metadata.is_dir(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => false,
            Err(e) => return Err(io_error(e)),
        };
        if !is_dir {
            self.events
                .debug(TITLE, format!("Path {} was not a directory.", directory.display()));
            return Ok(0);
        }

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(directory).await.map_err(io_error)?;
        while let Some(entry) = entries.next_entry().await.map_err(io_error)? {
            let file_type = entry.file_type().await.map_err(io_error)?;
            // symlinks are never followed, whatever they point at
            if !file_type.is_file() || entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            files.push(entry.path());
        }
        files.sort();

        self.events
            .debug(TITLE, format!("Loading {} route modules from {}", files.len(), directory.display()));

        let mut seen = HashSet::new();
        for file in &files {
            let name = file
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned())
                .unwrap_or_default();
            if !seen.insert(name.clone()) {
                self.events
                    .debug(TITLE, format!("Skipping {}, module '{}' is already loaded", file.display(), name));
                continue;
            }
            let mounted = self.instantiate(manifest, &name, file)?;
            self.mount(mounted);
        }

        Ok(seen.len())
    }

    fn instantiate(&self, manifest: &RouteManifest, name: &str, path: &Path) -> Result<MountedRouter, DiscoveryError> {
        match manifest.instantiate(name, &self.registry) {
            Some(Ok(mounted)) => Ok(mounted),
            Some(Err(source)) => Err(DiscoveryError::Factory {
                name: name.to_string(),
                source,
            }),
            None => Err(DiscoveryError::UnknownModule {
                name: name.to_string(),
                path: path.to_path_buf(),
            }),
        }
    }
}

impl std::fmt::Debug for EndpointManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EndpointManager")
            .field("routers", &self.routers.keys().collect::<Vec<_>>())
            .field("table", &self.table)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::http::context::Context;
    use crate::http::events::ServerEvent;
    use crate::routing::router::Router;
    use axum::http::StatusCode;
    use axum::response::IntoResponse;
    use tower::ServiceExt;

    fn manager() -> (EndpointManager, Arc<RequestHandler>) {
        let events = EventBus::new();
        let context = Context::new(events.clone(), Arc::new(ServerConfig::with_routes("./routes")));
        let requests = Arc::new(RequestHandler::new(context));
        (EndpointManager::new(Arc::new(RouteRegistry::new()), events), requests)
    }

    async fn call(app: &axum::Router, method: &str, uri: &str) -> Response {
        let request = Request::builder().method(method).uri(uri).body(Body::empty()).unwrap();
        app.clone().oneshot(request).await.unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    fn owo_router() -> Router {
        let mut router = Router::new("/owo");
        router.route("/uwu").get("/", |_, _| async { Ok("uwu".into_response()) });
        router
    }

    #[tokio::test]
    async fn test_nested_route_is_live_and_prefix_is_not() {
        let (mut manager, requests) = manager();
        assert_eq!(manager.add_router(Arc::new(owo_router())), 1);
        assert!(manager.routers().contains_key("/owo"));

        let app = manager.into_table().into_router(requests);
        assert_eq!(call(&app, "GET", "/owo/uwu").await.status(), StatusCode::OK);
        assert_eq!(call(&app, "GET", "/owo").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_registration_reports_route_count() {
        let (mut manager, _requests) = manager();
        let mut events = manager.events.subscribe();
        manager.add_router(Arc::new(owo_router()));

        match events.recv().await.unwrap() {
            ServerEvent::Debug(message) => {
                assert_eq!(message, "[Endpoints -> Router] Registered 1 routes from '/owo'")
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_handler_error_becomes_event_and_500() {
        let (mut manager, requests) = manager();
        let mut events = manager.events.subscribe();

        let mut router = Router::new("/");
        router.get("/fail", |_, _| async {
            Err::<Response, _>(std::io::Error::other("disk on fire").into())
        });
        manager.add_router(Arc::new(router));

        let app = manager.into_table().into_router(requests);
        let response = call(&app, "GET", "/fail").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["message"], "disk on fire");
        assert_eq!(body["error"]["kind"], "Error");

        let error = loop {
            match events.recv().await.unwrap() {
                ServerEvent::Error(error) => break error,
                _ => continue,
            }
        };
        assert_eq!(error.message(), "disk on fire");

        // The app keeps serving after a failure.
        assert_eq!(call(&app, "GET", "/fail").await.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn test_failed_request_keeps_rate_limit_headers() {
        let (_manager, requests) = manager();
        let endpoint = Endpoint::from_handler(Verb::Get, "/fail", Default::default(), |_, _| async {
            Err(HandlerError::new("Boom", "x"))
        });

        let mut request = Request::builder().uri("/fail").body(Body::empty()).unwrap();
        request
            .extensions_mut()
            .insert(axum::extract::ConnectInfo(std::net::SocketAddr::from(([10, 9, 9, 9], 5000))));

        let response = dispatch(Arc::clone(&requests), endpoint, request).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["x-ratelimit-remaining"], "1000");
        assert_eq!(response.headers()["x-ratelimit-limit"], "1000");
        assert!(response.headers().contains_key("x-ratelimit-reset"));
        assert_eq!(body_json(response).await["error"]["kind"], "Boom");
    }

    #[tokio::test]
    async fn test_panic_is_contained() {
        let (mut manager, requests) = manager();
        let mut router = Router::new("/");
        router.get("/panic", |_, _| async {
            if true {
                panic!("handler exploded");
            }
            Ok("unreachable".into_response())
        });
        manager.add_router(Arc::new(router));

        let app = manager.into_table().into_router(requests);
        let response = call(&app, "GET", "/panic").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = body_json(response).await;
        assert_eq!(body["error"]["kind"], "Panic");
        assert_eq!(body["error"]["message"], "handler exploded");
    }

    #[tokio::test]
    async fn test_verbs_share_a_path() {
        let (mut manager, requests) = manager();
        let mut router = Router::new("/items");
        router
            .get("/:id", |_, _| async { Ok("read".into_response()) })
            .delete("/:id", |_, _| async { Ok("deleted".into_response()) });
        manager.add_router(Arc::new(router));
        assert_eq!(manager.table().len(), 2);

        let app = manager.into_table().into_router(requests);
        assert_eq!(call(&app, "GET", "/items/7").await.status(), StatusCode::OK);
        assert_eq!(call(&app, "DELETE", "/items/7").await.status(), StatusCode::OK);
        assert_eq!(call(&app, "PUT", "/items/7").await.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_head_on_get_route_is_rejected_by_policy() {
        let (mut manager, requests) = manager();
        manager.add_router(Arc::new(owo_router()));

        let app = manager.into_table().into_router(requests);
        let response = call(&app, "HEAD", "/owo/uwu").await;
        assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
    }

    #[tokio::test]
    async fn test_later_router_wins_duplicate_path() {
        let (mut manager, requests) = manager();
        let mut first = Router::new("/dup");
        first.get("/", |_, _| async { Ok("first".into_response()) });
        let mut second = Router::new("/dup");
        second.get("/", |_, _| async { Ok("second".into_response()) });

        manager.add_router(Arc::new(first));
        manager.add_router(Arc::new(second));
        assert_eq!(manager.table().len(), 1);
        assert_eq!(manager.routers().len(), 1);

        let app = manager.into_table().into_router(requests);
        let response = call(&app, "GET", "/dup").await;
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"second");
    }

    #[tokio::test]
    async fn test_conflicting_param_names_do_not_panic() {
        let (mut manager, requests) = manager();
        let mut router = Router::new("/users");
        router
            .get("/:id", |_, _| async { Ok("by id".into_response()) })
            .post("/:name", |_, _| async { Ok("by name".into_response()) });
        manager.add_router(Arc::new(router));

        let app = manager.into_table().into_router(requests);
        assert_eq!(call(&app, "GET", "/users/1").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_non_final_wildcard_is_skipped() {
        let (mut manager, requests) = manager();
        let mut router = Router::new("/files");
        router
            .get("/*rest/more", |_, _| async { Ok("never".into_response()) })
            .get("/:id", |_, _| async { Ok("file".into_response()) });
        manager.add_router(Arc::new(router));

        let app = manager.into_table().into_router(requests);
        assert_eq!(call(&app, "GET", "/files/1").await.status(), StatusCode::OK);
        assert_eq!(call(&app, "GET", "/files/a/more").await.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_load_directory_through_manifest() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("owo.rs"), "").unwrap();
        std::fs::write(dir.path().join(".hidden"), "").unwrap();
        std::fs::create_dir(dir.path().join("nested")).unwrap();
        std::fs::write(dir.path().join("nested").join("ignored.rs"), "").unwrap();

        let mut manifest = RouteManifest::new();
        manifest.register("owo", || Ok(owo_router()));

        let (mut manager, requests) = manager();
        assert_eq!(manager.load(dir.path(), &manifest).await.unwrap(), 1);
        assert!(manager.routers().contains_key("/owo"));

        let app = manager.into_table().into_router(requests);
        assert_eq!(call(&app, "GET", "/owo/uwu").await.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_load_mounts_each_stem_once_and_skips_symlinks() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("owo.rs"), "").unwrap();
        std::fs::write(dir.path().join("owo.ts"), "").unwrap();
        #[cfg(unix)]
        {
            let target = tempfile::tempdir().unwrap();
            std::os::unix::fs::symlink(target.path(), dir.path().join("linked")).unwrap();
            std::os::unix::fs::symlink(dir.path().join("owo.rs"), dir.path().join("alias.rs")).unwrap();
        }

        let built = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&built);
        let mut manifest = RouteManifest::new();
        manifest.register("owo", move || {
            counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(owo_router())
        });

        let (mut manager, _requests) = manager();
        assert_eq!(manager.load(dir.path(), &manifest).await.unwrap(), 1);
        assert_eq!(built.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(manager.table().len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_module_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a_known.rs"), "").unwrap();
        std::fs::write(dir.path().join("b_stray.rs"), "").unwrap();

        let mut manifest = RouteManifest::new();
        manifest.register("a_known", || Ok(owo_router()));

        let (mut manager, _requests) = manager();
        let err = manager.load(dir.path(), &manifest).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::UnknownModule { ref name, .. } if name == "b_stray"));
    }

    #[tokio::test]
    async fn test_factory_failure_aborts_load() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("db.rs"), "").unwrap();

        let mut manifest = RouteManifest::new();
        manifest.register::<Router, _>("db", || Err("connection refused".into()));

        let (mut manager, _requests) = manager();
        let err = manager.load(dir.path(), &manifest).await.unwrap_err();
        assert!(matches!(err, DiscoveryError::Factory { .. }));
        assert!(err.to_string().contains("connection refused"));
    }

    #[tokio::test]
    async fn test_missing_directory_is_not_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope");
        let file = dir.path().join("file.rs");
        std::fs::write(&file, "").unwrap();

        let (mut manager, _requests) = manager();
        let mut events = manager.events.subscribe();
        let manifest = RouteManifest::new();

        assert_eq!(manager.load(&missing, &manifest).await.unwrap(), 0);
        assert_eq!(manager.load(&file, &manifest).await.unwrap(), 0);

        match events.recv().await.unwrap() {
            ServerEvent::Debug(message) => {
                assert!(message.starts_with("[EndpointManager] Path "));
                assert!(message.ends_with("was not a directory."));
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_load_manifest_mounts_everything() {
        let mut manifest = RouteManifest::new();
        manifest
            .register("owo", || Ok(owo_router()))
            .register("health", || {
                let mut router = Router::new("/health");
                router.get("/", |_, _| async { Ok("ok".into_response()) });
                Ok(router)
            });

        let (mut manager, _requests) = manager();
        assert_eq!(manager.load_manifest(&manifest).unwrap(), 2);
        assert_eq!(manager.table().len(), 2);
        assert!(manager.table().get(Verb::Get, "/health").is_some());
    }

    #[test]
    fn test_route_shape_erases_names() {
        assert_eq!(route_shape("/users/{id}"), route_shape("/users/{name}"));
        assert_ne!(route_shape("/users/{id}"), route_shape("/users/{*rest}"));
        assert_eq!(route_shape("/static/a"), "/static/a");
    }

    #[test]
    fn test_wildcard_must_end_the_pattern() {
        assert!(wildcard_is_last("/files/{*rest}"));
        assert!(wildcard_is_last("/files/{id}"));
        assert!(!wildcard_is_last("/files/{*rest}/more"));
    }
}
