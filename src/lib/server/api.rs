use std::future::Future;
use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{Path, State as AxumState},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{delete, get, post},
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::{info, warn};
use uuid::Uuid;

use super::cache::ImageCache;
use super::types::{
    CreateContainerRequest, ErrorResponse, ExposeRequest, MessageResponse, TaskStatus,
    TaskSubmitted, normalize_distro, valid_container_name, valid_device_name,
};
use crate::lib::backend::types::{
    BackendError, ContainerBackend, ImageCatalog, ImageRef, UserSpec,
};
use crate::lib::config::Config;
use crate::lib::executor::executor::Executor;
use crate::lib::executor::types::{Outcome, SubmitError};
use crate::lib::tasks::registry::TaskRegistry;
use crate::lib::tasks::types::TaskAction;

pub struct AppState {
    pub config: Config,
    pub backend: Arc<dyn ContainerBackend>,
    pub registry: Arc<TaskRegistry>,
    pub executor: Arc<Executor>,
    pub images: ImageCache,
}

pub struct ApiServer {
    state: Arc<AppState>,
}

impl ApiServer {
    pub fn new(state: Arc<AppState>) -> Self {
        ApiServer { state }
    }

    pub fn router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/images", get(Self::get_images))
            .route(
                "/containers",
                get(Self::list_containers).post(Self::create_container),
            )
            .route("/containers/{name}", delete(Self::delete_container))
            .route("/containers/{name}/start", post(Self::start_container))
            .route("/containers/{name}/stop", post(Self::stop_container))
            .route("/containers/{name}/expose", post(Self::expose_port))
            .route(
                "/containers/{name}/expose/{device_name}",
                delete(Self::remove_expose),
            )
            .route("/tasks/{task_id}", get(Self::get_task))
            .layer(CorsLayer::permissive())
            .with_state(state)
    }

    pub async fn start_server(self) -> std::io::Result<()> {
        let addr = self.state.config.bind_addr.clone();
        let app = Self::router(self.state);
        let listener = TcpListener::bind(&addr).await?;
        info!(%addr, "listening");
        axum::serve(listener, app).await
    }

    async fn get_images(AxumState(state): AxumState<Arc<AppState>>) -> Json<ImageCatalog> {
        if let Some(catalog) = state.images.fresh() {
            return Json(catalog);
        }
        match state.backend.list_images().await {
            Ok(catalog) => {
                state.images.store(catalog.clone());
                Json(catalog)
            }
            Err(err) => {
                warn!(error = %err, "failed to fetch image catalog");
                Json(ImageCatalog::new())
            }
        }
    }

    async fn list_containers(AxumState(state): AxumState<Arc<AppState>>) -> Response {
        match state.backend.list().await {
            Ok(listing) => Json(listing).into_response(),
            Err(err) => {
                warn!(error = %err, "failed to list containers");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(ErrorResponse {
                        error: err.to_string(),
                    }),
                )
                    .into_response()
            }
        }
    }

    async fn create_container(
        AxumState(state): AxumState<Arc<AppState>>,
        Json(req): Json<CreateContainerRequest>,
    ) -> Response {
        let name = req.name.trim().to_string();
        if !valid_container_name(&name) {
            return bad_request("invalid container name");
        }
        if req.user.trim().is_empty() || req.password.is_empty() {
            return bad_request("user and password are required");
        }
        let distro = normalize_distro(&req.distro);
        let version = req.version.trim().to_string();
        if distro.is_empty() || version.is_empty() {
            return bad_request("distro and version are required");
        }

        let backend = Arc::clone(&state.backend);
        let image = ImageRef { distro, version };
        let user = UserSpec {
            user: req.user.trim().to_string(),
            password: req.password,
        };
        let target = name.clone();
        let work = async move {
            backend.launch(&image, &target, Some(&user)).await?;
            Ok(format!(
                "Container {} ({} {}) created.",
                target, image.distro, image.version
            ))
        };
        submit_response(&state, TaskAction::Create, &name, work)
    }

    async fn delete_container(
        AxumState(state): AxumState<Arc<AppState>>,
        Path(name): Path<String>,
    ) -> Response {
        if !valid_container_name(&name) {
            return bad_request("invalid container name");
        }
        let backend = Arc::clone(&state.backend);
        let target = name.clone();
        let work = async move {
            backend.delete(&target).await?;
            Ok(format!("Container {target} deleted."))
        };
        submit_response(&state, TaskAction::Delete, &name, work)
    }

    async fn start_container(
        AxumState(state): AxumState<Arc<AppState>>,
        Path(name): Path<String>,
    ) -> Response {
        if !valid_container_name(&name) {
            return bad_request("invalid container name");
        }
        let backend = Arc::clone(&state.backend);
        let target = name.clone();
        let work = async move {
            backend.start(&target).await?;
            Ok(format!("Container {target} started."))
        };
        submit_response(&state, TaskAction::Start, &name, work)
    }

    async fn stop_container(
        AxumState(state): AxumState<Arc<AppState>>,
        Path(name): Path<String>,
    ) -> Response {
        if !valid_container_name(&name) {
            return bad_request("invalid container name");
        }
        let backend = Arc::clone(&state.backend);
        let target = name.clone();
        let work = async move {
            backend.stop(&target).await?;
            Ok(format!("Container {target} stopped."))
        };
        submit_response(&state, TaskAction::Stop, &name, work)
    }

    async fn expose_port(
        AxumState(state): AxumState<Arc<AppState>>,
        Path(name): Path<String>,
        Json(req): Json<ExposeRequest>,
    ) -> Response {
        if !valid_container_name(&name) {
            return bad_request("invalid container name");
        }
        if req.host_port == 0 || req.container_port == 0 {
            return bad_request("ports must be non-zero");
        }

        let backend = Arc::clone(&state.backend);
        let target = name.clone();
        let work = async move {
            backend
                .add_port_forward(&target, req.host_port, req.container_port)
                .await?;
            Ok(format!(
                "Port {} redirected to container {}:{}",
                req.host_port, target, req.container_port
            ))
        };
        tracked_response(&state, TaskAction::Expose, &name, work).await
    }

    async fn remove_expose(
        AxumState(state): AxumState<Arc<AppState>>,
        Path((name, device_name)): Path<(String, String)>,
    ) -> Response {
        if !valid_container_name(&name) {
            return bad_request("invalid container name");
        }
        if !valid_device_name(&device_name) {
            return bad_request("invalid device name");
        }

        let backend = Arc::clone(&state.backend);
        let target = name.clone();
        let work = async move {
            backend.remove_port_forward(&target, &device_name).await?;
            Ok(format!("Redirection {device_name} removed."))
        };
        tracked_response(&state, TaskAction::Unexpose, &name, work).await
    }

    async fn get_task(
        AxumState(state): AxumState<Arc<AppState>>,
        Path(task_id): Path<String>,
    ) -> Response {
        let not_found = || {
            (
                StatusCode::NOT_FOUND,
                Json(ErrorResponse {
                    error: format!("task {task_id} not found"),
                }),
            )
                .into_response()
        };

        let Ok(id) = Uuid::parse_str(&task_id) else {
            return not_found();
        };
        match state.registry.get(id) {
            Some(task) => Json(TaskStatus::from(task)).into_response(),
            None => not_found(),
        }
    }
}

fn bad_request(detail: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: detail.to_string(),
        }),
    )
        .into_response()
}

fn submit_error(err: SubmitError) -> Response {
    let status = match &err {
        SubmitError::Conflict(_) => StatusCode::CONFLICT,
        SubmitError::Registry(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (
        status,
        Json(ErrorResponse {
            error: err.to_string(),
        }),
    )
        .into_response()
}

fn submit_response<F>(state: &AppState, action: TaskAction, target: &str, work: F) -> Response
where
    F: Future<Output = Result<String, BackendError>> + Send + 'static,
{
    match state.executor.submit(action, Some(target), work) {
        Ok(task_id) => Json(TaskSubmitted { task_id }).into_response(),
        Err(err) => submit_error(err),
    }
}

/// Expose/unexpose answer with the result inline rather than a task id,
/// but still run under the target lock and leave a task record behind.
async fn tracked_response<F>(
    state: &AppState,
    action: TaskAction,
    target: &str,
    work: F,
) -> Response
where
    F: Future<Output = Result<String, BackendError>> + Send + 'static,
{
    match state.executor.run_tracked(action, Some(target), work).await {
        Ok(Outcome::Success(message)) => Json(MessageResponse { message }).into_response(),
        Ok(Outcome::Error(error)) => Json(ErrorResponse { error }).into_response(),
        Err(err) => submit_error(err),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lib::backend::types::{ContainerListing, ContainerSummary, PortRedirect};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use parking_lot::Mutex;
    use std::time::Duration;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    #[derive(Default)]
    struct MockBackend {
        launch_gate: Option<Arc<Notify>>,
        fail_stop: bool,
        listing: ContainerListing,
        catalog: ImageCatalog,
        image_calls: Mutex<usize>,
    }

    #[async_trait::async_trait]
    impl ContainerBackend for MockBackend {
        async fn launch(
            &self,
            _image: &ImageRef,
            _name: &str,
            _user: Option<&UserSpec>,
        ) -> Result<(), BackendError> {
            if let Some(gate) = &self.launch_gate {
                gate.notified().await;
            }
            Ok(())
        }

        async fn start(&self, _name: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn stop(&self, name: &str) -> Result<(), BackendError> {
            if self.fail_stop {
                return Err(BackendError::CommandFailed {
                    command: format!("lxc stop {name}"),
                    stderr: "Instance not found".to_string(),
                });
            }
            Ok(())
        }

        async fn delete(&self, _name: &str) -> Result<(), BackendError> {
            Ok(())
        }

        async fn list(&self) -> Result<ContainerListing, BackendError> {
            Ok(self.listing.clone())
        }

        async fn list_images(&self) -> Result<ImageCatalog, BackendError> {
            *self.image_calls.lock() += 1;
            Ok(self.catalog.clone())
        }

        async fn add_port_forward(
            &self,
            _name: &str,
            _host_port: u16,
            container_port: u16,
        ) -> Result<String, BackendError> {
            Ok(format!("proxy-{container_port}"))
        }

        async fn remove_port_forward(
            &self,
            _name: &str,
            _device_name: &str,
        ) -> Result<(), BackendError> {
            Ok(())
        }
    }

    fn app(backend: MockBackend) -> (Router, Arc<AppState>, Arc<MockBackend>) {
        let mock = Arc::new(backend);
        let dyn_backend: Arc<dyn ContainerBackend> = mock.clone();
        let config = Config::default();
        let registry = Arc::new(TaskRegistry::new(config.max_live_tasks));
        let executor = Arc::new(Executor::new(Arc::clone(&registry), config.max_workers));
        let state = Arc::new(AppState {
            images: ImageCache::new(config.image_cache_ttl),
            backend: dyn_backend,
            registry,
            executor,
            config,
        });
        (ApiServer::router(Arc::clone(&state)), state, mock)
    }

    fn get_req(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    fn post_json(uri: &str, body: serde_json::Value) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap()
    }

    fn post_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("POST")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    fn delete_req(uri: &str) -> Request<Body> {
        Request::builder()
            .method("DELETE")
            .uri(uri)
            .body(Body::empty())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    async fn poll_task(router: &Router, task_id: &str) -> serde_json::Value {
        for _ in 0..500 {
            let response = router
                .clone()
                .oneshot(get_req(&format!("/tasks/{task_id}")))
                .await
                .unwrap();
            let status = body_json(response).await;
            if status["completed"] == true {
                return status;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("task {task_id} never completed");
    }

    fn create_body(name: &str) -> serde_json::Value {
        serde_json::json!({
            "name": name,
            "user": "admin",
            "password": "hunter2",
            "distro": "Debian",
            "version": "12"
        })
    }

    #[tokio::test]
    async fn create_returns_task_id_and_polls_to_success() {
        let (router, _, _) = app(MockBackend::default());

        let response = router
            .clone()
            .oneshot(post_json("/containers", create_body("web1")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let submitted = body_json(response).await;
        let task_id = submitted["task_id"].as_str().unwrap().to_string();

        let status = poll_task(&router, &task_id).await;
        assert_eq!(status["status"], "success");
        assert_eq!(status["action"], "create");
        assert!(status["message"].as_str().unwrap().contains("web1"));
        assert!(status["error"].is_null());
    }

    #[tokio::test]
    async fn concurrent_mutations_on_one_container_conflict() {
        let gate = Arc::new(Notify::new());
        let (router, _, _) = app(MockBackend {
            launch_gate: Some(Arc::clone(&gate)),
            ..MockBackend::default()
        });

        let response = router
            .clone()
            .oneshot(post_json("/containers", create_body("web1")))
            .await
            .unwrap();
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        // the create is still in flight: a stop for the same name is rejected
        let response = router
            .clone()
            .oneshot(post_req("/containers/web1/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::CONFLICT);
        assert!(
            body_json(response).await["error"]
                .as_str()
                .unwrap()
                .contains("web1")
        );

        // another container is untouched by web1's lock
        let response = router
            .clone()
            .oneshot(post_req("/containers/db1/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        gate.notify_one();
        let status = poll_task(&router, &task_id).await;
        assert_eq!(status["status"], "success");

        // completion released the lock
        let response = router
            .clone()
            .oneshot(post_req("/containers/web1/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn failed_operation_reports_error_and_frees_the_name() {
        let (router, _, _) = app(MockBackend {
            fail_stop: true,
            ..MockBackend::default()
        });

        let response = router
            .clone()
            .oneshot(post_req("/containers/ghost/stop"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();

        let status = poll_task(&router, &task_id).await;
        assert_eq!(status["status"], "error");
        assert!(
            status["error"]
                .as_str()
                .unwrap()
                .contains("Instance not found")
        );
        assert!(status["message"].is_null());

        // the error detail is stable across reads
        let again = poll_task(&router, &task_id).await;
        assert_eq!(again["error"], status["error"]);

        // no stale lock: a start for the same name is accepted
        let response = router
            .clone()
            .oneshot(post_req("/containers/ghost/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unknown_task_ids_are_not_found() {
        let (router, state, _) = app(MockBackend::default());

        let response = router
            .clone()
            .oneshot(get_req(&format!("/tasks/{}", Uuid::new_v4())))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = router
            .clone()
            .oneshot(get_req("/tasks/not-a-task-id"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        // a swept task is gone for pollers too
        let response = router
            .clone()
            .oneshot(post_req("/containers/web1/start"))
            .await
            .unwrap();
        let task_id = body_json(response).await["task_id"]
            .as_str()
            .unwrap()
            .to_string();
        poll_task(&router, &task_id).await;

        state.registry.sweep(Duration::ZERO);
        let response = router
            .clone()
            .oneshot(get_req(&format!("/tasks/{task_id}")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn images_are_served_from_cache_within_ttl() {
        let mut catalog = ImageCatalog::new();
        catalog.insert("debian".to_string(), vec!["13".to_string(), "12".to_string()]);
        let (router, _, mock) = app(MockBackend {
            catalog,
            ..MockBackend::default()
        });

        let response = router.clone().oneshot(get_req("/images")).await.unwrap();
        let images = body_json(response).await;
        assert_eq!(images["debian"][0], "13");

        let response = router.clone().oneshot(get_req("/images")).await.unwrap();
        let images = body_json(response).await;
        assert_eq!(images["debian"][1], "12");

        // second request was a cache hit
        assert_eq!(*mock.image_calls.lock(), 1);
    }

    #[tokio::test]
    async fn containers_listing_is_a_direct_passthrough() {
        let listing = ContainerListing {
            containers: vec![ContainerSummary {
                name: "web1".to_string(),
                status: "Running".to_string(),
                ipv4: "10.150.0.7".to_string(),
                memory: 1024,
                disk: 2048,
                cpu_time: "1.5%".to_string(),
                os: "Debian".to_string(),
                release: "12".to_string(),
                architecture: "amd64".to_string(),
            }],
            redirections: vec![PortRedirect {
                container: "web1".to_string(),
                device_name: "proxy-80".to_string(),
                listen: "tcp:0.0.0.0:8080".to_string(),
                connect: "tcp:127.0.0.1:80".to_string(),
            }],
        };
        let (router, _, _) = app(MockBackend {
            listing,
            ..MockBackend::default()
        });

        let response = router.clone().oneshot(get_req("/containers")).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let listing = body_json(response).await;
        assert_eq!(listing["containers"][0]["name"], "web1");
        assert_eq!(listing["containers"][0]["cpu_time"], "1.5%");
        assert_eq!(listing["redirections"][0]["device_name"], "proxy-80");
    }

    #[tokio::test]
    async fn expose_answers_inline_and_records_a_task() {
        let (router, state, _) = app(MockBackend::default());

        let response = router
            .clone()
            .oneshot(post_json(
                "/containers/web1/expose",
                serde_json::json!({"host_port": 8080, "container_port": 80}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(
            body["message"],
            "Port 8080 redirected to container web1:80"
        );

        // the operation left a pollable record and no lock behind
        assert_eq!(state.registry.len(), 1);

        let response = router
            .clone()
            .oneshot(delete_req("/containers/web1/expose/proxy-80"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let body = body_json(response).await;
        assert_eq!(body["message"], "Redirection proxy-80 removed.");
    }

    #[tokio::test]
    async fn invalid_input_is_rejected_up_front() {
        let (router, state, _) = app(MockBackend::default());

        let response = router
            .clone()
            .oneshot(post_json("/containers", create_body("-bad-name")))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(post_json(
                "/containers/web1/expose",
                serde_json::json!({"host_port": 0, "container_port": 80}),
            ))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        let response = router
            .clone()
            .oneshot(post_req("/containers/bad%20name/start"))
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);

        // nothing was submitted for any of these
        assert!(state.registry.is_empty());
    }
}
