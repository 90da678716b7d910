//! `ServerEngine` against an in-process fake envd-server.
//!
//! The fake speaks the environment and image endpoints over real HTTP on a
//! random port, so requests go through `ureq` end to end.

use envd_core::{CoreError, EngineSettings, EnvironmentEngine, ErrorKind, ServerEngine};
use envd_schema::label::{LABEL_APT, LABEL_JUPYTER_ADDR, LABEL_PYPI, LABEL_VENDOR};
use envd_schema::{EngineSource, GpuRequest, StartOptions};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tiny_http::{Header, Method, Response, Server, StatusCode};

#[derive(Debug, Clone)]
struct Captured {
    method: String,
    url: String,
    auth: Option<String>,
    body: String,
}

#[derive(Default)]
struct FakeState {
    envs: BTreeMap<String, Value>,
    /// GETs left before a pending environment turns running; `None` never.
    pending: BTreeMap<String, Option<u32>>,
    start_delay: Option<u32>,
    images: Vec<Value>,
    requests: Vec<Captured>,
}

struct FakeServer {
    url: String,
    state: Arc<Mutex<FakeState>>,
}

const PREFIX: &str = "/api/v1/users/alice/";

fn respond_json(req: tiny_http::Request, code: u16, body: &Value) {
    let header = Header::from_bytes("Content-Type", "application/json").unwrap();
    let _ = req.respond(
        Response::from_string(body.to_string())
            .with_status_code(StatusCode(code))
            .with_header(header),
    );
}

fn respond_err(req: tiny_http::Request, code: u16, msg: &str) {
    let _ = req.respond(Response::from_string(msg).with_status_code(StatusCode(code)));
}

fn handle(state: &Mutex<FakeState>, mut req: tiny_http::Request) {
    let method = req.method().clone();
    let url = req.url().to_owned();
    let auth = req
        .headers()
        .iter()
        .find(|h| h.field.equiv("Authorization"))
        .map(|h| h.value.as_str().to_owned());
    let mut body = String::new();
    let _ = req.as_reader().read_to_string(&mut body);

    let mut s = state.lock().unwrap();
    s.requests.push(Captured {
        method: method.to_string(),
        url: url.clone(),
        auth,
        body: body.clone(),
    });

    let Some(path) = url.strip_prefix(PREFIX) else {
        drop(s);
        respond_err(req, 500, "internal error");
        return;
    };
    let path = path.to_owned();

    match (&method, path.split_once('/')) {
        (Method::Get, None) if path == "environments" => {
            let items: Vec<Value> = s.envs.values().cloned().collect();
            drop(s);
            respond_json(req, 200, &json!({ "items": items }));
        }
        (Method::Post, None) if path == "environments" => {
            let mut env: Value = serde_json::from_str(&body).unwrap();
            let name = env["name"].as_str().unwrap().to_owned();
            if s.envs.contains_key(&name) {
                drop(s);
                respond_err(req, 409, "already exists");
                return;
            }
            env["status"] = json!({ "phase": "Pending" });
            env["spec"]["ports"] = json!([{ "name": "ssh", "port": 2222 }]);
            let delay = s.start_delay;
            s.pending.insert(name.clone(), delay);
            s.envs.insert(name, env.clone());
            drop(s);
            respond_json(
                req,
                201,
                &json!({ "environment": env, "warnings": ["quota nearly reached"] }),
            );
        }
        (Method::Get, Some(("environments", name))) => {
            let name = name.to_owned();
            let ready = match s.pending.get_mut(&name) {
                Some(Some(0)) => true,
                Some(Some(n)) => {
                    *n -= 1;
                    false
                }
                _ => false,
            };
            let Some(env) = s.envs.get_mut(&name) else {
                drop(s);
                respond_err(req, 404, "not found");
                return;
            };
            if ready {
                env["status"]["phase"] = json!("Running");
            }
            let env = env.clone();
            drop(s);
            respond_json(req, 200, &env);
        }
        (Method::Delete, Some(("environments", name))) => {
            let removed = s.envs.remove(name).is_some();
            drop(s);
            if removed {
                respond_json(req, 200, &json!({}));
            } else {
                respond_err(req, 404, "not found");
            }
        }
        (Method::Get, None) if path == "images" => {
            let items = s.images.clone();
            drop(s);
            respond_json(req, 200, &json!({ "items": items }));
        }
        (Method::Get, Some(("images", name))) => {
            let found = s.images.iter().find(|i| i["name"] == name).cloned();
            drop(s);
            match found {
                Some(img) => respond_json(req, 200, &img),
                None => respond_err(req, 404, "not found"),
            }
        }
        _ => {
            drop(s);
            respond_err(req, 405, "method not allowed");
        }
    }
}

impl FakeServer {
    fn start(start_delay: Option<u32>) -> Self {
        let server = Server::http("127.0.0.1:0").unwrap();
        let port = server.server_addr().to_ip().unwrap().port();
        let state = Arc::new(Mutex::new(FakeState {
            start_delay,
            ..FakeState::default()
        }));
        let shared = Arc::clone(&state);
        std::thread::spawn(move || {
            for req in server.incoming_requests() {
                handle(&shared, req);
            }
        });
        Self {
            url: format!("http://127.0.0.1:{port}"),
            state,
        }
    }

    fn engine(&self, login: &str, token: Option<&str>) -> ServerEngine {
        ServerEngine::new(
            &self.url,
            login,
            token.map(str::to_owned),
            &EngineSettings {
                poll_interval: Duration::from_millis(10),
                ..EngineSettings::default()
            },
        )
    }

    fn requests(&self) -> Vec<Captured> {
        self.state.lock().unwrap().requests.clone()
    }

    fn add_image(&self, image: Value) {
        self.state.lock().unwrap().images.push(image);
    }
}

fn options(name: &str) -> StartOptions {
    let mut opts = StartOptions::new(name, "/work/mnist");
    opts.image = Some("mnist:dev".to_owned());
    opts.source = EngineSource::Server;
    opts.timeout = Duration::from_secs(5);
    opts
}

#[test]
fn start_creates_and_waits_for_running() {
    let server = FakeServer::start(Some(2));
    let engine = server.engine("alice", Some("jwt-123"));

    let mut opts = options("mnist");
    opts.shm_size = 64;
    opts.num_cpu = Some("2".to_owned());
    opts.gpu = GpuRequest::Count(2);

    let result = engine.start(&opts).unwrap();
    assert_eq!(result.name, "mnist");
    assert_eq!(result.ssh_port, 2222);
    assert_eq!(result.ports.len(), 1);
    assert!(engine.is_running("mnist").unwrap());

    let requests = server.requests();
    let create = requests.iter().find(|r| r.method == "POST").unwrap();
    assert_eq!(create.url, "/api/v1/users/alice/environments");
    let body: Value = serde_json::from_str(&create.body).unwrap();
    assert_eq!(body["spec"]["image"], "mnist:dev");
    assert_eq!(body["resource"]["shm"], "64Mi");
    assert_eq!(body["resource"]["gpu"], "2");
    assert_eq!(body["resource"]["cpu"], "2");
    assert!(requests
        .iter()
        .all(|r| r.auth.as_deref() == Some("Bearer jwt-123")));
}

#[test]
fn start_rejects_docker_options() {
    let server = FakeServer::start(Some(0));
    let engine = server.engine("alice", None);
    let mut opts = options("mnist");
    opts.source = EngineSource::default();
    assert!(matches!(
        engine.start(&opts),
        Err(CoreError::InvalidOptions(_))
    ));
    assert!(server.requests().is_empty());
}

#[test]
fn start_times_out_with_last_phase() {
    let server = FakeServer::start(None);
    let engine = server.engine("alice", None);
    let mut opts = options("stuck");
    opts.timeout = Duration::from_millis(100);

    match engine.start(&opts).unwrap_err() {
        CoreError::Timeout { last_state, .. } => assert_eq!(last_state, "Pending"),
        other => panic!("expected timeout, got {other:?}"),
    }
}

#[test]
fn existence_and_destroy() {
    let server = FakeServer::start(Some(0));
    let engine = server.engine("alice", None);

    assert!(!engine.exists("mnist").unwrap());
    assert!(!engine.is_running("mnist").unwrap());
    assert!(matches!(
        engine.get_environment("mnist"),
        Err(CoreError::EnvNotFound(_))
    ));
    assert_eq!(engine.destroy("mnist").unwrap(), None);

    engine.start(&options("mnist")).unwrap();
    assert!(engine.exists("mnist").unwrap());
    assert_eq!(engine.list_environments().unwrap().len(), 1);

    assert_eq!(engine.destroy("mnist").unwrap().as_deref(), Some("mnist"));
    assert!(!engine.exists("mnist").unwrap());
}

#[test]
fn clean_if_exists_removes_remote_environment() {
    let server = FakeServer::start(Some(0));
    let engine = server.engine("alice", None);
    engine.start(&options("mnist")).unwrap();

    engine.clean_if_exists("mnist", false).unwrap();
    assert!(!engine.exists("mnist").unwrap());
    engine.clean_if_exists("mnist", false).unwrap();
}

#[test]
fn unsupported_operations() {
    let server = FakeServer::start(Some(0));
    let engine = server.engine("alice", None);
    for err in [
        engine.pause("mnist").unwrap_err(),
        engine.resume("mnist").unwrap_err(),
        engine.gpu_enabled().unwrap_err(),
        engine.info().unwrap_err(),
    ] {
        assert_eq!(err.kind(), ErrorKind::Unsupported);
    }
}

#[test]
fn port_bindings_report_the_ssh_gateway() {
    let server = FakeServer::start(Some(0));
    let engine = server.engine("alice", None);
    assert!(matches!(
        engine.list_env_port_bindings("mnist"),
        Err(CoreError::EnvNotFound(_))
    ));

    engine.start(&options("mnist")).unwrap();
    let bindings = engine.list_env_port_bindings("mnist").unwrap();
    assert_eq!(bindings.len(), 1);
    assert_eq!(bindings[0].name, "ssh");
    assert_eq!(bindings[0].port, 2222);
    assert_eq!(bindings[0].protocol, "TCP");
}

#[test]
fn images_and_dependencies() {
    let server = FakeServer::start(Some(0));
    server.add_image(json!({
        "name": "mnist:dev",
        "digest": "sha256:0123456789abcdef0123",
        "created": 1_700_000_000,
        "size": 4096,
        "labels": {
            LABEL_VENDOR: "envd",
            LABEL_APT: "[\"git\"]",
            LABEL_PYPI: "[\"torch\",\"--extra-index-url\",\"https://mirror\"]",
            LABEL_JUPYTER_ADDR: "http://127.0.0.1:8888",
        }
    }));
    let engine = server.engine("alice", None);

    let images = engine.list_images().unwrap();
    assert_eq!(images.len(), 1);
    assert_eq!(images[0].size, 4096);
    assert!(images[0].created.is_some());

    let img = engine.get_image("mnist:dev").unwrap();
    assert_eq!(img.id.short(), "0123456789ab");

    let dep = engine.list_image_dependency("mnist:dev").unwrap();
    assert_eq!(dep.apt_packages, vec!["git"]);
    assert_eq!(dep.pypi_packages, vec!["torch"]);

    assert!(matches!(
        engine.get_image("missing:dev"),
        Err(CoreError::ImageNotFound(_))
    ));
}

#[test]
fn image_graph_comes_from_the_graph_label() {
    let server = FakeServer::start(Some(0));
    let graph = envd_schema::BuildGraph {
        num_gpus: Some(2),
        ..envd_schema::BuildGraph::default()
    };
    server.add_image(json!({
        "name": "gpu:dev",
        "digest": "sha256:aaaaaaaaaaaaaaaaaaaa",
        "created": 1_700_000_000,
        "size": 1,
        "labels": envd_schema::encode_image_labels(&graph, "/work/gpu").unwrap(),
    }));
    server.add_image(json!({
        "name": "plain:dev",
        "digest": "sha256:bbbbbbbbbbbbbbbbbbbb",
        "created": 1_700_000_000,
        "size": 1,
        "labels": { LABEL_VENDOR: "envd" },
    }));
    let engine = server.engine("alice", None);

    let recorded = engine.get_image_graph("gpu:dev").unwrap().unwrap();
    assert_eq!(recorded.num_gpus, Some(2));
    assert_eq!(engine.get_image_graph("plain:dev").unwrap(), None);
    assert!(matches!(
        engine.get_image_graph("missing:dev"),
        Err(CoreError::ImageNotFound(_))
    ));
}

#[test]
fn server_errors_are_transport_failures() {
    let server = FakeServer::start(Some(0));
    let engine = server.engine("bob", None);
    let err = engine.exists("mnist").unwrap_err();
    assert!(matches!(err, CoreError::Http { status: 500, .. }));
    assert_eq!(err.kind(), ErrorKind::Transport);
}

#[test]
fn unreachable_server_is_a_transport_error() {
    let port = envd_runtime::get_free_port().unwrap();
    let engine = ServerEngine::new(
        &format!("http://127.0.0.1:{port}"),
        "alice",
        None,
        &EngineSettings::default(),
    );
    let err = engine.list_environments().unwrap_err();
    assert!(matches!(err, CoreError::Transport(_)));
}
