//! Route-level tests driven through `tower::ServiceExt::oneshot`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::response::Response;
use retro_exec::{CommandSpec, ExecResult, ProcessRunner};
use retro_pipeline::{PipelineCoordinator, ToolPaths};
use retro_server::{router, AppState, ServerConfig};
use retro_types::{archive, Result};
use serde_json::{json, Value};
use tempfile::TempDir;
use tower::ServiceExt;

const BOUNDARY: &str = "retro-test-boundary";
const HEADER: &str = "Rule ID,Rule,EC number,Reaction order,Diameter,Score,Legacy ID,Reaction direction,Rule relative direction,Rule usage,Score normalized";
const SCOPE: &str = "Initial source,Transformation ID\nS1,T1\n";
const SINK: &str = "\"Name\",\"InChI\"\n\"MNXM1\",\"InChI=1S/H2O/h1H2\"\n";

/// Stand-in for both external tools.
#[derive(Default)]
struct FakeTools {
    source_in_sink: bool,
    timed_out: bool,
}

#[async_trait::async_trait]
impl ProcessRunner for FakeTools {
    async fn run(&self, spec: &CommandSpec) -> Result<ExecResult> {
        let mut exec = ExecResult {
            exit_code: Some(0),
            ..Default::default()
        };
        if spec.program_name() == "knime" {
            let dir = spec
                .arg_value("-workflow.variable=output.dir,\"")
                .and_then(|v| v.strip_suffix("/\",String"))
                .map(PathBuf::from)
                .unwrap();
            let mut sis = String::from("\"source\",\"sink\"\n");
            if self.source_in_sink {
                sis.push_str("\"target\",\"MNXM1\"\n");
            }
            std::fs::write(dir.join("source-in-sink.csv"), sis).unwrap();
            std::fs::write(dir.join("results.csv"), SCOPE).unwrap();
            if self.timed_out {
                exec.timed_out = true;
                exec.exit_code = None;
            } else {
                std::fs::write(dir.join("target_scope.csv"), SCOPE).unwrap();
            }
        } else {
            let pos = spec.args.iter().position(|a| a == "--outdir").unwrap();
            let dir = PathBuf::from(spec.args[pos + 1].trim_end_matches('/'));
            std::fs::write(dir.join("out_paths.csv"), "Path ID\n1\n").unwrap();
            std::fs::write(dir.join("compounds.txt"), "cmpd_id\tstructure\n").unwrap();
        }
        Ok(exec)
    }
}

struct Service {
    state: AppState,
    _rules: TempDir,
}

impl Service {
    fn new(tools: FakeTools) -> Self {
        let rules = TempDir::new().unwrap();
        let table = format!(
            "{HEADER}\nR2,r,1.1.1.1,1,2,1,L,1,1,both,1\nR4,r,1.1.1.1,1,4,1,L,1,1,retro,1\n"
        );
        std::fs::write(rules.path().join("rules_rall_rp2.csv"), &table).unwrap();
        std::fs::write(rules.path().join("rules_rall_rp2_retro.csv"), &table).unwrap();
        let paths = ToolPaths {
            rules_dir: rules.path().to_path_buf(),
            ..ToolPaths::default()
        };
        let coordinator = PipelineCoordinator::new(Arc::new(tools), paths);
        let config = ServerConfig {
            poll_interval: Duration::from_millis(5),
            ..ServerConfig::default()
        };
        Self {
            state: AppState::new(coordinator, &config),
            _rules: rules,
        }
    }

    async fn send(&self, request: Request<Body>) -> Response {
        router(self.state.clone()).oneshot(request).await.unwrap()
    }
}

fn multipart(uri: &str, data: Value, files: &[(&str, &[u8])]) -> Request<Body> {
    let mut body = Vec::new();
    body.extend_from_slice(
        format!(
            "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"data\"\r\n\r\n{data}\r\n"
        )
        .as_bytes(),
    );
    for (name, bytes) in files {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"{name}\"; filename=\"{name}\"\r\nContent-Type: application/octet-stream\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());
    Request::post(uri)
        .header(
            "content-type",
            format!("multipart/form-data; boundary={BOUNDARY}"),
        )
        .body(Body::from(body))
        .unwrap()
}

async fn bytes(response: Response) -> Vec<u8> {
    axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap()
        .to_vec()
}

async fn json_body(response: Response) -> Value {
    serde_json::from_slice(&bytes(response).await).unwrap()
}

fn pipeline_data() -> Value {
    json!({
        "max_steps": 3,
        "source_inchi": "InChI=1S/C3H8O/c1-2-3-4/h4H,2-3H2,1H3",
        "time_out": 1,
        "ram_limit": 2,
    })
}

#[tokio::test]
async fn stamp_answers_on_root_and_api() {
    let service = Service::new(FakeTools::default());
    for uri in ["/", "/api"] {
        let response = service
            .send(Request::get(uri).body(Body::empty()).unwrap())
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let body = json_body(response).await;
        assert_eq!(body["app"], "retrosynthesis");
        assert_eq!(body["status"], "running");
        assert!(body["time"].is_string());
    }
}

#[tokio::test]
async fn builtin_rules_are_filtered() {
    let service = Service::new(FakeTools::default());
    let response = service
        .send(multipart(
            "/retrorules",
            json!({"rules_type": "retro", "diameters": "2,4"}),
            &[],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["content-type"], "text/csv");
    let text = String::from_utf8(bytes(response).await).unwrap();
    assert!(text.contains("\"R2\""));
    assert!(text.contains("\"R4\""));
}

#[tokio::test]
async fn malformed_uploaded_rules_are_a_client_error() {
    let service = Service::new(FakeTools::default());
    let upload = format!("{HEADER}\nR,r,1,1,big,1,L,1,1,both,1\n");
    let response = service
        .send(multipart(
            "/retrorules",
            json!({"input_format": "csv"}),
            &[("rules_file", upload.as_bytes())],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["data"]["message"].as_str().unwrap().contains("big"));
}

#[tokio::test]
async fn pipeline_returns_three_entry_archive() {
    let service = Service::new(FakeTools::default());
    let response = service
        .send(multipart("/pipeline", pipeline_data(), &[("sink_file", SINK.as_bytes())]))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert!(response.headers().get("status_message").is_none());
    let entries = archive::unpack(&bytes(response).await).unwrap();
    let names: Vec<&str> = entries.iter().map(|(n, _)| n.as_str()).collect();
    assert_eq!(names, ["rp2_pathways", "rp2paths_pathways", "rp2paths_compounds"]);
}

#[tokio::test]
async fn source_in_sink_maps_to_its_own_code() {
    let service = Service::new(FakeTools {
        source_in_sink: true,
        ..Default::default()
    });
    let response = service
        .send(multipart("/pipeline", pipeline_data(), &[("sink_file", SINK.as_bytes())]))
        .await;
    assert_eq!(response.status(), StatusCode::CONFLICT);
    let body = json_body(response).await;
    assert_eq!(body["data"]["tag"], "expansion-source-in-sink");
}

#[tokio::test]
async fn expansion_without_max_steps_is_rejected() {
    let service = Service::new(FakeTools::default());
    let response = service
        .send(multipart(
            "/retropath2",
            json!({"source_inchi": "InChI=1S/X", "rules_format": "csv"}),
            &[("rules_file", &b"a"[..]), ("sink_file", SINK.as_bytes())],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body = json_body(response).await;
    assert!(body["data"]["message"].as_str().unwrap().contains("max_steps"));
}

#[tokio::test]
async fn partial_expansion_is_flagged_in_a_header() {
    let service = Service::new(FakeTools {
        timed_out: true,
        ..Default::default()
    });
    let mut data = pipeline_data();
    data["rules_format"] = json!("csv");
    data["partial_retro"] = json!("True");
    let rules = format!("{HEADER}\nR2,r,1.1.1.1,1,2,1,L,1,1,both,1\n");
    let response = service
        .send(multipart(
            "/retropath2",
            data,
            &[("rules_file", rules.as_bytes()), ("sink_file", SINK.as_bytes())],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(response.headers()["status_message"], "timeout-partial");
    assert_eq!(bytes(response).await, SCOPE.as_bytes());
}

#[tokio::test]
async fn enumeration_endpoint_archives_two_tables() {
    let service = Service::new(FakeTools::default());
    let response = service
        .send(multipart(
            "/rp2paths",
            json!({"timeout": 1}),
            &[("rp2_pathways", SCOPE.as_bytes())],
        ))
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    let entries = archive::unpack(&bytes(response).await).unwrap();
    assert_eq!(entries[0].0, "rp2paths_pathways");
    assert_eq!(entries[1].0, "rp2paths_compounds");
}

#[tokio::test]
async fn submitted_job_can_be_polled_and_fetched() {
    let service = Service::new(FakeTools::default());
    let response = service
        .send(multipart("/submitjob", pipeline_data(), &[("sink_file", SINK.as_bytes())]))
        .await;
    assert_eq!(response.status(), StatusCode::ACCEPTED);
    let id = json_body(response).await["data"]["job_id"]
        .as_str()
        .unwrap()
        .to_string();

    let response = service
        .send(
            Request::get(format!("/jobs/{id}/result?wait=true"))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(archive::unpack(&bytes(response).await).unwrap().len(), 3);

    let response = service
        .send(Request::get(format!("/jobs/{id}")).body(Body::empty()).unwrap())
        .await;
    let body = json_body(response).await;
    assert_eq!(body["status"], "finished");
    assert_eq!(body["data"]["id"], id.as_str());
}

#[tokio::test]
async fn unknown_job_is_not_found() {
    let service = Service::new(FakeTools::default());
    let response = service
        .send(Request::get("/jobs/missing").body(Body::empty()).unwrap())
        .await;
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
