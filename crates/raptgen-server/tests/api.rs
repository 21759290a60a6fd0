//! HTTP surface tests: requests go through the full router with an
//! in-process trainer standing in for the external worker.

use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use raptgen_core::{GateConfig, Result};
use raptgen_runtime::{
    EmFitter, EpochSchedule, Orchestrator, Trainer, TrainerFactory, TrainingUnit,
};
use raptgen_server::{build_router, AppState};
use raptgen_store::{LatentPoint, SqliteStore, StepMetrics};
use serde_json::{json, Value};
use tower::ServiceExt;

/// Loss falls by one per epoch; sequences are embedded on a spread grid.
struct LinearTrainer {
    epoch: u32,
    sequences: u32,
}

impl Trainer for LinearTrainer {
    fn train_epoch(&mut self, schedule: &EpochSchedule) -> Result<StepMetrics> {
        self.epoch = schedule.epoch + 1;
        let loss = 10.0 - schedule.epoch as f64;
        Ok(StepMetrics {
            train_loss: loss + 0.5,
            test_loss: loss,
            test_recon: loss - 1.0,
            test_kld: 1.0,
        })
    }

    fn save_checkpoint(&mut self) -> Result<Vec<u8>> {
        Ok(self.epoch.to_le_bytes().to_vec())
    }

    fn load_checkpoint(&mut self, bytes: &[u8]) -> Result<()> {
        let mut buf = [0u8; 4];
        buf.copy_from_slice(&bytes[..4]);
        self.epoch = u32::from_le_bytes(buf);
        Ok(())
    }

    fn embed(&mut self) -> Result<Vec<LatentPoint>> {
        Ok((0..self.sequences)
            .map(|i| LatentPoint {
                seq_id: i,
                coord_x: (i % 2) as f64 * 10.0 + i as f64 * 0.1,
                coord_y: (i % 3) as f64 * 0.3,
            })
            .collect())
    }
}

struct LinearFactory;

impl TrainerFactory for LinearFactory {
    fn create(&self, unit: &TrainingUnit<'_>) -> Result<Box<dyn Trainer>> {
        Ok(Box::new(LinearTrainer {
            epoch: 0,
            sequences: unit.sequences.len() as u32,
        }))
    }
}

fn app() -> (Router, tempfile::TempDir) {
    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(SqliteStore::open(dir.path()).unwrap());
    let orchestrator = Orchestrator::new(
        store,
        GateConfig {
            default_capacity: 2,
            overrides: Default::default(),
        },
        Duration::from_secs(10),
        Arc::new(LinearFactory),
        Arc::new(EmFitter::with_seed(11)),
    );
    (build_router(Arc::new(AppState::new(orchestrator))), dir)
}

async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

async fn wait_for_status(app: &Router, uri: &str, status: &str) -> Value {
    for _ in 0..500 {
        let (code, body) = call(app, "GET", uri, None).await;
        assert_eq!(code, StatusCode::OK);
        if body["status"] == status {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("{} never reached {}", uri, status);
}

fn training_request(name: &str, reiteration: u32) -> Value {
    json!({
        "type": "RaptGen",
        "name": name,
        "params_training": {
            "model_length": 10,
            "epochs": 4,
            "match_forcing_duration": 2,
            "beta_duration": 2,
            "early_stopping": 3,
            "seed_value": 0,
            "match_cost": 4,
            "device": "CPU",
        },
        "params_preprocessing": {"forward": "GGGAGG", "reverse": "CCTCCC"},
        "random_regions": ["ACGUAC", "GGCAUA", "UUAGCC", "CAGGUA", "AUCGGA", "GGGCCC"],
        "duplicates": [3, 1, 1, 2, 1, 5],
        "reiteration": reiteration,
    })
}

#[tokio::test]
async fn test_device_list_includes_cpu() {
    let (app, _dir) = app();
    let (status, body) = call(&app, "GET", "/api/train/device/process", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body.as_array().unwrap().iter().any(|d| d == "CPU"));
}

#[tokio::test]
async fn test_training_job_lifecycle() {
    let (app, _dir) = app();
    let (status, body) = call(&app, "POST", "/api/train/jobs/submit", Some(training_request("run-a", 2))).await;
    assert_eq!(status, StatusCode::OK);
    let uuid = body["uuid"].as_str().unwrap().to_string();
    let item = format!("/api/train/jobs/items/{}", uuid);

    let job = wait_for_status(&app, &item, "success").await;
    assert_eq!(job["name"], "run-a");
    assert_eq!(job["summary"].as_array().unwrap().len(), 2);
    assert_eq!(job["summary"][0]["steps_completed"], 4);

    let (status, unit) = call(&app, "GET", &format!("{}/1", item), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(unit["losses"].as_array().unwrap().len(), 4);
    assert_eq!(unit["latent"].as_array().unwrap().len(), 6);
    assert_eq!(unit["best_metric"], 7.0);

    let (status, _) = call(&app, "GET", &format!("{}/7", item), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Finished jobs can neither be suspended nor resumed
    let (status, body) = call(&app, "POST", "/api/train/jobs/suspend", Some(json!({"uuid": uuid}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["detail"].as_str().unwrap().contains("in progress"));
    let (status, _) = call(&app, "POST", "/api/train/jobs/resume", Some(json!({"uuid": uuid}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, renamed) = call(&app, "PATCH", &item, Some(json!({"target": "name", "value": "run-b"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["name"], "run-b");
    let (status, _) = call(&app, "PATCH", &item, Some(json!({"target": "status", "value": "x"}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, found) = call(
        &app,
        "POST",
        "/api/train/jobs/search",
        Some(json!({"search_regex": "^run-b$", "status": ["success"], "is_multiple": true})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found.as_array().unwrap().len(), 1);
    assert_eq!(found[0]["id"], uuid.as_str());

    let (status, _) = call(&app, "DELETE", &item, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, body) = call(&app, "GET", &item, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["detail"].is_string());
}

#[tokio::test]
async fn test_rejected_requests() {
    let (app, _dir) = app();

    let (status, _) = call(&app, "POST", "/api/train/jobs/submit", Some(training_request("none", 0))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(
        &app,
        "POST",
        "/api/train/jobs/search",
        Some(json!({"search_regex": "[unclosed"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(&app, "POST", "/api/train/jobs/suspend", Some(json!({"uuid": "missing"}))).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = call(
        &app,
        "POST",
        "/api/gmm/jobs/submit",
        Some(json!({
            "target": "missing",
            "name": "sweep",
            "params": {
                "minimum_n_components": 1,
                "maximum_n_components": 2,
                "step_size": 1,
                "n_trials_per_component": 1,
            },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_sweep_over_trained_unit() {
    let (app, _dir) = app();
    let (_, body) = call(&app, "POST", "/api/train/jobs/submit", Some(training_request("base", 1))).await;
    let uuid = body["uuid"].as_str().unwrap().to_string();
    wait_for_status(&app, &format!("/api/train/jobs/items/{}", uuid), "success").await;
    let (_, unit) = call(&app, "GET", &format!("/api/train/jobs/items/{}/0", uuid), None).await;
    let target = unit["uuid"].as_str().unwrap().to_string();

    let (status, body) = call(
        &app,
        "POST",
        "/api/gmm/jobs/submit",
        Some(json!({
            "target": target,
            "name": "bic-scan",
            "params": {
                "minimum_n_components": 1,
                "maximum_n_components": 2,
                "step_size": 1,
                "n_trials_per_component": 2,
            },
        })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let sweep = body["uuid"].as_str().unwrap().to_string();
    let item = format!("/api/gmm/jobs/items/{}", sweep);

    let detail = wait_for_status(&app, &item, "success").await;
    assert_eq!(detail["bic_scores"].as_array().unwrap().len(), 4);
    assert!(detail.get("current").is_none());

    let (status, two) = call(&app, "GET", &format!("{}?n_components=2", item), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(two["selected"]["n_components"], 2);
    assert_eq!(two["selected"]["trials_completed"], 2);

    let (status, _) = call(&app, "GET", &format!("{}?n_components=5", item), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, found) = call(&app, "POST", "/api/gmm/jobs/search", Some(json!({"search_regex": "scan"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(found.as_array().unwrap().len(), 1);

    let (status, _) = call(&app, "POST", "/api/gmm/jobs/suspend", Some(json!({"uuid": sweep}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = call(&app, "DELETE", &item, None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, _) = call(&app, "GET", &item, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
