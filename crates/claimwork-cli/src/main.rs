//! Local demo: runs a worker group against the in-memory queue.
//!
//! - `RUST_LOG` controls log output (default `info`)
//! - `CLAIMWORK_CONFIG` optionally points at a JSON `WorkerConfig`

use std::error::Error;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use claimwork_core::domain::{Artifact, ExceptionReason, RunId, Task, TaskId, TaskRef, WorkerInfo};
use claimwork_core::impls::{InMemoryQueueClient, ScriptedTransport};
use claimwork_core::ports::{ExecutionError, ExecutionReport, TaskExecutor};
use claimwork_core::trust::{SignatureStatement, TrustedKeySet};
use claimwork_core::{WorkerConfig, WorkerContextBuilder, WorkerGroup, Worker};

const TRUSTED_KEYS: &str = r#"{
    "scriptworker@example.com": {
        "fingerprint": "FB7765CD0FC616FF7AC961A1D9DC50F64C7D44CF",
        "keyid": "4C7D44CF"
    }
}"#;

#[derive(Debug, Deserialize)]
struct HelloPayload {
    name: String,
    #[serde(default)]
    exit_code: i32,
}

/// Writes `public/hello.txt` and signs it as the demo signer.
struct HelloExecutor;

#[async_trait]
impl TaskExecutor for HelloExecutor {
    async fn execute(
        &self,
        task: &Task,
        _cancel: CancellationToken,
    ) -> Result<ExecutionReport, ExecutionError> {
        let payload: HelloPayload = serde_json::from_value(task.payload["payload"].clone())
            .map_err(|e| ExecutionError::new(ExceptionReason::MalformedPayload, format!("json decode: {e}")))?;

        let artifact = Artifact::new(
            "public/hello.txt",
            "text/plain",
            format!("Hello, {}!\n", payload.name),
        );
        let statement = SignatureStatement::new(
            "scriptworker@example.com",
            "FB7765CD0FC616FF7AC961A1D9DC50F64C7D44CF",
            "4C7D44CF",
            &artifact.digest(),
        );
        let artifact = artifact.with_signature(statement.to_bytes());

        Ok(ExecutionReport::new(payload.exit_code).with_artifact(artifact))
    }
}

fn load_config() -> Result<WorkerConfig, Box<dyn Error>> {
    match std::env::var("CLAIMWORK_CONFIG") {
        Ok(path) => {
            let json = std::fs::read_to_string(&path)?;
            Ok(WorkerConfig::from_json_str(&json)?)
        }
        Err(_) => Ok(WorkerConfig {
            worker_count: 2,
            poll_interval_ms: 200,
            ..WorkerConfig::default()
        }),
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let config = load_config()?;

    // (A) キューにタスクを投入
    let queue = Arc::new(InMemoryQueueClient::new());
    let payloads = [
        serde_json::json!({"name": "weaver"}),
        serde_json::json!({"name": "claimwork", "exit_code": 1}),
        serde_json::json!({"nom": "typo"}),
    ];
    let seeded = payloads.len();
    for (i, payload) in payloads.into_iter().enumerate() {
        queue.add_pending_with(TaskRef::new(TaskId::new(format!("demo-{i}")), RunId::new(0)), payload);
    }

    // (B) worker を組み立てる
    let ctx = WorkerContextBuilder::new(
        queue.clone(),
        WorkerInfo::generated("demo-provisioner", "demo-worker-type", "local"),
    )
    .transport(Arc::new(ScriptedTransport::new()))
    .trusted_keys(Arc::new(TrustedKeySet::from_json_str(TRUSTED_KEYS)?))
    .config(config)
    .build()?;
    info!(worker_id = %ctx.worker().worker_id, "worker context ready");

    // (C) 全タスクが終わるまで待って停止
    let mut group = WorkerGroup::spawn(Arc::new(Worker::new(ctx, Arc::new(HelloExecutor))));
    let mut summaries = Vec::with_capacity(seeded);
    while summaries.len() < seeded {
        match group.next_summary().await {
            Some(summary) => summaries.push(summary),
            None => break,
        }
    }
    summaries.extend(group.shutdown_and_join().await);

    for summary in &summaries {
        println!("{}", serde_json::to_string_pretty(summary)?);
    }
    Ok(())
}
