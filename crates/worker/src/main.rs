//! `comfyq-worker` -- run one workflow on a ComfyUI server.
//!
//! Submits a workflow JSON file, waits for the job to finish, downloads
//! every output artifact and releases the job from the server.
//!
//! # Environment variables
//!
//! | Variable        | Required | Default     | Description                        |
//! |-----------------|----------|-------------|------------------------------------|
//! | `WORKFLOW_PATH` | yes*     | --          | Workflow file (or first argument)  |
//! | `OUTPUT_DIR`    | no       | `./outputs` | Where downloaded artifacts go      |
//!
//! Connection settings are read by `ComfyUIConfig::from_env` (`COMFYUI_URL`
//! and friends).

use std::path::{Path, PathBuf};

use anyhow::Context;
use comfyq_comfyui::events::JobEvent;
use comfyq_comfyui::{ComfyUIConfig, ComfyUIManager};
use comfyq_core::job::JobOutput;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfyq_worker=info,comfyq_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let workflow_path = std::env::args()
        .nth(1)
        .or_else(|| std::env::var("WORKFLOW_PATH").ok())
        .context("pass a workflow file as the first argument or set WORKFLOW_PATH")?;
    let output_dir =
        PathBuf::from(std::env::var("OUTPUT_DIR").unwrap_or_else(|_| "./outputs".into()));

    let workflow: serde_json::Value = serde_json::from_str(
        &tokio::fs::read_to_string(&workflow_path)
            .await
            .with_context(|| format!("failed to read {workflow_path}"))?,
    )
    .with_context(|| format!("{workflow_path} is not valid JSON"))?;

    let config = ComfyUIConfig::from_env()?;
    tracing::info!(api_url = %config.api_url, workflow = %workflow_path, "Starting comfyq-worker");

    let manager = ComfyUIManager::start(config)?;
    let result = run(&manager, &workflow, &output_dir).await;
    manager.shutdown().await;
    result
}

async fn run(
    manager: &ComfyUIManager,
    workflow: &serde_json::Value,
    output_dir: &Path,
) -> anyhow::Result<()> {
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            if let JobEvent::StatusChanged { prompt_id, to, .. } = event {
                tracing::info!(prompt_id = %prompt_id, status = %to, "Job status changed");
            }
        }
    });

    let job = manager.submit_workflow(workflow).await?;
    tracing::info!(
        prompt_id = job.prompt_id(),
        queue_number = job.queue_number(),
        "Waiting for job",
    );

    // The pass triggered by connecting may have read the queue before the
    // submission landed.
    manager.tracker().refresh().await?;

    let outputs = job.wait().await?;
    tracing::info!(prompt_id = job.prompt_id(), count = outputs.len(), "Job finished");

    if let Some(entry) = manager.history_entry(job.prompt_id()).await? {
        let messages = entry.status.as_ref().map_or(0, |status| status.messages.len());
        tracing::debug!(prompt_id = job.prompt_id(), messages, "Execution history");
    }

    tokio::fs::create_dir_all(output_dir)
        .await
        .with_context(|| format!("failed to create {}", output_dir.display()))?;
    for output in &outputs {
        download(manager, output, output_dir).await?;
    }

    job.release().await?;
    Ok(())
}

async fn download(
    manager: &ComfyUIManager,
    output: &JobOutput,
    output_dir: &Path,
) -> anyhow::Result<()> {
    let path = artifact_path(output_dir, output)?;
    let bytes = manager.view(output).await?;

    tokio::fs::write(&path, &bytes)
        .await
        .with_context(|| format!("failed to write {}", path.display()))?;
    tracing::info!(node = %output.node, path = %path.display(), bytes = bytes.len(), "Saved output");
    Ok(())
}

/// Where `output` is saved under `output_dir`.
///
/// Only the last component of the server's file name is used. Subfolders
/// are flattened into a prefix, so the result never leaves `output_dir`.
fn artifact_path(output_dir: &Path, output: &JobOutput) -> anyhow::Result<PathBuf> {
    let file_name = output
        .filename
        .rsplit(['/', '\\'])
        .next()
        .filter(|name| !name.is_empty() && *name != "." && *name != "..")
        .with_context(|| format!("refusing to save output named {:?}", output.filename))?;

    let subfolder: String = output
        .subfolder
        .split(['/', '\\'])
        .filter(|part| !part.is_empty() && *part != "." && *part != "..")
        .collect::<Vec<_>>()
        .join("_");

    let name = if subfolder.is_empty() {
        file_name.to_string()
    } else {
        format!("{subfolder}_{file_name}")
    };
    Ok(output_dir.join(name))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output(subfolder: &str, filename: &str) -> JobOutput {
        JobOutput {
            node: "9".into(),
            filename: filename.into(),
            subfolder: subfolder.into(),
            kind: "output".into(),
        }
    }

    #[test]
    fn plain_name_lands_in_output_dir() {
        let dir = Path::new("/tmp/out");
        let path = artifact_path(dir, &output("", "a.png")).unwrap();
        assert_eq!(path, dir.join("a.png"));
    }

    #[test]
    fn subfolder_is_flattened_into_prefix() {
        let dir = Path::new("/tmp/out");
        let path = artifact_path(dir, &output("batch/2", "a.png")).unwrap();
        assert_eq!(path, dir.join("batch_2_a.png"));

        let path = artifact_path(dir, &output("../../etc", "a.png")).unwrap();
        assert_eq!(path, dir.join("etc_a.png"));
    }

    #[test]
    fn traversal_in_file_name_stays_inside_output_dir() {
        let dir = Path::new("/tmp/out");
        for name in ["../../escape.png", "/etc/passwd", "..\\evil.png", "sub/ok.png"] {
            let path = artifact_path(dir, &output("", name)).unwrap();
            assert_eq!(path.parent(), Some(dir), "{name} escaped to {}", path.display());
        }
        assert_eq!(
            artifact_path(dir, &output("", "/etc/passwd")).unwrap(),
            dir.join("passwd")
        );
    }

    #[test]
    fn unusable_file_names_are_rejected() {
        let dir = Path::new("/tmp/out");
        for name in ["", "..", ".", "dir/", "a/.."] {
            assert!(artifact_path(dir, &output("", name)).is_err(), "{name:?} accepted");
        }
    }
}
