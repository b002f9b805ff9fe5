//! Stand-in for the out-of-scope HTTP layer: loads a `VideoConfig` from
//! a JSON file given on the command line, submits it as a single job,
//! and polls until it reaches a terminal state.

use std::sync::Arc;
use std::time::Duration;

use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use videoforge_core::config::Config;
use videoforge_core::job::JobEngine;
use videoforge_core::model::{JobStatus, VideoConfig};
use videoforge_core::orchestrator::Orchestrator;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let subscriber = FmtSubscriber::builder().with_max_level(Level::INFO).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = Config::from_env()?;

    let path = std::env::args()
        .nth(1)
        .expect("usage: videoforge <path-to-video-config.json>");
    let raw = std::fs::read_to_string(&path)?;
    let video_config: VideoConfig = serde_json::from_str(&raw)?;

    let orchestrator = Arc::new(Orchestrator::new(&config));
    let engine = JobEngine::spawn(config.job.clone(), orchestrator);

    let job = engine.create_job(video_config).await?;
    info!(job_id = %job.id, "submitted job");

    loop {
        let current = engine.get_job(&job.id).await?;
        info!(job_id = %current.id, status = ?current.status, progress = current.progress, "job status");
        if current.status.is_terminal() {
            match current.status {
                JobStatus::Completed => {
                    info!(video_id = ?current.video_id, "job completed");
                }
                JobStatus::Failed => {
                    info!(error = ?current.error, "job failed");
                }
                _ => {}
            }
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    Ok(())
}
