//! Job Engine (§4.8) — in-memory job bookkeeping plus a fixed worker
//! pool that drains a bounded FIFO queue into the pipeline orchestrator.
//!
//! Grounded on the teacher's `job_store.rs` for the `Arc<RwLock<HashMap<..>>>`
//! handle shape and copy-out accessors; the queue/worker-pool wiring
//! follows the teacher's `tokio::sync::mpsc` usage in its batch
//! processing paths.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::JobConfig;
use crate::error::{CoreError, CoreResult, Kind};
use crate::model::{Job, JobStatus, VideoConfig};
use crate::orchestrator::Orchestrator;
use crate::subtitles;

/// Fixed worker pool draining a bounded FIFO queue of job ids into the
/// pipeline orchestrator.
pub struct JobEngine {
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    sender: mpsc::Sender<String>,
}

impl JobEngine {
    /// Spawns `config.workers` worker tasks and returns a handle. The
    /// queue is bounded at `config.queue_size`; once every worker and
    /// the handle itself drop their `Sender`, in-flight jobs drain and
    /// the workers exit. `config.workers` tasks poll the queue, but a
    /// shared semaphore of `config.max_concurrent` permits bounds how
    /// many pipelines actually run at once — the two knobs are distinct
    /// so a deployment can oversubscribe listeners while still capping
    /// concurrent ffmpeg/ffprobe/daemon subprocess usage (§5).
    pub fn spawn(config: JobConfig, orchestrator: Arc<Orchestrator>) -> Self {
        let jobs: Arc<RwLock<HashMap<String, Job>>> = Arc::new(RwLock::new(HashMap::new()));
        let (sender, receiver) = mpsc::channel(config.queue_size);
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        let concurrency = Arc::new(Semaphore::new(config.max_concurrent.max(1)));

        let per_job_timeout = config.process_timeout;
        for worker_id in 0..config.workers {
            let jobs = jobs.clone();
            let receiver = receiver.clone();
            let orchestrator = orchestrator.clone();
            let concurrency = concurrency.clone();
            tokio::spawn(async move {
                worker_loop(worker_id, jobs, receiver, orchestrator, per_job_timeout, concurrency).await;
            });
        }

        Self { jobs, sender }
    }

    /// Validates `config` structurally, assigns a fresh id, stores the
    /// job `Pending`, and enqueues it. On queue back-pressure the job
    /// is removed from the map again and `Internal("queue full")` is
    /// returned; no retry is attempted.
    pub async fn create_job(&self, config: VideoConfig) -> CoreResult<Job> {
        validate_structure(&config)?;
        subtitles::validate_all(config.projects().iter().flat_map(|p| p.scenes.iter()))?;

        let id = Uuid::new_v4().to_string();
        let job = Job::new(id.clone(), config);

        self.jobs.write().await.insert(id.clone(), job.clone());

        if let Err(e) = self.sender.try_send(id.clone()) {
            self.jobs.write().await.remove(&id);
            warn!(job_id = %id, "job queue is full, rejecting new job");
            return Err(match e {
                mpsc::error::TrySendError::Full(_) => CoreError::internal("queue full"),
                mpsc::error::TrySendError::Closed(_) => CoreError::internal("job queue is closed"),
            });
        }

        Ok(job)
    }

    pub async fn get_job(&self, id: &str) -> CoreResult<Job> {
        self.jobs
            .read()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| CoreError::job_not_found(id))
    }

    pub async fn list_jobs(&self) -> Vec<Job> {
        self.jobs.read().await.values().cloned().collect()
    }

    /// Cancels a `Pending` or `Processing` job. Terminal jobs reject
    /// cancellation with `InvalidInput`.
    pub async fn cancel_job(&self, id: &str) -> CoreResult<Job> {
        let mut jobs = self.jobs.write().await;
        let job = jobs.get_mut(id).ok_or_else(|| CoreError::job_not_found(id))?;
        if job.status.is_terminal() {
            return Err(CoreError::invalid_input(format!(
                "job {id} is already in a terminal state"
            )));
        }
        job.status = JobStatus::Cancelled;
        job.updated_at = chrono::Utc::now();
        job.completed_at = Some(job.updated_at);
        Ok(job.clone())
    }
}

fn validate_structure(config: &VideoConfig) -> CoreResult<()> {
    if config.projects().is_empty() {
        return Err(CoreError::invalid_input("a video config must contain at least one project"));
    }
    for project in config.projects() {
        if project.scenes.is_empty() {
            return Err(CoreError::invalid_input("a project must contain at least one scene"));
        }
        for scene in &project.scenes {
            if scene.elements.is_empty() {
                return Err(CoreError::invalid_input("a scene must contain at least one element"));
            }
            for element in &scene.elements {
                if element.requires_src() && element.src.is_none() {
                    return Err(CoreError::invalid_input(format!(
                        "element of type {:?} requires a src",
                        element.kind
                    )));
                }
            }
        }
    }
    Ok(())
}

async fn worker_loop(
    worker_id: usize,
    jobs: Arc<RwLock<HashMap<String, Job>>>,
    receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    orchestrator: Arc<Orchestrator>,
    per_job_timeout: Duration,
    concurrency: Arc<Semaphore>,
) {
    loop {
        let job_id = {
            let mut rx = receiver.lock().await;
            match rx.recv().await {
                Some(id) => id,
                None => break, // queue closed, drain complete
            }
        };

        let current_status = {
            let jobs = jobs.read().await;
            jobs.get(&job_id).map(|j| j.status)
        };
        match current_status {
            Some(JobStatus::Cancelled) => continue,
            None => continue, // removed (e.g. queue-full rollback raced us)
            _ => {}
        }

        update_status(&jobs, &job_id, JobStatus::Processing).await;

        let config = {
            let jobs = jobs.read().await;
            jobs.get(&job_id).map(|j| j.config.clone())
        };
        let Some(config) = config else { continue };

        let jobs_for_progress = jobs.clone();
        let job_id_for_progress = job_id.clone();
        let (progress_tx, mut progress_rx) = tokio::sync::mpsc::channel(16);
        let progress_task = tokio::spawn(async move {
            while let Some(pct) = progress_rx.recv().await {
                update_progress(&jobs_for_progress, &job_id_for_progress, pct).await;
            }
        });

        let orchestrator_clone = orchestrator.clone();
        let job_id_for_run = job_id.clone();
        let progress_tx_for_run = progress_tx.clone();
        drop(progress_tx);
        let concurrency = concurrency.clone();

        let run = tokio::spawn(async move {
            // Held across the whole pipeline run, not just the encode: a
            // permit bounds one job's full probe/transcribe/encode chain,
            // matching `max_concurrent`'s role as a pipeline-level cap.
            let _permit = concurrency
                .acquire_owned()
                .await
                .expect("concurrency semaphore is never closed");
            tokio::time::timeout(
                per_job_timeout,
                orchestrator_clone.run(&job_id_for_run, config, progress_tx_for_run),
            )
            .await
        });

        let outcome = run.await;
        let _ = progress_task.await;

        match outcome {
            Ok(Ok(Ok(video_id))) => {
                complete(&jobs, &job_id, video_id).await;
            }
            Ok(Ok(Err(err))) => {
                fail(&jobs, &job_id, &err).await;
            }
            Ok(Err(_elapsed)) => {
                fail(&jobs, &job_id, &CoreError::timeout("job exceeded its 30-minute deadline")).await;
            }
            Err(join_err) if join_err.is_panic() => {
                error!(worker_id, job_id = %job_id, "worker panicked while running a job");
                fail(&jobs, &job_id, &CoreError::internal("an internal error occurred")).await;
            }
            Err(_) => {
                fail(&jobs, &job_id, &CoreError::internal("job task was cancelled")).await;
            }
        }
    }
    info!(worker_id, "job worker shutting down, queue drained");
}

async fn update_status(jobs: &Arc<RwLock<HashMap<String, Job>>>, id: &str, status: JobStatus) {
    if let Some(job) = jobs.write().await.get_mut(id) {
        job.status = status;
        job.updated_at = chrono::Utc::now();
    }
}

async fn update_progress(jobs: &Arc<RwLock<HashMap<String, Job>>>, id: &str, pct: f32) {
    if let Some(job) = jobs.write().await.get_mut(id) {
        job.progress = job.progress.max(pct.clamp(0.0, 100.0));
        job.updated_at = chrono::Utc::now();
    }
}

async fn complete(jobs: &Arc<RwLock<HashMap<String, Job>>>, id: &str, video_id: String) {
    if let Some(job) = jobs.write().await.get_mut(id) {
        job.status = JobStatus::Completed;
        job.progress = 100.0;
        job.video_id = Some(video_id);
        job.updated_at = chrono::Utc::now();
        job.completed_at = Some(job.updated_at);
    }
}

async fn fail(jobs: &Arc<RwLock<HashMap<String, Job>>>, id: &str, err: &CoreError) {
    warn!(job_id = id, kind = ?err.kind, "job failed");
    if let Some(job) = jobs.write().await.get_mut(id) {
        job.status = JobStatus::Failed;
        job.error = Some(crate::error::sanitize_for_client(err));
        job.updated_at = chrono::Utc::now();
        job.completed_at = Some(job.updated_at);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Element, ElementType, Project, Scene};

    fn audio_only_config() -> VideoConfig {
        VideoConfig(vec![Project {
            scenes: vec![Scene {
                id: "s1".into(),
                elements: vec![Element {
                    kind: ElementType::Audio,
                    src: Some("https://cdn.test/a.mp3".into()),
                    x: None,
                    y: None,
                    z_index: None,
                    volume: None,
                    duration: None,
                    settings: None,
                }],
            }],
            elements: vec![],
            width: None,
            height: None,
            quality: None,
        }])
    }

    fn empty_orchestrator() -> Arc<Orchestrator> {
        Arc::new(Orchestrator::new_for_tests())
    }

    #[test]
    fn validate_structure_rejects_empty_project_list() {
        assert!(validate_structure(&VideoConfig(vec![])).is_err());
    }

    #[test]
    fn validate_structure_rejects_missing_src() {
        let mut config = audio_only_config();
        config.projects_mut()[0].scenes[0].elements[0].src = None;
        assert!(validate_structure(&config).is_err());
    }

    #[tokio::test]
    async fn create_job_rejects_structurally_invalid_config() {
        let engine = JobEngine::spawn(
            JobConfig { workers: 1, queue_size: 2, max_concurrent: 1, process_timeout: Duration::from_secs(1) },
            empty_orchestrator(),
        );
        let err = engine.create_job(VideoConfig(vec![])).await.unwrap_err();
        assert_eq!(err.kind, Kind::InvalidInput);
    }

    #[tokio::test]
    async fn full_queue_is_rejected_and_map_entry_is_rolled_back() {
        // Zero workers: nothing ever drains the queue, so it fills up.
        let engine = JobEngine::spawn(
            JobConfig { workers: 0, queue_size: 1, max_concurrent: 1, process_timeout: Duration::from_secs(1) },
            empty_orchestrator(),
        );
        let first = engine.create_job(audio_only_config()).await.unwrap();
        let second = engine.create_job(audio_only_config()).await;
        assert!(second.is_err());
        assert!(engine.get_job(&first.id).await.is_ok());
        // The rejected job never made it into the map.
        assert_eq!(engine.list_jobs().await.len(), 1);
    }

    #[tokio::test]
    async fn cancel_from_pending_succeeds_then_rejects_terminal() {
        let engine = JobEngine::spawn(
            JobConfig { workers: 0, queue_size: 4, max_concurrent: 1, process_timeout: Duration::from_secs(1) },
            empty_orchestrator(),
        );
        let job = engine.create_job(audio_only_config()).await.unwrap();
        let cancelled = engine.cancel_job(&job.id).await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(engine.cancel_job(&job.id).await.is_err());
    }

    #[tokio::test]
    async fn get_job_of_unknown_id_is_job_not_found() {
        let engine = JobEngine::spawn(
            JobConfig { workers: 0, queue_size: 4, max_concurrent: 1, process_timeout: Duration::from_secs(1) },
            empty_orchestrator(),
        );
        let err = engine.get_job("nonexistent").await.unwrap_err();
        assert_eq!(err.kind, Kind::JobNotFound);
    }
}
