//! Background job loops

use chronodb_core::{Engine, Job, JobStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

const APPLY_IDLE: Duration = Duration::from_millis(20);
const PURGE_IDLE: Duration = Duration::from_secs(1);
const CHECK_IDLE: Duration = Duration::from_secs(5);

/// Running job loops
pub struct Workers {
    shutdown: watch::Sender<bool>,
    handles: Vec<JoinHandle<()>>,
}

impl Workers {
    /// Signal every loop to stop and wait for it
    pub async fn shutdown(self) {
        let _ = self.shutdown.send(true);
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!("Worker task failed: {}", e);
            }
        }
        info!("Workers stopped");
    }
}

/// Spawn `apply_workers` apply loops plus one purge and one check loop
pub fn spawn(engine: Arc<Engine>, apply_workers: usize) -> Workers {
    let (shutdown, rx) = watch::channel(false);
    let mut handles = Vec::with_capacity(apply_workers + 2);

    for _ in 0..apply_workers {
        handles.push(tokio::spawn(run(
            Arc::new(engine.apply_job()),
            APPLY_IDLE,
            rx.clone(),
        )));
    }
    handles.push(tokio::spawn(run(
        Arc::new(engine.purge_job()),
        PURGE_IDLE,
        rx.clone(),
    )));
    handles.push(tokio::spawn(run(Arc::new(engine.check_job()), CHECK_IDLE, rx)));

    info!("Started {} apply workers", apply_workers);
    Workers { shutdown, handles }
}

/// Step a job on the blocking pool until shutdown, backing off while idle
async fn run<J: Job + 'static>(job: Arc<J>, idle: Duration, mut shutdown: watch::Receiver<bool>) {
    debug!("Job {} started", job.name());
    loop {
        if *shutdown.borrow() {
            break;
        }
        let step = job.clone();
        let status = match tokio::task::spawn_blocking(move || step.try_run_once()).await {
            Ok(status) => status,
            Err(e) => {
                error!("Job {} step panicked: {}", job.name(), e);
                JobStatus::NoWork
            }
        };
        if status == JobStatus::DidWork {
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(idle) => {}
            _ = shutdown.changed() => break,
        }
    }
    debug!("Job {} stopped", job.name());
}
