use std::thread;

use anyhow::{Context, Result};
use crossbeam_channel::{Receiver, Sender, unbounded};
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::NormalizeError;
use super::normalize::{Decoded, decode, encode_jpeg};

#[derive(Debug, Clone)]
pub struct NormalizeRequest {
    pub bytes: Vec<u8>,
    pub max_dimension: u32,
    pub filename_hint: Option<String>,
    pub quality: f32,
}

struct Job {
    request: NormalizeRequest,
    cancel: CancellationToken,
    reply: oneshot::Sender<Result<Vec<u8>, NormalizeError>>,
}

/// Runs normalizations one at a time on a dedicated thread.
///
/// Dropping every handle closes the queue and lets the thread exit.
#[derive(Clone)]
pub struct NormalizeWorker {
    jobs: Sender<Job>,
}

impl NormalizeWorker {
    pub fn spawn() -> Result<Self> {
        let (jobs, queue) = unbounded::<Job>();
        thread::Builder::new()
            .name("normalize".into())
            .spawn(move || serve(queue))
            .context("failed to spawn normalize worker")?;
        Ok(Self { jobs })
    }

    /// Queues `request` and waits for it; resolves early with `Cancelled` once `cancel` fires.
    pub async fn normalize(
        &self,
        request: NormalizeRequest,
        cancel: CancellationToken,
    ) -> Result<Vec<u8>, NormalizeError> {
        if cancel.is_cancelled() {
            return Err(NormalizeError::Cancelled);
        }
        let (reply, result) = oneshot::channel();
        self.jobs
            .send(Job {
                request,
                cancel: cancel.clone(),
                reply,
            })
            .map_err(|_| NormalizeError::Decode("normalize worker is gone".into()))?;

        tokio::select! {
            _ = cancel.cancelled() => Err(NormalizeError::Cancelled),
            out = result => out.unwrap_or_else(|_| {
                Err(NormalizeError::Decode("normalize worker dropped the job".into()))
            }),
        }
    }
}

fn serve(queue: Receiver<Job>) {
    debug!("normalize worker started");
    for job in queue {
        let result = run_job(&job.request, &job.cancel);
        if job.reply.send(result).is_err() {
            debug!("normalize result discarded; caller went away");
        }
    }
    debug!("normalize worker stopped");
}

fn run_job(request: &NormalizeRequest, cancel: &CancellationToken) -> Result<Vec<u8>, NormalizeError> {
    if cancel.is_cancelled() {
        return Err(NormalizeError::Cancelled);
    }
    let decoded = decode(
        &request.bytes,
        request.max_dimension,
        request.filename_hint.as_deref(),
    );
    if cancel.is_cancelled() {
        return Err(NormalizeError::Cancelled);
    }
    match decoded {
        Ok(Decoded::PassThrough) => Ok(request.bytes.clone()),
        Ok(Decoded::Image(img)) => encode_jpeg(&img, request.quality),
        Err(err) => {
            warn!(error = %err, hint = ?request.filename_hint, "normalize failed");
            Err(err)
        }
    }
}
