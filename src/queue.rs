use core::fmt;
use std::collections::{HashMap, VecDeque};
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::engine::UploadedObject;
use crate::error::UploadError;
use crate::segmenter::{CancelHandle, Segmenter};
use crate::source::UploadSource;
use crate::transport::Transport;

/// Queue-assigned identifier of a [`Job`], unique for the lifetime of the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct JobId(pub u64);

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

type SuccessCallback = Box<dyn FnOnce(UploadedObject) + Send>;
type FailureCallback = Box<dyn FnOnce(UploadError) + Send>;
type AlwaysCallback = Box<dyn FnOnce() + Send>;
type ProgressCallback = Box<dyn FnMut(f64) + Send>;

/// A request to upload one file, with the callbacks that report its outcome.
pub struct Job {
    source: Box<dyn UploadSource>,
    extension: String,
    on_success: Option<SuccessCallback>,
    on_failure: Option<FailureCallback>,
    on_always: Option<AlwaysCallback>,
    on_progress: ProgressCallback,
}

impl Job {
    pub fn new(source: impl UploadSource + 'static, extension: impl Into<String>) -> Self {
        Self {
            source: Box::new(source),
            extension: extension.into(),
            on_success: None,
            on_failure: None,
            on_always: None,
            on_progress: Box::new(|_| {}),
        }
    }

    pub fn on_success(mut self, callback: impl FnOnce(UploadedObject) + Send + 'static) -> Self {
        self.on_success = Some(Box::new(callback));
        self
    }

    /// Also receives [`UploadError::Cancelled`] when the job is cancelled
    /// while running.
    pub fn on_failure(mut self, callback: impl FnOnce(UploadError) + Send + 'static) -> Self {
        self.on_failure = Some(Box::new(callback));
        self
    }

    /// Runs once after the success or failure callback.
    pub fn on_always(mut self, callback: impl FnOnce() + Send + 'static) -> Self {
        self.on_always = Some(Box::new(callback));
        self
    }

    pub fn on_progress(mut self, callback: impl FnMut(f64) + Send + 'static) -> Self {
        self.on_progress = Box::new(callback);
        self
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("extension", &self.extension)
            .field("len", &self.source.len())
            .finish_non_exhaustive()
    }
}

/// Who currently owns the segmenter.
enum RunState<T> {
    Idle(Segmenter<T>),
    Running,
}

struct QueueState<T> {
    next_id: u64,
    fifo: VecDeque<JobId>,
    jobs: HashMap<JobId, Job>,
    active: Option<JobId>,
    run: RunState<T>,
}

impl<T> QueueState<T> {
    fn pop_next(&mut self) -> Option<(JobId, Job)> {
        while let Some(id) = self.fifo.pop_front() {
            if let Some(job) = self.jobs.remove(&id) {
                return Some((id, job));
            }
        }
        None
    }
}

struct Shared<T> {
    state: Mutex<QueueState<T>>,
    cancel: CancelHandle,
    idle: watch::Sender<bool>,
}

impl<T> Shared<T> {
    fn lock(&self) -> MutexGuard<'_, QueueState<T>> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Uploads queued files one after another through a single [`Segmenter`].
///
/// Jobs run in the order they were added. The first job added to an idle
/// queue spawns a worker task onto the current tokio runtime, which drains
/// the queue and goes idle again once it is empty.
///
/// A panic in one of a job's callbacks is logged and otherwise ignored. After
/// a panicking progress callback the job keeps uploading, but gets no more
/// progress reports.
pub struct UploadQueue<T> {
    shared: Arc<Shared<T>>,
}

impl<T> Clone for UploadQueue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T: Transport + 'static> UploadQueue<T> {
    pub fn new(segmenter: Segmenter<T>) -> Self {
        let cancel = segmenter.cancel_handle();
        let (idle, _) = watch::channel(true);

        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(QueueState {
                    next_id: 0,
                    fifo: VecDeque::new(),
                    jobs: HashMap::new(),
                    active: None,
                    run: RunState::Idle(segmenter),
                }),
                cancel,
                idle,
            }),
        }
    }

    /// Queues `job` and returns right away.
    ///
    /// Has to be called from within a tokio runtime.
    pub fn add_job(&self, job: Job) -> JobId {
        let (id, worker) = {
            let mut state = self.shared.lock();
            state.next_id += 1;
            let id = JobId(state.next_id);

            debug!(job_id = %id, extension = job.extension(), "job queued");
            state.fifo.push_back(id);
            state.jobs.insert(id, job);

            let worker = match mem::replace(&mut state.run, RunState::Running) {
                RunState::Idle(segmenter) => {
                    self.shared.idle.send_replace(false);
                    Some(segmenter)
                }
                RunState::Running => None,
            };
            (id, worker)
        };

        if let Some(segmenter) = worker {
            tokio::spawn(run(Arc::clone(&self.shared), segmenter));
        }
        id
    }

    /// Cancels a job.
    ///
    /// A queued job is dropped without any of its callbacks being called. The
    /// running job is cancelled through its segmenter, and this only returns
    /// once its stream has been torn down.
    ///
    /// Fails with [`UploadError::NotUploading`] if the running job is still
    /// opening its stream or already finishing it.
    pub async fn cancel_job(&self, id: JobId) -> Result<(), UploadError> {
        let stopped = {
            let mut state = self.shared.lock();
            if state.active != Some(id) {
                return match state.jobs.remove(&id) {
                    Some(_) => {
                        state.fifo.retain(|queued| *queued != id);
                        info!(job_id = %id, "queued job cancelled");
                        Ok(())
                    }
                    None => Err(UploadError::JobNotFound(id)),
                };
            }
            // requested under the lock, so the worker cannot move on to the next job first
            self.shared.cancel.request_cancel()?
        };

        info!(job_id = %id, "cancelling running job");
        stopped.wait().await;
        Ok(())
    }

    /// Number of jobs waiting to run, not counting the active one.
    pub fn len(&self) -> usize {
        self.shared.lock().jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_job(&self) -> Option<JobId> {
        self.shared.lock().active
    }

    /// Resolves once no job is running and none is waiting.
    pub async fn wait_idle(&self) {
        let mut idle = self.shared.idle.subscribe();
        // the sender lives as long as `self`
        let _ = idle.wait_for(|idle| *idle).await;
    }
}

async fn run<T: Transport>(shared: Arc<Shared<T>>, mut segmenter: Segmenter<T>) {
    loop {
        let (id, job) = {
            let mut state = shared.lock();
            let Some((id, job)) = state.pop_next() else {
                state.active = None;
                state.run = RunState::Idle(segmenter);
                shared.idle.send_replace(true);
                debug!("upload queue drained");
                return;
            };
            state.active = Some(id);
            (id, job)
        };

        run_job(&mut segmenter, id, job).await;
        shared.lock().active = None;
    }
}

async fn run_job<T: Transport>(segmenter: &mut Segmenter<T>, id: JobId, job: Job) {
    let Job {
        source,
        extension,
        on_success,
        on_failure,
        on_always,
        mut on_progress,
    } = job;
    info!(job_id = %id, extension = %extension, bytes = source.len(), "job started");

    let mut progress_panicked = false;
    let mut report_progress = |fraction: f64| {
        if !progress_panicked {
            progress_panicked = !guarded(id, "progress", || on_progress(fraction));
        }
    };

    match upload(segmenter, source.as_ref(), &extension, &mut report_progress).await {
        Ok(object) => {
            info!(job_id = %id, object_id = %object.object_id, "job succeeded");
            if let Some(on_success) = on_success {
                guarded(id, "success", || on_success(object));
            }
        }
        Err(error) => {
            if error.is_cancelled() {
                info!(job_id = %id, "job cancelled");
            } else {
                warn!(job_id = %id, %error, "job failed");
            }
            if let Some(on_failure) = on_failure {
                guarded(id, "failure", || on_failure(error));
            }
        }
    }

    if let Some(on_always) = on_always {
        guarded(id, "always", on_always);
    }
}

/// Runs a user callback, keeping a panic inside it from taking down the
/// worker. Returns whether the callback completed.
fn guarded(id: JobId, callback_name: &str, callback: impl FnOnce()) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(callback)) {
        Ok(()) => true,
        Err(_) => {
            error!(job_id = %id, callback = callback_name, "job callback panicked");
            false
        }
    }
}

async fn upload<T: Transport>(
    segmenter: &mut Segmenter<T>,
    source: &dyn UploadSource,
    extension: &str,
    on_progress: &mut (dyn FnMut(f64) + Send),
) -> Result<UploadedObject, UploadError> {
    segmenter.engine_mut().begin(extension).await?;

    if let Err(error) = segmenter.upload_file(source, on_progress).await {
        // a cancelled upload already destroyed its stream
        if segmenter.engine().is_open() {
            if let Err(destroy_error) = segmenter.engine_mut().destroy().await {
                warn!(error = %destroy_error, "failed to remove stream of failed upload");
            }
        }
        return Err(error);
    }

    segmenter.engine_mut().finish().await
}
