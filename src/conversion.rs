//! Process-isolated source-format normalization pool.
//!
//! Each job is handed to a freshly spawned child process rather than run
//! in-thread: typical decoder libraries maintain internal thread pools that
//! would otherwise conflict with the provider workers running in this
//! process. The pool itself is a fixed set of supervisor threads, each
//! shaped like the background-preloader worker elsewhere in this crate —
//! spawn, poll to completion, report — but supervising a child process
//! instead of doing the work in-thread.

use std::collections::VecDeque;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// A single normalization request.
#[derive(Debug, Clone)]
pub enum Job {
    ConvertImage {
        input: PathBuf,
        output: PathBuf,
        rotation: i32,
        invert: bool,
        mono: bool,
    },
    ConvertDocument {
        input: PathBuf,
        output: PathBuf,
        dpi: u32,
    },
}

impl Job {
    pub fn output_path(&self) -> &Path {
        match self {
            Job::ConvertImage { output, .. } => output,
            Job::ConvertDocument { output, .. } => output,
        }
    }

    fn command(&self) -> Command {
        match self {
            Job::ConvertImage {
                input,
                output,
                rotation,
                invert,
                mono,
            } => {
                let mut cmd = Command::new("tile-pyramid-convert-image");
                cmd.arg(input).arg(output).arg("--rotation").arg(rotation.to_string());
                if *invert {
                    cmd.arg("--invert");
                }
                if *mono {
                    cmd.arg("--mono");
                }
                cmd
            }
            Job::ConvertDocument { input, output, dpi } => {
                let mut cmd = Command::new("tile-pyramid-convert-document");
                cmd.arg(input).arg(output).arg("--dpi").arg(dpi.to_string());
                cmd
            }
        }
    }
}

/// Terminal or in-flight state of a submitted job.
#[derive(Debug, Clone, PartialEq)]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed(String),
}

struct JobSlot {
    status: Mutex<JobStatus>,
    changed: Condvar,
    /// Progress in `[0,1]`, bit-packed into an atomic for lock-free reads.
    progress_bits: AtomicU32,
}

impl JobSlot {
    fn new() -> Self {
        Self {
            status: Mutex::new(JobStatus::Queued),
            changed: Condvar::new(),
            progress_bits: AtomicU32::new(0.0f32.to_bits()),
        }
    }

    fn set_status(&self, status: JobStatus) {
        *self.status.lock().unwrap() = status;
        self.changed.notify_all();
    }

    fn set_progress(&self, value: f32) {
        self.progress_bits.store(value.clamp(0.0, 1.0).to_bits(), Ordering::Release);
    }
}

/// A handle to a submitted job, observable from any thread.
#[derive(Clone)]
pub struct Handle {
    slot: Arc<JobSlot>,
}

impl Handle {
    pub fn progress(&self) -> f32 {
        f32::from_bits(self.slot.progress_bits.load(Ordering::Acquire))
    }

    pub fn poll(&self) -> JobStatus {
        self.slot.status.lock().unwrap().clone()
    }

    /// Block until the job reaches a terminal state or `timeout` elapses.
    pub fn wait(&self, timeout: Duration) -> JobStatus {
        let mut status = self.slot.status.lock().unwrap();
        let deadline = std::time::Instant::now() + timeout;
        while !matches!(*status, JobStatus::Done | JobStatus::Failed(_)) {
            let remaining = deadline.saturating_duration_since(std::time::Instant::now());
            if remaining.is_zero() {
                break;
            }
            let (guard, timed_out) = self.slot.changed.wait_timeout(status, remaining).unwrap();
            status = guard;
            if timed_out.timed_out() {
                break;
            }
        }
        status.clone()
    }
}

struct QueueEntry {
    job: Job,
    slot: Arc<JobSlot>,
}

/// Bounded pool of worker threads, each supervising one spawned child process
/// at a time. Pool size defaults to `min(cpu_count, 4)`.
pub struct ConversionRunner {
    queue: Arc<Mutex<VecDeque<QueueEntry>>>,
    queue_signal: Arc<Condvar>,
    shutting_down: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
}

impl ConversionRunner {
    pub fn new(pool_size: usize) -> Self {
        let pool_size = pool_size.max(1);
        let queue = Arc::new(Mutex::new(VecDeque::new()));
        let queue_signal = Arc::new(Condvar::new());
        let shutting_down = Arc::new(AtomicBool::new(false));

        let workers = (0..pool_size)
            .map(|idx| {
                let queue = Arc::clone(&queue);
                let queue_signal = Arc::clone(&queue_signal);
                let shutting_down = Arc::clone(&shutting_down);
                std::thread::Builder::new()
                    .name(format!("conversion-worker-{idx}"))
                    .spawn(move || worker_loop(queue, queue_signal, shutting_down))
                    .expect("failed to spawn conversion worker")
            })
            .collect();

        Self {
            queue,
            queue_signal,
            shutting_down,
            workers,
        }
    }

    pub fn submit(&self, job: Job) -> Handle {
        let slot = Arc::new(JobSlot::new());
        let handle = Handle { slot: Arc::clone(&slot) };
        self.queue.lock().unwrap().push_back(QueueEntry { job, slot });
        self.queue_signal.notify_one();
        handle
    }

    pub fn pending(&self) -> usize {
        self.queue.lock().unwrap().len()
    }
}

impl Drop for ConversionRunner {
    fn drop(&mut self) {
        self.shutting_down.store(true, Ordering::Release);
        self.queue_signal.notify_all();
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

fn worker_loop(
    queue: Arc<Mutex<VecDeque<QueueEntry>>>,
    queue_signal: Arc<Condvar>,
    shutting_down: Arc<AtomicBool>,
) {
    loop {
        let entry = {
            let mut guard = queue.lock().unwrap();
            loop {
                if let Some(entry) = guard.pop_front() {
                    break Some(entry);
                }
                if shutting_down.load(Ordering::Acquire) {
                    break None;
                }
                guard = queue_signal.wait(guard).unwrap();
            }
        };

        let Some(entry) = entry else { return };
        run_job(&entry.job, &entry.slot);
    }
}

fn run_job(job: &Job, slot: &JobSlot) {
    slot.set_status(JobStatus::Running);

    let mut cmd = job.command();
    cmd.stdout(Stdio::piped()).stderr(Stdio::piped());

    let mut child = match cmd.spawn() {
        Ok(child) => child,
        Err(e) => {
            log::warn!("failed to spawn converter for {:?}: {e}", job.output_path());
            slot.set_status(JobStatus::Failed(format!("failed to spawn converter: {e}")));
            return;
        }
    };

    // Progress is reported on stdout as one float-per-line in [0,1]; a
    // malformed or absent progress stream simply leaves progress at 0 until
    // the process exits.
    if let Some(stdout) = child.stdout.take() {
        let progress_bits = &slot.progress_bits;
        for line in BufReader::new(stdout).lines().map_while(Result::ok) {
            if let Ok(value) = line.trim().parse::<f32>() {
                progress_bits.store(value.clamp(0.0, 1.0).to_bits(), Ordering::Release);
            }
        }
    }

    let outcome = child.wait();
    match outcome {
        Ok(status) if status.success() => {
            slot.set_progress(1.0);
            slot.set_status(JobStatus::Done);
        }
        Ok(status) => {
            log::warn!("converter exited with {status} for {:?}", job.output_path());
            let _ = std::fs::remove_file(job.output_path());
            slot.set_status(JobStatus::Failed(format!("converter exited with {status}")));
        }
        Err(e) => {
            log::warn!("failed to wait on converter for {:?}: {e}", job.output_path());
            let _ = std::fs::remove_file(job.output_path());
            slot.set_status(JobStatus::Failed(format!("failed to wait on converter: {e}")));
        }
    }
}
