//! Background task execution for the registry.
//!
//! The registry owns a small multi-threaded tokio runtime. Lifecycle work goes
//! through a single-consumer FIFO queue so it runs in submission order off the
//! caller's thread; delayed tasks and the OS-event listener run on the same
//! runtime.

use std::future::Future;
use std::time::Duration;

use tokio::runtime::{Builder, Runtime};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

type Job = Box<dyn FnOnce() + Send + 'static>;

pub(crate) struct TaskQueue {
    runtime: Option<Runtime>,
    tx: mpsc::UnboundedSender<(&'static str, Job)>,
}

impl TaskQueue {
    pub(crate) fn new(worker_threads: usize) -> Result<Self, std::io::Error> {
        let runtime = Builder::new_multi_thread()
            .worker_threads(worker_threads.max(1))
            .thread_name("appevent-worker")
            .enable_all()
            .build()?;

        let (tx, mut rx) = mpsc::unbounded_channel::<(&'static str, Job)>();
        runtime.spawn(async move {
            while let Some((name, job)) = rx.recv().await {
                if let Err(e) = tokio::task::spawn_blocking(job).await {
                    tracing::error!(task = name, error = %e, "queued task failed");
                }
            }
        });

        Ok(Self {
            runtime: Some(runtime),
            tx,
        })
    }

    /// Queues `job` behind every previously submitted job.
    pub(crate) fn submit(&self, name: &'static str, job: impl FnOnce() + Send + 'static) {
        if self.tx.send((name, Box::new(job))).is_err() {
            tracing::warn!(task = name, "task queue closed, dropping task");
        }
    }

    /// Runs `job` on a blocking thread after `delay`.
    pub(crate) fn submit_delayed(
        &self,
        name: &'static str,
        delay: Duration,
        job: impl FnOnce() + Send + 'static,
    ) {
        let Some(runtime) = &self.runtime else {
            return;
        };
        runtime.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Err(e) = tokio::task::spawn_blocking(job).await {
                tracing::error!(task = name, error = %e, "delayed task failed");
            }
        });
    }

    /// Runs `job` on a blocking thread right away, outside the FIFO.
    pub(crate) fn run_detached(&self, job: impl FnOnce() + Send + 'static) {
        if let Some(runtime) = &self.runtime {
            runtime.spawn_blocking(job);
        }
    }

    pub(crate) fn spawn<F>(&self, future: F) -> Option<JoinHandle<F::Output>>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.runtime.as_ref().map(|rt| rt.spawn(future))
    }
}

impl Drop for TaskQueue {
    fn drop(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;

    #[test]
    fn queued_jobs_run_in_order() {
        let queue = TaskQueue::new(2).expect("runtime");
        let (tx, rx) = std_mpsc::channel();
        for i in 0..5 {
            let tx = tx.clone();
            queue.submit("order", move || {
                std::thread::sleep(Duration::from_millis(5 - i));
                tx.send(i).expect("send");
            });
        }
        let got: Vec<u64> = (0..5)
            .map(|_| rx.recv_timeout(Duration::from_secs(5)).expect("job ran"))
            .collect();
        assert_eq!(got, vec![0, 1, 2, 3, 4]);
    }

    #[test]
    fn delayed_job_waits() {
        let queue = TaskQueue::new(1).expect("runtime");
        let (tx, rx) = std_mpsc::channel();
        let start = std::time::Instant::now();
        queue.submit_delayed("delay", Duration::from_millis(50), move || {
            tx.send(()).expect("send");
        });
        rx.recv_timeout(Duration::from_secs(5)).expect("delayed job ran");
        assert!(start.elapsed() >= Duration::from_millis(50));
    }
}
