//! Background worker for blocking accept/read work.
//!
//! The accept loop and every other blocking pipe call run off the caller's
//! thread: [`Worker::run`] starts the work on a dedicated OS thread and, when
//! it finishes, redelivers the outcome on the scheduling context captured at
//! construction time. If no tokio runtime is ambient when the worker is
//! built, a shared fallback runtime stands in as the general-purpose
//! thread-pool context.

use std::sync::OnceLock;

use tokio::runtime::{Builder, Handle, Runtime};

use crate::error::Result;

static FALLBACK_RT: OnceLock<Runtime> = OnceLock::new();

fn fallback_handle() -> Result<Handle> {
    if let Some(rt) = FALLBACK_RT.get() {
        return Ok(rt.handle().clone());
    }
    let rt = Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("pipehub-dispatch")
        .enable_all()
        .build()?;
    Ok(FALLBACK_RT.get_or_init(|| rt).handle().clone())
}

/// Runs blocking work on dedicated threads, delivering completions onto a
/// captured scheduling context.
#[derive(Clone)]
pub struct Worker {
    handle: Handle,
}

impl Worker {
    /// Capture the ambient scheduling context.
    ///
    /// # Errors
    ///
    /// Returns error only if no runtime is ambient and the fallback runtime
    /// cannot be built.
    pub fn new() -> Result<Self> {
        let handle = match Handle::try_current() {
            Ok(handle) => handle,
            Err(_) => fallback_handle()?,
        };
        Ok(Self { handle })
    }

    /// The captured runtime handle.
    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    /// Start `work` on a new dedicated thread.
    ///
    /// Returns immediately. Once started the work cannot be cancelled; when
    /// it returns, `on_done` is dispatched asynchronously onto the captured
    /// context with the outcome. Success and failure are each surfaced
    /// exactly once; there is no retry.
    pub fn run<W, F>(&self, work: W, on_done: F)
    where
        W: FnOnce() -> Result<()> + Send + 'static,
        F: FnOnce(Result<()>) + Send + 'static,
    {
        let handle = self.handle.clone();
        std::thread::spawn(move || {
            let result = work();
            handle.spawn(async move { on_done(result) });
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BrokerError;
    use std::time::Duration;

    #[tokio::test]
    async fn success_is_delivered_on_captured_context() {
        let worker = Worker::new().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        worker.run(
            || Ok(()),
            move |result| {
                let _ = tx.send(result.is_ok());
            },
        );

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(delivered);
    }

    #[tokio::test]
    async fn failure_carries_the_error() {
        let worker = Worker::new().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        worker.run(
            || Err(BrokerError::Handshake("boom".into())),
            move |result| {
                let _ = tx.send(result);
            },
        );

        let result = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(result, Err(BrokerError::Handshake(_))));
    }

    #[tokio::test]
    async fn run_does_not_block_on_slow_work() {
        let worker = Worker::new().unwrap();
        let (tx, rx) = tokio::sync::oneshot::channel();

        let started = std::time::Instant::now();
        worker.run(
            || {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            },
            move |result| {
                let _ = tx.send(result.is_ok());
            },
        );
        assert!(started.elapsed() < Duration::from_millis(100));

        let delivered = tokio::time::timeout(Duration::from_secs(2), rx)
            .await
            .unwrap()
            .unwrap();
        assert!(delivered);
    }

    #[test]
    fn falls_back_to_shared_runtime_without_ambient_context() {
        // Plain #[test]: no ambient runtime here.
        let worker = Worker::new().unwrap();
        let (tx, rx) = std::sync::mpsc::channel();

        worker.run(
            || Ok(()),
            move |result| {
                let _ = tx.send(result.is_ok());
            },
        );

        assert!(rx.recv_timeout(Duration::from_secs(2)).unwrap());
    }
}
