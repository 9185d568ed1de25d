//! Thread manager: named worker threads with cooperative
//! dispatch loops. Each worker is a dedicated OS thread
//! running its own single-threaded `tokio` runtime, so `on_activate`/
//! `on_deactivate` and every externally scheduled call on a `threaded=true`
//! module run off the main thread without requiring module code to be
//! re-entered concurrently.

use crate::error::DispatchError;
use parking_lot::Mutex;
use std::cell::RefCell;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type Thunk = Box<dyn FnOnce() -> BoxFuture + Send>;

const DEFAULT_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

thread_local! {
    static CURRENT_WORKER: RefCell<Option<String>> = const { RefCell::new(None) };
}

enum Job {
    Run(Thunk),
    Stop,
}

struct Worker {
    tx: std_mpsc::Sender<Job>,
    done_rx: Mutex<Option<std_mpsc::Receiver<()>>>,
    join: Mutex<Option<std::thread::JoinHandle<()>>>,
    refcount: AtomicUsize,
}

/// Owns the `{thread_name -> worker}` map.
pub struct ThreadManager {
    workers: Mutex<HashMap<String, Arc<Worker>>>,
}

impl Default for ThreadManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ThreadManager {
    #[must_use]
    pub fn new() -> Self {
        Self {
            workers: Mutex::new(HashMap::new()),
        }
    }

    /// Returns the name of the worker the calling OS thread belongs to, if
    /// any; `None` on the main thread or on a thread this manager did not
    /// spawn.
    #[must_use]
    pub fn current_worker() -> Option<String> {
        CURRENT_WORKER.with(|c| c.borrow().clone())
    }

    /// Reference-counted get-or-create. Spawns the worker's thread and
    /// runtime on first acquisition; subsequent calls just bump the count.
    pub fn get_or_create(&self, name: &str) {
        let mut workers = self.workers.lock();
        if let Some(w) = workers.get(name) {
            w.refcount.fetch_add(1, Ordering::SeqCst);
            return;
        }
        let (tx, rx) = std_mpsc::channel::<Job>();
        let (done_tx, done_rx) = std_mpsc::channel::<()>();
        let thread_name = name.to_string();
        let join = std::thread::Builder::new()
            .name(format!("labstation-{name}"))
            .spawn(move || worker_loop(&thread_name, &rx, &done_tx))
            .unwrap_or_else(|e| unreachable!("spawning worker thread must not fail: {e}"));
        workers.insert(
            name.to_string(),
            Arc::new(Worker {
                tx,
                done_rx: Mutex::new(Some(done_rx)),
                join: Mutex::new(Some(join)),
                refcount: AtomicUsize::new(1),
            }),
        );
    }

    /// Releases one reference; joins the worker (bounded by
    /// [`DEFAULT_DRAIN_TIMEOUT`]) once the count reaches zero.
    pub fn release(&self, name: &str) {
        let done = {
            let mut workers = self.workers.lock();
            let Some(w) = workers.get(name).cloned() else {
                return;
            };
            if w.refcount.fetch_sub(1, Ordering::SeqCst) != 1 {
                return;
            }
            workers.remove(name);
            w
        };
        self.stop_worker(&done, DEFAULT_DRAIN_TIMEOUT);
    }

    /// Forces a worker to stop regardless of refcount; used by application
    /// shutdown to guarantee every worker joins.
    pub fn stop(&self, name: &str, drain_timeout: Duration) {
        let w = self.workers.lock().remove(name);
        if let Some(w) = w {
            self.stop_worker(&w, drain_timeout);
        }
    }

    fn stop_worker(&self, w: &Arc<Worker>, drain_timeout: Duration) {
        let _ = w.tx.send(Job::Stop);
        let done_rx = w.done_rx.lock().take();
        if let Some(done_rx) = done_rx {
            if done_rx.recv_timeout(drain_timeout).is_err() {
                // Drain window exhausted. The thread may still be
                // mid-job; we stop waiting on it rather than block
                // shutdown indefinitely. It will finish and exit on its
                // own once its current job returns.
                return;
            }
        }
        if let Some(join) = w.join.lock().take() {
            let _ = join.join();
        }
    }

    /// Dispatch a job to `worker`. If the calling task is already
    /// running on `worker` the job runs synchronously in place (no
    /// cross-thread hop, no risk of self-deadlock); otherwise it is
    /// enqueued FIFO and this call awaits the reply, optionally
    /// bounded by `timeout`.
    ///
    /// # Errors
    /// [`DispatchError::WorkerGone`] if `worker` was never created or has
    /// already been released; [`DispatchError::TimedOut`] if `timeout`
    /// elapses first.
    pub async fn dispatch<F, Fut, T>(
        &self,
        worker: &str,
        f: F,
        timeout: Option<Duration>,
    ) -> Result<T, DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        if Self::current_worker().as_deref() == Some(worker) {
            return Ok(f().await);
        }

        let handle = {
            self.workers
                .lock()
                .get(worker)
                .cloned()
                .ok_or_else(|| DispatchError::WorkerGone {
                    worker: worker.to_string(),
                })?
        };

        let (reply_tx, reply_rx) = oneshot::channel::<T>();
        let thunk: Thunk = Box::new(move || {
            Box::pin(async move {
                let out = f().await;
                let _ = reply_tx.send(out);
            })
        });
        handle
            .tx
            .send(Job::Run(thunk))
            .map_err(|_| DispatchError::Cancelled {
                worker: worker.to_string(),
            })?;

        match timeout {
            Some(d) => tokio::time::timeout(d, reply_rx)
                .await
                .map_err(|_| DispatchError::TimedOut {
                    worker: worker.to_string(),
                    timeout: d,
                })?
                .map_err(|_| DispatchError::Cancelled {
                    worker: worker.to_string(),
                }),
            None => reply_rx.await.map_err(|_| DispatchError::Cancelled {
                worker: worker.to_string(),
            }),
        }
    }

    /// Fire-and-forget dispatch: enqueues the job and returns without
    /// awaiting a reply.
    ///
    /// # Errors
    /// [`DispatchError::WorkerGone`] if `worker` is unknown.
    pub fn dispatch_detached<F, Fut>(&self, worker: &str, f: F) -> Result<(), DispatchError>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let handle = self
            .workers
            .lock()
            .get(worker)
            .cloned()
            .ok_or_else(|| DispatchError::WorkerGone {
                worker: worker.to_string(),
            })?;
        let thunk: Thunk = Box::new(move || Box::pin(f()));
        handle
            .tx
            .send(Job::Run(thunk))
            .map_err(|_| DispatchError::Cancelled {
                worker: worker.to_string(),
            })
    }
}

fn worker_loop(name: &str, rx: &std_mpsc::Receiver<Job>, done_tx: &std_mpsc::Sender<()>) {
    CURRENT_WORKER.with(|c| *c.borrow_mut() = Some(name.to_string()));
    let rt = tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .build()
        .unwrap_or_else(|e| unreachable!("current-thread runtime must build: {e}"));
    while let Ok(job) = rx.recv() {
        match job {
            Job::Run(thunk) => rt.block_on(thunk()),
            Job::Stop => break,
        }
    }
    let _ = done_tx.send(());
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    #[tokio::test]
    async fn cross_thread_dispatch_runs_and_replies() {
        let tm = ThreadManager::new();
        tm.get_or_create("hw_a");
        let result = tm
            .dispatch("hw_a", || async { 1 + 1 }, None)
            .await
            .expect("dispatch succeeds");
        assert_eq!(result, 2);
        tm.release("hw_a");
    }

    #[tokio::test]
    async fn dispatch_to_unknown_worker_fails() {
        let tm = ThreadManager::new();
        let err = tm
            .dispatch("nope", || async {}, None)
            .await
            .expect_err("must fail");
        assert!(matches!(err, DispatchError::WorkerGone { .. }));
    }

    #[tokio::test]
    async fn fifo_order_is_preserved_per_worker() {
        let tm = ThreadManager::new();
        tm.get_or_create("lg_b");
        let order = Arc::new(Mutex::new(Vec::new()));
        for i in 0..5 {
            let order = order.clone();
            tm.dispatch_detached("lg_b", move || async move {
                order.lock().push(i);
            })
            .expect("enqueue");
        }
        // Drain by issuing one more synchronous dispatch; FIFO guarantees
        // everything queued before it has run by the time it returns.
        tm.dispatch("lg_b", || async {}, None)
            .await
            .expect("drain marker");
        assert_eq!(*order.lock(), vec![0, 1, 2, 3, 4]);
        tm.release("lg_b");
    }

    #[tokio::test]
    async fn dispatch_timeout_yields_timed_out_error() {
        let tm = ThreadManager::new();
        tm.get_or_create("slow");
        let err = tm
            .dispatch(
                "slow",
                || async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                },
                Some(Duration::from_millis(10)),
            )
            .await
            .expect_err("must time out");
        assert!(matches!(err, DispatchError::TimedOut { .. }));
        tm.release("slow");
    }

    #[tokio::test]
    async fn release_joins_worker_thread() {
        let tm = ThreadManager::new();
        tm.get_or_create("once");
        let ran = Arc::new(AtomicBool::new(false));
        let ran2 = ran.clone();
        tm.dispatch(
            "once",
            move || async move {
                ran2.store(true, Ordering::SeqCst);
            },
            None,
        )
        .await
        .expect("dispatch");
        tm.release("once");
        assert!(ran.load(Ordering::SeqCst));
    }
}
