use keel::logging;
use std::sync::{Arc, Mutex};
use std::thread;

pub type Task = Box<dyn FnOnce() + Send>;

/// Minimal execution seam consumed by the encode and decode offload paths.
/// Implementations decide where the task runs; callers only rely on tasks
/// submitted from one thread running in submission order.
pub trait Executor: Send + Sync {
    fn execute(&self, task: Task);
}

/// Runs tasks directly on the calling thread.
pub struct InlineExecutor;

impl Executor for InlineExecutor {
    #[inline]
    fn execute(&self, task: Task) {
        task();
    }
}

/// A single dedicated worker thread draining an unbounded queue. One worker
/// keeps per-connection ordering intact while taking serialization work off
/// the IO threads.
pub struct WorkerExecutor {
    sender: Mutex<Option<crossbeam_channel::Sender<Task>>>,
    worker: Mutex<Option<thread::JoinHandle<()>>>,
}

impl WorkerExecutor {
    pub fn new<'a, L: Into<Option<&'a logging::Logger>>>(name: &str, log: L) -> Arc<WorkerExecutor> {
        let worker_log = match log.into() {
            Some(log) => log.new(logging::o!()),
            _ => logging::discard(),
        };

        let (sender, receiver) = crossbeam_channel::unbounded::<Task>();

        let handle = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                for task in receiver.iter() {
                    task();
                }

                logging::debug!(worker_log, "worker executor stopped"; "context" => "worker");
            })
            .expect("Worker thread spawn failed");

        Arc::new(WorkerExecutor {
            sender: Mutex::new(Some(sender)),
            worker: Mutex::new(Some(handle)),
        })
    }

    /// Disconnect the queue and join the worker. Tasks already queued are
    /// drained before the thread ends.
    pub fn halt(&self) {
        self.sender.lock().expect("Executor lock poisoned").take();

        if let Some(handle) = self.worker.lock().expect("Executor lock poisoned").take() {
            drop(handle.join());
        }
    }
}

impl Executor for WorkerExecutor {
    #[inline]
    fn execute(&self, task: Task) {
        let sender = self.sender.lock().expect("Executor lock poisoned");

        if let Some(sender) = sender.as_ref() {
            drop(sender.send(task));
        }
    }
}

impl Drop for WorkerExecutor {
    fn drop(&mut self) {
        self.halt();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_inline_runs_immediately() {
        let counter = Arc::new(AtomicUsize::new(0));
        let executor = InlineExecutor;

        let seen = counter.clone();
        executor.execute(Box::new(move || {
            seen.fetch_add(1, Ordering::SeqCst);
        }));

        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_worker_drains_in_order() {
        let executor = WorkerExecutor::new("test-worker", None);
        let sink = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let sink = sink.clone();
            executor.execute(Box::new(move || {
                sink.lock().unwrap().push(i);
            }));
        }

        executor.halt();

        let seen = sink.lock().unwrap();
        assert_eq!(*seen, (0..16).collect::<Vec<_>>());
    }

    #[test]
    fn test_execute_after_halt_is_dropped() {
        let executor = WorkerExecutor::new("test-worker", None);
        executor.halt();

        // Must not panic or hang.
        executor.execute(Box::new(|| {}));
    }
}
