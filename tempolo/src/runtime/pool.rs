use crate::runtime::executor::Shared;
use crate::runtime::worker;
use anyhow::{Result, anyhow};
use parking_lot::Mutex;
use std::sync::Arc;
use std::sync::mpsc;
use std::thread::{self, ThreadId};

/// The worker threads of an executor.
#[derive(Debug)]
pub(super) struct ThreadPool {
    handles: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl ThreadPool {
    /// Spawns `cfg.worker_threads` workers and waits until every one of them
    /// registered with `shared`.
    pub(super) fn spawn(shared: &Arc<Shared>) -> Result<Self> {
        let num_workers = shared.cfg.worker_threads;
        let (ready_tx, ready_rx) = mpsc::channel();
        let mut handles = Vec::with_capacity(num_workers);

        for _ in 0..num_workers {
            match spawn_worker_thread(Arc::clone(shared), ready_tx.clone()) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    // Let the workers that did start exit right away.
                    shared.queue.close();
                    let pool = Self {
                        handles: Mutex::new(handles),
                    };
                    pool.join_all()?;
                    return Err(e);
                }
            }
        }

        // Spawning threads is async, wait for all threads to be started...
        drop(ready_tx);
        for _ in 0..num_workers {
            ready_rx.recv()?;
        }

        Ok(Self {
            handles: Mutex::new(handles),
        })
    }

    pub(super) fn join_all(&self) -> Result<()> {
        let mut handles = self.handles.lock();
        let current = thread::current().id();

        let errors = handles
            .drain(..)
            // A worker dropping the last handle on the executor cannot join
            // itself, it exits on its own once the queue is closed.
            .filter(|handle| handle.thread().id() != current)
            .filter_map(|handle| {
                let id: ThreadId = handle.thread().id();
                handle.join().err().map(|_| id)
            })
            .collect::<Vec<_>>();

        if errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!("{} worker thread(s) panicked", errors.len()))
        }
    }
}

fn spawn_worker_thread(
    shared: Arc<Shared>,
    ready: mpsc::Sender<()>,
) -> Result<thread::JoinHandle<()>> {
    let name = (shared.cfg.thread_name.0)();

    let handle = thread::Builder::new()
        .name(name.clone())
        .spawn(move || worker::run(shared, ready))
        .map_err(|e| anyhow!("failed to spawn worker thread {name}: {e}"))?;

    Ok(handle)
}
