//! Thredder is a small fixed-size worker pool. Jobs go in over a crossbeam
//! channel and the workers pull them off in order.

use std::panic::{self, AssertUnwindSafe};
use std::thread;

use crossbeam::channel::{self, Sender};

use crate::error::{BResult, BError};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// Stores state information for the threads we've spawned.
pub struct Thredder {
    /// Our Thredder's name
    pub name: String,
    tx: Sender<Job>,
}

impl Thredder {
    /// Create a new thredder
    pub fn new(name: &str, mut workers: u32) -> BResult<Thredder> {
        if workers == 0 {
            workers = 1;
        }
        let (tx, rx) = channel::unbounded::<Job>();
        for i in 0..workers {
            let rx = rx.clone();
            let thread_name = format!("{}:{}", name, i);
            thread::Builder::new().name(thread_name.clone()).spawn(move || {
                while let Ok(job) = rx.recv() {
                    if let Err(e) = panic::catch_unwind(AssertUnwindSafe(job)) {
                        error!("Thredder -- job panicked on {}: {:?}", thread_name, e);
                    }
                }
            })?;
        }
        Ok(Thredder {
            name: String::from(name),
            tx,
        })
    }

    /// Queue an operation on this pool. Workers exit once the Thredder is
    /// dropped and the queue drains.
    pub fn run<F>(&self, job: F) -> BResult<()>
        where F: FnOnce() + Send + 'static
    {
        self.tx.send(Box::new(job))
            .map_err(|_| BError::Msg(format!("Thredder::run() -- pool {} is gone", self.name)))
    }
}
