//! Deferred cache writes.
//!
//! Scanners hand finished tables to a [`WriteQueue`] and move on; background
//! writer threads drain it into the [`AnnotationCache`]. A failed write is
//! logged and counted, never reported back to the scanner: the next scan
//! simply misses and rebuilds.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{Receiver, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;

use serde::Serialize;

use crate::cache::AnnotationCache;
use crate::container::ContainerKey;
use crate::model::{CacheTables, StampTable};

#[derive(Debug, Clone)]
pub struct WriteJob {
    pub key: ContainerKey,
    /// Stamp taken before the scan that produced `tables`.
    pub stamp: StampTable,
    pub tables: CacheTables,
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    written: AtomicUsize,
    failed: AtomicUsize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: usize,
    pub written: usize,
    pub failed: usize,
}

pub struct WriteQueue {
    cache: Arc<AnnotationCache>,
    tx: Option<Sender<WriteJob>>,
    workers: Vec<JoinHandle<()>>,
    counters: Arc<Counters>,
}

impl WriteQueue {
    /// `threads == 0` writes inline on the caller's thread.
    pub fn new(cache: Arc<AnnotationCache>, threads: usize) -> Self {
        let counters = Arc::new(Counters::default());
        if threads == 0 {
            return Self {
                cache,
                tx: None,
                workers: Vec::new(),
                counters,
            };
        }

        let (tx, rx) = std::sync::mpsc::channel::<WriteJob>();
        let rx = Arc::new(Mutex::new(rx));
        let workers = (0..threads)
            .map(|_| {
                spawn_writer(
                    Arc::clone(&rx),
                    Arc::clone(&cache),
                    Arc::clone(&counters),
                )
            })
            .collect();

        Self {
            cache,
            tx: Some(tx),
            workers,
            counters,
        }
    }

    pub fn enqueue(&self, job: WriteJob) {
        self.counters.pending.fetch_add(1, Ordering::Relaxed);
        let job = match self.tx.as_ref() {
            Some(tx) => match tx.send(job) {
                Ok(()) => return,
                Err(err) => err.0,
            },
            None => job,
        };
        run_job(&self.cache, &self.counters, job);
    }

    pub fn pending_count(&self) -> usize {
        self.counters.pending.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            pending: self.counters.pending.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }

    /// Stop accepting jobs and wait until every queued one is written.
    pub fn shutdown_and_flush(&mut self) -> QueueStats {
        self.tx.take();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!(target: "anno_cache", "cache writer thread panicked");
            }
        }
        self.stats()
    }
}

impl Drop for WriteQueue {
    fn drop(&mut self) {
        self.shutdown_and_flush();
    }
}

fn spawn_writer(
    rx: Arc<Mutex<Receiver<WriteJob>>>,
    cache: Arc<AnnotationCache>,
    counters: Arc<Counters>,
) -> JoinHandle<()> {
    std::thread::spawn(move || {
        loop {
            let next = rx.lock().unwrap_or_else(PoisonError::into_inner).recv();
            match next {
                Ok(job) => run_job(&cache, &counters, job),
                Err(_) => break,
            }
        }
    })
}

fn run_job(cache: &AnnotationCache, counters: &Counters, job: WriteJob) {
    match cache.write_with_stamp(&job.key, &job.stamp, &job.tables) {
        Ok(()) => {
            counters.written.fetch_add(1, Ordering::Relaxed);
        }
        Err(err) => {
            counters.failed.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                target: "anno_cache",
                key = %job.key,
                error = %err,
                "deferred cache write failed"
            );
        }
    }
    counters.pending.fetch_sub(1, Ordering::Relaxed);
}
