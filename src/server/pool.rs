/*
 * Copyright (C) 2021-2023 Fanout, Inc.
 * Copyright (C) 2023 Fastly, Inc.
 *
 * Licensed under the Apache License, Version 2.0 (the "License");
 * you may not use this file except in compliance with the License.
 * You may obtain a copy of the License at
 *
 *     http://www.apache.org/licenses/LICENSE-2.0
 *
 * Unless required by applicable law or agreed to in writing, software
 * distributed under the License is distributed on an "AS IS" BASIS,
 * WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 * See the License for the specific language governing permissions and
 * limitations under the License.
 */

use crate::core::http1::Response;
use log::{debug, error};
use mio::Waker;
use std::collections::VecDeque;
use std::io;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

pub struct Job {
    pub key: usize,
    pub conn_id: u64,
    pub raw: Vec<u8>,
}

/// A handled job, sent back to the event loop.
pub struct Completion {
    pub key: usize,
    pub conn_id: u64,
    pub response: Response,
}

struct JobsInner {
    stop: bool,
    jobs: VecDeque<Job>,
}

#[derive(Clone)]
struct Jobs {
    inner: Arc<(Mutex<JobsInner>, Condvar)>,
}

impl Jobs {
    fn new() -> Self {
        let inner = JobsInner {
            stop: false,
            jobs: VecDeque::new(),
        };

        Self {
            inner: Arc::new((Mutex::new(inner), Condvar::new())),
        }
    }

    fn set_stop_flag(&self) {
        let (lock, cvar) = &*self.inner;

        let mut jobs = lock.lock().unwrap();

        jobs.stop = true;

        cvar.notify_all();
    }

    fn add(&self, job: Job) -> Result<(), Job> {
        let (lock, cvar) = &*self.inner;

        let mut jobs = lock.lock().unwrap();

        if jobs.stop {
            return Err(job);
        }

        jobs.jobs.push_back(job);

        cvar.notify_one();

        Ok(())
    }

    // blocks until a job is available. returns none once stopped
    fn get_next(&self) -> Option<Job> {
        let (lock, cvar) = &*self.inner;

        let mut jobs = lock.lock().unwrap();

        loop {
            if jobs.stop {
                return None;
            }

            if let Some(job) = jobs.jobs.pop_front() {
                return Some(job);
            }

            jobs = cvar.wait(jobs).unwrap();
        }
    }
}

/// Fixed set of threads that turn raw requests into responses. Results go
/// back over a channel, and the waker nudges the event loop to collect
/// them, so only the event loop ever touches socket registrations.
pub struct WorkerPool {
    jobs: Jobs,
    workers: Vec<thread::JoinHandle<()>>,
}

impl WorkerPool {
    pub fn new<F>(
        num_threads: usize,
        handle_fn: Arc<F>,
        done: mpsc::Sender<Completion>,
        waker: Arc<Waker>,
    ) -> Result<Self, io::Error>
    where
        F: Fn(&[u8]) -> Response + Send + Sync + 'static,
    {
        let jobs = Jobs::new();

        let mut pool = Self {
            jobs: jobs.clone(),
            workers: Vec::with_capacity(num_threads),
        };

        for i in 0..num_threads {
            let jobs = jobs.clone();
            let handle_fn = handle_fn.clone();
            let done = done.clone();
            let waker = waker.clone();

            let thread = thread::Builder::new()
                .name(format!("worker-{}", i))
                .spawn(move || {
                    while let Some(job) = jobs.get_next() {
                        let response = (handle_fn)(&job.raw);

                        let c = Completion {
                            key: job.key,
                            conn_id: job.conn_id,
                            response,
                        };

                        if done.send(c).is_err() {
                            break;
                        }

                        if let Err(e) = waker.wake() {
                            error!("failed to wake event loop: {}", e);
                        }
                    }
                })?;

            pool.workers.push(thread);
        }

        debug!("started {} workers", num_threads);

        Ok(pool)
    }

    pub fn size(&self) -> usize {
        self.workers.len()
    }

    /// Queues a job. Gives the job back if the pool is stopping.
    pub fn submit(&self, job: Job) -> Result<(), Job> {
        self.jobs.add(job)
    }

    fn stop(&mut self) {
        self.jobs.set_stop_flag();

        for thread in self.workers.drain(..) {
            if thread.join().is_err() {
                error!("worker thread panicked");
            }
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
