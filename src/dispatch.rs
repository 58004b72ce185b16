//! Cross-thread dispatcher
//!
//! A single-consumer task queue that carries work from producer threads to
//! the thread owning the GPU context. Tasks run on the owner thread, exactly
//! once each, in the order they entered the queue. The owner passes its own
//! state (`C`) into every task, so producers never touch it directly.

use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError, Sender};

/// A unit of work executed on the owner thread
pub type Task<C> = Box<dyn FnOnce(&mut C) + Send + 'static>;

/// Owner side of the queue
pub struct Dispatcher<C> {
    sender: Sender<Task<C>>,
    receiver: Receiver<Task<C>>,
}

/// Producer side of the queue; cheap to clone and send to other threads
pub struct Poster<C> {
    sender: Sender<Task<C>>,
}

impl<C> Clone for Poster<C> {
    fn clone(&self) -> Self {
        Self {
            sender: self.sender.clone(),
        }
    }
}

impl<C> Poster<C> {
    /// Enqueue a task for the owner thread.
    ///
    /// Returns false when the owner has shut down; the task is dropped
    /// without running.
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce(&mut C) + Send + 'static,
    {
        self.sender.send(Box::new(task)).is_ok()
    }
}

impl<C> Default for Dispatcher<C> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C> Dispatcher<C> {
    pub fn new() -> Self {
        let (sender, receiver) = crossbeam_channel::unbounded();
        Self { sender, receiver }
    }

    /// A producer handle for this queue
    pub fn poster(&self) -> Poster<C> {
        Poster {
            sender: self.sender.clone(),
        }
    }

    /// Tasks waiting to run
    pub fn pending(&self) -> usize {
        self.receiver.len()
    }

    /// Run every task queued at the time of the call and return how many ran.
    ///
    /// Tasks posted by the tasks themselves wait for the next call.
    pub fn run_pending(&self, ctx: &mut C) -> usize {
        let queued = self.receiver.len();
        let mut ran = 0;
        while ran < queued {
            match self.receiver.try_recv() {
                Ok(task) => {
                    task(ctx);
                    ran += 1;
                }
                Err(_) => break,
            }
        }
        ran
    }

    /// Block up to `timeout` for the first task, then run everything queued.
    pub fn run_with_timeout(&self, ctx: &mut C, timeout: Duration) -> usize {
        match self.receiver.recv_timeout(timeout) {
            Ok(task) => {
                task(ctx);
                1 + self.run_pending(ctx)
            }
            // The dispatcher holds a sender, so the queue never disconnects
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_fifo_single_producer() {
        let dispatcher: Dispatcher<Vec<&'static str>> = Dispatcher::new();
        let poster = dispatcher.poster();

        let producer = thread::spawn(move || {
            for name in ["A", "B", "C"] {
                assert!(poster.post(move |log: &mut Vec<&'static str>| log.push(name)));
            }
        });
        producer.join().unwrap();

        let mut log = Vec::new();
        assert_eq!(dispatcher.run_pending(&mut log), 3);
        assert_eq!(log, vec!["A", "B", "C"]);
        assert_eq!(dispatcher.run_pending(&mut log), 0);
    }

    #[test]
    fn test_per_producer_order_with_concurrent_producer() {
        let dispatcher: Dispatcher<Vec<(u8, u32)>> = Dispatcher::new();

        let producers: Vec<_> = (0..2u8)
            .map(|id| {
                let poster = dispatcher.poster();
                thread::spawn(move || {
                    for seq in 0..500u32 {
                        poster.post(move |log: &mut Vec<(u8, u32)>| log.push((id, seq)));
                    }
                })
            })
            .collect();

        let mut log = Vec::new();
        for producer in producers {
            producer.join().unwrap();
        }
        dispatcher.run_pending(&mut log);

        assert_eq!(log.len(), 1000);
        for id in 0..2u8 {
            let seqs: Vec<u32> = log.iter().filter(|(p, _)| *p == id).map(|(_, s)| *s).collect();
            assert_eq!(seqs, (0..500).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_tasks_run_exactly_once() {
        let dispatcher: Dispatcher<u32> = Dispatcher::new();
        let poster = dispatcher.poster();
        for _ in 0..10 {
            poster.post(|count: &mut u32| *count += 1);
        }

        let mut count = 0;
        dispatcher.run_pending(&mut count);
        dispatcher.run_pending(&mut count);
        assert_eq!(count, 10);
    }

    #[test]
    fn test_post_after_owner_shutdown_is_dropped() {
        let dispatcher: Dispatcher<()> = Dispatcher::new();
        let poster = dispatcher.poster();
        drop(dispatcher);
        assert!(!poster.post(|_: &mut ()| panic!("must not run")));
    }

    #[test]
    fn test_run_with_timeout_waits_for_producer() {
        let dispatcher: Dispatcher<Vec<u8>> = Dispatcher::new();
        let poster = dispatcher.poster();
        let producer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            poster.post(|log: &mut Vec<u8>| log.push(1));
        });

        let mut log = Vec::new();
        assert_eq!(dispatcher.run_with_timeout(&mut log, Duration::from_secs(5)), 1);
        assert_eq!(log, vec![1]);
        producer.join().unwrap();
        assert_eq!(dispatcher.run_with_timeout(&mut log, Duration::from_millis(10)), 0);
    }

    #[test]
    fn test_task_posted_from_task_runs_next_round() {
        let dispatcher: Dispatcher<Vec<u8>> = Dispatcher::new();
        let poster = dispatcher.poster();
        let inner = dispatcher.poster();
        poster.post(move |log: &mut Vec<u8>| {
            log.push(1);
            inner.post(|log: &mut Vec<u8>| log.push(2));
        });

        let mut log = Vec::new();
        assert_eq!(dispatcher.run_pending(&mut log), 1);
        assert_eq!(dispatcher.pending(), 1);
        assert_eq!(dispatcher.run_pending(&mut log), 1);
        assert_eq!(log, vec![1, 2]);
    }
}
