//! Blocking request/response between a worker and the UI thread.
//!
//! The worker arms a request under the lock, posts the matching event, then
//! sleeps one polling quantum at a time and re-checks the mailbox with
//! `try_lock`. The UI thread only ever uses `try_lock` to deliver the reply, so
//! it never blocks on the worker; a reply that meets contention is retried by
//! the caller.
//!
//! A shutdown flag lets a closing host release a worker that is waiting for an
//! answer that will never come.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    thread,
    time::Duration,
};

use parking_lot::Mutex;

/// Shared state of one interaction.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Mailbox {
    /// Set by the UI once a read request was answered.
    pub read_done: bool,
    /// Set by the UI once a question or alert was answered.
    pub ask_done: bool,
    /// Text delivered for the last read request.
    pub last_read_text: String,
    /// Answer to the last question: `1` for yes, `0` for no.
    pub last_answer: i32,
}

/// Reply delivered by the UI thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// Answer to a read request. A cancelled dialog delivers empty text.
    Text(String),
    /// Answer to a yes/no question.
    Answer(bool),
    /// An alert was acknowledged.
    Acknowledged,
}

/// The worker stopped waiting because the host is shutting down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interaction cancelled: the script host is closing")]
pub struct Cancelled;

/// Mutex-guarded mailbox shared by a worker and the owning view.
#[derive(Debug)]
pub struct InteractiveChannel {
    mailbox: Mutex<Mailbox>,
    shutdown: AtomicBool,
    quantum: Duration,
}

impl InteractiveChannel {
    /// Creates a channel whose waiting side sleeps `quantum` between checks.
    #[must_use]
    pub fn new(quantum: Duration) -> Self {
        Self {
            mailbox: Mutex::new(Mailbox::default()),
            shutdown: AtomicBool::new(false),
            quantum,
        }
    }

    /// Polling quantum of the waiting side.
    #[must_use]
    pub fn quantum(&self) -> Duration {
        self.quantum
    }

    // =========================================================================
    // Worker side
    // =========================================================================

    /// Arms a read request, runs `post` to notify the UI, and blocks for the text.
    ///
    /// # Errors
    /// Returns [`Cancelled`] if the channel is shut down while waiting.
    pub fn read(&self, post: impl FnOnce()) -> Result<String, Cancelled> {
        {
            let mut mailbox = self.mailbox.lock();
            mailbox.read_done = false;
            mailbox.last_read_text.clear();
        }
        post();
        self.wait(|mailbox| mailbox.read_done.then(|| std::mem::take(&mut mailbox.last_read_text)))
    }

    /// Arms a question, runs `post` to notify the UI, and blocks for the answer.
    ///
    /// # Errors
    /// Returns [`Cancelled`] if the channel is shut down while waiting.
    pub fn ask(&self, post: impl FnOnce()) -> Result<bool, Cancelled> {
        self.arm_ask();
        post();
        self.wait(|mailbox| mailbox.ask_done.then_some(mailbox.last_answer != 0))
    }

    /// Arms an alert, runs `post` to notify the UI, and blocks until acknowledged.
    ///
    /// # Errors
    /// Returns [`Cancelled`] if the channel is shut down while waiting.
    pub fn alert(&self, post: impl FnOnce()) -> Result<(), Cancelled> {
        self.arm_ask();
        post();
        self.wait(|mailbox| mailbox.ask_done.then_some(()))
    }

    fn arm_ask(&self) {
        let mut mailbox = self.mailbox.lock();
        mailbox.ask_done = false;
        mailbox.last_answer = 0;
    }

    fn wait<T>(&self, mut check: impl FnMut(&mut Mailbox) -> Option<T>) -> Result<T, Cancelled> {
        loop {
            if self.is_shut_down() {
                return Err(Cancelled);
            }
            thread::sleep(self.quantum);
            if let Some(mut mailbox) = self.mailbox.try_lock()
                && let Some(value) = check(&mut mailbox)
            {
                return Ok(value);
            }
        }
    }

    // =========================================================================
    // UI side
    // =========================================================================

    /// Delivers a reply without blocking.
    ///
    /// Returns `false` when the mailbox is momentarily locked by the worker;
    /// the caller keeps the reply and tries again later.
    #[must_use]
    pub fn try_reply(&self, reply: &Reply) -> bool {
        let Some(mut mailbox) = self.mailbox.try_lock() else {
            return false;
        };
        match reply {
            Reply::Text(text) => {
                mailbox.last_read_text.clone_from(text);
                mailbox.read_done = true;
            }
            Reply::Answer(yes) => {
                mailbox.last_answer = i32::from(*yes);
                mailbox.ask_done = true;
            }
            Reply::Acknowledged => mailbox.ask_done = true,
        }
        true
    }

    /// Copies the mailbox state without blocking.
    #[must_use]
    pub fn try_snapshot(&self) -> Option<Mailbox> {
        self.mailbox.try_lock().map(|mailbox| mailbox.clone())
    }

    /// Releases any waiting worker with [`Cancelled`]; permanent.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    /// Returns `true` once [`shutdown`](Self::shutdown) was called.
    #[must_use]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, mpsc},
        time::Instant,
    };

    use super::*;

    #[test]
    fn read_returns_delivered_text() {
        let channel = Arc::new(InteractiveChannel::new(Duration::from_millis(5)));
        let (armed_tx, armed_rx) = mpsc::channel();
        let worker = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.read(|| armed_tx.send(()).unwrap()))
        };
        armed_rx.recv().unwrap();
        while !channel.try_reply(&Reply::Text("Ada".into())) {
            thread::yield_now();
        }
        assert_eq!(worker.join().unwrap(), Ok("Ada".to_owned()));
    }

    #[test]
    fn ask_maps_answer_to_bool() {
        let channel = Arc::new(InteractiveChannel::new(Duration::from_millis(5)));
        let (armed_tx, armed_rx) = mpsc::channel();
        let worker = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.ask(|| armed_tx.send(()).unwrap()))
        };
        armed_rx.recv().unwrap();
        while !channel.try_reply(&Reply::Answer(true)) {
            thread::yield_now();
        }
        assert_eq!(worker.join().unwrap(), Ok(true));
        assert_eq!(channel.try_snapshot().map(|m| m.last_answer), Some(1));
    }

    #[test]
    fn waiting_worker_observes_reply_within_a_quantum() {
        let quantum = Duration::from_millis(20);
        let channel = Arc::new(InteractiveChannel::new(quantum));
        let (armed_tx, armed_rx) = mpsc::channel();
        let worker = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || {
                let result = channel.alert(|| armed_tx.send(()).unwrap());
                (result, Instant::now())
            })
        };
        armed_rx.recv().unwrap();
        thread::sleep(Duration::from_millis(45));
        let delivered = Instant::now();
        while !channel.try_reply(&Reply::Acknowledged) {
            thread::yield_now();
        }
        let (result, returned) = worker.join().unwrap();
        assert_eq!(result, Ok(()));
        // One quantum plus scheduling slack.
        assert!(returned.duration_since(delivered) < quantum * 5);
    }

    #[test]
    fn shutdown_releases_waiter() {
        let channel = Arc::new(InteractiveChannel::new(Duration::from_millis(5)));
        let worker = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.read(|| ()))
        };
        thread::sleep(Duration::from_millis(20));
        channel.shutdown();
        assert_eq!(worker.join().unwrap(), Err(Cancelled));
    }
}
