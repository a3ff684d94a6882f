use std::sync::mpsc::{self, Receiver, Sender};

pub type Job = Box<dyn FnOnce() + Send + 'static>;

/// "Run this on the presentation thread." Listener callbacks are only ever
/// delivered through a dispatcher, never straight from a worker.
pub trait Dispatcher: Send + Sync + 'static {
    fn post(&self, job: Job);
}

/// Runs jobs immediately on the posting thread.
#[derive(Debug, Default, Clone, Copy)]
pub struct InlineDispatcher;

impl Dispatcher for InlineDispatcher {
    fn post(&self, job: Job) {
        job();
    }
}

/// Forwards jobs to whichever thread drains the paired receiver.
#[derive(Debug, Clone)]
pub struct ChannelDispatcher {
    sender: Sender<Job>,
}

impl ChannelDispatcher {
    pub fn new() -> (Self, Receiver<Job>) {
        let (sender, receiver) = mpsc::channel();
        (Self { sender }, receiver)
    }
}

impl Dispatcher for ChannelDispatcher {
    fn post(&self, job: Job) {
        // The receiver is gone once the presentation loop exits.
        let _ = self.sender.send(job);
    }
}

/// Runs every job currently queued; returns how many ran.
pub fn drain(receiver: &Receiver<Job>) -> usize {
    let mut ran = 0;
    while let Ok(job) = receiver.try_recv() {
        job();
        ran += 1;
    }
    ran
}
