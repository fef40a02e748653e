use std::{
    io,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
};

use log::{debug, error};

/// Cooperative stop flag shared by the server and its loops.
#[derive(Debug, Clone, Default)]
pub struct StopSignal {
    stopped: Arc<AtomicBool>,
}

impl StopSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }
}

/// A named thread running one of the server loops.
#[derive(Debug)]
pub struct Worker {
    name: &'static str,
    thread: thread::JoinHandle<()>,
}

impl Worker {
    pub fn spawn<F>(name: &'static str, f: F) -> io::Result<Self>
    where
        F: FnOnce() + Send + 'static,
    {
        let thread = thread::Builder::new()
            .name(format!("stardust-{name}"))
            .spawn(f)?;
        debug!("spawned {name} loop");

        Ok(Self { name, thread })
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn join(self) {
        debug!("joining {} loop", self.name);
        if self.thread.join().is_err() {
            error!("{} loop panicked", self.name);
        }
    }
}
