use log::info;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::engine::EngineLoop;

/// The engine event loop, shareable between the thread running it and
/// whoever decides it is time to quit
///
/// Clones share the same loop and the same quit flag.
#[derive(Clone)]
pub struct MainLoop {
    inner: Arc<dyn EngineLoop>,
    quitting: Arc<AtomicBool>,
}

impl MainLoop {
    pub fn new(inner: Arc<dyn EngineLoop>) -> Self {
        Self {
            inner,
            quitting: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Dispatch engine events on the calling thread until [`MainLoop::quit`]
    pub fn run(&self) {
        if self.quit_requested() {
            return;
        }
        info!("MainLoop: running");
        self.inner.run();
        info!("MainLoop: stopped");
    }

    pub fn quit(&self) {
        self.quitting.store(true, Ordering::SeqCst);
        self.inner.quit();
    }

    pub fn quit_requested(&self) -> bool {
        self.quitting.load(Ordering::SeqCst)
    }

    pub fn is_running(&self) -> bool {
        self.inner.is_running()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::sim::SimLoop;
    use std::time::Duration;

    #[test]
    fn test_quit_from_another_thread() {
        let sim = Arc::new(SimLoop::new());
        let main_loop = MainLoop::new(sim.clone());

        let runner = {
            let main_loop = main_loop.clone();
            std::thread::spawn(move || main_loop.run())
        };

        let (tx, rx) = std::sync::mpsc::channel();
        sim.post(move || {
            let _ = tx.send(());
        });
        rx.recv_timeout(Duration::from_secs(5)).unwrap();

        main_loop.quit();
        runner.join().unwrap();
        assert!(main_loop.quit_requested());
        assert!(!main_loop.is_running());
    }

    #[test]
    fn test_run_after_quit_returns() {
        let main_loop = MainLoop::new(Arc::new(SimLoop::new()));
        main_loop.quit();
        main_loop.run();
        assert!(!main_loop.is_running());
    }
}
