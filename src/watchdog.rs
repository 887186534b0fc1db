use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

enum Command {
    Reset,
    Stop,
}

/// Repeating timer which calls its callback whenever `interval` elapses without a `reset`.
/// It runs until `stop` is called or the watchdog is dropped.
pub struct Watchdog {
    commands: mpsc::UnboundedSender<Command>,
    handle: JoinHandle<()>,
}

impl Watchdog {
    pub fn start<F>(interval: Duration, callback: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        let (commands, mut receiver) = mpsc::unbounded_channel();
        let callback = Arc::new(callback);
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    command = receiver.recv() => match command {
                        Some(Command::Reset) => continue,
                        Some(Command::Stop) | None => break,
                    },
                    _ = tokio::time::sleep(interval) => callback(),
                }
            }
        });
        Self { commands, handle }
    }

    /// Re-arms the timer
    pub fn reset(&self) {
        let _ = self.commands.send(Command::Reset);
    }

    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
