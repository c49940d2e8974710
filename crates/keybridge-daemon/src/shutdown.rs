//! Ordered shutdown hooks and termination signals

use std::sync::Mutex;

use tokio::signal::unix::{signal, SignalKind};

type Hook = Box<dyn FnOnce() + Send>;

/// Cleanup actions run once, in registration order, when the daemon exits.
#[derive(Default)]
pub struct ShutdownHooks {
    hooks: Mutex<Vec<(String, Hook)>>,
}

impl ShutdownHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F>(&self, name: impl Into<String>, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        let name = name.into();
        tracing::trace!("Registered shutdown hook '{}'", name);
        let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
        hooks.push((name, Box::new(hook)));
    }

    pub fn len(&self) -> usize {
        self.hooks.lock().map(|h| h.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Run and forget every registered hook.
    pub fn run(&self) {
        let hooks = {
            let mut hooks = self.hooks.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *hooks)
        };

        for (name, hook) in hooks {
            tracing::debug!("Running shutdown hook '{}'", name);
            hook();
        }
    }
}

/// Wait for SIGINT or SIGTERM and return the conventional exit code,
/// `128 + signal number`.
pub async fn wait_for_signal() -> std::io::Result<i32> {
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;

    let signo = tokio::select! {
        _ = interrupt.recv() => SignalKind::interrupt().as_raw_value(),
        _ = terminate.recv() => SignalKind::terminate().as_raw_value(),
    };

    tracing::info!("Received signal {}, shutting down", signo);
    Ok(128 + signo)
}
