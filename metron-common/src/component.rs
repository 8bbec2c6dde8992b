//! Component identity and the worker lifecycle.
//!
//! Every configured provider, collector and writer is a [`Component`].
//! Components that own background work additionally implement
//! [`WorkerComponent`]: one tokio task per component, started with a
//! shutdown receiver and joined by the runtime on exit.

use std::{sync::Arc, time::Duration};

use tokio::{sync::broadcast, task::JoinHandle};

/// The process-wide shutdown notification.
#[derive(Debug, Clone, Copy)]
pub enum Signal {
    Shutdown,
}

/// A configured component with a stable identity.
pub trait Component: Send + Sync {
    fn id(&self) -> &str;

    /// Releases external resources (connections, sessions). Idempotent;
    /// called once by the runtime after all workers have been joined.
    fn destroy(&self) {}
}

/// A component that owns one background task.
pub trait WorkerComponent: Component {
    /// Starts the worker. The task must observe `shutdown` in every wait
    /// and return promptly once it fires.
    fn start(self: Arc<Self>, shutdown: broadcast::Receiver<Signal>) -> JoinHandle<()>;
}

/// Waits on the shutdown receiver for up to `timeout`. Returns `true`
/// when shutdown was observed (including a closed channel), `false` when
/// the timeout elapsed.
pub async fn wait_shutdown(shutdown: &mut broadcast::Receiver<Signal>, timeout: Duration) -> bool {
    tokio::select! {
        received = shutdown.recv() => !matches!(
            received,
            Err(broadcast::error::RecvError::Lagged(_))
        ),
        () = tokio::time::sleep(timeout) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn wait_shutdown_times_out() {
        let (sender, mut receiver) = broadcast::channel::<Signal>(4);
        assert!(!wait_shutdown(&mut receiver, Duration::from_millis(50)).await);
        drop(sender);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_shutdown_observes_signal() {
        let (sender, mut receiver) = broadcast::channel::<Signal>(4);
        sender.send(Signal::Shutdown).unwrap();
        assert!(wait_shutdown(&mut receiver, Duration::from_secs(3600)).await);
    }

    #[tokio::test(start_paused = true)]
    async fn wait_shutdown_treats_closed_channel_as_shutdown() {
        let (sender, mut receiver) = broadcast::channel::<Signal>(4);
        drop(sender);
        assert!(wait_shutdown(&mut receiver, Duration::from_secs(3600)).await);
    }
}
