//! Actor system for background tasks.
//!
//! Each actor is an independent tokio task that publishes its results
//! through a channel instead of being polled. Actors handle:
//! - Host resource sampling (SamplerActor)

pub mod sampler;

use tokio_util::sync::CancellationToken;

pub use sampler::SamplerActor;

/// Handle to a running actor, used for graceful shutdown.
#[derive(Debug)]
pub struct ActorHandle {
    cancel: CancellationToken,
}

impl ActorHandle {
    /// Create a new actor handle with a cancellation token.
    pub fn new(cancel: CancellationToken) -> Self {
        Self { cancel }
    }

    /// Signal the actor to shut down gracefully.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Check if shutdown has been requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

impl Drop for ActorHandle {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
