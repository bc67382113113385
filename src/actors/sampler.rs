//! Sampler actor that keeps the latest host resource reading fresh.
//!
//! Probing the host touches the filesystem, so it runs on the blocking pool
//! under a timeout. Readers never wait on a probe: they read whatever the
//! actor last published on the watch channel.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::resource::monitor::{ResourceProbe, SampleSlot};
use crate::util::blocking_with_timeout;
use crate::Error;

use super::ActorHandle;

pub const SAMPLE_INTERVAL: Duration = Duration::from_millis(500);
pub const PROBE_TIMEOUT: Duration = Duration::from_millis(250);

/// Actor that periodically probes host resources and publishes the result.
pub struct SamplerActor<P: ResourceProbe> {
    probe: Arc<Mutex<P>>,
    tx: watch::Sender<SampleSlot>,
    interval: Duration,
    probe_timeout: Duration,
}

impl<P: ResourceProbe> SamplerActor<P> {
    pub fn new(probe: P, tx: watch::Sender<SampleSlot>) -> Self {
        Self {
            probe: Arc::new(Mutex::new(probe)),
            tx,
            interval: SAMPLE_INTERVAL,
            probe_timeout: PROBE_TIMEOUT,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn spawn(self) -> ActorHandle {
        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();

        debug!(interval = ?self.interval, "SamplerActor::spawn");

        tokio::spawn(async move {
            let mut interval = tokio::time::interval(self.interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

            loop {
                tokio::select! {
                    _ = cancel_clone.cancelled() => {
                        debug!("SamplerActor cancelled");
                        break;
                    }
                    _ = interval.tick() => {
                        let probe = Arc::clone(&self.probe);
                        let reading = blocking_with_timeout(self.probe_timeout, move || {
                            let mut probe = probe
                                .lock()
                                .map_err(|_| Error::Monitor("probe lock poisoned".to_string()))?;
                            probe.read()
                        })
                        .await;

                        match &reading {
                            Ok(sample) => trace!(
                                memory = sample.memory_used_fraction,
                                cpu = sample.cpu_used_fraction,
                                "resource sample"
                            ),
                            Err(e) => debug!(error = %e, "resource probe failed"),
                        }

                        if self.tx.send(Some(reading.map_err(|e| e.to_string()))).is_err() {
                            debug!("SamplerActor: all readers dropped");
                            break;
                        }
                    }
                }
            }
        });

        ActorHandle::new(cancel)
    }
}
