//! Encoder double with scripted behaviour.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{Mutex, Notify};

use pictor_core::models::DerivativeFormat;
use pictor_core::TaskError;
use pictor_processing::{EncodeSettings, EncodedImage, ImageEncoder};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behaviour {
    Succeed,
    FailTransient,
    FailPermanent,
}

pub struct FakeEncoder {
    behaviour: Mutex<Behaviour>,
    calls: AtomicUsize,
    /// When set, each encode parks until the test calls `release`.
    gate: Option<Arc<Notify>>,
    /// Signalled once an encode call has started.
    started: Arc<Notify>,
}

impl FakeEncoder {
    pub fn new(behaviour: Behaviour) -> Self {
        Self {
            behaviour: Mutex::new(behaviour),
            calls: AtomicUsize::new(0),
            gate: None,
            started: Arc::new(Notify::new()),
        }
    }

    pub fn gated(behaviour: Behaviour) -> Self {
        Self {
            gate: Some(Arc::new(Notify::new())),
            ..Self::new(behaviour)
        }
    }

    pub async fn set_behaviour(&self, behaviour: Behaviour) {
        *self.behaviour.lock().await = behaviour;
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn release(&self) {
        if let Some(gate) = &self.gate {
            gate.notify_one();
        }
    }

    pub async fn wait_started(&self) {
        self.started.notified().await;
    }
}

#[async_trait]
impl ImageEncoder for FakeEncoder {
    async fn encode(
        &self,
        source: Bytes,
        format: DerivativeFormat,
        _settings: EncodeSettings,
    ) -> Result<EncodedImage, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }

        match *self.behaviour.lock().await {
            Behaviour::Succeed => Ok(EncodedImage {
                bytes: Bytes::from(format!("{}:{}", format, source.len())),
                width: 10,
                height: 10,
            }),
            Behaviour::FailTransient => Err(TaskError::transient(anyhow::anyhow!(
                "storage hiccup"
            ))),
            Behaviour::FailPermanent => Err(TaskError::permanent(anyhow::anyhow!(
                "unsupported image"
            ))),
        }
    }

    async fn read_dimensions(&self, _source: Bytes) -> Result<(u32, u32), TaskError> {
        Ok((10, 10))
    }
}
