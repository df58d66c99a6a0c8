//! Backend abstraction.
//!
//! # Responsibilities
//! - Identify a backend (`BackendId`)
//! - Describe how to reach it (`BackendDescriptor`, immutable per generation)
//! - Pair the descriptor with its shared health record (`Backend`)

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};

use crate::config::{BackendConfig, TransportKind};
use crate::health::state::HealthRecord;

/// Cheaply clonable backend identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BackendId(Arc<str>);

impl BackendId {
    pub fn new(id: impl AsRef<str>) -> Self {
        Self(Arc::from(id.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for BackendId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl std::borrow::Borrow<str> for BackendId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl Serialize for BackendId {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

/// How to reach one backend. Immutable once part of a generation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackendDescriptor {
    pub id: BackendId,
    pub transport: TransportKind,
    pub endpoint: String,
    pub args: Vec<String>,
    pub env: BTreeMap<String, String>,
    pub weight: u32,
    pub handshake: bool,
}

/// Digest of everything that decides which process answers for a backend.
pub type Fingerprint = [u8; 32];

impl BackendDescriptor {
    /// Hash of transport, endpoint, args, env and handshake. Weight is left
    /// out: it moves traffic around but does not change the answers.
    pub fn fingerprint(&self) -> Fingerprint {
        let mut hasher = Sha256::new();
        let mut field = |part: &str| {
            hasher.update((part.len() as u64).to_be_bytes());
            hasher.update(part.as_bytes());
        };
        field(self.transport.as_str());
        field(&self.endpoint);
        for arg in &self.args {
            field(arg);
        }
        for (key, value) in &self.env {
            field(key);
            field(value);
        }
        field(if self.handshake { "handshake" } else { "raw" });
        hasher.finalize().into()
    }
}

impl From<&BackendConfig> for BackendDescriptor {
    fn from(config: &BackendConfig) -> Self {
        Self {
            id: BackendId::new(&config.id),
            transport: config.transport,
            endpoint: config.endpoint.clone(),
            args: config.args.clone(),
            env: config.env.clone(),
            weight: config.weight.max(1),
            handshake: config.handshake,
        }
    }
}

/// A backend as seen by one generation: descriptor plus health.
///
/// The health record is shared with later generations as long as the
/// descriptor does not change, so a reload does not reset a tripped breaker.
#[derive(Debug)]
pub struct Backend {
    pub descriptor: BackendDescriptor,
    pub health: Arc<HealthRecord>,
    fingerprint: Fingerprint,
}

impl Backend {
    pub fn new(descriptor: BackendDescriptor) -> Self {
        Self::with_health(descriptor, Arc::new(HealthRecord::new()))
    }

    pub fn with_health(descriptor: BackendDescriptor, health: Arc<HealthRecord>) -> Self {
        let fingerprint = descriptor.fingerprint();
        Self {
            descriptor,
            health,
            fingerprint,
        }
    }

    pub fn id(&self) -> &BackendId {
        &self.descriptor.id
    }

    pub fn fingerprint(&self) -> &Fingerprint {
        &self.fingerprint
    }
}
