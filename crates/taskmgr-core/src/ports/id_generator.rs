//! IdGenerator port - id generation.
//!
//! Ids must be unique across nodes without coordination, so the default
//! generator uses ULIDs stamped from the injected `Clock`.

use std::sync::Arc;

use ulid::Ulid;

use crate::domain::TaskId;
use crate::ports::Clock;

pub trait IdGenerator: Send + Sync {
    fn generate_task_id(&self) -> TaskId;
}

pub struct UlidGenerator {
    clock: Arc<dyn Clock>,
}

impl UlidGenerator {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl IdGenerator for UlidGenerator {
    fn generate_task_id(&self) -> TaskId {
        let timestamp_ms = self.clock.now().timestamp_millis().max(0) as u64;
        TaskId::from(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
