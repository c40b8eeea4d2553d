//! Global sequence issuance for queue ordering.

use std::sync::Arc;

use crate::store::{CoordinationStore, StoreError};

/// Issues strictly increasing sequence numbers shared by every process.
#[derive(Clone)]
pub struct Sequencer {
    store: Arc<dyn CoordinationStore>,
}

impl Sequencer {
    pub fn new(store: Arc<dyn CoordinationStore>) -> Self {
        Self { store }
    }

    pub async fn next(&self) -> Result<u64, StoreError> {
        self.store.next_sequence().await
    }
}
