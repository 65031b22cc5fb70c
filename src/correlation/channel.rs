use super::{CorrelationManager, PendingExchange};
use crate::error::Error;
use crate::transport::{Channel, ChannelId};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tracing::debug;

/// One outstanding request per channel; every message or error on the
/// channel belongs to it.
#[derive(Debug, Default)]
pub struct ChannelCorrelationManager {
    states: Mutex<HashMap<ChannelId, Arc<PendingExchange>>>,
}

impl ChannelCorrelationManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.states.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.lock().unwrap().is_empty()
    }
}

impl CorrelationManager for ChannelCorrelationManager {
    fn put_state(&self, channel: &Channel, state: Arc<PendingExchange>) -> Result<(), Error> {
        let mut states = self.states.lock().unwrap();
        if let Some(current) = states.get(&channel.id()) {
            if !current.is_done() {
                return Err(Error::ChannelBusy {
                    channel: channel.id().as_u64(),
                });
            }
        }
        debug!(channel = %channel.id(), "Registered pending exchange");
        states.insert(channel.id(), state);
        Ok(())
    }

    fn get_state_for_message(&self, channel: &Channel, _message: &[u8]) -> Option<Arc<PendingExchange>> {
        self.states.lock().unwrap().get(&channel.id()).cloned()
    }

    fn get_state_for_error(&self, channel: &Channel, _cause: &Error) -> Option<Arc<PendingExchange>> {
        self.states.lock().unwrap().get(&channel.id()).cloned()
    }

    fn remove_state(&self, channel: &Channel) {
        self.states.lock().unwrap().remove(&channel.id());
    }

    fn discard_state(&self, channel: &Channel, state: &Arc<PendingExchange>) {
        let mut states = self.states.lock().unwrap();
        if states
            .get(&channel.id())
            .is_some_and(|current| Arc::ptr_eq(current, state))
        {
            states.remove(&channel.id());
        }
    }
}
