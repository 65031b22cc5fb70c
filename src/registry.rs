//! Channel groups: the open channels of one listener or producer.

use crate::transport::{Channel, ChannelGroupFuture, ChannelId};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, Weak};
use tracing::debug;

struct GroupInner {
    name: String,
    channels: Mutex<HashMap<ChannelId, Channel>>,
}

/// A named set of open channels that can be closed as a unit.
///
/// Channels leave the group on their own when they close. Cloning yields
/// another handle to the same group.
#[derive(Clone)]
pub struct ChannelGroup {
    inner: Arc<GroupInner>,
}

impl ChannelGroup {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(GroupInner {
                name: name.into(),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Adds `channel`; returns false if it was already a member.
    pub fn add(&self, channel: &Channel) -> bool {
        let inserted = self
            .inner
            .channels
            .lock()
            .unwrap()
            .insert(channel.id(), channel.clone())
            .is_none();
        if inserted {
            debug!(group = %self.inner.name, channel = %channel.id(), "Added channel to group");
            let group = Arc::downgrade(&self.inner);
            let id = channel.id();
            channel.close_future().add_listener(move |_| remove_closed(&group, id));
        }
        inserted
    }

    pub fn remove(&self, channel: &Channel) -> bool {
        self.inner
            .channels
            .lock()
            .unwrap()
            .remove(&channel.id())
            .is_some()
    }

    pub fn contains(&self, channel: &Channel) -> bool {
        self.inner.channels.lock().unwrap().contains_key(&channel.id())
    }

    pub fn len(&self) -> usize {
        self.inner.channels.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.channels.lock().unwrap().is_empty()
    }

    /// Snapshot of the current members.
    pub fn channels(&self) -> Vec<Channel> {
        self.inner.channels.lock().unwrap().values().cloned().collect()
    }

    /// Closes every member. The returned future completes when all of them
    /// have been released by their event loops.
    pub fn close(&self) -> ChannelGroupFuture {
        let channels = self.channels();
        debug!(group = %self.inner.name, count = channels.len(), "Closing channel group");
        ChannelGroupFuture::new(channels.iter().map(Channel::close).collect())
    }
}

fn remove_closed(group: &Weak<GroupInner>, id: ChannelId) {
    if let Some(group) = group.upgrade() {
        group.channels.lock().unwrap().remove(&id);
    }
}

impl fmt::Debug for ChannelGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelGroup")
            .field("name", &self.inner.name)
            .field("len", &self.len())
            .finish()
    }
}
