use crate::config::ListenerConfiguration;
use crate::error::Error;
use crate::executor::ThreadFactory;
use crate::registry::ChannelGroup;
use crate::transport::EventLoopGroup;
use std::sync::Arc;
use tracing::debug;

/// Resources shared between endpoints, passed explicitly instead of held in
/// globals.
///
/// Supplied event loop groups are used as they are and never shut down by
/// the components that borrow them. Channels are added to `channel_group`
/// in addition to the component's own group.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub boss_group: Option<Arc<EventLoopGroup>>,
    pub worker_group: Option<Arc<EventLoopGroup>>,
    pub channel_group: Option<ChannelGroup>,
    pub thread_factory: Option<ThreadFactory>,
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_boss_group(mut self, group: Arc<EventLoopGroup>) -> Self {
        self.boss_group = Some(group);
        self
    }

    pub fn with_worker_group(mut self, group: Arc<EventLoopGroup>) -> Self {
        self.worker_group = Some(group);
        self
    }

    pub fn with_channel_group(mut self, group: ChannelGroup) -> Self {
        self.channel_group = Some(group);
        self
    }

    pub fn with_thread_factory(mut self, threads: ThreadFactory) -> Self {
        self.thread_factory = Some(threads);
        self
    }
}

/// Boss and worker groups in use by one component, remembering which of
/// them it created.
pub(crate) struct ExecutionPools {
    boss: Arc<EventLoopGroup>,
    owns_boss: bool,
    workers: Arc<EventLoopGroup>,
    owns_workers: bool,
}

impl ExecutionPools {
    pub(crate) fn acquire(
        context: &ExecutionContext,
        threads: &ThreadFactory,
        config: &ListenerConfiguration,
    ) -> Result<Self, Error> {
        let (boss, owns_boss) = match &context.boss_group {
            Some(group) => (Arc::clone(group), false),
            None => (
                Arc::new(EventLoopGroup::new("boss", config.effective_boss_count(), threads)?),
                true,
            ),
        };
        let (workers, owns_workers) = match &context.worker_group {
            Some(group) => (Arc::clone(group), false),
            None => {
                let created = EventLoopGroup::new("worker", config.effective_worker_count(), threads);
                match created {
                    Ok(group) => (Arc::new(group), true),
                    Err(err) => {
                        if owns_boss {
                            boss.shutdown_gracefully();
                        }
                        return Err(err);
                    }
                }
            }
        };
        debug!(
            boss = boss.len(),
            owns_boss,
            workers = workers.len(),
            owns_workers,
            "Acquired event loop groups"
        );
        Ok(Self {
            boss,
            owns_boss,
            workers,
            owns_workers,
        })
    }

    pub(crate) fn boss(&self) -> &Arc<EventLoopGroup> {
        &self.boss
    }

    pub(crate) fn workers(&self) -> &Arc<EventLoopGroup> {
        &self.workers
    }

    /// Shuts down the groups this component created.
    pub(crate) fn release(self) {
        if self.owns_boss {
            self.boss.shutdown_gracefully();
        }
        if self.owns_workers {
            self.workers.shutdown_gracefully();
        }
    }
}
