use crate::correlation::CorrelationManager;
use crate::error::{Error, SharedError};
use crate::pipeline::ChannelHandler;
use crate::transport::Channel;
use std::net::SocketAddr;
use std::sync::Arc;
use tracing::{debug, warn};

/// Terminal handler of producer channels: routes replies and failures to
/// the pending exchange through the correlation manager.
pub(crate) struct ClientChannelHandler {
    pub(crate) correlation: Arc<dyn CorrelationManager>,
    pub(crate) address: String,
    pub(crate) sync: bool,
    pub(crate) disconnect: bool,
    pub(crate) disconnect_on_no_reply: bool,
    pub(crate) reuse_channel: bool,
}

impl ChannelHandler for ClientChannelHandler {
    fn message_received(&self, channel: &Channel, sender: SocketAddr, message: Vec<u8>) {
        let Some(state) = self.correlation.get_state_for_message(channel, &message) else {
            warn!(channel = %channel.id(), %sender, len = message.len(), "Reply without pending exchange, dropping");
            return;
        };
        debug!(channel = %channel.id(), %sender, len = message.len(), "Received reply");
        channel.set_read_timeout(None);

        let body = self.correlation.reply_body(message);
        if state.exchange().closes_channel(self.disconnect, self.reuse_channel) {
            debug!(channel = %channel.id(), "Closing channel after reply");
            channel.close();
        }
        self.correlation.discard_state(channel, &state);
        state.complete_with_reply(body);
    }

    fn exception_caught(&self, channel: &Channel, cause: SharedError) {
        let timed_out = cause.is_timeout();
        if let Some(state) = self.correlation.get_state_for_error(channel, &cause) {
            self.correlation.discard_state(channel, &state);
            if !(timed_out && !self.disconnect_on_no_reply) {
                channel.close();
            }
            state.fail_once(cause, false);
            return;
        }
        if timed_out && !self.disconnect_on_no_reply {
            debug!(channel = %channel.id(), %cause, "Timeout without pending exchange");
            return;
        }
        warn!(channel = %channel.id(), %cause, "Closing producer channel after error");
        channel.close();
    }

    fn channel_inactive(&self, channel: &Channel) {
        if self.sync {
            if let Some(state) = self.correlation.get_state_for_error(channel, &Error::ChannelClosed) {
                if !state.is_done() {
                    self.correlation.discard_state(channel, &state);
                    state.fail_once(
                        Arc::new(Error::NoResponse {
                            address: self.address.clone(),
                        }),
                        false,
                    );
                }
            }
        }
        self.correlation.remove_state(channel);
    }
}
