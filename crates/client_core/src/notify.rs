use shared::domain::{ConversationKey, Message};
use tracing::info;

use crate::config::ChatSettings;

#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    pub conversation: ConversationKey,
    pub message: Message,
    pub play_sound: bool,
}

impl Notification {
    /// Build the notification for an inbound message, or `None` when the
    /// user has notifications switched off.
    pub fn for_inbound(
        settings: &ChatSettings,
        conversation: ConversationKey,
        message: &Message,
    ) -> Option<Self> {
        if message.is_own_message || !settings.notifications_enabled {
            return None;
        }
        Some(Self {
            conversation,
            message: message.clone(),
            play_sound: settings.sound_enabled,
        })
    }
}

/// Local notification and sound sink.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: &Notification);
}

/// Writes notifications to the log. Used by headless front ends.
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, notification: &Notification) {
        info!(
            conversation = %notification.conversation,
            sender = %notification.message.sender_id,
            sound = notification.play_sound,
            "new message"
        );
    }
}
