use shared::domain::{Message, Username};
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NotificationPermission {
    #[default]
    Undecided,
    Granted,
    Denied,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Notification {
    Sound,
    Desktop { title: String, body: String },
}

/// Platform side effects for incoming messages.
pub trait NotificationSink: Send + Sync {
    fn play_sound(&self);
    fn show(&self, title: &str, body: &str);

    fn deliver(&self, notification: &Notification) {
        match notification {
            Notification::Sound => self.play_sound(),
            Notification::Desktop { title, body } => self.show(title, body),
        }
    }
}

pub struct LoggingNotificationSink;

impl NotificationSink for LoggingNotificationSink {
    fn play_sound(&self) {
        info!("notify: sound cue");
    }

    fn show(&self, title: &str, body: &str) {
        info!(title, body, "notify: desktop notification");
    }
}

/// Decides the side effects of one new-message event.
///
/// Messages from the selected peer are already on screen and messages the
/// owner authored need no alert. There is no dedup window: every event yields
/// its own notifications.
pub fn notifications_for(
    message: &Message,
    owner: &Username,
    selected: Option<&Username>,
    permission: NotificationPermission,
    preview_chars: usize,
) -> Vec<Notification> {
    if &message.sender == owner || selected == Some(&message.sender) {
        return Vec::new();
    }
    let mut notifications = vec![Notification::Sound];
    if permission == NotificationPermission::Granted {
        notifications.push(Notification::Desktop {
            title: format!("New message from {}", message.sender),
            body: preview(&message.content, preview_chars),
        });
    }
    notifications
}

pub fn preview(content: &str, max_chars: usize) -> String {
    if content.chars().count() <= max_chars {
        return content.to_string();
    }
    let mut truncated: String = content.chars().take(max_chars.saturating_sub(1)).collect();
    truncated.push('…');
    truncated
}
