//! What a notification click does.
//!
//! Delivery is the platform's job; the core only maps a clicked notification
//! to a targeted sync and a place to go.

use serde::{Deserialize, Serialize};

use crate::modules::{assign, messages};
use crate::sync::{SyncKind, SyncTrigger};

/// Notification names that carry a private message.
const MESSAGE_NOTIFICATIONS: &[&str] = &["instantmessage", "messagecontactrequests"];

/// Payload of a clicked notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct PushNotification {
    pub site_id: String,
    /// Frankenstyle component, e.g. `core_message` or `mod_assign`.
    pub component: String,
    /// Notification name, e.g. `instantmessage`.
    #[serde(default)]
    pub name: Option<String>,
    /// The conversation partner, assignment, etc. the notification is about.
    #[serde(default)]
    pub entity_id: Option<String>,
    #[serde(default)]
    pub context_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Destination {
    Conversation { user_id: String },
    Assignment { assign_id: String },
    Url(String),
    Notifications,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ClickAction {
    pub site_id: String,
    /// Sync to run before showing the destination.
    pub sync: Option<(SyncKind, SyncTrigger)>,
    pub destination: Destination,
}

pub fn decide_click(notification: &PushNotification) -> ClickAction {
    let is_message = notification.component == messages::COMPONENT
        || notification
            .name
            .as_deref()
            .is_some_and(|name| MESSAGE_NOTIFICATIONS.contains(&name));

    let targeted = |kind: SyncKind, entity_id: &str| {
        Some((
            kind,
            SyncTrigger::Push {
                entity_id: entity_id.to_string(),
            },
        ))
    };

    let (sync, destination) = match notification.entity_id.as_deref() {
        Some(id) if is_message => (
            targeted(SyncKind::Messages, id),
            Destination::Conversation {
                user_id: id.to_string(),
            },
        ),
        Some(id) if notification.component == assign::COMPONENT => (
            targeted(SyncKind::AssignSubmissions, id),
            Destination::Assignment {
                assign_id: id.to_string(),
            },
        ),
        _ => match notification.context_url {
            Some(ref url) => (None, Destination::Url(url.clone())),
            None => (None, Destination::Notifications),
        },
    };

    ClickAction {
        site_id: notification.site_id.clone(),
        sync,
        destination,
    }
}
