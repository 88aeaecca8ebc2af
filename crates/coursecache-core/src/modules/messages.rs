//! Private messaging: send with offline fallback, cached reads, merged view.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::warn;

use crate::api::{TypeExpected, WsError};
use crate::cache::{ReadOptions, ResponseCache, UpdateFrequency};
use crate::offline::{EntityKey, PendingAction, SendOutcome};
use crate::site::SiteSession;
use crate::sync::{SyncHandler, SyncKind};

/// Offline queue component for outgoing messages. Entities are recipient user ids.
pub const COMPONENT: &str = "core_message";

pub const SEND_FUNCTION: &str = "core_message_send_instant_messages";
const CONVERSATIONS_FUNCTION: &str = "core_message_get_conversations";
const CONTACTS_FUNCTION: &str = "core_message_get_user_contacts";
const CONVERSATION_FUNCTION: &str = "core_message_get_conversation_between_users";

pub const DISCUSSIONS_KEY: &str = "discussions";
pub const CONTACTS_KEY: &str = "contacts";

/// `msgid` the server reports for a message it refused.
const REJECTED_MSGID: i64 = -1;

/// Plain text is stored as-is; 1 is HTML, what the server expects from mobile.
const TEXT_FORMAT_HTML: i64 = 1;

pub fn conversation_key(user_id: impl std::fmt::Display) -> String {
    format!("conversation:{}", user_id)
}

/// Sending a message makes the discussion list stale, and contacts derive from it.
pub fn register_cache_rules(cache: &ResponseCache) {
    cache.add_dependency(DISCUSSIONS_KEY, CONTACTS_KEY);
    cache.invalidate_on_write(SEND_FUNCTION, DISCUSSIONS_KEY);
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Message {
    #[serde(default)]
    pub id: Option<i64>,
    pub useridfrom: i64,
    pub text: String,
    pub timecreated: i64,
    /// Not yet accepted by the server.
    #[serde(default)]
    pub pending: bool,
    #[serde(default)]
    pub ordering_key: Option<u64>,
}

impl Message {
    fn from_pending(action: &PendingAction, my_user_id: i64) -> Self {
        Self {
            id: None,
            useridfrom: my_user_id,
            text: action.payload["text"].as_str().unwrap_or_default().to_string(),
            timecreated: action.payload["timecreated"]
                .as_i64()
                .unwrap_or_else(|| action.created_at.timestamp()),
            pending: true,
            ordering_key: Some(action.ordering_key),
        }
    }
}

/// Send a message, or queue it behind earlier unsent messages to the same user.
pub async fn send_message(site: &SiteSession, to_user_id: i64, text: &str) -> Result<SendOutcome, WsError> {
    let payload = json!({
        "touserid": to_user_id,
        "text": text,
        "timecreated": Utc::now().timestamp(),
    });
    let outcome = site
        .writer()
        .send_or_queue(COMPONENT, &to_user_id.to_string(), payload, |p| send_live(site, p))
        .await?;

    if let SendOutcome::Sent(_) = outcome {
        if let Err(e) = site.cache().invalidate(&conversation_key(to_user_id)) {
            warn!(to_user_id, error = %e, "Failed to invalidate conversation");
        }
    }
    Ok(outcome)
}

/// Send one message payload to the server.
pub async fn send_live(site: &SiteSession, payload: Value) -> Result<Value, WsError> {
    let params = json!({
        "messages": [{
            "touserid": payload["touserid"],
            "text": payload["text"],
            "textformat": TEXT_FORMAT_HTML,
        }]
    });
    let data = site
        .write(SEND_FUNCTION, params, site.presets_expecting(TypeExpected::Array))
        .await?;

    let first = data
        .get(0)
        .cloned()
        .ok_or_else(|| WsError::InvalidResponse("Empty send response".to_string()))?;
    if first.get("msgid").and_then(Value::as_i64) == Some(REJECTED_MSGID) {
        return Err(WsError::Service {
            errorcode: "messagenotsent".to_string(),
            message: first
                .get("errormessage")
                .and_then(Value::as_str)
                .unwrap_or("Message not sent")
                .to_string(),
        });
    }
    Ok(first)
}

fn require_user(site: &SiteSession) -> Result<i64, WsError> {
    site.user_id()
        .ok_or_else(|| WsError::Unauthorized("Session has no user id".to_string()))
}

pub async fn discussions(site: &SiteSession, options: &ReadOptions) -> Result<Value, WsError> {
    let userid = require_user(site)?;
    let options = options
        .clone()
        .with_key(DISCUSSIONS_KEY)
        .with_frequency(UpdateFrequency::Often);
    site.read(CONVERSATIONS_FUNCTION, json!({ "userid": userid }), &options)
        .await
}

pub async fn contacts(site: &SiteSession, options: &ReadOptions) -> Result<Value, WsError> {
    let userid = require_user(site)?;
    let options = options
        .clone()
        .with_key(CONTACTS_KEY)
        .with_frequency(UpdateFrequency::Often);
    site.read_with(
        CONTACTS_FUNCTION,
        json!({ "userid": userid }),
        &options,
        site.presets_expecting(TypeExpected::Array),
    )
    .await
}

/// Unsent messages to `user_id`, oldest first.
pub fn pending_messages(site: &SiteSession, user_id: i64) -> Vec<PendingAction> {
    site.offline().drain(COMPONENT, &user_id.to_string())
}

/// Conversation with `other_user_id`: server messages followed by unsent ones.
pub async fn conversation(
    site: &SiteSession,
    other_user_id: i64,
    options: &ReadOptions,
) -> Result<Vec<Message>, WsError> {
    let userid = require_user(site)?;
    let options = options.clone().with_key(conversation_key(other_user_id));
    let data = site
        .read(
            CONVERSATION_FUNCTION,
            json!({
                "userid": userid,
                "otheruserid": other_user_id,
                "includecontactrequests": false,
                "includeprivacyinfo": false,
                "newestmessagesfirst": false,
            }),
            &options,
        )
        .await?;

    let synced: Vec<Message> = serde_json::from_value(data.get("messages").cloned().unwrap_or(json!([])))?;
    Ok(merge_with_pending(synced, &pending_messages(site, other_user_id), userid))
}

/// Merge server messages with unsent ones for display.
///
/// Server messages keep timestamp order (stable on ties). Unsent messages
/// always come after them, in the order they were written, whatever their
/// timestamps say: the device clock is not comparable to the server's.
pub fn merge_with_pending(mut synced: Vec<Message>, pending: &[PendingAction], my_user_id: i64) -> Vec<Message> {
    synced.sort_by_key(|m| m.timecreated);

    let mut unsent: Vec<Message> = pending
        .iter()
        .map(|action| Message::from_pending(action, my_user_id))
        .collect();
    unsent.sort_by_key(|m| m.ordering_key);

    synced.extend(unsent);
    synced
}

/// Replays queued messages.
pub struct MessagesSync;

impl SyncHandler for MessagesSync {
    fn kind(&self) -> SyncKind {
        SyncKind::Messages
    }

    fn replay<'a>(
        &'a self,
        site: &'a SiteSession,
        action: &'a PendingAction,
    ) -> BoxFuture<'a, Result<Value, WsError>> {
        send_live(site, action.payload.clone()).boxed()
    }

    fn invalidated_keys(&self, entity: &EntityKey) -> Vec<String> {
        vec![DISCUSSIONS_KEY.to_string(), conversation_key(&entity.entity_id)]
    }
}
