//! Assignment submissions with offline fallback, plus grading lists.

use chrono::Utc;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::api::{TypeExpected, WsError};
use crate::cache::ReadOptions;
use crate::offline::{EntityKey, PendingAction, SendOutcome};
use crate::site::SiteSession;
use crate::sync::{SyncHandler, SyncKind};

/// Offline queue component for submissions. Entities are assignment ids.
pub const COMPONENT: &str = "mod_assign";

const SAVE_FUNCTION: &str = "mod_assign_save_submission";
const STATUS_FUNCTION: &str = "mod_assign_get_submission_status";
const SUBMISSIONS_FUNCTION: &str = "mod_assign_get_submissions";
const PARTICIPANTS_FUNCTION: &str = "mod_assign_list_participants";

/// Status given to participants with no submission record yet.
const STATUS_NEW: &str = "new";

pub fn status_key(assign_id: impl std::fmt::Display) -> String {
    format!("mod_assign:{}:status", assign_id)
}

pub fn submissions_key(assign_id: impl std::fmt::Display) -> String {
    format!("mod_assign:{}:submissions", assign_id)
}

pub fn participants_key(assign_id: impl std::fmt::Display) -> String {
    format!("mod_assign:{}:participants", assign_id)
}

/// A submission as reported by `mod_assign_get_submissions`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Submission {
    pub id: i64,
    /// Zero when identities are hidden.
    #[serde(default)]
    pub userid: i64,
    #[serde(default)]
    pub blindid: Option<i64>,
    #[serde(default)]
    pub status: String,
}

/// A row of `mod_assign_list_participants`. Under blind marking `id` is the
/// anonymous participant id and `fullname` is withheld.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct Participant {
    pub id: i64,
    #[serde(default)]
    pub fullname: Option<String>,
}

/// A gradable row: one per participant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[cfg_attr(feature = "ts", derive(ts_rs::TS))]
pub struct SubmissionUser {
    /// Real user id; `None` under blind marking.
    pub user_id: Option<i64>,
    /// Anonymous id; set only under blind marking.
    pub blind_id: Option<i64>,
    pub fullname: Option<String>,
    pub submission_id: Option<i64>,
    pub status: String,
}

/// Match submissions to participants.
///
/// The participant list decides who appears and under which id: a submission
/// is attached to the participant it matches, submissions matching nobody are
/// dropped, and ids reported by the submission itself are never exposed.
/// Under blind marking the match is on `blindid` and names stay hidden.
pub fn resolve_submission_users(
    submissions: &[Submission],
    participants: &[Participant],
    blind_marking: bool,
) -> Vec<SubmissionUser> {
    participants
        .iter()
        .map(|participant| {
            let submission = submissions.iter().find(|s| {
                if blind_marking {
                    s.blindid == Some(participant.id)
                } else {
                    s.userid == participant.id
                }
            });

            SubmissionUser {
                user_id: (!blind_marking).then_some(participant.id),
                blind_id: blind_marking.then_some(participant.id),
                fullname: if blind_marking {
                    None
                } else {
                    participant.fullname.clone()
                },
                submission_id: submission.map(|s| s.id),
                status: submission
                    .map(|s| s.status.clone())
                    .unwrap_or_else(|| STATUS_NEW.to_string()),
            }
        })
        .collect()
}

/// Save a submission draft. Offline, it replaces any draft already pending
/// for the assignment.
pub async fn save_submission(site: &SiteSession, assign_id: i64, plugindata: Value) -> Result<SendOutcome, WsError> {
    let payload = json!({
        "assignmentid": assign_id,
        "plugindata": plugindata,
        "timemodified": Utc::now().timestamp(),
    });
    let outcome = site
        .writer()
        .send_or_replace(COMPONENT, &assign_id.to_string(), payload, |p| send_live(site, p))
        .await?;

    if let SendOutcome::Sent(_) = outcome {
        invalidate_assignment(site, &assign_id.to_string());
    }
    Ok(outcome)
}

/// Send one submission payload. Warnings in the answer mean the server refused it.
pub async fn send_live(site: &SiteSession, payload: Value) -> Result<Value, WsError> {
    let params = json!({
        "assignmentid": payload["assignmentid"],
        "plugindata": payload["plugindata"],
    });
    let presets = site.presets_expecting(TypeExpected::Any).allow_empty();
    let data = site.write(SAVE_FUNCTION, params, presets).await?;

    let warnings = data
        .as_array()
        .or_else(|| data.get("warnings").and_then(Value::as_array));
    if let Some(warning) = warnings.and_then(|w| w.first()) {
        return Err(WsError::Service {
            errorcode: warning
                .get("warningcode")
                .and_then(Value::as_str)
                .unwrap_or("savesubmissionfailed")
                .to_string(),
            message: warning
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("Submission not saved")
                .to_string(),
        });
    }
    Ok(data)
}

fn invalidate_assignment(site: &SiteSession, assign_id: &str) {
    for key in [status_key(assign_id), submissions_key(assign_id)] {
        if let Err(e) = site.cache().invalidate(&key) {
            warn!(key = %key, error = %e, "Failed to invalidate assignment cache");
        }
    }
}

pub async fn submission_status(site: &SiteSession, assign_id: i64, options: &ReadOptions) -> Result<Value, WsError> {
    let options = options.clone().with_key(status_key(assign_id));
    site.read(STATUS_FUNCTION, json!({ "assignid": assign_id }), &options)
        .await
}

/// The pending draft for an assignment, if any.
pub fn pending_submission(site: &SiteSession, assign_id: i64) -> Option<PendingAction> {
    site.offline().drain(COMPONENT, &assign_id.to_string()).pop()
}

/// Participants of an assignment with their submissions attached.
pub async fn submissions_for_grading(
    site: &SiteSession,
    assign_id: i64,
    blind_marking: bool,
    options: &ReadOptions,
) -> Result<Vec<SubmissionUser>, WsError> {
    let data = site
        .read(
            SUBMISSIONS_FUNCTION,
            json!({ "assignmentids": [assign_id] }),
            &options.clone().with_key(submissions_key(assign_id)),
        )
        .await?;
    let submissions: Vec<Submission> = data
        .get("assignments")
        .and_then(Value::as_array)
        .and_then(|list| {
            list.iter()
                .find(|a| a.get("assignmentid").and_then(Value::as_i64) == Some(assign_id))
        })
        .and_then(|a| a.get("submissions").cloned())
        .map(serde_json::from_value)
        .transpose()?
        .unwrap_or_default();

    let participants = site
        .read_with(
            PARTICIPANTS_FUNCTION,
            json!({ "assignid": assign_id, "groupid": 0, "filter": "" }),
            &options.clone().with_key(participants_key(assign_id)),
            site.presets_expecting(TypeExpected::Array),
        )
        .await?;
    let participants: Vec<Participant> = serde_json::from_value(participants)?;

    debug!(
        assign_id,
        submissions = submissions.len(),
        participants = participants.len(),
        "Resolving submissions"
    );
    Ok(resolve_submission_users(&submissions, &participants, blind_marking))
}

/// Replays queued submission drafts.
pub struct AssignSync;

impl SyncHandler for AssignSync {
    fn kind(&self) -> SyncKind {
        SyncKind::AssignSubmissions
    }

    fn replay<'a>(
        &'a self,
        site: &'a SiteSession,
        action: &'a PendingAction,
    ) -> BoxFuture<'a, Result<Value, WsError>> {
        send_live(site, action.payload.clone()).boxed()
    }

    fn invalidated_keys(&self, entity: &EntityKey) -> Vec<String> {
        vec![status_key(&entity.entity_id), submissions_key(&entity.entity_id)]
    }
}
