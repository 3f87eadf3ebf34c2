//! Result classification and idempotent callbacks.
//!
//! Workers report outcomes as free-form text. A narrow classification
//! function maps that text onto a closed enum, and the callback handler
//! applies *at most one* side effect per task outcome — the ones nothing
//! else owns (connection-status flips, credit decrements). The task row's
//! own status is written by the dispatcher, never here.
//!
//! The marker text overrides the HTTP-level success flag: a 2xx response
//! whose text matches a failure marker is still a failure.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::dispatch::task::TaskRecord;
use crate::error::DatabaseError;
use crate::store::Database;

/// Closed classification of a worker's result text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultClass {
    /// Text matches an explicit success phrase.
    Success,
    /// Worker reports the platform session was disconnected.
    Disconnected,
    /// Text matches an explicit failure code or a clarifying question.
    PermanentError,
    /// No marker matched; no side effect may be applied.
    Ambiguous,
}

/// Marker phrase lists. These are heuristic and evolve with the worker's
/// output format, so they are configuration rather than hard-coded logic.
#[derive(Debug, Clone)]
pub struct ClassifierRules {
    /// Substring signalling a lost platform session.
    pub disconnect_marker: String,
    /// Explicit failure codes and clarifying-question fragments. Checked
    /// before success phrases.
    pub failure_markers: Vec<String>,
    /// Strict allow-list of success phrases.
    pub success_markers: Vec<String>,
    /// Markers confirming a login/verify task established a session.
    pub connect_markers: Vec<String>,
}

impl Default for ClassifierRules {
    fn default() -> Self {
        Self {
            disconnect_marker: "DISCONNECTED".to_string(),
            failure_markers: [
                "error:",
                "video_not_found",
                "comment_not_found",
                "comments_disabled",
                "login_required",
                "reply_blocked",
                "error_max_turns",
                "which comment would you like",
                "which comment should i",
                "i can see several comments",
                "i can see comments from",
                "err_tunnel",
                "err_connection",
                "no internet",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            success_markers: [
                "reply:success",
                "successfully posted",
                "successfully replied",
                "reply has been posted",
                "reply was posted",
                "posted successfully",
                "0 seconds ago",
                "1 second ago",
            ]
            .into_iter()
            .map(String::from)
            .collect(),
            connect_markers: ["LOGIN_SUCCESS", "ALREADY_LOGGED", "VERIFIED"]
                .into_iter()
                .map(String::from)
                .collect(),
        }
    }
}

impl ClassifierRules {
    /// Classify a worker's result text.
    ///
    /// Disconnect and failure markers are checked before success phrases so
    /// partial successes never count. Text with no marker at all is
    /// `Ambiguous`, which applies no side effect.
    pub fn classify(&self, result_text: &str) -> ResultClass {
        if result_text.contains(&self.disconnect_marker) {
            return ResultClass::Disconnected;
        }

        let lower = result_text.to_lowercase();
        if self.failure_markers.iter().any(|m| lower.contains(m)) {
            return ResultClass::PermanentError;
        }
        if self.success_markers.iter().any(|m| lower.contains(m)) {
            return ResultClass::Success;
        }
        ResultClass::Ambiguous
    }

    /// Whether a login/verify result confirms an established session.
    /// Matched case-sensitively: these are protocol markers, not prose.
    pub fn confirms_connection(&self, result_text: &str) -> bool {
        self.connect_markers.iter().any(|m| result_text.contains(m))
    }
}

/// Which single side effect a callback pass applied.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppliedEffect {
    None,
    MarkedDisconnected,
    MarkedConnected,
    DecrementedCredits,
}

/// Applies the unique side effects of a task outcome.
pub struct CallbackHandler {
    db: Arc<dyn Database>,
    rules: ClassifierRules,
}

impl CallbackHandler {
    pub fn new(db: Arc<dyn Database>, rules: ClassifierRules) -> Self {
        Self { db, rules }
    }

    pub fn rules(&self) -> &ClassifierRules {
        &self.rules
    }

    /// Inspect the result text and apply at most one side effect.
    ///
    /// Order matters: a disconnect marker wins over everything, so a
    /// disconnected session can never decrement credits. Credit decrements
    /// additionally require the task's metadata to tag it as
    /// consumption-relevant (`reply_kind = "product"`).
    pub async fn apply(
        &self,
        task: &TaskRecord,
        result_text: &str,
    ) -> Result<AppliedEffect, DatabaseError> {
        let class = self.rules.classify(result_text);

        if class == ResultClass::Disconnected {
            info!(tenant_id = %task.tenant_id, "callback: session disconnected");
            self.db
                .set_connection_status(&task.tenant_id, false, Some("Session disconnected"))
                .await?;
            return Ok(AppliedEffect::MarkedDisconnected);
        }

        if matches!(task.task_type.as_str(), "login" | "verify")
            && self.rules.confirms_connection(result_text)
        {
            info!(tenant_id = %task.tenant_id, task_type = %task.task_type, "callback: session connected");
            self.db
                .set_connection_status(&task.tenant_id, true, None)
                .await?;
            return Ok(AppliedEffect::MarkedConnected);
        }

        if task.task_type == "comment_reply" && class == ResultClass::Success {
            let reply_kind = task
                .metadata
                .get("reply_kind")
                .and_then(|v| v.as_str())
                .unwrap_or("product");
            if reply_kind == "product" {
                let remaining = self.db.decrement_credits(&task.tenant_id).await?;
                info!(tenant_id = %task.tenant_id, remaining, "callback: credits decremented");
                return Ok(AppliedEffect::DecrementedCredits);
            }
            debug!(tenant_id = %task.tenant_id, reply_kind, "callback: reply not credit-relevant");
            return Ok(AppliedEffect::None);
        }

        if class == ResultClass::Ambiguous && !result_text.is_empty() {
            warn!(
                task_id = %task.id,
                task_type = %task.task_type,
                "callback: result text matched no marker, no side effect applied"
            );
        }
        Ok(AppliedEffect::None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rules() -> ClassifierRules {
        ClassifierRules::default()
    }

    #[test]
    fn explicit_success_phrases() {
        assert_eq!(
            rules().classify("The reply has been posted, visible 0 seconds ago"),
            ResultClass::Success
        );
        assert_eq!(rules().classify("REPLY:SUCCESS"), ResultClass::Success);
    }

    #[test]
    fn failure_wins_over_success() {
        // A clarifying question means nothing was posted, even if the text
        // also contains an optimistic phrase.
        assert_eq!(
            rules().classify("Which comment would you like? I could have successfully posted either"),
            ResultClass::PermanentError
        );
    }

    #[test]
    fn disconnect_wins_over_everything() {
        assert_eq!(
            rules().classify("DISCONNECTED - successfully posted earlier"),
            ResultClass::Disconnected
        );
    }

    #[test]
    fn error_codes_are_permanent() {
        assert_eq!(rules().classify("VIDEO_NOT_FOUND"), ResultClass::PermanentError);
        assert_eq!(
            rules().classify("ERR_TUNNEL_CONNECTION_FAILED"),
            ResultClass::PermanentError
        );
    }

    #[test]
    fn unmatched_text_is_ambiguous() {
        assert_eq!(
            rules().classify("I navigated to the page and read the comments"),
            ResultClass::Ambiguous
        );
        assert_eq!(rules().classify(""), ResultClass::Ambiguous);
    }

    #[test]
    fn connect_markers_are_case_sensitive() {
        assert!(rules().confirms_connection("LOGIN_SUCCESS after entering code"));
        assert!(!rules().confirms_connection("login_success"));
    }
}
