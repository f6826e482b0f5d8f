use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::timeout;
use tracing::warn;

use crate::payload::ActionType;
use crate::session::SessionId;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OptionKind {
    AllowOnce,
    AllowAlways,
    RejectOnce,
}

impl OptionKind {
    /// Normalizes a protocol's literal option-id vocabulary into the
    /// canonical three-way kind:
    /// `allow|approve|accept` → allow_once,
    /// `allowAlways|approveAlways|acceptForSession` → allow_always,
    /// `deny|reject|decline` → reject_once.
    pub fn from_option_id(option_id: &str) -> Option<Self> {
        match option_id {
            "allow" | "approve" | "accept" => Some(OptionKind::AllowOnce),
            "allowAlways" | "approveAlways" | "acceptForSession" => Some(OptionKind::AllowAlways),
            "deny" | "reject" | "decline" => Some(OptionKind::RejectOnce),
            _ => None,
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, OptionKind::AllowOnce | OptionKind::AllowAlways)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionOption {
    pub option_id: String,
    pub name: String,
    pub kind: OptionKind,
}

/// An out-of-band request to approve or deny a tool invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionRequest {
    pub session_id: SessionId,
    pub tool_call_id: String,
    /// Opaque correlation key chosen by the source protocol where available
    /// (e.g. the stream-json `control_request` id, the Codex approval
    /// request id).
    pub pending_id: String,
    pub title: String,
    pub action_type: ActionType,
    pub action_details: String,
    pub options: Vec<PermissionOption>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PermissionResponse {
    pub option_id: Option<String>,
    pub cancelled: bool,
}

impl PermissionResponse {
    pub fn cancelled() -> Self {
        Self {
            option_id: None,
            cancelled: true,
        }
    }

    pub fn allow(option_id: impl Into<String>) -> Self {
        Self {
            option_id: Some(option_id.into()),
            cancelled: false,
        }
    }
}

/// Consumer-supplied callback that arbitrates a [`PermissionRequest`].
///
/// Called synchronously from the adapter's decoder/actor task: must
/// not call back into the adapter for reads, or the decoder deadlocks
/// against itself. Implementations that need to hop to another task are
/// free to do so internally as long as this trait's `handle` future still
/// resolves once the decision is made.
#[async_trait::async_trait]
pub trait PermissionHandler: Send + Sync {
    async fn handle(&self, request: PermissionRequest) -> Result<PermissionResponse, String>;
}

/// The three ways a permission round can resolve, used by adapters to decide
/// what to encode back to the upstream agent.
#[derive(Debug, Clone, PartialEq)]
pub enum ArbitrationOutcome {
    Decision(PermissionResponse),
    /// The configured deadline elapsed before the handler replied.
    TimedOut,
    /// The adapter was closed (or its internal context cancelled) while the
    /// handler was pending.
    Cancelled,
}

/// No-handler auto-approval policy, parameterized
/// per adapter since Codex/Copilot always auto-approve while stream-json/ACP
/// approve the first allow-kinded option and everything else denies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoHandlerPolicy {
    /// Approve the first option whose kind is allow-shaped; if none, approve
    /// the first option outright (used by ACP).
    FirstAllowOrFirstOption,
    /// Always approve regardless of options (Codex, Copilot).
    AlwaysApprove,
    /// Always deny.
    AlwaysDeny,
}

/// Drives one permission round to a resolution, handling the no-handler
/// default, the timeout (stream-json's `permission_timeout`), and
/// cancellation via a dropped oneshot.
pub struct PermissionArbiter;

impl PermissionArbiter {
    /// Arbitrates `request` against `handler` (if any), honoring `deadline`
    /// and `cancel` (a oneshot receiver dropped by `Close`).
    pub async fn arbitrate(
        handler: Option<&dyn PermissionHandler>,
        request: PermissionRequest,
        deadline: Option<Duration>,
        mut cancel: oneshot::Receiver<()>,
        no_handler_policy: NoHandlerPolicy,
    ) -> ArbitrationOutcome {
        let Some(handler) = handler else {
            return ArbitrationOutcome::Decision(Self::apply_no_handler_policy(
                &request,
                no_handler_policy,
            ));
        };

        let call = handler.handle(request.clone());
        let outcome = async {
            tokio::select! {
                biased;
                _ = &mut cancel => ArbitrationOutcome::Cancelled,
                result = call => match result {
                    Ok(response) => ArbitrationOutcome::Decision(response),
                    Err(message) => {
                        warn!(error = %message, pending_id = %request.pending_id, "permission handler returned an error");
                        ArbitrationOutcome::Decision(PermissionResponse::cancelled())
                    }
                },
            }
        };

        match deadline {
            Some(deadline) => match timeout(deadline, outcome).await {
                Ok(outcome) => outcome,
                Err(_) => ArbitrationOutcome::TimedOut,
            },
            None => outcome.await,
        }
    }

    fn apply_no_handler_policy(
        request: &PermissionRequest,
        policy: NoHandlerPolicy,
    ) -> PermissionResponse {
        match policy {
            NoHandlerPolicy::AlwaysApprove => request
                .options
                .first()
                .map(|opt| PermissionResponse::allow(opt.option_id.clone()))
                .unwrap_or_else(|| PermissionResponse::allow("allow")),
            NoHandlerPolicy::AlwaysDeny => PermissionResponse::cancelled(),
            NoHandlerPolicy::FirstAllowOrFirstOption => request
                .options
                .iter()
                .find(|opt| opt.kind.is_allow())
                .or_else(|| request.options.first())
                .map(|opt| PermissionResponse::allow(opt.option_id.clone()))
                .unwrap_or_else(|| PermissionResponse::cancelled()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::oneshot;

    fn sample_request(options: Vec<PermissionOption>) -> PermissionRequest {
        PermissionRequest {
            session_id: SessionId::from_upstream("s1"),
            tool_call_id: "t1".into(),
            pending_id: "p1".into(),
            title: "Run command".into(),
            action_type: ActionType::Command,
            action_details: "rm -rf /tmp/x".into(),
            options,
        }
    }

    struct SlowHandler(Duration);

    #[async_trait::async_trait]
    impl PermissionHandler for SlowHandler {
        async fn handle(&self, _request: PermissionRequest) -> Result<PermissionResponse, String> {
            tokio::time::sleep(self.0).await;
            Ok(PermissionResponse::allow("allow"))
        }
    }

    #[tokio::test]
    async fn no_handler_first_allow_or_first_option() {
        let request = sample_request(vec![
            PermissionOption {
                option_id: "deny".into(),
                name: "Deny".into(),
                kind: OptionKind::RejectOnce,
            },
            PermissionOption {
                option_id: "allowAlways".into(),
                name: "Allow always".into(),
                kind: OptionKind::AllowAlways,
            },
        ]);
        let (_tx, cancel) = oneshot::channel();
        let outcome = PermissionArbiter::arbitrate(
            None,
            request,
            None,
            cancel,
            NoHandlerPolicy::FirstAllowOrFirstOption,
        )
            .await;
        assert_eq!(
            outcome,
            ArbitrationOutcome::Decision(PermissionResponse::allow("allowAlways"))
        );
    }

    #[tokio::test]
    async fn timeout_fires_before_slow_handler_returns() {
        let request = sample_request(vec![]);
        let (_tx, cancel) = oneshot::channel();
        let handler = SlowHandler(Duration::from_millis(200));
        let outcome = PermissionArbiter::arbitrate(
            Some(&handler),
            request,
            Some(Duration::from_millis(20)),
            cancel,
            NoHandlerPolicy::AlwaysDeny,
        )
            .await;
        assert_eq!(outcome, ArbitrationOutcome::TimedOut);
    }

    #[tokio::test]
    async fn dropping_cancel_sender_cancels_pending_handler() {
        let request = sample_request(vec![]);
        let (tx, cancel) = oneshot::channel();
        let handler = SlowHandler(Duration::from_secs(5));
        let arbitration = PermissionArbiter::arbitrate(
            Some(&handler),
            request,
            None,
            cancel,
            NoHandlerPolicy::AlwaysDeny,
        );
        drop(tx);
        let outcome = arbitration.await;
        assert_eq!(outcome, ArbitrationOutcome::Cancelled);
    }
}
