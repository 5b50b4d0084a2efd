/// Broadcast payloads and delivery contracts for scriptd
///
/// This crate holds the types that leave the orchestration core on their way
/// to observers (action button states, UI dialog requests), so transports can
/// depend on them without pulling in the host runtime.
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

// ============================================================================
// Action States
// ============================================================================

/// State of an action button
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionState {
    Enabled,
    Disabled,
    Loading,
}

impl fmt::Display for ActionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionState::Enabled => write!(f, "enabled"),
            ActionState::Disabled => write!(f, "disabled"),
            ActionState::Loading => write!(f, "loading"),
        }
    }
}

/// One row of the action state table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionStateEntry {
    pub slug: String,
    pub state: ActionState,
}

impl ActionStateEntry {
    pub fn new(slug: impl Into<String>, state: ActionState) -> Self {
        Self {
            slug: slug.into(),
            state,
        }
    }
}

// ============================================================================
// UI Dialogs
// ============================================================================

/// Kind of interactive dialog
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DialogKind {
    Alert,
    Toast,
    Confirm,
    Prompt,
    Form,
}

impl DialogKind {
    /// Whether the dialog expects a response routed back to a callback
    pub fn expects_response(&self) -> bool {
        matches!(
            self,
            DialogKind::Confirm | DialogKind::Prompt | DialogKind::Form
        )
    }

    /// Whether the pending entry survives its first response
    pub fn is_persistent(&self) -> bool {
        matches!(self, DialogKind::Form)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DialogKind::Alert => "alert",
            DialogKind::Toast => "toast",
            DialogKind::Confirm => "confirm",
            DialogKind::Prompt => "prompt",
            DialogKind::Form => "form",
        }
    }
}

impl fmt::Display for DialogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for DialogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "alert" => Ok(DialogKind::Alert),
            "toast" => Ok(DialogKind::Toast),
            "confirm" => Ok(DialogKind::Confirm),
            "prompt" => Ok(DialogKind::Prompt),
            "form" => Ok(DialogKind::Form),
            other => Err(format!("unknown dialog kind '{}'", other)),
        }
    }
}

/// Payload pushed to a session for a dialog
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UiRequestPayload {
    /// Correlation id; absent for fire-and-forget dialogs
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub dialog_type: DialogKind,
    pub options: Value,
}

// ============================================================================
// Delivery
// ============================================================================

/// Push-delivery collaborator addressed by project and session
pub trait Broadcaster: Send + Sync {
    /// Publish the full action state table to every observer of a project
    fn broadcast_action_states(&self, project_id: &str, states: &[ActionStateEntry]);

    /// Deliver a dialog request to one session
    fn send_ui_request(&self, project_id: &str, session_id: &str, payload: UiRequestPayload);
}

/// Everything a broadcaster can be asked to deliver
#[derive(Debug, Clone, PartialEq)]
pub enum BroadcastEvent {
    ActionStates {
        project_id: String,
        states: Vec<ActionStateEntry>,
    },
    UiRequest {
        project_id: String,
        session_id: String,
        payload: UiRequestPayload,
    },
}

/// Broadcaster that forwards into a channel.
///
/// A transport task (WebSocket hub, SSE fan-out) drains the receiver.
#[derive(Debug, Clone)]
pub struct ChannelBroadcaster {
    sender: UnboundedSender<BroadcastEvent>,
}

impl ChannelBroadcaster {
    pub fn new() -> (Self, UnboundedReceiver<BroadcastEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    pub fn from_sender(sender: UnboundedSender<BroadcastEvent>) -> Self {
        Self { sender }
    }
}

impl Broadcaster for ChannelBroadcaster {
    fn broadcast_action_states(&self, project_id: &str, states: &[ActionStateEntry]) {
        let _ = self.sender.send(BroadcastEvent::ActionStates {
            project_id: project_id.to_string(),
            states: states.to_vec(),
        });
    }

    fn send_ui_request(&self, project_id: &str, session_id: &str, payload: UiRequestPayload) {
        let _ = self.sender.send(BroadcastEvent::UiRequest {
            project_id: project_id.to_string(),
            session_id: session_id.to_string(),
            payload,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_wire_shape() {
        let payload = UiRequestPayload {
            request_id: Some("abc".to_string()),
            dialog_type: DialogKind::Confirm,
            options: json!({"title": "Sure?"}),
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({"requestId": "abc", "dialogType": "confirm", "options": {"title": "Sure?"}})
        );

        let toast = UiRequestPayload {
            request_id: None,
            dialog_type: DialogKind::Toast,
            options: json!({}),
        };
        assert_eq!(
            serde_json::to_value(&toast).unwrap(),
            json!({"dialogType": "toast", "options": {}})
        );
    }

    #[test]
    fn test_dialog_kind_classification() {
        assert!(!DialogKind::Alert.expects_response());
        assert!(!DialogKind::Toast.expects_response());
        assert!(DialogKind::Confirm.expects_response());
        assert!(DialogKind::Form.is_persistent());
        assert!(!DialogKind::Prompt.is_persistent());
        assert_eq!("FORM".parse::<DialogKind>().unwrap(), DialogKind::Form);
        assert!("modal".parse::<DialogKind>().is_err());
    }

    #[test]
    fn test_channel_broadcaster_forwards() {
        let (broadcaster, mut rx) = ChannelBroadcaster::new();
        broadcaster.broadcast_action_states(
            "proj",
            &[ActionStateEntry::new("deploy", ActionState::Loading)],
        );

        match rx.try_recv().unwrap() {
            BroadcastEvent::ActionStates { project_id, states } => {
                assert_eq!(project_id, "proj");
                assert_eq!(states[0].state, ActionState::Loading);
            }
            other => panic!("unexpected event {:?}", other),
        }
        assert_eq!(
            serde_json::to_value(ActionState::Disabled).unwrap(),
            json!("disabled")
        );
    }
}
