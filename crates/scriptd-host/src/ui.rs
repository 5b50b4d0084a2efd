use parking_lot::Mutex;
use serde_json::{Value, json};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::dispatcher::Invoker;
use crate::session::{SessionContext, SessionSnapshot};
use scriptd_api::{Callable, HostObject, ScriptError, ScriptValue, args};
use scriptd_events::{Broadcaster, DialogKind, UiRequestPayload};

/// Option key that pins a dialog to a specific session
pub const SESSION_ID_OPTION: &str = "sessionId";

#[derive(Debug, thiserror::Error)]
pub enum UiError {
    #[error("dialog callback failed: {0}")]
    Callback(#[from] ScriptError),
}

struct PendingRequest {
    callback: Callable,
    session_id: String,
    kind: DialogKind,
    last_activity: Instant,
}

struct UiShared {
    project_id: String,
    broadcaster: Option<Arc<dyn Broadcaster>>,
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl UiShared {
    fn push(&self, session_id: &str, payload: UiRequestPayload) {
        if let Some(broadcaster) = &self.broadcaster {
            broadcaster.send_ui_request(&self.project_id, session_id, payload);
        }
    }
}

/// Pairs dialog requests pushed to a session with the responses that come
/// back for them.
///
/// Confirm and prompt entries are removed on their first response. Form
/// entries stay until the script closes the form or it sits idle past the
/// form TTL.
pub struct UiCorrelator {
    shared: Arc<UiShared>,
    session: Arc<SessionContext>,
    invoker: Arc<dyn Invoker>,
    form_ttl: Duration,
}

impl UiCorrelator {
    pub fn new(
        project_id: impl Into<String>,
        broadcaster: Option<Arc<dyn Broadcaster>>,
        session: Arc<SessionContext>,
        invoker: Arc<dyn Invoker>,
        form_ttl: Duration,
    ) -> Self {
        Self {
            shared: Arc::new(UiShared {
                project_id: project_id.into(),
                broadcaster,
                pending: Mutex::new(HashMap::new()),
            }),
            session,
            invoker,
            form_ttl,
        }
    }

    pub fn alert(&self, options: Value) {
        self.notify(DialogKind::Alert, options);
    }

    pub fn toast(&self, options: Value) {
        self.notify(DialogKind::Toast, options);
    }

    pub fn confirm(&self, options: Value, callback: Callable) -> Result<Option<String>, ScriptError> {
        self.request(DialogKind::Confirm, options, callback)
    }

    pub fn prompt(&self, options: Value, callback: Callable) -> Result<Option<String>, ScriptError> {
        self.request(DialogKind::Prompt, options, callback)
    }

    pub fn form(&self, options: Value, callback: Callable) -> Result<Option<String>, ScriptError> {
        self.request(DialogKind::Form, options, callback)
    }

    /// Send a dialog that expects an answer.
    ///
    /// Returns the request id once delivered. With no session or no delivery
    /// channel the callback runs right away with `null` and `None` is
    /// returned; that call blocks until the engine is free.
    pub fn request(&self, kind: DialogKind, options: Value, callback: Callable) -> Result<Option<String>, ScriptError> {
        let session_id = match (self.resolve_session(&options), &self.shared.broadcaster) {
            (Some(session_id), Some(_)) => session_id,
            _ => {
                debug!(target: "ui", "No session or delivery channel for {}, answering with null", kind);
                self.invoker.invoke_blocking(callback, vec![ScriptValue::null()])?;
                return Ok(None);
            }
        };

        let request_id = uuid::Uuid::new_v4().to_string();
        self.shared.pending.lock().insert(
            request_id.clone(),
            PendingRequest {
                callback,
                session_id: session_id.clone(),
                kind,
                last_activity: Instant::now(),
            },
        );

        debug!(target: "ui", "Sending {} {} to session {}", kind, request_id, session_id);
        self.shared.push(
            &session_id,
            UiRequestPayload {
                request_id: Some(request_id.clone()),
                dialog_type: kind,
                options,
            },
        );

        Ok(Some(request_id))
    }

    /// Route a session's answer to the waiting callback.
    ///
    /// Returns `Ok(false)` for unknown or already answered ids.
    pub async fn handle_response(&self, request_id: &str, data: Value) -> Result<bool, UiError> {
        let (callback, session_id, kind) = {
            let mut pending = self.shared.pending.lock();
            let Some(entry) = pending.get_mut(request_id) else {
                debug!(target: "ui", "Ignoring response for unknown request {}", request_id);
                return Ok(false);
            };

            if entry.kind.is_persistent() {
                entry.last_activity = Instant::now();
                (entry.callback, entry.session_id.clone(), entry.kind)
            } else {
                let entry = pending.remove(request_id).ok_or_else(|| {
                    ScriptError::Host(format!("request {} vanished", request_id))
                })?;
                (entry.callback, entry.session_id, entry.kind)
            }
        };

        self.session.set_current(Some(session_id.clone()));
        let binding = self
            .session
            .bind(SessionSnapshot::new(Some(session_id.clone())));

        let mut call_args = vec![ScriptValue::from(data)];
        if kind == DialogKind::Form {
            call_args.push(ScriptValue::Object(Arc::new(FormController {
                request_id: request_id.to_string(),
                session_id,
                shared: self.shared.clone(),
            })));
        }

        self.invoker
            .invoke_in_session(binding, callback, call_args)
            .await?;
        Ok(true)
    }

    /// Drop forms idle for longer than the form TTL
    pub fn sweep_expired(&self) -> usize {
        let ttl = self.form_ttl;
        let mut pending = self.shared.pending.lock();
        let before = pending.len();
        pending.retain(|id, entry| {
            let keep = !entry.kind.is_persistent() || entry.last_activity.elapsed() <= ttl;
            if !keep {
                info!(target: "ui", "Form {} expired after {:?} idle", id, ttl);
            }
            keep
        });
        before - pending.len()
    }

    pub fn pending_count(&self) -> usize {
        self.shared.pending.lock().len()
    }

    pub fn form_ttl(&self) -> Duration {
        self.form_ttl
    }

    fn notify(&self, kind: DialogKind, options: Value) {
        let Some(session_id) = self.resolve_session(&options) else {
            debug!(target: "ui", "Dropping {}: no session", kind);
            return;
        };
        if self.shared.broadcaster.is_none() {
            debug!(target: "ui", "Dropping {}: no delivery channel", kind);
            return;
        }

        self.shared.push(
            &session_id,
            UiRequestPayload {
                request_id: None,
                dialog_type: kind,
                options,
            },
        );
    }

    fn resolve_session(&self, options: &Value) -> Option<String> {
        options
            .get(SESSION_ID_OPTION)
            .and_then(Value::as_str)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .or_else(|| self.session.current())
    }
}

/// Second argument to a form callback
pub struct FormController {
    request_id: String,
    session_id: String,
    shared: Arc<UiShared>,
}

impl FormController {
    pub fn loading(&self, loading: bool) {
        self.update(json!({"action": "loading", "loading": loading}));
    }

    pub fn error(&self, errors: serde_json::Map<String, Value>) {
        self.update(json!({"action": "error", "errors": errors}));
    }

    pub fn close(&self) {
        if self.shared.pending.lock().remove(&self.request_id).is_none() {
            warn!(target: "ui", "Form {} was already closed", self.request_id);
            return;
        }
        self.update(json!({"action": "close"}));
    }

    fn update(&self, options: Value) {
        self.shared.push(
            &self.session_id,
            UiRequestPayload {
                request_id: Some(self.request_id.clone()),
                dialog_type: DialogKind::Form,
                options,
            },
        );
    }
}

impl HostObject for FormController {
    fn type_name(&self) -> &'static str {
        "FormController"
    }

    fn get(&self, key: &str) -> Option<ScriptValue> {
        match key {
            "requestId" => Some(self.request_id.clone().into()),
            _ => None,
        }
    }

    fn call_method(&self, method: &str, call_args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        match method {
            "loading" => {
                args::expect_arity("form.loading", &call_args, 1, 1)?;
                self.loading(args::expect_bool("form.loading", &call_args, 0)?);
            }
            "error" => {
                args::expect_arity("form.error", &call_args, 1, 1)?;
                let errors = args::optional_object("form.error", &call_args, 0)?;
                if let Some((field, _)) = errors.iter().find(|(_, v)| !v.is_string()) {
                    return Err(ScriptError::invalid_arguments(
                        "form.error",
                        format!("message for '{}' must be a string", field),
                    ));
                }
                self.error(errors);
            }
            "close" => self.close(),
            other => return Err(ScriptError::unknown_method("FormController", other)),
        }
        Ok(ScriptValue::null())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestInvoker;
    use scriptd_events::{BroadcastEvent, ChannelBroadcaster};
    use tokio::sync::mpsc::UnboundedReceiver;

    fn correlator(
        invoker: &Arc<TestInvoker>,
        session: Arc<SessionContext>,
    ) -> (UiCorrelator, UnboundedReceiver<BroadcastEvent>) {
        let (broadcaster, rx) = ChannelBroadcaster::new();
        let ui = UiCorrelator::new(
            "proj",
            Some(Arc::new(broadcaster)),
            session,
            invoker.clone(),
            Duration::from_secs(60),
        );
        (ui, rx)
    }

    fn ui_requests(rx: &mut UnboundedReceiver<BroadcastEvent>) -> Vec<(String, UiRequestPayload)> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            if let BroadcastEvent::UiRequest { session_id, payload, .. } = event {
                out.push((session_id, payload));
            }
        }
        out
    }

    fn recorder(invoker: &TestInvoker) -> (Callable, Arc<Mutex<Vec<Value>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let callable = invoker.register(move |args| {
            sink.lock().push(args[0].as_json().cloned().unwrap_or_default());
            Ok(ScriptValue::null())
        });
        (callable, seen)
    }

    #[tokio::test]
    async fn test_confirm_round_trip() {
        let invoker = Arc::new(TestInvoker::new());
        let session = Arc::new(SessionContext::new());
        session.set_current(Some("s1".to_string()));
        let (ui, mut rx) = correlator(&invoker, session);
        let (cb, seen) = recorder(&invoker);

        let id = ui.confirm(json!({"title": "Delete?"}), cb).unwrap().unwrap();
        let sent = ui_requests(&mut rx);
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, "s1");
        assert_eq!(sent[0].1.request_id.as_deref(), Some(id.as_str()));
        assert_eq!(sent[0].1.dialog_type, DialogKind::Confirm);

        assert!(ui.handle_response(&id, json!(true)).await.unwrap());
        assert!(!ui.handle_response(&id, json!(true)).await.unwrap());
        assert_eq!(*seen.lock(), vec![json!(true)]);
        assert_eq!(ui.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_no_session_answers_with_null() {
        let invoker = Arc::new(TestInvoker::new());
        let (ui, mut rx) = correlator(&invoker, Arc::new(SessionContext::new()));
        let (cb, seen) = recorder(&invoker);

        assert_eq!(ui.prompt(json!({"label": "Name"}), cb).unwrap(), None);
        assert_eq!(*seen.lock(), vec![Value::Null]);
        assert!(ui_requests(&mut rx).is_empty());

        // Fire-and-forget kinds are simply dropped
        ui.toast(json!({"message": "hi"}));
        assert!(ui_requests(&mut rx).is_empty());
    }

    #[tokio::test]
    async fn test_no_broadcaster_answers_with_null() {
        let invoker = Arc::new(TestInvoker::new());
        let session = Arc::new(SessionContext::new());
        session.set_current(Some("s1".to_string()));
        let ui = UiCorrelator::new("proj", None, session, invoker.clone(), Duration::from_secs(60));
        let (cb, seen) = recorder(&invoker);

        assert_eq!(ui.confirm(json!({}), cb).unwrap(), None);
        assert_eq!(*seen.lock(), vec![Value::Null]);
        ui.alert(json!({"message": "lost"}));
        assert_eq!(ui.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_explicit_session_option_wins() {
        let invoker = Arc::new(TestInvoker::new());
        let session = Arc::new(SessionContext::new());
        session.set_current(Some("ambient".to_string()));
        let (ui, mut rx) = correlator(&invoker, session.clone());
        let (cb, _) = recorder(&invoker);

        let id = ui
            .confirm(json!({"sessionId": "pinned", "title": "?"}), cb)
            .unwrap()
            .unwrap();
        ui.alert(json!({"sessionId": "pinned", "message": "hello"}));

        let sent = ui_requests(&mut rx);
        assert!(sent.iter().all(|(s, _)| s == "pinned"));
        assert_eq!(sent[1].1.request_id, None);

        // The response restores the dialog's session as current
        session.set_current(Some("someone-else".to_string()));
        ui.handle_response(&id, json!(false)).await.unwrap();
        assert_eq!(session.current().as_deref(), Some("pinned"));
    }

    #[tokio::test]
    async fn test_form_persists_until_closed() {
        let invoker = Arc::new(TestInvoker::new());
        let session = Arc::new(SessionContext::new());
        session.set_current(Some("s1".to_string()));
        let (ui, mut rx) = correlator(&invoker, session);

        let submit = invoker.register(|args| {
            let data = args[0].as_json().cloned().unwrap_or_default();
            let controller = args[1]
                .as_object()
                .cloned()
                .ok_or_else(|| ScriptError::Thrown("missing controller".to_string()))?;
            if data["email"].as_str().unwrap_or_default().contains('@') {
                controller.call_method("close", vec![])
            } else {
                controller.call_method("loading", vec![json!(false).into()])?;
                controller.call_method("error", vec![json!({"email": "invalid"}).into()])
            }
        });

        let id = ui.form(json!({"fields": ["email"]}), submit).unwrap().unwrap();
        ui_requests(&mut rx);

        ui.handle_response(&id, json!({"email": "nope"})).await.unwrap();
        assert_eq!(ui.pending_count(), 1);
        let updates = ui_requests(&mut rx);
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[1].1.options, json!({"action": "error", "errors": {"email": "invalid"}}));

        ui.handle_response(&id, json!({"email": "a@b.c"})).await.unwrap();
        assert_eq!(ui.pending_count(), 0);
        let updates = ui_requests(&mut rx);
        assert_eq!(updates[0].1.options, json!({"action": "close"}));
        assert!(!ui.handle_response(&id, json!({})).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_forms_expire() {
        let invoker = Arc::new(TestInvoker::new());
        let session = Arc::new(SessionContext::new());
        session.set_current(Some("s1".to_string()));
        let (ui, _rx) = correlator(&invoker, session);

        let stale = ui.form(json!({}), invoker.noop()).unwrap().unwrap();
        tokio::time::sleep(Duration::from_secs(45)).await;
        let fresh = ui.form(json!({}), invoker.noop()).unwrap().unwrap();
        ui.confirm(json!({}), invoker.noop()).unwrap();
        tokio::time::sleep(Duration::from_secs(30)).await;

        assert_eq!(ui.sweep_expired(), 1);
        assert!(!ui.handle_response(&stale, json!({})).await.unwrap());
        assert!(ui.handle_response(&fresh, json!({})).await.unwrap());
        assert_eq!(ui.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_callback_error_surfaces() {
        let invoker = Arc::new(TestInvoker::new());
        let session = Arc::new(SessionContext::new());
        session.set_current(Some("s1".to_string()));
        let (ui, _rx) = correlator(&invoker, session);
        let failing = invoker.register(|_| Err(ScriptError::Thrown("cb".to_string())));

        let id = ui.confirm(json!({}), failing).unwrap().unwrap();
        assert!(matches!(
            ui.handle_response(&id, json!(true)).await,
            Err(UiError::Callback(ScriptError::Thrown(_)))
        ));
    }
}
