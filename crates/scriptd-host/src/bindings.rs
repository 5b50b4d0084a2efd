//! Script-facing globals.
//!
//! Each binding wraps one component and validates argument shape before
//! registering anything, so a mistyped call fails where the script made it.

use serde_json::{Value, json};
use std::sync::Arc;

use crate::hooks::{ActionRegistry, HookType, ModelHookRegistry};
use crate::lifecycle::ServiceLifecycle;
use crate::modules::ModuleLoader;
use crate::pool::WorkerPool;
use crate::router::{Method, Router};
use crate::scheduler::Scheduler;
use crate::ui::UiCorrelator;
use scriptd_api::args::{expect_arity, expect_callable, expect_string, optional_object};
use scriptd_api::{Callable, HostObject, ScriptError, ScriptValue};
use scriptd_events::DialogKind;

fn request_id_value(id: Option<String>) -> ScriptValue {
    id.map(ScriptValue::from).unwrap_or_else(ScriptValue::null)
}

/// `router.get(path, fn)` and friends
pub struct RouterBinding(pub Arc<Router>);

impl HostObject for RouterBinding {
    fn type_name(&self) -> &'static str {
        "router"
    }

    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        let http_method = match method {
            "get" => Method::Get,
            "post" => Method::Post,
            "put" => Method::Put,
            "delete" => Method::Delete,
            "patch" => Method::Patch,
            other => return Err(ScriptError::unknown_method("router", other)),
        };

        let function = format!("router.{}", method);
        expect_arity(&function, &args, 2, 2)?;
        let path = expect_string(&function, &args, 0)?;
        let handler = expect_callable(&function, &args, 1)?;

        self.0.add_route(http_method, &path, handler);
        Ok(ScriptValue::null())
    }
}

/// `modules.require(name)`
pub struct ModulesBinding(pub Arc<ModuleLoader>);

impl HostObject for ModulesBinding {
    fn type_name(&self) -> &'static str {
        "modules"
    }

    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        match method {
            "require" => {
                expect_arity("modules.require", &args, 1, 1)?;
                let name = expect_string("modules.require", &args, 0)?;
                let exports = self.0.require(&name)?;
                Ok(ScriptValue::Module(exports))
            }
            other => Err(ScriptError::unknown_method("modules", other)),
        }
    }
}

/// `delayed.run(fn)`
pub struct DelayedBinding(pub Arc<WorkerPool>);

impl HostObject for DelayedBinding {
    fn type_name(&self) -> &'static str {
        "delayed"
    }

    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        match method {
            "run" => {
                expect_arity("delayed.run", &args, 1, 1)?;
                let handler = expect_callable("delayed.run", &args, 0)?;
                let id = self.0.run(handler);
                Ok(json!(id.id()).into())
            }
            other => Err(ScriptError::unknown_method("delayed", other)),
        }
    }
}

/// `scheduler.addJob(spec, fn)`, `scheduler.daily(fn)`, `scheduler.hourly(fn)`
pub struct SchedulerBinding(pub Arc<Scheduler>);

impl HostObject for SchedulerBinding {
    fn type_name(&self) -> &'static str {
        "scheduler"
    }

    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        // Bad cron specs are dropped, not thrown; the script gets null back
        let id = match method {
            "addJob" => {
                expect_arity("scheduler.addJob", &args, 2, 2)?;
                let spec = expect_string("scheduler.addJob", &args, 0)?;
                let handler = expect_callable("scheduler.addJob", &args, 1)?;
                self.0.add_job(&spec, handler)
            }
            "daily" => {
                expect_arity("scheduler.daily", &args, 1, 1)?;
                self.0.daily(expect_callable("scheduler.daily", &args, 0)?)
            }
            "hourly" => {
                expect_arity("scheduler.hourly", &args, 1, 1)?;
                self.0.hourly(expect_callable("scheduler.hourly", &args, 0)?)
            }
            other => return Err(ScriptError::unknown_method("scheduler", other)),
        };
        Ok(id
            .map(|id| json!(id.to_string()).into())
            .unwrap_or_else(ScriptValue::null))
    }
}

/// `service.onBoot(fn)`, `service.onStart(fn)`, `service.onShutdown(fn)`
pub struct ServiceBinding(pub Arc<ServiceLifecycle>);

impl HostObject for ServiceBinding {
    fn type_name(&self) -> &'static str {
        "service"
    }

    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        let function = format!("service.{}", method);
        let register: fn(&ServiceLifecycle, Callable) = match method {
            "onBoot" => ServiceLifecycle::on_boot,
            "onStart" => ServiceLifecycle::on_start,
            "onShutdown" => ServiceLifecycle::on_shutdown,
            other => return Err(ScriptError::unknown_method("service", other)),
        };

        expect_arity(&function, &args, 1, 1)?;
        register(&self.0, expect_callable(&function, &args, 0)?);
        Ok(ScriptValue::null())
    }
}

/// `hooks.registerAction(slug, [name], fn)` and `hooks.on(model, type, fn)`
pub struct HooksBinding {
    pub actions: Arc<ActionRegistry>,
    pub models: Arc<ModelHookRegistry>,
}

impl HostObject for HooksBinding {
    fn type_name(&self) -> &'static str {
        "hooks"
    }

    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        match method {
            "registerAction" => {
                expect_arity("hooks.registerAction", &args, 2, 3)?;
                let slug = expect_string("hooks.registerAction", &args, 0)?;
                let (name, handler) = if args.len() == 3 {
                    (
                        Some(expect_string("hooks.registerAction", &args, 1)?),
                        expect_callable("hooks.registerAction", &args, 2)?,
                    )
                } else {
                    (None, expect_callable("hooks.registerAction", &args, 1)?)
                };
                if slug.is_empty() {
                    return Err(ScriptError::invalid_arguments(
                        "hooks.registerAction",
                        "slug must not be empty",
                    ));
                }
                self.actions.register(&slug, name.as_deref(), handler);
                Ok(ScriptValue::null())
            }
            "on" => {
                expect_arity("hooks.on", &args, 3, 3)?;
                let model = expect_string("hooks.on", &args, 0)?;
                let hook_type: HookType = expect_string("hooks.on", &args, 1)?
                    .parse()
                    .map_err(|e: crate::hooks::HookError| {
                        ScriptError::invalid_arguments("hooks.on", e.to_string())
                    })?;
                let handler = expect_callable("hooks.on", &args, 2)?;
                self.models.on(&model, hook_type, handler);
                Ok(ScriptValue::null())
            }
            other => Err(ScriptError::unknown_method("hooks", other)),
        }
    }
}

/// `ui.alert(options)`, `ui.confirm(options, fn)` and the other dialogs
pub struct UiBinding(pub Arc<UiCorrelator>);

impl HostObject for UiBinding {
    fn type_name(&self) -> &'static str {
        "ui"
    }

    fn call_method(&self, method: &str, args: Vec<ScriptValue>) -> Result<ScriptValue, ScriptError> {
        let kind: DialogKind = method
            .parse()
            .map_err(|_| ScriptError::unknown_method("ui", method))?;
        let function = format!("ui.{}", kind);

        if kind.expects_response() {
            expect_arity(&function, &args, 2, 2)?;
            let options = Value::Object(optional_object(&function, &args, 0)?);
            let callback = expect_callable(&function, &args, 1)?;
            let id = self.0.request(kind, options, callback)?;
            Ok(request_id_value(id))
        } else {
            expect_arity(&function, &args, 1, 1)?;
            let options = Value::Object(optional_object(&function, &args, 0)?);
            match kind {
                DialogKind::Alert => self.0.alert(options),
                _ => self.0.toast(options),
            }
            Ok(ScriptValue::null())
        }
    }
}
