use parking_lot::RwLock;
use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dispatcher::Invoker;
use scriptd_api::{Callable, ScriptError, ScriptValue};

const DEFAULT_STATUS: u16 = 200;

/// HTTP methods a script may register handlers for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Method {
    Get,
    Post,
    Put,
    Delete,
    Patch,
}

impl Method {
    pub fn as_str(&self) -> &'static str {
        match self {
            Method::Get => "GET",
            Method::Post => "POST",
            Method::Put => "PUT",
            Method::Delete => "DELETE",
            Method::Patch => "PATCH",
        }
    }
}

impl fmt::Display for Method {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Method {
    type Err = RouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "GET" => Ok(Method::Get),
            "POST" => Ok(Method::Post),
            "PUT" => Ok(Method::Put),
            "DELETE" => Ok(Method::Delete),
            "PATCH" => Ok(Method::Patch),
            _ => Err(RouteError::MethodNotAllowed(s.to_string())),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    #[error("method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("route not found: {method} {path}")]
    NotFound { method: String, path: String },

    #[error("malformed route path '{path}': {reason}")]
    MalformedPath { path: String, reason: String },

    #[error("handler failed: {0}")]
    Execution(#[from] ScriptError),
}

/// A compiled `/seg/:name` pattern
#[derive(Debug, Clone)]
pub struct PathPattern {
    source: String,
    regex: Regex,
    params: Vec<String>,
}

impl PathPattern {
    pub fn compile(path: &str) -> Result<Self, RouteError> {
        let malformed = |reason: &str| RouteError::MalformedPath {
            path: path.to_string(),
            reason: reason.to_string(),
        };

        let rest = path
            .strip_prefix('/')
            .ok_or_else(|| malformed("must start with '/'"))?;

        let mut expr = String::from("^");
        let mut params = Vec::new();
        let mut seen = HashSet::new();

        for segment in rest.split('/') {
            expr.push('/');
            if let Some(name) = segment.strip_prefix(':') {
                if name.is_empty() {
                    return Err(malformed("empty parameter name"));
                }
                if !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
                    return Err(malformed("parameter names may only contain letters, digits and '_'"));
                }
                if !seen.insert(name.to_string()) {
                    return Err(malformed("duplicate parameter name"));
                }
                expr.push_str("([^/]+)");
                params.push(name.to_string());
            } else {
                expr.push_str(&regex::escape(segment));
            }
        }
        expr.push('$');

        let regex = Regex::new(&expr).map_err(|e| malformed(&e.to_string()))?;

        Ok(Self {
            source: path.to_string(),
            regex,
            params,
        })
    }

    pub fn source(&self) -> &str {
        &self.source
    }

    pub fn param_names(&self) -> &[String] {
        &self.params
    }

    /// Match a full path, returning captured parameters in declaration order
    pub fn captures(&self, path: &str) -> Option<Vec<(String, String)>> {
        let caps = self.regex.captures(path)?;
        Some(
            self.params
                .iter()
                .enumerate()
                .map(|(i, name)| {
                    let value = caps.get(i + 1).map(|m| m.as_str()).unwrap_or_default();
                    (name.clone(), value.to_string())
                })
                .collect(),
        )
    }
}

struct Route {
    pattern: PathPattern,
    handler: Callable,
}

/// What a handler receives
#[derive(Debug, Clone, Default, Serialize)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub params: BTreeMap<String, String>,
    pub query: BTreeMap<String, String>,
    pub headers: BTreeMap<String, String>,
    pub body: Value,
}

impl RequestContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.insert(key.into(), value.into());
        self
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn with_body(mut self, body: Value) -> Self {
        self.body = body;
        self
    }

    fn to_script_value(&self) -> ScriptValue {
        json!({
            "method": self.method,
            "path": self.path,
            "params": self.params,
            "query": self.query,
            "headers": self.headers,
            "body": self.body,
        })
        .into()
    }
}

/// What the transport writes back
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResponseEnvelope {
    pub status: u16,
    pub body: Value,
    pub headers: BTreeMap<String, String>,
}

impl ResponseEnvelope {
    /// Interpret a handler's return value.
    ///
    /// An object whose keys are all drawn from `status`, `body` and `headers`
    /// is an envelope; anything else is the body of a 200 response.
    pub fn from_handler_result(value: ScriptValue) -> Self {
        let value = match value {
            ScriptValue::Json(value) => value,
            other => {
                debug!(target: "router", "Handler returned a {}, responding with an empty body", other.kind());
                Value::Null
            }
        };

        match value {
            Value::Object(map) if is_envelope(&map) => Self::from_envelope(map),
            body => Self {
                status: DEFAULT_STATUS,
                body,
                headers: BTreeMap::new(),
            },
        }
    }

    fn from_envelope(mut map: Map<String, Value>) -> Self {
        let status = map
            .get("status")
            .and_then(coerce_status)
            .unwrap_or(DEFAULT_STATUS);

        let headers = match map.remove("headers") {
            Some(Value::Object(headers)) => headers
                .into_iter()
                .filter_map(|(k, v)| match v {
                    Value::String(s) => Some((k, s)),
                    _ => None,
                })
                .collect(),
            _ => BTreeMap::new(),
        };

        Self {
            status,
            body: map.remove("body").unwrap_or(Value::Null),
            headers,
        }
    }
}

fn is_envelope(map: &Map<String, Value>) -> bool {
    !map.is_empty()
        && map
            .keys()
            .all(|k| matches!(k.as_str(), "status" | "body" | "headers"))
}

fn coerce_status(value: &Value) -> Option<u16> {
    let n = value.as_i64().or_else(|| value.as_f64().map(|f| f.trunc() as i64))?;
    if (100..=999).contains(&n) {
        Some(n as u16)
    } else {
        None
    }
}

/// Script-defined HTTP routes.
///
/// Routes are append-only per method and matched in registration order: the
/// first pattern that matches wins, so a `:param` route registered before a
/// literal one shadows it.
pub struct Router {
    routes: RwLock<HashMap<Method, Vec<Arc<Route>>>>,
    invoker: Arc<dyn Invoker>,
}

impl Router {
    pub fn new(invoker: Arc<dyn Invoker>) -> Self {
        Self {
            routes: RwLock::new(HashMap::new()),
            invoker,
        }
    }

    /// Register a handler. Malformed paths are logged and dropped.
    pub fn add_route(&self, method: Method, path: &str, handler: Callable) {
        let pattern = match PathPattern::compile(path) {
            Ok(pattern) => pattern,
            Err(e) => {
                warn!(target: "router", "Dropping {} route: {}", method, e);
                return;
            }
        };

        debug!(target: "router", "Registered {} {} -> {}", method, path, handler);
        self.routes
            .write()
            .entry(method)
            .or_default()
            .push(Arc::new(Route { pattern, handler }));
    }

    /// All registered routes as `(method, pattern)`, in registration order per method
    pub fn routes(&self) -> Vec<(Method, String)> {
        let routes = self.routes.read();
        let mut out: Vec<(Method, String)> = routes
            .iter()
            .flat_map(|(method, table)| {
                table
                    .iter()
                    .map(move |route| (*method, route.pattern.source().to_string()))
            })
            .collect();
        out.sort_by_key(|(method, _)| method.as_str());
        out
    }

    /// Dispatch a request to the first matching handler
    pub async fn handle(
        &self,
        method: &str,
        path: &str,
        mut ctx: RequestContext,
    ) -> Result<ResponseEnvelope, RouteError> {
        let parsed: Method = method.parse()?;

        let (route, params) = {
            let routes = self.routes.read();
            let table = routes
                .get(&parsed)
                .ok_or_else(|| RouteError::MethodNotAllowed(method.to_string()))?;
            table
                .iter()
                .find_map(|route| route.pattern.captures(path).map(|p| (route.clone(), p)))
                .ok_or_else(|| RouteError::NotFound {
                    method: parsed.to_string(),
                    path: path.to_string(),
                })?
        };

        ctx.method = parsed.to_string();
        ctx.path = path.to_string();
        ctx.params = params.into_iter().collect();

        debug!(target: "router", "{} {} matched {}", parsed, path, route.pattern.source());

        let result = self
            .invoker
            .invoke(route.handler, vec![ctx.to_script_value()])
            .await?;
        Ok(ResponseEnvelope::from_handler_result(result))
    }
}
