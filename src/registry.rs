//! The frozen table of exposed procedures, event types, and identity
//! loaders a session dispatches against.
//!
//! Binding arguments dynamically at call time (inspecting a handler's
//! signature and validating against a model built per call) is natural in
//! a dynamically typed host but has no equivalent here. Instead every
//! exposed procedure is precompiled at registration time into a
//! [`Procedure`] trait object: a fixed decode→invoke→encode sequence
//! closed over the handler's concrete parameter and return types. Dispatch
//! is then just a map lookup plus one virtual call — no per-call
//! reflection, no per-call model construction.

use std::any::type_name;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use rmpv::Value;
use salvo::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

/// One declared parameter of an exposed procedure: its name (used for
/// keyword binding and positional ordering), an advisory type label for
/// the schema CLI, and an optional default (already encoded, so binding
/// never needs to know the concrete Rust type).
#[derive(Debug, Clone)]
pub struct ParamSpec {
    pub name: &'static str,
    pub type_label: &'static str,
    pub default: Option<Value>,
}

impl ParamSpec {
    pub fn new<T>(name: &'static str) -> Self {
        Self { name, type_label: type_name::<T>(), default: None }
    }

    pub fn with_default(mut self, default: Value) -> Self {
        self.default = Some(default);
        self
    }
}

/// Declared, type-erased facts about one exposed procedure, independent of
/// its boxed implementation — this is all the schema CLI ever touches.
#[derive(Debug, Clone)]
pub struct ProcedureMeta {
    pub name: String,
    pub params: Vec<ParamSpec>,
    pub response_type_label: Option<&'static str>,
    pub rate_limit: Option<(u64, u64)>,
    pub requires_login: bool,
}

/// Errors a dispatched call can fail with, one variant per reply frame
/// shape, so the session loop can translate each into its wire
/// representation without re-deriving which errors are "structured".
#[derive(Debug, Error)]
pub enum CallError {
    #[error("Function '{0}' not found.")]
    NotFound(String),
    #[error("rate limit exceeded")]
    RateLimited { retry_after: u64 },
    #[error("{0}")]
    Bind(String),
    #[error("Input validation failed.")]
    Validation(Value),
    #[error("Server returned invalid type: {0}")]
    ReturnValidation(String),
    #[error("{0}")]
    Handler(String),
}

/// Build the `data` payload of a `VALIDATION_ERROR` reply: a list of
/// per-field issues, not a single scalar message. `rmpv`'s deserializer
/// reports only one failure per call (unlike a model that collects every
/// field error at once), so the list always has exactly one entry here,
/// but the wire shape stays a list either way.
fn validation_issues(message: String) -> Value {
    Value::Array(vec![Value::Map(vec![
        (Value::from("loc"), Value::Array(vec![])),
        (Value::from("msg"), Value::from(message)),
    ])])
}

/// A precompiled, boxed procedure: decode params, invoke, encode result.
/// Built once at registration time by [`RegistryBuilder::expose`]; never
/// constructed by application code directly.
#[async_trait]
pub trait Procedure: Send + Sync {
    async fn call(&self, bound_params: Value) -> Result<Value, CallError>;
}

struct TypedProcedure<F, P, R, E, Fut> {
    handler: F,
    _marker: std::marker::PhantomData<fn(P) -> (R, E, Fut)>,
}

#[async_trait]
impl<F, P, R, E, Fut> Procedure for TypedProcedure<F, P, R, E, Fut>
where
    F: Fn(P) -> Fut + Send + Sync,
    P: DeserializeOwned + Send,
    R: Serialize + Send,
    E: std::fmt::Display + Send,
    Fut: Future<Output = Result<R, E>> + Send,
{
    async fn call(&self, bound_params: Value) -> Result<Value, CallError> {
        let params: P = rmpv::ext::from_value(bound_params).map_err(|e| CallError::Validation(validation_issues(e.to_string())))?;

        let result = (self.handler)(params).await.map_err(|e| CallError::Handler(e.to_string()))?;

        rmpv::ext::to_value(&result).map_err(|e| CallError::ReturnValidation(e.to_string()))
    }
}

struct ProcedureEntry {
    meta: ProcedureMeta,
    procedure: Arc<dyn Procedure>,
}

pub type IdentityLoaderFn = dyn Fn(Value) -> BoxFuture<'static, Option<String>> + Send + Sync;

/// What an HTTP identity loader gets to inspect. Kept independent of
/// `salvo::Request` so this module has no host-framework coupling; `http`
/// is responsible for building one of these from the real request.
#[derive(Debug, Clone, Default)]
pub struct HttpAuthInput {
    pub bearer_token: Option<String>,
    pub headers: HashMap<String, String>,
}

pub type HttpIdentityLoaderFn = dyn Fn(HttpAuthInput) -> BoxFuture<'static, Option<String>> + Send + Sync;

/// Trait implemented by event payload types so [`crate::broadcast`] can
/// name and serialize them without reaching for runtime type reflection.
pub trait EphapticEvent: Serialize {
    const NAME: &'static str;
}

#[derive(Debug, Clone)]
pub struct EventMeta {
    pub name: &'static str,
}

/// An immutable, `Arc`-shared table of exposed procedures and events.
/// Produced only by [`RegistryBuilder::build`]; there is no way to add a
/// procedure to a `Registry` after that point; the builder type is
/// consumed.
pub struct Registry {
    procedures: HashMap<String, ProcedureEntry>,
    events: Vec<EventMeta>,
    identity_loader: Option<Arc<IdentityLoaderFn>>,
    http_identity_loader: Option<Arc<HttpIdentityLoaderFn>>,
}

impl Registry {
    pub fn procedure_meta(&self, name: &str) -> Option<&ProcedureMeta> {
        self.procedures.get(name).map(|e| &e.meta)
    }

    pub fn procedures(&self) -> impl Iterator<Item = &ProcedureMeta> {
        self.procedures.values().map(|e| &e.meta)
    }

    pub fn events(&self) -> &[EventMeta] {
        &self.events
    }

    pub fn identity_loader(&self) -> Option<&Arc<IdentityLoaderFn>> {
        self.identity_loader.as_ref()
    }

    pub fn http_identity_loader(&self) -> Option<&Arc<HttpIdentityLoaderFn>> {
        self.http_identity_loader.as_ref()
    }

    /// Look up `name`, bind `args`/`kwargs` against its declared
    /// parameters (positional-by-order, then keyword-by-name, then
    /// defaults), decode, and invoke. Does not rate-limit — the session
    /// runtime calls the limiter itself first, since that needs caller
    /// identity the registry doesn't have.
    pub async fn invoke(
        &self,
        name: &str,
        args: &[Value],
        kwargs: &HashMap<String, Value>,
    ) -> Result<Value, CallError> {
        let entry = self
            .procedures
            .get(name)
            .ok_or_else(|| CallError::NotFound(name.to_string()))?;

        let bound = bind_params(&entry.meta.params, args, kwargs).map_err(CallError::Bind)?;
        entry.procedure.call(bound).await
    }
}

fn bind_params(params: &[ParamSpec], args: &[Value], kwargs: &HashMap<String, Value>) -> Result<Value, String> {
    if params.is_empty() {
        if !args.is_empty() {
            return Err(format!("too many positional arguments: expected at most 0, got {}", args.len()));
        }
        if let Some(key) = kwargs.keys().next() {
            return Err(format!("unexpected keyword argument '{key}'"));
        }
        // A zero-parameter handler deserializes `()`, which rmpv/serde only
        // accept from `Nil`, never from an empty map.
        return Ok(Value::Nil);
    }

    if args.len() > params.len() {
        return Err(format!(
            "too many positional arguments: expected at most {}, got {}",
            params.len(),
            args.len()
        ));
    }

    let mut bound = Vec::with_capacity(params.len());
    for (index, spec) in params.iter().enumerate() {
        let value = if index < args.len() {
            if kwargs.contains_key(spec.name) {
                return Err(format!("got multiple values for argument '{}'", spec.name));
            }
            args[index].clone()
        } else if let Some(v) = kwargs.get(spec.name) {
            v.clone()
        } else if let Some(default) = &spec.default {
            default.clone()
        } else {
            return Err(format!("missing required argument: '{}'", spec.name));
        };
        bound.push((Value::String(spec.name.into()), value));
    }

    for key in kwargs.keys() {
        if !params.iter().any(|spec| spec.name == key) {
            return Err(format!("unexpected keyword argument '{key}'"));
        }
    }

    Ok(Value::Map(bound))
}

/// Parse `"<count>/<period>"` or `"<count> per <period>"` where period is
/// `[<n>]<s|m|h|d>`, e.g. `"5/m"`. `"1 per minute"`-style strings are not
/// supported — only the single-letter unit form.
pub fn parse_limit(spec: &str) -> Result<(u64, u64), String> {
    let normalized = spec.replace(" per ", "/");
    let (count_str, period_str) = normalized
        .split_once('/')
        .ok_or_else(|| format!("invalid rate limit spec {spec:?}: expected \"<count>/<period>\""))?;

    let count: u64 = count_str
        .trim()
        .parse()
        .map_err(|_| format!("invalid rate limit spec {spec:?}: bad count {count_str:?}"))?;

    let period = period_str.trim().to_lowercase();
    let split_at = period
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("invalid rate limit period {period_str:?}"))?;
    let (digits, unit) = period.split_at(split_at);

    let multiplier: u64 = if digits.is_empty() {
        1
    } else {
        digits
            .parse()
            .map_err(|_| format!("invalid rate limit period {period_str:?}"))?
    };

    let unit_seconds = match unit {
        "s" => 1,
        "m" => 60,
        "h" => 3600,
        "d" => 86400,
        other => return Err(format!("invalid rate limit period unit {other:?} in {period_str:?}")),
    };

    Ok((count, multiplier * unit_seconds))
}

#[derive(Default)]
pub struct ExposeOptions {
    pub rate_limit: Option<&'static str>,
    pub requires_login: bool,
    pub response_type_label: Option<&'static str>,
}

/// Mutable builder for a [`Registry`]. Consumed by [`build`](Self::build)
/// into an immutable `Arc<Registry>` — the strict version of "reject late
/// registrations": there is no type that would accept one.
#[derive(Default)]
pub struct RegistryBuilder {
    procedures: HashMap<String, ProcedureEntry>,
    events: Vec<EventMeta>,
    identity_loader: Option<Arc<IdentityLoaderFn>>,
    http_identity_loader: Option<Arc<HttpIdentityLoaderFn>>,
    errors: Vec<String>,
}

impl RegistryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` against `handler`. Rate-limit string parse failures
    /// are queued rather than returned immediately: they surface when
    /// `.build()` runs, so a builder chain stays fluent.
    pub fn expose<F, P, R, E, Fut>(
        &mut self,
        name: impl Into<String>,
        params: Vec<ParamSpec>,
        options: ExposeOptions,
        handler: F,
    ) -> &mut Self
    where
        F: Fn(P) -> Fut + Send + Sync + 'static,
        P: DeserializeOwned + Send + 'static,
        R: Serialize + Send + 'static,
        E: std::fmt::Display + Send + 'static,
        Fut: Future<Output = Result<R, E>> + Send + 'static,
    {
        let name = name.into();

        let rate_limit = match options.rate_limit.map(parse_limit) {
            Some(Ok(limit)) => Some(limit),
            Some(Err(reason)) => {
                self.errors.push(format!("procedure {name:?}: {reason}"));
                None
            }
            None => None,
        };

        let meta = ProcedureMeta {
            name: name.clone(),
            params,
            response_type_label: options.response_type_label,
            rate_limit,
            requires_login: options.requires_login,
        };

        self.procedures.insert(
            name,
            ProcedureEntry { meta, procedure: Arc::new(TypedProcedure { handler, _marker: std::marker::PhantomData }) },
        );
        self
    }

    pub fn event<E: EphapticEvent>(&mut self) -> &mut Self {
        self.events.push(EventMeta { name: E::NAME });
        self
    }

    pub fn identity_loader<F, Fut>(&mut self, loader: F) -> &mut Self
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        self.identity_loader = Some(Arc::new(move |auth| Box::pin(loader(auth))));
        self
    }

    pub fn http_identity_loader<F, Fut>(&mut self, loader: F) -> &mut Self
    where
        F: Fn(HttpAuthInput) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Option<String>> + Send + 'static,
    {
        self.http_identity_loader = Some(Arc::new(move |input| Box::pin(loader(input))));
        self
    }

    /// Freeze the builder. Panics, listing every queued registration
    /// error, if any `expose` call had an invalid rate-limit spec.
    pub fn build(self) -> Arc<Registry> {
        if !self.errors.is_empty() {
            panic!("registry has {} invalid declaration(s):\n{}", self.errors.len(), self.errors.join("\n"));
        }
        Arc::new(Registry {
            procedures: self.procedures,
            events: self.events,
            identity_loader: self.identity_loader,
            http_identity_loader: self.http_identity_loader,
        })
    }
}
