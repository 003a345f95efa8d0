//! Receive-side dispatch.
//!
//! The [`Router`] maps names to handlers. Handlers are resolved once, at
//! registration time, from an owner implementing [`Service`]; dispatch
//! never looks at the owner again.
//!
//! # Example
//!
//! ```ignore
//! use xmn::router::{Handlers, Router, handler};
//!
//! let profiles = Handlers::new()
//!     .with("getProfile", handler(|_ctx, call| async move {
//!         Ok(json!({ "id": call.data["id"] }))
//!     }));
//!
//! let mut router = Router::new();
//! router.register("getProfile", &profiles, "user")?;
//! let router = Arc::new(router);
//! ```
//!
//! Register everything before traffic arrives; the map is read-only once
//! it is shared.

// ============================================================================
// Imports
// ============================================================================

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use rustc_hash::FxHashMap;
use serde_json::Value;
use tracing::{Instrument, debug, warn};

use crate::context::CallContext;
use crate::error::{Error, Result, codes};
use crate::protocol::{Call, HANDSHAKE};

// ============================================================================
// Types
// ============================================================================

/// What a handler returns.
pub type HandlerResult = Result<Value>;

/// Shared handler reference.
pub type BoxedHandler = Arc<dyn Handler>;

// ============================================================================
// Handler
// ============================================================================

/// A single callable API or event handler.
///
/// Return [`Error::handler`] for domain failures; the code and message are
/// sent to the caller as-is. Any other error is sent with its own code.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    /// Serves one inbound call.
    async fn call(&self, ctx: CallContext, call: Call) -> HandlerResult;
}

/// Closure adapter for [`Handler`].
pub struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(CallContext, Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    async fn call(&self, ctx: CallContext, call: Call) -> HandlerResult {
        (self.0)(ctx, call).await
    }
}

/// Wraps an async closure as a shareable handler.
pub fn handler<F, Fut>(f: F) -> BoxedHandler
where
    F: Fn(CallContext, Call) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

// ============================================================================
// Service
// ============================================================================

/// An owner that can be asked for a handler by name.
pub trait Service: Send + Sync {
    /// Resolves the handler for `name`, if this owner provides one.
    fn resolve(&self, name: &str) -> Option<BoxedHandler>;
}

/// A plain name to handler map usable as a [`Service`].
#[derive(Default, Clone)]
pub struct Handlers {
    entries: FxHashMap<String, BoxedHandler>,
}

impl Handlers {
    /// Creates an empty set.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a handler.
    #[inline]
    #[must_use]
    pub fn with(mut self, name: impl Into<String>, handler: BoxedHandler) -> Self {
        self.entries.insert(name.into(), handler);
        self
    }
}

impl Service for Handlers {
    fn resolve(&self, name: &str) -> Option<BoxedHandler> {
        self.entries.get(name).cloned()
    }
}

// ============================================================================
// Registration
// ============================================================================

/// One registered name.
#[derive(Clone)]
pub struct Registration {
    /// Registered name.
    pub name: String,
    /// Authorization tag supplied at registration.
    pub permission: String,
    handler: BoxedHandler,
}

impl std::fmt::Debug for Registration {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registration")
            .field("name", &self.name)
            .field("permission", &self.permission)
            .finish_non_exhaustive()
    }
}

// ============================================================================
// Router
// ============================================================================

/// Name to handler registry with dispatch.
#[derive(Default, Debug)]
pub struct Router {
    routes: FxHashMap<String, Registration>,
}

impl Router {
    /// Creates an empty router.
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `name`, resolving its handler on `owner`.
    ///
    /// # Errors
    ///
    /// - [`Error::ReservedName`] for the handshake name
    /// - [`Error::DuplicateRegistration`] if `name` is already registered
    /// - [`Error::HandlerNotFound`] if `owner` does not provide `name`
    pub fn register(
        &mut self,
        name: impl Into<String>,
        owner: &dyn Service,
        permission: impl Into<String>,
    ) -> Result<()> {
        let name = name.into();

        if name == HANDSHAKE {
            return Err(Error::reserved_name(name));
        }
        if self.routes.contains_key(&name) {
            return Err(Error::duplicate_registration(name));
        }
        let handler = owner
            .resolve(&name)
            .ok_or_else(|| Error::handler_not_found(&name))?;

        let permission = permission.into();
        debug!(name = %name, permission = %permission, "Handler registered");

        self.routes.insert(
            name.clone(),
            Registration {
                name,
                permission,
                handler,
            },
        );
        Ok(())
    }

    /// Returns the registration for `name`.
    #[inline]
    #[must_use]
    pub fn registration(&self, name: &str) -> Option<&Registration> {
        self.routes.get(name)
    }

    /// Returns `true` if `name` is registered.
    #[inline]
    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Number of registered names.
    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Returns `true` if nothing is registered.
    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    /// Serves an inbound request.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownApi`] if `call.name` is not registered
    /// - [`Error::Handler`] (or the handler's own error) if it fails or panics
    pub async fn route_request(&self, ctx: CallContext, call: Call) -> HandlerResult {
        let Some(route) = self.routes.get(&call.name) else {
            warn!(name = %call.name, "Request for unknown API");
            return Err(Error::unknown_api(&call.name));
        };
        Self::invoke(&route.handler, ctx, call).await
    }

    /// Serves an inbound event. Any return value is discarded.
    ///
    /// # Errors
    ///
    /// - [`Error::UnknownEvent`] if `call.name` is not registered
    /// - the handler's failure, converted as for requests
    pub async fn route_event(&self, ctx: CallContext, call: Call) -> Result<()> {
        let Some(route) = self.routes.get(&call.name) else {
            warn!(name = %call.name, "Event for unknown name");
            return Err(Error::unknown_event(&call.name));
        };
        Self::invoke(&route.handler, ctx, call).await.map(drop)
    }

    async fn invoke(handler: &BoxedHandler, ctx: CallContext, call: Call) -> HandlerResult {
        let outcome = AssertUnwindSafe(handler.call(ctx.clone(), call))
            .catch_unwind()
            .instrument(ctx.span().clone())
            .await;

        let result = match outcome {
            Ok(result) => result,
            Err(panic) => Err(Error::handler(codes::HANDLER_PANIC, panic_message(&*panic))),
        };

        let elapsed_ms = u64::try_from(ctx.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &result {
            Ok(_) => debug!(label = %ctx.label(), elapsed_ms, "Handler completed"),
            Err(e) => warn!(label = %ctx.label(), elapsed_ms, code = e.code(), error = %e, "Handler failed"),
        }
        result
    }
}

/// Extracts a readable message from a panic payload.
fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "handler panicked".to_string()
    }
}

// ============================================================================
// Tests
// ============================================================================
