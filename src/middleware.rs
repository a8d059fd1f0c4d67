//! Onion-model middleware pipeline.
//!
//! Two independent chains, send and receive. Each middleware wraps the
//! rest of its chain: pre-work, an awaited call into [`Next`], post-work
//! on the unwind. The chain is driven by an indexed cursor rather than
//! nested closures, so depth is bounded and a `should_skip` set anywhere
//! stops both the remaining middleware and the terminal action.
//!
//! The terminal action is the caller's: on the send chain the facade
//! feeds the final `data` to the codec and adapter; on the receive chain
//! it reads the final `data` back out of the context.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use serde_json::Value;

use crate::error::Result;
use crate::id::now_millis;
use crate::BoxFuture;

/// Which chain an invocation is traversing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Send,
    Receive,
}

/// Mutable context threaded through one pipeline invocation.
#[derive(Debug)]
pub struct MiddlewareContext {
    /// The payload; middleware may replace it wholesale.
    pub data: Value,
    pub direction: Direction,
    /// `type` field of the payload at invocation time, if any.
    pub msg_type: Option<String>,
    /// `id` field of the payload at invocation time, if any.
    pub id: Option<String>,
    /// Milliseconds since the Unix epoch at invocation.
    pub timestamp: u64,
    /// Scratch space shared along the chain.
    pub meta: HashMap<String, Value>,
    /// When set, the rest of the chain and the terminal action are
    /// skipped and the invocation completes normally.
    pub should_skip: bool,
}

impl MiddlewareContext {
    /// Build a context around a payload, capturing its `type`/`id`.
    pub fn new(data: Value, direction: Direction) -> Self {
        let msg_type = data
            .get("type")
            .and_then(Value::as_str)
            .map(str::to_string);
        let id = data.get("id").and_then(Value::as_str).map(str::to_string);
        Self {
            data,
            direction,
            msg_type,
            id,
            timestamp: now_millis(),
            meta: HashMap::new(),
            should_skip: false,
        }
    }
}

/// One layer of the onion.
pub trait Middleware: Send + Sync {
    fn handle<'a>(
        &'a self,
        ctx: &'a mut MiddlewareContext,
        next: Next<'a>,
    ) -> BoxFuture<'a, Result<()>>;
}

/// Cursor into the remainder of a chain.
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    index: usize,
}

impl<'a> Next<'a> {
    /// Run the rest of the chain.
    pub async fn run(self, ctx: &mut MiddlewareContext) -> Result<()> {
        if ctx.should_skip {
            return Ok(());
        }
        let Some(mw) = self.chain.get(self.index) else {
            return Ok(());
        };
        mw.handle(
            ctx,
            Next {
                chain: self.chain,
                index: self.index + 1,
            },
        )
        .await
    }
}

/// Wrap a synchronous pre-work closure as a middleware.
///
/// The closure runs, then the rest of the chain; there is no post-work.
pub fn from_fn<F>(f: F) -> Arc<dyn Middleware>
where
    F: Fn(&mut MiddlewareContext) -> Result<()> + Send + Sync + 'static,
{
    struct FnMiddleware<F>(F);

    impl<F> Middleware for FnMiddleware<F>
    where
        F: Fn(&mut MiddlewareContext) -> Result<()> + Send + Sync + 'static,
    {
        fn handle<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            next: Next<'a>,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                (self.0)(ctx)?;
                next.run(ctx).await
            })
        }
    }

    Arc::new(FnMiddleware(f))
}

/// Policy for payloads a [`validator`] rejects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnInvalid {
    /// Drop the payload silently; the invocation completes normally.
    Skip,
    /// Fail the invocation with a protocol error.
    Fail,
}

/// Middleware enforcing a payload schema check.
///
/// `check` returns a rejection reason for invalid payloads; the policy
/// decides whether those are dropped (`should_skip`) or surfaced as
/// [`WireError::Protocol`].
///
/// [`WireError::Protocol`]: crate::WireError::Protocol
pub fn validator<F>(check: F, on_invalid: OnInvalid) -> Arc<dyn Middleware>
where
    F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
{
    struct Validator<F> {
        check: F,
        on_invalid: OnInvalid,
    }

    impl<F> Middleware for Validator<F>
    where
        F: Fn(&Value) -> std::result::Result<(), String> + Send + Sync + 'static,
    {
        fn handle<'a>(
            &'a self,
            ctx: &'a mut MiddlewareContext,
            next: Next<'a>,
        ) -> BoxFuture<'a, Result<()>> {
            Box::pin(async move {
                if let Err(reason) = (self.check)(&ctx.data) {
                    match self.on_invalid {
                        OnInvalid::Skip => {
                            tracing::debug!(%reason, "validator dropped payload");
                            ctx.should_skip = true;
                            return Ok(());
                        }
                        OnInvalid::Fail => {
                            return Err(crate::error::WireError::Protocol(reason));
                        }
                    }
                }
                next.run(ctx).await
            })
        }
    }

    Arc::new(Validator { check, on_invalid })
}

/// Middleware tracing every payload that crosses it.
pub fn logging(label: impl Into<String>) -> Arc<dyn Middleware> {
    let label = label.into();
    from_fn(move |ctx| {
        tracing::debug!(
            label = %label,
            direction = ?ctx.direction,
            msg_type = ctx.msg_type.as_deref().unwrap_or("-"),
            "payload through pipeline"
        );
        Ok(())
    })
}

/// The send and receive chains.
pub struct MiddlewarePipeline {
    send: Mutex<Vec<Arc<dyn Middleware>>>,
    receive: Mutex<Vec<Arc<dyn Middleware>>>,
}

impl MiddlewarePipeline {
    /// Two empty chains.
    pub fn new() -> Self {
        Self {
            send: Mutex::new(Vec::new()),
            receive: Mutex::new(Vec::new()),
        }
    }

    /// Register on both chains.
    pub fn use_both(&self, mw: Arc<dyn Middleware>) {
        self.send.lock().unwrap().push(mw.clone());
        self.receive.lock().unwrap().push(mw);
    }

    /// Register on the send chain only.
    pub fn use_send(&self, mw: Arc<dyn Middleware>) {
        self.send.lock().unwrap().push(mw);
    }

    /// Register on the receive chain only.
    pub fn use_receive(&self, mw: Arc<dyn Middleware>) {
        self.receive.lock().unwrap().push(mw);
    }

    /// Run `ctx` through the chain for its direction.
    ///
    /// Errors propagate out; middleware entered before the failure only
    /// observes it if it wrapped its own `next.run` call.
    pub async fn execute(&self, ctx: &mut MiddlewareContext) -> Result<()> {
        let chain: Vec<Arc<dyn Middleware>> = match ctx.direction {
            Direction::Send => self.send.lock().unwrap().clone(),
            Direction::Receive => self.receive.lock().unwrap().clone(),
        };
        Next {
            chain: &chain,
            index: 0,
        }
        .run(ctx)
        .await
    }

    /// Number of middleware registered on the given chain.
    pub fn len(&self, direction: Direction) -> usize {
        match direction {
            Direction::Send => self.send.lock().unwrap().len(),
            Direction::Receive => self.receive.lock().unwrap().len(),
        }
    }

    /// Whether the given chain is empty.
    pub fn is_empty(&self, direction: Direction) -> bool {
        self.len(direction) == 0
    }

    /// Drop every registered middleware.
    pub fn clear(&self) {
        self.send.lock().unwrap().clear();
        self.receive.lock().unwrap().clear();
    }
}

impl Default for MiddlewarePipeline {
    fn default() -> Self {
        Self::new()
    }
}
