// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-module wrapping toolkit handed to instrumentation hooks.
//!
//! A [`Shim`] is created for every module copy the agent instruments. Wrapping goes through the
//! agent's [`WrapperRegistry`] so the same export is never wrapped twice for one module copy and
//! a failed hook can be undone. Wrappers keep the original's name and constructibility and pass
//! the invocation through untouched apart from the tracing they add.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

use serde_json::{Map, Value};
use tracing::debug;

use crate::agent::Agent;
use crate::context::{self, ContextFutureExt};
use crate::error::LoadError;
use crate::module::{
    resolver, CallResult, Completion, Exports, Function, Invocation, ModuleIdentity, ModuleLoader,
    ModuleRecord, StreamSummary,
};
use crate::transaction::Segment;

pub mod registry;

pub use registry::{Checkpoint, WrapKey, WrapperRegistry};

/// Runs once the recorded operation finished, before its segment closes.
pub type AfterHook = Box<dyn FnOnce(&Shim, &Segment, &CallResult) + Send + 'static>;

/// Runs once a recorded stream ended, failed or was dropped, before its segment closes.
pub type StreamHook = Box<dyn FnOnce(&Shim, &Segment, &StreamSummary) + Send + 'static>;

type Describe = dyn Fn(&Shim, &Invocation) -> Option<RecordSpec> + Send + Sync;

/// How one call of a recorded function is traced.
pub struct RecordSpec {
    pub name: String,
    pub attributes: Map<String, Value>,
    pub after: Option<AfterHook>,
    pub after_stream: Option<StreamHook>,
}

impl RecordSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            attributes: Map::new(),
            after: None,
            after_stream: None,
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.to_string(), value.into());
        self
    }

    #[must_use]
    pub fn after(
        mut self,
        hook: impl FnOnce(&Shim, &Segment, &CallResult) + Send + 'static,
    ) -> Self {
        self.after = Some(Box::new(hook));
        self
    }

    /// Used instead of `after` when the call answers with a stream.
    #[must_use]
    pub fn after_stream(
        mut self,
        hook: impl FnOnce(&Shim, &Segment, &StreamSummary) + Send + 'static,
    ) -> Self {
        self.after_stream = Some(Box::new(hook));
        self
    }
}

impl fmt::Debug for RecordSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecordSpec")
            .field("name", &self.name)
            .field("attributes", &self.attributes)
            .field("after", &self.after.is_some())
            .field("after_stream", &self.after_stream.is_some())
            .finish()
    }
}

pub struct Shim {
    agent: Arc<Agent>,
    loader: Weak<ModuleLoader>,
    module_name: String,
    record: Option<Arc<ModuleRecord>>,
    identity: ModuleIdentity,
}

impl Shim {
    pub(crate) fn new(
        agent: Arc<Agent>,
        loader: Weak<ModuleLoader>,
        module_name: &str,
        record: Option<Arc<ModuleRecord>>,
        identity: ModuleIdentity,
    ) -> Self {
        Self {
            agent,
            loader,
            module_name: module_name.to_string(),
            record,
            identity,
        }
    }

    /// A shim for a module the agent never saw being loaded. It can wrap and record but has no
    /// module root to resolve from.
    pub fn detached(agent: Arc<Agent>, module_name: &str) -> Arc<Self> {
        Arc::new(Self::new(
            agent,
            Weak::new(),
            module_name,
            None,
            ModuleIdentity::synthetic(module_name),
        ))
    }

    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    pub fn module_name(&self) -> &str {
        &self.module_name
    }

    pub fn module_root(&self) -> Option<&Path> {
        self.record.as_ref().map(|record| record.root.as_path())
    }

    pub fn module_version(&self) -> &str {
        &self.identity.version
    }

    pub fn identity(&self) -> &ModuleIdentity {
        &self.identity
    }

    pub fn module_record(&self) -> Option<&ModuleRecord> {
        self.record.as_deref()
    }

    /// Loads `specifier` relative to this module's root rather than the caller's location.
    pub fn require(&self, specifier: &str) -> Result<Exports, LoadError> {
        let root = self
            .module_root()
            .ok_or_else(|| LoadError::NoModuleRoot(self.module_name.clone()))?;
        let loader = self.loader.upgrade().ok_or(LoadError::LoaderGone)?;

        let specifier = if specifier.starts_with('.') || Path::new(specifier).is_absolute() {
            specifier.to_string()
        } else {
            format!("./{specifier}")
        };
        let file = resolver::resolve(root, &specifier)?;
        loader.load_file(&file)
    }

    /// Replaces the function at `path` with `factory(original)`. A missing path or a path
    /// already wrapped for this module copy leaves `exports` untouched and returns `false`.
    pub fn wrap<F>(self: &Arc<Self>, exports: &mut Exports, path: &str, factory: F) -> bool
    where
        F: FnOnce(&Arc<Shim>, &Function) -> Function,
    {
        if self.agent.wrappers().is_wrapped(&self.identity, path) {
            debug!(
                "{} is already wrapped for {}@{}",
                path, self.module_name, self.identity.version
            );
            return false;
        }
        let Some(original) = exports.get_function(path).cloned() else {
            debug!(
                "Not wrapping missing export {} of {}@{}",
                path, self.module_name, self.identity.version
            );
            return false;
        };

        let wrapped = self.wrap_function(&original, factory);
        exports.replace_function(path, wrapped);
        self.agent.wrappers().insert(&self.identity, path, original);
        debug!(
            "Wrapped {} of {}@{}",
            path, self.module_name, self.identity.version
        );
        true
    }

    /// Builds a wrapper around a single function without touching any exports.
    pub fn wrap_function<F>(self: &Arc<Self>, original: &Function, factory: F) -> Function
    where
        F: FnOnce(&Arc<Shim>, &Function) -> Function,
    {
        original.with_body_of(factory(self, original))
    }

    /// Puts the original back at `path`.
    pub fn unwrap(&self, exports: &mut Exports, path: &str) -> bool {
        match self.agent.wrappers().remove(&self.identity, path) {
            Some(original) => exports.replace_function(path, original).is_some(),
            None => false,
        }
    }

    pub fn is_wrapped(&self, path: &str) -> bool {
        self.agent.wrappers().is_wrapped(&self.identity, path)
    }

    /// Wraps the function at `path` so each call is timed as a segment.
    pub fn record<D>(self: &Arc<Self>, exports: &mut Exports, path: &str, describe: D) -> bool
    where
        D: Fn(&Shim, &Invocation) -> Option<RecordSpec> + Send + Sync + 'static,
    {
        self.wrap(exports, path, |shim, original| {
            shim.record_function(original, describe)
        })
    }

    /// Returns a wrapper that opens a segment under the active one for every call `describe`
    /// accepts, and closes it on synchronous return, callback invocation, deferred completion
    /// or the end of a returned stream. Outside a transaction the original runs untouched.
    pub fn record_function<D>(self: &Arc<Self>, original: &Function, describe: D) -> Function
    where
        D: Fn(&Shim, &Invocation) -> Option<RecordSpec> + Send + Sync + 'static,
    {
        let shim = Arc::clone(self);
        let original = original.clone();
        let describe: Arc<Describe> = Arc::new(describe);
        let name = original.name().to_string();

        Function::new(&name, move |mut invocation: Invocation| {
            let Some(spec) = describe(&shim, &invocation) else {
                return original.invoke(invocation);
            };
            let caller = context::current();
            let Some(segment) = caller.create_segment(&spec.name) else {
                return original.invoke(invocation);
            };
            for (key, value) in spec.attributes {
                segment.add_attribute(&key, value);
            }
            let after = spec.after;
            let after_stream = spec.after_stream;
            let _guard = context::enter(segment.context());

            if let Some(callback) = invocation.callback.take() {
                let completer = Arc::new(Completer::new(&shim, &segment, after));
                let on_callback = Arc::clone(&completer);
                invocation.callback = Some(Box::new(move |result: CallResult| {
                    on_callback.complete(&result);
                    context::run_in_context(caller, || callback(result));
                }));
                let completion = original.invoke(invocation);
                // A synchronous failure means the callback will never run.
                if let Completion::Ready(result) = &completion {
                    if result.is_err() {
                        completer.complete(result);
                    }
                }
                return completion;
            }

            match original.invoke(invocation) {
                Completion::Ready(result) => {
                    finish(&shim, &segment, after, &result);
                    Completion::Ready(result)
                }
                Completion::Deferred(future) => {
                    let shim = Arc::clone(&shim);
                    let context = segment.context();
                    Completion::deferred(
                        async move {
                            let result = future.await;
                            finish(&shim, &segment, after, &result);
                            result
                        }
                        .in_context(context),
                    )
                }
                Completion::Stream(stream) => {
                    let shim = Arc::clone(&shim);
                    Completion::Stream(stream.on_end(move |summary| {
                        if let Some(after_stream) = after_stream {
                            after_stream(&shim, &segment, summary);
                        }
                        segment.end();
                    }))
                }
            }
        })
    }

    pub fn get_active_segment(&self) -> Option<Segment> {
        context::current_segment()
    }

    /// Opens a child of the active segment without making it current.
    pub fn create_segment(&self, name: &str) -> Option<Segment> {
        context::current().create_segment(name)
    }
}

fn finish(shim: &Shim, segment: &Segment, after: Option<AfterHook>, result: &CallResult) {
    if let Some(after) = after {
        after(shim, segment, result);
    }
    segment.end();
}

/// Finishes a callback-style call once, whether the callback or a synchronous error comes first.
struct Completer {
    shim: Arc<Shim>,
    segment: Segment,
    done: AtomicBool,
    after: Mutex<Option<AfterHook>>,
}

impl Completer {
    fn new(shim: &Arc<Shim>, segment: &Segment, after: Option<AfterHook>) -> Self {
        Self {
            shim: Arc::clone(shim),
            segment: segment.clone(),
            done: AtomicBool::new(false),
            after: Mutex::new(after),
        }
    }

    fn complete(&self, result: &CallResult) {
        if self.done.swap(true, Ordering::SeqCst) {
            return;
        }
        let after = self
            .after
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        finish(&self.shim, &self.segment, after, result);
    }
}

impl fmt::Debug for Shim {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Shim")
            .field("module_name", &self.module_name)
            .field("identity", &self.identity)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AgentConfig;
    use crate::context::run_in_context;
    use crate::error::CallError;
    use crate::transaction::TransactionKind;
    use serde_json::json;
    use std::sync::Mutex;

    fn shim() -> Arc<Shim> {
        Shim::detached(Agent::new(AgentConfig::default()), "pkg")
    }

    fn echo() -> Function {
        Function::constructor("echo", |invocation| {
            Completion::ok(json!({
                "this": invocation.receiver().cloned(),
                "args": invocation.args,
                "construct": invocation.is_construct(),
            }))
        })
    }

    #[test]
    fn test_wrap_missing_target_is_noop() {
        let shim = shim();
        let mut exports = Exports::new().with_value("version", json!("1.0.0"));
        assert!(!shim.wrap(&mut exports, "query", |_, original| original.clone()));
        assert!(!shim.wrap(&mut exports, "version", |_, original| original.clone()));
        assert!(!shim.is_wrapped("query"));
    }

    #[test]
    fn test_wrap_is_idempotent_and_reversible() {
        let shim = shim();
        let mut exports = Exports::new().with_function("echo", echo());
        let original = exports.get_function("echo").cloned().expect("echo");

        assert!(shim.wrap(&mut exports, "echo", |_, original| original.clone()));
        assert!(!shim.wrap(&mut exports, "echo", |_, original| original.clone()));
        assert!(shim.is_wrapped("echo"));

        assert!(shim.unwrap(&mut exports, "echo"));
        assert!(exports
            .get_function("echo")
            .expect("echo")
            .same_as(&original));
        assert!(!shim.unwrap(&mut exports, "echo"));
    }

    #[test]
    fn test_wrapper_forwards_receiver_args_and_construct() {
        let shim = shim();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let wrapped = shim.wrap_function(&echo(), move |_, original| {
            let original = original.clone();
            let counter = Arc::clone(&counter);
            Function::new("ignored", move |invocation| {
                *counter.lock().expect("lock") += 1;
                original.invoke(invocation)
            })
        });

        assert_eq!(wrapped.name(), "echo");
        assert!(wrapped.is_constructible());

        let result = wrapped
            .call_method(json!({"id": 1}), vec![json!("a")])
            .try_ready()
            .expect("ready");
        assert_eq!(
            result,
            Ok(json!({"this": {"id": 1}, "args": ["a"], "construct": false}))
        );
        let constructed = wrapped.construct(vec![]).try_ready().expect("ready");
        assert_eq!(constructed.expect("constructed")["construct"], json!(true));
        assert_eq!(*calls.lock().expect("lock"), 2);
    }

    #[test]
    fn test_record_outside_transaction_calls_original() {
        let shim = shim();
        let recorded = shim.record_function(&echo(), |_, _| Some(RecordSpec::new("Custom/echo")));
        let result = recorded.call(vec![json!(1)]).try_ready().expect("ready");
        assert!(result.is_ok());
    }

    #[test]
    fn test_record_sync_and_callback_styles() {
        let shim = shim();
        let tx = shim
            .agent()
            .start_transaction(TransactionKind::Background, "job")
            .expect("transaction");
        let recorded = shim.record_function(&echo(), |_, invocation| {
            let style = if invocation.has_callback() { "callback" } else { "sync" };
            Some(
                RecordSpec::new(format!("Custom/{style}"))
                    .with_attribute("style", style)
                    .after(|_, segment, result| {
                        segment.add_attribute("ok", result.is_ok());
                    }),
            )
        });

        let callback_context = Arc::new(Mutex::new(None));
        run_in_context(crate::context::Context::for_transaction(&tx), || {
            recorded.call(vec![]).try_ready().expect("ready").expect("ok");

            let seen = Arc::clone(&callback_context);
            let callback_style = Function::new("cb", move |invocation: Invocation| {
                if let Some(callback) = invocation.callback {
                    callback(Ok(json!("done")));
                }
                Completion::ok(Value::Null)
            });
            let recorded_cb = shim.record_function(&callback_style, |_, _| {
                Some(RecordSpec::new("Custom/callback"))
            });
            let invocation = Invocation::plain(vec![]).with_callback(move |_| {
                *seen.lock().expect("lock") = crate::context::current().segment_id();
            });
            let _ = recorded_cb.invoke(invocation);
        });

        let children = tx.root().children();
        assert_eq!(children.len(), 2);
        assert_eq!(children[0].name(), "Custom/sync");
        assert_eq!(children[0].attribute("ok"), Some(json!(true)));
        assert_eq!(children[0].attribute("style"), Some(json!("sync")));
        assert!(!children[0].is_open());
        assert_eq!(children[1].name(), "Custom/callback");
        assert!(!children[1].is_open());
        assert_eq!(*callback_context.lock().expect("lock"), Some(tx.root_id()));
    }

    #[test]
    fn test_record_callback_style_synchronous_error_ends_segment() {
        let shim = shim();
        let tx = shim
            .agent()
            .start_transaction(TransactionKind::Background, "job")
            .expect("transaction");
        let rejecting = Function::new("validate", |_| {
            Completion::err(CallError::new("TypeError", "missing argument"))
        });
        let after_ran = Arc::new(Mutex::new(None));
        let seen = Arc::clone(&after_ran);
        let recorded = shim.record_function(&rejecting, move |_, _| {
            let seen = Arc::clone(&seen);
            Some(RecordSpec::new("Custom/validate").after(move |_, _, result| {
                *seen.lock().expect("lock") = Some(result.is_err());
            }))
        });
        let callback_calls = Arc::new(Mutex::new(0));
        let calls = Arc::clone(&callback_calls);

        let result = run_in_context(crate::context::Context::for_transaction(&tx), || {
            let invocation = Invocation::plain(vec![]).with_callback(move |_| {
                *calls.lock().expect("lock") += 1;
            });
            recorded.invoke(invocation).try_ready().expect("ready")
        });

        assert!(result.is_err());
        let segment = tx.root().children().pop().expect("segment");
        assert!(!segment.is_open());
        assert_eq!(*after_ran.lock().expect("lock"), Some(true));
        assert_eq!(*callback_calls.lock().expect("lock"), 0);
    }

    #[test]
    fn test_record_callback_after_hook_runs_once() {
        let shim = shim();
        let tx = shim
            .agent()
            .start_transaction(TransactionKind::Background, "job")
            .expect("transaction");
        let calls_back_then_fails = Function::new("both", |invocation: Invocation| {
            if let Some(callback) = invocation.callback {
                callback(Err(CallError::message("late")));
            }
            Completion::err(CallError::message("late"))
        });
        let after_calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&after_calls);
        let recorded = shim.record_function(&calls_back_then_fails, move |_, _| {
            let counter = Arc::clone(&counter);
            Some(RecordSpec::new("Custom/both").after(move |_, _, _| {
                *counter.lock().expect("lock") += 1;
            }))
        });

        run_in_context(crate::context::Context::for_transaction(&tx), || {
            let _ = recorded.invoke(Invocation::plain(vec![]).with_callback(|_| {}));
        });
        assert_eq!(*after_calls.lock().expect("lock"), 1);
    }

    #[tokio::test]
    async fn test_record_deferred_completion_ends_segment() {
        let shim = shim();
        let tx = shim
            .agent()
            .start_transaction(TransactionKind::Web, "/async")
            .expect("transaction");
        let deferred = Function::new("later", |_| {
            Completion::deferred(async {
                tokio::task::yield_now().await;
                let active = crate::context::current_segment().map(|segment| segment.name());
                Err(CallError::message(active.unwrap_or_default()))
            })
        });
        let recorded = shim.record_function(&deferred, |_, _| Some(RecordSpec::new("Custom/later")));

        let completion = run_in_context(crate::context::Context::for_transaction(&tx), || {
            recorded.call(vec![])
        });
        let segment = tx.root().children().pop().expect("segment");
        assert!(segment.is_open());

        let result = completion.resolve().await;
        assert_eq!(result.unwrap_err().message, "Custom/later");
        assert!(!segment.is_open());
    }

    #[tokio::test]
    async fn test_record_stream_spans_until_stream_ends() {
        let shim = shim();
        let tx = shim
            .agent()
            .start_transaction(TransactionKind::Web, "/stream")
            .expect("transaction");
        let streaming = Function::new("chunks", |_| {
            Completion::stream(crate::module::ChunkStream::from_items(vec![
                Ok(json!("a")),
                Ok(json!("b")),
            ]))
        });
        let recorded = shim.record_function(&streaming, |_, _| {
            Some(
                RecordSpec::new("Custom/stream").after_stream(|_, segment, summary| {
                    segment.add_attribute("chunks", summary.chunks.len());
                }),
            )
        });

        let completion = run_in_context(crate::context::Context::for_transaction(&tx), || {
            recorded.call(vec![])
        });
        let segment = tx.root().children().pop().expect("segment");
        assert!(segment.is_open());

        let chunks = completion.resolve().await.expect("chunks");
        assert_eq!(chunks, json!(["a", "b"]));
        assert!(!segment.is_open());
        assert_eq!(segment.attribute("chunks"), Some(json!(2)));
    }

    #[test]
    fn test_require_without_module_root() {
        let shim = shim();
        assert!(matches!(
            shim.require("lib/internal"),
            Err(LoadError::NoModuleRoot(_))
        ));
    }
}
