// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The host-side value model for module exports.
//!
//! A loaded module is an [`Exports`] tree. Leaves are either [`Function`]s or plain JSON values,
//! inner nodes are nested objects. Functions are invoked with an [`Invocation`] and report their
//! outcome through a [`Completion`], which covers the ways an operation can finish:
//! synchronous return, a completion callback, a deferred future, or a stream of chunks.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde_json::Value;

use crate::error::CallError;
use crate::module::stream::ChunkStream;
use crate::module::ModuleRecord;
use crate::shim::Shim;

pub type CallResult = Result<Value, CallError>;
pub type BoxFuture<T> = Pin<Box<dyn Future<Output = T> + Send + 'static>>;
pub type Callback = Box<dyn FnOnce(CallResult) + Send + 'static>;

type Body = dyn Fn(Invocation) -> Completion + Send + Sync;

#[derive(Debug, Clone, PartialEq)]
pub enum CallMode {
    Plain,
    /// Called as a method; the receiver is forwarded as `this`.
    Method(Value),
    Construct,
}

pub struct Invocation {
    pub mode: CallMode,
    pub args: Vec<Value>,
    pub callback: Option<Callback>,
}

impl Invocation {
    pub fn plain(args: Vec<Value>) -> Self {
        Self {
            mode: CallMode::Plain,
            args,
            callback: None,
        }
    }

    pub fn method(receiver: Value, args: Vec<Value>) -> Self {
        Self {
            mode: CallMode::Method(receiver),
            args,
            callback: None,
        }
    }

    pub fn construct(args: Vec<Value>) -> Self {
        Self {
            mode: CallMode::Construct,
            args,
            callback: None,
        }
    }

    #[must_use]
    pub fn with_callback(mut self, callback: impl FnOnce(CallResult) + Send + 'static) -> Self {
        self.callback = Some(Box::new(callback));
        self
    }

    pub fn receiver(&self) -> Option<&Value> {
        match &self.mode {
            CallMode::Method(receiver) => Some(receiver),
            _ => None,
        }
    }

    pub fn arg(&self, index: usize) -> Option<&Value> {
        self.args.get(index)
    }

    pub fn is_construct(&self) -> bool {
        self.mode == CallMode::Construct
    }

    pub fn has_callback(&self) -> bool {
        self.callback.is_some()
    }
}

impl fmt::Debug for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Invocation")
            .field("mode", &self.mode)
            .field("args", &self.args)
            .field("callback", &self.callback.is_some())
            .finish()
    }
}

/// How a function call finished (or will finish).
pub enum Completion {
    Ready(CallResult),
    Deferred(BoxFuture<CallResult>),
    Stream(ChunkStream),
}

impl Completion {
    pub fn ok(value: Value) -> Self {
        Self::Ready(Ok(value))
    }

    pub fn err(error: CallError) -> Self {
        Self::Ready(Err(error))
    }

    pub fn deferred<F>(future: F) -> Self
    where
        F: Future<Output = CallResult> + Send + 'static,
    {
        Self::Deferred(Box::pin(future))
    }

    pub fn is_deferred(&self) -> bool {
        matches!(self, Self::Deferred(_))
    }

    pub fn stream(stream: ChunkStream) -> Self {
        Self::Stream(stream)
    }

    /// Waits for the outcome regardless of completion style. A stream is read to its end and
    /// its chunks returned as an array.
    pub async fn resolve(self) -> CallResult {
        match self {
            Self::Ready(result) => result,
            Self::Deferred(future) => future.await,
            Self::Stream(stream) => stream.collect().await.map(Value::Array),
        }
    }

    /// Returns the synchronous outcome, or gives the completion back if it is not ready yet.
    pub fn try_ready(self) -> Result<CallResult, Completion> {
        match self {
            Self::Ready(result) => Ok(result),
            pending => Err(pending),
        }
    }

    /// Returns the stream of a streaming call, or gives the completion back otherwise.
    pub fn into_stream(self) -> Result<ChunkStream, Completion> {
        match self {
            Self::Stream(stream) => Ok(stream),
            other => Err(other),
        }
    }
}

impl fmt::Debug for Completion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready(result) => f.debug_tuple("Ready").field(result).finish(),
            Self::Deferred(_) => f.write_str("Deferred(..)"),
            Self::Stream(stream) => f.debug_tuple("Stream").field(stream).finish(),
        }
    }
}

/// A named host function. Cloning is cheap; clones share the same body.
#[derive(Clone)]
pub struct Function {
    name: Arc<str>,
    constructible: bool,
    body: Arc<Body>,
}

impl Function {
    pub fn new<F>(name: &str, body: F) -> Self
    where
        F: Fn(Invocation) -> Completion + Send + Sync + 'static,
    {
        Self {
            name: Arc::from(name),
            constructible: false,
            body: Arc::new(body),
        }
    }

    /// A function that may also be invoked with [`CallMode::Construct`].
    pub fn constructor<F>(name: &str, body: F) -> Self
    where
        F: Fn(Invocation) -> Completion + Send + Sync + 'static,
    {
        Self {
            constructible: true,
            ..Self::new(name, body)
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_constructible(&self) -> bool {
        self.constructible
    }

    pub fn invoke(&self, invocation: Invocation) -> Completion {
        if invocation.is_construct() && !self.constructible {
            return Completion::err(CallError::type_error(format!(
                "{} is not a constructor",
                self.name
            )));
        }
        (self.body)(invocation)
    }

    pub fn call(&self, args: Vec<Value>) -> Completion {
        self.invoke(Invocation::plain(args))
    }

    pub fn call_method(&self, receiver: Value, args: Vec<Value>) -> Completion {
        self.invoke(Invocation::method(receiver, args))
    }

    pub fn construct(&self, args: Vec<Value>) -> Completion {
        self.invoke(Invocation::construct(args))
    }

    /// True when both handles share one body.
    pub fn same_as(&self, other: &Function) -> bool {
        Arc::ptr_eq(&self.body, &other.body)
    }

    /// Keeps this function's name and constructibility but runs `other`'s body.
    pub(crate) fn with_body_of(&self, other: Function) -> Function {
        Function {
            name: Arc::clone(&self.name),
            constructible: self.constructible,
            body: other.body,
        }
    }
}

impl fmt::Debug for Function {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Function")
            .field("name", &self.name)
            .field("constructible", &self.constructible)
            .finish()
    }
}

#[derive(Clone, Debug)]
pub enum Export {
    Function(Function),
    Object(Exports),
    Value(Value),
}

/// The exports of one loaded module.
#[derive(Clone, Default)]
pub struct Exports {
    callable: Option<Function>,
    entries: BTreeMap<String, Export>,
    record: Option<Arc<ModuleRecord>>,
    shim: Option<Arc<Shim>>,
}

fn split_path(path: &str) -> Vec<&str> {
    path.split('.').filter(|part| !part.is_empty()).collect()
}

impl Exports {
    pub fn new() -> Self {
        Self::default()
    }

    /// Exports whose module value is itself a function.
    pub fn callable(function: Function) -> Self {
        Self {
            callable: Some(function),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_function(mut self, name: &str, function: Function) -> Self {
        self.insert(name, Export::Function(function));
        self
    }

    #[must_use]
    pub fn with_object(mut self, name: &str, object: Exports) -> Self {
        self.insert(name, Export::Object(object));
        self
    }

    #[must_use]
    pub fn with_value(mut self, name: &str, value: Value) -> Self {
        self.insert(name, Export::Value(value));
        self
    }

    pub fn insert(&mut self, name: &str, export: Export) -> Option<Export> {
        self.entries.insert(name.to_string(), export)
    }

    pub fn as_function(&self) -> Option<&Function> {
        self.callable.as_ref()
    }

    pub fn is_callable(&self) -> bool {
        self.callable.is_some()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    /// Looks up a dotted path such as `chat.completions.create`.
    pub fn get(&self, path: &str) -> Option<&Export> {
        let parts = split_path(path);
        let (last, parents) = parts.split_last()?;
        let mut current = self;
        for part in parents {
            current = match current.entries.get(*part) {
                Some(Export::Object(object)) => object,
                _ => return None,
            };
        }
        current.entries.get(*last)
    }

    /// Looks up a function by dotted path. The empty path names the module itself.
    pub fn get_function(&self, path: &str) -> Option<&Function> {
        if split_path(path).is_empty() {
            return self.callable.as_ref();
        }
        match self.get(path) {
            Some(Export::Function(function)) => Some(function),
            _ => None,
        }
    }

    fn get_mut(&mut self, path: &str) -> Option<&mut Export> {
        let parts = split_path(path);
        let (last, parents) = parts.split_last()?;
        let mut current: &mut Exports = self;
        for part in parents {
            current = match current.entries.get_mut(*part) {
                Some(Export::Object(object)) => object,
                _ => return None,
            };
        }
        current.entries.get_mut(*last)
    }

    /// Replaces an existing function, returning the previous one. Missing paths and
    /// non-function entries are left alone and yield `None`.
    pub(crate) fn replace_function(&mut self, path: &str, function: Function) -> Option<Function> {
        if split_path(path).is_empty() {
            return match self.callable.as_mut() {
                Some(slot) => Some(std::mem::replace(slot, function)),
                None => None,
            };
        }
        match self.get_mut(path) {
            Some(Export::Function(slot)) => Some(std::mem::replace(slot, function)),
            _ => None,
        }
    }

    pub fn record(&self) -> Option<&ModuleRecord> {
        self.record.as_deref()
    }

    pub(crate) fn set_record(&mut self, record: Arc<ModuleRecord>) {
        self.record = Some(record);
    }

    /// The shim that instrumented these exports, if any.
    pub fn shim(&self) -> Option<&Arc<Shim>> {
        self.shim.as_ref()
    }

    pub(crate) fn set_shim(&mut self, shim: Arc<Shim>) {
        self.shim = Some(shim);
    }
}

impl fmt::Debug for Exports {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Exports")
            .field("callable", &self.callable)
            .field("entries", &self.entries)
            .field("record", &self.record)
            .field("instrumented", &self.shim.is_some())
            .finish()
    }
}
