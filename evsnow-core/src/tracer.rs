//! A small observability seam, deliberately thinner than pulling
//! `tracing`'s macros directly into every module (SPEC_FULL.md's design
//! notes: "replace with a small Tracer interface... default no-op"). The
//! production implementation (in `evsnow-app`) wraps `tracing` spans and
//! counters; tests use [`NoopTracer`] so assertions aren't coupled to log
//! output.

use std::fmt;

/// An attribute value attached to a span or event. Mirrors the handful of
/// scalar types `tracing`'s `Value` trait supports, kept small on purpose.
#[derive(Debug, Clone)]
pub enum AttrValue {
    Str(String),
    Int(i64),
    UInt(u64),
    Float(f64),
    Bool(bool),
}

impl fmt::Display for AttrValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttrValue::Str(v) => write!(f, "{v}"),
            AttrValue::Int(v) => write!(f, "{v}"),
            AttrValue::UInt(v) => write!(f, "{v}"),
            AttrValue::Float(v) => write!(f, "{v}"),
            AttrValue::Bool(v) => write!(f, "{v}"),
        }
    }
}

impl From<&str> for AttrValue {
    fn from(v: &str) -> Self {
        AttrValue::Str(v.to_string())
    }
}
impl From<String> for AttrValue {
    fn from(v: String) -> Self {
        AttrValue::Str(v)
    }
}
impl From<u64> for AttrValue {
    fn from(v: u64) -> Self {
        AttrValue::UInt(v)
    }
}
impl From<i64> for AttrValue {
    fn from(v: i64) -> Self {
        AttrValue::Int(v)
    }
}
impl From<bool> for AttrValue {
    fn from(v: bool) -> Self {
        AttrValue::Bool(v)
    }
}

/// A handle to one open span. Dropping it ends the span.
pub trait SpanHandle: Send {
    fn set_attr(&mut self, key: &'static str, value: AttrValue);
}

/// The engine's only window into structured logging and counters. Every
/// long-running component (`PartitionWorker`, `MappingSupervisor`,
/// `Orchestrator`) takes an `Arc<dyn Tracer>` rather than calling
/// `tracing::*!` macros directly, so unit tests can run silent and the
/// production binary can swap in OTLP export without touching engine
/// code.
pub trait Tracer: Send + Sync {
    /// Open a new span, returning a handle that closes it on drop.
    fn span(&self, name: &'static str, attrs: &[(&'static str, AttrValue)]) -> Box<dyn SpanHandle>;

    /// Emit a point-in-time structured event.
    fn event(&self, name: &'static str, attrs: &[(&'static str, AttrValue)]);

    /// Increment a named counter by `delta`.
    fn counter_add(&self, name: &'static str, delta: u64, attrs: &[(&'static str, AttrValue)]);
}

struct NoopSpan;
impl SpanHandle for NoopSpan {
    fn set_attr(&mut self, _key: &'static str, _value: AttrValue) {}
}

/// A [`Tracer`] that discards everything. The default for unit and
/// integration tests in this workspace.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn span(&self, _name: &'static str, _attrs: &[(&'static str, AttrValue)]) -> Box<dyn SpanHandle> {
        Box::new(NoopSpan)
    }

    fn event(&self, _name: &'static str, _attrs: &[(&'static str, AttrValue)]) {}

    fn counter_add(&self, _name: &'static str, _delta: u64, _attrs: &[(&'static str, AttrValue)]) {}
}
