//! Database access seam.
//!
//! The gateway core speaks to the database through two object-safe
//! traits: a `Pool` that hands out request-scoped `Session`s, and the
//! `Session` itself, which executes anonymous blocks with named binds.
//! Dropping a session returns it to its pool; the pipeline relies on
//! that for release-on-every-exit-path. The scripted in-memory
//! implementation lives in [`mock`] and doubles as the demo backend.

use std::collections::HashMap;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub mod mock;

/// Infrastructure-level database failures. Errors raised by executed
/// statements carry the server's code and message; the caller decides
/// whether that is a procedure fault or a resource fault.
#[derive(Debug, Clone, Error)]
pub enum DbError {
    #[error("connection pool exhausted")]
    Exhausted,
    #[error("timed out acquiring a connection after {0} ms")]
    Timeout(u64),
    #[error("database error {code}: {message}")]
    Execution { code: i32, message: String },
    #[error("connection lost")]
    Disconnected,
}

/// One bind parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum BindValue {
    Null,
    Str(String),
    Int(i64),
    StrArray(Vec<String>),
    Raw(Bytes),
}

impl BindValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            BindValue::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_int(&self) -> Option<i64> {
        match self {
            BindValue::Int(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_str_array(&self) -> Option<&[String]> {
        match self {
            BindValue::StrArray(v) => Some(v),
            _ => None,
        }
    }

    pub fn as_raw(&self) -> Option<&Bytes> {
        match self {
            BindValue::Raw(b) => Some(b),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindDirection {
    In,
    Out,
    InOut,
}

/// One named bind: direction, value and, for array binds, the declared
/// capacity the driver must reserve.
#[derive(Debug, Clone, PartialEq)]
pub struct BindSpec {
    pub direction: BindDirection,
    pub value: BindValue,
    pub array_bound: Option<usize>,
}

impl BindSpec {
    pub fn input(value: BindValue) -> Self {
        BindSpec { direction: BindDirection::In, value, array_bound: None }
    }

    pub fn output() -> Self {
        BindSpec { direction: BindDirection::Out, value: BindValue::Null, array_bound: None }
    }

    pub fn in_out(value: BindValue) -> Self {
        BindSpec { direction: BindDirection::InOut, value, array_bound: None }
    }

    pub fn with_bound(mut self, bound: usize) -> Self {
        self.array_bound = Some(bound);
        self
    }
}

/// Ordered collection of named binds. Order matters: the debug error
/// page and the statement text both present binds in declaration order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BindSet {
    entries: Vec<(String, BindSpec)>,
}

impl BindSet {
    pub fn new() -> Self {
        BindSet::default()
    }

    pub fn push(&mut self, name: impl Into<String>, spec: BindSpec) {
        self.entries.push((name.into(), spec));
    }

    pub fn get(&self, name: &str) -> Option<&BindSpec> {
        self.entries.iter().find(|(n, _)| n == name).map(|(_, s)| s)
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, BindSpec)> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Out-bind values produced by one execute.
#[derive(Debug, Clone, Default)]
pub struct ExecOutcome {
    pub out_binds: HashMap<String, BindValue>,
}

impl ExecOutcome {
    pub fn out_str(&self, name: &str) -> Option<&str> {
        self.out_binds.get(name).and_then(|v| v.as_str())
    }

    pub fn out_int(&self, name: &str) -> Option<i64> {
        self.out_binds.get(name).and_then(|v| v.as_int())
    }

    pub fn out_str_array(&self, name: &str) -> Option<&[String]> {
        self.out_binds.get(name).and_then(|v| v.as_str_array())
    }

    pub fn out_raw(&self, name: &str) -> Option<&Bytes> {
        self.out_binds.get(name).and_then(|v| v.as_raw())
    }
}

/// One request-scoped database session. Implementations return the
/// underlying connection to their pool on drop.
#[async_trait]
pub trait Session: Send {
    async fn execute(&mut self, statement: &str, binds: &BindSet) -> Result<ExecOutcome, DbError>;
    async fn commit(&mut self) -> Result<(), DbError>;
    async fn rollback(&mut self) -> Result<(), DbError>;
}

/// Source of sessions, shared across requests.
#[async_trait]
pub trait Pool: Send + Sync {
    async fn acquire(&self) -> Result<Box<dyn Session>, DbError>;
}
