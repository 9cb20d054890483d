/*
 *  Copyright 2025-2026 Colliery Software
 *
 *  Licensed under the Apache License, Version 2.0 (the "License");
 *  you may not use this file except in compliance with the License.
 *  You may obtain a copy of the License at
 *
 *      http://www.apache.org/licenses/LICENSE-2.0
 *
 *  Unless required by applicable law or agreed to in writing, software
 *  distributed under the License is distributed on an "AS IS" BASIS,
 *  WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
 *  See the License for the specific language governing permissions and
 *  limitations under the License.
 */

//! Invocation model.
//!
//! An [`Invocation`] describes one deferred call: the symbolic name of a
//! registered target, a method name, and an argument list. Arguments are
//! drawn from a closed whitelist of shapes ([`InvocationArg`]); the serde
//! tag on each argument doubles as its parameter-type name, so the record
//! is self-describing on any node that later runs it.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// One argument of a deferred call.
///
/// The variants are the supported argument kinds; anything else must be
/// wrapped in [`InvocationArg::Json`] by the caller. Binary payloads ride
/// in [`InvocationArg::Bytes`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum InvocationArg {
    Null,
    Bool(bool),
    Int(i64),
    Double(f64),
    Text(String),
    Timestamp(DateTime<Utc>),
    Date(NaiveDate),
    Duration(Duration),
    Bytes(Vec<u8>),
    Json(serde_json::Value),
}

impl InvocationArg {
    /// The parameter-type name carried by the serialized form.
    pub fn type_name(&self) -> &'static str {
        match self {
            InvocationArg::Null => "null",
            InvocationArg::Bool(_) => "bool",
            InvocationArg::Int(_) => "int",
            InvocationArg::Double(_) => "double",
            InvocationArg::Text(_) => "text",
            InvocationArg::Timestamp(_) => "timestamp",
            InvocationArg::Date(_) => "date",
            InvocationArg::Duration(_) => "duration",
            InvocationArg::Bytes(_) => "bytes",
            InvocationArg::Json(_) => "json",
        }
    }
}

/// A deferred method call, as persisted in the outbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invocation {
    /// Symbolic name of the registered target.
    pub target: String,
    /// Method to dispatch on the target.
    pub method: String,
    /// Positional arguments.
    pub args: Vec<InvocationArg>,
}

impl Invocation {
    pub fn new(
        target: impl Into<String>,
        method: impl Into<String>,
        args: Vec<InvocationArg>,
    ) -> Self {
        Self {
            target: target.into(),
            method: method.into(),
            args,
        }
    }

    /// The parameter-type names of the argument list, in order.
    pub fn parameter_types(&self) -> Vec<&'static str> {
        self.args.iter().map(InvocationArg::type_name).collect()
    }
}

impl fmt::Display for Invocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}({})", self.target, self.method, self.parameter_types().join(", "))
    }
}
