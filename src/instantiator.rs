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

//! Target dispatch.
//!
//! The instantiator maps the symbolic target name stored in an invocation to
//! a live handler. Registration must happen before the outbox is built, and
//! the same names must be registered on every node that may run entries;
//! an unregistered name is a transient invocation failure that goes through
//! the ordinary retry path.

use crate::error::InvocationError;
use crate::invocation::{Invocation, InvocationArg};
use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// A handler capable of running invocations addressed to one target name.
///
/// Implementations match on the method name and argument list themselves:
///
/// ```rust,ignore
/// #[async_trait]
/// impl InvocationTarget for Mailer {
///     async fn invoke(&self, method: &str, args: &[InvocationArg]) -> Result<(), InvocationError> {
///         match (method, args) {
///             ("send_welcome", [InvocationArg::Text(customer)]) => self.send_welcome(customer).await,
///             _ => Err(InvocationError::UnknownMethod {
///                 target: "mailer".into(),
///                 method: method.into(),
///             }),
///         }
///     }
/// }
/// ```
#[async_trait]
pub trait InvocationTarget: Send + Sync {
    async fn invoke(&self, method: &str, args: &[InvocationArg]) -> Result<(), InvocationError>;
}

/// Registry of invocation targets, keyed by symbolic name.
#[derive(Clone, Default)]
pub struct Instantiator {
    targets: HashMap<String, Arc<dyn InvocationTarget>>,
}

impl Instantiator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a target under `name`, replacing any previous registration.
    pub fn register(&mut self, name: impl Into<String>, target: Arc<dyn InvocationTarget>) {
        let name = name.into();
        debug!("Registered invocation target `{}`", name);
        self.targets.insert(name, target);
    }

    /// Looks up a target by name.
    pub fn get(&self, name: &str) -> Option<Arc<dyn InvocationTarget>> {
        self.targets.get(name).cloned()
    }

    /// Registered target names, for diagnostics.
    pub fn target_names(&self) -> Vec<&str> {
        self.targets.keys().map(String::as_str).collect()
    }

    /// Resolves and runs one invocation.
    pub(crate) async fn invoke(&self, invocation: &Invocation) -> Result<(), InvocationError> {
        let target = self
            .get(&invocation.target)
            .ok_or_else(|| InvocationError::UnknownTarget(invocation.target.clone()))?;
        target.invoke(&invocation.method, &invocation.args).await
    }
}

impl std::fmt::Debug for Instantiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Instantiator")
            .field("targets", &self.targets.keys().collect::<Vec<_>>())
            .finish()
    }
}
