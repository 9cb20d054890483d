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

//! Invocation serialization.
//!
//! The persisted format is an implementation detail; it only needs to stay
//! stable within one deployment's lifecycle. The default serializer writes
//! JSON with the tagged argument whitelist from
//! [`crate::invocation::InvocationArg`]. Values JSON cannot represent
//! (non-finite doubles) are rejected at serialize time, before the entry is
//! persisted.

use crate::error::SerializationError;
use crate::invocation::{Invocation, InvocationArg};

/// Converts invocations to and from their persisted text form.
pub trait InvocationSerializer: Send + Sync {
    fn serialize(&self, invocation: &Invocation) -> Result<String, SerializationError>;
    fn deserialize(&self, text: &str) -> Result<Invocation, SerializationError>;
}

/// The default JSON serializer.
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonInvocationSerializer;

impl JsonInvocationSerializer {
    fn check_supported(invocation: &Invocation) -> Result<(), SerializationError> {
        for arg in &invocation.args {
            if let InvocationArg::Double(d) = arg {
                if !d.is_finite() {
                    return Err(SerializationError::Unsupported(format!(
                        "non-finite double `{}` in {}",
                        d, invocation
                    )));
                }
            }
        }
        Ok(())
    }
}

impl InvocationSerializer for JsonInvocationSerializer {
    fn serialize(&self, invocation: &Invocation) -> Result<String, SerializationError> {
        Self::check_supported(invocation)?;
        Ok(serde_json::to_string(invocation)?)
    }

    fn deserialize(&self, text: &str) -> Result<Invocation, SerializationError> {
        Ok(serde_json::from_str(text)?)
    }
}
