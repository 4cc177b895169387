// Copyright 2018 Google LLC
//
// Use of this source code is governed by an MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT.

//! The schema-typed message contract (spec §3, §6).
//!
//! Real deployments would have a schema compiler plugin emit these impls;
//! this crate only promises the contract. [`Message`] is object-safe so the
//! framework can hold `Box<dyn Message>`/`&dyn Message` without knowing the
//! concrete wire type, while the blanket impl below means any
//! `Serialize + DeserializeOwned` struct gets it for free.

use crate::error::RpcError;
use serde::de::DeserializeOwned;
use serde::Serialize;

/// A schema-typed RPC message body.
///
/// `is_initialized` stands in for the protobuf `IsInitialized()` check
/// spec §7's `RequestValidationError` is raised from; types with no
/// required-field invariant can rely on the default.
pub trait Message: Send + Sync + 'static {
    /// The fully qualified schema name, used as the CRC32 seed for the
    /// structured-exception registry (spec §4.7).
    fn type_name(&self) -> &'static str;

    /// Whether the message satisfies its schema's required-field
    /// invariant. Defaults to always-initialized.
    fn is_initialized(&self) -> bool {
        true
    }

    fn encode(&self) -> Result<Vec<u8>, RpcError>;

    fn decode_into(&mut self, bytes: &[u8]) -> Result<(), RpcError>;

    /// Downcasting hooks so a hand-written (or generated) [`crate::service::Service`]
    /// impl can recover the concrete `Request<T>`/`Response<T>` it created,
    /// the way the C++ original's generated `CallMethod` `static_cast`s its
    /// type-erased arguments back to the types it knows it built.
    ///
    /// Required rather than defaulted: a default body coercing `&Self` to
    /// `&dyn Any` needs `Self: Sized`, which this trait's own object-safety
    /// (`&dyn Message`/`Box<dyn Message>` throughout `sink.rs`/`channel.rs`)
    /// rules out. Every implementor below supplies the one-line body.
    fn as_any(&self) -> &dyn std::any::Any;

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any;
}

/// Any `Serialize + DeserializeOwned` type can serve as a wire message via
/// `bincode`, the codec this crate standardizes on for message bodies.
pub trait BincodeMessage: Serialize + DeserializeOwned + Send + Sync + 'static {
    const TYPE_NAME: &'static str;
}

impl<T: BincodeMessage> Message for T {
    fn type_name(&self) -> &'static str {
        T::TYPE_NAME
    }

    fn encode(&self) -> Result<Vec<u8>, RpcError> {
        Ok(bincode::serialize(self)?)
    }

    fn decode_into(&mut self, bytes: &[u8]) -> Result<(), RpcError> {
        *self = bincode::deserialize(bytes)?;
        Ok(())
    }

    fn as_any(&self) -> &dyn std::any::Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn std::any::Any {
        self
    }
}

/// Declares a type as a schema message with the given fully qualified name,
/// implementing [`BincodeMessage`] (and, through it, [`Message`]). Generated
/// code would emit one of these per schema message; this is the hand-written
/// equivalent used by this crate's own tests and demos.
#[macro_export]
macro_rules! schema_message {
    ($ty:ty, $name:literal) => {
        impl $crate::message::BincodeMessage for $ty {
            const TYPE_NAME: &'static str = $name;
        }
    };
}
