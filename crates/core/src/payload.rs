//! Handler payload format and the registry that restores handlers from it.
//!
//! A payload is `<type-identifier>:<json-body>`. The registry maps each type
//! identifier to a decode routine registered by the application, so the
//! executor can rebuild a handler without knowing its concrete type.

use std::collections::HashMap;

use thiserror::Error;

use crate::handler::{JobHandler, TypedJob};

/// Separates the type identifier from the serialized body.
pub const TYPE_SEPARATOR: char = ':';

/// Errors produced while encoding or decoding handler payloads.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload has no type tag (expected `<type>:<body>`)")]
    MissingTypeTag,

    #[error("no handler registered for type `{0}`")]
    UnknownType(String),

    #[error("malformed `{type_id}` payload: {source}")]
    Malformed {
        type_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize `{type_id}`: {source}")]
    Serialize {
        type_id: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("handler type `{0}` is already registered")]
    AlreadyRegistered(String),

    #[error("invalid handler type identifier `{0}`")]
    InvalidTypeId(String),
}

/// Serialize a handler into its stored form.
pub fn encode<T: TypedJob>(job: &T) -> Result<String, PayloadError> {
    let body = serde_json::to_string(job).map_err(|source| PayloadError::Serialize {
        type_id: T::TYPE.to_string(),
        source,
    })?;
    Ok(format!("{}{TYPE_SEPARATOR}{body}", T::TYPE))
}

/// Split a stored payload into `(type_id, body)`.
pub fn split(payload: &str) -> Result<(&str, &str), PayloadError> {
    match payload.split_once(TYPE_SEPARATOR) {
        Some((type_id, body)) if !type_id.is_empty() => Ok((type_id, body)),
        _ => Err(PayloadError::MissingTypeTag),
    }
}

type DecodeFn = fn(&str) -> Result<Box<dyn JobHandler>, serde_json::Error>;

fn decode_as<T: TypedJob>(body: &str) -> Result<Box<dyn JobHandler>, serde_json::Error> {
    let job: T = serde_json::from_str(body)?;
    Ok(Box::new(job))
}

/// Type identifier -> decode routine.
///
/// Built once during start-up, then shared read-only by workers.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    decoders: HashMap<&'static str, DecodeFn>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `T` under `T::TYPE`.
    pub fn register<T: TypedJob>(&mut self) -> Result<(), PayloadError> {
        let type_id = T::TYPE;
        if type_id.is_empty() || type_id.contains(TYPE_SEPARATOR) {
            return Err(PayloadError::InvalidTypeId(type_id.to_string()));
        }
        if self.decoders.contains_key(type_id) {
            return Err(PayloadError::AlreadyRegistered(type_id.to_string()));
        }
        self.decoders.insert(type_id, decode_as::<T>);
        Ok(())
    }

    /// Builder-style [`register`](Self::register).
    pub fn with<T: TypedJob>(mut self) -> Result<Self, PayloadError> {
        self.register::<T>()?;
        Ok(self)
    }

    /// Rebuild the handler stored in `payload`.
    pub fn decode(&self, payload: &str) -> Result<Box<dyn JobHandler>, PayloadError> {
        let (type_id, body) = split(payload)?;
        let decode = self
            .decoders
            .get(type_id)
            .ok_or_else(|| PayloadError::UnknownType(type_id.to_string()))?;
        decode(body).map_err(|source| PayloadError::Malformed {
            type_id: type_id.to_string(),
            source,
        })
    }

    pub fn contains(&self, type_id: &str) -> bool {
        self.decoders.contains_key(type_id)
    }

    pub fn registered_types(&self) -> Vec<&'static str> {
        let mut types: Vec<_> = self.decoders.keys().copied().collect();
        types.sort_unstable();
        types
    }

    pub fn len(&self) -> usize {
        self.decoders.len()
    }

    pub fn is_empty(&self) -> bool {
        self.decoders.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("types", &self.registered_types())
            .finish()
    }
}
