//! The binary object format shared by coordinators and workers.
//!
//! Every payload frame that is not a raw command tag is produced by a
//! [`Serializer`]: task keys, input values, intermediate values, value
//! collections, reduce outputs and the function bodies themselves. Both ends
//! of a job must agree on the format, so it lives in the shared [`Config`].
//!
//! # Examples
//!
//! ```rust
//! use kaylee::serializer::Serializer;
//! use serde::{Serialize, Deserialize};
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Line {
//!    number: u64,
//!    text: String,
//! }
//!
//! let line = Line { number: 7, text: "Call me Ishmael.".to_string() };
//! let bytes = Serializer::Cbor.to_bytes(&line).unwrap();
//! let decoded: Line = Serializer::Cbor.from_bytes(&bytes).unwrap();
//! assert_eq!(line, decoded);
//! ```

use anyhow::Result;
use bytes::Bytes;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Shorthand for the bounds every shipped value must satisfy.
///
/// Values cross task boundaries inside the runtime, hence `Send`, `Sync` and
/// `'static` on top of the serde bounds.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// Serialization format for payload frames.
///
/// The encoding of equal values is stable for a given format, which the
/// coordinator relies on when it groups intermediate values by their
/// serialized key.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Serializes `value` into a frame payload.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Bytes> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?.into()),
            Self::Cbor => {
                let mut buf = Vec::new();
                ciborium::into_writer(value, &mut buf)?;
                Ok(buf.into())
            }
        }
    }

    /// Deserializes a frame payload.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        match config.serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}
