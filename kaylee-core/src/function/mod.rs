//! User-defined map and reduce functions, and how they are shipped to workers.
//!
//! A function is an ordinary serializable value implementing [`MapFunction`]
//! or [`ReduceFunction`]. Functions are gathered into a closed registry enum
//! with the [`registry!`](crate::registry!) macro; a serialized variant of that
//! enum is the "function body" the coordinator hands to each worker. Workers
//! link against the same registry, so deserializing the body is enough to
//! recover the callable.
//!
//! Inside the runtime everything travels as bytes. The `*_as_bytes` methods
//! bridge the typed user functions and the byte-level protocol: they decode
//! the inputs with the job's [`Serializer`], run the function and encode
//! whatever it emits.
//!
//! # Example
//!
//! ```
//! use kaylee::function::{MapFunction, MapOutput, ReduceFunction};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! pub struct Lengths;
//!
//! impl MapFunction for Lengths {
//!     type Key = u64;
//!     type Value = String;
//!     type OutKey = usize;
//!     type OutValue = u64;
//!
//!     fn map(&self, _line: u64, text: String) -> MapOutput<usize, u64> {
//!         let lengths: Vec<_> = text.split_whitespace().map(|w| Ok((w.len(), 1))).collect();
//!         Ok(Box::new(lengths.into_iter()))
//!     }
//! }
//!
//! #[derive(Serialize, Deserialize, Debug, Clone, Copy)]
//! pub struct Count;
//!
//! impl ReduceFunction for Count {
//!     type Key = usize;
//!     type Value = u64;
//!     type Output = u64;
//!
//!     fn reduce(&self, _length: usize, values: Vec<u64>) -> anyhow::Result<u64> {
//!         Ok(values.into_iter().sum())
//!     }
//! }
//!
//! kaylee::registry! {
//!     pub enum Functions {
//!         map { Lengths(Lengths) }
//!         reduce { Count(Count) }
//!     }
//! }
//! ```

use std::fmt::Debug;

use bytes::Bytes;

use crate::{
    common::KeyValue,
    serializer::{Serializable, Serializer},
};

mod error;
pub use error::{BoxError, FunctionError, Role};

pub type AnyResult<T> = anyhow::Result<T>;

/// What a map function returns: a lazy sequence of intermediate pairs.
///
/// Each item may fail individually; the first failure aborts the task.
pub type MapOutput<K, V> = AnyResult<Box<dyn Iterator<Item = AnyResult<(K, V)>> + Send>>;

/// Serialized intermediate pairs, ready to be framed.
pub type Emissions = Box<dyn Iterator<Item = AnyResult<KeyValue>> + Send>;

/// A user map function.
pub trait MapFunction: Serializable + Clone + Debug {
    type Key: Serializable;
    type Value: Serializable;
    type OutKey: Serializable;
    type OutValue: Serializable;

    fn map(&self, key: Self::Key, value: Self::Value) -> MapOutput<Self::OutKey, Self::OutValue>;

    /// Decode the task frames, run [`MapFunction::map`] and encode the
    /// emitted pairs as they are produced.
    fn map_as_bytes(&self, serializer: Serializer, key: &[u8], value: &[u8]) -> AnyResult<Emissions> {
        let key = serializer
            .from_bytes(key)
            .map_err(|e| FunctionError::malformed("map input key", e))?;
        let value = serializer
            .from_bytes(value)
            .map_err(|e| FunctionError::malformed("map input value", e))?;

        let pairs = self.map(key, value)?;
        Ok(Box::new(pairs.map(move |pair| -> AnyResult<KeyValue> {
            let (key, value) = pair?;
            Ok(KeyValue::new(
                serializer.to_bytes(&key)?,
                serializer.to_bytes(&value)?,
            ))
        })))
    }
}

/// A user reduce function.
pub trait ReduceFunction: Serializable + Clone + Debug {
    type Key: Serializable;
    type Value: Serializable;
    type Output: Serializable;

    fn reduce(&self, key: Self::Key, values: Vec<Self::Value>) -> AnyResult<Self::Output>;

    /// Decode the key and the value collection frame, run
    /// [`ReduceFunction::reduce`] and encode its output.
    ///
    /// The collection frame is a serialized `Vec<Bytes>` whose elements are
    /// the individually serialized intermediate values.
    fn reduce_as_bytes(&self, serializer: Serializer, key: &[u8], values: &[u8]) -> AnyResult<Bytes> {
        let key = serializer
            .from_bytes(key)
            .map_err(|e| FunctionError::malformed("reduce key", e))?;
        let encoded: Vec<Bytes> = serializer
            .from_bytes(values)
            .map_err(|e| FunctionError::malformed("value collection", e))?;
        let values = encoded
            .iter()
            .map(|v| serializer.from_bytes(v))
            .collect::<AnyResult<Vec<_>>>()
            .map_err(|e| FunctionError::malformed("intermediate value", e))?;

        let output = self.reduce(key, values)?;
        serializer.to_bytes(&output)
    }
}

/// A closed set of shippable functions.
///
/// Implemented by the enums generated with [`registry!`](crate::registry!).
pub trait Registry: Serializable + Clone + Debug {
    /// Variant name, for logs and errors.
    fn name(&self) -> &'static str;

    fn map_as_bytes(&self, serializer: Serializer, key: &[u8], value: &[u8]) -> AnyResult<Emissions>;

    fn reduce_as_bytes(&self, serializer: Serializer, key: &[u8], values: &[u8]) -> AnyResult<Bytes>;
}

/// Declare a registry of map and reduce functions.
///
/// Generates a serializable enum with one variant per function, a
/// [`Registry`] implementation dispatching to the matching
/// [`MapFunction`]/[`ReduceFunction`], and a `From` impl per variant so the
/// function values can be handed straight to a job. Invoking a variant for
/// the other stage fails with [`FunctionError::WrongRole`].
///
/// The calling crate must depend on `serde` with the `derive` feature.
#[macro_export]
macro_rules! registry {
    (
        $(#[$meta:meta])*
        $vis:vis enum $name:ident {
            map { $($map_variant:ident($map_ty:ty)),* $(,)? }
            reduce { $($reduce_variant:ident($reduce_ty:ty)),* $(,)? }
        }
    ) => {
        $(#[$meta])*
        #[derive(::serde::Serialize, ::serde::Deserialize, Debug, Clone)]
        $vis enum $name {
            $($map_variant($map_ty),)*
            $($reduce_variant($reduce_ty),)*
        }

        impl $crate::function::Registry for $name {
            fn name(&self) -> &'static str {
                match self {
                    $(Self::$map_variant(_) => stringify!($map_variant),)*
                    $(Self::$reduce_variant(_) => stringify!($reduce_variant),)*
                }
            }

            #[allow(unreachable_patterns, unused_variables)]
            fn map_as_bytes(
                &self,
                serializer: $crate::serializer::Serializer,
                key: &[u8],
                value: &[u8],
            ) -> $crate::function::AnyResult<$crate::function::Emissions> {
                match self {
                    $(Self::$map_variant(f) => {
                        $crate::function::MapFunction::map_as_bytes(f, serializer, key, value)
                    })*
                    other => Err($crate::function::FunctionError::WrongRole {
                        function: $crate::function::Registry::name(other),
                        role: $crate::function::Role::Map,
                    }
                    .into()),
                }
            }

            #[allow(unreachable_patterns, unused_variables)]
            fn reduce_as_bytes(
                &self,
                serializer: $crate::serializer::Serializer,
                key: &[u8],
                values: &[u8],
            ) -> $crate::function::AnyResult<$crate::bytes::Bytes> {
                match self {
                    $(Self::$reduce_variant(f) => {
                        $crate::function::ReduceFunction::reduce_as_bytes(f, serializer, key, values)
                    })*
                    other => Err($crate::function::FunctionError::WrongRole {
                        function: $crate::function::Registry::name(other),
                        role: $crate::function::Role::Reduce,
                    }
                    .into()),
                }
            }
        }

        $(
            impl From<$map_ty> for $name {
                fn from(f: $map_ty) -> Self {
                    Self::$map_variant(f)
                }
            }
        )*
        $(
            impl From<$reduce_ty> for $name {
                fn from(f: $reduce_ty) -> Self {
                    Self::$reduce_variant(f)
                }
            }
        )*
    };
}


#[cfg(test)]
mod tests {
    use super::{test_functions::*, *};

    #[test]
    fn map_emits_encoded_pairs_lazily() {
        let serializer = Serializer::Postcard;
        let key = serializer.to_bytes(&0u64).unwrap();
        let value = serializer.to_bytes("a b a").unwrap();

        let body = TestFunctions::from(SplitWords);
        let emitted: Vec<KeyValue> = body
            .map_as_bytes(serializer, &key, &value)
            .unwrap()
            .collect::<AnyResult<_>>()
            .unwrap();

        let words: Vec<String> = emitted
            .iter()
            .map(|kv| serializer.from_bytes(&kv.key).unwrap())
            .collect();
        assert_eq!(words, ["a", "b", "a"]);
        assert_eq!(emitted[0].value, serializer.to_bytes(&1u64).unwrap());
    }

    #[test]
    fn reduce_decodes_each_value() {
        let serializer = Serializer::Cbor;
        let key = serializer.to_bytes("a").unwrap();
        let values: Vec<Bytes> = [2u64, 3, 5]
            .iter()
            .map(|v| serializer.to_bytes(v).unwrap())
            .collect();
        let values = serializer.to_bytes(&values).unwrap();

        let output = TestFunctions::from(Sum)
            .reduce_as_bytes(serializer, &key, &values)
            .unwrap();
        assert_eq!(serializer.from_bytes::<u64>(&output).unwrap(), 10);
    }

    #[test]
    fn wrong_role_is_rejected() {
        let err = TestFunctions::from(Sum)
            .map_as_bytes(Serializer::Postcard, &[], &[])
            .err()
            .unwrap();
        let err = err.downcast::<FunctionError>().unwrap();
        assert!(matches!(
            err,
            FunctionError::WrongRole {
                function: "Sum",
                role: Role::Map
            }
        ));
    }

    #[test]
    fn malformed_input_is_reported() {
        let err = TestFunctions::from(SplitWords)
            .map_as_bytes(Serializer::Postcard, &[0xff], &[])
            .err()
            .unwrap();
        assert!(matches!(
            err.downcast_ref::<FunctionError>(),
            Some(FunctionError::Malformed { what: "map input key", .. })
        ));
    }

    #[test]
    fn function_bodies_survive_shipping() {
        let serializer = Serializer::Postcard;
        let body = serializer.to_bytes(&TestFunctions::from(SplitWords)).unwrap();
        let shipped: TestFunctions = serializer.from_bytes(&body).unwrap();
        assert_eq!(shipped.name(), "SplitWords");
    }
}
