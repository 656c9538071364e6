use std::fmt;

use bytes::Bytes;
use rand::{distributions::Alphanumeric, Rng};

const WORKER_ID_LEN: usize = 16;

/// A single serialized key-value pair.
#[derive(Clone, Eq, PartialEq, Hash, Debug)]
pub struct KeyValue {
    /// The key.
    pub key: Bytes,

    /// The value.
    pub value: Bytes,
}

impl KeyValue {
    /// Construct a new key-value pair from the given key and value.
    pub fn new(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }
}

/// Opaque worker identity, generated by the worker itself.
#[derive(Clone, PartialEq, Eq, Hash, Debug)]
pub struct WorkerId(String);

impl WorkerId {
    pub fn random() -> Self {
        Self(random_token(WORKER_ID_LEN))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn to_frame(&self) -> Bytes {
        Bytes::copy_from_slice(self.0.as_bytes())
    }
}

impl From<String> for WorkerId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

impl From<&str> for WorkerId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A random alphanumeric string of `len` characters.
pub(crate) fn random_token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn random_ids_are_distinct() {
        let a = WorkerId::random();
        let b = WorkerId::random();
        assert_eq!(a.as_str().len(), WORKER_ID_LEN);
        assert_ne!(a, b);
    }
}
