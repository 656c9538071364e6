use std::fmt;

use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// The stage a shipped function is registered for.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Role {
    Map,
    Reduce,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Map => f.write_str("map"),
            Role::Reduce => f.write_str("reduce"),
        }
    }
}

#[derive(Error, Debug)]
pub enum FunctionError {
    /// A registry variant was invoked for a stage it does not implement.
    #[error("`{function}` is not registered as a {role} function")]
    WrongRole { function: &'static str, role: Role },

    /// A frame handed to a function could not be decoded into its input type.
    #[error("malformed {what}")]
    Malformed {
        what: &'static str,
        #[source]
        source: BoxError,
    },
}

impl FunctionError {
    pub(crate) fn malformed(what: &'static str, err: anyhow::Error) -> Self {
        Self::Malformed {
            what,
            source: err.into(),
        }
    }
}
