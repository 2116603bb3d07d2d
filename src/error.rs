//! Module containing the universal error type
use thiserror::Error;

/// Universal error type for this crate
#[derive(Error, Debug)]
pub enum Error {
    #[error("node is not present in this `Context`")]
    BadNode,

    #[error("variable is not present in this `Context`")]
    BadVar,

    #[error("malformed tree: {0}")]
    MalformedTree(&'static str),

    #[error("no feasible feature at this point")]
    NoFeature,
}
