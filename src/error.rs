//! Crate-wide error type.

use thiserror::Error;

/// Errors produced by register reads, value derivation, and publishing.
///
/// Configuration defects (duplicate names, missing upstream results, bad
/// scale exponents) are distinct from transport failures so callers can log
/// them differently; transient data-quality problems never surface here —
/// they are converted to null results inside the pipeline.
#[derive(Error, Debug)]
pub enum FronmodError {
    /// Underlying Modbus transport failed (I/O, protocol, connection loss).
    #[error("modbus transport: {0}")]
    Transport(String),

    /// The device answered with a Modbus exception code.
    #[error("modbus exception reading \"{batch}\": {code}")]
    Exception { batch: &'static str, code: String },

    /// A register read did not complete within the configured timeout.
    #[error("read of \"{batch}\" timed out")]
    ReadTimeout { batch: &'static str },

    /// Read attempted while no connection is established.
    #[error("register source is not connected")]
    NotConnected,

    /// The device returned fewer words than the batch requested.
    #[error("short read for \"{batch}\": got {got} of {want} registers")]
    ShortRead {
        batch: &'static str,
        got: usize,
        want: usize,
    },

    /// Two items in one batch share a result name.
    #[error("duplicate result name \"{0}\" in batch")]
    DuplicateName(&'static str),

    /// An item's offset points outside the batch block.
    #[error("item \"{0}\" does not fit its batch block")]
    ItemOutOfRange(&'static str),

    /// A derivation step required a result that the batch never produced.
    #[error("missing result \"{0}\"")]
    MissingResult(&'static str),

    /// A derivation step consumed a result before it was marked ready.
    #[error("result \"{0}\" is not ready")]
    NotReady(&'static str),

    /// A scale-factor register held an exponent outside [-10, 10].
    #[error("scale exponent {0} out of range")]
    ScaleExponent(i64),

    /// A scale step received a null input value.
    #[error("no value to scale")]
    NullValue,

    /// The gateway rejected or failed a publish request.
    #[error("gateway publish failed: {0}")]
    Gateway(String),
}
