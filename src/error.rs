//! Typed errors for correction state and validation failures
//!
//! Most of the crate returns `anyhow::Result`; these variants exist so that
//! callers can match on the failures they are expected to recover from.

/// Errors raised by correction methods and their inputs
#[derive(Debug, thiserror::Error)]
pub enum CorrectionError {
    /// Correction applied before `extract_activations` ran
    #[error("activations have not been extracted; call extract_activations first")]
    MissingActivations,

    /// Correction applied before `compute_cav` ran
    #[error("no concept activation vector; call compute_cav first")]
    MissingCav,

    /// A layer name that the model does not contain
    #[error("layer '{0}' not found in the model")]
    UnknownLayer(String),

    /// A probe could not be fitted from the given activations
    #[error("probe error: {0}")]
    Probe(String),

    /// An option outside its valid range
    #[error("invalid option: {0}")]
    InvalidOption(String),
}
