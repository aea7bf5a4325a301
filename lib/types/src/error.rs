//! Errors produced while parsing the shared data model.
use std::io;
use thiserror::Error;

/// A code digest could not be parsed from text.
#[derive(Error, Debug)]
pub enum DigestParseError {
    /// The text is not valid hexadecimal
    #[error("could not decode digest as hexadecimal: {0}")]
    Hex(#[from] hex::FromHexError),
    /// The decoded digest has the wrong length
    #[error("digests must decode into exactly 32 bytes, got {0}")]
    Length(usize),
}

/// The OC configuration could not be loaded.
#[derive(Error, Debug)]
pub enum ConfigError {
    /// An IO error
    #[error(transparent)]
    Io(#[from] io::Error),
    /// The TOML document is malformed or has unknown keys
    #[error("invalid OC configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// A value is outside of the accepted range
    #[error("invalid OC configuration: {0}")]
    Invalid(String),
}
