//! Error types for the vCenter operator

use thiserror::Error;

/// Main error type for operator operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Runtime configuration error (missing key, bad value)
    #[error("configuration error: {0}")]
    Config(String),

    /// DNS discovery error (SOA query, zone transfer)
    #[error("dns error: {0}")]
    Dns(String),

    /// vCenter session or inventory error
    #[error("vcenter error: {0}")]
    VCenter(String),

    /// Template lookup or render error
    #[error("template error: {0}")]
    Template(String),

    /// Password derivation error
    #[error("kdf error: {0}")]
    Kdf(String),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),
}

impl Error {
    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a DNS error with the given message
    pub fn dns(msg: impl Into<String>) -> Self {
        Self::Dns(msg.into())
    }

    /// Create a vCenter error with the given message
    pub fn vcenter(msg: impl Into<String>) -> Self {
        Self::VCenter(msg.into())
    }

    /// Create a template error with the given message
    pub fn template(msg: impl Into<String>) -> Self {
        Self::Template(msg.into())
    }

    /// Create a KDF error with the given message
    pub fn kdf(msg: impl Into<String>) -> Self {
        Self::Kdf(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }
}

impl From<minijinja::Error> for Error {
    fn from(err: minijinja::Error) -> Self {
        Self::Template(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}
