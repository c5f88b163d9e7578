use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    /// Not enough matching nodes or tasks anywhere in the searched pool.
    #[error("inadequate {what} located for {object} at {time} in partition {partition} ({available} < {required})")]
    InsufficientResources {
        object: Box<str>,
        what: &'static str,
        time: i64,
        partition: Box<str>,
        available: u32,
        required: u32,
    },

    /// Ranges were computed, but none of them satisfies the requested start and duration.
    #[error("no feasible window for {object} in partition {partition}: {reason}")]
    NoFeasibleWindow { object: Box<str>, partition: Box<str>, reason: String },

    #[error("policy violation for {object}: {reason}")]
    PolicyViolation { object: Box<str>, reason: String },

    #[error("invalid host expression '{expression}': {reason}")]
    HostExpressionInvalid { expression: Box<str>, reason: String },

    #[error("reservation corruption detected in reservation '{reservation}' Req/Detected TC {required}/{detected}")]
    Corruption { reservation: Box<str>, required: u32, detected: u32 },

    /// A bounded structure (range series, request list, template depth, per-node reservation count) overflowed.
    #[error("{what} exceeds the configured maximum of {max}")]
    CapacityExceeded { what: String, max: usize },

    #[error("invalid configuration for '{name}': {reason}")]
    InvalidConfig { name: Box<str>, reason: String },

    #[error("unknown {what} '{name}'")]
    NotFound { what: &'static str, name: Box<str> },

    #[error("failed to parse configuration: {0}")]
    ConfigLoad(#[from] serde_yaml::Error),

    #[error("file not found or could not be read: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
