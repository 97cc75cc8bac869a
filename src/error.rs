//! Error types and the soft-inconsistency diagnostics channel.

use crate::boxes::FourCC;
use serde::Serialize;
use std::io;
use thiserror::Error;

/// Upper bound on a single sample's size in bytes. Anything larger is treated as a
/// corrupt size field rather than an allocation request.
pub const MAX_SAMPLE_SIZE: u64 = 200_000_000;

/// Upper bound on the samples one track may declare. Sample tables are expanded
/// per sample, so a count above this is rejected before anything is allocated.
pub const MAX_TRACK_SAMPLES: u64 = 1 << 24;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io: {0}")]
    Io(#[from] io::Error),

    /// Structural violation of the box grammar. Aborts parsing of the current input.
    #[error("malformed input: {0}")]
    Malformed(String),

    /// Caller misuse: wrong writer subtype, invalid seek config, absent optional field.
    #[error("precondition violated: {0}")]
    Precondition(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("sample size {size} exceeds limit of {limit} bytes")]
    SampleTooLarge { size: u64, limit: u64 },

    #[error("box type '{0}' registered twice")]
    DuplicateRegistration(FourCC),
}

impl Error {
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    pub fn precondition(msg: impl Into<String>) -> Self {
        Self::Precondition(msg.into())
    }

    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::Unsupported(msg.into())
    }

    pub fn is_malformed(&self) -> bool {
        matches!(self, Error::Malformed(_))
    }
}

/// Rejects sizes above [`MAX_SAMPLE_SIZE`].
pub fn check_sample_size(size: u64) -> Result<()> {
    if size > MAX_SAMPLE_SIZE {
        return Err(Error::SampleTooLarge {
            size,
            limit: MAX_SAMPLE_SIZE,
        });
    }
    Ok(())
}

/// Rejects a declared sample count above [`MAX_TRACK_SAMPLES`].
pub fn check_sample_count(count: u64, what: &str) -> Result<()> {
    if count > MAX_TRACK_SAMPLES {
        return Err(Error::malformed(format!(
            "{what}: {count} samples exceed the limit of {MAX_TRACK_SAMPLES}"
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Severity {
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Diagnostic {
    pub severity: Severity,
    pub message: String,
}

/// Ordered collection of tolerated inconsistencies. Every entry is also forwarded
/// to `tracing` so callers that do not inspect the list still see it in logs.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Diagnostics {
    entries: Vec<Diagnostic>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn warn(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::warn!("{message}");
        self.entries.push(Diagnostic {
            severity: Severity::Warning,
            message,
        });
    }

    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!("{message}");
        self.entries.push(Diagnostic {
            severity: Severity::Error,
            message,
        });
    }

    pub fn entries(&self) -> &[Diagnostic] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True if any entry's message contains `needle`.
    pub fn contains(&self, needle: &str) -> bool {
        self.entries.iter().any(|d| d.message.contains(needle))
    }

    pub fn extend(&mut self, other: Diagnostics) {
        self.entries.extend(other.entries);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sample_size_ceiling_is_exact() {
        assert!(check_sample_size(MAX_SAMPLE_SIZE).is_ok());
        match check_sample_size(MAX_SAMPLE_SIZE + 1) {
            Err(Error::SampleTooLarge { size, limit }) => {
                assert_eq!(size, 200_000_001);
                assert_eq!(limit, 200_000_000);
            }
            other => panic!("expected SampleTooLarge, got {other:?}"),
        }
    }

    #[test]
    fn diagnostics_keep_order() {
        let mut d = Diagnostics::new();
        d.warn("first");
        d.error("second");
        assert_eq!(d.len(), 2);
        assert_eq!(d.entries()[0].severity, Severity::Warning);
        assert_eq!(d.entries()[1].message, "second");
        assert!(d.contains("sec"));
    }
}
