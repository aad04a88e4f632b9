use std::fmt;

use thiserror::Error;

/// imgflow error types
#[derive(Error, Debug)]
pub enum ImageError {
    /// Caller supplied arguments that can never succeed
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// A name could not be parsed as an image reference
    #[error("parsing reference {reference:?}: {message}")]
    ReferenceParse { reference: String, message: String },

    /// A transport name outside the supported set
    #[error("unknown transport {0:?}")]
    UnknownTransport(String),

    /// The requested pull policy forbids the operation
    #[error("{0}")]
    PolicyViolation(String),

    /// No local image matches the name
    #[error("{0}: image not known")]
    ImageUnknown(String),

    /// Every pull candidate failed
    #[error("{0}")]
    CandidatesExhausted(PullErrors),

    /// The waterfall finished without pulling and without recording a failure
    #[error("internal error: no image pulled (pull policy {policy})")]
    NoCandidates { policy: String },

    /// Core-logic invariant broken
    #[error("internal error: {0}")]
    Internal(String),

    /// Copy between two references failed
    #[error("{0}")]
    Transport(String),

    /// Local image store failure
    #[error("storage: {0}")]
    Store(String),

    /// Container registry error
    #[error("registry {registry}: {message}")]
    Registry { registry: String, message: String },

    /// Archive assembly error
    #[error("archive: {0}")]
    Archive(String),

    /// Configuration error
    #[error("configuration: {0}")]
    Config(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("serialization: {0}")]
    Serialization(String),

    /// A release step failed after the operation itself had already failed
    #[error("{primary} (cleanup: {cleanup})")]
    Cleanup {
        #[source]
        primary: Box<ImageError>,
        cleanup: Box<ImageError>,
    },
}

impl ImageError {
    /// Whether this error (or the primary failure it wraps) reports that no
    /// local image matched.
    pub fn is_image_unknown(&self) -> bool {
        match self {
            ImageError::ImageUnknown(_) => true,
            ImageError::Cleanup { primary, .. } => primary.is_image_unknown(),
            _ => false,
        }
    }

    /// The earliest real failure, looking through chained cleanup errors.
    pub fn primary(&self) -> &ImageError {
        match self {
            ImageError::Cleanup { primary, .. } => primary.primary(),
            other => other,
        }
    }
}

impl From<serde_json::Error> for ImageError {
    fn from(err: serde_json::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for ImageError {
    fn from(err: serde_yaml::Error) -> Self {
        ImageError::Serialization(err.to_string())
    }
}

/// Result type alias for imgflow operations
pub type Result<T> = std::result::Result<T, ImageError>;

/// Combine the outcome of an operation with the outcome of releasing the
/// resource it used. The first failure wins; a release failure after an
/// operation failure is attached as a cause instead of replacing it.
pub fn chain_cleanup<T>(outcome: Result<T>, release: Result<()>) -> Result<T> {
    match (outcome, release) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(cleanup)) => Err(cleanup),
        (Err(primary), Ok(())) => Err(primary),
        (Err(primary), Err(cleanup)) => Err(ImageError::Cleanup {
            primary: Box::new(primary),
            cleanup: Box::new(cleanup),
        }),
    }
}

/// Per-candidate failures collected while walking the pull candidates.
#[derive(Debug, Default)]
pub struct PullErrors {
    errors: Vec<ImageError>,
}

impl PullErrors {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, err: ImageError) {
        self.errors.push(err);
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn errors(&self) -> &[ImageError] {
        &self.errors
    }
}

impl fmt::Display for PullErrors {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.errors.as_slice() {
            [] => write!(f, "no pull errors"),
            [only] => write!(f, "{}", only),
            errors => {
                write!(f, "{} errors occurred while pulling:", errors.len())?;
                for err in errors {
                    write!(f, "\n * {}", err)?;
                }
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_unknown_display() {
        let err = ImageError::ImageUnknown("docker.io/library/alpine:latest".to_string());
        assert_eq!(err.to_string(), "docker.io/library/alpine:latest: image not known");
        assert!(err.is_image_unknown());
    }

    #[test]
    fn test_image_unknown_seen_through_cleanup() {
        let err = ImageError::Cleanup {
            primary: Box::new(ImageError::ImageUnknown("foo".to_string())),
            cleanup: Box::new(ImageError::Archive("close failed".to_string())),
        };
        assert!(err.is_image_unknown());
        assert!(!ImageError::Internal("x".to_string()).is_image_unknown());
    }

    #[test]
    fn test_chain_cleanup_first_error_wins() {
        let out: Result<()> = chain_cleanup(
            Err(ImageError::Transport("copy failed".to_string())),
            Err(ImageError::Archive("close failed".to_string())),
        );
        let err = out.unwrap_err();
        assert!(matches!(err.primary(), ImageError::Transport(_)));
        assert_eq!(err.to_string(), "copy failed (cleanup: archive: close failed)");
    }

    #[test]
    fn test_chain_cleanup_release_error_alone() {
        let out = chain_cleanup(Ok(7), Err(ImageError::Archive("close failed".to_string())));
        assert!(matches!(out, Err(ImageError::Archive(_))));

        let out = chain_cleanup(Ok(7), Ok(()));
        assert_eq!(out.unwrap(), 7);
    }

    #[test]
    fn test_pull_errors_single_is_unchanged() {
        let mut errors = PullErrors::new();
        errors.push(ImageError::Transport("initializing source docker://quay.io/foo:latest: unauthorized".to_string()));
        assert_eq!(
            ImageError::CandidatesExhausted(errors).to_string(),
            "initializing source docker://quay.io/foo:latest: unauthorized"
        );
    }

    #[test]
    fn test_pull_errors_multiple() {
        let mut errors = PullErrors::new();
        errors.push(ImageError::Transport("a failed".to_string()));
        errors.push(ImageError::Transport("b failed".to_string()));
        assert_eq!(errors.len(), 2);
        assert_eq!(
            errors.to_string(),
            "2 errors occurred while pulling:\n * a failed\n * b failed"
        );
    }

    #[test]
    fn test_io_error_conversion() {
        let err: ImageError = std::io::Error::new(std::io::ErrorKind::NotFound, "gone").into();
        assert!(matches!(err, ImageError::Io(_)));
    }
}
