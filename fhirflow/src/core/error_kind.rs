//! Classified error kinds reported by stage handlers.
//!
//! The string form of every kind is part of the contract with existing stage
//! implementations and must not change.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::time::Duration;

/// A named failure kind recognised by the retry policy and branch evaluator.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The document is malformed or in an unexpected state.
    InvalidFile,
    /// Neither a CCD nor a supported HL7 message.
    UnsupportedFileType,
    /// Zip/gzip uploads are rejected.
    CompressedFileNotSupported,
    /// The content hash belongs to an already processed document.
    CcdaDuplicated,
    /// The converter returned an error.
    Converter,
    /// Dataset generation failed.
    FhirDatasetsGeneration,
    /// The downstream store rejected the bundle.
    HealthLakePost,
    /// The downstream store is rate limiting (HTTP 429).
    HealthLakePostTooManyRequests,
    /// Credentials for the downstream store are missing.
    AwsKeyMissing,
    /// The stage did not settle before its timeout.
    StageTimeout,
    /// The last stage succeeded without signalling completion.
    NoChoiceMatched,
    /// Any other named kind.
    Other(String),
}

impl ErrorKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &str {
        match self {
            Self::InvalidFile => "InvalidFileError",
            Self::UnsupportedFileType => "UnsupportedFileTypeError",
            Self::CompressedFileNotSupported => "CompressedFileNotSupportedError",
            Self::CcdaDuplicated => "CCDADuplicatedError",
            Self::Converter => "ConverterError",
            Self::FhirDatasetsGeneration => "FhirDatasetsGenerationError",
            Self::HealthLakePost => "HealthLakePostError",
            Self::HealthLakePostTooManyRequests => "HealthLakePostTooManyRequestsError",
            Self::AwsKeyMissing => "AWSKeyMissingError",
            Self::StageTimeout => "StageTimeoutError",
            Self::NoChoiceMatched => "States.NoChoiceMatched",
            Self::Other(name) => name,
        }
    }

    /// Maps a wire name back to a kind; unknown names become `Other`.
    #[must_use]
    pub fn from_name(name: &str) -> Self {
        match name {
            "InvalidFileError" => Self::InvalidFile,
            "UnsupportedFileTypeError" => Self::UnsupportedFileType,
            "CompressedFileNotSupportedError" => Self::CompressedFileNotSupported,
            "CCDADuplicatedError" => Self::CcdaDuplicated,
            "ConverterError" => Self::Converter,
            "FhirDatasetsGenerationError" => Self::FhirDatasetsGeneration,
            "HealthLakePostError" => Self::HealthLakePost,
            "HealthLakePostTooManyRequestsError" => Self::HealthLakePostTooManyRequests,
            "AWSKeyMissingError" => Self::AwsKeyMissing,
            "StageTimeoutError" => Self::StageTimeout,
            "States.NoChoiceMatched" => Self::NoChoiceMatched,
            other => Self::Other(other.to_string()),
        }
    }

    /// Returns true for validation-class failures.
    #[must_use]
    pub const fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::InvalidFile | Self::UnsupportedFileType | Self::CompressedFileNotSupported
        )
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ErrorKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ErrorKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Ok(Self::from_name(&name))
    }
}

/// A failure with a named kind, as returned by a stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClassifiedError {
    /// The error kind.
    pub kind: ErrorKind,
    /// Human-readable message.
    pub message: String,
    /// Whether the stage considers the failure transient.
    #[serde(default)]
    pub retryable: bool,
    /// Delay suggested by the stage (e.g. a `Retry-After` header).
    #[serde(default, skip_serializing_if = "Option::is_none", with = "millis_opt")]
    pub backoff_hint: Option<Duration>,
}

impl ClassifiedError {
    /// Creates a non-retryable classified error.
    #[must_use]
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            retryable: false,
            backoff_hint: None,
        }
    }

    /// Creates a retryable classified error.
    #[must_use]
    pub fn retryable(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            retryable: true,
            ..Self::new(kind, message)
        }
    }

    /// The downstream store answered HTTP 429.
    #[must_use]
    pub fn rate_limited(message: impl Into<String>) -> Self {
        Self::retryable(ErrorKind::HealthLakePostTooManyRequests, message)
    }

    /// Sets a suggested backoff.
    #[must_use]
    pub const fn with_backoff_hint(mut self, delay: Duration) -> Self {
        self.backoff_hint = Some(delay);
        self
    }
}

impl fmt::Display for ClassifiedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

mod millis_opt {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    #[allow(clippy::ref_option)]
    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(d) => serializer.serialize_u64(u64::try_from(d.as_millis()).unwrap_or(u64::MAX)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_names_are_preserved() {
        assert_eq!(
            ErrorKind::HealthLakePostTooManyRequests.as_str(),
            "HealthLakePostTooManyRequestsError"
        );
        assert_eq!(ErrorKind::CcdaDuplicated.as_str(), "CCDADuplicatedError");
        assert_eq!(ErrorKind::AwsKeyMissing.as_str(), "AWSKeyMissingError");
        assert_eq!(ErrorKind::NoChoiceMatched.as_str(), "States.NoChoiceMatched");
    }

    #[test]
    fn test_from_name_unknown_is_other() {
        let kind = ErrorKind::from_name("SomethingNew");
        assert_eq!(kind, ErrorKind::Other("SomethingNew".to_string()));
        assert_eq!(kind.as_str(), "SomethingNew");
    }

    #[test]
    fn test_error_kind_serializes_as_wire_name() {
        let json = serde_json::to_string(&ErrorKind::Converter).unwrap();
        assert_eq!(json, r#""ConverterError""#);
        let back: ErrorKind = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ErrorKind::Converter);
    }

    #[test]
    fn test_classified_error_backoff_hint_serialization() {
        let err = ClassifiedError::rate_limited("429 Too Many Requests")
            .with_backoff_hint(Duration::from_millis(1500));
        let json = serde_json::to_value(&err).unwrap();
        assert_eq!(json["kind"], "HealthLakePostTooManyRequestsError");
        assert_eq!(json["backoff_hint"], 1500);
        assert_eq!(json["retryable"], true);

        let back: ClassifiedError = serde_json::from_value(json).unwrap();
        assert_eq!(back, err);
    }

    #[test]
    fn test_validation_class() {
        assert!(ErrorKind::UnsupportedFileType.is_validation());
        assert!(ErrorKind::CompressedFileNotSupported.is_validation());
        assert!(!ErrorKind::Converter.is_validation());
    }
}
