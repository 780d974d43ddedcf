use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::appliance::ApplianceError;
use crate::discovery::DiscoveryError;
use crate::guide::GuideError;
use crate::live::LiveError;
use crate::store::StoreError;
use crate::sync::SyncError;
use crate::transcode::TranscodeError;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io { source: io::Error, path: PathBuf },
    #[error("failed to parse config {path}: {source}")]
    Parse {
        source: toml::de::Error,
        path: PathBuf,
    },
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Crate-wide classification of failures. Component errors keep their own
/// context-rich enums; everything funnels into this one vocabulary, which
/// is the sole thing the request surface maps to status codes.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("{0}")]
    NotFound(String),
    #[error("{0}")]
    InvalidArgument(String),
    #[error("{0}")]
    Busy(String),
    #[error("{0}")]
    Conflict(String),
    #[error("{0}")]
    NoTunersAvailable(String),
    #[error("{0}")]
    UpstreamUnavailable(String),
    #[error("{0}")]
    UpstreamUnreachable(String),
    #[error("{0}")]
    DrmProtected(String),
    #[error("{0}")]
    TranscodeStartupTimeout(String),
    #[error("{0}")]
    TranscoderFailed(String),
    #[error("{0}")]
    AuthExpired(String),
    #[error("{0}")]
    Internal(String),
}

/// A refused connection or failed name lookup means unreachable; anything
/// the peer answered, however badly, is unavailable.
fn classify_reqwest(err: &reqwest::Error) -> CoreError {
    if err.is_connect() {
        CoreError::UpstreamUnreachable(err.to_string())
    } else {
        CoreError::UpstreamUnavailable(err.to_string())
    }
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        let message = err.to_string();
        match err {
            StoreError::EpisodeNotFound { .. }
            | StoreError::SeriesNotFound { .. }
            | StoreError::DeviceNotFound { .. }
            | StoreError::RuleNotFound { .. } => CoreError::NotFound(message),
            StoreError::ProgressOutOfRange { .. } => CoreError::Conflict(message),
            StoreError::Open { .. } | StoreError::Execute(_) | StoreError::MissingStore => {
                CoreError::Internal(message)
            }
        }
    }
}

impl From<TranscodeError> for CoreError {
    fn from(err: TranscodeError) -> Self {
        let message = err.to_string();
        match err {
            TranscodeError::InvalidArtifactName { .. } => CoreError::InvalidArgument(message),
            TranscodeError::ArtifactNotFound { .. } | TranscodeError::JobNotFound { .. } => {
                CoreError::NotFound(message)
            }
            TranscodeError::StartupTimeout { .. } => CoreError::TranscodeStartupTimeout(message),
            TranscodeError::Spawn { .. } => CoreError::TranscoderFailed(message),
            TranscodeError::Io { .. } | TranscodeError::Sidecar { .. } => {
                CoreError::Internal(message)
            }
        }
    }
}

impl From<LiveError> for CoreError {
    fn from(err: LiveError) -> Self {
        let message = err.to_string();
        match err {
            LiveError::NoTunersAvailable { .. } => CoreError::NoTunersAvailable(message),
            LiveError::DrmProtected { .. } => CoreError::DrmProtected(message),
            LiveError::UpstreamUnavailable { .. } => CoreError::UpstreamUnavailable(message),
            LiveError::UpstreamUnreachable(_) => CoreError::UpstreamUnreachable(message),
            LiveError::WorkerStartupTimeout { .. } => CoreError::TranscodeStartupTimeout(message),
            LiveError::UnknownViewer { .. } | LiveError::ArtifactNotFound { .. } => {
                CoreError::NotFound(message)
            }
            LiveError::InvalidArtifactName { .. } => CoreError::InvalidArgument(message),
            LiveError::Spawn { .. } => CoreError::TranscoderFailed(message),
            LiveError::Io { .. } => CoreError::Internal(message),
            LiveError::Store(inner) => inner.into(),
        }
    }
}

impl From<ApplianceError> for CoreError {
    fn from(err: ApplianceError) -> Self {
        match &err {
            ApplianceError::Http(inner) => classify_reqwest(inner),
            ApplianceError::Status { .. } => CoreError::UpstreamUnavailable(err.to_string()),
            ApplianceError::Client(_) => CoreError::Internal(err.to_string()),
        }
    }
}

impl From<DiscoveryError> for CoreError {
    fn from(err: DiscoveryError) -> Self {
        match err {
            DiscoveryError::Busy => CoreError::Busy(err.to_string()),
            DiscoveryError::Socket(_) => CoreError::Internal(err.to_string()),
            DiscoveryError::Appliance(inner) => inner.into(),
            DiscoveryError::Store(inner) => inner.into(),
            DiscoveryError::Cloud(inner) => classify_reqwest(&inner),
        }
    }
}

impl From<GuideError> for CoreError {
    fn from(err: GuideError) -> Self {
        match err {
            GuideError::AuthExpired | GuideError::MissingCredential => {
                CoreError::AuthExpired(err.to_string())
            }
            GuideError::Http(inner) => classify_reqwest(&inner),
            GuideError::Upstream { .. } => CoreError::UpstreamUnavailable(err.to_string()),
            GuideError::Store(inner) => inner.into(),
        }
    }
}

impl From<SyncError> for CoreError {
    fn from(err: SyncError) -> Self {
        match err {
            SyncError::Appliance(inner) => inner.into(),
            SyncError::Store(inner) => inner.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn component_errors_classify_into_design_kinds() {
        assert!(matches!(
            CoreError::from(StoreError::EpisodeNotFound { id: 7 }),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from(StoreError::ProgressOutOfRange {
                position: 10,
                duration: 5
            }),
            CoreError::Conflict(_)
        ));
        assert!(matches!(
            CoreError::from(TranscodeError::InvalidArtifactName { name: "..".into() }),
            CoreError::InvalidArgument(_)
        ));
        assert!(matches!(
            CoreError::from(TranscodeError::StartupTimeout { episode_id: 1 }),
            CoreError::TranscodeStartupTimeout(_)
        ));
        assert!(matches!(
            CoreError::from(TranscodeError::Spawn {
                source: io::Error::new(io::ErrorKind::NotFound, "no ffmpeg")
            }),
            CoreError::TranscoderFailed(_)
        ));
        assert!(matches!(
            CoreError::from(DiscoveryError::Busy),
            CoreError::Busy(_)
        ));
        assert!(matches!(
            CoreError::from(LiveError::DrmProtected {
                channel: "5.1".into()
            }),
            CoreError::DrmProtected(_)
        ));
        assert!(matches!(
            CoreError::from(LiveError::NoTunersAvailable {
                channel: "2.1".into()
            }),
            CoreError::NoTunersAvailable(_)
        ));
        assert!(matches!(
            CoreError::from(GuideError::AuthExpired),
            CoreError::AuthExpired(_)
        ));
    }

    #[test]
    fn wrapped_store_errors_keep_their_kind() {
        assert!(matches!(
            CoreError::from(LiveError::Store(StoreError::EpisodeNotFound { id: 3 })),
            CoreError::NotFound(_)
        ));
        assert!(matches!(
            CoreError::from(SyncError::Store(StoreError::ProgressOutOfRange {
                position: 99,
                duration: 10
            })),
            CoreError::Conflict(_)
        ));
        assert!(matches!(
            CoreError::from(GuideError::Store(StoreError::MissingStore)),
            CoreError::Internal(_)
        ));
    }
}
