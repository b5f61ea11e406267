//! Engine errors. The enum is cloneable so once-guarded memoization can cache
//! a failure and every waiter observes the same error.

/// Errors surfaced by the engine. Transport errors from the cluster or the
/// image daemon are captured verbatim in [`UpError::Upstream`]; nothing is
/// retried here.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UpError {
    /// A resource the engine does not own collides with its naming scheme,
    /// or one of its resources was deleted or mutated externally.
    #[error("one or more resources appear to have been modified by an external process, aborting")]
    ModifiedExternally,

    #[error("watch channel unexpectedly closed")]
    WatchClosed,

    /// Unexpected watch event kind.
    #[error("got unexpected event from watch channel: {0}")]
    Protocol(String),

    #[error("aborting because container {container} of pod {pod} terminated (code={code},signal={signal},reason={reason}): {message}")]
    ContainerTerminated {
        container: String,
        pod: String,
        code: i32,
        signal: i32,
        reason: String,
        message: String,
    },

    #[error("aborting because container {container} of pod {pod} could not pull image: {message}")]
    ContainerImagePull {
        container: String,
        pod: String,
        message: String,
    },

    /// Invalid composition input.
    #[error("{0}")]
    Validation(String),

    /// Cluster or image-daemon failure, surfaced verbatim.
    #[error("{0}")]
    Upstream(String),
}

impl From<anyhow::Error> for UpError {
    fn from(err: anyhow::Error) -> Self {
        UpError::Upstream(format!("{err:#}"))
    }
}
