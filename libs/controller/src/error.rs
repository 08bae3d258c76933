use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the command layer and the reconcilers.
///
/// The HTTP mapping lives in the server crate: `NotFound` is 404, `Conflict`
/// 409, `Rejected` 400, `Unavailable` 503 and `Kube` 502.
#[derive(Error, Debug)]
pub enum Error {
    /// No build with that name is known to the index.
    #[error("no such build: {0}")]
    NotFound(String),

    /// Duplicate deploy, or a command that is illegal in the current state.
    #[error("conflict: {0}")]
    Conflict(String),

    /// The input matches no repo rule, or is malformed.
    #[error("rejected: {0}")]
    Rejected(String),

    /// The initial cluster list has not completed yet.
    #[error("controller is still syncing with the cluster")]
    Unavailable,

    /// Non-retryable error from the cluster API.
    #[error("kubernetes error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    /// Kubefiles could not be read or rendered.
    #[error("template error: {0}")]
    Template(String),

    #[error("serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },

    #[error("yaml error: {source}")]
    Yaml {
        #[from]
        source: serde_yaml::Error,
    },
}

impl Error {
    pub fn metric_label(&self) -> String {
        match self {
            Error::NotFound(_) => "not_found",
            Error::Conflict(_) => "conflict",
            Error::Rejected(_) => "rejected",
            Error::Unavailable => "unavailable",
            Error::Kube { .. } => "kube",
            Error::Template(_) => "template",
            Error::Serialization { .. } => "serialization",
            Error::Yaml { .. } => "yaml",
        }
        .to_string()
    }
}
