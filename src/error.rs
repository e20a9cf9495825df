use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid image reference {0}")]
    Parse(String),

    #[error("malformed Bearer challenge: {0}")]
    AuthChallenge(String),

    #[error("unable to fetch digest from {url}: {reason}")]
    DigestFetch { url: String, reason: String },

    #[error("unable to load pull secret {namespace}/{name}")]
    CredentialFetch {
        namespace: String,
        name: String,
        #[source]
        source: BoxError,
    },

    #[error("unable to decode {annotation} annotation")]
    AnnotationDecode {
        annotation: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("{kind} {namespace}/{name} still conflicting after {attempts} update attempts")]
    ConcurrentUpdate {
        kind: &'static str,
        namespace: String,
        name: String,
        attempts: u32,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Kube(#[from] kube::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
