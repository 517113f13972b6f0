#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Kubernetes reported error: {source}")]
    Kube {
        #[from]
        source: kube::Error,
    },

    #[error("Invalid user input: {0}")]
    UserInput(String),

    #[error("Json error: {source}")]
    Json {
        #[from]
        source: serde_json::Error,
    },

    #[error("Parse duration: {source}")]
    ParseDuration {
        #[from]
        source: parse_duration::parse::Error,
    },

    /// A resource failed the validation rules of the server-policy
    /// evaluator (bad server name, dynamic index out of range, ...).
    #[error("Validation failed: {0}")]
    Validation(String),

    /// The introspector job failed in a way that counts against
    /// `introspect_job_failure_count` but is still retryable.
    #[error("Introspection failed: {0}")]
    IntrospectionFailed(String),

    /// The introspector reported a `FatalIntrospectorError` token in its
    /// status message. Terminal until the spec changes.
    #[error("Fatal introspector error: {0}")]
    FatalIntrospectorError(String),

    /// A bounded operation (e.g. a status read) exceeded its configured
    /// timeout (spec.md §5 "Timeouts").
    #[error("Timed out: {0}")]
    Timeout(String),
}

impl Error {
    /// Whether this failure should count against the domain's bounded
    /// retry budget, or is terminal/non-retryable on its own.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::FatalIntrospectorError(_) | Error::Validation(_))
    }
}
