use thiserror::Error;

/// Failure raised from inside process execution (delegates, stores) that a
/// caller should see as-is rather than as a generic workflow failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DomainViolation {
    #[error("{0}")]
    Client(String),

    #[error("{0}")]
    Parsing(String),

    #[error("{0}")]
    InvalidEntity(String),
}

#[derive(Debug, Error)]
pub enum WorkflowError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("invalid entity: {0}")]
    InvalidEntity(String),

    #[error("parsing failed: {0}")]
    ParsingInvalid(String),

    #[error("workflow failure: {context}")]
    Workflow {
        context: String,
        #[source]
        source: anyhow::Error,
    },
}

pub type WfResult<T> = std::result::Result<T, WorkflowError>;

impl WorkflowError {
    pub fn http_status(&self) -> u16 {
        match self {
            Self::NotFound(_) => 404,
            Self::Validation(_) => 400,
            Self::InvalidEntity(_) => 400,
            Self::ParsingInvalid(_) => 400,
            Self::Workflow { .. } => 500,
        }
    }

    pub fn workflow(context: impl Into<String>, source: anyhow::Error) -> Self {
        Self::Workflow {
            context: context.into(),
            source,
        }
    }

    /// Convert an engine or store failure into the domain taxonomy.
    ///
    /// The whole source chain is searched: a [`DomainViolation`] anywhere in it
    /// is surfaced with its own kind, everything else is wrapped with `context`.
    pub fn translate(err: anyhow::Error, context: impl Into<String>) -> Self {
        if let Some(violation) = err
            .chain()
            .find_map(|cause| cause.downcast_ref::<DomainViolation>())
        {
            return violation.clone().into();
        }
        Self::workflow(context, err)
    }
}

impl From<DomainViolation> for WorkflowError {
    fn from(violation: DomainViolation) -> Self {
        match violation {
            DomainViolation::Client(msg) => Self::Validation(msg),
            DomainViolation::Parsing(msg) => Self::ParsingInvalid(msg),
            DomainViolation::InvalidEntity(msg) => Self::InvalidEntity(msg),
        }
    }
}

/// Adapter for `map_err` at port boundaries.
pub(crate) fn engine_err(context: impl Into<String>) -> impl FnOnce(anyhow::Error) -> WorkflowError {
    let context = context.into();
    move |err| WorkflowError::translate(err, context)
}
