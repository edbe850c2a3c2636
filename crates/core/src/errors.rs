use thiserror::Error;

/// Classification of a failed webhook delivery. Each class carries exactly one
/// user-facing explanation.
#[derive(Clone, Copy, Debug, Error, PartialEq, Eq, Hash)]
pub enum DeliveryFailure {
    #[error("workflow webhook timed out")]
    Timeout,
    #[error("workflow webhook rate limited the request")]
    RateLimited,
    #[error("workflow webhook returned a server error")]
    ServerError,
    #[error("workflow webhook request failed")]
    Generic,
}

impl DeliveryFailure {
    pub fn from_status(status: u16) -> Self {
        match status {
            408 | 504 => Self::Timeout,
            429 => Self::RateLimited,
            500..=599 => Self::ServerError,
            _ => Self::Generic,
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::ServerError => "server_error",
            Self::Generic => "generic",
        }
    }

    pub fn user_message(&self) -> &'static str {
        match self {
            Self::Timeout => {
                "The AI agent took too long to respond (over 60 seconds). Please try again with a shorter or simpler request."
            }
            Self::RateLimited => {
                "The AI agent is receiving too many requests right now. Please wait a moment and try again."
            }
            Self::ServerError => {
                "The AI agent ran into an internal problem while processing your request. Please try again later."
            }
            Self::Generic => "There was an error communicating with the AI agent.",
        }
    }
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ApplicationError {
    #[error("missing credential: {0}")]
    MissingCredential(String),
    #[error("caller not allowed: {0}")]
    CallerNotAllowed(String),
    #[error("configuration failure: {0}")]
    Configuration(String),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum InterfaceError {
    #[error("bad request: {message}")]
    BadRequest { message: String, correlation_id: String },
    #[error("forbidden: {message}")]
    Forbidden { message: String, correlation_id: String },
    #[error("internal error: {message}")]
    Internal { message: String, correlation_id: String },
}

impl InterfaceError {
    pub fn user_message(&self) -> &'static str {
        match self {
            Self::BadRequest { .. } => {
                "The request could not be processed. Check inputs and try again."
            }
            Self::Forbidden { .. } => "The caller is not allowed to use this endpoint.",
            Self::Internal { .. } => "An unexpected internal error occurred.",
        }
    }

    pub fn status_code(&self) -> u16 {
        match self {
            Self::BadRequest { .. } => 400,
            Self::Forbidden { .. } => 403,
            Self::Internal { .. } => 500,
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest { message, .. }
            | Self::Forbidden { message, .. }
            | Self::Internal { message, .. } => message,
        }
    }
}

impl ApplicationError {
    pub fn into_interface(self, correlation_id: impl Into<String>) -> InterfaceError {
        let correlation_id = correlation_id.into();
        let mut mapped = InterfaceError::from(self);
        match &mut mapped {
            InterfaceError::BadRequest { correlation_id: id, .. }
            | InterfaceError::Forbidden { correlation_id: id, .. }
            | InterfaceError::Internal { correlation_id: id, .. } => *id = correlation_id,
        }
        mapped
    }
}

impl From<ApplicationError> for InterfaceError {
    fn from(value: ApplicationError) -> Self {
        match value {
            ApplicationError::MissingCredential(message) => {
                Self::BadRequest { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::CallerNotAllowed(message) => {
                Self::Forbidden { message, correlation_id: "unassigned".to_owned() }
            }
            ApplicationError::Configuration(message) => {
                Self::Internal { message, correlation_id: "unassigned".to_owned() }
            }
        }
    }
}
