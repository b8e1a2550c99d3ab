use std::fmt;

/// Recoverable evaluation errors.
///
/// User errors are catchable at the REPL boundary and may be intercepted by
/// a bound `__stop__` closure before they reach the driver. Compile errors
/// come from the frontend collaborator. Internal invariant violations do not
/// go through this type at all; see [`crate::state::State::internal_error`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    User {
        message: String,
        class: &'static str,
    },
    Compile {
        message: String,
    },
}

impl Error {
    pub fn user(message: impl Into<String>) -> Self {
        Error::User {
            message: message.into(),
            class: "error",
        }
    }

    pub fn user_class(message: impl Into<String>, class: &'static str) -> Self {
        Error::User {
            message: message.into(),
            class,
        }
    }

    pub fn compile(message: impl Into<String>) -> Self {
        Error::Compile {
            message: message.into(),
        }
    }

    pub fn message(&self) -> &str {
        match self {
            Error::User { message, .. } => message,
            Error::Compile { message } => message,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Error::User { .. } => "riposte",
            Error::Compile { .. } => "compiler",
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::User { message, class } => {
                if *class == "error" {
                    write!(f, "{}", message)
                } else {
                    write!(f, "{} ({})", message, class)
                }
            }
            Error::Compile { message } => write!(f, "{}", message),
        }
    }
}

impl std::error::Error for Error {}

pub type Result<T> = std::result::Result<T, Error>;
