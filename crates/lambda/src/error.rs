use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum LambdaError {
    /// Handler pull, package install or sandbox creation failed
    #[error("failed to provision {function}: {reason}")]
    Provisioning { function: String, reason: String },

    /// The sandbox crashed or timed out while serving the request
    #[error("execution failed in {function}: {reason}")]
    Execution { function: String, reason: String },

    #[error("invocation queue for {function} is full")]
    QueueFull { function: String },

    #[error("function {function} has been killed")]
    FunctionKilled { function: String },

    #[error("lambda manager has been shut down")]
    ManagerClosed,

    /// A subsystem could not be constructed during startup
    #[error("failed to create {subsystem}: {reason}")]
    Subsystem { subsystem: String, reason: String },
}

impl LambdaError {
    pub fn provisioning(function: &str, err: impl std::fmt::Display) -> Self {
        Self::Provisioning {
            function: function.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub fn execution(function: &str, err: impl std::fmt::Display) -> Self {
        Self::Execution {
            function: function.to_string(),
            reason: format!("{:#}", err),
        }
    }

    pub fn subsystem(subsystem: &str, err: impl std::fmt::Display) -> Self {
        Self::Subsystem {
            subsystem: subsystem.to_string(),
            reason: format!("{:#}", err),
        }
    }

    /// HTTP status a front end should answer with
    pub fn status_code(&self) -> hyper::StatusCode {
        match self {
            Self::QueueFull { .. } => hyper::StatusCode::TOO_MANY_REQUESTS,
            Self::FunctionKilled { .. } | Self::ManagerClosed => {
                hyper::StatusCode::SERVICE_UNAVAILABLE
            }
            Self::Provisioning { .. } | Self::Execution { .. } | Self::Subsystem { .. } => {
                hyper::StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_function() {
        let err = LambdaError::execution("echo", "sandbox crashed");
        assert_eq!(err.to_string(), "execution failed in echo: sandbox crashed");
        assert_eq!(err.status_code(), hyper::StatusCode::INTERNAL_SERVER_ERROR);

        let err = LambdaError::QueueFull {
            function: "echo".to_string(),
        };
        assert_eq!(err.status_code(), hyper::StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn subsystem_errors_keep_anyhow_context() {
        let err = anyhow::anyhow!("disk full").context("open dep trace");
        let err = LambdaError::subsystem("DepTracer", err);
        assert_eq!(
            err.to_string(),
            "failed to create DepTracer: open dep trace: disk full"
        );
    }
}
