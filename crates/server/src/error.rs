use axum::{http::StatusCode, Json};
use leadroute_core::errors::{ApplicationError, InterfaceError};
use serde::Serialize;
use tracing::warn;
use uuid::Uuid;

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ApiError {
    pub error: String,
    pub message: String,
    pub correlation_id: String,
}

pub type ApiFailure = (StatusCode, Json<ApiError>);

pub fn correlation_id() -> String {
    Uuid::new_v4().to_string()
}

pub fn bad_request(message: impl Into<String>) -> ApiFailure {
    interface_error(InterfaceError::BadRequest {
        message: message.into(),
        correlation_id: correlation_id(),
    })
}

pub fn not_found(message: impl Into<String>) -> ApiFailure {
    application_error(ApplicationError::NotFound(message.into()))
}

pub fn unavailable(message: impl Into<String>) -> ApiFailure {
    application_error(ApplicationError::Integration(message.into()))
}

pub fn application_error(error: ApplicationError) -> ApiFailure {
    interface_error(error.into_interface(correlation_id()))
}

/// Maps an interface failure onto a status code and a client-safe body.
pub fn interface_error(interface: InterfaceError) -> ApiFailure {
    let status = match &interface {
        InterfaceError::BadRequest { .. } => StatusCode::BAD_REQUEST,
        InterfaceError::NotFound { .. } => StatusCode::NOT_FOUND,
        InterfaceError::ServiceUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
        InterfaceError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    };

    if status.is_server_error() {
        warn!(
            event_name = "http.request_failed",
            correlation_id = interface.correlation_id(),
            status = status.as_u16(),
            error = %interface,
            "request failed"
        );
    }

    let message = match &interface {
        InterfaceError::BadRequest { message, .. } | InterfaceError::NotFound { message, .. } => {
            message.clone()
        }
        InterfaceError::ServiceUnavailable { .. } | InterfaceError::Internal { .. } => {
            interface.user_message().to_string()
        }
    };

    (
        status,
        Json(ApiError {
            error: interface.user_message().to_string(),
            message,
            correlation_id: interface.correlation_id().to_string(),
        }),
    )
}

#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use leadroute_core::errors::ApplicationError;

    use super::{application_error, bad_request};

    #[test]
    fn persistence_failure_hides_detail_from_client() {
        let (status, body) =
            application_error(ApplicationError::Persistence("disk I/O error at page 7".to_string()));

        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(!body.message.contains("page 7"));
        assert!(!body.correlation_id.is_empty());
    }

    #[test]
    fn validation_failure_keeps_detail() {
        let (status, body) = bad_request("priority must be set");

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body.message.contains("priority must be set"));
    }
}
