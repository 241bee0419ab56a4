use crate::images::PipelineErrorKind;
use crate::jobs::ProductionError;
use crate::service::ServiceError;
use rocket::http::{ContentType, Status};
use serde_json::json;

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    MethodNotAllowed,
    ServiceError(ServiceError),
}

impl From<ServiceError> for ApiError {
    fn from(error: ServiceError) -> Self {
        ApiError::ServiceError(error)
    }
}

impl ApiError {
    fn status(&self) -> Status {
        match self {
            ApiError::BadRequest(_) => Status::BadRequest,
            ApiError::MethodNotAllowed => Status::MethodNotAllowed,
            ApiError::ServiceError(ServiceError::NotFound) => Status::NotFound,
            ApiError::ServiceError(ServiceError::ArtifactMissing(_)) => Status::NotFound,
            ApiError::ServiceError(ServiceError::Timeout) => Status::GatewayTimeout,
            ApiError::ServiceError(ServiceError::ProductionFailed(error)) => match error {
                ProductionError::Pipeline { kind, .. } => match kind {
                    PipelineErrorKind::Fetch => Status::BadGateway,
                    PipelineErrorKind::Decode => Status::UnprocessableEntity,
                    PipelineErrorKind::Resize | PipelineErrorKind::Encode => {
                        Status::InternalServerError
                    }
                },
                ProductionError::TimedOut(_) => Status::GatewayTimeout,
                ProductionError::Crashed(_) | ProductionError::Abandoned => {
                    Status::InternalServerError
                }
            },
        }
    }
}

impl<'r> rocket::response::Responder<'r, 'static> for ApiError {
    fn respond_to(self, _: &'r rocket::Request<'_>) -> rocket::response::Result<'static> {
        let body = match &self {
            ApiError::BadRequest(message) => json!({
                "error": "Bad request",
                "message": message
            }),
            ApiError::MethodNotAllowed => json!({
                "error": "Method not allowed",
                "message": "Expecting POST request"
            }),
            ApiError::ServiceError(ServiceError::NotFound) => json!({
                "error": "Not found",
                "message": "No image is known under this key"
            }),
            ApiError::ServiceError(ServiceError::ArtifactMissing(_)) => json!({
                "error": "Not found",
                "message": "The image was evicted, request it again"
            }),
            ApiError::ServiceError(ServiceError::Timeout) => json!({
                "error": "Processing timeout",
                "message": "The image is still being processed, try again later"
            }),
            ApiError::ServiceError(ServiceError::ProductionFailed(error)) => json!({
                "error": "Failed to process image",
                "message": error.to_string()
            }),
        }
        .to_string();

        rocket::Response::build()
            .status(self.status())
            .header(ContentType::JSON)
            .sized_body(None, std::io::Cursor::new(body))
            .ok()
    }
}
