use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;

use rocket::http::{ContentType, Header, Status};
use rocket::serde::json::{Error as JsonError, Json};
use rocket::State;
use rocket::{request::Request, response::{self, Responder, Response}};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::api::ApiError;
use crate::cache::CacheKey;
use crate::config::AppConfig;
use crate::service::{Mode, ResizeService, Resolved, ServiceError};

const IMAGE_EXTENSION: &str = ".jpeg";

#[derive(Debug, Deserialize)]
pub struct ResizeRequest {
    pub urls: Vec<String>,
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "lowercase")]
pub enum ResultKind {
    Success,
    Failure,
}

/// One entry of the batch response, in the same position as its source URL.
#[derive(Debug, Serialize, Deserialize, PartialEq)]
pub struct ResizeResult {
    pub result: ResultKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    pub cached: bool,
}

impl ResizeResult {
    fn from_resolution(resolution: Result<Resolved, ServiceError>, public_url: &str) -> Self {
        match resolution {
            Ok(resolved) => ResizeResult {
                result: ResultKind::Success,
                url: Some(image_url(public_url, &resolved.key)),
                cached: resolved.cached,
            },
            Err(_) => ResizeResult {
                result: ResultKind::Failure,
                url: None,
                cached: false,
            },
        }
    }
}

fn image_url(public_url: &str, key: &CacheKey) -> String {
    format!(
        "{}/v1/image/{}{}",
        public_url.trim_end_matches('/'),
        key,
        IMAGE_EXTENSION
    )
}

#[derive(FromForm, Default)]
pub struct ResizeQuery {
    #[field(name = "async")]
    pub is_async: Option<bool>,
    pub timeout_ms: Option<u64>,
}

#[post("/resize?<query..>", data = "<request>")]
pub async fn resize<'r>(
    query: ResizeQuery,
    request: Result<Json<ResizeRequest>, JsonError<'r>>,
    service: &State<ResizeService>,
    config: &State<AppConfig>,
) -> Result<(Status, Json<Vec<ResizeResult>>), ApiError> {
    let request = match request {
        Ok(request) => request.into_inner(),
        Err(err) => {
            log::debug!("Rejecting resize request: {}", err);
            return Err(ApiError::BadRequest("Failed to parse request".to_string()));
        }
    };

    let mode = if query.is_async.unwrap_or(false) {
        Mode::Async
    } else {
        Mode::Sync
    };
    let deadline = query.timeout_ms.map(Duration::from_millis);

    log::info!(
        "Resizing {} image(s) to {}x{} ({:?})",
        request.urls.len(),
        request.width,
        request.height,
        mode
    );

    let results = service
        .resolve_batch(&request.urls, request.width, request.height, mode, deadline)
        .await
        .into_iter()
        .map(|resolution| ResizeResult::from_resolution(resolution, &config.public_url))
        .collect();

    Ok((Status::Created, Json(results)))
}

#[get("/resize")]
pub fn resize_get() -> ApiError {
    ApiError::MethodNotAllowed
}

#[put("/resize")]
pub fn resize_put() -> ApiError {
    ApiError::MethodNotAllowed
}

#[delete("/resize")]
pub fn resize_delete() -> ApiError {
    ApiError::MethodNotAllowed
}

#[patch("/resize")]
pub fn resize_patch() -> ApiError {
    ApiError::MethodNotAllowed
}

// Responder for image data
pub struct ImageResponse {
    pub data: Arc<[u8]>,
}

impl<'r> Responder<'r, 'static> for ImageResponse {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'static> {
        let etag = format!("\"{:x}\"", md5::compute(&self.data));
        // Check If-None-Match header
        if let Some(if_none_match) = req.headers().get_one("If-None-Match") {
            if if_none_match == etag {
                return Response::build()
                    .status(Status::NotModified)
                    .header(Header::new("ETag", etag))
                    .header(Header::new("Cache-Control", "public, max-age=86400"))
                    .ok();
            }
        }
        Response::build()
            .header(ContentType::JPEG)
            .header(Header::new("Cache-Control", "public, max-age=86400"))
            .header(Header::new("ETag", etag))
            .sized_body(self.data.len(), Cursor::new(self.data))
            .ok()
    }
}

#[get("/image/<file>?<timeout_ms>")]
pub async fn get_image(
    file: &str,
    timeout_ms: Option<u64>,
    service: &State<ResizeService>,
) -> Result<ImageResponse, ApiError> {
    let key = file
        .strip_suffix(IMAGE_EXTENSION)
        .and_then(CacheKey::parse)
        .ok_or(ApiError::ServiceError(ServiceError::NotFound))?;

    let data = service
        .read_artifact(&key, timeout_ms.map(Duration::from_millis))
        .await?;

    Ok(ImageResponse { data })
}

#[get("/health")]
pub fn health(service: &State<ResizeService>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "cached": service.cached_artifacts(),
        "in_flight": service.jobs_in_flight(),
    }))
}
