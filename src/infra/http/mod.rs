//! HTTP host for the cache: one catch-all image route plus a health check.

mod cors;
pub mod date;
mod middleware;

pub use cors::CorsPolicy;
pub use middleware::{REQUEST_ID_HEADER, RequestContext};

use std::sync::Arc;

use axum::{
    Router,
    body::Body,
    extract::{Path, RawQuery, State},
    http::{
        HeaderMap, HeaderValue, StatusCode,
        header::{
            ACCESS_CONTROL_ALLOW_ORIGIN, CACHE_CONTROL, CONTENT_LENGTH, CONTENT_TYPE, ETAG,
            IF_MODIFIED_SINCE, IF_NONE_MATCH, LAST_MODIFIED, LOCATION, ORIGIN, VARY,
        },
    },
    middleware as axum_middleware,
    response::{IntoResponse, Response},
    routing::get,
};

use crate::{
    application::{
        error::HttpError,
        orchestrator::{ImageRequest, ImageResponse, RequestOrchestrator},
    },
    cache::{ConditionalRequest, ServeInstruction, backend::ArtifactMeta},
};

use self::date::{format_http_date, parse_http_date};
use self::middleware::{log_responses, set_request_context};

pub const CACHE_STATUS_HEADER: &str = "x-cache-status";

#[derive(Clone)]
pub struct HttpState {
    pub orchestrator: Arc<RequestOrchestrator>,
    pub cors: Arc<CorsPolicy>,
}

pub fn build_router(state: HttpState) -> Router {
    Router::new()
        .route("/_health", get(health))
        .route("/{*path}", get(serve_image))
        .with_state(state)
        .layer(axum_middleware::from_fn(log_responses))
        .layer(axum_middleware::from_fn(set_request_context))
}

async fn health() -> Response {
    (StatusCode::OK, "ok").into_response()
}

async fn serve_image(
    State(state): State<HttpState>,
    Path(path): Path<String>,
    RawQuery(query): RawQuery,
    headers: HeaderMap,
) -> Response {
    let request = ImageRequest {
        path,
        query: query.unwrap_or_default(),
        conditions: conditions_from_headers(&headers),
    };

    let mut response = match state.orchestrator.handle(request).await {
        Ok(image) => image_response(image),
        Err(err) => HttpError::from(err).into_response(),
    };

    if !state.cors.is_empty() {
        let response_headers = response.headers_mut();
        response_headers.append(VARY, HeaderValue::from_static("origin"));
        if let Some(origin) = state.cors.allow_origin(headers.get(ORIGIN)) {
            response_headers.insert(ACCESS_CONTROL_ALLOW_ORIGIN, origin);
        }
    }
    response
}

/// Validators forwarded from the client. Unparseable values are ignored.
pub fn conditions_from_headers(headers: &HeaderMap) -> ConditionalRequest {
    let if_none_match = headers
        .get(IF_NONE_MATCH)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string);
    let if_modified_since = headers
        .get(IF_MODIFIED_SINCE)
        .and_then(|value| value.to_str().ok())
        .and_then(parse_http_date);

    ConditionalRequest {
        if_none_match,
        if_modified_since,
    }
}

/// Translate a delivery instruction into the outward response.
pub fn image_response(image: ImageResponse) -> Response {
    const SOURCE: &str = "infra::http::image_response";

    let ImageResponse {
        instruction,
        cache_control,
        status,
        storage_path,
        ..
    } = image;

    let mut response = match instruction {
        ServeInstruction::Redirect { location } => {
            let mut response = StatusCode::FOUND.into_response();
            match HeaderValue::from_str(location.as_str()) {
                Ok(value) => {
                    response.headers_mut().insert(LOCATION, value);
                }
                Err(err) => {
                    return HttpError::from_error(
                        SOURCE,
                        StatusCode::INTERNAL_SERVER_ERROR,
                        "Internal server error",
                        &err,
                    )
                    .into_response();
                }
            }
            response
        }
        ServeInstruction::Stream { meta, body } => {
            let mut response = Response::new(Body::from_stream(body));
            let headers = response.headers_mut();
            let content_type = meta
                .content_type
                .as_deref()
                .unwrap_or("application/octet-stream");
            if let Ok(value) = HeaderValue::from_str(content_type) {
                headers.insert(CONTENT_TYPE, value);
            }
            if let Some(length) = meta.content_length {
                headers.insert(CONTENT_LENGTH, HeaderValue::from(length));
            }
            apply_validators(headers, &meta);
            response
        }
        ServeInstruction::NotModified { meta } => {
            let mut response = StatusCode::NOT_MODIFIED.into_response();
            response.headers_mut().remove(CONTENT_TYPE);
            apply_validators(response.headers_mut(), &meta);
            response
        }
        ServeInstruction::Missing => {
            return HttpError::new(
                SOURCE,
                StatusCode::INTERNAL_SERVER_ERROR,
                "Internal server error",
                format!("artifact `{storage_path}` missing at delivery"),
            )
            .into_response();
        }
    };

    let headers = response.headers_mut();
    if let Ok(value) = HeaderValue::from_str(&cache_control) {
        headers.insert(CACHE_CONTROL, value);
    }
    headers.insert(
        CACHE_STATUS_HEADER,
        HeaderValue::from_static(status.as_str()),
    );
    response
}

fn apply_validators(headers: &mut HeaderMap, meta: &ArtifactMeta) {
    if let Some(value) = meta
        .etag
        .as_deref()
        .and_then(|etag| HeaderValue::from_str(etag).ok())
    {
        headers.insert(ETAG, value);
    }
    if let Some(value) = meta
        .last_modified
        .and_then(format_http_date)
        .and_then(|date| HeaderValue::from_str(&date).ok())
    {
        headers.insert(LAST_MODIFIED, value);
    }
}
