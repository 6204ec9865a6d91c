use crate::error::ImageError;
use crate::resolver::{Resolver, Served};
use crate::upload::{RawUpload, UploadItem, UploadParams, Uploader};
use axum::{
    body::Body,
    extract::{Multipart, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Serialize;
use std::sync::Arc;

/// Application status carried in the upload envelope on success.
const STATUS_OK: u16 = 100;

#[derive(Clone)]
pub struct AppState {
    pub resolver: Arc<Resolver>,
    pub uploader: Arc<Uploader>,
}

/// Envelope wrapped around every upload response. `data` is the single
/// stored item, or the array of items for `multi` requests.
#[derive(Debug, Serialize)]
pub struct UploadEnvelope {
    pub success: bool,
    pub message: String,
    pub status: u16,
    pub data: serde_json::Value,
}

impl UploadEnvelope {
    fn ok(items: Vec<UploadItem>, multi: bool) -> Self {
        let data = if multi {
            serde_json::json!(items)
        } else {
            serde_json::json!(items.first())
        };
        UploadEnvelope {
            success: true,
            message: "ok".to_string(),
            status: STATUS_OK,
            data,
        }
    }

    fn err(e: &ImageError) -> Self {
        UploadEnvelope {
            success: false,
            message: e.to_string(),
            status: e.status(),
            data: serde_json::Value::Null,
        }
    }
}

/// GET /{upload_dir}/*path - Serve an original or a generated derivative.
pub async fn serve_image(
    State(state): State<AppState>,
    Path(path): Path<String>,
) -> Response {
    let resolver = state.resolver.clone();
    let result = tokio::task::spawn_blocking(move || resolver.serve(&path)).await;

    let served = match result {
        Ok(Ok(served)) => served,
        Ok(Err(e)) => {
            tracing::debug!("serve failed: {}", e);
            return (e.http_status(), e.to_string()).into_response();
        }
        Err(e) => {
            tracing::error!("serve task panicked: {}", e);
            return (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
                .into_response();
        }
    };

    let content_type = served.ext().content_type();
    let bytes = match served {
        Served::Bytes { bytes, .. } => bytes,
        Served::File { path, .. } => match tokio::fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!("could not read {}: {}", path.display(), e);
                return (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string())
                    .into_response();
            }
        },
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, content_type)
        .header(header::CACHE_CONTROL, "public, max-age=31536000")
        .body(Body::from(bytes))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// POST /upload - Accept one or more image files with edit parameters.
pub async fn upload_images(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> (StatusCode, Json<UploadEnvelope>) {
    let mut files: Vec<RawUpload> = Vec::new();
    let mut fields: Vec<(String, String)> = Vec::new();

    loop {
        let field = match multipart.next_field().await {
            Ok(Some(field)) => field,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("bad multipart payload: {}", e);
                let err = ImageError::Validation(
                    crate::error::ValidationKind::TransportFault,
                );
                return (err.http_status(), Json(UploadEnvelope::err(&err)));
            }
        };

        if let Some(file_name) = field.file_name().map(str::to_string) {
            match field.bytes().await {
                Ok(bytes) => files.push(RawUpload {
                    original_name: file_name,
                    bytes: bytes.to_vec(),
                }),
                Err(e) => {
                    tracing::debug!("could not read file field: {}", e);
                    let err = ImageError::Validation(
                        crate::error::ValidationKind::TransportFault,
                    );
                    return (err.http_status(), Json(UploadEnvelope::err(&err)));
                }
            }
        } else if let Some(name) = field.name().map(str::to_string) {
            if let Ok(value) = field.text().await {
                fields.push((name, value));
            }
        }
    }

    let params = match UploadParams::from_fields(
        fields.iter().map(|(n, v)| (n.as_str(), v.as_str())),
    ) {
        Ok(params) => params,
        Err(e) => return (e.http_status(), Json(UploadEnvelope::err(&e))),
    };

    if !params.multi {
        files.truncate(1);
    }

    match state.uploader.save_all(files, &params).await {
        Ok(items) => (StatusCode::OK, Json(UploadEnvelope::ok(items, params.multi))),
        Err(e) => {
            tracing::warn!("upload failed: {}", e);
            (e.http_status(), Json(UploadEnvelope::err(&e)))
        }
    }
}
