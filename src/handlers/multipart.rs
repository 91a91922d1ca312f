//! Multipart upload HTTP handlers.
//!
//! Every handler that receives a user-supplied key normalizes it first,
//! so the coordinator only ever sees canonical keys.  Remote-store
//! failures during completion and abort are reported as `200` with
//! `ok: false`; every other error goes through [`UploadError`]'s
//! response mapping.

use std::sync::Arc;

use axum::body::Body;
use axum::extract::rejection::{JsonRejection, QueryRejection};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use garde::Validate;
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::errors::UploadError;
use crate::gateway::backend::{AbortedUpload, CompletedPart};
use crate::naming::normalize_key;
use crate::AppState;

// -- Request and response bodies ---------------------------------------------

/// Body of `POST /multipart/init`.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct InitRequest {
    /// Object key, normalized before use.  Emptiness is a naming error,
    /// reported by the normalizer.
    #[garde(length(max = 1024))]
    pub key: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct InitResponse {
    pub upload_id: String,
    pub bucket: String,
    pub key: String,
}

/// Query string of `POST /multipart/upload_part` and `GET /multipart/parts`.
#[derive(Debug, Default, Deserialize)]
pub struct PartQuery {
    pub upload_id: Option<String>,
    pub key: Option<String>,
    pub part_number: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct UploadPartResponse {
    pub bucket: String,
    pub upload_id: String,
    pub key: String,
    pub part: CompletedPart,
}

/// Body of `POST /multipart/complete`.  Parts are forwarded to the
/// remote store exactly as given.
#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct CompleteRequest {
    #[garde(length(max = 1024))]
    pub key: String,
    #[garde(length(min = 1))]
    pub upload_id: String,
    #[garde(length(max = 10000))]
    pub parts: Vec<CompletedPart>,
}

/// Body of `POST /multipart/abort`.  With both fields, aborts that one
/// upload; otherwise the present fields filter a bulk abort over the
/// whole bucket.
#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct AbortRequest {
    #[garde(length(max = 1024))]
    #[serde(default)]
    pub key: Option<String>,
    #[garde(skip)]
    #[serde(default)]
    pub upload_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct StatusResponse {
    pub ok: bool,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct AbortResponse {
    pub ok: bool,
    pub message: String,
    pub aborted: Vec<AbortedUpload>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListedPart {
    #[serde(rename = "PartNumber")]
    pub part_number: u32,
    #[serde(rename = "ETag")]
    pub etag: String,
    #[serde(rename = "Size")]
    pub size: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct ListPartsResponse {
    pub bucket: String,
    pub upload_id: String,
    pub key: String,
    pub parts: Vec<ListedPart>,
}

// -- Helper functions ---------------------------------------------------------

fn json_body<T: Validate<Context = ()>>(
    body: Result<Json<T>, JsonRejection>,
) -> Result<T, UploadError> {
    let Json(body) = body.map_err(|rejection| UploadError::InvalidArgument {
        message: rejection.body_text(),
    })?;
    body.validate().map_err(|report| UploadError::InvalidArgument {
        message: report.to_string(),
    })?;
    Ok(body)
}

fn query_params(query: Result<Query<PartQuery>, QueryRejection>) -> Result<PartQuery, UploadError> {
    query
        .map(|Query(q)| q)
        .map_err(|rejection| UploadError::InvalidArgument {
            message: rejection.body_text(),
        })
}

fn required(value: Option<String>, name: &str) -> Result<String, UploadError> {
    match value {
        Some(v) if !v.is_empty() => Ok(v),
        _ => Err(UploadError::InvalidArgument {
            message: format!("Missing required parameter '{name}'"),
        }),
    }
}

/// Treat blank optional fields as absent.
fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}

fn parse_part_number(raw: &str) -> Result<u32, UploadError> {
    raw.trim()
        .parse::<u32>()
        .map_err(|_| UploadError::InvalidArgument {
            message: format!("Part number must be a positive integer, got '{raw}'"),
        })
}

// -- Handlers -----------------------------------------------------------------

/// `POST /multipart/init` -- start an upload.
#[utoipa::path(
    post,
    path = "/multipart/init",
    tag = "Multipart",
    operation_id = "InitiateUpload",
    request_body = InitRequest,
    responses(
        (status = 201, description = "Upload initiated", body = InitResponse),
        (status = 400, description = "Invalid key"),
        (status = 500, description = "Session could not be recorded"),
        (status = 502, description = "Remote store error")
    )
)]
pub async fn init_upload(
    State(state): State<Arc<AppState>>,
    body: Result<Json<InitRequest>, JsonRejection>,
) -> Result<Response, UploadError> {
    let body = json_body(body)?;
    let key = normalize_key(&body.key)?;

    let initiated = state.coordinator.initiate(&key).await?;
    Ok((
        StatusCode::CREATED,
        Json(InitResponse {
            upload_id: initiated.upload_id,
            bucket: initiated.bucket,
            key: initiated.key,
        }),
    )
        .into_response())
}

/// `POST /multipart/upload_part?upload_id&key&part_number` -- the raw
/// request body is the part payload.
#[utoipa::path(
    post,
    path = "/multipart/upload_part",
    tag = "Multipart",
    operation_id = "UploadPart",
    params(
        ("upload_id" = String, Query, description = "Upload identifier"),
        ("key" = String, Query, description = "Object key"),
        ("part_number" = u32, Query, description = "Part number, starting at 1"),
    ),
    request_body(content = Vec<u8>, content_type = "application/octet-stream"),
    responses(
        (status = 201, description = "Part stored", body = UploadPartResponse),
        (status = 400, description = "Invalid parameters or key mismatch"),
        (status = 404, description = "Upload not found"),
        (status = 413, description = "Part too large"),
        (status = 502, description = "Remote store error")
    )
)]
pub async fn upload_part(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PartQuery>, QueryRejection>,
    body: Body,
) -> Result<Response, UploadError> {
    let query = query_params(query)?;
    let upload_id = required(query.upload_id, "upload_id")?;
    let key = normalize_key(&required(query.key, "key")?)?;
    let part_number = parse_part_number(&required(query.part_number, "part_number")?)?;

    // Reject stale or mismatched sessions before spending a disk write on
    // the body.  The coordinator checks again after staging.
    state.coordinator.check_session(&key, &upload_id).await?;

    // The staged file is removed when `staged` drops, on every path.
    let staged = state.stager.stage(body.into_data_stream()).await?;
    let uploaded = state
        .coordinator
        .upload_part(&key, &upload_id, part_number, staged.payload())
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(UploadPartResponse {
            bucket: uploaded.bucket,
            upload_id: uploaded.upload_id,
            key: uploaded.key,
            part: uploaded.part,
        }),
    )
        .into_response())
}

/// `POST /multipart/complete` -- assemble the object.
#[utoipa::path(
    post,
    path = "/multipart/complete",
    tag = "Multipart",
    operation_id = "CompleteUpload",
    request_body = CompleteRequest,
    responses(
        (status = 200, description = "Outcome; `ok` is false when the remote store rejected the completion", body = StatusResponse),
        (status = 400, description = "Invalid request or key mismatch"),
        (status = 404, description = "Upload not found")
    )
)]
pub async fn complete_upload(
    State(state): State<Arc<AppState>>,
    body: Result<Json<CompleteRequest>, JsonRejection>,
) -> Result<Response, UploadError> {
    let body = json_body(body)?;
    let key = normalize_key(&body.key)?;

    let response = match state
        .coordinator
        .complete(&key, &body.upload_id, &body.parts)
        .await
    {
        Ok(_) => StatusResponse {
            ok: true,
            message: "completed".to_string(),
        },
        Err(UploadError::RemoteStore(e)) => StatusResponse {
            ok: false,
            message: format!("{e:#}"),
        },
        Err(e) => return Err(e),
    };
    Ok(Json(response).into_response())
}

/// `POST /multipart/abort` -- abort one upload or every matching one.
#[utoipa::path(
    post,
    path = "/multipart/abort",
    tag = "Multipart",
    operation_id = "AbortUpload",
    request_body = AbortRequest,
    responses(
        (status = 200, description = "Outcome and the uploads actually aborted; `ok` is false when the remote store refused any", body = AbortResponse),
        (status = 400, description = "Invalid key or key mismatch"),
        (status = 404, description = "Upload not found")
    )
)]
pub async fn abort_upload(
    State(state): State<Arc<AppState>>,
    body: Result<Json<AbortRequest>, JsonRejection>,
) -> Result<Response, UploadError> {
    let body = json_body(body)?;
    let key = match non_empty(body.key) {
        Some(raw) => Some(normalize_key(&raw)?),
        None => None,
    };
    let upload_id = non_empty(body.upload_id);

    let response = match state
        .coordinator
        .abort(key.as_deref(), upload_id.as_deref())
        .await
    {
        Ok(aborted) => AbortResponse {
            ok: true,
            message: "aborted".to_string(),
            aborted,
        },
        Err(UploadError::RemoteStore(e)) => AbortResponse {
            ok: false,
            message: format!("{e:#}"),
            aborted: Vec::new(),
        },
        Err(UploadError::PartialAbort {
            aborted,
            failed,
            source,
        }) => AbortResponse {
            ok: false,
            message: format!("{failed} uploads could not be aborted: {source:#}"),
            aborted,
        },
        Err(e) => return Err(e),
    };
    Ok(Json(response).into_response())
}

/// `GET /multipart/parts?upload_id&key` -- parts recorded so far.
#[utoipa::path(
    get,
    path = "/multipart/parts",
    tag = "Multipart",
    operation_id = "ListParts",
    params(
        ("upload_id" = String, Query, description = "Upload identifier"),
        ("key" = String, Query, description = "Object key"),
    ),
    responses(
        (status = 200, description = "Recorded parts, ascending", body = ListPartsResponse),
        (status = 400, description = "Invalid parameters or key mismatch"),
        (status = 404, description = "Upload not found")
    )
)]
pub async fn list_parts(
    State(state): State<Arc<AppState>>,
    query: Result<Query<PartQuery>, QueryRejection>,
) -> Result<Response, UploadError> {
    let query = query_params(query)?;
    let upload_id = required(query.upload_id, "upload_id")?;
    let key = normalize_key(&required(query.key, "key")?)?;

    let listing = state.coordinator.list_parts(&key, &upload_id).await?;
    Ok(Json(ListPartsResponse {
        bucket: listing.bucket,
        upload_id: listing.upload_id,
        key: listing.key,
        parts: listing
            .parts
            .into_iter()
            .map(|p| ListedPart {
                part_number: p.part_number,
                etag: p.etag,
                size: p.size,
            })
            .collect(),
    })
    .into_response())
}

// -- Tests --------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::backend::MAX_PART_NUMBER;
    use crate::naming::MAX_KEY_LENGTH;

    #[test]
    fn test_required() {
        assert_eq!(required(Some("x".into()), "key").unwrap(), "x");
        let err = required(Some(String::new()), "key").unwrap_err();
        assert_eq!(err.to_string(), "Missing required parameter 'key'");
        assert!(required(None, "upload_id").is_err());
    }

    #[test]
    fn test_parse_part_number() {
        assert_eq!(parse_part_number("7").unwrap(), 7);
        assert_eq!(parse_part_number(" 12 ").unwrap(), 12);
        assert!(parse_part_number("-1").is_err());
        assert!(parse_part_number("abc").is_err());
        assert!(parse_part_number("").is_err());
    }

    #[test]
    fn test_init_request_validation() {
        let ok = InitRequest { key: "a/b.txt".into() };
        assert!(ok.validate().is_ok());
        // Left to the normalizer, which reports it as an invalid name.
        let empty = InitRequest { key: String::new() };
        assert!(empty.validate().is_ok());
        let long = InitRequest {
            key: "k".repeat(MAX_KEY_LENGTH + 1),
        };
        assert!(long.validate().is_err());
    }

    #[test]
    fn test_complete_request_part_limit() {
        let part = CompletedPart {
            part_number: 1,
            etag: "\"e\"".into(),
        };
        let too_many = CompleteRequest {
            key: "k".into(),
            upload_id: "U1".into(),
            parts: vec![part; MAX_PART_NUMBER as usize + 1],
        };
        assert!(too_many.validate().is_err());
    }

    #[test]
    fn test_abort_request_defaults() {
        let body: AbortRequest = serde_json::from_str("{}").unwrap();
        assert!(body.key.is_none());
        assert!(body.upload_id.is_none());
        assert!(body.validate().is_ok());
        assert_eq!(non_empty(Some(String::new())), None);
    }

    #[test]
    fn test_listed_part_wire_names() {
        let json = serde_json::to_value(ListedPart {
            part_number: 2,
            etag: "\"e\"".into(),
            size: 10,
        })
        .unwrap();
        assert_eq!(json["PartNumber"], 2);
        assert_eq!(json["ETag"], "\"e\"");
        assert_eq!(json["Size"], 10);
    }
}
