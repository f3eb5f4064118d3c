use actix_easy_multipart::{bytes::Bytes as ChunkPart, text::Text, MultipartForm};
use actix_web::{get, http::header, post, web, HttpRequest, HttpResponse};
use serde::{Deserialize, Serialize};
use snafu::OptionExt;
use stitch_storage::{UploadEngine, UploadStatus};
use tracing::debug;

use crate::error::{ApiError, InvalidRequestSnafu};

pub(crate) const CHUNK_RECEIVED: &str = "received file chunk";
pub(crate) const FILE_MERGED: &str = "file merged success";

type ApiResult<T> = Result<T, ApiError>;

#[derive(MultipartForm)]
pub struct UploadForm {
    /// The chunk identifier, `<hash>-<index>`.
    pub hash:     Option<Text<String>>,
    pub filename: Option<Text<String>>,
    pub chunk:    Option<ChunkPart>,
}

#[derive(Deserialize)]
pub struct MergeRequest {
    pub filename: Option<String>,
    /// The chunk size the client split the file with.
    pub size:     Option<u64>,
}

#[derive(Serialize)]
struct MergeResponse {
    code:     u16,
    message:  &'static str,
    merged:   u64,
    expected: u64,
    size:     u64,
}

#[derive(Serialize)]
struct StatusResponse {
    code:   u16,
    #[serde(flatten)]
    status: UploadStatus,
}

fn required<T>(field: Option<T>, name: &str) -> ApiResult<T> {
    field.context(InvalidRequestSnafu {
        reason: format!("missing field {name}"),
    })
}

#[post("/upload")]
pub async fn upload(
    engine: web::Data<UploadEngine>,
    form: MultipartForm<UploadForm>,
) -> ApiResult<HttpResponse> {
    let form = form.0;
    let identifier = required(form.hash, "hash")?.0;
    let filename = required(form.filename, "filename")?.0;
    let chunk = required(form.chunk, "chunk")?;

    engine
        .receive_chunk(&filename, &identifier, chunk.data)
        .await?;
    Ok(HttpResponse::Ok().body(CHUNK_RECEIVED))
}

#[post("/merge")]
pub async fn merge(
    engine: web::Data<UploadEngine>,
    req: web::Json<MergeRequest>,
) -> ApiResult<HttpResponse> {
    let req = req.0;
    let filename = required(req.filename, "filename")?;
    let chunk_size = required(req.size, "size")?;

    let report = engine.merge(&filename, chunk_size).await?;
    Ok(HttpResponse::Ok().json(MergeResponse {
        code:     0,
        message:  FILE_MERGED,
        merged:   report.merged,
        expected: report.expected,
        size:     report.size,
    }))
}

#[get("/upload/{filename}")]
pub async fn status(
    engine: web::Data<UploadEngine>,
    filename: web::Path<String>,
) -> ApiResult<HttpResponse> {
    let status = engine.status(&filename).await?;
    Ok(HttpResponse::Ok().json(StatusResponse { code: 0, status }))
}

/// Every `OPTIONS` request ends here with an empty 200, the CORS layer adds
/// the allowed origin.
pub async fn preflight(req: HttpRequest) -> HttpResponse {
    debug!("answering pre-flight request for {}", req.path());
    let mut resp = HttpResponse::Ok();
    resp.insert_header((header::ACCESS_CONTROL_ALLOW_METHODS, "GET, POST, OPTIONS"))
        .insert_header((header::ACCESS_CONTROL_MAX_AGE, "86400"));
    if let Some(headers) = req.headers().get(header::ACCESS_CONTROL_REQUEST_HEADERS) {
        resp.insert_header((header::ACCESS_CONTROL_ALLOW_HEADERS, headers.clone()));
    }
    resp.finish()
}
