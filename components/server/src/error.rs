// Copyright 2024 stitch
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//      http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

use actix_web::{http::StatusCode, HttpResponse, ResponseError};
use serde::Serialize;
use snafu::{Location, Snafu};
use stitch_storage::ErrorKind;
use tracing::{error, warn};

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum ApiError {
    #[snafu(display("{reason}"))]
    InvalidRequest { reason: String },

    #[snafu(display("{source}"), context(false))]
    Storage { source: stitch_storage::Error },
}

#[derive(Snafu, Debug)]
#[snafu(visibility(pub))]
pub enum ServerError {
    #[snafu(display("failed to open the upload directory: {source}"))]
    Engine {
        source:   stitch_storage::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("failed to bind {addr}: {source}"))]
    Bind {
        addr:     String,
        source:   std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },

    #[snafu(display("server stopped: {source}"))]
    Serve {
        source:   std::io::Error,
        #[snafu(implicit)]
        location: Location,
    },
}

#[derive(Serialize)]
struct ErrorBody {
    code:    u16,
    message: String,
}

impl ApiError {
    /// Response status and the numeric code in the body.
    fn classify(&self) -> (StatusCode, u16) {
        let kind = match self {
            ApiError::InvalidRequest { .. } => ErrorKind::BadRequest,
            ApiError::Storage { source } => source.kind(),
        };
        match kind {
            ErrorKind::BadRequest => (StatusCode::BAD_REQUEST, 1),
            ErrorKind::NotFound => (StatusCode::NOT_FOUND, 2),
            ErrorKind::Conflict => (StatusCode::CONFLICT, 3),
            ErrorKind::Incomplete => (StatusCode::CONFLICT, 4),
            ErrorKind::CorruptState => (StatusCode::INTERNAL_SERVER_ERROR, 5),
            ErrorKind::IoFailure => (StatusCode::INTERNAL_SERVER_ERROR, 6),
        }
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode { self.classify().0 }

    fn error_response(&self) -> HttpResponse {
        let (status, code) = self.classify();
        if status.is_server_error() {
            error!("request failed: {self:?}");
        } else {
            warn!("request rejected: {self}");
        }
        HttpResponse::build(status).json(ErrorBody {
            code,
            message: self.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use actix_web::body::to_bytes;

    use super::*;

    #[actix_web::test]
    async fn storage_errors_map_to_status() {
        let cases = [
            (
                ApiError::from(
                    stitch_storage::Error::UploadBusy {
                        upload_key: "video".to_string(),
                    },
                ),
                StatusCode::CONFLICT,
                3,
            ),
            (
                ApiError::from(stitch_storage::Error::IncompleteUpload {
                    upload_key:    "video".to_string(),
                    expected:      3,
                    missing_count: 1,
                    missing:       vec![1],
                }),
                StatusCode::CONFLICT,
                4,
            ),
            (
                InvalidRequestSnafu {
                    reason: "missing field hash",
                }
                .build(),
                StatusCode::BAD_REQUEST,
                1,
            ),
        ];
        for (err, status, code) in cases {
            let resp = err.error_response();
            assert_eq!(resp.status(), status);
            let body = to_bytes(resp.into_body()).await.unwrap();
            let body: serde_json::Value = serde_json::from_slice(&body).unwrap();
            assert_eq!(body["code"], code);
            assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));
        }
    }
}
