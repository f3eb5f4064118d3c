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

mod api;
mod config;
mod error;

use std::sync::Arc;

use actix_cors::Cors;
use actix_easy_multipart::MultipartFormConfig;
use actix_web::{
    body::MessageBody,
    dev::{ServiceFactory, ServiceRequest, ServiceResponse},
    guard,
    http::header,
    middleware::DefaultHeaders,
    web, App, HttpServer,
};
pub use config::ServerConfig;
pub use error::{ApiError, ServerError};
use snafu::ResultExt;
use stitch_storage::{UploadEngine, UploadEngineRef};
use tracing::info;

use crate::error::{BindSnafu, EngineSnafu, InvalidRequestSnafu, ServeSnafu};

/// Builds the application serving `engine`.
///
/// Chunk uploads larger than `upload_limit` bytes are refused.
pub fn build_app(
    engine: UploadEngineRef,
    upload_limit: usize,
) -> App<
    impl ServiceFactory<
        ServiceRequest,
        Config = (),
        Response = ServiceResponse<impl MessageBody>,
        Error = actix_web::Error,
        InitError = (),
    >,
> {
    let cors = Cors::default()
        .allow_any_origin()
        .allow_any_header()
        .allow_any_method()
        .max_age(86400)
        .disable_preflight();
    let json_config = web::JsonConfig::default().error_handler(|err, _req| {
        InvalidRequestSnafu {
            reason: err.to_string(),
        }
        .build()
        .into()
    });

    App::new()
        .wrap(tracing_actix_web::TracingLogger::default())
        .wrap(cors)
        .wrap(DefaultHeaders::new().add((header::ACCESS_CONTROL_ALLOW_HEADERS, "*")))
        .app_data(
            MultipartFormConfig::default()
                .total_limit(upload_limit)
                .memory_limit(upload_limit)
                .error_handler(|err, _req| {
                    InvalidRequestSnafu {
                        reason: err.to_string(),
                    }
                    .build()
                    .into()
                }),
        )
        .app_data(json_config)
        .app_data(web::Data::from(engine))
        .service(
            web::resource("/{tail:.*}")
                .guard(guard::Options())
                .to(api::preflight),
        )
        .service(api::upload)
        .service(api::merge)
        .service(api::status)
}

/// Serves the upload API until the server is shut down.
pub async fn serve(config: ServerConfig) -> Result<(), ServerError> {
    let engine: UploadEngineRef =
        Arc::new(UploadEngine::new(config.storage.clone()).context(EngineSnafu)?);
    let upload_limit = config.upload_limit();
    info!(
        "listening on {} with {} workers, chunks up to {}",
        config.listen, config.workers, config.max_chunk_size
    );

    HttpServer::new(move || build_app(engine.clone(), upload_limit))
        .workers(config.workers.max(1))
        .bind(&config.listen)
        .context(BindSnafu {
            addr: &config.listen,
        })?
        .run()
        .await
        .context(ServeSnafu)
}
