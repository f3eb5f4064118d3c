//! End to end tests of the upload API.

use std::{path::Path, sync::Arc};

use actix_web::http::header::{self, HeaderValue};
use bytes::{BufMut, Bytes, BytesMut};
use stitch_storage::{Config, UploadEngine, UploadEngineRef};

const BOUNDARY: &str = "stitch-test-boundary";

/// A part of a `multipart/form-data` body.
pub enum Part<'a> {
    Text(&'a str, &'a str),
    File(&'a str, &'a [u8]),
}

/// Encodes `parts` as a multipart body, returns its content type and payload.
pub fn multipart(parts: &[Part<'_>]) -> (HeaderValue, Bytes) {
    let mut body = BytesMut::new();
    for part in parts {
        body.put_slice(format!("--{BOUNDARY}\r\n").as_bytes());
        match part {
            Part::Text(name, value) => {
                body.put_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"\r\n\
                         Content-Type: text/plain\r\n\r\n{value}\r\n"
                    )
                    .as_bytes(),
                );
            }
            Part::File(name, data) => {
                body.put_slice(
                    format!(
                        "Content-Disposition: form-data; name=\"{name}\"; filename=\"blob\"\r\n\
                         Content-Type: application/octet-stream\r\n\r\n"
                    )
                    .as_bytes(),
                );
                body.put_slice(data);
                body.put_slice(b"\r\n");
            }
        }
    }
    body.put_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    let content_type = HeaderValue::from_str(&format!("multipart/form-data; boundary={BOUNDARY}"))
        .unwrap_or(HeaderValue::from_static("multipart/form-data"));
    (content_type, body.freeze())
}

pub fn chunk_upload(identifier: &str, filename: &str, data: &[u8]) -> (HeaderValue, Bytes) {
    multipart(&[
        Part::Text("hash", identifier),
        Part::Text("filename", filename),
        Part::File("chunk", data),
    ])
}

pub fn engine(root: &Path) -> UploadEngineRef {
    stitch_utils::logger::install_fmt_log();
    let mut config = Config::default();
    config.with_upload_dir(root);
    config.copy_timeout_secs = 10;
    Arc::new(UploadEngine::new(config).expect("upload dir is writable"))
}

pub fn content_type(value: HeaderValue) -> (header::HeaderName, HeaderValue) {
    (header::CONTENT_TYPE, value)
}

#[cfg(test)]
mod tests {
    use actix_web::{
        body::MessageBody,
        dev::{Service, ServiceResponse},
        http::{header, Method, StatusCode},
        test, Error,
    };
    use serde_json::{json, Value};
    use stitch_server::build_app;

    use super::*;

    const LIMIT: usize = 1 << 20;

    async fn upload<S, B>(app: &S, identifier: &str, filename: &str, data: &[u8]) -> ServiceResponse<B>
    where
        S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = Error>,
        B: MessageBody,
    {
        let (ct, body) = chunk_upload(identifier, filename, data);
        let req = test::TestRequest::post()
            .uri("/upload")
            .insert_header(content_type(ct))
            .set_payload(body)
            .to_request();
        test::call_service(app, req).await
    }

    async fn merge<S, B>(app: &S, body: Value) -> (StatusCode, Value)
    where
        S: Service<actix_http::Request, Response = ServiceResponse<B>, Error = Error>,
        B: MessageBody,
    {
        let req = test::TestRequest::post()
            .uri("/merge")
            .set_json(body)
            .to_request();
        let resp = test::call_service(app, req).await;
        let status = resp.status();
        let body = test::read_body(resp).await;
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[actix_web::test]
    async fn upload_and_merge() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = test::init_service(build_app(engine(tempdir.path()), LIMIT)).await;

        for (id, data) in [
            ("h-0", vec![0xAA; 1024]),
            ("h-2", vec![0xCC; 512]),
            ("h-1", vec![0xBB; 1024]),
        ] {
            let resp = upload(&app, id, "video.mp4", &data).await;
            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(test::read_body(resp).await, "received file chunk");
        }

        let req = test::TestRequest::get().uri("/upload/video.mp4").to_request();
        let status: Value = test::call_and_read_body_json(&app, req).await;
        assert_eq!(status, json!({
            "code": 0,
            "upload_key": "video",
            "state": "receiving",
            "staged": [0, 1, 2],
            "merged": [],
        }));

        let (status, body) = merge(&app, json!({"filename": "video.mp4", "size": 1024})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({
            "code": 0,
            "message": "file merged success",
            "merged": 3,
            "expected": 3,
            "size": 2560,
        }));

        let data = std::fs::read(tempdir.path().join("video.mp4")).unwrap();
        assert_eq!(data.len(), 2560);
        assert!(data[1024..2048].iter().all(|b| *b == 0xBB));
        assert!(!tempdir.path().join("video").exists());

        let (status, body) = merge(&app, json!({"filename": "video.mp4", "size": 1024})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 3);
    }

    #[actix_web::test]
    async fn merge_errors() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = test::init_service(build_app(engine(tempdir.path()), LIMIT)).await;

        let (status, body) = merge(&app, json!({"filename": "ghost.mp4", "size": 1024})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["code"], 2);

        upload(&app, "h-0", "video.mp4", &[1; 16]).await;
        upload(&app, "h-2", "video.mp4", &[1; 16]).await;
        let (status, body) = merge(&app, json!({"filename": "video.mp4", "size": 16})).await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["code"], 4);
        assert!(!tempdir.path().join("video.mp4").exists());

        let (status, body) = merge(&app, json!({"filename": "video.mp4", "size": 0})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 1);

        let (status, body) = merge(&app, json!({"filename": "video.mp4"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 1);

        let (status, body) = merge(&app, json!({"filename": "video.mp4", "size": -3})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["code"], 1);

        // the staged chunks survived every failed attempt
        upload(&app, "h-1", "video.mp4", &[1; 16]).await;
        let (status, body) = merge(&app, json!({"filename": "video.mp4", "size": 16})).await;
        assert_eq!(status, StatusCode::OK, "{body}");
        assert_eq!(body["size"], 48);
    }

    #[actix_web::test]
    async fn malformed_uploads() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = test::init_service(build_app(engine(tempdir.path()), LIMIT)).await;

        let (ct, body) = multipart(&[Part::Text("filename", "video.mp4"), Part::File("chunk", b"x")]);
        let req = test::TestRequest::post()
            .uri("/upload")
            .insert_header(content_type(ct))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        assert_eq!(body["code"], 1);

        let resp = upload(&app, "no-index", "video.mp4", b"x").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = upload(&app, "h-0", "../escape.mp4", b"x").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(!tempdir.path().join("..").join("escape").exists());

        let req = test::TestRequest::post()
            .uri("/upload")
            .insert_header((header::CONTENT_TYPE, "text/plain"))
            .set_payload("not a form")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        let body: Value = serde_json::from_slice(&test::read_body(resp).await).unwrap();
        assert_eq!(body["code"], 1);
        assert!(body["message"].as_str().is_some_and(|m| !m.is_empty()));
    }

    #[actix_web::test]
    async fn status_of_unknown_upload() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = test::init_service(build_app(engine(tempdir.path()), LIMIT)).await;

        let req = test::TestRequest::get().uri("/upload/ghost.mp4").to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[actix_web::test]
    async fn cors_and_preflight() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = test::init_service(build_app(engine(tempdir.path()), LIMIT)).await;

        let req = test::TestRequest::default()
            .method(Method::OPTIONS)
            .uri("/upload")
            .insert_header((header::ORIGIN, "https://app.example.com"))
            .insert_header((header::ACCESS_CONTROL_REQUEST_METHOD, "POST"))
            .insert_header((header::ACCESS_CONTROL_REQUEST_HEADERS, "content-type"))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let headers = resp.headers().clone();
        assert!(headers.contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(
            headers.get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "content-type"
        );
        assert!(test::read_body(resp).await.is_empty());

        // bare OPTIONS on any path
        let req = test::TestRequest::default()
            .method(Method::OPTIONS)
            .uri("/anything/else")
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "*"
        );
        assert!(test::read_body(resp).await.is_empty());

        let (ct, body) = chunk_upload("h-0", "video.mp4", b"abc");
        let req = test::TestRequest::post()
            .uri("/upload")
            .insert_header(content_type(ct))
            .insert_header((header::ORIGIN, "https://app.example.com"))
            .set_payload(body)
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::OK);
        assert!(resp.headers().contains_key(header::ACCESS_CONTROL_ALLOW_ORIGIN));
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "*"
        );

        // error responses carry it too
        let req = test::TestRequest::post()
            .uri("/merge")
            .set_json(serde_json::json!({ "filename": "ghost.mp4", "size": 4 }))
            .to_request();
        let resp = test::call_service(&app, req).await;
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            resp.headers().get(header::ACCESS_CONTROL_ALLOW_HEADERS).unwrap(),
            "*"
        );
    }

    #[actix_web::test]
    async fn oversized_chunk_is_refused() {
        let tempdir = tempfile::tempdir().unwrap();
        let app = test::init_service(build_app(engine(tempdir.path()), 1024)).await;

        let resp = upload(&app, "h-0", "big.bin", &[7; 4096]).await;
        assert!(resp.status().is_client_error(), "{}", resp.status());
        assert!(!tempdir.path().join("big").join("h-0").exists());
    }
}
