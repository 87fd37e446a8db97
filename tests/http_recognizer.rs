//! Wire-level tests for [`HttpRecognizer`] against a mock chat-completions
//! server.

use fieldscan::{
    ExtractionConfig, ExtractionOrchestrator, ExtractionRequest, ExtractionState, FieldExtractor,
    HistoryStore, HttpRecognizer, RecognitionRequest, Recognizer, ScanError, SourceDocument,
};
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use serde_json::json;
use std::io::Cursor;
use std::sync::Arc;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn config_for(server: &MockServer) -> ExtractionConfig {
    ExtractionConfig::builder()
        .endpoint(format!("{}/v1/chat/completions", server.uri()))
        .model("gpt-4.1-mini")
        .api_key("test-key")
        .build()
        .unwrap()
}

fn completion(content: &str) -> serde_json::Value {
    json!({
        "id": "chatcmpl-1",
        "object": "chat.completion",
        "choices": [
            { "index": 0, "message": { "role": "assistant", "content": content }, "finish_reason": "stop" }
        ]
    })
}

fn request() -> RecognitionRequest {
    RecognitionRequest {
        system_prompt: "Extract: name".into(),
        instruction: "Extract the specified fields from this document image.".into(),
        image_base64: "iVBORw0KGgo=".into(),
        image_mime: "image/png".into(),
    }
}

#[tokio::test]
async fn sends_bearer_auth_and_chat_completion_body() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .and(header("authorization", "Bearer test-key"))
        .and(body_partial_json(json!({
            "model": "gpt-4.1-mini",
            "max_tokens": 1000,
            "messages": [
                { "role": "system", "content": "Extract: name" },
                {
                    "role": "user",
                    "content": [
                        { "type": "text" },
                        { "type": "image_url", "image_url": { "url": "data:image/png;base64,iVBORw0KGgo=" } }
                    ]
                }
            ]
        })))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(r#"{"name":"Yamada"}"#)))
        .expect(1)
        .mount(&server)
        .await;

    let recognizer = HttpRecognizer::from_config(&config_for(&server)).unwrap();
    let reply = recognizer.recognize(&request()).await.unwrap();
    assert_eq!(reply, r#"{"name":"Yamada"}"#);
}

#[tokio::test]
async fn unauthorized_is_auth_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(401).set_body_json(json!({
            "error": { "message": "Incorrect API key provided" }
        })))
        .expect(1)
        .mount(&server)
        .await;

    let recognizer = HttpRecognizer::from_config(&config_for(&server)).unwrap();
    let err = recognizer.recognize(&request()).await.unwrap_err();
    assert!(matches!(err, ScanError::RecognitionAuth { .. }), "got {err:?}");
    assert!(err.to_string().contains("401"));
}

#[tokio::test]
async fn server_error_is_service_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(503).set_body_string("overloaded"))
        .expect(1)
        .mount(&server)
        .await;

    let recognizer = HttpRecognizer::from_config(&config_for(&server)).unwrap();
    let err = recognizer.recognize(&request()).await.unwrap_err();
    assert!(matches!(err, ScanError::RecognitionService { .. }), "got {err:?}");
    assert!(err.to_string().contains("overloaded"));
}

#[tokio::test]
async fn empty_choices_is_service_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "choices": [] })))
        .mount(&server)
        .await;

    let recognizer = HttpRecognizer::from_config(&config_for(&server)).unwrap();
    let err = recognizer.recognize(&request()).await.unwrap_err();
    assert!(err.to_string().contains("no choices"));
}

#[tokio::test]
async fn non_json_body_is_service_error() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_string("<html>proxy</html>"))
        .mount(&server)
        .await;

    let recognizer = HttpRecognizer::from_config(&config_for(&server)).unwrap();
    let err = recognizer.recognize(&request()).await.unwrap_err();
    assert!(matches!(err, ScanError::RecognitionService { .. }), "got {err:?}");
}

#[tokio::test]
async fn fenced_reply_is_parsed_by_extractor() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(completion("```json\n{\"rent\": 85000, \"pets\": null}\n```")),
        )
        .mount(&server)
        .await;

    let recognizer = Arc::new(HttpRecognizer::from_config(&config_for(&server)).unwrap());
    let fields = FieldExtractor::new(recognizer)
        .extract_fields("iVBORw0KGgo=", &["rent".to_string(), "pets".to_string()])
        .await
        .unwrap();
    assert_eq!(fields["rent"], "85000");
    assert_eq!(fields["pets"], "");
}

#[tokio::test]
async fn end_to_end_upload_against_mock_server() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/chat/completions"))
        .respond_with(ResponseTemplate::new(200).set_body_json(completion(
            r#"{"物件名":"サンプルマンション","賃料":"85,000円"}"#,
        )))
        .expect(1)
        .mount(&server)
        .await;

    let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(40, 40, Rgb([255, 255, 255])));
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), ImageFormat::Png).unwrap();
    let document = SourceDocument::from_bytes(buf).unwrap();

    let orch = ExtractionOrchestrator::new(config_for(&server), HistoryStore::in_memory()).unwrap();
    let outcome = orch
        .extract_upload(ExtractionRequest::new(document, ["物件名", "賃料"]))
        .await
        .unwrap();

    assert_eq!(outcome.state, ExtractionState::Completed);
    assert_eq!(outcome.fields["物件名"], "サンプルマンション");
    assert_eq!(outcome.fields["賃料"], "85,000円");
}
