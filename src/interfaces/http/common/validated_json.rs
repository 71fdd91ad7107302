//! JSON extractor that runs `validator` rules after deserializing
//!
//! Malformed bodies are answered with 400, bodies that parse but break a
//! field rule with 422. Both carry an [`ApiResponse`] error envelope.

use axum::extract::rejection::JsonRejection;
use axum::extract::{FromRequest, Request};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::de::DeserializeOwned;
use validator::{Validate, ValidationErrors};

use super::ApiResponse;

/// Like `axum::Json<T>`, but the inner value has passed `Validate::validate`.
pub struct ValidatedJson<T>(pub T);

pub enum ValidatedJsonRejection {
    Json(JsonRejection),
    Invalid(ValidationErrors),
}

fn describe(errors: &ValidationErrors) -> String {
    let mut messages: Vec<String> = errors
        .field_errors()
        .iter()
        .flat_map(|(field, errs)| {
            errs.iter().map(move |e| match &e.message {
                Some(message) => format!("{field}: {message}"),
                None => format!("{field}: {}", e.code),
            })
        })
        .collect();
    messages.sort();

    if messages.is_empty() {
        "Validation failed".to_string()
    } else {
        messages.join("; ")
    }
}

impl IntoResponse for ValidatedJsonRejection {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            Self::Json(rejection) => (
                StatusCode::BAD_REQUEST,
                format!("Invalid JSON: {rejection}"),
            ),
            Self::Invalid(errors) => (StatusCode::UNPROCESSABLE_ENTITY, describe(&errors)),
        };
        (status, Json(ApiResponse::<()>::error(message))).into_response()
    }
}

impl<S, T> FromRequest<S> for ValidatedJson<T>
where
    T: DeserializeOwned + Validate,
    S: Send + Sync,
{
    type Rejection = ValidatedJsonRejection;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(ValidatedJsonRejection::Json)?;
        value.validate().map_err(ValidatedJsonRejection::Invalid)?;
        Ok(ValidatedJson(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use axum::routing::post;
    use axum::Router;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Validate)]
    struct Badge {
        #[validate(length(min = 1, max = 8, message = "must be 1-8 characters"))]
        rfid: String,
    }

    async fn handler(ValidatedJson(badge): ValidatedJson<Badge>) -> String {
        badge.rfid
    }

    async fn send(body: &'static str) -> Response {
        use tower::Service;
        let mut svc = Router::new().route("/badge", post(handler)).into_service();
        let req = Request::builder()
            .method("POST")
            .uri("/badge")
            .header("content-type", "application/json")
            .body(Body::from(body))
            .unwrap();
        svc.call(req).await.unwrap()
    }

    async fn error_of(resp: Response) -> String {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        let body: ApiResponse<()> = serde_json::from_slice(&bytes).unwrap();
        assert!(!body.success);
        body.error.unwrap()
    }

    #[tokio::test]
    async fn valid_body_reaches_handler() {
        let resp = send(r#"{"rfid":"AA00001"}"#).await;
        assert_eq!(resp.status(), StatusCode::OK);
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"AA00001");
    }

    #[tokio::test]
    async fn malformed_json_is_bad_request() {
        let resp = send("rfid=AA00001").await;
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
        assert!(error_of(resp).await.starts_with("Invalid JSON"));
    }

    #[tokio::test]
    async fn broken_rule_is_unprocessable_with_field_message() {
        let resp = send(r#"{"rfid":""}"#).await;
        assert_eq!(resp.status(), StatusCode::UNPROCESSABLE_ENTITY);
        assert_eq!(error_of(resp).await, "rfid: must be 1-8 characters");
    }
}
