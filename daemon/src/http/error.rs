use hyper::{Body, Response};
use serde_json::json;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("unknown device: {0}")]
    UnknownDevice(String),

    #[error("missing parameter: {0}")]
    MissingParameter(&'static str),

    #[error("the request could not be parsed: {0}")]
    ParseError(String),

    #[error("{0}")]
    Failed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<provider::ProviderError> for Error {
    fn from(e: provider::ProviderError) -> Self {
        Error::Internal(anyhow::Error::new(e))
    }
}

/// `{status: 0, message, data?}` success envelope.
pub fn success(message: &str, data: Option<serde_json::Value>) -> Response<Body> {
    let mut body = json!({"status": 0, "message": message});
    if let Some(data) = data {
        body["data"] = data;
    }
    json_response(&body)
}

/// `{status: 1000, message}` failure envelope. Stack traces stay in the log.
pub fn failure(message: impl ToString) -> Response<Body> {
    json_response(&json!({"status": 1000, "message": message.to_string()}))
}

fn json_response(body: &serde_json::Value) -> Response<Body> {
    Response::builder()
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub async fn error_handler(err: routerify::RouteError) -> Response<Body> {
    match err.downcast_ref::<Error>() {
        Some(e) => {
            log::warn!("request failed: {:#}", e);
            failure(e)
        }
        None => {
            log::warn!("request failed: {:#}", err);
            failure("internal error")
        }
    }
}
