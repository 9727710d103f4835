use crate::errors::IngestError;
use crate::metrics_defs::{REQUEST_DURATION, REQUESTS_INFLIGHT};
use crate::pipeline::{InflightGuard, Pipeline, SendOutcome};
use http_body_util::BodyExt;
use http_body_util::combinators::BoxBody;
use hyper::body::{Body, Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde::Serialize;
use serde_json::{Map, Value};
use shared::http::{make_boxed_error_response, make_json_response};
use shared::histogram;
use std::fmt::Display;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub const RECEIVE_DATA_PATH: &str = "/receive-data";
const DEVICE_ID_FIELD: &str = "DeviceID";

#[derive(Serialize)]
struct Detail {
    detail: String,
}

#[derive(Serialize)]
struct Processed {
    status: &'static str,
    message: &'static str,
    delivered: bool,
}

type IngestResponse = Response<BoxBody<Bytes, IngestError>>;

/// Accepts device telemetry on `POST /receive-data`.
pub struct IngestService {
    pipeline: Arc<Pipeline>,
}

impl IngestService {
    pub fn new(pipeline: Arc<Pipeline>) -> Self {
        IngestService { pipeline }
    }
}

impl Service<Request<Incoming>> for IngestService {
    type Response = IngestResponse;
    type Error = IngestError;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let pipeline = self.pipeline.clone();
        Box::pin(async move { Ok(handle(&pipeline, req).await) })
    }
}

pub async fn handle<B>(pipeline: &Pipeline, req: Request<B>) -> IngestResponse
where
    B: Body,
    B::Error: Display,
{
    let start = Instant::now();
    let inflight = InflightGuard::new(REQUESTS_INFLIGHT);

    let response = route(pipeline, req).await;

    drop(inflight);
    histogram!(REQUEST_DURATION, "status" => response.status().as_str().to_string())
        .record(start.elapsed().as_secs_f64());
    response
}

async fn route<B>(pipeline: &Pipeline, req: Request<B>) -> IngestResponse
where
    B: Body,
    B::Error: Display,
{
    match (req.method(), req.uri().path()) {
        (&Method::POST, RECEIVE_DATA_PATH) => {}
        (_, RECEIVE_DATA_PATH) => return make_boxed_error_response(StatusCode::METHOD_NOT_ALLOWED),
        _ => return make_boxed_error_response(StatusCode::NOT_FOUND),
    }

    let result = async {
        let body = req
            .into_body()
            .collect()
            .await
            .map_err(|e| IngestError::RequestBody(e.to_string()))?
            .to_bytes();
        let (device_id, payload) = parse_payload(&body)?;
        pipeline.process(&device_id, &payload).await
    }
    .await;

    match result {
        Ok(outcome) => outcome_response(&outcome),
        Err(e) => error_response(&e),
    }
}

/// Extracts the device id from a JSON object body.
fn parse_payload(body: &[u8]) -> Result<(String, Map<String, Value>), IngestError> {
    let payload = match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(payload)) => payload,
        Ok(_) => return Err(IngestError::InvalidBody("expected a JSON object".into())),
        Err(e) => return Err(IngestError::InvalidBody(e.to_string())),
    };

    let device_id = payload
        .get(DEVICE_ID_FIELD)
        .and_then(Value::as_str)
        .filter(|id| !id.is_empty())
        .ok_or(IngestError::MissingField)?
        .to_string();

    Ok((device_id, payload))
}

fn outcome_response(outcome: &SendOutcome) -> IngestResponse {
    match outcome {
        SendOutcome::Delivered { .. } => make_json_response(
            StatusCode::OK,
            &Processed {
                status: "success",
                message: "Device processed successfully.",
                delivered: true,
            },
        ),
        // Provisioned, but the caller should know the telemetry was dropped.
        SendOutcome::NotDelivered { .. } => make_json_response(
            StatusCode::ACCEPTED,
            &Processed {
                status: "success",
                message: "Device provisioned; telemetry was not delivered.",
                delivered: false,
            },
        ),
    }
}

fn error_response(error: &IngestError) -> IngestResponse {
    if error.is_client_error() {
        tracing::debug!("rejected payload: {error}");
        return make_json_response(
            StatusCode::BAD_REQUEST,
            &Detail {
                detail: error.to_string(),
            },
        );
    }

    tracing::error!("failed to process payload: {error}");
    make_json_response(
        StatusCode::INTERNAL_SERVER_ERROR,
        &Detail {
            detail: format!("Failed to process data: {error}"),
        },
    )
}
