//! Push-subscription endpoint.
//!
//! Pub/Sub push subscriptions deliver each message as
//! `POST /projects/{project}/topics/{topic}`. Any non-2xx answer makes the
//! transport redeliver the message later.

use crate::handlers::{HandlerError, Handlers};
use http_body_util::BodyExt;
use hyper::body::{Bytes, Incoming};
use hyper::service::Service;
use hyper::{Method, Request, Response, StatusCode};
use serde_json::json;
use shared::http::{ResponseBody, json_response, make_error_response, text_response};
use shared::metrics_defs::{MetricDef, MetricType};
use shared::pubsub::PushEnvelope;
use shared::{counter, histogram};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

pub const PUSH_REQUESTS: MetricDef = MetricDef {
    name: "push.requests",
    metric_type: MetricType::Counter,
    description: "Push deliveries received. Tagged with topic, status.",
};

pub const PUSH_DURATION: MetricDef = MetricDef {
    name: "push.duration",
    metric_type: MetricType::Histogram,
    description: "Time to handle a push delivery in seconds. Tagged with topic.",
};

pub const ALL_METRICS: &[MetricDef] = &[PUSH_REQUESTS, PUSH_DURATION];

pub struct PushService {
    handlers: Arc<Handlers>,
    project: String,
}

impl PushService {
    pub fn new(handlers: Arc<Handlers>, project: String) -> Self {
        PushService { handlers, project }
    }
}

/// Extracts `{topic}` from `/projects/{project}/topics/{topic}`.
fn topic_from_path<'a>(path: &'a str, project: &str) -> Option<&'a str> {
    let (path_project, topic) = path
        .strip_prefix("/projects/")?
        .split_once("/topics/")?;
    if path_project != project || topic.is_empty() || topic.contains('/') {
        return None;
    }
    Some(topic)
}

/// Handles one request whose body has already been read.
pub async fn route(
    handlers: &Handlers,
    project: &str,
    method: &Method,
    path: &str,
    body: Bytes,
) -> Response<ResponseBody> {
    if path == "/health" {
        return text_response(StatusCode::OK, "ok\n");
    }

    let Some(topic) = topic_from_path(path, project) else {
        return make_error_response(StatusCode::NOT_FOUND);
    };
    if *method != Method::POST {
        return make_error_response(StatusCode::METHOD_NOT_ALLOWED);
    }

    let envelope: PushEnvelope = match serde_json::from_slice(&body) {
        Ok(envelope) => envelope,
        Err(e) => {
            tracing::warn!(topic, error = %e, "Malformed push envelope");
            return make_error_response(StatusCode::BAD_REQUEST);
        }
    };

    let started = Instant::now();
    let response = match handlers.dispatch(topic, &envelope.message).await {
        Ok(()) => json_response(StatusCode::OK, &json!({"success": true})),
        Err(HandlerError::UnknownTopic(_)) => make_error_response(StatusCode::NOT_FOUND),
        Err(e) => {
            tracing::error!(
                topic,
                message_id = ?envelope.message.message_id,
                subscription = ?envelope.subscription,
                error = %e,
                "Function failed"
            );
            make_error_response(StatusCode::INTERNAL_SERVER_ERROR)
        }
    };

    counter!(PUSH_REQUESTS, "topic" => topic.to_string(), "status" => response.status().as_str().to_string())
        .increment(1);
    histogram!(PUSH_DURATION, "topic" => topic.to_string()).record(started.elapsed().as_secs_f64());
    response
}

impl Service<Request<Incoming>> for PushService {
    type Response = Response<ResponseBody>;
    type Error = Infallible;
    type Future =
        Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send + 'static>>;

    fn call(&self, req: Request<Incoming>) -> Self::Future {
        let handlers = self.handlers.clone();
        let project = self.project.clone();

        Box::pin(async move {
            let (parts, body) = req.into_parts();
            let body = match body.collect().await {
                Ok(collected) => collected.to_bytes(),
                Err(e) => {
                    tracing::warn!(error = %e, "Failed to read request body");
                    return Ok(make_error_response(StatusCode::BAD_REQUEST));
                }
            };
            Ok(route(&handlers, &project, &parts.method, parts.uri.path(), body).await)
        })
    }
}
