// Copyright (C) 2026 StarHuntingGames
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program.  If not, see <https://www.gnu.org/licenses/>.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Bytes,
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
};
use chrono::{DateTime, Utc};
use lambda_http::run as lambda_run;
use rdkafka::{
    config::ClientConfig,
    producer::{FutureProducer, FutureRecord},
};
use relay_common::{
    InboundCommand, QueueBackend, RelayError, SlackReply,
    gcp::{TokenSource, token_source_from_env},
    publish_failed_message, required_env,
};
use ring::hmac;
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

const SLACK_TIMESTAMP_HEADER: &str = "x-slack-request-timestamp";
const SLACK_SIGNATURE_HEADER: &str = "x-slack-signature";
const SLACK_SIGNATURE_VERSION: &str = "v0";
const DEFAULT_MAX_REQUEST_AGE_SECONDS: i64 = 300;
const PUBSUB_API_BASE_URL: &str = "https://pubsub.googleapis.com";

#[derive(Clone)]
struct AppState {
    publisher: Arc<dyn QueuePublisher>,
    verifier: Arc<SignatureVerifier>,
}

#[derive(Debug, Clone)]
struct ReceiverConfig {
    project_id: String,
    topic_name: String,
    slack_secret: String,
    max_request_age_seconds: i64,
    queue_backend: QueueBackend,
    kafka_bootstrap_servers: String,
}

impl ReceiverConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            project_id: required_env("PROJECT_ID")?,
            topic_name: required_env("TOPIC_NAME")?,
            slack_secret: required_env("SLACK_SECRET")?,
            max_request_age_seconds: std::env::var("SLACK_MAX_REQUEST_AGE_SECONDS")
                .ok()
                .and_then(|value| value.parse::<i64>().ok())
                .unwrap_or(DEFAULT_MAX_REQUEST_AGE_SECONDS)
                .max(1),
            queue_backend: QueueBackend::from_env()?,
            kafka_bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                .ok()
                .unwrap_or_else(|| "kafka:9092".to_string()),
        })
    }
}

/// Slack request signing, version `v0`.
#[derive(Debug, Clone)]
struct SignatureVerifier {
    key: hmac::Key,
    max_age_seconds: i64,
}

impl SignatureVerifier {
    fn new(signing_secret: &str, max_age_seconds: i64) -> Self {
        Self {
            key: hmac::Key::new(hmac::HMAC_SHA256, signing_secret.as_bytes()),
            max_age_seconds,
        }
    }

    fn verify(&self, headers: &HeaderMap, body: &[u8], now: DateTime<Utc>) -> Result<(), RelayError> {
        let timestamp = header_value(headers, SLACK_TIMESTAMP_HEADER)?;
        let issued_at = timestamp
            .parse::<i64>()
            .map_err(|_| RelayError::Authentication("request timestamp is not a number".into()))?;
        if now.timestamp().abs_diff(issued_at) > self.max_age_seconds.unsigned_abs() {
            return Err(RelayError::Authentication(
                "request timestamp is outside the allowed window".into(),
            ));
        }

        let signature = header_value(headers, SLACK_SIGNATURE_HEADER)?;
        let digest = signature
            .strip_prefix(SLACK_SIGNATURE_VERSION)
            .and_then(|rest| rest.strip_prefix('='))
            .ok_or_else(|| RelayError::Authentication("unsupported signature version".into()))?;
        let tag = hex::decode(digest)
            .map_err(|_| RelayError::Authentication("signature is not valid hex".into()))?;

        hmac::verify(&self.key, &signing_base(timestamp, body), &tag)
            .map_err(|_| RelayError::Authentication("signature mismatch".into()))
    }
}

fn signing_base(timestamp: &str, body: &[u8]) -> Vec<u8> {
    let mut base = format!("{SLACK_SIGNATURE_VERSION}:{timestamp}:").into_bytes();
    base.extend_from_slice(body);
    base
}

fn header_value<'a>(headers: &'a HeaderMap, name: &'static str) -> Result<&'a str, RelayError> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| RelayError::Authentication(format!("missing {name} header")))
}

#[async_trait]
trait QueuePublisher: Send + Sync {
    async fn publish(&self, command: &InboundCommand) -> anyhow::Result<()>;
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublishResponse {
    #[serde(default)]
    message_ids: Vec<String>,
}

/// Publishes through the Pub/Sub REST API, or an emulator when one is configured.
struct PubSubPublisher {
    client: reqwest::Client,
    tokens: Option<Arc<dyn TokenSource>>,
    publish_url: String,
    topic_path: String,
}

impl PubSubPublisher {
    fn new(
        client: reqwest::Client,
        tokens: Option<Arc<dyn TokenSource>>,
        api_base_url: &str,
        project_id: &str,
        topic_name: &str,
    ) -> Self {
        let topic_path = format!("projects/{project_id}/topics/{topic_name}");
        Self {
            client,
            tokens,
            publish_url: format!(
                "{}/v1/{}:publish",
                api_base_url.trim_end_matches('/'),
                topic_path
            ),
            topic_path,
        }
    }

    fn from_config(config: &ReceiverConfig) -> Self {
        let client = reqwest::Client::new();
        match std::env::var("PUBSUB_EMULATOR_HOST")
            .ok()
            .filter(|host| !host.trim().is_empty())
        {
            Some(host) => Self::new(
                client,
                None,
                &format!("http://{host}"),
                &config.project_id,
                &config.topic_name,
            ),
            None => Self::new(
                client.clone(),
                Some(token_source_from_env(client)),
                PUBSUB_API_BASE_URL,
                &config.project_id,
                &config.topic_name,
            ),
        }
    }
}

#[async_trait]
impl QueuePublisher for PubSubPublisher {
    async fn publish(&self, command: &InboundCommand) -> anyhow::Result<()> {
        let data = command.to_base64()?;
        let mut request = self
            .client
            .post(&self.publish_url)
            .json(&serde_json::json!({"messages": [{"data": data}]}));
        if let Some(tokens) = &self.tokens {
            request = request.bearer_auth(tokens.access_token().await?);
        }

        let response = request.send().await.context("failed to reach Pub/Sub")?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            anyhow::bail!("Pub/Sub returned {} for {}: {}", status, self.topic_path, body);
        }
        let published = response
            .json::<PublishResponse>()
            .await
            .context("invalid Pub/Sub publish response")?;

        info!(
            topic = %self.topic_path,
            message_ids = ?published.message_ids,
            "command published to Pub/Sub topic"
        );
        Ok(())
    }
}

#[derive(Clone)]
struct KafkaQueuePublisher {
    producer: FutureProducer,
    topic: String,
}

impl KafkaQueuePublisher {
    fn from_config(config: &ReceiverConfig) -> anyhow::Result<Self> {
        let producer = ClientConfig::new()
            .set("bootstrap.servers", &config.kafka_bootstrap_servers)
            .set("message.timeout.ms", "5000")
            .create()
            .context("failed to create Kafka command producer")?;
        Ok(Self {
            producer,
            topic: config.topic_name.clone(),
        })
    }
}

#[async_trait]
impl QueuePublisher for KafkaQueuePublisher {
    async fn publish(&self, command: &InboundCommand) -> anyhow::Result<()> {
        let payload = command.to_payload()?;
        let key = uuid::Uuid::new_v4().to_string();
        self.producer
            .send(
                FutureRecord::to(&self.topic).key(&key).payload(&payload),
                std::time::Duration::from_secs(5),
            )
            .await
            .map_err(|(error, _)| anyhow::anyhow!("Kafka publish failed: {error:?}"))?;

        info!(topic = %self.topic, key = %key, "command published to Kafka topic");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "slack_receiver=debug,tower_http=info".to_string()),
        )
        .init();

    let config = ReceiverConfig::from_env()?;
    let publisher: Arc<dyn QueuePublisher> = match config.queue_backend {
        QueueBackend::PubSub => Arc::new(PubSubPublisher::from_config(&config)),
        QueueBackend::Kafka => Arc::new(KafkaQueuePublisher::from_config(&config)?),
    };
    let state = AppState {
        publisher,
        verifier: Arc::new(SignatureVerifier::new(
            &config.slack_secret,
            config.max_request_age_seconds,
        )),
    };

    let app = build_router(state);

    if std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok() {
        info!("AWS Lambda runtime detected; running slack-receiver in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let default_bind = format!(
        "0.0.0.0:{}",
        std::env::var("PORT").ok().unwrap_or_else(|| "8080".to_string())
    );
    let bind_addr = parse_bind_addr("RECEIVER_BIND", &default_bind)?;
    info!(%bind_addr, backend = ?config.queue_backend, "slack-receiver listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(state: AppState) -> Router {
    Router::new()
        .route(
            "/",
            post(slack_command_handler).fallback(method_not_allowed),
        )
        .route("/health", get(health))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "slack-receiver"}))
}

async fn method_not_allowed() -> (StatusCode, &'static str) {
    (StatusCode::METHOD_NOT_ALLOWED, "Only POST requests are accepted")
}

#[derive(Debug, Deserialize)]
struct SlashCommandForm {
    text: Option<String>,
    response_url: Option<String>,
}

fn parse_command(body: &[u8]) -> Result<InboundCommand, RelayError> {
    let form: SlashCommandForm = serde_urlencoded::from_bytes(body)
        .map_err(|error| RelayError::MalformedMessage(format!("invalid form body: {error}")))?;
    let text = form.text.ok_or(RelayError::MissingField("text"))?;
    let response_url = form
        .response_url
        .ok_or(RelayError::MissingField("response_url"))?;
    Ok(InboundCommand { text, response_url })
}

async fn slack_command_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<SlackReply>, ApiError> {
    state.verifier.verify(&headers, &body, Utc::now())?;
    let command = parse_command(&body)?;

    info!(command = %command.text, "publishing slash command");
    match state.publisher.publish(&command).await {
        Ok(()) => Ok(Json(SlackReply::in_channel(""))),
        Err(error) => {
            let error = RelayError::Publish(format!("{error:#}"));
            warn!(error = %error, "message publishing failed");
            Ok(Json(SlackReply::in_channel(publish_failed_message(&error))))
        }
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    message: String,
}

impl From<RelayError> for ApiError {
    fn from(error: RelayError) -> Self {
        let status = match &error {
            RelayError::Authentication(_) => StatusCode::UNAUTHORIZED,
            RelayError::MissingField(_) | RelayError::MalformedMessage(_) => {
                StatusCode::BAD_REQUEST
            }
            RelayError::Publish(_) | RelayError::CloudApi(_) | RelayError::Notify(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        Self {
            status,
            message: error.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        warn!(status = %self.status, message = %self.message, "request failed");
        (
            self.status,
            Json(serde_json::json!({"error": self.message})),
        )
            .into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{body::Body, http::Request};
    use std::sync::Mutex;
    use tower::ServiceExt;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const SECRET: &str = "8f742231b10e8888abcd99yyyzzz85a5";
    const RESPONSE_URL: &str = "https://hooks.slack.com/commands/T0001/1234/abcd";

    #[derive(Default)]
    struct RecordingPublisher {
        published: Mutex<Vec<InboundCommand>>,
        fail: bool,
    }

    #[async_trait]
    impl QueuePublisher for RecordingPublisher {
        async fn publish(&self, command: &InboundCommand) -> anyhow::Result<()> {
            if self.fail {
                return Err(anyhow::anyhow!("topic not found"));
            }
            self.published.lock().unwrap().push(command.clone());
            Ok(())
        }
    }

    fn make_state(publisher: Arc<RecordingPublisher>) -> AppState {
        AppState {
            publisher,
            verifier: Arc::new(SignatureVerifier::new(SECRET, DEFAULT_MAX_REQUEST_AGE_SECONDS)),
        }
    }

    fn form_body(text: &str) -> String {
        serde_urlencoded::to_string([
            ("token", "legacy"),
            ("command", "/minecraft"),
            ("text", text),
            ("response_url", RESPONSE_URL),
        ])
        .unwrap()
    }

    fn signed_headers(body: &[u8], timestamp: i64, secret: &str) -> HeaderMap {
        let key = hmac::Key::new(hmac::HMAC_SHA256, secret.as_bytes());
        let timestamp = timestamp.to_string();
        let tag = hmac::sign(&key, &signing_base(&timestamp, body));
        let mut headers = HeaderMap::new();
        headers.insert(SLACK_TIMESTAMP_HEADER, timestamp.parse().unwrap());
        headers.insert(
            SLACK_SIGNATURE_HEADER,
            format!("v0={}", hex::encode(tag.as_ref())).parse().unwrap(),
        );
        headers
    }

    #[test]
    fn verifier_accepts_fresh_valid_signature() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let body = form_body("status");
        let now = Utc::now();
        let headers = signed_headers(body.as_bytes(), now.timestamp(), SECRET);
        assert!(verifier.verify(&headers, body.as_bytes(), now).is_ok());
    }

    #[test]
    fn verifier_rejects_wrong_secret_and_tampered_body() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let body = form_body("status");
        let now = Utc::now();

        let wrong_secret = signed_headers(body.as_bytes(), now.timestamp(), "other-secret");
        assert!(matches!(
            verifier.verify(&wrong_secret, body.as_bytes(), now),
            Err(RelayError::Authentication(_))
        ));

        let headers = signed_headers(body.as_bytes(), now.timestamp(), SECRET);
        let tampered = form_body("stop");
        assert!(verifier.verify(&headers, tampered.as_bytes(), now).is_err());
    }

    #[test]
    fn verifier_rejects_stale_timestamp_and_missing_headers() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let body = form_body("start");
        let now = Utc::now();

        let stale = signed_headers(body.as_bytes(), now.timestamp() - 301, SECRET);
        assert!(verifier.verify(&stale, body.as_bytes(), now).is_err());

        assert!(matches!(
            verifier.verify(&HeaderMap::new(), body.as_bytes(), now),
            Err(RelayError::Authentication(_))
        ));
    }

    #[test]
    fn verifier_rejects_extreme_timestamp() {
        let verifier = SignatureVerifier::new(SECRET, 300);
        let body = form_body("start");
        let now = Utc::now();

        for timestamp in [i64::MIN, i64::MAX] {
            let mut headers = HeaderMap::new();
            headers.insert(SLACK_TIMESTAMP_HEADER, timestamp.to_string().parse().unwrap());
            headers.insert(SLACK_SIGNATURE_HEADER, "v0=00".parse().unwrap());
            assert!(matches!(
                verifier.verify(&headers, body.as_bytes(), now),
                Err(RelayError::Authentication(_))
            ));
        }
    }

    #[test]
    fn parse_command_requires_both_fields() {
        let only_text = serde_urlencoded::to_string([("text", "status")]).unwrap();
        assert!(matches!(
            parse_command(only_text.as_bytes()),
            Err(RelayError::MissingField("response_url"))
        ));

        let only_url = serde_urlencoded::to_string([("response_url", RESPONSE_URL)]).unwrap();
        assert!(matches!(
            parse_command(only_url.as_bytes()),
            Err(RelayError::MissingField("text"))
        ));

        let empty_text = serde_urlencoded::to_string([("text", ""), ("response_url", RESPONSE_URL)])
            .unwrap();
        assert_eq!(parse_command(empty_text.as_bytes()).unwrap().text, "");
    }

    #[tokio::test]
    async fn handler_publishes_exactly_one_message_with_request_fields() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = form_body("start");
        let headers = signed_headers(body.as_bytes(), Utc::now().timestamp(), SECRET);

        let reply = slack_command_handler(
            State(make_state(publisher.clone())),
            headers,
            Bytes::from(body),
        )
        .await
        .unwrap()
        .0;

        assert_eq!(reply, SlackReply::in_channel(""));
        let published = publisher.published.lock().unwrap();
        assert_eq!(published.len(), 1);
        let decoded: serde_json::Value =
            serde_json::from_slice(&published[0].to_payload().unwrap()).unwrap();
        assert_eq!(
            decoded,
            serde_json::json!({"text": "start", "response_url": RESPONSE_URL})
        );
    }

    #[tokio::test]
    async fn handler_reports_publish_failure_with_ok_status() {
        let publisher = Arc::new(RecordingPublisher {
            published: Mutex::new(vec![]),
            fail: true,
        });
        let body = form_body("stop");
        let headers = signed_headers(body.as_bytes(), Utc::now().timestamp(), SECRET);

        let reply = slack_command_handler(State(make_state(publisher)), headers, Bytes::from(body))
            .await
            .unwrap()
            .0;

        assert!(reply.text.contains("Failed to publish"));
        assert!(reply.text.contains("topic not found"));
    }

    #[tokio::test]
    async fn handler_rejects_bad_signature_with_unauthorized() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = form_body("start");
        let headers = signed_headers(body.as_bytes(), Utc::now().timestamp(), "wrong");

        let err = slack_command_handler(
            State(make_state(publisher.clone())),
            headers,
            Bytes::from(body),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::UNAUTHORIZED);
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_rejects_missing_field_with_bad_request() {
        let publisher = Arc::new(RecordingPublisher::default());
        let body = serde_urlencoded::to_string([("text", "start")]).unwrap();
        let headers = signed_headers(body.as_bytes(), Utc::now().timestamp(), SECRET);

        let err = slack_command_handler(
            State(make_state(publisher.clone())),
            headers,
            Bytes::from(body),
        )
        .await
        .unwrap_err();

        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("response_url"));
        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn router_rejects_non_post_methods_without_publishing() {
        let publisher = Arc::new(RecordingPublisher::default());

        for verb in ["GET", "PUT", "DELETE", "PATCH"] {
            let response = build_router(make_state(publisher.clone()))
                .oneshot(
                    Request::builder()
                        .method(verb)
                        .uri("/")
                        .body(Body::empty())
                        .unwrap(),
                )
                .await
                .unwrap();

            assert_eq!(response.status(), StatusCode::METHOD_NOT_ALLOWED);
            let body = axum::body::to_bytes(response.into_body(), usize::MAX)
                .await
                .unwrap();
            assert_eq!(&body[..], b"Only POST requests are accepted");
        }

        assert!(publisher.published.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn pubsub_publisher_posts_base64_message() {
        let server = MockServer::start().await;
        let command = InboundCommand::new("status", RESPONSE_URL);
        let expected_data = command.to_base64().unwrap();
        Mock::given(method("POST"))
            .and(path("/v1/projects/craft-project/topics/minecraft-ops:publish"))
            .and(header("authorization", "Bearer test-token"))
            .and(wiremock::matchers::body_json(
                serde_json::json!({"messages": [{"data": expected_data}]}),
            ))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"messageIds": ["42"]})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let publisher = PubSubPublisher::new(
            reqwest::Client::new(),
            Some(Arc::new(relay_common::gcp::StaticTokenSource::new("test-token"))),
            &server.uri(),
            "craft-project",
            "minecraft-ops",
        );

        publisher.publish(&command).await.unwrap();
    }

    #[tokio::test]
    async fn pubsub_publisher_surfaces_error_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(404).set_body_string("Resource not found"))
            .mount(&server)
            .await;

        let publisher = PubSubPublisher::new(
            reqwest::Client::new(),
            None,
            &server.uri(),
            "craft-project",
            "missing-topic",
        );

        let error = publisher
            .publish(&InboundCommand::new("stop", RESPONSE_URL))
            .await
            .unwrap_err();
        assert!(error.to_string().contains("404"));
        assert!(error.to_string().contains("Resource not found"));
    }
}
