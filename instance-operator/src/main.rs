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

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    routing::{get, post},
};
use lambda_http::run as lambda_run;
use rdkafka::{
    Message,
    config::ClientConfig,
    consumer::{CommitMode, Consumer, StreamConsumer},
};
use relay_common::{
    Command, InboundCommand, Instance, InstanceStatus, QueueBackend, RelayError, RelayResult,
    STARTING_MESSAGE, STOPPED_MESSAGE, STOPPING_MESSAGE, SlackReply, TAKING_TOO_LONG_MESSAGE,
    UNSUPPORTED_COMMAND_MESSAGE,
    gcp::{TokenSource, token_source_from_env},
    operation_failed_message,
    poll::{PollOutcome, PollPolicy, Sleeper, TokioSleeper, poll_until},
    required_env, started_message, status_message,
};
use serde::Deserialize;
use tower_http::trace::TraceLayer;
use tracing::{debug, error, info, warn};

const COMPUTE_API_BASE_URL: &str = "https://compute.googleapis.com";

#[derive(Debug, Clone)]
struct OperatorConfig {
    project_id: String,
    zone: String,
    instance_name: String,
    minecraft_port: String,
    topic_name: String,
    queue_backend: QueueBackend,
    kafka_bootstrap_servers: String,
    consumer_group_id: String,
    compute_api_base_url: String,
    poll: PollPolicy,
}

impl OperatorConfig {
    fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            project_id: required_env("PROJECT_ID")?,
            zone: required_env("ZONE")?,
            instance_name: required_env("INSTANCE_NAME")?,
            minecraft_port: required_env("MINECRAFT_PORT")?,
            topic_name: std::env::var("TOPIC_NAME")
                .ok()
                .unwrap_or_else(|| "minecraft-instance-ops".to_string()),
            queue_backend: QueueBackend::from_env()?,
            kafka_bootstrap_servers: std::env::var("KAFKA_BOOTSTRAP_SERVERS")
                .ok()
                .unwrap_or_else(|| "kafka:9092".to_string()),
            consumer_group_id: std::env::var("OPERATOR_CONSUMER_GROUP_ID")
                .ok()
                .unwrap_or_else(|| "instance-operator-v1".to_string()),
            compute_api_base_url: std::env::var("COMPUTE_API_BASE_URL")
                .ok()
                .unwrap_or_else(|| COMPUTE_API_BASE_URL.to_string()),
            poll: PollPolicy::from_env(),
        })
    }
}

#[async_trait]
trait ComputeClient: Send + Sync {
    async fn get(&self) -> RelayResult<Instance>;
    async fn start(&self) -> RelayResult<()>;
    async fn stop(&self) -> RelayResult<()>;
}

/// Compute Engine v1 REST calls against the one configured instance.
struct RestComputeClient {
    client: reqwest::Client,
    tokens: Arc<dyn TokenSource>,
    instance_url: String,
}

impl RestComputeClient {
    fn new(
        client: reqwest::Client,
        tokens: Arc<dyn TokenSource>,
        api_base_url: &str,
        project_id: &str,
        zone: &str,
        instance_name: &str,
    ) -> Self {
        Self {
            client,
            tokens,
            instance_url: format!(
                "{}/compute/v1/projects/{}/zones/{}/instances/{}",
                api_base_url.trim_end_matches('/'),
                project_id,
                zone,
                instance_name
            ),
        }
    }

    async fn bearer(&self) -> RelayResult<String> {
        self.tokens
            .access_token()
            .await
            .map_err(|error| RelayError::CloudApi(format!("failed to obtain access token: {error:#}")))
    }

    async fn check(response: reqwest::Response, action: &str) -> RelayResult<reqwest::Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let body = response.text().await.unwrap_or_default();
        Err(RelayError::CloudApi(format!(
            "instance {action} returned {status}: {body}"
        )))
    }

    async fn transition(&self, action: &str) -> RelayResult<()> {
        let response = self
            .client
            .post(format!("{}/{}", self.instance_url, action))
            .bearer_auth(self.bearer().await?)
            .send()
            .await
            .map_err(|error| RelayError::CloudApi(format!("instance {action} request failed: {error}")))?;
        Self::check(response, action).await?;
        Ok(())
    }
}

#[async_trait]
impl ComputeClient for RestComputeClient {
    async fn get(&self) -> RelayResult<Instance> {
        let response = self
            .client
            .get(&self.instance_url)
            .bearer_auth(self.bearer().await?)
            .send()
            .await
            .map_err(|error| RelayError::CloudApi(format!("instance get request failed: {error}")))?;
        Self::check(response, "get")
            .await?
            .json::<Instance>()
            .await
            .map_err(|error| RelayError::CloudApi(format!("invalid instance payload: {error}")))
    }

    async fn start(&self) -> RelayResult<()> {
        self.transition("start").await
    }

    async fn stop(&self) -> RelayResult<()> {
        self.transition("stop").await
    }
}

#[async_trait]
trait ChatNotifier: Send + Sync {
    async fn post(&self, response_url: &str, text: &str) -> RelayResult<()>;
}

#[derive(Clone)]
struct SlackResponseNotifier {
    client: reqwest::Client,
}

#[async_trait]
impl ChatNotifier for SlackResponseNotifier {
    async fn post(&self, response_url: &str, text: &str) -> RelayResult<()> {
        let response = self
            .client
            .post(response_url)
            .json(&SlackReply::in_channel(text))
            .send()
            .await
            .map_err(|error| RelayError::Notify(error.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            return Err(RelayError::Notify(format!("callback returned {status}")));
        }
        Ok(())
    }
}

/// Drives the configured instance for one queued command at a time.
#[derive(Clone)]
struct Operator {
    compute: Arc<dyn ComputeClient>,
    notifier: Arc<dyn ChatNotifier>,
    sleeper: Arc<dyn Sleeper>,
    poll: PollPolicy,
    minecraft_port: String,
}

impl Operator {
    /// Decodes a base64 push payload and runs it. Only decoding can fail:
    /// without a callback URL there is nobody to tell.
    async fn handle_message(&self, data: &str) -> RelayResult<()> {
        let command = InboundCommand::from_base64(data)?;
        self.handle_command(&command).await;
        Ok(())
    }

    async fn handle_command(&self, command: &InboundCommand) {
        info!(command = %command.text, "operating instance");
        if let Err(error) = self.dispatch(command).await {
            error!(command = %command.text, error = ?error, "instance operation failed");
            self.notify(&command.response_url, &operation_failed_message(&error))
                .await;
        }
    }

    async fn dispatch(&self, command: &InboundCommand) -> RelayResult<()> {
        let url = &command.response_url;
        match command.command() {
            Command::Status => self.report_status(url).await,
            Command::Start => self.start_instance(url).await,
            Command::Stop => self.stop_instance(url).await,
            Command::Other(text) => {
                debug!(command = %text, "unsupported command");
                self.notify(url, UNSUPPORTED_COMMAND_MESSAGE).await;
                Ok(())
            }
        }
    }

    async fn report_status(&self, url: &str) -> RelayResult<()> {
        let instance = self.compute.get().await?;
        info!(status = %instance.status, "reporting instance status");
        self.notify(url, &status_message(&instance, &self.minecraft_port))
            .await;
        Ok(())
    }

    async fn start_instance(&self, url: &str) -> RelayResult<()> {
        self.notify(url, STARTING_MESSAGE).await;
        self.compute.start().await?;

        if let Some(instance) = self.wait_for(url, InstanceStatus::Running).await? {
            self.notify(url, &started_message(&instance, &self.minecraft_port))
                .await;
        }
        Ok(())
    }

    async fn stop_instance(&self, url: &str) -> RelayResult<()> {
        self.notify(url, STOPPING_MESSAGE).await;
        self.compute.stop().await?;

        if self
            .wait_for(url, InstanceStatus::Terminated)
            .await?
            .is_some()
        {
            self.notify(url, STOPPED_MESSAGE).await;
        }
        Ok(())
    }

    /// `None` once the poll budget is spent; the user has been told to check manually.
    async fn wait_for(&self, url: &str, target: InstanceStatus) -> RelayResult<Option<Instance>> {
        let outcome = poll_until(
            self.poll,
            self.sleeper.as_ref(),
            || self.compute.get(),
            |instance: &Instance| instance.status == target,
        )
        .await?;

        match outcome {
            PollOutcome::Converged(instance) => {
                info!(status = %instance.status, "instance reached target state");
                Ok(Some(instance))
            }
            PollOutcome::Exhausted(instance) => {
                warn!(
                    status = %instance.status,
                    target = %target,
                    max_attempts = self.poll.max_attempts,
                    "instance did not reach target state in time"
                );
                self.notify(url, TAKING_TOO_LONG_MESSAGE).await;
                Ok(None)
            }
        }
    }

    async fn notify(&self, url: &str, text: &str) {
        if let Err(error) = self.notifier.post(url, text).await {
            warn!(error = %error, "failed to post message to callback URL");
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "instance_operator=debug,tower_http=info".to_string()),
        )
        .init();

    let config = OperatorConfig::from_env()?;
    let client = reqwest::Client::new();
    let operator = Operator {
        compute: Arc::new(RestComputeClient::new(
            client.clone(),
            token_source_from_env(client.clone()),
            &config.compute_api_base_url,
            &config.project_id,
            &config.zone,
            &config.instance_name,
        )),
        notifier: Arc::new(SlackResponseNotifier { client }),
        sleeper: Arc::new(TokioSleeper),
        poll: config.poll,
        minecraft_port: config.minecraft_port.clone(),
    };
    info!(
        instance = %config.instance_name,
        zone = %config.zone,
        interval_seconds = config.poll.interval.as_secs(),
        max_attempts = config.poll.max_attempts,
        "instance-operator configured"
    );

    let app = build_router(operator.clone());
    let lambda_mode = std::env::var("AWS_LAMBDA_RUNTIME_API").is_ok();

    if !lambda_mode && config.queue_backend == QueueBackend::Kafka {
        let consumer_config = config.clone();
        let consumer_operator = operator.clone();
        tokio::spawn(async move {
            if let Err(error) = run_command_consumer(consumer_config, consumer_operator).await {
                warn!(error = %error, "command consumer stopped");
            }
        });
    }

    if lambda_mode {
        if config.queue_backend == QueueBackend::Kafka {
            warn!(
                topic = %config.topic_name,
                "QUEUE_BACKEND=kafka is ignored in lambda mode; only push deliveries are handled"
            );
        }
        info!("AWS Lambda runtime detected; running instance-operator in lambda mode");
        lambda_run(app)
            .await
            .map_err(|e| anyhow::Error::msg(format!("lambda runtime error: {e}")))?;
        return Ok(());
    }

    let default_bind = format!(
        "0.0.0.0:{}",
        std::env::var("PORT").ok().unwrap_or_else(|| "8081".to_string())
    );
    let bind_addr = parse_bind_addr("OPERATOR_BIND", &default_bind)?;
    info!(%bind_addr, "instance-operator listening");
    let listener = tokio::net::TcpListener::bind(bind_addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn build_router(operator: Operator) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/pubsub/push", post(pubsub_push_handler))
        .with_state(operator)
        .layer(TraceLayer::new_for_http())
}

fn parse_bind_addr(var_name: &str, default: &str) -> anyhow::Result<SocketAddr> {
    let value = std::env::var(var_name)
        .ok()
        .unwrap_or_else(|| default.to_string());
    value.parse().context(format!("invalid {var_name}"))
}

async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({"ok": true, "service": "instance-operator"}))
}

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    message: PushMessage,
    #[serde(default)]
    subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PushMessage {
    #[serde(default)]
    data: Option<String>,
    #[serde(default)]
    message_id: Option<String>,
}

/// Every delivery is acknowledged once handled; failures are reported in chat,
/// never through redelivery. The subscription's ack deadline has to exceed
/// `PollPolicy::max_wait()` or the command is redelivered mid-poll.
async fn pubsub_push_handler(
    State(operator): State<Operator>,
    Json(envelope): Json<PushEnvelope>,
) -> StatusCode {
    let message_id = envelope.message.message_id.unwrap_or_default();
    let subscription = envelope.subscription.unwrap_or_default();
    debug!(%message_id, %subscription, "push delivery received");

    let Some(data) = envelope.message.data else {
        warn!(%message_id, "push delivery without data; dropping");
        return StatusCode::NO_CONTENT;
    };
    if let Err(error) = operator.handle_message(&data).await {
        warn!(%message_id, error = %error, "dropping undecodable queued message");
    }
    StatusCode::NO_CONTENT
}

async fn run_command_consumer(config: OperatorConfig, operator: Operator) -> anyhow::Result<()> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("bootstrap.servers", &config.kafka_bootstrap_servers)
        .set("group.id", &config.consumer_group_id)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        // A start/stop poll can hold a message well past the default interval.
        .set("max.poll.interval.ms", "600000")
        .create()
        .context("failed to create instance-operator consumer")?;

    consumer
        .subscribe(&[&config.topic_name])
        .context("failed to subscribe instance-operator command topic")?;
    info!(topic = %config.topic_name, "instance-operator subscribed to command topic");

    loop {
        let message = match consumer.recv().await {
            Ok(message) => message,
            Err(error) => {
                warn!(?error, "instance-operator kafka receive error");
                tokio::time::sleep(Duration::from_millis(300)).await;
                continue;
            }
        };

        match message.payload().map(InboundCommand::from_payload) {
            Some(Ok(command)) => operator.handle_command(&command).await,
            Some(Err(error)) => warn!(error = %error, "dropping undecodable queued message"),
            None => warn!("dropping queued message without payload"),
        }

        if let Err(error) = consumer.commit_message(&message, CommitMode::Async) {
            warn!(?error, "instance-operator failed to commit consumed command");
        }
    }
}
