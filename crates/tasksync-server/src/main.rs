//! tasksync server binary.
//!
//! Assembles the whole pipeline: database, bus, scheduler, consumer groups,
//! fan-out hub, and the HTTP/WebSocket surface. Identity on the internal
//! endpoints is trusted; authentication belongs to the outer layer that
//! proxies loopback traffic here.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{header, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{delete, get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use tasksync_bus::{Bus, PublishAck, Publisher, SubscriberConfig};
use tasksync_consumers::{
    AuditSink, HttpNotifier, NotificationSender, RecurrenceGenerator, ReminderDispatcher,
    SyncMirror, AUDIT_GROUP, MIRROR_GROUP, RECURRENCE_GROUP, REMINDER_DISPATCH_GROUP,
};
use tasksync_core::{
    defaults, Envelope, Error, EventType, ReminderPayload, Result, ScheduledJob,
    ScheduledJobRepository, TOPIC_REMINDERS, TOPIC_TASK_EVENTS, TOPIC_TASK_UPDATES,
};
use tasksync_db::Database;
use tasksync_hub::{start_sweeper, ConnectionRegistry, FanoutHub, FANOUT_GROUP};
use tasksync_scheduler::{FireHandler, Scheduler, SchedulerConfig};

#[derive(Clone)]
struct AppState {
    db: Arc<Database>,
    publisher: Publisher,
    registry: Arc<ConnectionRegistry>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing with configurable output
    //
    // Environment variables:
    //   LOG_FORMAT  - "json" or "text" (default: "text")
    //   RUST_LOG    - standard env filter (default: "tasksync=debug,tower_http=debug")
    let log_format = std::env::var("LOG_FORMAT").unwrap_or_else(|_| "text".to_string());
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "tasksync=debug,tower_http=debug".into());
    if log_format == "json" {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }

    let database_url = std::env::var("DATABASE_URL")
        .map_err(|_| anyhow::anyhow!("DATABASE_URL must be set"))?;
    let port = std::env::var("PORT")
        .ok()
        .and_then(|v| v.parse::<u16>().ok())
        .unwrap_or(defaults::SERVER_PORT);

    let db = Arc::new(Database::connect(&database_url).await?);
    db.migrate().await?;
    info!(subsystem = "server", "Database ready");

    // Bus over the durable stores.
    let bus = Bus::new(
        Arc::new(db.events.clone()),
        Arc::new(db.offsets.clone()),
        Arc::new(db.dead_letters.clone()),
    );
    let publisher = bus.publisher();
    let _flusher = publisher.start();

    // Consumer groups.
    let _recurrence = bus.subscribe(
        TOPIC_TASK_EVENTS,
        RECURRENCE_GROUP,
        Arc::new(RecurrenceGenerator::new(
            Arc::new(db.occurrences.clone()),
            bus.publisher(),
        )),
        SubscriberConfig::default(),
    );
    let _mirror = bus.subscribe(
        TOPIC_TASK_EVENTS,
        MIRROR_GROUP,
        Arc::new(SyncMirror::new(bus.publisher())),
        SubscriberConfig::default(),
    );
    let audit = Arc::new(AuditSink::new(Arc::new(db.audit.clone())));
    let _audit_tasks = bus.subscribe(
        TOPIC_TASK_EVENTS,
        AUDIT_GROUP,
        audit.clone(),
        SubscriberConfig::default(),
    );
    let _audit_reminders = bus.subscribe(
        TOPIC_REMINDERS,
        AUDIT_GROUP,
        audit,
        SubscriberConfig::default(),
    );

    let notifier: Arc<dyn NotificationSender> = match HttpNotifier::from_env()? {
        Some(http) => Arc::new(http),
        None => {
            warn!(
                subsystem = "server",
                "NOTIFIER_URL not set, reminder notifications are log-only"
            );
            Arc::new(LogNotifier)
        }
    };
    let _dispatch = bus.subscribe(
        TOPIC_REMINDERS,
        REMINDER_DISPATCH_GROUP,
        Arc::new(ReminderDispatcher::new(
            Arc::new(db.jobs.clone()),
            notifier,
            bus.publisher(),
        )),
        SubscriberConfig::default(),
    );

    // Fan-out hub.
    let registry = Arc::new(ConnectionRegistry::new());
    let _fanout = bus.subscribe(
        TOPIC_TASK_UPDATES,
        FANOUT_GROUP,
        Arc::new(FanoutHub::new(registry.clone())),
        SubscriberConfig::default(),
    );
    let _sweeper = start_sweeper(registry.clone());

    // Scheduler fires through the bus.
    let _scheduler = Scheduler::new(
        Arc::new(db.jobs.clone()),
        Arc::new(BusFireHandler {
            publisher: publisher.clone(),
        }),
        SchedulerConfig::from_env(),
    )
    .start();

    let state = AppState {
        db,
        publisher,
        registry,
    };

    let app = Router::new()
        .route("/health", get(health))
        .route("/api/v1/ws", get(ws_handler))
        .route("/api/v1/internal/task-events", post(ingest_event))
        .route("/api/v1/internal/schedule", post(schedule_job))
        .route("/api/v1/internal/schedule/:job_id", delete(cancel_job))
        .route("/api/v1/dead-letters", get(list_dead_letters))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(
            // Loopback-only service; the outer application layer owns auth.
            tower_http::cors::CorsLayer::new()
                .allow_origin(tower_http::cors::Any)
                .allow_methods([Method::GET, Method::POST, Method::DELETE])
                .allow_headers([header::CONTENT_TYPE]),
        )
        .with_state(state);

    let addr = format!("0.0.0.0:{port}");
    info!(subsystem = "server", addr = %addr, "tasksync server listening");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

/// Fallback notifier when no endpoint is configured.
struct LogNotifier;

#[async_trait::async_trait]
impl NotificationSender for LogNotifier {
    async fn send(&self, user_id: Uuid, reminder: &ReminderPayload) -> Result<()> {
        info!(
            subsystem = "server",
            user_id = %user_id,
            job_id = %reminder.job_id,
            message = reminder.message.as_deref().unwrap_or(""),
            "Reminder due (log-only notifier)"
        );
        Ok(())
    }
}

/// Turns claimed scheduler jobs into `reminder.due` envelopes.
struct BusFireHandler {
    publisher: Publisher,
}

/// What the schedule endpoint stores in the job payload.
#[derive(Debug, Serialize, Deserialize)]
struct JobPayload {
    user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    task_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<String>,
}

impl BusFireHandler {
    fn envelope_for(job: &ScheduledJob, fire_failed: bool, error: Option<&str>) -> Result<Envelope> {
        let payload: JobPayload = serde_json::from_value(job.payload.clone())?;
        Ok(Envelope::new(
            EventType::ReminderDue,
            payload.task_id.unwrap_or_else(Uuid::nil),
            payload.user_id,
            json!({
                "job_id": job.job_id,
                "task_id": payload.task_id,
                "message": payload.message,
                "fire_at": job.fire_at,
                "fire_failed": fire_failed,
                "error": error,
            }),
        ))
    }
}

#[async_trait::async_trait]
impl FireHandler for BusFireHandler {
    async fn fire(&self, job: &ScheduledJob) -> Result<()> {
        let envelope = Self::envelope_for(job, false, None)?;
        self.publisher.publish(TOPIC_REMINDERS, envelope).await?;
        Ok(())
    }

    async fn fire_failed(&self, job: &ScheduledJob, error: &str) {
        // Terminal marker for the audit trail; the dispatcher skips it.
        match Self::envelope_for(job, true, Some(error)) {
            Ok(envelope) => {
                if let Err(e) = self.publisher.publish(TOPIC_REMINDERS, envelope).await {
                    error!(
                        subsystem = "scheduler",
                        job_id = %job.job_id,
                        error = %e,
                        "Failed to publish fire-failed marker"
                    );
                }
            }
            Err(e) => {
                error!(
                    subsystem = "scheduler",
                    job_id = %job.job_id,
                    error = %e,
                    "Fire-failed job has undecodable payload"
                );
            }
        }
    }
}

// ============================================================================
// Error mapping
// ============================================================================

struct ApiError(Error);

impl From<Error> for ApiError {
    fn from(e: Error) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            Error::NotFound(_) | Error::JobNotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidEnvelope(_) | Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!(subsystem = "server", error = %self.0, "Request failed");
        }
        (status, Json(json!({"error": self.0.to_string()}))).into_response()
    }
}

// ============================================================================
// Handlers
// ============================================================================

async fn health() -> impl IntoResponse {
    Json(json!({"status": "ok"}))
}

/// Loopback ingress for envelopes produced by the outer application layer.
///
/// Routes by event type: task lifecycle onto `task-events`, reminder events
/// onto `reminders`, sync notifications straight onto `task-updates`.
async fn ingest_event(
    State(state): State<AppState>,
    Json(envelope): Json<Envelope>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    let topic = match envelope.event_type {
        t if t.is_task_lifecycle() => TOPIC_TASK_EVENTS,
        EventType::SyncTaskChanged => TOPIC_TASK_UPDATES,
        _ => TOPIC_REMINDERS,
    };

    let ack = state.publisher.publish(topic, envelope).await?;
    let body = match ack {
        PublishAck::Stored(seq) => json!({"accepted": true, "seq": seq}),
        PublishAck::Duplicate => json!({"accepted": true, "duplicate": true}),
        PublishAck::Queued => json!({"accepted": true, "queued": true}),
    };
    Ok((StatusCode::ACCEPTED, Json(body)))
}

#[derive(Debug, Deserialize)]
struct ScheduleRequest {
    job_id: String,
    fire_at: DateTime<Utc>,
    user_id: Uuid,
    #[serde(default)]
    task_id: Option<Uuid>,
    #[serde(default)]
    message: Option<String>,
}

/// Register (or reschedule) a reminder job and announce it.
async fn schedule_job(
    State(state): State<AppState>,
    Json(req): Json<ScheduleRequest>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    if req.user_id.is_nil() {
        return Err(Error::InvalidInput("user_id must not be nil".to_string()).into());
    }
    if req.job_id.is_empty() {
        return Err(Error::InvalidInput("job_id must not be empty".to_string()).into());
    }

    let payload = serde_json::to_value(JobPayload {
        user_id: req.user_id,
        task_id: req.task_id,
        message: req.message.clone(),
    })
    .map_err(Error::from)?;

    let job = state
        .db
        .jobs
        .upsert(&req.job_id, req.fire_at, payload)
        .await?;

    let announce = Envelope::new(
        EventType::ReminderScheduled,
        req.task_id.unwrap_or_else(Uuid::nil),
        req.user_id,
        json!({
            "job_id": req.job_id,
            "task_id": req.task_id,
            "message": req.message,
            "fire_at": req.fire_at,
        }),
    );
    state.publisher.publish(TOPIC_REMINDERS, announce).await?;

    Ok((StatusCode::CREATED, Json(job)))
}

#[derive(Debug, Deserialize)]
struct CancelQuery {
    user_id: Uuid,
}

/// Cancel a pending reminder job.
///
/// Losing the race against the scheduler's claim returns `cancelled: false`;
/// the reminder fired (or is firing) and was not also cancelled.
async fn cancel_job(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
    Query(query): Query<CancelQuery>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    if state.db.jobs.get(&job_id).await?.is_none() {
        return Err(Error::JobNotFound(job_id).into());
    }

    let cancelled = state.db.jobs.cancel(&job_id).await?;
    if cancelled {
        let announce = Envelope::new(
            EventType::ReminderCancelled,
            Uuid::nil(),
            query.user_id,
            json!({"job_id": job_id}),
        );
        // Best effort; the job row is already cancelled.
        if let Err(e) = state.publisher.publish(TOPIC_REMINDERS, announce).await {
            warn!(
                subsystem = "server",
                job_id = %job_id,
                error = %e,
                "Failed to announce cancellation"
            );
        }
    }

    Ok(Json(json!({"job_id": job_id, "cancelled": cancelled})))
}

#[derive(Debug, Deserialize)]
struct DeadLetterQuery {
    #[serde(default)]
    limit: Option<i64>,
}

/// Operator surface: most recent dead letters.
async fn list_dead_letters(
    State(state): State<AppState>,
    Query(query): Query<DeadLetterQuery>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    use tasksync_core::DeadLetterRepository;

    let limit = query
        .limit
        .unwrap_or(defaults::DEAD_LETTER_PAGE_LIMIT)
        .clamp(1, 500);
    let letters = state.db.dead_letters.list_recent(limit).await?;
    Ok(Json(letters))
}

// ============================================================================
// WebSocket
// ============================================================================

#[derive(Debug, Deserialize)]
struct WsQuery {
    user_id: Uuid,
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> std::result::Result<impl IntoResponse, ApiError> {
    if query.user_id.is_nil() {
        return Err(Error::InvalidInput("user_id must not be nil".to_string()).into());
    }
    Ok(ws.on_upgrade(move |socket| handle_ws_connection(socket, state, query.user_id)))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, user_id: Uuid) {
    use futures::{SinkExt, StreamExt};

    let (connection_id, mut outbound) = state.registry.register(user_id).await;
    let (mut sender, mut receiver) = socket.split();

    // Forward hub payloads to the client, plus keepalive pings.
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(std::time::Duration::from_secs(
            defaults::WS_PING_INTERVAL_SECS,
        ));
        loop {
            tokio::select! {
                payload = outbound.recv() => {
                    match payload {
                        Some(json) => {
                            if sender.send(Message::Text(json)).await.is_err() {
                                break;
                            }
                        }
                        None => break, // deregistered (overflow or sweep)
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(vec![])).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    // Client frames are heartbeats only.
    let registry = state.registry.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(_) | Message::Pong(_) => {
                    registry.heartbeat(user_id, connection_id).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {}
        _ = recv_task => {}
    }
    state.registry.deregister(user_id, connection_id).await;
    info!(
        subsystem = "server",
        user_id = %user_id,
        connection_id = %connection_id,
        "WebSocket connection closed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    fn job_with_payload(payload: serde_json::Value) -> ScheduledJob {
        ScheduledJob {
            job_id: "reminder:7".to_string(),
            fire_at: Utc::now() + Duration::minutes(5),
            payload,
            status: tasksync_core::JobStatus::Firing,
            attempt_count: 1,
            fire_failed: false,
            last_error: None,
            dispatch_status: None,
            dispatched_at: None,
            created_at: Utc::now(),
            claimed_at: Some(Utc::now()),
            fired_at: None,
        }
    }

    #[test]
    fn test_fire_envelope_carries_job_identity() {
        let user_id = Uuid::new_v4();
        let task_id = Uuid::new_v4();
        let job = job_with_payload(json!({
            "user_id": user_id,
            "task_id": task_id,
            "message": "Stand-up",
        }));

        let envelope = BusFireHandler::envelope_for(&job, false, None).unwrap();
        assert_eq!(envelope.event_type, EventType::ReminderDue);
        assert_eq!(envelope.user_id, user_id);
        assert_eq!(envelope.subject_id, task_id);

        let reminder = envelope.reminder_payload().unwrap();
        assert_eq!(reminder.job_id, "reminder:7");
        assert!(!reminder.fire_failed);
        assert_eq!(reminder.message.as_deref(), Some("Stand-up"));
    }

    #[test]
    fn test_fire_failed_envelope_is_marked() {
        let job = job_with_payload(json!({"user_id": Uuid::new_v4()}));
        let envelope = BusFireHandler::envelope_for(&job, true, Some("boom")).unwrap();
        let reminder = envelope.reminder_payload().unwrap();
        assert!(reminder.fire_failed);
        assert_eq!(reminder.error.as_deref(), Some("boom"));
    }

    #[test]
    fn test_fire_envelope_rejects_payload_without_user() {
        let job = job_with_payload(json!({"message": "no user"}));
        assert!(BusFireHandler::envelope_for(&job, false, None).is_err());
    }
}
