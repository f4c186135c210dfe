use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::{web, App, HttpRequest, HttpResponse};
use chrono::Utc;

use done_light::activator;
use done_light::config::{Config, StorageType};
use done_light::model::{MessagePayload, PayloadHeaders, Status, FAILURE_CALLBACK_KEY};
use done_light::service::Service;

/// Scripted delivery target: responds with the scripted status for each hit
/// in order (then 200), recording everything it sees.
#[derive(Clone, Default)]
struct Target {
    inner: Arc<Mutex<TargetInner>>,
}

#[derive(Default)]
struct TargetInner {
    script: Vec<u16>,
    hits: Vec<Hit>,
}

#[derive(Clone)]
struct Hit {
    headers: HashMap<String, String>,
    body: Option<serde_json::Value>,
}

impl Target {
    fn scripted(script: &[u16]) -> Self {
        Self {
            inner: Arc::new(Mutex::new(TargetInner {
                script: script.to_vec(),
                hits: vec![],
            })),
        }
    }

    fn hits(&self) -> Vec<Hit> {
        self.inner.lock().unwrap().hits.clone()
    }
}

async fn record_hit(req: HttpRequest, body: web::Bytes, target: web::Data<Target>) -> HttpResponse {
    let mut inner = target.inner.lock().unwrap();

    let headers = req
        .headers()
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_owned(), v.to_owned()))
        })
        .collect();
    let body = serde_json::from_slice(&body).ok();
    inner.hits.push(Hit { headers, body });

    let status = inner
        .script
        .get(inner.hits.len() - 1)
        .copied()
        .unwrap_or(200);
    HttpResponse::build(StatusCode::from_u16(status).unwrap()).finish()
}

fn spawn_target(script: &[u16]) -> (actix_test::TestServer, Target) {
    let target = Target::scripted(script);
    let handle = target.clone();
    let srv = actix_test::start(move || {
        App::new()
            .app_data(web::Data::new(handle.clone()))
            .default_service(web::route().to(record_hit))
    });
    (srv, target)
}

fn fast_config(storage: StorageType) -> Config {
    Config {
        storage_type: Some(storage),
        retry_delay_secs: Some(0),
        queue_poll_ms: Some(20),
        ..Config::default()
    }
}

async fn running_service() -> Service {
    let svc = Service::connect_with(fast_config(StorageType::Kv))
        .await
        .unwrap();
    svc.spawn_workers();
    svc
}

fn payload(url: String, data: Option<serde_json::Value>) -> MessagePayload {
    MessagePayload {
        headers: PayloadHeaders::default(),
        url,
        data,
    }
}

async fn wait_for_status(
    svc: &Service,
    id: &str,
    status: Status,
    timeout: Duration,
) -> done_light::model::Message {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(message) = svc.get_message(id).await {
            if message.status == status {
                return message;
            }
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("message {id} did not reach {status} within {timeout:?}");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn immediate_delivery_reaches_sent() {
    let (srv, target) = spawn_target(&[200]);
    let svc = running_service().await;

    let (id, _) = svc
        .submit(
            payload(srv.url("/ok"), Some(serde_json::json!({ "x": 1 }))),
            Utc::now(),
        )
        .await
        .unwrap();

    let message = wait_for_status(&svc, &id, Status::Sent, Duration::from_secs(5)).await;
    assert!(message.delivered_at.is_some());
    assert_eq!(message.retried, 0);
    assert!(message.last_errors.is_empty());

    let hits = target.hits();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0].body, Some(serde_json::json!({ "x": 1 })));
    assert_eq!(hits[0].headers.get("done-message-id"), Some(&id));
    assert_eq!(
        hits[0].headers.get("done-status").map(String::as_str),
        Some("DELIVER")
    );
    assert_eq!(
        hits[0].headers.get("done-retried").map(String::as_str),
        Some("0")
    );
    assert_eq!(
        hits[0].headers.get("user-agent").map(String::as_str),
        Some("Done Light")
    );
}

#[tokio::test]
async fn delayed_message_waits_in_queued() {
    let (srv, target) = spawn_target(&[200]);
    let svc = running_service().await;

    let (id, _) = svc
        .submit(
            payload(srv.url("/ok"), None),
            Utc::now() + chrono::Duration::milliseconds(700),
        )
        .await
        .unwrap();

    wait_for_status(&svc, &id, Status::Queued, Duration::from_secs(5)).await;
    assert!(target.hits().is_empty(), "delivered before the delay elapsed");

    wait_for_status(&svc, &id, Status::Sent, Duration::from_secs(5)).await;
    assert_eq!(target.hits().len(), 1);
}

#[tokio::test]
async fn future_day_message_stays_created() {
    let (srv, target) = spawn_target(&[200]);
    let svc = running_service().await;

    let (id, _) = svc
        .submit(
            payload(srv.url("/ok"), None),
            Utc::now() + chrono::Duration::days(3),
        )
        .await
        .unwrap();

    let message = wait_for_status(&svc, &id, Status::Created, Duration::from_secs(5)).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    // today's sweep must not touch a message scheduled days out
    activator::sweep(svc.store(), svc.queue()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert_eq!(
        svc.get_message(&message.id).await.unwrap().status,
        Status::Created
    );
    assert!(target.hits().is_empty());
    assert_eq!(id, message.id);
}

#[tokio::test]
async fn failures_retry_then_succeed() {
    let (srv, target) = spawn_target(&[503, 503, 200]);
    let svc = running_service().await;

    let (id, _) = svc
        .submit(payload(srv.url("/flaky"), None), Utc::now())
        .await
        .unwrap();

    let message = wait_for_status(&svc, &id, Status::Sent, Duration::from_secs(10)).await;

    assert_eq!(target.hits().len(), 3);
    assert_eq!(message.retried, 2);
    assert_eq!(message.last_errors.len(), 2);
    for error in &message.last_errors {
        assert_eq!(error.status, Some(503));
        assert_eq!(error.message, "invalid response status");
        assert_eq!(error.url, srv.url("/flaky"));
    }
    assert!(message.delivered_at.is_some());
}

#[tokio::test]
async fn exhausted_retries_dead_letter_with_callback() {
    let (srv, target) = spawn_target(&[500, 500, 500, 500]);
    let (cb_srv, callback) = spawn_target(&[200]);
    let svc = running_service().await;

    let mut headers = PayloadHeaders::default();
    headers
        .command
        .insert(FAILURE_CALLBACK_KEY.to_owned(), cb_srv.url("/f"));

    let (id, _) = svc
        .submit(
            MessagePayload {
                headers,
                url: srv.url("/down"),
                data: Some(serde_json::json!({ "x": 1 })),
            },
            Utc::now(),
        )
        .await
        .unwrap();

    let message = wait_for_status(&svc, &id, Status::Dlq, Duration::from_secs(10)).await;

    assert_eq!(message.retried, 3);
    assert_eq!(message.last_errors.len(), 3);
    assert!(message.delivered_at.is_none());

    // initial attempt plus three retries
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while (target.hits().len() < 4 || callback.hits().is_empty())
        && tokio::time::Instant::now() < deadline
    {
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    assert_eq!(target.hits().len(), 4);

    let callback_hits = callback.hits();
    assert_eq!(callback_hits.len(), 1);
    assert_eq!(callback_hits[0].body, Some(serde_json::json!({ "x": 1 })));
}

#[tokio::test]
async fn counters_stay_consistent_through_the_pipeline() {
    let (srv, _target) = spawn_target(&[200, 200]);
    let svc = running_service().await;

    let (first, _) = svc
        .submit(payload(srv.url("/a"), None), Utc::now())
        .await
        .unwrap();
    let (second, _) = svc
        .submit(
            payload(srv.url("/b"), None),
            Utc::now() + chrono::Duration::days(2),
        )
        .await
        .unwrap();

    wait_for_status(&svc, &first, Status::Sent, Duration::from_secs(5)).await;
    wait_for_status(&svc, &second, Status::Created, Duration::from_secs(5)).await;

    let snapshot = svc.stats_snapshot().await.unwrap();
    assert_eq!(snapshot.total, 2);
    assert_eq!(snapshot.by_status.values().sum::<u64>(), 2);
    assert_eq!(snapshot.by_status.get(&Status::Sent), Some(&1));
    assert_eq!(snapshot.by_status.get(&Status::Created), Some(&1));
    assert!(snapshot.last_24h >= 2);
}

#[tokio::test]
async fn reprocessing_a_sent_update_changes_nothing() {
    let (srv, target) = spawn_target(&[200]);
    let svc = running_service().await;

    let (id, _) = svc
        .submit(payload(srv.url("/once"), None), Utc::now())
        .await
        .unwrap();
    let sent = wait_for_status(&svc, &id, Status::Sent, Duration::from_secs(5)).await;

    // replay the terminal update event, as an at-least-once queue may
    let replay = done_light::model::SystemEvent::store_update(&sent, &sent);
    svc.queue().enqueue(&replay, None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;

    let after = svc.get_message(&id).await.unwrap();
    assert_eq!(after, sent);
    assert_eq!(target.hits().len(), 1);
}

#[tokio::test]
async fn sqlite_backend_runs_the_same_pipeline() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("done-light.db");

    let (srv, target) = spawn_target(&[503, 200]);

    let config = Config {
        turso_db_url: Some(db_path.to_string_lossy().to_string()),
        ..fast_config(StorageType::Turso)
    };
    let svc = Service::connect_with(config).await.unwrap();
    svc.spawn_workers();

    let (id, _) = svc
        .submit(
            payload(srv.url("/sql"), Some(serde_json::json!({ "n": 7 }))),
            Utc::now(),
        )
        .await
        .unwrap();

    let message = wait_for_status(&svc, &id, Status::Sent, Duration::from_secs(10)).await;
    assert_eq!(message.retried, 1);
    assert_eq!(message.last_errors.len(), 1);
    assert_eq!(target.hits().len(), 2);

    let snapshot = svc.stats_snapshot().await.unwrap();
    assert_eq!(snapshot.total, 1);
    assert_eq!(snapshot.by_status.get(&Status::Sent), Some(&1));
}

#[tokio::test]
async fn sqlite_state_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("done-light.db");
    let url = db_path.to_string_lossy().to_string();

    let (srv, _target) = spawn_target(&[200]);

    {
        let config = Config {
            turso_db_url: Some(url.clone()),
            ..fast_config(StorageType::Turso)
        };
        let svc = Service::connect_with(config).await.unwrap();
        // no workers: the received event must wait on the durable queue
        svc.submit(payload(srv.url("/later"), None), Utc::now())
            .await
            .unwrap();
        svc.shutdown();
    }

    let config = Config {
        turso_db_url: Some(url),
        ..fast_config(StorageType::Turso)
    };
    let svc = Service::connect_with(config).await.unwrap();

    let dump = svc.raw(Some("queue_events")).await.unwrap();
    let rows = dump.as_array().expect("queue dump is an array");
    assert_eq!(rows.len(), 1, "the enqueued event survived the restart");
    assert_eq!(rows[0]["type"], serde_json::json!("MESSAGE_RECEIVED"));

    // a restarted consumer picks the event up and finishes the job
    svc.spawn_workers();
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let sent = svc.list_by_status(Status::Sent).await.unwrap();
        if !sent.is_empty() {
            break;
        }
        if tokio::time::Instant::now() >= deadline {
            panic!("restarted consumer never delivered the message");
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn audit_log_tracks_every_transition() {
    let (srv, _target) = spawn_target(&[200]);

    let config = Config {
        enable_logs: Some(true),
        ..fast_config(StorageType::Kv)
    };
    let svc = Service::connect_with(config).await.unwrap();
    svc.spawn_workers();

    let (id, _) = svc
        .submit(payload(srv.url("/logged"), None), Utc::now())
        .await
        .unwrap();
    wait_for_status(&svc, &id, Status::Sent, Duration::from_secs(5)).await;

    let history = svc.message_logs(&id).await.unwrap();
    // CREATE, then one UPDATE per transition: DELIVER, SENT
    assert_eq!(history.len(), 3);
    assert_eq!(history[0].kind, done_light::model::LogType::Create);
    assert_eq!(
        history[2].after_data.as_ref().unwrap()["status"],
        serde_json::json!("SENT")
    );
}
