//! End-to-end tests for `JobRunner` against the in-memory broker, with
//! workers answering from their own sessions.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use hpc_broker::{BrokerConfig, Connector, Credentials, InMemoryBroker, Session};
use hpc_core::envelope::{assemble_response, parse_request};
use hpc_core::{
    MessageProperties, NamedBlobs, OutboundMessage, SettingValue, Settings, REPLY_QUEUE,
    WORK_QUEUE,
};
use hpc_dispatch::{serve_next, JobError, JobRunner, PollConfig, Served};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

fn broker() -> InMemoryBroker {
    InMemoryBroker::new("mq.local", Credentials::new("rodan", "secret"))
}

fn fast_poll() -> PollConfig {
    PollConfig {
        initial_interval: Duration::from_millis(100),
        max_interval: Duration::from_secs(1),
        multiplier: 2.0,
    }
}

fn runner(broker: &InMemoryBroker) -> JobRunner {
    JobRunner::new(Arc::new(broker.clone()), broker.config()).with_poll_config(fast_poll())
}

fn blobs(pairs: &[(&str, &[u8])]) -> NamedBlobs {
    pairs
        .iter()
        .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
        .collect()
}

async fn worker_session(broker: &InMemoryBroker) -> Box<dyn Session> {
    let mut session = broker.open(&broker.config()).await.unwrap();
    session.declare_queue(WORK_QUEUE).await.unwrap();
    session.declare_queue(REPLY_QUEUE).await.unwrap();
    session
}

/// Answer `jobs` requests, renaming every input `X` to an output `X Model`.
fn spawn_echo_worker(broker: InMemoryBroker, jobs: usize) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut session = worker_session(&broker).await;
        let mut replied = 0;
        while replied < jobs {
            let served = serve_next(session.as_mut(), |request| async move {
                request
                    .inputs
                    .into_iter()
                    .map(|(name, bytes)| (format!("{name} Model"), bytes))
                    .collect()
            })
            .await
            .unwrap();
            match served {
                Served::Replied(_) => replied += 1,
                _ => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        session.close().await.unwrap();
    })
}

// ---------------------------------------------------------------------------
// Test: a full job round trip
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn run_job_returns_worker_outputs() {
    let broker = broker();
    let worker = spawn_echo_worker(broker.clone(), 1);

    let settings = Settings::from([("Number of epochs".to_string(), SettingValue::from(3i64))]);
    let outputs = runner(&broker)
        .run_job(&blobs(&[("Background", b"bg")]), &settings, &["Background Model"])
        .await
        .unwrap();
    worker.await.unwrap();

    assert_eq!(outputs, blobs(&[("Background Model", b"bg")]));
    assert_eq!(broker.ready_count(WORK_QUEUE), 0);
    assert_eq!(broker.ready_count(REPLY_QUEUE), 0);
    assert_eq!(broker.sessions_opened(), broker.sessions_closed());
}

// ---------------------------------------------------------------------------
// Test: concurrent jobs answered out of order each get their own outputs
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn concurrent_jobs_receive_their_own_responses() {
    let broker = broker();

    let worker_broker = broker.clone();
    let worker = tokio::spawn(async move {
        let mut session = worker_session(&worker_broker).await;
        let mut pending = Vec::new();
        while pending.len() < 2 {
            match session.try_receive(WORK_QUEUE).await.unwrap() {
                Some(delivery) => pending.push(delivery),
                None => tokio::time::sleep(Duration::from_millis(50)).await,
            }
        }
        // Answer the second request first.
        for delivery in pending.into_iter().rev() {
            let request = parse_request(&delivery.body).unwrap();
            let reply = OutboundMessage {
                body: assemble_response(&blobs(&[("Out", request.inputs["In"].as_slice())])),
                properties: MessageProperties {
                    correlation_id: delivery.properties.correlation_id.clone(),
                    reply_to: None,
                },
            };
            session.publish(REPLY_QUEUE, reply).await.unwrap();
            session.acknowledge(delivery.tag).await.unwrap();
        }
        session.close().await.unwrap();
    });

    let runner = runner(&broker);
    let first_inputs = blobs(&[("In", b"first")]);
    let second_inputs = blobs(&[("In", b"second")]);
    let settings = Settings::new();
    let (first, second) = tokio::join!(
        runner.run_job(&first_inputs, &settings, &["Out"]),
        runner.run_job(&second_inputs, &settings, &["Out"]),
    );
    worker.await.unwrap();

    assert_eq!(first.unwrap()["Out"], b"first");
    assert_eq!(second.unwrap()["Out"], b"second");
    assert_eq!(broker.acknowledged_count(), 4);
    assert_eq!(broker.ready_count(REPLY_QUEUE), 0);
}

// ---------------------------------------------------------------------------
// Test: connection failures surface before anything is declared
// ---------------------------------------------------------------------------

#[tokio::test]
async fn bad_credentials_are_a_connection_error() {
    let broker = broker();
    let config = BrokerConfig::new("mq.local", Credentials::new("rodan", "wrong"));
    let runner = JobRunner::new(Arc::new(broker.clone()), config);

    let result = runner.run_job(&NamedBlobs::new(), &Settings::new(), &[]).await;

    assert_matches!(result, Err(JobError::Connection(_)));
    assert!(broker.queue_names().is_empty());
    assert_eq!(broker.sessions_opened(), 0);
}

// ---------------------------------------------------------------------------
// Test: timeout closes the session and leaves the request queued
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn timeout_closes_the_session() {
    let broker = broker();
    let runner = runner(&broker).with_max_wait(Duration::from_secs(30));

    let result = runner
        .run_job(&blobs(&[("Image", b"png")]), &Settings::new(), &[])
        .await;

    assert_matches!(result, Err(JobError::Timeout { .. }));
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.sessions_closed(), 1);
    // Nobody picked the request up; it is still waiting for a worker.
    assert_eq!(broker.ready_count(WORK_QUEUE), 1);
}

// ---------------------------------------------------------------------------
// Test: shutdown cancels every pending job
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_pending_jobs() {
    let broker = broker();
    let runner = Arc::new(runner(&broker));

    let stopper = Arc::clone(&runner);
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(10)).await;
        stopper.shutdown();
    });

    let (inputs, settings) = (NamedBlobs::new(), Settings::new());
    let (a, b) = tokio::join!(
        runner.run_job(&inputs, &settings, &[]),
        runner.run_job(&inputs, &settings, &[]),
    );

    assert_matches!(a, Err(JobError::Cancelled(_)));
    assert_matches!(b, Err(JobError::Cancelled(_)));
    assert_eq!(broker.sessions_opened(), 2);
    assert_eq!(broker.sessions_closed(), 2);
}

// ---------------------------------------------------------------------------
// Test: a per-job token cancels only that job
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn per_job_token_cancels_only_its_job() {
    let broker = broker();
    let runner = runner(&broker).with_max_wait(Duration::from_secs(60));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_secs(5)).await;
        trigger.cancel();
    });

    let (inputs, settings) = (NamedBlobs::new(), Settings::new());
    let (cancelled, other) = tokio::join!(
        runner.run_job_until(&inputs, &settings, &[], cancel),
        runner.run_job(&inputs, &settings, &[]),
    );

    assert_matches!(cancelled, Err(JobError::Cancelled(_)));
    assert_matches!(other, Err(JobError::Timeout { .. }));
}

// ---------------------------------------------------------------------------
// Test: dropping a job mid-wait releases its session
// ---------------------------------------------------------------------------

#[tokio::test(start_paused = true)]
async fn dropped_job_future_releases_the_session() {
    let broker = broker();
    let runner = runner(&broker);

    let outcome = tokio::time::timeout(
        Duration::from_secs(5),
        runner.run_job(&NamedBlobs::new(), &Settings::new(), &[]),
    )
    .await;

    assert!(outcome.is_err());
    assert_eq!(broker.sessions_opened(), 1);
    assert_eq!(broker.sessions_closed(), 1);
    assert_eq!(broker.unacked_count(REPLY_QUEUE), 0);
}

// ---------------------------------------------------------------------------
// Test: a runner that was shut down publishes nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn run_after_shutdown_publishes_nothing() {
    let broker = broker();
    let runner = runner(&broker);
    runner.shutdown();

    let result = runner
        .run_job(&blobs(&[("Image", b"png")]), &Settings::new(), &[])
        .await;

    assert_matches!(result, Err(JobError::Cancelled(_)));
    assert_eq!(broker.ready_count(WORK_QUEUE), 0);
    assert_eq!(broker.sessions_opened(), 0);
}

#[tokio::test]
async fn already_cancelled_token_publishes_nothing() {
    let broker = broker();
    let runner = runner(&broker);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let result = runner
        .run_job_until(&blobs(&[("Image", b"png")]), &Settings::new(), &[], cancel)
        .await;

    assert_matches!(result, Err(JobError::Cancelled(_)));
    assert_eq!(broker.ready_count(WORK_QUEUE), 0);
    assert!(broker.queue_names().is_empty());
}
