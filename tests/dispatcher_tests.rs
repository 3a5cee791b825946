use lease_agent::config::LeaseConfig;
use lease_agent::dispatcher::{DispatchOutcome, EventDispatcher, RequestOutcome};
use lease_agent::lease::LeaseManager;
use lease_agent::signing::{self, Ed25519Signer, MessageSigner};
use lease_agent::testing::{
    control_request, ChannelRequestQueue, MockOrchestrator, RecordingSink,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const RESUBSCRIBE: Duration = Duration::from_secs(60);

struct Fixture {
    dispatcher: Arc<EventDispatcher>,
    manager: Arc<LeaseManager>,
    orchestrator: Arc<MockOrchestrator>,
    sink: Arc<RecordingSink>,
    owner_key: String,
}

fn fixture() -> Fixture {
    let orchestrator = MockOrchestrator::new();
    let manager = Arc::new(LeaseManager::new(orchestrator.clone(), &LeaseConfig::default()));
    let sink = RecordingSink::new();
    let signer = Arc::new(Ed25519Signer::generate());
    let owner_key = signer.address();
    let dispatcher = Arc::new(EventDispatcher::new(
        Arc::clone(&manager),
        sink.clone(),
        signer,
        RESUBSCRIBE,
    ));
    Fixture {
        dispatcher,
        manager,
        orchestrator,
        sink,
        owner_key,
    }
}

#[tokio::test(start_paused = true)]
async fn create_reports_signed_success() {
    let f = fixture();
    let request = control_request("r1", "ADD", "c1", Some(1.0), Some(3600.0));

    let outcome = f.dispatcher.dispatch(request).await;
    assert!(matches!(&outcome, DispatchOutcome::Completed(o) if o.is_success()));
    assert!(f.manager.lease("c1").await.is_some());

    let outcomes = f.sink.outcomes();
    assert_eq!(outcomes.len(), 1);
    let envelope = &outcomes[0];
    assert_eq!(
        envelope.payload,
        json!({ "ownerKey": f.owner_key, "requestId": "r1", "success": 0 })
    );
    assert_eq!(envelope.address, f.owner_key);
    assert!(signing::verify(envelope).is_ok());
}

#[tokio::test(start_paused = true)]
async fn duplicate_in_flight_request_is_discarded() {
    let f = fixture();
    f.orchestrator.set_provision_delay(Duration::from_secs(3));
    let request = control_request("r1", "CREATE", "c1", Some(1.0), Some(60.0));

    let (first, second) = tokio::join!(
        f.dispatcher.dispatch(request.clone()),
        f.dispatcher.dispatch(request.clone()),
    );
    let discarded = [&first, &second]
        .iter()
        .filter(|o| matches!(o, DispatchOutcome::Discarded))
        .count();
    assert_eq!(discarded, 1);
    assert_eq!(f.orchestrator.provision_calls(), 1);
    assert_eq!(f.sink.outcomes().len(), 1);
    assert_eq!(f.dispatcher.in_flight(), 0);

    // Redelivery after the first attempt resolved is processed again.
    let again = f.dispatcher.dispatch(request).await;
    match again {
        DispatchOutcome::Completed(outcome) => assert_eq!(outcome.code(), 550),
        DispatchOutcome::Discarded => panic!("resolved request id must be reusable"),
    }
}

#[tokio::test(start_paused = true)]
async fn unknown_type_is_invalid_params() {
    let f = fixture();
    let outcome = f
        .dispatcher
        .dispatch(control_request("r1", "RESTART", "c1", Some(1.0), Some(60.0)))
        .await;

    match outcome {
        DispatchOutcome::Completed(RequestOutcome::Failure {
            err_code,
            err_message,
            ..
        }) => {
            assert_eq!(err_code, 530);
            assert_eq!(err_message, "invalid parameter");
        }
        other => panic!("unexpected outcome {:?}", other),
    }
    assert_eq!(f.orchestrator.provision_calls(), 0);
    assert_eq!(f.manager.lease_count().await, 0);
}

#[tokio::test(start_paused = true)]
async fn missing_payment_is_invalid_params() {
    let f = fixture();
    let outcome = f
        .dispatcher
        .dispatch(control_request("r1", "ADD", "c1", None, Some(60.0)))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Completed(o) if o.code() == 530));
    assert_eq!(f.orchestrator.provision_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn manager_errors_become_coded_outcomes() {
    let f = fixture();

    let terminate = f
        .dispatcher
        .dispatch(control_request("r1", "TERMINATE", "ghost", None, None))
        .await;
    assert!(matches!(terminate, DispatchOutcome::Completed(o) if o.code() == 510));

    let extend = f
        .dispatcher
        .dispatch(control_request("r2", "EXTEND", "ghost", Some(1.0), Some(10.0)))
        .await;
    assert!(matches!(extend, DispatchOutcome::Completed(o) if o.code() == 510));

    let payload = &f.sink.outcomes()[1].payload;
    assert_eq!(payload["errCode"], 510);
    assert_eq!(payload["errMessage"], "resource does not exist");
}

#[tokio::test(start_paused = true)]
async fn sink_failure_still_releases_request_id() {
    let f = fixture();
    f.sink.fail_deliveries(true);

    let outcome = f
        .dispatcher
        .dispatch(control_request("r1", "ADD", "c1", Some(1.0), Some(60.0)))
        .await;
    assert!(matches!(outcome, DispatchOutcome::Completed(o) if o.is_success()));
    assert_eq!(f.dispatcher.in_flight(), 0);
    assert_eq!(f.sink.outcomes().len(), 1);
    assert!(f.manager.lease("c1").await.is_some());
}

#[tokio::test(start_paused = true)]
async fn start_fails_when_queue_is_unreachable() {
    let f = fixture();
    let queue = ChannelRequestQueue::new();
    queue.fail_subscribe(true);

    assert!(f.dispatcher.clone().start(queue.clone()).await.is_err());
    assert_eq!(queue.subscription_count(), 0);
}

#[tokio::test(start_paused = true)]
async fn running_dispatcher_processes_queue() {
    let f = fixture();
    let queue = ChannelRequestQueue::new();
    let handle = f.dispatcher.clone().start(queue.clone()).await.unwrap();

    assert!(queue.push(control_request("r1", "ADD", "c1", Some(1.0), Some(600.0))));
    assert!(queue.push(control_request("r2", "EXTEND", "c1", Some(1.0), Some(600.0))));
    sleep(Duration::from_millis(10)).await;

    assert!(f.manager.lease("c1").await.is_some());
    assert_eq!(f.sink.outcomes().len(), 2);

    handle.stop().await;
    assert!(queue.is_closed());
}

#[tokio::test(start_paused = true)]
async fn subscription_is_refreshed_periodically() {
    let f = fixture();
    let queue = ChannelRequestQueue::new();
    let handle = f.dispatcher.clone().start(queue.clone()).await.unwrap();
    assert_eq!(queue.subscription_count(), 1);

    sleep(RESUBSCRIBE + Duration::from_secs(1)).await;
    assert_eq!(queue.subscription_count(), 2);

    sleep(RESUBSCRIBE).await;
    assert_eq!(queue.subscription_count(), 3);

    assert!(queue.push(control_request("r1", "ADD", "c1", Some(1.0), Some(6000.0))));
    sleep(Duration::from_millis(10)).await;
    assert!(f.manager.lease("c1").await.is_some());

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn dropped_stream_recovers_on_next_refresh() {
    let f = fixture();
    let queue = ChannelRequestQueue::new();
    let handle = f.dispatcher.clone().start(queue.clone()).await.unwrap();

    queue.disconnect();
    assert!(!queue.push(control_request("r1", "ADD", "c1", Some(1.0), Some(6000.0))));

    sleep(RESUBSCRIBE + Duration::from_secs(1)).await;
    assert!(queue.push(control_request("r1", "ADD", "c1", Some(1.0), Some(6000.0))));
    sleep(Duration::from_millis(10)).await;
    assert!(f.manager.lease("c1").await.is_some());

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn failed_refresh_keeps_current_stream() {
    let f = fixture();
    let queue = ChannelRequestQueue::new();
    let handle = f.dispatcher.clone().start(queue.clone()).await.unwrap();

    queue.fail_subscribe(true);
    sleep(RESUBSCRIBE + Duration::from_secs(1)).await;
    assert_eq!(queue.subscription_count(), 1);

    assert!(queue.push(control_request("r1", "ADD", "c1", Some(1.0), Some(6000.0))));
    sleep(Duration::from_millis(10)).await;
    assert!(f.manager.lease("c1").await.is_some());

    handle.stop().await;
}

#[tokio::test(start_paused = true)]
async fn expiry_is_reported_to_sink() {
    let f = fixture();
    let queue = ChannelRequestQueue::new();
    let handle = f.dispatcher.clone().start(queue.clone()).await.unwrap();

    assert!(queue.push(control_request("r1", "ADD", "c1", Some(2.0), Some(20.0))));
    sleep(Duration::from_secs(11)).await;

    assert!(f.manager.lease("c1").await.is_none());
    assert_eq!(f.orchestrator.deprovision_count("c1"), 1);
    let expiries = f.sink.expiries();
    assert_eq!(expiries.len(), 1);
    assert_eq!(
        expiries[0].payload,
        json!({ "address": "0xabc", "containerId": "c1" })
    );
    assert!(signing::verify(&expiries[0]).is_ok());

    handle.stop().await;
}
