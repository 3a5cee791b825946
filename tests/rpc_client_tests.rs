use futures::StreamExt;
use lease_agent::dispatcher::{RequestQueue, ResponseSink, RpcRequestQueue, RpcResponseSink};
use lease_agent::error::{AgentError, ErrorKind};
use lease_agent::rpc::{handler, RpcClient};
use lease_agent::signing::{Ed25519Signer, MessageSigner};
use lease_agent::testing::{socket_client, ScriptedChannel};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep, timeout};

const TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::test]
async fn call_resolves_with_matching_reply() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call("ain_ping", json!({ "a": 1 }), None).await });

    let frame = peer.next_frame().await;
    assert_eq!(frame["jsonrpc"], "2.0");
    assert_eq!(frame["method"], "ain_ping");
    assert_eq!(frame["params"], json!({ "a": 1 }));
    assert_eq!(frame["id"], 1);

    peer.reply(&frame["id"], json!("pong"));
    assert_eq!(call.await.unwrap().unwrap(), json!("pong"));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn ids_increase_per_call() {
    let (client, peer) = socket_client(TIMEOUT);
    let seen = peer.serve(|_, params| params.clone());

    assert_eq!(client.call("a", json!(1), None).await.unwrap(), json!(1));
    assert_eq!(client.call("b", json!(2), None).await.unwrap(), json!(2));

    let ids: Vec<Value> = seen.lock().unwrap().iter().map(|f| f["id"].clone()).collect();
    assert_eq!(ids, vec![json!(1), json!(2)]);
}

#[tokio::test]
async fn remote_error_becomes_call_error() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call("missing", Value::Null, None).await });
    let frame = peer.next_frame().await;
    peer.reply_error(&frame["id"], -32601, "Method not found");

    match call.await.unwrap() {
        Err(AgentError::CallError { code, message }) => {
            assert_eq!(code, -32601);
            assert_eq!(message, "Method not found");
        }
        other => panic!("expected call error, got {:?}", other),
    }
}

#[tokio::test(start_paused = true)]
async fn timeout_evicts_and_late_reply_is_dropped() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move {
        caller
            .call("slow", Value::Null, Some(Duration::from_secs(1)))
            .await
    });
    let frame = peer.next_frame().await;

    let err = call.await.unwrap().unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
    assert_eq!(client.pending_calls(), 0);

    peer.reply(&frame["id"], json!("too late"));
    sleep(Duration::from_millis(10)).await;

    let caller = Arc::clone(&client);
    let next = tokio::spawn(async move { caller.call("fast", Value::Null, None).await });
    let frame = peer.next_frame().await;
    peer.reply(&frame["id"], json!("on time"));
    assert_eq!(next.await.unwrap().unwrap(), json!("on time"));
}

#[tokio::test]
async fn notify_omits_id_and_does_not_wait() {
    let (client, mut peer) = socket_client(TIMEOUT);

    client.notify("requestServiceResponse", json!({ "x": 1 })).await.unwrap();
    let frame = peer.next_frame().await;
    assert_eq!(frame["method"], "requestServiceResponse");
    assert!(frame.get("id").is_none());
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn pushes_stop_after_unsubscribe() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let caller = Arc::clone(&client);
    let subscribing = tokio::spawn(async move {
        let on_push = handler(move |value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(value);
                Ok(())
            }
        });
        caller.subscribe("worker_listenRequest", on_push, json!({}), None).await
    });
    let frame = peer.next_frame().await;
    peer.reply(&frame["id"], json!({ "subscriptionId": "sub-1" }));
    assert_eq!(subscribing.await.unwrap().unwrap(), "sub-1");
    assert_eq!(client.subscription_count(), 1);

    peer.push("sub-1", json!({ "n": 1 }));
    assert_eq!(rx.recv().await, Some(json!({ "n": 1 })));

    let caller = Arc::clone(&client);
    let unsubscribing =
        tokio::spawn(async move { caller.unsubscribe("worker_unlistenRequest", "sub-1", None).await });
    let frame = peer.next_frame().await;
    assert_eq!(frame["params"], json!({ "subscriptionId": "sub-1" }));
    peer.reply(&frame["id"], json!(true));
    unsubscribing.await.unwrap().unwrap();
    assert_eq!(client.subscription_count(), 0);

    peer.push("sub-1", json!({ "n": 2 }));
    sleep(Duration::from_millis(50)).await;
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn push_right_behind_subscribe_reply_is_delivered() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let caller = Arc::clone(&client);
    let subscribing = tokio::spawn(async move {
        let on_push = handler(move |value| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(value);
                Ok(())
            }
        });
        caller.subscribe("worker_listenRequest", on_push, json!({}), None).await
    });
    let frame = peer.next_frame().await;
    peer.reply(&frame["id"], json!({ "subscriptionId": "sub-1" }));
    peer.push("sub-1", json!({ "n": 1 }));
    peer.push("sub-1", json!({ "n": 2 }));

    assert_eq!(subscribing.await.unwrap().unwrap(), "sub-1");
    let first = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    let second = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(first, Some(json!({ "n": 1 })));
    assert_eq!(second, Some(json!({ "n": 2 })));
}

#[tokio::test]
async fn handler_may_call_the_same_client() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);
    let (tx, mut rx) = mpsc::unbounded_channel();

    let caller = Arc::clone(&client);
    let subscribing = tokio::spawn(async move {
        let inner = Arc::clone(&caller);
        let on_push = handler(move |value: Value| {
            let client = Arc::clone(&inner);
            let tx = tx.clone();
            async move {
                let answer = client.call("lookup", value, None).await?;
                let _ = tx.send(answer);
                Ok(())
            }
        });
        caller.subscribe("listen", on_push, Value::Null, None).await
    });
    let frame = peer.next_frame().await;
    peer.reply(&frame["id"], json!("s1"));
    assert_eq!(subscribing.await.unwrap().unwrap(), "s1");

    peer.push("s1", json!({ "key": "a" }));
    let frame = peer.next_frame().await;
    assert_eq!(frame["method"], "lookup");
    assert_eq!(frame["params"], json!({ "key": "a" }));
    peer.reply(&frame["id"], json!("found"));

    let answer = timeout(Duration::from_secs(1), rx.recv()).await.unwrap();
    assert_eq!(answer, Some(json!("found")));
}

#[tokio::test]
async fn unsubscribe_unknown_id_fails_locally() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let err = client.unsubscribe("worker_unlistenRequest", "nope", None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::NotExists);
    assert!(peer.try_next_frame().is_none());
}

#[tokio::test]
async fn failing_handler_does_not_stop_the_reader() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);

    let caller = Arc::clone(&client);
    let subscribing = tokio::spawn(async move {
        let on_push = handler(|value: Value| async move {
            if value["panic"] == true {
                panic!("handler blew up");
            }
            Err(AgentError::Unexpected("handler refused".into()))
        });
        caller.subscribe("listen", on_push, Value::Null, None).await
    });
    let frame = peer.next_frame().await;
    peer.reply(&frame["id"], json!("s1"));
    assert_eq!(subscribing.await.unwrap().unwrap(), "s1");

    peer.push("s1", json!({ "panic": false }));
    peer.push("s1", json!({ "panic": true }));

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call("still_alive", Value::Null, None).await });
    let frame = peer.next_frame().await;
    peer.reply(&frame["id"], json!(1));
    assert_eq!(call.await.unwrap().unwrap(), json!(1));
}

#[tokio::test]
async fn pending_calls_fail_when_connection_drops() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call("hang", Value::Null, None).await });
    peer.next_frame().await;
    peer.hang_up();

    let err = call.await.unwrap().unwrap_err();
    assert!(matches!(err, AgentError::Transport(_)));
    assert_eq!(client.pending_calls(), 0);
}

#[tokio::test]
async fn close_fails_pending_and_later_sends() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let client = Arc::new(client);

    let caller = Arc::clone(&client);
    let call = tokio::spawn(async move { caller.call("hang", Value::Null, None).await });
    peer.next_frame().await;

    client.close().await;
    assert!(matches!(call.await.unwrap(), Err(AgentError::Transport(_))));
    assert!(client.notify("late", Value::Null).await.is_err());
}

#[tokio::test]
async fn request_channel_supports_calls_only() {
    let channel = ScriptedChannel::new();
    let client = RpcClient::with_channel(channel.clone(), TIMEOUT);
    assert!(!client.supports_push());

    channel.enqueue(Ok(json!({ "jsonrpc": "2.0", "id": 1, "result": 0 })));
    assert_eq!(client.call("ain_registerCluster", json!({}), None).await.unwrap(), json!(0));
    let sent = channel.requests();
    assert_eq!(sent[0]["method"], "ain_registerCluster");
    assert_eq!(sent[0]["jsonrpc"], "2.0");

    channel.enqueue(Ok(json!({ "id": 1, "error": { "code": 3, "message": "denied" } })));
    let err = client.call("ain_healthCheck", json!({}), None).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CallError);

    assert!(matches!(
        client.notify("x", Value::Null).await,
        Err(AgentError::Transport(_))
    ));
    let on_push = handler(|_| async { Ok(()) });
    assert!(client.subscribe("x", on_push, Value::Null, None).await.is_err());
}

#[tokio::test(start_paused = true)]
async fn request_channel_call_times_out() {
    let channel = ScriptedChannel::new();
    let client = RpcClient::with_channel(channel, TIMEOUT);
    let err = client
        .call("ain_healthCheck", json!({}), Some(Duration::from_secs(2)))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Timeout);
}

#[tokio::test]
async fn request_queue_streams_pushed_requests() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let queue = Arc::new(RpcRequestQueue::new(
        Arc::new(client),
        "0xkey@pool",
        "worker_listenRequest",
        "worker_unlistenRequest",
    ));

    let subscriber = Arc::clone(&queue);
    let subscribing = tokio::spawn(async move { subscriber.subscribe().await });
    let frame = peer.next_frame().await;
    assert_eq!(frame["method"], "worker_listenRequest");
    assert_eq!(frame["params"], json!({ "clusterKey": "0xkey@pool" }));
    peer.reply(&frame["id"], json!({ "subscriptionId": "s1" }));
    let mut stream = subscribing.await.unwrap().unwrap();

    peer.push(
        "s1",
        json!({
            "requestId": "r1",
            "type": "ADD",
            "containerId": "c1",
            "ownerAddress": "0xabc",
            "price": 1.0,
            "reserveAmount": 60.0
        }),
    );
    let request = stream.next().await.unwrap().unwrap();
    assert_eq!(request.request_id, "r1");
    assert_eq!(request.resource_id, "c1");

    peer.push("s1", json!({ "type": "ADD" }));
    let malformed = stream.next().await.unwrap().unwrap_err();
    assert_eq!(malformed.kind(), ErrorKind::InvalidParams);

    // Re-subscribing releases the previous subscription first.
    let subscriber = Arc::clone(&queue);
    let resubscribing = tokio::spawn(async move { subscriber.subscribe().await });
    let frame = peer.next_frame().await;
    assert_eq!(frame["method"], "worker_unlistenRequest");
    assert_eq!(frame["params"], json!({ "subscriptionId": "s1" }));
    peer.reply(&frame["id"], json!(true));
    let frame = peer.next_frame().await;
    assert_eq!(frame["method"], "worker_listenRequest");
    peer.reply(&frame["id"], json!("s2"));
    assert!(resubscribing.await.unwrap().is_ok());
}

#[tokio::test]
async fn request_queue_keeps_backlog_sent_with_subscribe_reply() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let queue = RpcRequestQueue::new(
        Arc::new(client),
        "0xkey@pool",
        "worker_listenRequest",
        "worker_unlistenRequest",
    );

    let subscribing = tokio::spawn(async move { queue.subscribe().await });
    let frame = peer.next_frame().await;
    peer.reply(&frame["id"], json!("s1"));
    peer.push(
        "s1",
        json!({
            "requestId": "backlog-1",
            "type": "TERMINATE",
            "containerId": "c9",
            "ownerAddress": "0xabc"
        }),
    );

    let mut stream = subscribing.await.unwrap().unwrap();
    let request = timeout(Duration::from_secs(1), stream.next())
        .await
        .unwrap()
        .unwrap()
        .unwrap();
    assert_eq!(request.request_id, "backlog-1");
    assert_eq!(request.resource_id, "c9");
}

#[tokio::test]
async fn response_sink_notifies_over_socket() {
    let (client, mut peer) = socket_client(TIMEOUT);
    let sink = RpcResponseSink::new(Arc::new(client), "requestServiceResponse", "expireContainer");
    let signer = Ed25519Signer::generate();

    let envelope = signer.sign(json!({ "requestId": "r1", "success": 0 })).unwrap();
    sink.send_outcome(envelope.clone()).await.unwrap();
    let frame = peer.next_frame().await;
    assert_eq!(frame["method"], "requestServiceResponse");
    assert!(frame.get("id").is_none());
    assert_eq!(frame["params"]["payload"], envelope.payload);
    assert_eq!(frame["params"]["signature"], envelope.signature);

    let expiry = signer.sign(json!({ "address": "0xabc", "containerId": "c1" })).unwrap();
    sink.send_expiry(expiry).await.unwrap();
    assert_eq!(peer.next_frame().await["method"], "expireContainer");
}

#[tokio::test]
async fn response_sink_posts_over_request_channel() {
    let channel = ScriptedChannel::new();
    let client = RpcClient::with_channel(channel.clone(), TIMEOUT);
    let sink = RpcResponseSink::new(Arc::new(client), "requestServiceResponse", "expireContainer");
    let signer = Ed25519Signer::generate();

    channel.enqueue(Ok(json!({ "id": 1, "result": true })));
    let envelope = signer.sign(json!({ "requestId": "r1", "success": 0 })).unwrap();
    sink.send_outcome(envelope).await.unwrap();
    assert_eq!(channel.requests()[0]["method"], "requestServiceResponse");
}
