//! Client and server exchanging requests over the in-process broker

use async_trait::async_trait;
use bytes::Bytes;
use codec::{decode_frame, CorrelationId, FrameVariant, Serializer};
use messaging::{
    QueueClient, QueueServer, ReplyContext, RequestBody, RequestHandler, RequestMessage,
    ResponseBody, ResponseMessage, ResponseSender, ServerEvent, ServerRequest, ServerResponse,
};
use network::{InMemoryBroker, ProducerCache, Result, TransportError};
use parking_lot::Mutex;
use queue_config::{
    ClientOptions, ClientRouteSet, ReceiverOptions, RouteDescriptor, SelectionContext,
    SenderOptions, ServerOptions, ServerRole, ServerRouteSet,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

const ENDPOINT: &str = "memory://bus";
const SERIALIZER: Serializer = Serializer::Json;

fn receiver() -> ReceiverOptions {
    ReceiverOptions {
        timeout_ms: 1_000,
        sleep_on_exception_ms: 50,
        monitor_interval_ms: 10,
        connect_retry_delay_ms: 10,
        drain_timeout_ms: 500,
        ..ReceiverOptions::default()
    }
}

fn sender() -> SenderOptions {
    SenderOptions {
        connect_retry_delay_ms: 10,
        connect_max_attempts: Some(3),
        ..SenderOptions::default()
    }
}

fn client_options(single_response_queue: bool) -> ClientOptions {
    ClientOptions {
        single_response_queue,
        sender: Some(sender()),
        receiver: Some(receiver()),
        routes: vec![ClientRouteSet {
            environment: None,
            machine_name: None,
            send: vec![RouteDescriptor::new(ENDPOINT, "requests")],
            receive: Some(RouteDescriptor::new(ENDPOINT, "replies")),
        }],
        ..ClientOptions::new("client")
    }
}

fn server_options(variant: FrameVariant, role: ServerRole, receive: &str) -> ServerOptions {
    ServerOptions {
        role,
        variant,
        sender: Some(sender()),
        receiver: Some(receiver()),
        routes: vec![ServerRouteSet {
            environment: None,
            machine_name: None,
            receive: vec![RouteDescriptor::new(ENDPOINT, receive)],
            send: vec![RouteDescriptor::new(ENDPOINT, "replies")],
        }],
        ..ServerOptions::new("echo")
    }
}

/// `shout` upper-cases a string body, `missing` answers with nothing,
/// `fail` errors; raw bodies are upper-cased as bytes
#[derive(Default)]
struct EchoHandler {
    requests: AtomicUsize,
    responses: Mutex<Vec<ServerResponse>>,
}

#[async_trait]
impl RequestHandler for EchoHandler {
    async fn on_request(&self, request: &ServerRequest) -> Result<Option<Bytes>> {
        self.requests.fetch_add(1, Ordering::SeqCst);
        match &request.body {
            RequestBody::Typed(message) => match message.header.method.as_deref() {
                Some("missing") => Ok(None),
                Some("fail") => Err(TransportError::remote("fail", "boom")),
                _ => {
                    let text: String = message.body_as(SERIALIZER)?;
                    Ok(Some(SERIALIZER.serialize(&text.to_uppercase())?))
                }
            },
            RequestBody::Raw(body) => Ok(Some(Bytes::from(body.to_ascii_uppercase()))),
        }
    }

    async fn on_response(&self, response: &ServerResponse) -> Result<()> {
        self.responses.lock().push(response.clone());
        Ok(())
    }
}

struct Fixture {
    broker: InMemoryBroker,
    handler: Arc<EchoHandler>,
    server: QueueServer,
}

async fn start_server(variant: FrameVariant) -> Fixture {
    let broker = InMemoryBroker::new();
    let handler = Arc::new(EchoHandler::default());
    let server = QueueServer::new(
        server_options(variant, ServerRole::Request, "requests"),
        Arc::new(broker.clone()),
        handler.clone(),
        SelectionContext::default(),
    )
    .unwrap();
    server.start_listeners().await.unwrap();
    assert!(server.wait_listening(Duration::from_secs(1)).await);
    Fixture {
        broker,
        handler,
        server,
    }
}

fn client(broker: &InMemoryBroker, options: ClientOptions) -> QueueClient {
    QueueClient::new(options, Arc::new(broker.clone()), SelectionContext::default()).unwrap()
}

#[test_log::test(tokio::test)]
async fn test_typed_request_round_trip() {
    let fixture = start_server(FrameVariant::Typed).await;
    let client = client(&fixture.broker, client_options(false));

    let reply: String = client.request(&"hello".to_string()).await.unwrap();

    assert_eq!(reply, "HELLO");
    assert_eq!(client.pending_count(), 0);
    assert_eq!(fixture.handler.requests.load(Ordering::SeqCst), 1);

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_reply_subscription_is_released_and_deleted() {
    let fixture = start_server(FrameVariant::Typed).await;
    let client = client(&fixture.broker, client_options(false));

    let request = RequestMessage::with_body(SERIALIZER, "x").unwrap();
    let id = client.send(&request).await.unwrap();
    let reply_name = format!("replies_{}", id);

    let response = client.receive(id).await.unwrap();
    assert_eq!(response.header.server_name, "echo");
    assert_eq!(response.header.client_name, "client");

    assert_eq!(fixture.broker.subscription_history(&reply_name), vec![1, 0]);
    assert!(fixture.broker.deleted_queues().contains(&reply_name));

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_concurrent_sends_get_distinct_reply_names() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, client_options(false));
    let request = RequestMessage::new(b"\"a\"".to_vec());

    let (first, second) = tokio::join!(client.send(&request), client.send(&request));
    let (first, second) = (first.unwrap(), second.unwrap());
    assert_ne!(first, second);

    let reply_names: Vec<(CorrelationId, String)> = broker
        .published_to("requests")
        .iter()
        .map(|bytes| {
            let frame = decode_frame(bytes).unwrap();
            let sent: RequestMessage = SERIALIZER.deserialize(&frame.payload).unwrap();
            assert_eq!(sent.header.client_name, "client");
            (frame.correlation_id, sent.header.reply_routes[0].name.clone())
        })
        .collect();

    assert_eq!(reply_names.len(), 2);
    assert_ne!(reply_names[0].1, reply_names[1].1);
    for (id, name) in &reply_names {
        assert_eq!(name, &format!("replies_{}", id));
    }

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_pre_assigned_reply_route_is_kept() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, client_options(false));
    let own = RouteDescriptor::new(ENDPOINT, "elsewhere");

    client
        .send(&RequestMessage::new(Vec::new()).with_reply_route(own.clone()))
        .await
        .unwrap();

    let frame = decode_frame(&broker.published_to("requests")[0]).unwrap();
    let sent: RequestMessage = SERIALIZER.deserialize(&frame.payload).unwrap();
    assert_eq!(sent.header.reply_routes, vec![own]);

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_empty_response_is_distinct_from_timeout() {
    let fixture = start_server(FrameVariant::Typed).await;
    let client = client(&fixture.broker, client_options(false));

    let request = RequestMessage::new(Vec::new()).with_method("missing");
    let id = client.send(&request).await.unwrap();

    let result = client.receive(id).await;
    assert!(matches!(result, Err(TransportError::EmptyBody { .. })));

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_handler_error_comes_back_as_remote_error() {
    let fixture = start_server(FrameVariant::Typed).await;
    let client = client(&fixture.broker, client_options(false));

    let request = RequestMessage::new(Vec::new()).with_method("fail");
    let id = client.send(&request).await.unwrap();
    let response = client.receive(id).await.unwrap();

    assert!(response.is_error());
    assert!(response.header.error.unwrap().contains("boom"));

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_receive_times_out_and_cleans_up() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, client_options(false));

    let id = client.send(&RequestMessage::new(Vec::new())).await.unwrap();
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let result = client
        .receive_raw_with(id, timeout, &CancellationToken::new())
        .await;

    assert!(matches!(result, Err(TransportError::Timeout { .. })));
    assert!(started.elapsed() >= timeout);
    assert_eq!(client.pending_count(), 0);
    assert_eq!(broker.subscription_count(&format!("replies_{}", id)), 0);

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_cancelled_receive_is_not_a_timeout() {
    let broker = InMemoryBroker::new();
    let client = client(&broker, client_options(false));
    let id = client.send(&RequestMessage::new(Vec::new())).await.unwrap();

    let cancel = CancellationToken::new();
    let trigger = {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            cancel.cancel();
        })
    };

    let result = client
        .receive_raw_with(id, Duration::from_secs(5), &cancel)
        .await;
    trigger.await.unwrap();

    assert!(matches!(result, Err(TransportError::Cancelled { .. })));
    assert_eq!(client.pending_count(), 0);

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_single_response_queue_demultiplexes() {
    let fixture = start_server(FrameVariant::Typed).await;
    let client = client(&fixture.broker, client_options(true));

    let (a, b) = tokio::join!(
        client.request::<_, String>("first"),
        client.request::<_, String>("second"),
    );

    assert_eq!(a.unwrap(), "FIRST");
    assert_eq!(b.unwrap(), "SECOND");
    // One shared subscription, never per-request ones
    assert_eq!(fixture.broker.subscription_count("replies"), 1);
    assert!(fixture.broker.deleted_queues().is_empty());

    client.close().await;
    assert_eq!(fixture.broker.subscription_count("replies"), 0);
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_raw_request_replies_to_hinted_name() {
    let fixture = start_server(FrameVariant::Raw).await;
    let client = client(&fixture.broker, client_options(false));

    let id = client.send_raw(Bytes::from_static(b"abc")).await.unwrap();
    let reply = client.receive_raw(id).await.unwrap();

    assert_eq!(reply, Bytes::from_static(b"ABC"));
    assert_eq!(
        fixture.broker.published_to(&format!("replies_{}", id)).len(),
        1
    );

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_raw_request_without_reply_name_is_one_way() {
    let fixture = start_server(FrameVariant::Raw).await;
    let mut options = client_options(false);
    options.routes[0].receive = None;
    let client = client(&fixture.broker, options);

    client.send_raw(Bytes::from_static(b"fire")).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.handler.requests.load(Ordering::SeqCst), 1);
    let published: Vec<String> = fixture
        .broker
        .publish_log()
        .into_iter()
        .map(|record| record.name)
        .collect();
    assert_eq!(published, vec!["requests".to_string()]);

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_fire_and_forget_typed_request_gets_no_reply() {
    let fixture = start_server(FrameVariant::Typed).await;
    let client = client(&fixture.broker, client_options(false));

    let request = RequestMessage::with_body(SERIALIZER, "quiet")
        .unwrap()
        .fire_and_forget();
    client.send(&request).await.unwrap();

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(fixture.handler.requests.load(Ordering::SeqCst), 1);
    assert_eq!(client.pending_count(), 0);
    assert_eq!(fixture.broker.publish_log().len(), 1);

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_server_emits_lifecycle_events_in_order() {
    let fixture = start_server(FrameVariant::Typed).await;
    let mut events = fixture.server.events();
    let client = client(&fixture.broker, client_options(false));

    let _: String = client.request("evt").await.unwrap();

    let mut kinds = Vec::new();
    for _ in 0..3 {
        let event = tokio::time::timeout(Duration::from_secs(1), events.recv())
            .await
            .unwrap()
            .unwrap();
        kinds.push(match event {
            ServerEvent::RequestReceived { .. } => "request",
            ServerEvent::BeforeSendResponse { .. } => "before_send",
            ServerEvent::ResponseSent { bytes, error, .. } => {
                assert!(bytes.is_some());
                assert!(error.is_none());
                "sent"
            }
            ServerEvent::ResponseReceived { .. } => "response",
        });
    }
    assert_eq!(kinds, vec!["request", "before_send", "sent"]);

    client.close().await;
    fixture.server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_partial_fanout_attempts_every_destination() {
    let broker = InMemoryBroker::new();
    broker.fail_publish_to("second");
    let sender = ResponseSender::new("echo", ProducerCache::new(Arc::new(broker.clone()), sender()));

    let id = CorrelationId::new();
    let context = ReplyContext {
        destinations: ["first", "second", "third"]
            .iter()
            .map(|name| RouteDescriptor::new(ENDPOINT, *name))
            .collect(),
        ..ReplyContext::none(id)
    };

    let result = sender.send(id, b"payload", &context).await;

    match result {
        Err(TransportError::FanoutFailed {
            attempted, failed, ..
        }) => {
            assert_eq!(attempted, 3);
            assert_eq!(failed, 1);
        }
        other => panic!("expected a fan-out failure, got {:?}", other),
    }
    let attempts: Vec<(String, bool)> = broker
        .publish_log()
        .into_iter()
        .map(|record| (record.name, record.accepted))
        .collect();
    assert_eq!(
        attempts,
        vec![
            ("first".to_string(), true),
            ("second".to_string(), false),
            ("third".to_string(), true),
        ]
    );

    sender.close().await;
}

#[test_log::test(tokio::test)]
async fn test_no_destinations_sends_nothing() {
    let broker = InMemoryBroker::new();
    let sender = ResponseSender::new("echo", ProducerCache::new(Arc::new(broker.clone()), sender()));

    let id = CorrelationId::new();
    let result = sender.send(id, b"payload", &ReplyContext::none(id)).await;

    assert_eq!(result.unwrap(), None);
    assert!(broker.publish_log().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_response_role_server_sees_responses() {
    let broker = InMemoryBroker::new();
    let handler = Arc::new(EchoHandler::default());
    let mut options = server_options(FrameVariant::Typed, ServerRole::Response, "replies");
    options.name = "client".to_string();
    options.sender = None;
    let server = QueueServer::new(
        options,
        Arc::new(broker.clone()),
        handler.clone(),
        SelectionContext::default(),
    )
    .unwrap();
    server.start_listeners().await.unwrap();
    assert!(server.wait_listening(Duration::from_secs(1)).await);

    let id = CorrelationId::new();
    let response = ResponseMessage::new("pricing", "client", b"7".to_vec());
    let envelope = SERIALIZER.serialize(&response).unwrap();
    broker.inject(ENDPOINT, "replies", codec::encode_frame(id, &envelope));

    let deadline = Instant::now() + Duration::from_secs(1);
    while handler.responses.lock().is_empty() && Instant::now() < deadline {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    let seen = handler.responses.lock().clone();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].correlation_id, id);
    match &seen[0].body {
        ResponseBody::Typed(message) => assert_eq!(message.body, b"7"),
        other => panic!("expected a typed response, got {:?}", other),
    }
    assert_eq!(handler.requests.load(Ordering::SeqCst), 0);

    server.close().await;
}

#[test_log::test(tokio::test)]
async fn test_request_server_requires_sender_options() {
    let mut options = server_options(FrameVariant::Typed, ServerRole::Request, "requests");
    options.sender = None;
    let server = QueueServer::new(
        options,
        Arc::new(InMemoryBroker::new()),
        Arc::new(EchoHandler::default()),
        SelectionContext::default(),
    )
    .unwrap();

    let result = server.start_listeners().await;
    assert!(matches!(result, Err(TransportError::Configuration { .. })));
}

#[test_log::test(tokio::test)]
async fn test_publish_failure_propagates_from_send() {
    let broker = InMemoryBroker::new();
    broker.fail_publish_to("requests");
    let client = client(&broker, client_options(false));

    let result = client.send(&RequestMessage::new(Vec::new())).await;

    assert!(matches!(result, Err(TransportError::MessageQueue { .. })));
    assert_eq!(client.pending_count(), 0);

    client.close().await;
}

fn fanout_options(sends: &[(&str, &str)]) -> ClientOptions {
    let mut options = client_options(false);
    options.routes[0].send = sends
        .iter()
        .map(|(endpoint, name)| RouteDescriptor::new(*endpoint, *name))
        .collect();
    options
}

#[test_log::test(tokio::test)]
async fn test_request_is_published_to_every_send_route() {
    let broker = InMemoryBroker::new();
    let client = client(
        &broker,
        fanout_options(&[
            ("memory://a", "requests"),
            ("memory://b", "requests"),
            ("memory://c", "audit"),
        ]),
    );

    let id = client.send(&RequestMessage::new(b"\"x\"".to_vec())).await.unwrap();

    let published: Vec<(String, String)> = broker
        .publish_log()
        .into_iter()
        .filter(|r| r.accepted)
        .map(|r| {
            assert_eq!(decode_frame(&r.payload).unwrap().correlation_id, id);
            (r.endpoint, r.name)
        })
        .collect();
    assert_eq!(
        published,
        vec![
            ("memory://a".to_string(), "requests".to_string()),
            ("memory://b".to_string(), "requests".to_string()),
            ("memory://c".to_string(), "audit".to_string()),
        ]
    );
    assert_eq!(client.pending_count(), 1);

    client.close().await;
    assert_eq!(client.pending_count(), 0);
}

#[test_log::test(tokio::test)]
async fn test_failed_send_route_releases_reply_subscription() {
    let broker = InMemoryBroker::new();
    broker.fail_publish_to("second");
    let client = client(
        &broker,
        fanout_options(&[
            ("memory://a", "first"),
            ("memory://b", "second"),
            ("memory://c", "third"),
        ]),
    );

    let result = client.send(&RequestMessage::new(b"\"x\"".to_vec())).await;
    assert!(matches!(result, Err(TransportError::MessageQueue { .. })));

    let first = broker.published_to("first");
    assert_eq!(first.len(), 1);
    let id = decode_frame(&first[0]).unwrap().correlation_id;
    let reply_name = format!("replies_{}", id);

    let attempts: Vec<(String, bool)> = broker
        .publish_log()
        .into_iter()
        .map(|r| (r.name, r.accepted))
        .collect();
    assert_eq!(
        attempts,
        vec![("first".to_string(), true), ("second".to_string(), false)]
    );

    assert_eq!(client.pending_count(), 0);
    assert_eq!(broker.subscription_history(&reply_name), vec![1, 0]);
    assert!(broker.deleted_queues().contains(&reply_name));

    client.close().await;
}

#[test_log::test(tokio::test)]
async fn test_sends_wait_together_for_shared_listener() {
    let fixture = start_server(FrameVariant::Typed).await;
    // The shared response listener needs a few attempts to connect
    fixture.broker.fail_next_connects(3);
    let client = client(&fixture.broker, client_options(true));

    let first = RequestMessage::with_body(SERIALIZER, "a").unwrap();
    let second = RequestMessage::with_body(SERIALIZER, "b").unwrap();
    let (first, second) = tokio::join!(client.send(&first), client.send(&second));
    let (first, second) = (first.unwrap(), second.unwrap());

    let (first, second) = tokio::join!(client.receive(first), client.receive(second));
    let first: String = first.unwrap().body_as(SERIALIZER).unwrap();
    let second: String = second.unwrap().body_as(SERIALIZER).unwrap();
    assert_eq!((first.as_str(), second.as_str()), ("A", "B"));
    assert_eq!(fixture.broker.subscription_count("replies"), 1);

    client.close().await;
    fixture.server.close().await;
}
