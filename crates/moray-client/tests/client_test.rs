//! Client Integration Tests
//!
//! These tests drive a `MorayClient` against a scripted server and verify:
//! - Response arity checks for buffered calls
//! - Streaming of `findObjects` and `sql` records
//! - Remote error chains, with and without unwrapped errors
//! - Connection faults surfacing once per request
//! - Claim bookkeeping across successes and failures

mod support;

use futures::{StreamExt, TryStreamExt};
use moray_client::{BatchRequest, ErrorLayer, MorayError, PoolEvent, RemoteErrorKind, RequestOptions};
use serde_json::{json, Value};
use support::{connect, connect_with, remote, settle, wait_idle, FakeServer, Reply};

fn object(key: &str) -> Value {
    json!({
        "bucket": "b",
        "key": key,
        "value": {"name": key},
        "_id": 1,
        "_etag": "ABC123"
    })
}

// ============================================================================
// Buffered calls
// ============================================================================

#[tokio::test]
async fn test_get_object_arity() {
    let server = FakeServer::start(|method, args| match (method, args.get(1).and_then(Value::as_str)) {
        ("getObject", Some("one")) => Reply::Records(vec![object("one")]),
        ("getObject", Some("two")) => Reply::Records(vec![object("a"), object("b")]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;
    let opts = RequestOptions::new();

    let record = client.get_object("b", "one", &opts).await.unwrap();
    assert_eq!(record.key, "one");
    assert_eq!(record.etag.as_deref(), Some("ABC123"));

    for key in ["none", "two"] {
        let err = client.get_object("b", key, &opts).await.unwrap_err();
        assert_eq!(err.layer(), ErrorLayer::Protocol);
        assert!(err.to_string().contains("bad server response"), "{}", err);
        assert!(matches!(err.unwrap_chain(), MorayError::BadResponse(_)));
    }

    settle(&client).await;
    client.close().await;
}

#[tokio::test]
async fn test_put_object_sends_value_and_options() {
    let server = FakeServer::start(|_, _| Reply::Records(vec![])).await;
    let client = connect(&server).await;

    let value = json!({"a": 1});
    let opts = RequestOptions::new().with_req_id("req-1").set("etag", "E0");
    let reply = client.put_object("b", "k", &value, &opts).await.unwrap();
    assert_eq!(reply, json!({}));

    let args = server.last_args("putObject").unwrap();
    assert_eq!(args[0], "b");
    assert_eq!(args[1], "k");
    assert_eq!(args[2], value);
    assert_eq!(args[3]["_value"], r#"{"a":1}"#);
    assert_eq!(args[3]["req_id"], "req-1");
    assert_eq!(args[3]["etag"], "E0");
    assert_eq!(args[3]["noCache"], true);

    client.close().await;
}

#[tokio::test]
async fn test_at_most_one_replies() {
    let server = FakeServer::start(|method, _| match method {
        "updateObjects" => Reply::Records(vec![json!({"count": 4})]),
        "deleteMany" => Reply::Records(vec![json!({"count": 1}), json!({"count": 2})]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;
    let opts = RequestOptions::new();

    let fields = serde_json::from_value(json!({"state": "done"})).unwrap();
    let reply = client.update_objects("b", &fields, "(state=open)", &opts).await.unwrap();
    assert_eq!(reply["count"], 4);

    let err = client.delete_many("b", "(state=done)", &opts).await.unwrap_err();
    assert!(err.to_string().contains("expected 0 or 1 data messages, found 2"));

    let requests = vec![
        BatchRequest::Put {
            bucket: "b".into(),
            key: "k1".into(),
            value: json!({"n": 1}),
            options: None,
        },
        BatchRequest::Delete {
            bucket: "b".into(),
            key: "k2".into(),
            options: None,
        },
    ];
    assert_eq!(client.batch(&requests, &opts).await.unwrap(), json!({}));
    let sent = server.last_args("batch").unwrap();
    assert_eq!(sent[0][0]["operation"], "put");
    assert_eq!(sent[0][1]["operation"], "delete");

    client.close().await;
}

#[tokio::test]
async fn test_invalid_batch_sends_nothing() {
    let server = FakeServer::start(|_, _| Reply::Records(vec![])).await;
    let client = connect(&server).await;

    let requests = vec![BatchRequest::Update {
        bucket: "b".into(),
        fields: Default::default(),
        filter: String::new(),
        options: None,
    }];
    let err = client.batch(&requests, &RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, MorayError::InvalidArgument(_)));
    assert_eq!(server.calls("batch"), 0);
    assert_eq!(client.outstanding_claims(), 0);

    client.close().await;
}

#[tokio::test]
async fn test_version() {
    let server = FakeServer::start(|method, _| match method {
        "version" => Reply::Records(vec![json!({"version": 3})]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;

    assert_eq!(client.version(&RequestOptions::new()).await.unwrap(), 3);
    client.close().await;

    let garbled = FakeServer::start(|_, _| Reply::Records(vec![json!({"version": "three"})])).await;
    let client = connect(&garbled).await;
    let err = client.version(&RequestOptions::new()).await.unwrap_err();
    assert!(err.to_string().contains("unable to parse version"));
    assert_eq!(client.version_or_default(&RequestOptions::new()).await, 1);
    client.close().await;
}

#[tokio::test]
async fn test_get_tokens() {
    let server = FakeServer::start(|method, _| match method {
        "getTokens" => Reply::Records(vec![json!({"tokens": ["1.moray", "2.moray"]})]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;

    let opts = RequestOptions::new().with_req_id("tokens-1");
    let reply = client.get_tokens(&opts).await.unwrap();
    assert_eq!(reply["tokens"], json!(["1.moray", "2.moray"]));
    assert_eq!(server.last_args("getTokens").unwrap(), vec![json!({"req_id": "tokens-1"})]);
    settle(&client).await;
    client.close().await;

    let empty = FakeServer::start(|_, _| Reply::Records(vec![])).await;
    let client = connect(&empty).await;
    let err = client.get_tokens(&RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, MorayError::Request { ref method, .. } if method == "getTokens"));
    assert!(matches!(err.unwrap_chain(), MorayError::BadResponse(_)));
    client.close().await;
}

#[tokio::test]
async fn test_malformed_records_are_request_errors() {
    let server = FakeServer::start(|method, _| match method {
        "getObject" => Reply::Records(vec![json!({"nope": 1})]),
        "getBucket" => Reply::Records(vec![json!({"name": "b"})]),
        "listBuckets" => Reply::Records(vec![json!("garbage")]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;
    let opts = RequestOptions::new();

    let errors = [
        ("getObject", client.get_object("b", "k", &opts).await.unwrap_err()),
        ("getBucket", client.get_bucket("b", &opts).await.unwrap_err()),
        ("listBuckets", client.list_buckets(&opts).await.unwrap_err()),
    ];
    for (expected, err) in errors {
        assert!(
            matches!(err, MorayError::Request { ref method, .. } if method == expected),
            "{:?}",
            err
        );
        assert_eq!(err.layer(), ErrorLayer::Protocol);
    }
    client.close().await;

    let client = connect_with(&server, |options| options.unwrap_errors(true)).await;
    let err = client.get_object("b", "k", &opts).await.unwrap_err();
    assert!(matches!(err, MorayError::BadResponse(_)), "{:?}", err);
    client.close().await;
}

// ============================================================================
// Streaming calls
// ============================================================================

#[tokio::test]
async fn test_find_objects_streams_records() {
    let server = FakeServer::start(|method, _| match method {
        "findObjects" => Reply::Records(vec![object("a"), object("b"), object("c")]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;

    let records: Vec<Value> = client
        .find_objects("b", "(name=*)", &RequestOptions::new())
        .try_collect()
        .await
        .unwrap();
    let keys: Vec<&str> = records.iter().map(|r| r["key"].as_str().unwrap()).collect();
    assert_eq!(keys, vec!["a", "b", "c"]);

    let args = server.last_args("findObjects").unwrap();
    assert_eq!(args[1], "(name=*)");

    settle(&client).await;
    client.close().await;
}

#[tokio::test]
async fn test_sql_skips_null_rows() {
    let server = FakeServer::start(|method, _| match method {
        "sql" => Reply::Records(vec![json!({"n": 1}), Value::Null, json!({"n": 2})]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;

    let rows: Vec<Value> = client
        .sql("select n from t where n > $1", vec![json!(0)], &RequestOptions::new())
        .try_collect()
        .await
        .unwrap();
    assert_eq!(rows, vec![json!({"n": 1}), json!({"n": 2})]);

    let args = server.last_args("sql").unwrap();
    assert_eq!(args[1], json!([0]));
    assert!(args[2]["req_id"].is_string());

    client.close().await;
}

#[tokio::test]
async fn test_stream_error_is_terminal() {
    let server = FakeServer::start(|method, _| match method {
        "findObjects" => remote("InvalidQueryError", "bad filter"),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;

    let mut stream = client.find_objects("b", "((", &RequestOptions::new());
    let err = stream.next().await.unwrap().unwrap_err();
    assert!(err.has_remote_cause(&RemoteErrorKind::InvalidQuery));
    assert!(stream.next().await.is_none());

    settle(&client).await;
    client.close().await;
}

// ============================================================================
// Error chains
// ============================================================================

#[tokio::test]
async fn test_remote_error_chain() {
    let server = FakeServer::start(|method, _| match method {
        "getObject" => remote("ObjectNotFoundError", "b::k does not exist"),
        _ => Reply::Records(vec![]),
    })
    .await;

    let client = connect(&server).await;
    let err = client.get_object("b", "k", &RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, MorayError::Request { ref method, .. } if method == "getObject"));
    assert_eq!(err.layer(), ErrorLayer::Remote);
    assert!(err.has_remote_cause(&RemoteErrorKind::ObjectNotFound));
    client.close().await;

    let client = connect_with(&server, |options| options.unwrap_errors(true)).await;
    let err = client.get_object("b", "k", &RequestOptions::new()).await.unwrap_err();
    match &err {
        MorayError::Remote(remote) => {
            assert_eq!(remote.kind(), RemoteErrorKind::ObjectNotFound);
            assert_eq!(err.to_string(), "ObjectNotFoundError: b::k does not exist");
        }
        other => panic!("expected an unwrapped remote error, got {:?}", other),
    }
    client.close().await;
}

#[tokio::test]
async fn test_connection_loss_is_transport_error() {
    let server = FakeServer::start(|method, _| match method {
        "delObject" => Reply::Disconnect,
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;

    let err = client.delete_object("b", "k", &RequestOptions::new()).await.unwrap_err();
    assert_eq!(err.layer(), ErrorLayer::Transport);

    settle(&client).await;
    client.close().await;
}

#[tokio::test]
async fn test_unknown_reply_id_fails_request_once() {
    let server = FakeServer::start(|method, _| match method {
        "findObjects" | "getObject" => Reply::UnknownId,
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;
    let mut events = client.subscribe();
    wait_idle(&client, 2).await;

    let mut stream = client.find_objects("b", "(key=*)", &RequestOptions::new());
    let err = stream.next().await.unwrap().unwrap_err();
    assert_eq!(err.layer(), ErrorLayer::Protocol);
    assert!(stream.next().await.is_none());

    let err = client.get_object("b", "k", &RequestOptions::new()).await.unwrap_err();
    assert!(matches!(err, MorayError::Request { ref method, .. } if method == "getObject"));
    assert_eq!(err.layer(), ErrorLayer::Protocol);

    settle(&client).await;
    client.ping(false, &RequestOptions::new()).await.unwrap();
    while let Ok(event) = events.try_recv() {
        assert!(!matches!(event, PoolEvent::Error(_)), "{:?}", event);
    }
    client.close().await;
}

// ============================================================================
// Claim bookkeeping
// ============================================================================

#[tokio::test]
async fn test_claims_balance() {
    let server = FakeServer::start(|method, _| match method {
        "getObject" => remote("ObjectNotFoundError", "missing"),
        "findObjects" => Reply::Records(vec![object("a"), object("b")]),
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;
    let opts = RequestOptions::new();

    client.ping(false, &opts).await.unwrap();
    assert!(client.get_object("b", "k", &opts).await.is_err());
    assert!(client.reindex_objects("b", 0, &opts).await.is_err());
    client.delete_object("b", "k", &opts).await.unwrap();

    // Abandon a stream part way through
    let mut stream = client.find_objects("b", "(key=*)", &opts);
    assert!(stream.next().await.is_some());
    drop(stream);

    settle(&client).await;
    client.close().await;
    assert_eq!(client.outstanding_claims(), 0);
}

#[tokio::test]
async fn test_close_with_outstanding_claim() {
    let server = FakeServer::start(|method, _| match method {
        "findObjects" => Reply::Hang,
        _ => Reply::Records(vec![]),
    })
    .await;
    let client = connect(&server).await;

    let stream = client.find_objects("b", "(key=*)", &RequestOptions::new());
    assert_eq!(client.outstanding_claims(), 1);

    client.close().await;
    assert!(client.is_closed());

    drop(stream);
    settle(&client).await;
}
