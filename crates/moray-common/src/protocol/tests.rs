//! Tests for the protocol module
//!
//! These cover frame construction, remote error parsing and the error
//! classification helpers used by the client.

#[cfg(test)]
mod tests {
    use super::super::*;
    use serde_json::json;

    #[test]
    fn test_request_frame_carries_positional_args() {
        let msg = Message::request(3, "getObject", vec![json!("b"), json!("k"), json!({})]);
        assert_eq!(msg.id, 3);
        assert_eq!(msg.status, MessageStatus::Data);
        assert_eq!(msg.method(), "getObject");
        assert_eq!(msg.data.d, json!(["b", "k", {}]));
        assert!(!msg.is_terminal());
    }

    #[test]
    fn test_terminal_frames() {
        assert!(Message::end(1, "ping").is_terminal());
        let err = RemoteError::new("BucketNotFoundError", "nope");
        let msg = Message::error(1, "getBucket", &err);
        assert!(msg.is_terminal());
        assert_eq!(msg.data.d["name"], "BucketNotFoundError");
    }

    #[test]
    fn test_payload_splitting() {
        let msg = Message::data(1, "sql", vec![json!(1), json!(null), json!(2)]);
        assert_eq!(msg.into_payloads(), vec![json!(1), json!(null), json!(2)]);

        let mut scalar = Message::end(1, "x");
        scalar.data.d = json!({"a": 1});
        assert_eq!(scalar.into_payloads(), vec![json!({"a": 1})]);

        let mut empty = Message::end(1, "x");
        empty.data.d = serde_json::Value::Null;
        assert!(empty.into_payloads().is_empty());
    }

    #[test]
    fn test_wire_shape() {
        let msg = Message::end(9, "ping");
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["id"], 9);
        assert_eq!(value["status"], "end");
        assert_eq!(value["data"]["m"]["name"], "ping");
        assert!(value["data"]["m"]["uts"].as_u64().unwrap() > 0);
    }

    #[test]
    fn test_remote_error_from_value() {
        let err = RemoteError::from_value(json!({
            "name": "EtagConflictError",
            "message": "etag mismatch",
            "context": {"bucket": "b"},
            "cause": {"name": "UniqueAttributeError", "message": "dup"}
        }));
        assert_eq!(err.kind(), RemoteErrorKind::EtagConflict);
        assert_eq!(err.context, Some(json!({"bucket": "b"})));
        assert!(err.find(&RemoteErrorKind::UniqueAttribute).is_some());
        assert!(err.find(&RemoteErrorKind::BucketNotFound).is_none());
        assert_eq!(err.chain().count(), 2);

        let loose = RemoteError::from_value(json!("something broke"));
        assert_eq!(loose.name, "Error");
        assert_eq!(loose.message, "something broke");

        let nameless = RemoteError::from_value(json!({"message": "m"}));
        assert_eq!(nameless.name, "Error");
    }

    #[test]
    fn test_remote_error_kind_names() {
        for name in [
            "BucketNotFoundError",
            "BucketConflictError",
            "ObjectNotFoundError",
            "NoDatabasePeersError",
            "QueryTimeoutError",
        ] {
            assert_eq!(RemoteErrorKind::from_name(name).name(), name);
        }
        assert_eq!(
            RemoteErrorKind::from_name("CustomError"),
            RemoteErrorKind::Other("CustomError".to_string())
        );
    }

    #[test]
    fn test_error_layers() {
        assert_eq!(MorayError::NoConnections.layer(), ErrorLayer::PoolExhausted);
        assert_eq!(
            MorayError::transport("socket", "reset").layer(),
            ErrorLayer::Transport
        );
        assert_eq!(MorayError::Protocol("x".into()).layer(), ErrorLayer::Protocol);
        assert_eq!(
            MorayError::request("ping", MorayError::Timeout { timeout_ms: 5 }).layer(),
            ErrorLayer::Request
        );
        assert_eq!(
            MorayError::request("getBucket", RemoteError::new("BucketNotFoundError", "").into())
                .layer(),
            ErrorLayer::Remote
        );
        assert_eq!(
            MorayError::InvalidArgument("bucket".into()).layer(),
            ErrorLayer::Client
        );
    }

    #[test]
    fn test_find_remote_through_request_wrapper() {
        let remote = RemoteError::new("VError", "outer")
            .with_cause(RemoteError::new("BucketConflictError", "exists"));
        let err = MorayError::request("createBucket", MorayError::Server(remote));

        assert!(err.has_remote_cause(&RemoteErrorKind::BucketConflict));
        assert!(!err.has_remote_cause(&RemoteErrorKind::BucketNotFound));
        assert!(!MorayError::Aborted.has_remote_cause(&RemoteErrorKind::BucketConflict));
    }

    #[test]
    fn test_unwrap_chain() {
        let err = MorayError::request(
            "getObject",
            MorayError::Server(RemoteError::new("ObjectNotFoundError", "k not found")),
        );
        let display = err.to_string();
        assert!(display.contains("request failed: getObject"));
        assert!(display.contains("ObjectNotFoundError"));

        let unwrapped = err.unwrap_chain();
        assert!(matches!(unwrapped, MorayError::Remote(_)));
        assert_eq!(unwrapped.to_string(), "ObjectNotFoundError: k not found");
        assert!(unwrapped.has_remote_cause(&RemoteErrorKind::ObjectNotFound));

        let timeout = MorayError::request("ping", MorayError::Timeout { timeout_ms: 100 });
        assert!(timeout.is_timeout());
        assert!(matches!(
            timeout.unwrap_chain(),
            MorayError::Timeout { timeout_ms: 100 }
        ));
    }

    #[test]
    fn test_errors_are_cloneable() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err: MorayError = io.into();
        let copy = err.clone();
        assert_eq!(err.to_string(), copy.to_string());
        assert_eq!(copy.layer(), ErrorLayer::Transport);
    }

    #[test]
    fn test_millis_saturates() {
        use std::time::Duration;
        assert_eq!(millis(Duration::from_millis(1500)), 1500);
        assert_eq!(millis(Duration::from_micros(999)), 0);
        assert_eq!(millis(Duration::MAX), u64::MAX);
    }
}
