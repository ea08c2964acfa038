//! Tests for the transport layer
//!
//! These verify frame encoding and the async frame reader and writer,
//! including the edge cases of truncated and oversized frames.

#[cfg(test)]
mod tests {
    use crate::protocol::{ErrorLayer, Message, MessageStatus, RemoteError};
    use crate::transport::{JsonCodec, TcpTransport, MAX_MESSAGE_SIZE};
    use serde_json::json;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_frame_has_length_prefix() {
        let msg = Message::request(1, "getBucket", vec![json!("users"), json!({})]);
        let frame = JsonCodec::encode_frame(&msg).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);

        let decoded = JsonCodec::decode_message(&frame[4..]).unwrap();
        assert_eq!(decoded.id, 1);
        assert_eq!(decoded.method(), "getBucket");
    }

    #[test]
    fn test_decode_garbage_is_protocol_error() {
        let err = JsonCodec::decode_message(b"{not json").unwrap_err();
        assert_eq!(err.layer(), ErrorLayer::Protocol);

        let err = JsonCodec::decode_message(br#"{"id":1,"status":"bogus","data":{"m":{"name":"x"}}}"#)
            .unwrap_err();
        assert_eq!(err.layer(), ErrorLayer::Protocol);
    }

    #[tokio::test]
    async fn test_frames_over_stream() {
        let (mut client, mut server) = tokio::io::duplex(64 * 1024);

        TcpTransport::write_frame(&mut client, &Message::data(4, "sql", vec![json!({"a": 1})]))
            .await
            .unwrap();
        let err = RemoteError::new("InvalidQueryError", "bad sql");
        TcpTransport::write_frame(&mut client, &Message::error(4, "sql", &err))
            .await
            .unwrap();
        drop(client);

        let first = TcpTransport::read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(first.status, MessageStatus::Data);
        assert_eq!(first.into_payloads(), vec![json!({"a": 1})]);

        let second = TcpTransport::read_frame(&mut server).await.unwrap().unwrap();
        assert_eq!(second.status, MessageStatus::Error);
        assert_eq!(RemoteError::from_value(second.data.d), err);

        assert!(TcpTransport::read_frame(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_truncated_frame() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&10u32.to_be_bytes()).await.unwrap();
        client.write_all(b"{\"id\"").await.unwrap();
        drop(client);

        let err = TcpTransport::read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.layer(), ErrorLayer::Protocol);
    }

    #[tokio::test]
    async fn test_truncated_length_prefix() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client.write_all(&[0u8, 0]).await.unwrap();
        drop(client);

        let err = TcpTransport::read_frame(&mut server).await.unwrap_err();
        assert_eq!(err.layer(), ErrorLayer::Protocol);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut client, mut server) = tokio::io::duplex(1024);
        client
            .write_all(&((MAX_MESSAGE_SIZE + 1) as u32).to_be_bytes())
            .await
            .unwrap();

        let err = TcpTransport::read_frame(&mut server).await.unwrap_err();
        assert!(err.to_string().contains("Message too large"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let err = TcpTransport::connect(addr, std::time::Duration::from_secs(2))
            .await
            .unwrap_err();
        assert_eq!(err.layer(), ErrorLayer::Transport);
    }
}
