//! Tests that drive one connection with hand-built frames.

use std::borrow::Cow;
use std::sync::Arc;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;

use wirepack::Encoder;

use remoting::Config;
use remoting::Connection;
use remoting::Error;
use remoting::RemoteType;
use remoting::SurrogateRegistry;
use remoting::Value;
use remoting::frame::CallEncoder;
use remoting::frame::Frame;
use remoting::frame::FunctionKind;
use remoting::frame::Inbound;
use remoting::frame::WireArg;
use remoting::transport;
use remoting::transport::Transport;
use remoting::transport::memory::duplex;

struct Calculator;

fn surrogates() -> Arc<SurrogateRegistry> {
    let mut registry = SurrogateRegistry::new();
    registry.register_remote(RemoteType::<Calculator>::new("Calculator").method_sync("AddValues", |_, args| {
        let a: i64 = args.get(0)?;
        let b: i64 = args.get(1)?;
        Ok(Value::new(a + b))
    }));
    Arc::new(registry)
}

fn inline(json: &str) -> WireArg<'static> {
    WireArg::Inline(Cow::Owned(json.as_bytes().to_vec()))
}

/// Counts outgoing frames and never receives anything.
#[derive(Default)]
struct Recorder {
    sent: Arc<AtomicUsize>,
}

#[async_trait::async_trait]
impl Transport for Recorder {
    async fn send(&self, _payload: &[u8]) -> transport::Result<()> {
        self.sent.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn recv(&self) -> transport::Result<Option<Vec<u8>>> {
        std::future::pending().await
    }
}

// --- Test 1: Reply Carries the Request's Sequence Number ---

#[tokio::test]
async fn test_add_values_reply_echoes_seq() {
    let (server_end, raw) = duplex();
    let server = Connection::new(Box::new(server_end), surrogates(), Config::default().with_side_name("server"));
    let id = server.publish(&Value::new(Calculator)).expect("publish");

    let args = vec![inline("2"), inline("5")];
    let mut enc = Encoder::new();
    CallEncoder::new(42, id.as_str(), "AddValues", &args).encode(&mut enc).expect("encode call");
    raw.send(&enc.into_bytes().expect("finish")).await.expect("send");

    let reply = raw.recv().await.expect("recv").expect("a reply");
    let inbound = Inbound::decode(&reply).expect("decode reply");
    assert_eq!(inbound.header.kind, FunctionKind::Reply);
    assert_eq!(inbound.header.seq, 42);
    match inbound.frame {
        Frame::Reply(Ok(WireArg::Inline(bytes))) => {
            let sum: i64 = serde_json::from_slice(&bytes).expect("json");
            assert_eq!(sum, 7);
        }
        other => panic!("expected an inline result, got {:?}", other),
    }
}

// --- Test 2: Unmarshalable Arguments Never Reach the Wire ---

#[tokio::test]
async fn test_unregistered_argument_fails_before_send() {
    struct Unregistered;

    let recorder = Recorder::default();
    let sent = recorder.sent.clone();
    let client = Connection::new(Box::new(recorder), surrogates(), Config::default());

    let outcome = client.invoke("some-object", "AddValues", (1i64, Unregistered)).await;
    assert!(matches!(outcome, Err(Error::Serialization(_))));
    assert_eq!(sent.load(Ordering::SeqCst), 0);
    assert_eq!(client.pending_calls(), 0);
    assert!(!client.is_closed());
}

// --- Test 3: Protocol Errors Close the Channel ---

#[tokio::test]
async fn test_garbage_frame_closes_channel() {
    let (server_end, raw) = duplex();
    let server = Connection::new(Box::new(server_end), surrogates(), Config::default());
    server.publish(&Value::new(Calculator)).expect("publish");

    raw.send(&[0xff, 0x00, 0x13]).await.expect("send");
    server.closed().await;
    assert!(server.is_closed());
    assert!(server.registry().is_empty());
    assert!(raw.recv().await.expect("recv").is_none());
}

// --- Test 4: Unknown Objects Fault Without Closing ---

#[tokio::test]
async fn test_unknown_target_faults_and_keeps_channel() {
    let (server_end, raw) = duplex();
    let server = Connection::new(Box::new(server_end), surrogates(), Config::default());

    let mut enc = Encoder::new();
    CallEncoder::new(7, "missing", "AddValues", &[]).encode(&mut enc).expect("encode call");
    raw.send(&enc.into_bytes().expect("finish")).await.expect("send");

    let reply = raw.recv().await.expect("recv").expect("a reply");
    let inbound = Inbound::decode(&reply).expect("decode reply");
    assert_eq!(inbound.header.seq, 7);
    match inbound.frame {
        Frame::Reply(Err(fault)) => assert_eq!(fault.kind, remoting::FaultKind::InstanceNotFound),
        other => panic!("expected a fault, got {:?}", other),
    }
    assert!(!server.is_closed());
}
