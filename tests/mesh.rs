use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use meshlink::address::Address;
use meshlink::component::{Acknowledge, Component};
use meshlink::config::MeshConfig;
use meshlink::pipe::DATA_FRAME_OVERHEAD;
use meshlink::protocol::{ComponentDescriptor, ConnectContext};
use meshlink::route::Distance;
use meshlink::tunnel::{Tunnel, TunnelState};
use meshlink::{Builder, Mesh};

const TOKEN: &str = "token";

fn config(name: &str) -> MeshConfig {
    let mut config = MeshConfig::new(name).set_connect_timeout(Duration::from_secs(5));
    for peer in ["a", "b", "c", "d", "n1", "n2", "n3"] {
        config = config.add_auth(peer, TOKEN);
    }
    config
}

async fn node(name: &str) -> Mesh {
    Builder::new(config(name)).build().await.unwrap()
}

/// Links `dialer` to `acceptor` over an in-memory pipe.
async fn link(dialer: &Mesh, acceptor: &Mesh) {
    let (x, y) = tokio::io::duplex(64 * 1024);
    let (inbound, outbound) =
        tokio::join!(acceptor.attach_inbound(y), dialer.attach_outbound(x, TOKEN));
    assert_eq!(inbound.unwrap(), dialer.name());
    assert_eq!(outbound.unwrap(), acceptor.name());
}

async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..300 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}

/// Hands every inbound tunnel to the test.
struct Capture {
    sender: mpsc::UnboundedSender<(Tunnel, ConnectContext)>,
}

impl Capture {
    fn new() -> (Arc<Capture>, mpsc::UnboundedReceiver<(Tunnel, ConnectContext)>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Arc::new(Capture { sender }), receiver)
    }
}

#[async_trait::async_trait]
impl Component for Capture {
    fn on_connection(&self, tunnel: Tunnel, context: ConnectContext, ack: Acknowledge) {
        ack.accept(vec![json!("captured")]);
        let _ = self.sender.send((tunnel, context));
    }
}

struct Echo;

#[async_trait::async_trait]
impl Component for Echo {
    fn on_connection(&self, tunnel: Tunnel, _context: ConnectContext, ack: Acknowledge) {
        ack.accept(Vec::new());
        tokio::spawn(async move {
            let (mut reader, mut writer) = tokio::io::split(tunnel);
            let _ = tokio::io::copy(&mut reader, &mut writer).await;
            let _ = writer.shutdown().await;
        });
    }
}

/// Never answers the connect.
struct Silent {
    pending: Mutex<Vec<(Tunnel, Acknowledge)>>,
}

#[async_trait::async_trait]
impl Component for Silent {
    fn on_connection(&self, tunnel: Tunnel, _context: ConnectContext, ack: Acknowledge) {
        self.pending.lock().push((tunnel, ack));
    }
}

async fn chain(names: &[&str]) -> Vec<Mesh> {
    let mut meshes = Vec::new();
    for name in names {
        meshes.push(node(name).await);
    }
    for pair in meshes.windows(2) {
        link(&pair[0], &pair[1]).await;
    }
    meshes
}

#[tokio::test]
async fn local_loopback() {
    let (capture, mut inbound) = Capture::new();
    let mesh = Builder::new(config("n1"))
        .component("y", capture)
        .build()
        .await
        .unwrap();
    let context = ConnectContext::default()
        .with_source("n1/x")
        .with_protocol("test");
    let (mut x, connecting) = mesh.connect("n1/y".parse().unwrap(), context);
    assert_eq!(connecting.await.unwrap(), vec![json!("captured")]);
    let (mut y, context) = inbound.recv().await.unwrap();
    assert_eq!(context.source.as_deref(), Some("n1/x"));
    assert_eq!(context.protocol.as_deref(), Some("test"));

    x.write_all(b"hello").await.unwrap();
    let mut buf = [0u8; 5];
    y.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"hello");
    y.write_all(b"world").await.unwrap();
    x.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"world");

    drop(y);
    let mut rest = Vec::new();
    assert_eq!(x.read_to_end(&mut rest).await.unwrap(), 0);
    assert_eq!(x.state(), TunnelState::Closed);
}

#[tokio::test]
async fn chain_converges() {
    let meshes = chain(&["a", "b", "c", "d"]).await;
    let a = &meshes[0];
    eventually("a to learn d", || async move {
        a.routes().await.unwrap().iter().any(|route| {
            route.destination == "d" && route.distance == Distance::hops(3) && route.next == "b"
        })
    })
    .await;
    assert_eq!(a.find_next_hop("d").await.unwrap().as_deref(), Some("b"));
    assert_eq!(
        meshes[3].find_next_hop("a").await.unwrap().as_deref(),
        Some("c")
    );
    assert_eq!(meshes[1].nodes().await.unwrap(), vec!["a", "c"]);
}

#[tokio::test]
async fn withdrawal_when_middle_node_leaves() {
    let mut meshes = chain(&["a", "b", "c", "d"]).await;
    meshes[3]
        .register("echo", Arc::new(Echo), Value::Null)
        .await
        .unwrap();
    let owned_a = meshes.remove(0);
    let b = meshes.remove(0);
    let a = &owned_a;
    eventually("a to reach d", || async move {
        a.find_next_hop("d").await.unwrap().is_some()
    })
    .await;
    let (mut tunnel, connecting) = a.connect("d/echo".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    tunnel.write_all(b"via b").await.unwrap();
    let mut buf = [0u8; 5];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"via b");

    b.shutdown().await;

    eventually("a to withdraw c and d", || async move {
        let routes = a.routes().await.unwrap();
        ["c", "d"].iter().all(|dest| {
            routes
                .iter()
                .any(|route| route.destination == *dest && !route.is_reachable())
        })
    })
    .await;
    assert_eq!(a.find_next_hop("d").await.unwrap(), None);
    let err = tunnel.read(&mut buf).await.unwrap_err();
    assert_eq!(err.kind(), std::io::ErrorKind::ConnectionAborted);
    assert!(tunnel.control().error().is_some());

    let d = &meshes[1];
    eventually("d to lose a", || async move {
        d.find_next_hop("a").await.unwrap().is_none()
    })
    .await;
}

#[tokio::test]
async fn second_node_with_same_name_is_rejected() {
    let a = node("a").await;
    let b = node("b").await;
    link(&b, &a).await;
    a.register("echo", Arc::new(Echo), Value::Null).await.unwrap();

    let impostor = node("b").await;
    let (x, y) = tokio::io::duplex(4096);
    let (inbound, outbound) = tokio::join!(a.attach_inbound(y), impostor.attach_outbound(x, TOKEN));
    assert!(matches!(
        inbound,
        Err(meshlink::error::Error::DuplicateNode(name)) if name == "b"
    ));
    assert!(matches!(
        outbound,
        Err(meshlink::error::Error::AuthFailed(_))
    ));

    assert_eq!(a.nodes().await.unwrap(), vec!["b"]);
    let (mut tunnel, connecting) = b.connect("a/echo".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    tunnel.write_all(b"still here").await.unwrap();
    tunnel.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    tunnel.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"still here");
}

#[tokio::test]
async fn wrong_token_is_rejected() {
    let a = node("a").await;
    let b = node("b").await;
    let (x, y) = tokio::io::duplex(4096);
    let (inbound, outbound) = tokio::join!(a.attach_inbound(y), b.attach_outbound(x, "guess"));
    assert!(inbound.is_err());
    assert!(matches!(
        outbound,
        Err(meshlink::error::Error::AuthFailed(_))
    ));
    assert!(a.nodes().await.unwrap().is_empty());
}

#[tokio::test]
async fn relay_through_middle_node() {
    let meshes = chain(&["n1", "n2", "n3"]).await;
    let (capture, mut inbound) = Capture::new();
    meshes[2].register("z", capture, Value::Null).await.unwrap();
    let n1 = &meshes[0];
    eventually("n1 to reach n3", || async move {
        n1.find_next_hop("n3").await.unwrap().as_deref() == Some("n2")
    })
    .await;

    let context = ConnectContext::default().with_destination("example.org:80");
    let (mut tunnel, connecting) = n1.connect("n3/z".parse().unwrap(), context);
    assert_eq!(connecting.await.unwrap(), vec![json!("captured")]);
    let (mut far, context) = inbound.recv().await.unwrap();
    assert_eq!(context.destination.as_deref(), Some("example.org:80"));

    let payload: Vec<u8> = (0..=255u8).cycle().take(200_000).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        tunnel.write_all(&payload).await.unwrap();
        tunnel
    });
    let mut received = vec![0u8; expected.len()];
    far.read_exact(&mut received).await.unwrap();
    assert!(received == expected);
    let mut tunnel = writer.await.unwrap();

    far.write_all(b"xyz").await.unwrap();
    let mut buf = [0u8; 3];
    tunnel.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"xyz");

    drop(far);
    let mut rest = Vec::new();
    assert_eq!(tunnel.read_to_end(&mut rest).await.unwrap(), 0);
    eventually("n1 tunnel to close", || {
        let closed = tunnel.state() == TunnelState::Closed;
        async move { closed }
    })
    .await;
}

#[tokio::test]
async fn slow_reader_receives_exact_bytes() {
    let (capture, mut inbound) = Capture::new();
    let mesh = Builder::new(config("n1").set_tunnel_buffer(2))
        .component("sink", capture)
        .build()
        .await
        .unwrap();
    let (mut tunnel, connecting) = mesh.connect("n1/sink".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    let (mut sink, _) = inbound.recv().await.unwrap();
    let writer = tokio::spawn(async move {
        for i in 0..300u32 {
            tunnel
                .write_all(format!("<{i:04}>").as_bytes())
                .await
                .unwrap();
        }
        tunnel.shutdown().await.unwrap();
        tunnel
    });
    let mut received = Vec::new();
    let mut buf = [0u8; 5];
    loop {
        let n = sink.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
        if received.len() % 100 < 5 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
    }
    let _tunnel = writer.await.unwrap();
    let expected: String = (0..300u32).map(|i| format!("<{i:04}>")).collect();
    assert_eq!(received, expected.into_bytes());
}

#[tokio::test]
async fn slow_reader_across_a_link() {
    let a = Builder::new(config("a").set_link_budget(1024).set_max_chunk(256))
        .build()
        .await
        .unwrap();
    let (capture, mut inbound) = Capture::new();
    let b = Builder::new(config("b").set_tunnel_buffer(2))
        .component("sink", capture)
        .build()
        .await
        .unwrap();
    link(&a, &b).await;
    let (mut tunnel, connecting) = a.connect("b/sink".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    let (mut sink, _) = inbound.recv().await.unwrap();
    let payload: Vec<u8> = (0..50_000u32).map(|i| (i % 251) as u8).collect();
    let expected = payload.clone();
    let writer = tokio::spawn(async move {
        tunnel.write_all(&payload).await.unwrap();
        tunnel.shutdown().await.unwrap();
        tunnel
    });
    let mut received = Vec::new();
    let mut buf = [0u8; 700];
    loop {
        let n = sink.read(&mut buf).await.unwrap();
        if n == 0 {
            break;
        }
        received.extend_from_slice(&buf[..n]);
        tokio::time::sleep(Duration::from_micros(200)).await;
    }
    let _tunnel = writer.await.unwrap();
    assert!(received == expected);
}

#[tokio::test]
async fn connect_failures_reach_the_originator() {
    let meshes = chain(&["n1", "n2"]).await;
    let n1 = &meshes[0];
    eventually("n1 to reach n2", || async move {
        n1.find_next_hop("n2").await.unwrap().is_some()
    })
    .await;

    let (_tunnel, connecting) = n1.connect("n2/nothing".parse().unwrap(), Default::default());
    let error = connecting.await.unwrap_err();
    assert!(error.message.contains("no such component"), "{error}");

    let (mut tunnel, connecting) = n1.connect("n9/x".parse().unwrap(), Default::default());
    let error = connecting.await.unwrap_err();
    assert_eq!(error.message, "no route to n9");
    assert!(tunnel.write_all(b"x").await.is_err());
}

#[tokio::test]
async fn unanswered_connect_times_out() {
    let silent = Arc::new(Silent {
        pending: Mutex::new(Vec::new()),
    });
    let mesh = Builder::new(config("n1").set_connect_timeout(Duration::from_millis(100)))
        .component("silent", silent.clone())
        .build()
        .await
        .unwrap();
    let (tunnel, connecting) = mesh.connect("n1/silent".parse().unwrap(), Default::default());
    let error = connecting.await.unwrap_err();
    assert_eq!(error.message, "connect timed out");
    assert_eq!(tunnel.state(), TunnelState::Closed);
    let (far, _) = silent.pending.lock().pop().unwrap();
    assert_eq!(far.state(), TunnelState::Closed);
}

#[tokio::test]
async fn peer_hosts_registered_component_while_linked() {
    let n1 = Builder::new(config("n1").add_component(ComponentDescriptor::new(
        "n2/sink".parse().unwrap(),
        "hole",
    )))
    .build()
    .await
    .unwrap();
    let owned_n2 = node("n2").await;
    let n2 = &owned_n2;
    link(&n1, n2).await;
    eventually("n2 to host n2/sink", || async move {
        n2.components().await.unwrap() == vec![Address::new("n2", "sink")]
    })
    .await;

    let (mut tunnel, connecting) = n1.connect("n2/sink".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    tunnel.write_all(&[0u8; 4096]).await.unwrap();

    assert!(n2.disconnect("n1").await.unwrap());
    eventually("n2 to drop n2/sink", || async move {
        n2.components().await.unwrap().is_empty()
    })
    .await;
    assert!(!n2.unregister("sink").await.unwrap());
}

#[tokio::test]
async fn tcp_component_reaches_target() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let target = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let (mut reader, mut writer) = stream.split();
        tokio::io::copy(&mut reader, &mut writer).await.unwrap();
    });
    let mesh = Builder::new(config("n1").add_component(
        ComponentDescriptor::new("n1/tcp".parse().unwrap(), "tcp")
            .with_options(json!({ "target": target.to_string() })),
    ))
    .build()
    .await
    .unwrap();
    let (mut tunnel, connecting) = mesh.connect("n1/tcp".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    tunnel.write_all(b"over tcp").await.unwrap();
    tunnel.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    tunnel.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"over tcp");
}

#[tokio::test]
async fn through_forwards_to_pass() {
    let meshes = chain(&["n1", "n2"]).await;
    meshes[1]
        .register("echo", Arc::new(Echo), Value::Null)
        .await
        .unwrap();
    let n1 = &meshes[0];
    n1.create(
        ComponentDescriptor::new("n1/via".parse().unwrap(), "through")
            .with_options(json!({ "pass": "n2/echo" })),
    )
    .await
    .unwrap();
    eventually("n1 to reach n2", || async move {
        n1.find_next_hop("n2").await.unwrap().is_some()
    })
    .await;
    // on_ready runs on its own task
    tokio::time::sleep(Duration::from_millis(20)).await;

    let (mut tunnel, connecting) = n1.connect("n1/via".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    tunnel.write_all(b"round trip").await.unwrap();
    tunnel.shutdown().await.unwrap();
    let mut echoed = Vec::new();
    tunnel.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"round trip");

    let err = n1
        .create(ComponentDescriptor::new("n1/via".parse().unwrap(), "hole"))
        .await
        .unwrap_err();
    assert!(matches!(err, meshlink::error::Error::ComponentExists(_)));
}

#[tokio::test]
async fn stalled_tunnel_leaves_the_link_free() {
    let a = node("a").await;
    let (capture, mut inbound) = Capture::new();
    let b = Builder::new(config("b").set_tunnel_buffer(2))
        .component("stuck", capture)
        .component("echo", Arc::new(Echo))
        .build()
        .await
        .unwrap();
    link(&a, &b).await;
    let a = &a;
    eventually("a to reach b", || async move {
        a.find_next_hop("b").await.unwrap().is_some()
    })
    .await;

    let (mut stuck, connecting) = a.connect("b/stuck".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    let (_unread, _) = inbound.recv().await.unwrap();
    let writer = tokio::spawn(async move {
        let chunk = [0x5a; 1024];
        for _ in 0..100 {
            if stuck.write_all(&chunk).await.is_err() {
                break;
            }
        }
        stuck
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!writer.is_finished());

    let round_trip = async {
        let (mut tunnel, connecting) = a.connect("b/echo".parse().unwrap(), Default::default());
        connecting.await.unwrap();
        tunnel.write_all(b"still moving").await.unwrap();
        tunnel.shutdown().await.unwrap();
        let mut echoed = Vec::new();
        tunnel.read_to_end(&mut echoed).await.unwrap();
        echoed
    };
    let echoed = tokio::time::timeout(Duration::from_secs(3), round_trip)
        .await
        .expect("echo behind a stalled tunnel");
    assert_eq!(echoed, b"still moving");
    writer.abort();
}

#[tokio::test]
async fn failed_build_releases_its_listeners() {
    let addr = {
        let spare = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        spare.local_addr().unwrap()
    };
    let rs = Builder::new(config("n1").add_component(
        ComponentDescriptor::new("n1/t".parse().unwrap(), "tcp")
            .with_options(json!({ "listen": addr.to_string(), "pass": "n1/x" })),
    ))
    .component("t", Arc::new(Echo))
    .build()
    .await;
    assert!(matches!(
        rs,
        Err(meshlink::error::Error::ComponentExists(name)) if name.to_string() == "n1/t"
    ));
    // the tcp component would have bound well within this
    tokio::time::sleep(Duration::from_millis(100)).await;
    eventually("the listen port to be free", || async move {
        tokio::net::TcpListener::bind(addr).await.is_ok()
    })
    .await;
}

#[tokio::test]
async fn chunks_must_fit_in_a_frame() {
    let rs = Builder::new(config("n1").set_max_frame(1024).set_max_chunk(4096))
        .build()
        .await;
    assert!(matches!(rs, Err(meshlink::error::Error::InvalidConfig(_))));
    let rs = Builder::new(config("n1").set_max_chunk(0)).build().await;
    assert!(matches!(rs, Err(meshlink::error::Error::InvalidConfig(_))));
}

#[tokio::test]
async fn small_frames_carry_large_writes() {
    let small = |name: &str| {
        config(name)
            .set_max_frame(1024)
            .set_max_chunk(1024 - DATA_FRAME_OVERHEAD)
    };
    let a = Builder::new(small("a")).build().await.unwrap();
    let b = Builder::new(small("b"))
        .component("echo", Arc::new(Echo))
        .build()
        .await
        .unwrap();
    link(&a, &b).await;
    let a = &a;
    eventually("a to reach b", || async move {
        a.find_next_hop("b").await.unwrap().is_some()
    })
    .await;

    let payload: Vec<u8> = (0..=255u8).cycle().take(20_000).collect();
    let (tunnel, connecting) = a.connect("b/echo".parse().unwrap(), Default::default());
    connecting.await.unwrap();
    let (mut reader, mut writer) = tokio::io::split(tunnel);
    let sent = payload.clone();
    let sending = tokio::spawn(async move {
        writer.write_all(&sent).await.unwrap();
        writer.shutdown().await.unwrap();
        writer
    });
    let mut echoed = Vec::new();
    reader.read_to_end(&mut echoed).await.unwrap();
    let _writer = sending.await.unwrap();
    assert!(echoed == payload);
}
