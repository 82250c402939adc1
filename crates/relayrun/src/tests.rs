// File: crates/relayrun/src/tests.rs
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use relaywire::Codec;
use relaywire::CodecType;
use relaywire::FrameCodec;
use relaywire::Header;
use relaywire::Options;
use relaywire::Serializer;
use serde::Deserialize;
use serde::Serialize;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWriteExt;
use tokio::io::DuplexStream;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::client;
use crate::client::Call;
use crate::client::Client;
use crate::dial;
use crate::discovery;
use crate::discovery::Discovery;
use crate::discovery::MultiServerDiscovery;
use crate::discovery::RegistryDiscovery;
use crate::discovery::SelectMode;
use crate::registry;
use crate::registry::Registry;
use crate::registry::RegistryConfig;
use crate::server;
use crate::server::Server;
use crate::server::ServerConfig;
use crate::service;
use crate::service::ServiceBuilder;
use crate::tunnel;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
struct Args {
    num1: i64,
    num2: i64,
}

struct Arith;

fn arith() -> service::Service {
    ServiceBuilder::new("Arith", Arith)
        .method("Sum", |_: &Arith, args: Args, reply: &mut i64| -> Result<(), String> {
            *reply = args.num1 + args.num2;
            Ok(())
        })
        .method("Fail", |_: &Arith, _: Args, _: &mut i64| -> Result<(), String> {
            Err("arith: refused".to_string())
        })
        .method("Tags", |_: &Arith, _: Args, _: &mut HashMap<String, u32>| -> Result<(), String> {
            Ok(())
        })
        .build()
        .unwrap()
}

/// A client wired to a bare codec that the test drives as the server.
fn engine() -> (Client, FrameCodec<DuplexStream>) {
    let opt = Options::default();
    let (a, b) = tokio::io::duplex(1 << 20);
    let client = Client::new(Arc::new(FrameCodec::new(a, &opt)), opt);
    (client, FrameCodec::new(b, &opt))
}

async fn reply_to(server: &FrameCodec<DuplexStream>, header: Header, value: impl Serialize) {
    let body = server.codec_type().marshal(&value).unwrap();
    server.write(&header, &body).await.unwrap();
}

// ============================================================================
//  CLIENT ENGINE
// ============================================================================

#[tokio::test]
async fn test_concurrent_go_uses_gap_free_sequences() {
    let (client, server) = engine();
    let (tx, mut rx) = tokio::sync::mpsc::channel::<Call<u64>>(64);

    let mut issued = Vec::new();
    for i in 0..50u64 {
        let client = client.clone();
        let tx = tx.clone();
        issued.push(tokio::spawn(async move { client.go("Echo.Double", &i, tx).await }));
    }

    let mut seen = BTreeSet::new();
    for _ in 0..50 {
        let header = server.read_header().await.unwrap();
        let _ = server.read_body().await.unwrap();
        seen.insert(header.seq);
        let seq = header.seq;
        reply_to(&server, header, seq * 2).await;
    }
    assert_eq!(seen, (1..=50).collect::<BTreeSet<u64>>());

    let mut returned = BTreeSet::new();
    for task in issued {
        returned.insert(task.await.unwrap());
    }
    assert_eq!(returned, seen);

    for _ in 0..50 {
        let call = rx.recv().await.unwrap();
        assert_eq!(call.service_method, "Echo.Double");
        assert_eq!(call.reply.unwrap(), call.seq * 2);
    }
    assert_eq!(client.pending_len(), 0);
}

#[tokio::test]
async fn test_unknown_sequence_is_dropped() {
    let (client, server) = engine();

    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call::<_, String>(&CancellationToken::new(), "Echo.Say", "hi")
                .await
        })
    };

    let header = server.read_header().await.unwrap();
    let _ = server.read_body().await.unwrap();
    reply_to(&server, Header::request("Echo.Say", 999), "stray").await;
    reply_to(&server, header, "hi back").await;

    assert_eq!(caller.await.unwrap().unwrap(), "hi back");
}

#[tokio::test]
async fn test_remote_error_is_verbatim() {
    let (client, server) = engine();

    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call::<_, i64>(&CancellationToken::new(), "Arith.Sum", &Args::default())
                .await
        })
    };

    let header = server.read_header().await.unwrap();
    let _ = server.read_body().await.unwrap();
    server.write(&header.with_error("arith: overflow"), &[]).await.unwrap();

    assert_eq!(caller.await.unwrap(), Err(client::Error::Remote("arith: overflow".into())));
}

#[tokio::test]
async fn test_undecodable_reply_fails_only_that_call() {
    let (client, server) = engine();
    let ctx = CancellationToken::new();

    let caller = {
        let client = client.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { client.call::<_, u64>(&ctx, "Echo.Say", "hi").await })
    };
    let header = server.read_header().await.unwrap();
    let _ = server.read_body().await.unwrap();
    reply_to(&server, header, "not a number").await;
    assert!(matches!(caller.await.unwrap(), Err(client::Error::Decode(_))));

    assert!(client.is_available());
}

#[tokio::test]
async fn test_connection_loss_fails_every_pending_call() {
    let (client, server) = engine();
    let (tx, mut rx) = Call::<i64>::channel();

    for _ in 0..3 {
        assert_ne!(client.go("Arith.Sum", &Args::default(), tx.clone()).await, 0);
    }
    for _ in 0..3 {
        server.read_header().await.unwrap();
        server.read_body().await.unwrap();
    }
    drop(server);

    for _ in 0..3 {
        let call = rx.recv().await.unwrap();
        assert!(matches!(call.reply, Err(client::Error::ConnectionShutdown(_))), "{:?}", call.reply);
    }
    assert!(!client.is_available());
    assert_eq!(client.pending_len(), 0);

    // later calls fail locally without a sequence
    assert_eq!(client.go("Arith.Sum", &Args::default(), tx).await, 0);
    assert_eq!(rx.recv().await.unwrap().reply, Err(client::Error::Shutdown));
}

#[tokio::test]
async fn test_canceled_call_returns_and_late_reply_is_dropped() {
    let (client, server) = engine();
    let ctx = CancellationToken::new();

    let caller = {
        let client = client.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { client.call::<_, i64>(&ctx, "Arith.Sum", &Args::default()).await })
    };

    let late = server.read_header().await.unwrap();
    let _ = server.read_body().await.unwrap();
    ctx.cancel();
    assert_eq!(caller.await.unwrap(), Err(client::Error::Canceled));
    assert_eq!(client.pending_len(), 0);

    reply_to(&server, late, 1i64).await;

    let caller = {
        let client = client.clone();
        tokio::spawn(async move {
            client
                .call::<_, i64>(&CancellationToken::new(), "Arith.Sum", &Args { num1: 2, num2: 3 })
                .await
        })
    };
    let header = server.read_header().await.unwrap();
    assert_eq!(header.seq, 2);
    let _ = server.read_body().await.unwrap();
    reply_to(&server, header, 5i64).await;
    assert_eq!(caller.await.unwrap(), Ok(5));
}

#[tokio::test]
async fn test_close_is_reported_once() {
    let (client, _server) = engine();
    assert!(client.is_available());
    client.close().await.unwrap();
    assert!(!client.is_available());
    assert_eq!(client.close().await, Err(client::Error::Shutdown));

    let err = client
        .call::<_, i64>(&CancellationToken::new(), "Arith.Sum", &Args::default())
        .await
        .unwrap_err();
    assert_eq!(err, client::Error::Shutdown);
}

#[tokio::test]
async fn test_cancel_while_queued_behind_a_stalled_write() {
    let opt = Options::default();
    // the far side never reads, so a large frame fills the pipe and stalls
    let (a, _far) = tokio::io::duplex(64);
    let client = Client::new(Arc::new(FrameCodec::new(a, &opt)), opt);

    let (tx, _rx) = Call::<u64>::channel();
    let stalled = {
        let client = client.clone();
        tokio::spawn(async move { client.go("Bulk.Store", &vec![1u8; 64 * 1024], tx).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!stalled.is_finished());

    let ctx = CancellationToken::new();
    let queued = {
        let client = client.clone();
        let ctx = ctx.clone();
        tokio::spawn(async move { client.call::<_, i64>(&ctx, "Arith.Sum", &Args::default()).await })
    };
    tokio::time::sleep(Duration::from_millis(20)).await;
    assert!(!queued.is_finished());

    ctx.cancel();
    let canceled = tokio::time::timeout(Duration::from_secs(1), queued).await.unwrap().unwrap();
    assert_eq!(canceled, Err(client::Error::Canceled));
    // only the stalled call was ever registered
    assert_eq!(client.pending_len(), 1);
    stalled.abort();
}

// ============================================================================
//  SERVICES
// ============================================================================

#[test]
fn test_service_names_are_validated() {
    let err = ServiceBuilder::new("Ar.ith", Arith)
        .method("Sum", |_: &Arith, _: Args, _: &mut i64| -> Result<(), String> { Ok(()) })
        .build()
        .unwrap_err();
    assert_eq!(err, service::Error::InvalidName("Ar.ith".into()));

    let err = ServiceBuilder::new("Arith", Arith).build().unwrap_err();
    assert!(matches!(err, service::Error::NoMethods(_)));
}

#[test]
fn test_bad_and_duplicate_methods_are_skipped() {
    let service = ServiceBuilder::new("Arith", Arith)
        .method("Sum", |_: &Arith, _: Args, reply: &mut i64| -> Result<(), String> {
            *reply = 1;
            Ok(())
        })
        .method("Sum", |_: &Arith, _: Args, reply: &mut i64| -> Result<(), String> {
            *reply = 2;
            Ok(())
        })
        .method("", |_: &Arith, _: Args, _: &mut i64| -> Result<(), String> { Ok(()) })
        .method("Sum.Again", |_: &Arith, _: Args, _: &mut i64| -> Result<(), String> { Ok(()) })
        .build()
        .unwrap();

    let names: Vec<_> = service.methods().map(|m| m.name().to_string()).collect();
    assert_eq!(names, vec!["Sum"]);
    assert!(service.method("Sum").unwrap().arg_type().ends_with("Args"));
}

#[tokio::test]
async fn test_method_invocation_counts_and_defaults() {
    let service = arith();
    let codec = CodecType::MsgPack;

    let sum = service.method("Sum").unwrap();
    let body = codec.marshal(&Args { num1: 20, num2: 22 }).unwrap();
    let reply = sum.invoke(&body, codec).unwrap().await.unwrap().unwrap();
    assert_eq!(codec.unmarshal::<i64>(&reply).unwrap(), 42);
    assert_eq!(sum.num_calls(), 1);

    // maps start empty, not absent
    let tags = service.method("Tags").unwrap();
    let reply = tags.invoke(&body, codec).unwrap().await.unwrap().unwrap();
    assert!(codec.unmarshal::<HashMap<String, u32>>(&reply).unwrap().is_empty());

    let fail = service.method("Fail").unwrap();
    let err = fail.invoke(&body, codec).unwrap().await.unwrap().unwrap_err();
    assert_eq!(err, "arith: refused");

    // arguments that do not decode never run the method
    let bad = codec.marshal("nope").unwrap();
    assert!(sum.invoke(&bad, codec).is_err());
    assert_eq!(sum.num_calls(), 1);
}

#[tokio::test]
async fn test_async_methods_run_on_the_runtime() {
    struct Clock {
        offset: u64,
    }
    let service = ServiceBuilder::new("Clock", Clock { offset: 10 })
        .async_method("After", |clock: Arc<Clock>, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(clock.offset + ms)
        })
        .build()
        .unwrap();

    let codec = CodecType::Json;
    let after = service.method("After").unwrap();
    let reply = after
        .invoke(&codec.marshal(&5u64).unwrap(), codec)
        .unwrap()
        .await
        .unwrap()
        .unwrap();
    assert_eq!(codec.unmarshal::<u64>(&reply).unwrap(), 15);
}

// ============================================================================
//  SERVER
// ============================================================================

#[test]
fn test_register_and_resolve() {
    let server = Server::default();
    server.register(arith()).unwrap();
    assert_eq!(server.register(arith()), Err(server::Error::DuplicateService("Arith".into())));

    let (service, method) = server.find_service("Arith.Sum").unwrap();
    assert_eq!(service.name(), "Arith");
    assert_eq!(method.name(), "Sum");

    assert_eq!(
        server.find_service("ArithSum").unwrap_err(),
        server::Error::MalformedServiceMethod("ArithSum".into())
    );
    assert_eq!(
        server.find_service("Nope.Sum").unwrap_err(),
        server::Error::ServiceNotFound("Nope".into())
    );
    assert_eq!(
        server.find_service("Arith.Nope").unwrap_err(),
        server::Error::MethodNotFound("Nope".into())
    );

    let stats = server.stats();
    assert_eq!(stats["Arith"]["Sum"], 0);
    assert_eq!(stats["Arith"].len(), 3);
}

#[tokio::test]
async fn test_unresolved_request_keeps_connection_aligned() {
    let server = Server::default();
    server.register(arith()).unwrap();

    let (mut near, far) = tokio::io::duplex(1 << 16);
    let serving = tokio::spawn({
        let server = server.clone();
        async move { server.serve_conn(far).await }
    });

    let opt = Options::default();
    opt.write_to(&mut near).await.unwrap();
    let codec = FrameCodec::new(near, &opt);
    let args = codec.codec_type().marshal(&Args { num1: 1, num2: 2 }).unwrap();

    codec.write(&Header::request("Nope.Sum", 1), &args).await.unwrap();
    codec.write(&Header::request("Arith.Sum", 2), &args).await.unwrap();

    let mut answers = HashMap::new();
    for _ in 0..2 {
        let header = codec.read_header().await.unwrap();
        let body = codec.read_body().await.unwrap();
        answers.insert(header.seq, (header, body));
    }

    let (rejected, _) = &answers[&1];
    assert_eq!(rejected.error, "rpc server: can't find service Nope");
    let (served, body) = &answers[&2];
    assert!(!served.is_error());
    assert_eq!(codec.codec_type().unmarshal::<i64>(body).unwrap(), 3);

    codec.close().await.unwrap();
    drop(codec);
    serving.await.unwrap();
    assert_eq!(server.stats()["Arith"]["Sum"], 1);
}

#[tokio::test]
async fn test_bad_handshake_is_dropped_silently() {
    let server = Server::default();
    let (mut near, far) = tokio::io::duplex(1 << 10);

    let mut bytes = Options::default().encode();
    bytes[0..4].copy_from_slice(&0x1234u32.to_be_bytes());
    near.write_all(&bytes).await.unwrap();

    server.serve_conn(far).await;

    let mut buf = Vec::new();
    let read = near.read_to_end(&mut buf).await.unwrap();
    assert_eq!(read, 0);
}

#[tokio::test]
async fn test_handle_timeout_answers_without_waiting() {
    let server = Server::new(ServerConfig {
        handle_timeout: Duration::from_millis(50),
        ..ServerConfig::default()
    });
    let slow = ServiceBuilder::new("Slow", ())
        .async_method("Nap", |_: Arc<()>, ms: u64| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok::<_, String>(ms)
        })
        .build()
        .unwrap();
    server.register(slow).unwrap();

    let (near, far) = tokio::io::duplex(1 << 16);
    let opt = Options::default();
    let serve = {
        let server = server.clone();
        tokio::spawn(async move {
            let codec: Arc<dyn Codec> = Arc::new(FrameCodec::new(far, &opt));
            server.serve_codec(codec, Duration::from_millis(50)).await
        })
    };

    let client = Client::new(Arc::new(FrameCodec::new(near, &opt)), opt);
    let ctx = CancellationToken::new();

    let err = client.call::<_, u64>(&ctx, "Slow.Nap", &500u64).await.unwrap_err();
    match err {
        client::Error::Remote(msg) => assert!(msg.contains("handle timeout"), "{}", msg),
        other => panic!("expected handle timeout, got {:?}", other),
    }
    assert_eq!(client.call::<_, u64>(&ctx, "Slow.Nap", &1u64).await, Ok(1));

    client.close().await.unwrap();
    serve.await.unwrap();
}

// ============================================================================
//  TUNNEL
// ============================================================================

#[tokio::test]
async fn test_tunnel_connect_and_accept() {
    let (mut near, mut far) = tokio::io::duplex(1 << 10);
    let accepting = tokio::spawn(async move {
        let ok = tunnel::accept(&mut far, tunnel::DEFAULT_RPC_PATH).await.unwrap();
        (ok, far)
    });

    let connected = tunnel::connect(&mut near, tunnel::DEFAULT_RPC_PATH).await.unwrap();
    assert_eq!(connected, Ok(()));
    let (ok, _far) = accepting.await.unwrap();
    assert!(ok);
}

#[tokio::test]
async fn test_tunnel_refuses_plain_http() {
    let (mut near, mut far) = tokio::io::duplex(1 << 10);
    let accepting = tokio::spawn(async move { tunnel::accept(&mut far, "/_rpc_").await.unwrap() });

    near.write_all(b"GET /_rpc_ HTTP/1.0\r\n\r\n").await.unwrap();
    let head = tunnel::read_head(&mut near).await.unwrap();
    assert!(head.starts_with("HTTP/1.0 405"), "{}", head);
    assert!(!accepting.await.unwrap());
}

#[tokio::test]
async fn test_tunnel_rejects_wrong_status() {
    let (mut near, mut far) = tokio::io::duplex(1 << 10);
    let accepting = tokio::spawn(async move { tunnel::accept(&mut far, "/elsewhere").await.unwrap() });

    let connected = tunnel::connect(&mut near, "/_rpc_").await.unwrap();
    assert_eq!(connected, Err("HTTP/1.0 404 Not Found".to_string()));
    assert!(!accepting.await.unwrap());
}

#[test]
fn test_default_rpc_path() {
    assert_eq!(tunnel::DEFAULT_RPC_PATH, "/_rpc_");
    assert_eq!(ServerConfig::default().rpc_path, "/_rpc_");
}

#[tokio::test]
async fn test_dial_gives_up_and_orphan_closes_itself() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    // answers the CONNECT only after the dialer stopped waiting
    let slow = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let head = tunnel::read_head(&mut stream).await.unwrap();
        assert!(head.starts_with("CONNECT /_rpc_ "), "{}", head);
        tokio::time::sleep(Duration::from_millis(300)).await;
        let response = format!("HTTP/1.0 {}\n\n", tunnel::CONNECTED);
        stream.write_all(response.as_bytes()).await.unwrap();

        let opt = Options::read_from(&mut stream).await.unwrap();
        let mut rest = Vec::new();
        let drained = tokio::time::timeout(Duration::from_secs(2), stream.read_to_end(&mut rest)).await;
        (opt, drained.map(|read| read.is_ok()))
    });

    let timeout = Duration::from_millis(100);
    let err = dial::dial_http(&addr, Options::default().with_connect_timeout(timeout))
        .await
        .unwrap_err();
    assert_eq!(err, client::Error::ConnectTimeout(timeout));

    let (opt, drained) = slow.await.unwrap();
    assert_eq!(opt.connect_timeout, timeout);
    assert_eq!(drained, Ok(true), "orphaned client kept its connection open");
}

// ============================================================================
//  DISCOVERY & REGISTRY
// ============================================================================

#[tokio::test]
async fn test_round_robin_cycles_from_seed() {
    let servers = vec!["tcp@a:1".to_string(), "tcp@b:2".to_string()];
    let d = MultiServerDiscovery::with_index(servers.clone(), 1);
    let picks: Vec<_> = {
        let mut picks = Vec::new();
        for _ in 0..4 {
            picks.push(d.get(SelectMode::RoundRobin).await.unwrap());
        }
        picks
    };
    assert_eq!(picks, vec!["tcp@b:2", "tcp@a:1", "tcp@b:2", "tcp@a:1"]);

    // a random seed still visits each address once per lap
    let d = MultiServerDiscovery::new(servers.clone());
    for _ in 0..5 {
        let first = d.get(SelectMode::RoundRobin).await.unwrap();
        let second = d.get(SelectMode::RoundRobin).await.unwrap();
        assert_ne!(first, second);
    }
}

#[tokio::test]
async fn test_random_picks_and_empty_lists() {
    let d = MultiServerDiscovery::new(Vec::new());
    assert_eq!(d.get(SelectMode::Random).await, Err(discovery::Error::NoServers));
    assert_eq!(d.get(SelectMode::RoundRobin).await, Err(discovery::Error::NoServers));
    assert!(d.get_all().await.unwrap().is_empty());

    let servers = vec!["tcp@a:1".to_string(), "tcp@b:2".to_string(), "tcp@c:3".to_string()];
    d.update(servers.clone()).await.unwrap();
    d.refresh().await.unwrap();
    for _ in 0..20 {
        assert!(servers.contains(&d.get(SelectMode::Random).await.unwrap()));
    }
    assert_eq!(d.get_all().await.unwrap(), servers);
}

#[test]
fn test_parse_server_list() {
    assert_eq!(
        discovery::parse_servers(" tcp@a:1, http@b:2 ,,"),
        vec!["tcp@a:1".to_string(), "http@b:2".to_string()]
    );
    assert!(discovery::parse_servers("").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_registry_expires_silent_servers() {
    let timeout = Duration::from_secs(30);
    let registry = Registry::new(RegistryConfig {
        timeout,
        ..RegistryConfig::default()
    });

    registry.put_server("tcp@b:2");
    registry.put_server("tcp@a:1");
    assert_eq!(registry.alive_servers(), vec!["tcp@a:1", "tcp@b:2"]);

    tokio::time::advance(timeout - Duration::from_millis(1)).await;
    registry.put_server("tcp@b:2");
    assert_eq!(registry.alive_servers(), vec!["tcp@a:1", "tcp@b:2"]);

    tokio::time::advance(Duration::from_millis(1)).await;
    assert_eq!(registry.alive_servers(), vec!["tcp@b:2"]);
}

#[tokio::test(start_paused = true)]
async fn test_registry_zero_timeout_never_expires() {
    let registry = Registry::new(RegistryConfig {
        timeout: Duration::ZERO,
        ..RegistryConfig::default()
    });
    registry.put_server("tcp@a:1");
    tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
    assert_eq!(registry.alive_servers(), vec!["tcp@a:1"]);
}

#[tokio::test(start_paused = true)]
async fn test_registry_unbounded_timeout_keeps_servers() {
    let registry = Registry::new(RegistryConfig {
        timeout: Duration::MAX,
        ..RegistryConfig::default()
    });
    registry.put_server("tcp@a:1");
    tokio::time::advance(Duration::from_secs(24 * 60 * 60)).await;
    assert_eq!(registry.alive_servers(), vec!["tcp@a:1"]);
}

#[tokio::test]
async fn test_registry_discovery_unbounded_interval_stays_fresh() {
    // nothing listens here; a fetch would fail
    let d = RegistryDiscovery::new("http://127.0.0.1:1/_rpc_/registry", Duration::MAX);
    let servers = vec!["tcp@a:1".to_string(), "tcp@b:2".to_string()];
    d.update(servers.clone()).await.unwrap();

    d.refresh().await.unwrap();
    assert_eq!(d.get_all().await.unwrap(), servers);
    assert!(servers.contains(&d.get(SelectMode::Random).await.unwrap()));
}

#[tokio::test]
async fn test_heartbeat_retries_after_a_failed_post() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}{}", listener.local_addr().unwrap(), registry::DEFAULT_REGISTRY_PATH);
    let (heads_tx, mut heads) = tokio::sync::mpsc::unbounded_channel();

    // a registry that fails the first heartbeat and accepts the rest
    let responder = tokio::spawn(async move {
        let mut served = 0;
        while let Ok((mut stream, _)) = listener.accept().await {
            let Ok(head) = tunnel::read_head(&mut stream).await else {
                continue;
            };
            let status = if served == 0 { "500 Internal Server Error" } else { "200 OK" };
            served += 1;
            let response = format!("HTTP/1.1 {}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n", status);
            let _ = stream.write_all(response.as_bytes()).await;
            let _ = heads_tx.send(head);
        }
    });

    let beat = registry::heartbeat(url, "tcp@a:1", Duration::from_millis(50));
    for _ in 0..2 {
        let head = tokio::time::timeout(Duration::from_secs(5), heads.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(head.starts_with("POST /_rpc_/registry "), "{}", head);
        assert!(head.to_lowercase().contains("x-rpc-server: tcp@a:1"), "{}", head);
    }

    beat.abort();
    responder.abort();
}
