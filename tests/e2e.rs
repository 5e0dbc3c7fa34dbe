//! End-to-end tests: two real peers over localhost TCP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use peerwire::{
    CallOpts, Peer, PeerConfig, PullCtx, PullGroup, PushGroup, Status, WireError,
};

/// Spawn `peer.listen()` and wait for the bound address.
async fn serve(peer: &Peer) -> String {
    let p = peer.clone();
    tokio::spawn(async move {
        let _ = p.listen().await;
    });
    for _ in 0..200 {
        if let Some(addr) = peer.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("listener did not come up");
}

fn listening_config() -> PeerConfig {
    PeerConfig {
        listen_address: "127.0.0.1:0".to_string(),
        ..Default::default()
    }
}

/// A server with the /math/add handler that optionally pushes
/// /push/status back to the caller before replying.
fn math_server() -> Peer {
    let server = Peer::new(listening_config()).unwrap();
    server
        .route_pull(
            PullGroup::new("/math").handler("Add", |ctx: PullCtx, args: Vec<i64>| async move {
                if ctx.query_value("push_status") == Some("yes") {
                    let text = format!("numbers {:?} are being added...", args);
                    ctx.session()
                        .push("/push/status", &text)
                        .await
                        .map_err(|e| WireError::with_cause(Status::INTERNAL_SERVER_ERROR, e))?;
                    tokio::time::sleep(Duration::from_millis(100)).await;
                }
                Ok::<i64, WireError>(args.iter().sum())
            }),
        )
        .unwrap();
    server
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pull_with_push_status() {
    let server = math_server();
    let addr = serve(&server).await;

    let pushes = Arc::new(AtomicUsize::new(0));
    let client = Peer::new(PeerConfig::default()).unwrap();
    {
        let pushes = pushes.clone();
        client
            .route_push(
                PushGroup::new("/push").handler("Status", move |_ctx, text: String| {
                    let pushes = pushes.clone();
                    async move {
                        assert!(text.contains("are being added"));
                        pushes.fetch_add(1, Ordering::SeqCst);
                        Ok(())
                    }
                }),
            )
            .unwrap();
    }

    let session = client.dial(&addr).await.unwrap();
    let reply: i64 = session
        .pull("/math/add?push_status=yes", &vec![1i64, 2, 3, 4, 5])
        .await
        .unwrap()
        .result()
        .await
        .unwrap();

    assert_eq!(reply, 15);
    // The handler pushed, then slept 100ms before replying, so the push
    // handler ran before the pull completed - exactly once.
    assert_eq!(pushes.load(Ordering::SeqCst), 1);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unregistered_path_replies_not_found() {
    let server = math_server();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    let err = session
        .pull::<_, i64>("/math/subtract", &vec![1i64])
        .await
        .unwrap()
        .result()
        .await
        .unwrap_err();

    assert!(err.is(Status::NOT_FOUND));
    assert!(session.health());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn handler_panic_becomes_internal_error() {
    let server = Peer::new(listening_config()).unwrap();
    server
        .route_pull(
            PullGroup::new("/chaos")
                .handler("Boom", |_ctx, _: ()| async move {
                    panic!("handler exploded");
                    #[allow(unreachable_code)]
                    Ok::<i32, WireError>(0)
                })
                .handler("Calm", |_ctx, n: i32| async move { Ok::<i32, WireError>(n) }),
        )
        .unwrap();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    let err = session
        .pull::<_, i32>("/chaos/boom", &())
        .await
        .unwrap()
        .result()
        .await
        .unwrap_err();
    assert!(err.is(Status::INTERNAL_SERVER_ERROR));

    // The server session survived the panic.
    let reply: i32 = session
        .pull("/chaos/calm", &7i32)
        .await
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(reply, 7);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn context_age_expires_pull() {
    let server = Peer::new(listening_config()).unwrap();
    server
        .route_pull(
            PullGroup::new("/slow").handler("Nap", |_ctx, _: ()| async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                Ok::<i32, WireError>(1)
            }),
        )
        .unwrap();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig {
        default_context_age: Duration::from_millis(50),
        ..Default::default()
    })
    .unwrap();
    let session = client.dial(&addr).await.unwrap();

    let start = Instant::now();
    let err = session
        .pull::<_, i32>("/slow/nap", &())
        .await
        .unwrap()
        .result()
        .await
        .unwrap_err();
    let elapsed = start.elapsed();

    assert!(err.is(Status::DEADLINE_EXCEEDED));
    assert!(elapsed >= Duration::from_millis(45));
    assert!(elapsed < Duration::from_millis(150), "expired at {:?}", elapsed);

    // The server's late reply arrives around 200ms and is dropped
    // silently; the session stays usable.
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert!(session.health());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn close_fails_pending_pull_with_conn_closed() {
    let server = Peer::new(listening_config()).unwrap();
    server
        .route_pull(
            PullGroup::new("/slow").handler("Forever", |_ctx, _: ()| async move {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok::<i32, WireError>(1)
            }),
        )
        .unwrap();
    let addr = serve(&server).await;

    // No context age: the close grace is the built-in hard deadline.
    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    let cmd = session
        .pull::<_, i32>("/slow/forever", &())
        .await
        .unwrap();

    let closer = {
        let session = session.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            // The pending pull cannot finish within the grace, so close
            // cancels it and still returns promptly.
            tokio::time::timeout(Duration::from_secs(5), session.close())
                .await
                .expect("close did not return")
                .unwrap();
        })
    };

    // close() cancels the pull long before the 30s handler finishes.
    let err = tokio::time::timeout(Duration::from_secs(10), cmd.result())
        .await
        .expect("pull never completed")
        .unwrap_err();
    assert!(err.is(Status::CONN_CLOSED));

    closer.await.unwrap();
    assert_eq!(session.state(), peerwire::SessionState::Closed);
    assert!(!session.health());
    // New pulls fail fast on a closed session.
    assert!(session.pull::<_, i32>("/slow/forever", &()).await.is_err());

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn gzip_round_trips_large_body() {
    let server = Peer::new(listening_config()).unwrap();
    server
        .route_pull(
            PullGroup::new("/blob").handler("Echo", |_ctx, body: String| async move {
                Ok::<String, WireError>(body)
            }),
        )
        .unwrap();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    // 100 KiB of compressible text.
    let payload = "all work and no play makes a dull peer ".repeat(2700);
    assert!(payload.len() > 100 * 1024);

    let reply: String = session
        .pull_with("/blob/echo", &payload, CallOpts::gzip())
        .await
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(reply, payload);

    // The wire body (what the session actually sent) is the packed form
    // of the encoded payload; compression must have occurred.
    let encoded = serde_json::to_vec(&payload).unwrap();
    let on_wire = peerwire::xfer::pack(&[b'g'], encoded.clone()).unwrap();
    assert!(on_wire.len() < encoded.len());
    assert!(on_wire.len() < 100 * 1024);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn push_to_unregistered_path_is_dropped() {
    let server = math_server();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    // No /nowhere push route and no unknown handler: the server drops it.
    session.push("/nowhere", &"lost".to_string()).await.unwrap();

    // The connection is unaffected.
    let reply: i64 = session
        .pull("/math/add", &vec![2i64, 3])
        .await
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(reply, 5);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn unknown_handler_receives_raw_bytes() {
    let server = Peer::new(listening_config()).unwrap();
    server
        .set_unknown_pull(|ctx| async move {
            let (codec, numbers): (&str, Vec<i64>) = ctx
                .bind()
                .map_err(|e| WireError::with_cause(Status::BAD_PACKET, e))?;
            assert_eq!(codec, "json");
            Ok::<String, WireError>(format!("{}:{}", ctx.path(), numbers.len()))
        })
        .unwrap();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    let reply: String = session
        .pull("/not/registered", &vec![1i64, 2, 3])
        .await
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(reply, "/not/registered:3");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn msgpack_body_codec_per_call() {
    let server = math_server();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    let opts = CallOpts {
        body_codec: Some("msgpack".to_string()),
        ..Default::default()
    };
    let reply: i64 = session
        .pull_with("/math/add", &vec![10i64, 20, 30], opts)
        .await
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(reply, 60);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn msgpack_wire_proto_interoperates() {
    let server = math_server();
    let addr = serve(&server).await;

    // The client frames its packets with the msgpack proto; the server
    // accepts any registered proto and mirrors it in the reply.
    let client = Peer::new(PeerConfig::default()).unwrap();
    client.set_default_proto("msgpack").unwrap();
    let session = client.dial(&addr).await.unwrap();

    let reply: i64 = session
        .pull("/math/add", &vec![4i64, 4])
        .await
        .unwrap()
        .result()
        .await
        .unwrap();
    assert_eq!(reply, 8);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn session_age_closes_idle_session() {
    let server = math_server();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig {
        default_session_age: Duration::from_millis(150),
        ..Default::default()
    })
    .unwrap();
    let session = client.dial(&addr).await.unwrap();
    assert!(session.health());

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(session.state(), peerwire::SessionState::Closed);

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn redial_reestablishes_after_remote_drop() {
    let server = Peer::new(listening_config()).unwrap();
    server
        .route_pull(
            PullGroup::new("/ctl")
                .handler("Drop", |ctx: PullCtx, _: ()| async move {
                    let sess = ctx.session().clone();
                    tokio::spawn(async move {
                        let _ = sess.close().await;
                    });
                    Ok::<i32, WireError>(0)
                })
                .handler("Ping", |_ctx, _: ()| async move { Ok::<i32, WireError>(1) }),
        )
        .unwrap();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig {
        redial_times: 3,
        default_dial_timeout: Duration::from_secs(2),
        ..Default::default()
    })
    .unwrap();
    let session = client.dial(&addr).await.unwrap();

    // Ask the server to drop the connection; the result races the drop,
    // so both a normal reply and a connection error are acceptable.
    let _ = session
        .pull::<_, i32>("/ctl/drop", &())
        .await
        .unwrap()
        .result()
        .await;

    // The session redials the same address; within the window it becomes
    // usable again with the same handle.
    let mut recovered = None;
    for _ in 0..50 {
        tokio::time::sleep(Duration::from_millis(50)).await;
        if !session.health() {
            continue;
        }
        if let Ok(cmd) = session.pull::<_, i32>("/ctl/ping", &()).await {
            if let Ok(n) = cmd.result().await {
                recovered = Some(n);
                break;
            }
        }
    }
    assert_eq!(recovered, Some(1), "session did not recover after redial");

    client.close().await.unwrap();
    server.close().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn replies_complete_out_of_order() {
    let server = Peer::new(listening_config()).unwrap();
    server
        .route_pull(
            PullGroup::new("/delay").handler("Echo", |_ctx, ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok::<u64, WireError>(ms)
            }),
        )
        .unwrap();
    let addr = serve(&server).await;

    let client = Peer::new(PeerConfig::default()).unwrap();
    let session = client.dial(&addr).await.unwrap();

    let slow = session.pull::<_, u64>("/delay/echo", &200u64).await.unwrap();
    let fast = session.pull::<_, u64>("/delay/echo", &10u64).await.unwrap();

    let start = Instant::now();
    let fast_reply = fast.result().await.unwrap();
    let fast_elapsed = start.elapsed();
    let slow_reply = slow.result().await.unwrap();

    assert_eq!(fast_reply, 10);
    assert_eq!(slow_reply, 200);
    // The fast pull completed while the slow handler was still running.
    assert!(fast_elapsed < Duration::from_millis(150));

    client.close().await.unwrap();
    server.close().await.unwrap();
}
