/* This Source Code Form is subject to the terms of the Mozilla Public
 * License, v. 2.0. If a copy of the MPL was not distributed with this
 * file, You can obtain one at https://mozilla.org/MPL/2.0/.
 *
 * (c)2021 ZeroTier, Inc.
 * https://www.zerotier.com/
 */

use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::time::timeout;

use wirebus::{
    handler, make_ok_msg, sync_handler, AuthErrorHandler, AuthFields, AuthPlugin, Backoff, Body,
    CipherPlugin, ClientContext, Error, HmacAuthPlugin, Message, MessageType, MessageTypeTable,
    NodeConfig, Peer, ReceiveOptions, SendOptions, ServerContext, Sha256StreamCipherPlugin,
    TcpClient, TcpServer,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt().with_max_level(tracing::Level::DEBUG).try_init();
}

async fn start_server(server: &TcpServer) -> SocketAddr {
    let s = server.clone();
    tokio::spawn(async move {
        let _ = s.start().await;
    });
    for _ in 0..200 {
        if let Some(addr) = server.local_addr() {
            return addr;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("server did not bind");
}

fn client_for(addr: SocketAddr) -> TcpClient {
    TcpClient::new(NodeConfig::new("127.0.0.1", addr.port()))
}

async fn recv(client: &TcpClient, opts: ReceiveOptions) -> Option<Message> {
    timeout(Duration::from_secs(2), client.receive_once(opts))
        .await
        .expect("receive timed out")
        .expect("receive failed")
}

#[tokio::test]
async fn echo_over_hmac_and_stream_cipher() {
    init_tracing();
    let auth: Arc<dyn AuthPlugin> = Arc::new(HmacAuthPlugin::new("test"));
    let cipher: Arc<dyn CipherPlugin> = Arc::new(Sha256StreamCipherPlugin::new("test"));

    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.set_auth_plugin(Some(auth.clone()));
    server.set_cipher_plugin(Some(cipher.clone()));

    let server_log: Arc<Mutex<Vec<Message>>> = Arc::new(Mutex::new(Vec::new()));
    let log = server_log.clone();
    server.on(
        (MessageType::PublishUri, &b"echo"[..]),
        handler(move |message: Message, _ctx: ServerContext| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(message);
                Some(make_ok_msg(&b"echo"[..], &b"hello"[..]))
            }
        }),
    );
    let addr = start_server(&server).await;

    let client = client_for(addr);
    client.set_auth_plugin(Some(auth));
    client.set_cipher_plugin(Some(cipher));
    client.connect().await.unwrap();

    client.publish(&b"echo"[..], &b"hello"[..], SendOptions::default()).await.unwrap();
    let response = recv(&client, ReceiveOptions::default()).await.expect("no response");
    assert_eq!(response.kind(), Some(MessageType::Ok));
    assert_eq!(response.body, Body::prepare(&b"echo"[..], &b"hello"[..]));

    let log = server_log.lock().unwrap();
    assert_eq!(log.len(), 1);
    assert_eq!(log[0].body, Body::prepare(&b"echo"[..], &b"hello"[..]));
    drop(log);

    client.close().await;
    server.stop();
}

#[tokio::test]
async fn subscribe_and_notify_two_clients() {
    init_tracing();
    let uri = &b"subscribe/test"[..];
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    let addr = start_server(&server).await;

    let mut clients = Vec::new();
    let mut receivers = Vec::new();
    for _ in 0..2 {
        let client = client_for(addr);
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Message>();
        client.on(
            (MessageType::NotifyUri, uri),
            handler(move |message: Message, _ctx: ClientContext| {
                let tx = tx.clone();
                async move {
                    let _ = tx.send(message);
                    None
                }
            }),
        );
        client.connect().await.unwrap();
        client.spawn_receive_loop();
        let confirm = client.subscribe(uri, Duration::from_secs(2)).await.unwrap();
        assert_eq!(confirm.kind(), Some(MessageType::ConfirmSubscribe));
        clients.push(client);
        receivers.push(rx);
    }
    assert_eq!(server.subscriber_count(uri), 2);

    // a third connected client that never subscribes
    let bystander = client_for(addr);
    let seen = Arc::new(AtomicUsize::new(0));
    let seen2 = seen.clone();
    bystander.on(
        MessageType::NotifyUri,
        handler(move |_m: Message, _ctx: ClientContext| {
            let seen = seen2.clone();
            async move {
                seen.fetch_add(1, Ordering::SeqCst);
                None
            }
        }),
    );
    bystander.connect().await.unwrap();
    bystander.spawn_receive_loop();

    let notice = Message::prepare(Body::prepare(uri, &b"hello"[..]), MessageType::NotifyUri);
    server.notify(uri, notice, SendOptions::default()).await.unwrap();

    for rx in receivers.iter_mut() {
        let m = timeout(Duration::from_secs(2), rx.recv()).await.unwrap().unwrap();
        assert_eq!(m.kind(), Some(MessageType::NotifyUri));
        assert_eq!(m.body.uri, Bytes::copy_from_slice(uri));
        // exactly one copy
        assert!(timeout(Duration::from_millis(200), rx.recv()).await.is_err());
    }
    assert_eq!(seen.load(Ordering::SeqCst), 0);

    // closing a subscriber sweeps it from every subscription set
    clients[0].close().await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.subscriber_count(uri) != 1 {
        assert!(Instant::now() < deadline, "subscription not swept on close");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    for client in &clients[1..] {
        client.close().await;
    }
    bystander.close().await;
    server.stop();
}

#[tokio::test]
async fn wrong_secret_is_rejected_before_dispatch() {
    init_tracing();
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.set_auth_plugin(Some(Arc::new(HmacAuthPlugin::new("test"))));
    server.set_cipher_plugin(Some(Arc::new(Sha256StreamCipherPlugin::new("test"))));

    let invoked = Arc::new(AtomicUsize::new(0));
    let counter = invoked.clone();
    server.on(
        (MessageType::PublishUri, &b"echo"[..]),
        handler(move |_m: Message, _ctx: ServerContext| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(make_ok_msg(&b"echo"[..], &b""[..]))
            }
        }),
    );
    let addr = start_server(&server).await;

    struct Recorder(tokio::sync::mpsc::UnboundedSender<Message>);

    #[async_trait::async_trait]
    impl AuthErrorHandler for Recorder {
        async fn handle_auth_error(&self, message: Message) {
            let _ = self.0.send(message);
        }
    }

    let client = client_for(addr);
    client.set_auth_plugin(Some(Arc::new(HmacAuthPlugin::new("wrong"))));
    client.set_cipher_plugin(Some(Arc::new(Sha256StreamCipherPlugin::new("test"))));
    let (tx, mut auth_errors) = tokio::sync::mpsc::unbounded_channel();
    client.set_auth_error_handler(Some(Arc::new(Recorder(tx))));
    client.connect().await.unwrap();

    client.publish(&b"echo"[..], &b"hello"[..], SendOptions::default()).await.unwrap();
    // the AUTH_ERROR reply is sent raw, outside the security pipeline
    let response = recv(&client, ReceiveOptions { use_auth: false, use_cipher: false })
        .await
        .expect("no auth error response");
    assert_eq!(response.kind(), Some(MessageType::AuthError));
    assert_eq!(invoked.load(Ordering::SeqCst), 0);

    // the configured callback saw the same response
    let reported = timeout(Duration::from_secs(1), auth_errors.recv()).await.unwrap().unwrap();
    assert_eq!(reported.kind(), Some(MessageType::AuthError));

    client.close().await;
    server.stop();
}

#[tokio::test]
async fn request_gets_not_found_then_times_out() {
    init_tracing();
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    // a route that never answers
    server.on(
        (MessageType::RequestUri, &b"/quiet"[..]),
        handler(|_m: Message, _ctx: ServerContext| async move { None }),
    );
    let addr = start_server(&server).await;

    let client = client_for(addr);
    client.connect().await.unwrap();
    client.spawn_receive_loop();

    // default handler answers NOT_FOUND under the request URI
    let response = client.request(&b"/missing"[..], Duration::from_millis(500)).await.unwrap();
    assert_eq!(response.kind(), Some(MessageType::NotFound));
    assert_eq!(response.body.uri, Bytes::from_static(b"/missing"));

    let started = Instant::now();
    let err = client.request(&b"/quiet"[..], Duration::from_millis(250)).await;
    let elapsed = started.elapsed();
    assert!(matches!(err, Err(Error::Timeout)));
    assert!(elapsed >= Duration::from_millis(200) && elapsed < Duration::from_secs(2));

    client.close().await;
    server.stop();
}

#[tokio::test]
async fn pending_request_cancelled_on_close() {
    init_tracing();
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.on(
        (MessageType::RequestUri, &b"/quiet"[..]),
        handler(|_m: Message, _ctx: ServerContext| async move { None }),
    );
    let addr = start_server(&server).await;

    let client = client_for(addr);
    client.connect().await.unwrap();
    client.spawn_receive_loop();

    let requester = client.clone();
    let pending =
        tokio::spawn(async move { requester.request(&b"/quiet"[..], Duration::from_secs(10)).await });
    tokio::time::sleep(Duration::from_millis(100)).await;
    client.close().await;

    let result = timeout(Duration::from_secs(2), pending).await.unwrap().unwrap();
    assert!(matches!(result, Err(Error::Cancelled)));
    server.stop();
}

#[tokio::test]
async fn automatic_peer_discovery_both_directions() {
    init_tracing();
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.set_local_peer(Some(Peer::new(&b"server"[..], &b"server-data"[..])));
    server.manage_peers_automatically();
    let addr = start_server(&server).await;

    let client = client_for(addr);
    client.set_local_peer(Some(Peer::new(&b"client"[..], &b"client-data"[..])));
    client.manage_peers_automatically();
    client.connect().await.unwrap();
    client.spawn_receive_loop();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if client.peers().get(b"server").is_some() && server.peers().get(b"client").is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "peer discovery did not complete");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let discovered_server = client.peers().get(b"server").unwrap();
    assert_eq!(discovered_server.data, Bytes::from_static(b"server-data"));
    assert_eq!(client.peers().len(), 1);

    let discovered_client = server.peers().get(b"client").unwrap();
    assert_eq!(discovered_client.data, Bytes::from_static(b"client-data"));
    assert_eq!(server.peers().len(), 1);

    // graceful close announces DISCONNECT and the server forgets the peer
    client.close().await;
    let deadline = Instant::now() + Duration::from_secs(2);
    while server.peers().get(b"client").is_some() {
        assert!(Instant::now() < deadline, "peer not removed on disconnect");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    server.stop();
}

#[tokio::test]
async fn server_advertises_immediately_to_connected_clients() {
    init_tracing();
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.set_local_peer(Some(Peer::new(&b"server"[..], &b"server-data"[..])));
    let addr = start_server(&server).await;

    // the client is fully connected before the server enables peer
    // management, so the exchange must be carried by the server's own
    // initial broadcast rather than the client's connect-time advertise
    let client = client_for(addr);
    client.set_local_peer(Some(Peer::new(&b"client"[..], &b"client-data"[..])));
    client.connect().await.unwrap();
    client.manage_peers_automatically();
    client.spawn_receive_loop();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(client.peers().get(b"server").is_none());

    server.manage_peers_automatically();

    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        if client.peers().get(b"server").is_some() && server.peers().get(b"client").is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "initial advertisement did not arrive");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(client.peers().get(b"server").unwrap().data, Bytes::from_static(b"server-data"));
    assert_eq!(server.peers().get(b"client").unwrap().data, Bytes::from_static(b"client-data"));

    client.close().await;
    server.stop();
}

#[tokio::test]
async fn nested_security_layers() {
    init_tracing();
    let outer_auth: Arc<dyn AuthPlugin> = Arc::new(HmacAuthPlugin::new("outer"));
    let outer_cipher: Arc<dyn CipherPlugin> = Arc::new(Sha256StreamCipherPlugin::new("outer"));
    let inner_auth: Arc<dyn AuthPlugin> =
        Arc::new(HmacAuthPlugin::new("inner").with_hmac_field("hmac2"));
    let inner_cipher: Arc<dyn CipherPlugin> =
        Arc::new(Sha256StreamCipherPlugin::new("inner").with_iv_field("iv2").with_encrypt_uri(false));

    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.set_auth_plugin(Some(outer_auth.clone()));
    server.set_cipher_plugin(Some(outer_cipher.clone()));
    server.on_with_plugins(
        (MessageType::PublishUri, &b"vault"[..]),
        handler(|message: Message, _ctx: ServerContext| async move {
            Some(make_ok_msg(message.body.uri.clone(), message.body.content.clone()))
        }),
        Some(inner_auth.clone()),
        Some(inner_cipher.clone()),
    );
    let addr = start_server(&server).await;

    let client = client_for(addr);
    client.set_auth_plugin(Some(outer_auth));
    client.set_cipher_plugin(Some(outer_cipher));
    client.connect().await.unwrap();

    // both layers: the response round-trips back to plaintext
    client.once_with_plugins(
        (MessageType::Ok, &b"vault"[..]),
        handler(|_m: Message, _ctx: ClientContext| async move { None }),
        Some(inner_auth.clone()),
        Some(inner_cipher.clone()),
    );
    let opts = SendOptions::default().with_auth(inner_auth).with_cipher(inner_cipher);
    client.publish(&b"vault"[..], &b"top secret"[..], opts).await.unwrap();
    let response = recv(&client, ReceiveOptions::default()).await.expect("no response");
    assert_eq!(response.kind(), Some(MessageType::Ok));
    assert_eq!(response.body, Body::prepare(&b"vault"[..], &b"top secret"[..]));

    // inner layer omitted: the handler-level check rejects with AUTH_ERROR
    client.publish(&b"vault"[..], &b"top secret"[..], SendOptions::default()).await.unwrap();
    let response = recv(&client, ReceiveOptions { use_auth: false, use_cipher: false })
        .await
        .expect("no auth error response");
    assert_eq!(response.kind(), Some(MessageType::AuthError));

    client.close().await;
    server.stop();
}

#[tokio::test]
async fn once_handler_consumed_then_persistent_takes_over() {
    init_tracing();
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.on(
        (MessageType::PublishUri, &b"route"[..]),
        sync_handler(|message: Message, _ctx: ServerContext| {
            Some(make_ok_msg(message.body.uri.clone(), &b"persistent"[..]))
        }),
    );
    server.once(
        (MessageType::PublishUri, &b"route"[..]),
        handler(|message: Message, _ctx: ServerContext| async move {
            Some(make_ok_msg(message.body.uri.clone(), &b"once"[..]))
        }),
    );
    let addr = start_server(&server).await;

    let client = client_for(addr);
    client.connect().await.unwrap();

    client.publish(&b"route"[..], &b""[..], SendOptions::default()).await.unwrap();
    let first = recv(&client, ReceiveOptions::default()).await.unwrap();
    assert_eq!(first.body.content, Bytes::from_static(b"once"));

    client.publish(&b"route"[..], &b""[..], SendOptions::default()).await.unwrap();
    let second = recv(&client, ReceiveOptions::default()).await.unwrap();
    assert_eq!(second.body.content, Bytes::from_static(b"persistent"));

    client.close().await;
    server.stop();
}

#[tokio::test]
async fn extended_message_types_dispatch_end_to_end() {
    init_tracing();
    const TELEMETRY: u8 = 42;
    let types = Arc::new(MessageTypeTable::extend(&[("TELEMETRY", TELEMETRY as u16)]).unwrap());

    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.set_message_types(types.clone());
    server.on(
        (TELEMETRY, &b"metrics"[..]),
        handler(|message: Message, _ctx: ServerContext| async move {
            Some(make_ok_msg(message.body.uri.clone(), message.body.content.clone()))
        }),
    );
    let addr = start_server(&server).await;

    let client = client_for(addr);
    client.set_message_types(types);
    client.connect().await.unwrap();

    let telemetry =
        Message::with_kind(TELEMETRY, AuthFields::new(), Body::prepare(&b"metrics"[..], &b"cpu=1"[..]));
    client.send(telemetry, SendOptions::default()).await.unwrap();
    let response = recv(&client, ReceiveOptions::default()).await.unwrap();
    assert_eq!(response.kind(), Some(MessageType::Ok));
    assert_eq!(response.body.content, Bytes::from_static(b"cpu=1"));
    client.close().await;
    server.stop();

    // a node on the stock table treats the extension value as invalid
    let strict = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    let addr = start_server(&strict).await;
    let client = client_for(addr);
    client.connect().await.unwrap();
    let telemetry =
        Message::with_kind(TELEMETRY, AuthFields::new(), Body::prepare(&b"metrics"[..], &b""[..]));
    client.send(telemetry, SendOptions::default()).await.unwrap();
    let response = recv(&client, ReceiveOptions::default()).await;
    // the ERROR reply itself is a reserved type, so the stock client decodes it
    assert_eq!(response.unwrap().kind(), Some(MessageType::Error));
    client.close().await;
    strict.stop();
}

#[tokio::test]
async fn client_reconnects_after_server_restart() {
    init_tracing();
    let port = {
        let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        probe.local_addr().unwrap().port()
    };
    let echo = || {
        handler(|message: Message, _ctx: ServerContext| async move {
            Some(make_ok_msg(message.body.uri.clone(), message.body.content.clone()))
        })
    };

    let server = TcpServer::new(NodeConfig::new("127.0.0.1", port));
    server.on((MessageType::PublishUri, &b"echo"[..]), echo());
    start_server(&server).await;

    let mut config = NodeConfig::new("127.0.0.1", port);
    config.reconnect = Backoff {
        min: Duration::from_millis(50),
        max: Duration::from_millis(500),
        multiplier: 2.0,
    };
    let client = TcpClient::new(config);
    client.set_auto_reconnect(true);
    let (tx, mut responses) = tokio::sync::mpsc::unbounded_channel::<Message>();
    client.on(
        (MessageType::Ok, &b"echo"[..]),
        handler(move |message: Message, _ctx: ClientContext| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(message);
                None
            }
        }),
    );
    client.connect().await.unwrap();
    client.spawn_receive_loop();

    client.publish(&b"echo"[..], &b"one"[..], SendOptions::default()).await.unwrap();
    let first = timeout(Duration::from_secs(2), responses.recv()).await.unwrap().unwrap();
    assert_eq!(first.body.content, Bytes::from_static(b"one"));

    // take the server down; the client's receive loop starts its backoff
    server.stop();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let revived = TcpServer::new(NodeConfig::new("127.0.0.1", port));
    revived.on((MessageType::PublishUri, &b"echo"[..]), echo());
    {
        let revived = revived.clone();
        tokio::spawn(async move {
            // the port may linger briefly after the first server is torn down
            loop {
                if revived.start().await.is_ok() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        });
    }

    let deadline = Instant::now() + Duration::from_secs(5);
    let second = loop {
        assert!(Instant::now() < deadline, "client did not reconnect");
        if client.is_connected() {
            let _ = client.publish(&b"echo"[..], &b"two"[..], SendOptions::default()).await;
            if let Ok(Some(m)) = timeout(Duration::from_millis(300), responses.recv()).await {
                break m;
            }
        } else {
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    };
    assert_eq!(second.body.content, Bytes::from_static(b"two"));

    client.close().await;
    revived.stop();
}

#[tokio::test]
async fn corrupt_frame_answered_with_error_and_stream_continues() {
    init_tracing();
    let server = TcpServer::new(NodeConfig::new("127.0.0.1", 0));
    server.on(
        (MessageType::PublishUri, &b"echo"[..]),
        handler(|message: Message, _ctx: ServerContext| async move {
            Some(make_ok_msg(message.body.uri.clone(), message.body.content.clone()))
        }),
    );
    let addr = start_server(&server).await;

    // flip one body byte so the CRC in the header no longer matches
    let good = Message::prepare(Body::prepare(&b"echo"[..], &b"payload"[..]), MessageType::PublishUri);
    let mut raw = good.encode().to_vec();
    let last = raw.len() - 1;
    raw[last] ^= 0xff;

    use tokio::io::AsyncWriteExt;
    let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
    stream.write_all(&raw).await.unwrap();
    let err = timeout(Duration::from_secs(2), wirebus::read_message(&mut stream)).await.unwrap().unwrap();
    assert_eq!(err.kind(), Some(MessageType::Error));

    // the same connection still serves valid frames
    stream.write_all(&good.encode()).await.unwrap();
    let ok = timeout(Duration::from_secs(2), wirebus::read_message(&mut stream)).await.unwrap().unwrap();
    assert_eq!(ok.kind(), Some(MessageType::Ok));

    server.stop();
}
