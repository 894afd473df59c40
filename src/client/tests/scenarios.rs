// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! End-to-end scenarios against in-process mock cluster nodes.

mod common;

use cbclient::{
    BootstrapTransport, Client, Command, DurabilityRequirement, Error, OpKind, Settings,
};
use common::{config_json, Mode, MockNode};
use std::cell::RefCell;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::time::Instant;

fn settings_for(nodes: &[&MockNode]) -> Settings {
    Settings::default()
        .set_hosts(nodes.iter().map(|node| node.authority()).collect())
        .set_transports(vec![BootstrapTransport::Cccp])
}

type Collected = Rc<RefCell<Vec<(u64, Result<cbclient::OpResponse, Error>)>>>;

fn collect(client: &mut Client, kind: OpKind) -> Collected {
    let results: Collected = Rc::new(RefCell::new(Vec::new()));
    let sink = results.clone();
    client.set_callback(
        kind,
        Box::new(move |cookie, result| {
            sink.borrow_mut().push((cookie, result));
        }),
    );
    results
}

#[test]
fn basic_roundtrip() {
    let node = MockNode::start(Mode::Normal);
    let config = config_json(&[node.authority()], &[0], 0, 4);
    node.set_config(&config);

    let mut client = Client::new(settings_for(&[&node])).expect("failed to create client");
    let stores = collect(&mut client, OpKind::Store);
    let gets = collect(&mut client, OpKind::Get);

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");
    assert!(client.is_bootstrapped());

    client
        .submit(Command::set(b"Hello", b"World!"), 1)
        .expect("submit failed");
    client.wait().expect("wait failed");

    assert_eq!(stores.borrow().len(), 1);
    let store_cas = {
        let results = stores.borrow();
        let (cookie, result) = &results[0];
        assert_eq!(*cookie, 1);
        let response = result.as_ref().expect("store failed");
        assert_ne!(response.cas, 0);
        response.cas
    };

    client
        .submit(Command::get(b"Hello"), 2)
        .expect("submit failed");
    client.wait().expect("wait failed");

    let results = gets.borrow();
    assert_eq!(results.len(), 1);
    let (cookie, result) = &results[0];
    assert_eq!(*cookie, 2);
    let response = result.as_ref().expect("get failed");
    assert_eq!(response.value, b"World!");
    assert_eq!(response.cas, store_cas);
}

#[test]
fn not_my_vbucket_redirect() {
    // node B answers normally; node A rejects every key/value request with
    // NOT_MY_VBUCKET carrying a corrective config that maps everything to B
    let store = Arc::new(Mutex::new(common::Store::default()));
    let node_b = MockNode::start_shared(Mode::Normal, store.clone());

    let corrective = config_json(&[node_b.authority()], &[0], 0, 4);
    let node_a = MockNode::start_shared(Mode::NotMyVbucket(corrective), store.clone());

    // the initial config routes every vbucket to A
    let initial = config_json(&[node_a.authority(), node_b.authority()], &[0], 0, 4);
    node_a.set_config(&initial);

    let mut client = Client::new(settings_for(&[&node_a])).expect("failed to create client");
    let stores = collect(&mut client, OpKind::Store);

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");
    assert_eq!(
        client.vbucket_map().expect("no map").route_master(b"k").1,
        Some(0)
    );

    client
        .submit(Command::set(b"k", b"v"), 7)
        .expect("submit failed");
    client.wait().expect("wait failed");

    // exactly one callback, successful, and the write landed
    let results = stores.borrow();
    assert_eq!(results.len(), 1);
    assert!(results[0].1.is_ok());
    assert!(store.lock().unwrap().get(b"k").is_some());

    // the corrective configuration was adopted: one server, B as master
    let map = client.vbucket_map().expect("no map");
    assert_eq!(map.num_servers(), 1);
    assert_eq!(
        map.server(0).expect("no server").authority(),
        node_b.authority()
    );
}

#[test]
fn operation_timeout() {
    let node = MockNode::start(Mode::StallKv);
    let config = config_json(&[node.authority()], &[0], 0, 4);
    node.set_config(&config);

    let settings = settings_for(&[&node])
        .set_op_timeout(100_000)
        .set_timer_granularity(10_000);
    let mut client = Client::new(settings).expect("failed to create client");
    let gets = collect(&mut client, OpKind::Get);

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");

    let started = Instant::now();
    client.submit(Command::get(b"k"), 3).expect("submit failed");
    client.wait().expect("wait failed");
    let elapsed = started.elapsed();

    let results = gets.borrow();
    assert_eq!(results.len(), 1);
    let error = results[0].1.as_ref().expect_err("expected a timeout");
    assert!(matches!(error, Error::TimedOut));
    assert!(error.is_transient() && error.is_network());

    // deadline plus scheduler granularity, with head room for slow machines
    assert!(elapsed.as_millis() >= 90, "fired early: {:?}", elapsed);
    assert!(elapsed.as_millis() < 1_000, "fired late: {:?}", elapsed);
}

#[test]
fn bootstrap_failover() {
    // a: refuses TCP (bound then dropped), b: accepts but never answers,
    // c: healthy
    let refused = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
        let addr = listener.local_addr().expect("no local addr");
        drop(listener);
        format!("{}", addr)
    };
    let node_b = MockNode::start(Mode::StallAll);
    let node_c = MockNode::start(Mode::Normal);
    let config = config_json(&[node_c.authority()], &[0], 0, 4);
    node_c.set_config(&config);

    let settings = Settings::default()
        .set_hosts(vec![refused, node_b.authority(), node_c.authority()])
        .set_transports(vec![BootstrapTransport::Cccp])
        .set_config_node_timeout(60_000)
        .set_config_total_timeout(1_000_000)
        .set_timer_granularity(10_000);

    let mut client = Client::new(settings).expect("failed to create client");
    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");

    assert!(client.is_bootstrapped());
    let map = client.vbucket_map().expect("no map");
    assert_eq!(map.num_servers(), 1);
    assert_eq!(
        map.server(0).expect("no server").authority(),
        node_c.authority()
    );
}

#[test]
fn durability_success() {
    // three nodes sharing one store: persistence and replication are
    // satisfied on the first poll
    let store = Arc::new(Mutex::new(common::Store::default()));
    let node_a = MockNode::start_shared(Mode::Normal, store.clone());
    let node_b = MockNode::start_shared(Mode::Normal, store.clone());
    let node_c = MockNode::start_shared(Mode::Normal, store.clone());

    let authorities = vec![node_a.authority(), node_b.authority(), node_c.authority()];
    let config = config_json(&authorities, &[0, 1, 2], 2, 4);
    node_a.set_config(&config);

    let mut client = Client::new(settings_for(&[&node_a])).expect("failed to create client");
    let stores = collect(&mut client, OpKind::Store);

    let durable: Rc<RefCell<Vec<(Vec<u8>, Result<u64, Error>)>>> =
        Rc::new(RefCell::new(Vec::new()));
    let sink = durable.clone();
    client.set_durability_callback(Box::new(move |_cookie, key, result| {
        sink.borrow_mut().push((key, result));
    }));

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");

    client
        .submit(Command::set(b"x", b"payload"), 1)
        .expect("submit failed");
    client.wait().expect("wait failed");
    let cas = stores.borrow()[0].1.as_ref().expect("store failed").cas;

    client
        .endure(
            vec![DurabilityRequirement {
                key: b"x".to_vec(),
                cas,
                persist_to: 1,
                replicate_to: 2,
            }],
            false,
            9,
        )
        .expect("endure failed");
    client.wait().expect("wait failed");

    let results = durable.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, b"x");
    assert_eq!(*results[0].1.as_ref().expect("durability failed"), cas);
}

#[test]
fn pipelined_ordering() {
    let node = MockNode::start(Mode::Normal);
    let config = config_json(&[node.authority()], &[0], 0, 4);
    node.set_config(&config);

    let mut client = Client::new(settings_for(&[&node])).expect("failed to create client");
    let stores = collect(&mut client, OpKind::Store);

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");

    for cookie in 1..=10u64 {
        let key = format!("k{}", cookie);
        client
            .submit(Command::set(key.as_bytes(), b"v"), cookie)
            .expect("submit failed");
    }
    client.wait().expect("wait failed");

    // callbacks fire in submit order with all ten accounted for
    let results = stores.borrow();
    let cookies: Vec<u64> = results.iter().map(|(cookie, _)| *cookie).collect();
    assert_eq!(cookies, (1..=10).collect::<Vec<u64>>());
    assert!(results.iter().all(|(_, result)| result.is_ok()));
}

#[test]
fn rejected_submit_has_no_callback() {
    let node = MockNode::start(Mode::Normal);
    let config = config_json(&[node.authority()], &[0], 0, 4);
    node.set_config(&config);

    let mut client = Client::new(settings_for(&[&node])).expect("failed to create client");
    let gets = collect(&mut client, OpKind::Get);

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");

    let error = client.submit(Command::get(b""), 1).expect_err("accepted an empty key");
    assert!(error.is_input());

    client.wait().expect("wait failed");
    assert!(gets.borrow().is_empty());
}

#[test]
fn shutdown_fails_pending_synchronously() {
    let node = MockNode::start(Mode::StallKv);
    let config = config_json(&[node.authority()], &[0], 0, 4);
    node.set_config(&config);

    let mut client = Client::new(settings_for(&[&node])).expect("failed to create client");
    let gets = collect(&mut client, OpKind::Get);

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");

    client.submit(Command::get(b"k"), 1).expect("submit failed");
    client.submit(Command::get(b"k"), 2).expect("submit failed");

    // give the loop a chance to put the operations on the wire
    client
        .run_once(std::time::Duration::from_millis(50))
        .expect("run_once failed");

    client.shutdown();

    // both callbacks fired during shutdown, with the shutdown error
    {
        let results = gets.borrow();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|(_, result)| matches!(result, Err(Error::Shutdown))));
    }

    // nothing fires after shutdown returns
    drop(client);
    assert_eq!(gets.borrow().len(), 2);
}

/// A minimal HTTP endpoint serving the streaming configuration feed.
fn start_feed_server(config: String) -> String {
    use std::io::{Read, Write};

    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let authority = format!("{}", listener.local_addr().expect("no local addr"));

    std::thread::spawn(move || {
        for stream in listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            let config = config.clone();
            std::thread::spawn(move || {
                // read the request head
                let mut buffer = [0u8; 4096];
                let mut head = Vec::new();
                loop {
                    let n = match stream.read(&mut buffer) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    head.extend_from_slice(&buffer[..n]);
                    if head.windows(4).any(|window| window == b"\r\n\r\n") {
                        break;
                    }
                }

                let body = format!("{}\n\n\n\n", config);
                let response = format!("HTTP/1.1 200 OK\r\n\r\n{}", body);
                let _ = stream.write_all(response.as_bytes());
                // hold the socket open for pushed updates, like the real
                // server does
                std::thread::sleep(std::time::Duration::from_secs(5));
            });
        }
    });

    authority
}

#[test]
fn http_streaming_bootstrap() {
    let node = MockNode::start(Mode::Normal);
    let config = config_json(&[node.authority()], &[0], 0, 4);
    let feed = start_feed_server(config);

    let settings = Settings::default()
        .set_hosts(vec![node.authority()])
        .set_mgmt_hosts(vec![feed])
        .set_transports(vec![BootstrapTransport::HttpStreaming])
        .set_htconfig_idle_timeout(100_000)
        .set_timer_granularity(10_000);

    let mut client = Client::new(settings).expect("failed to create client");
    let stores = collect(&mut client, OpKind::Store);

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");
    assert!(client.is_bootstrapped());

    client
        .submit(Command::set(b"via-http", b"ok"), 1)
        .expect("submit failed");
    client.wait().expect("wait failed");

    assert_eq!(stores.borrow().len(), 1);
    assert!(stores.borrow()[0].1.is_ok());
}

#[test]
fn view_request_roundtrip() {
    use std::io::{Read, Write};

    let node = MockNode::start(Mode::Normal);

    // a view endpoint answering any request with a fixed body
    let view_listener = std::net::TcpListener::bind("127.0.0.1:0").expect("failed to bind");
    let view_authority = format!("{}", view_listener.local_addr().expect("no local addr"));
    std::thread::spawn(move || {
        for stream in view_listener.incoming() {
            let mut stream = match stream {
                Ok(stream) => stream,
                Err(_) => break,
            };
            std::thread::spawn(move || {
                let mut buffer = [0u8; 4096];
                let mut head = Vec::new();
                loop {
                    let n = match stream.read(&mut buffer) {
                        Ok(0) | Err(_) => return,
                        Ok(n) => n,
                    };
                    head.extend_from_slice(&buffer[..n]);
                    if head.windows(4).any(|window| window == b"\r\n\r\n") {
                        break;
                    }
                }
                let _ = stream.write_all(
                    b"HTTP/1.1 200 OK\r\nContent-Length: 13\r\n\r\n{\"rows\": []}\n",
                );
            });
        }
    });

    // the config advertises the view endpoint through couchApiBase
    let host = node.authority();
    let config = format!(
        "{{\"name\":\"default\",\"nodeLocator\":\"vbucket\",\
         \"nodes\":[{{\"hostname\":\"127.0.0.1:8091\",\"ports\":{{\"direct\":{}}},\
         \"couchApiBase\":\"http://{}/default\"}}],\
         \"vBucketServerMap\":{{\"hashAlgorithm\":\"CRC\",\"numReplicas\":0,\
         \"serverList\":[\"{}\"],\"vBucketMap\":[[0],[0],[0],[0]]}}}}",
        host.rsplit_once(':').map(|(_, p)| p).unwrap(),
        view_authority,
        host,
    );
    node.set_config(&config);

    let mut client = Client::new(settings_for(&[&node])).expect("failed to create client");

    let responses: Rc<RefCell<Vec<(u64, Result<cbclient::HttpResponse, Error>)>>> =
        Rc::new(RefCell::new(Vec::new()));
    let sink = responses.clone();
    client.set_http_callback(Box::new(move |cookie, result| {
        sink.borrow_mut().push((cookie, result));
    }));

    client.connect().expect("connect failed");
    client.wait().expect("bootstrap failed");

    client
        .http_request(cbclient::ViewRequest::get("/default/_design/docs/_view/all"), 5)
        .expect("http request failed");
    client.wait().expect("wait failed");

    let results = responses.borrow();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].0, 5);
    let response = results[0].1.as_ref().expect("view request failed");
    assert_eq!(response.status, 200);
    assert_eq!(response.body, b"{\"rows\": []}\n");
}

#[test]
fn seeded_config_skips_network_bootstrap() {
    let node = MockNode::start(Mode::Normal);
    let config = config_json(&[node.authority()], &[0], 0, 4);

    // no config is installed on the node; only the seed can bootstrap us
    let mut client = Client::new(settings_for(&[&node])).expect("failed to create client");
    let stores = collect(&mut client, OpKind::Store);

    client.seed_config(&config).expect("seed rejected");
    client.connect().expect("connect failed");
    client.wait().expect("wait failed");
    assert!(client.is_bootstrapped());

    client
        .submit(Command::set(b"seeded", b"yes"), 4)
        .expect("submit failed");
    client.wait().expect("wait failed");

    assert_eq!(stores.borrow().len(), 1);
    assert!(stores.borrow()[0].1.is_ok());
}
