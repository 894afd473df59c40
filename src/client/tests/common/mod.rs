// Copyright 2022 Twitter, Inc.
// Licensed under the Apache License, Version 2.0
// http://www.apache.org/licenses/LICENSE-2.0

//! An in-process cluster node speaking just enough of the binary protocol
//! for the end-to-end scenarios: configuration fetches, the key/value
//! opcodes, and observe.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

const MAGIC_REQUEST: u8 = 0x80;
const MAGIC_RESPONSE: u8 = 0x81;

const OP_GET: u8 = 0x00;
const OP_SET: u8 = 0x01;
const OP_DELETE: u8 = 0x04;
const OP_OBSERVE: u8 = 0x92;
const OP_GET_CLUSTER_CONFIG: u8 = 0xb5;

const STATUS_OK: u16 = 0x00;
const STATUS_KEY_ENOENT: u16 = 0x01;
const STATUS_NOT_MY_VBUCKET: u16 = 0x07;
const STATUS_UNKNOWN_COMMAND: u16 = 0x81;

/// How a node treats traffic.
#[derive(Clone)]
pub enum Mode {
    /// Answer everything.
    Normal,
    /// Serve configurations but never answer key/value traffic.
    StallKv,
    /// Accept connections and never answer anything.
    StallAll,
    /// Reject every key/value request with NOT_MY_VBUCKET carrying the given
    /// configuration document.
    NotMyVbucket(String),
}

#[derive(Default)]
pub struct Store {
    items: HashMap<Vec<u8>, (Vec<u8>, u64, u32)>,
}

impl Store {
    pub fn get(&self, key: &[u8]) -> Option<(Vec<u8>, u64, u32)> {
        self.items.get(key).cloned()
    }
}

/// One mock node: a listener plus shared state. Nodes in one "cluster" share
/// a store so replication is trivially satisfied.
pub struct MockNode {
    addr: SocketAddr,
    pub store: Arc<Mutex<Store>>,
    config: Arc<Mutex<Option<String>>>,
}

impl MockNode {
    pub fn start(mode: Mode) -> Self {
        Self::start_shared(mode, Arc::new(Mutex::new(Store::default())))
    }

    pub fn start_shared(mode: Mode, store: Arc<Mutex<Store>>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("failed to bind");
        let addr = listener.local_addr().expect("no local addr");
        let config = Arc::new(Mutex::new(None));
        let cas = Arc::new(AtomicU64::new(1));

        {
            let store = store.clone();
            let config = config.clone();
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    let stream = match stream {
                        Ok(stream) => stream,
                        Err(_) => break,
                    };
                    let mode = mode.clone();
                    let store = store.clone();
                    let config = config.clone();
                    let cas = cas.clone();
                    std::thread::spawn(move || serve(stream, mode, store, config, cas));
                }
            });
        }

        Self {
            addr,
            store,
            config,
        }
    }

    pub fn authority(&self) -> String {
        format!("{}", self.addr)
    }

    pub fn set_config(&self, config: &str) {
        *self.config.lock().unwrap() = Some(config.to_string());
    }
}

/// Build a configuration document for a set of node authorities, every
/// vbucket row identical.
pub fn config_json(authorities: &[String], row: &[i32], replicas: usize, vbuckets: usize) -> String {
    let server_list: Vec<String> = authorities
        .iter()
        .map(|authority| format!("\"{}\"", authority))
        .collect();
    let nodes: Vec<String> = authorities
        .iter()
        .map(|authority| {
            let host = authority.rsplit_once(':').map(|(h, _)| h).unwrap();
            format!(
                "{{\"hostname\":\"{}:8091\",\"ports\":{{\"direct\":{}}}}}",
                host,
                authority.rsplit_once(':').map(|(_, p)| p).unwrap()
            )
        })
        .collect();
    let row_text = format!(
        "[{}]",
        row.iter()
            .map(|index| index.to_string())
            .collect::<Vec<_>>()
            .join(",")
    );
    let rows: Vec<String> = (0..vbuckets).map(|_| row_text.clone()).collect();

    format!(
        "{{\"name\":\"default\",\"nodeLocator\":\"vbucket\",\"nodes\":[{}],\
         \"vBucketServerMap\":{{\"hashAlgorithm\":\"CRC\",\"numReplicas\":{},\
         \"serverList\":[{}],\"vBucketMap\":[{}]}}}}",
        nodes.join(","),
        replicas,
        server_list.join(","),
        rows.join(",")
    )
}

struct Frame {
    opcode: u8,
    opaque: u32,
    key: Vec<u8>,
    value: Vec<u8>,
}

fn read_frame(stream: &mut TcpStream) -> std::io::Result<Frame> {
    let mut header = [0u8; 24];
    stream.read_exact(&mut header)?;
    assert_eq!(header[0], MAGIC_REQUEST, "client sent bad magic");

    let opcode = header[1];
    let key_len = u16::from_be_bytes([header[2], header[3]]) as usize;
    let extras_len = header[4] as usize;
    let body_len = u32::from_be_bytes([header[8], header[9], header[10], header[11]]) as usize;
    let opaque = u32::from_be_bytes([header[12], header[13], header[14], header[15]]);

    let mut body = vec![0u8; body_len];
    stream.read_exact(&mut body)?;

    let key = body[extras_len..extras_len + key_len].to_vec();
    let value = body[extras_len + key_len..].to_vec();

    Ok(Frame {
        opcode,
        opaque,
        key,
        value,
    })
}

fn write_frame(
    stream: &mut TcpStream,
    opcode: u8,
    status: u16,
    opaque: u32,
    cas: u64,
    extras: &[u8],
    value: &[u8],
) -> std::io::Result<()> {
    let mut frame = Vec::with_capacity(24 + extras.len() + value.len());
    frame.push(MAGIC_RESPONSE);
    frame.push(opcode);
    frame.extend_from_slice(&0u16.to_be_bytes());
    frame.push(extras.len() as u8);
    frame.push(0);
    frame.extend_from_slice(&status.to_be_bytes());
    frame.extend_from_slice(&((extras.len() + value.len()) as u32).to_be_bytes());
    frame.extend_from_slice(&opaque.to_be_bytes());
    frame.extend_from_slice(&cas.to_be_bytes());
    frame.extend_from_slice(extras);
    frame.extend_from_slice(value);
    stream.write_all(&frame)
}

fn serve(
    mut stream: TcpStream,
    mode: Mode,
    store: Arc<Mutex<Store>>,
    config: Arc<Mutex<Option<String>>>,
    cas_counter: Arc<AtomicU64>,
) {
    loop {
        let frame = match read_frame(&mut stream) {
            Ok(frame) => frame,
            Err(_) => return,
        };

        if matches!(mode, Mode::StallAll) {
            // swallow the request, never answer
            continue;
        }

        let result = match frame.opcode {
            OP_GET_CLUSTER_CONFIG => {
                let config = config.lock().unwrap().clone();
                match config {
                    Some(text) => write_frame(
                        &mut stream,
                        frame.opcode,
                        STATUS_OK,
                        frame.opaque,
                        0,
                        &[],
                        text.as_bytes(),
                    ),
                    None => write_frame(
                        &mut stream,
                        frame.opcode,
                        STATUS_UNKNOWN_COMMAND,
                        frame.opaque,
                        0,
                        &[],
                        &[],
                    ),
                }
            }
            _ if matches!(mode, Mode::StallKv) => continue,
            _ if matches!(mode, Mode::NotMyVbucket(_)) => {
                let body = match &mode {
                    Mode::NotMyVbucket(config) => config.clone(),
                    _ => unreachable!(),
                };
                write_frame(
                    &mut stream,
                    frame.opcode,
                    STATUS_NOT_MY_VBUCKET,
                    frame.opaque,
                    0,
                    &[],
                    body.as_bytes(),
                )
            }
            OP_SET => {
                let cas = cas_counter.fetch_add(1, Ordering::SeqCst);
                store
                    .lock()
                    .unwrap()
                    .items
                    .insert(frame.key.clone(), (frame.value.clone(), cas, 0));
                write_frame(&mut stream, frame.opcode, STATUS_OK, frame.opaque, cas, &[], &[])
            }
            OP_GET => {
                let item = store.lock().unwrap().get(&frame.key);
                match item {
                    Some((value, cas, flags)) => write_frame(
                        &mut stream,
                        frame.opcode,
                        STATUS_OK,
                        frame.opaque,
                        cas,
                        &flags.to_be_bytes(),
                        &value,
                    ),
                    None => write_frame(
                        &mut stream,
                        frame.opcode,
                        STATUS_KEY_ENOENT,
                        frame.opaque,
                        0,
                        &[],
                        &[],
                    ),
                }
            }
            OP_DELETE => {
                let removed = store.lock().unwrap().items.remove(&frame.key);
                let status = if removed.is_some() {
                    STATUS_OK
                } else {
                    STATUS_KEY_ENOENT
                };
                write_frame(&mut stream, frame.opcode, status, frame.opaque, 0, &[], &[])
            }
            OP_OBSERVE => {
                // request body: (vbucket, key length, key) triples; response
                // adds a status byte and the stored cas per entry
                let mut body = frame.value.as_slice();
                let mut out = Vec::new();
                while body.len() >= 4 {
                    let vbucket = u16::from_be_bytes([body[0], body[1]]);
                    let key_len = u16::from_be_bytes([body[2], body[3]]) as usize;
                    let key = &body[4..4 + key_len];
                    let item = store.lock().unwrap().get(key);

                    out.extend_from_slice(&vbucket.to_be_bytes());
                    out.extend_from_slice(&(key_len as u16).to_be_bytes());
                    out.extend_from_slice(key);
                    match item {
                        Some((_, cas, _)) => {
                            // persisted
                            out.push(0x01);
                            out.extend_from_slice(&cas.to_be_bytes());
                        }
                        None => {
                            out.push(0x80);
                            out.extend_from_slice(&0u64.to_be_bytes());
                        }
                    }
                    body = &body[4 + key_len..];
                }
                write_frame(&mut stream, frame.opcode, STATUS_OK, frame.opaque, 0, &[], &out)
            }
            _ => write_frame(
                &mut stream,
                frame.opcode,
                STATUS_UNKNOWN_COMMAND,
                frame.opaque,
                0,
                &[],
                &[],
            ),
        };

        if result.is_err() {
            return;
        }
    }
}
