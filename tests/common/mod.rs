//! Shared test infrastructure for resolvhook integration tests.

#![allow(dead_code)]

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use hickory_proto::op::{Message, MessageType, OpCode, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, AAAA, CNAME};
use hickory_proto::rr::{DNSClass, Name, RData, Record, RecordType};
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;

use resolvhook::command::CommandRunner;
use resolvhook::config::{Config, ServerConfig, UpstreamConfig};
use resolvhook::TriggerError;

// --- Constants ---

pub const ANSWER_V4: Ipv4Addr = Ipv4Addr::new(192, 0, 2, 10);
pub const ANSWER_V6: Ipv6Addr = Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 0x10);

/// Names starting with this label are answered with a CNAME to `target.<rest>`
/// followed by the target's address record.
pub const ALIAS_LABEL: &str = "alias";

// --- Fake upstream ---

/// How the fake upstream reacts to queries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpstreamMode {
    /// Answer every question with [`ANSWER_V4`] or [`ANSWER_V6`].
    Answer,
    /// Count queries, never reply.
    Silent,
    /// Send a reply with the wrong ID before the real answer.
    StaleFirst,
}

/// UDP DNS resolver on a random loopback port.
pub struct FakeUpstream {
    pub addr: SocketAddr,
    queries: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl FakeUpstream {
    pub async fn start(mode: UpstreamMode) -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0")
            .await
            .expect("failed to bind fake upstream");
        let addr = socket.local_addr().expect("failed to get local addr");
        let queries = Arc::new(AtomicUsize::new(0));

        let counter = queries.clone();
        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; 4096];
            loop {
                let Ok((len, src)) = socket.recv_from(&mut buf).await else {
                    return;
                };
                counter.fetch_add(1, Ordering::SeqCst);

                let Ok(request) = Message::from_vec(&buf[..len]) else {
                    continue;
                };
                if mode == UpstreamMode::Silent {
                    continue;
                }

                let response = answer(&request);
                if mode == UpstreamMode::StaleFirst {
                    let mut stale = response.clone();
                    stale.set_id(request.id().wrapping_add(1));
                    stale.take_answers();
                    let _ = socket.send_to(&stale.to_vec().unwrap(), src).await;
                }
                let _ = socket.send_to(&response.to_vec().unwrap(), src).await;
            }
        });

        Self {
            addr,
            queries,
            handle,
        }
    }

    /// Number of datagrams received so far.
    pub fn queries(&self) -> usize {
        self.queries.load(Ordering::SeqCst)
    }

    pub fn upstream_config(&self) -> UpstreamConfig {
        UpstreamConfig {
            host: self.addr.ip().to_string(),
            port: self.addr.port(),
        }
    }
}

impl Drop for FakeUpstream {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

fn answer(request: &Message) -> Message {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(OpCode::Query);
    response.set_recursion_desired(request.recursion_desired());
    response.set_recursion_available(true);
    response.set_response_code(ResponseCode::NoError);

    for query in request.queries() {
        response.add_query(query.clone());

        let mut owner = query.name().clone();
        let first_label = owner
            .iter()
            .next()
            .map(|label| String::from_utf8_lossy(label).to_string());

        if first_label.as_deref() == Some(ALIAS_LABEL) {
            let target = Name::from_ascii("target")
                .unwrap()
                .append_domain(&owner.base_name())
                .unwrap();
            response.add_answer(Record::from_rdata(
                owner.clone(),
                60,
                RData::CNAME(CNAME(target.clone())),
            ));
            owner = target;
        }

        match query.query_type() {
            RecordType::A => {
                response.add_answer(Record::from_rdata(owner, 60, RData::A(A(ANSWER_V4))));
            }
            RecordType::AAAA => {
                response.add_answer(Record::from_rdata(
                    owner,
                    60,
                    RData::AAAA(AAAA(ANSWER_V6)),
                ));
            }
            _ => {}
        }
    }

    response
}

// --- Trigger recording ---

/// Records every command line instead of running it.
#[derive(Default)]
pub struct RecordingRunner {
    commands: Mutex<Vec<String>>,
}

#[async_trait]
impl CommandRunner for RecordingRunner {
    async fn run(&self, command: &str) -> Result<String, TriggerError> {
        self.commands.lock().push(command.to_string());
        Ok(String::new())
    }
}

impl RecordingRunner {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().clone()
    }

    /// Recorded commands starting with `prefix`.
    pub fn with_prefix(&self, prefix: &str) -> Vec<String> {
        self.commands
            .lock()
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    /// Poll until `command` has been recorded.
    pub async fn wait_for(&self, command: &str) {
        wait_until(|| self.commands.lock().iter().any(|c| c == command))
            .await
            .unwrap_or_else(|| panic!("`{}` was never run, got {:?}", command, self.commands()));
    }
}

/// Poll `condition` every 20ms for up to 5 seconds.
pub async fn wait_until(mut condition: impl FnMut() -> bool) -> Option<()> {
    for _ in 0..250 {
        if condition() {
            return Some(());
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    None
}

// --- Query construction ---

/// Build wire-format bytes for a DNS query.
pub fn build_query_bytes(name: &str, record_type: RecordType, id: u16) -> Vec<u8> {
    let mut msg = Message::new();
    msg.set_id(id);
    msg.set_message_type(MessageType::Query);
    msg.set_op_code(OpCode::Query);
    msg.set_recursion_desired(true);
    let mut query = Query::new();
    query.set_name(Name::from_ascii(name).unwrap());
    query.set_query_type(record_type);
    query.set_query_class(DNSClass::IN);
    msg.add_query(query);
    msg.to_vec().unwrap()
}

/// Send a query over UDP and return the parsed response, or `None` on timeout.
pub async fn query(
    server: SocketAddr,
    name: &str,
    record_type: RecordType,
    id: u16,
) -> Option<Message> {
    let sock = UdpSocket::bind("127.0.0.1:0")
        .await
        .expect("failed to bind client socket");
    sock.send_to(&build_query_bytes(name, record_type, id), server)
        .await
        .expect("failed to send query");

    let mut buf = vec![0u8; 4096];
    let len = tokio::time::timeout(Duration::from_secs(3), sock.recv(&mut buf))
        .await
        .ok()?
        .expect("failed to recv response");

    Some(Message::from_vec(&buf[..len]).expect("failed to parse DNS response"))
}

/// Extract A addresses from a response.
pub fn extract_a_ips(msg: &Message) -> Vec<Ipv4Addr> {
    msg.answers()
        .iter()
        .filter_map(|r| match r.data() {
            RData::A(a) => Some(a.0),
            _ => None,
        })
        .collect()
}

// --- Config / files ---

/// A UDP port on loopback that was free a moment ago.
pub fn free_port() -> u16 {
    let socket = std::net::UdpSocket::bind("127.0.0.1:0").expect("failed to bind");
    socket.local_addr().expect("failed to get local addr").port()
}

/// Config listening on loopback `port`, forwarding to `upstream`, no triggers.
pub fn test_config(port: u16, upstream: &FakeUpstream, rules: &Path) -> Config {
    Config {
        verbose: false,
        reload: Duration::from_millis(50),
        server: ServerConfig {
            host: "127.0.0.1".to_string(),
            port,
        },
        rules: rules.to_path_buf(),
        upstreams: vec![upstream.upstream_config()],
        upstream_timeout: Duration::from_millis(300),
        ..Config::default()
    }
}

pub fn write_config(path: &Path, config: &Config) {
    let yaml = serde_yaml::to_string(config).expect("failed to serialize config");
    std::fs::write(path, yaml).expect("failed to write config");
}

/// Overwrite `path` and move its mtime `secs` seconds into the future, so the
/// change is visible even on filesystems with coarse timestamps.
pub fn rewrite(path: &Path, contents: &str, secs: u64) {
    std::fs::write(path, contents).expect("failed to write file");
    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .expect("failed to open file");
    file.set_modified(SystemTime::now() + Duration::from_secs(secs))
        .expect("failed to set mtime");
}
