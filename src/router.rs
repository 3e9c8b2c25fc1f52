//! Query routing: forward to upstreams, match answers against rules, fire triggers.

use hickory_proto::op::{Message, MessageType, ResponseCode};
use hickory_proto::rr::{RData, Record};
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, trace, warn};

use crate::config::Config;
use crate::error::UpstreamError;
use crate::metrics::{self, QueryResult, Timer};
use crate::rules::SharedRules;
use crate::trigger::{Dispatcher, MatchEvent};

/// Largest datagram accepted from clients and upstreams.
pub const MAX_DATAGRAM: usize = 65_535;

/// Addresses answered for one owner name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AnswerGroup {
    /// Owner name without the trailing dot.
    pub domain: String,
    /// A record addresses, in answer order.
    pub ipv4: Vec<String>,
    /// AAAA record addresses, in answer order.
    pub ipv6: Vec<String>,
}

/// Group A/AAAA answers by owner name, in order of first appearance.
pub fn group_answers(answers: &[Record]) -> Vec<AnswerGroup> {
    let mut groups: Vec<AnswerGroup> = Vec::new();

    for record in answers {
        let (ipv4, ipv6) = match record.data() {
            RData::A(a) => (Some(a.0.to_string()), None),
            RData::AAAA(aaaa) => (None, Some(aaaa.0.to_string())),
            _ => continue,
        };

        let name = record.name().to_string();
        let domain = name.strip_suffix('.').unwrap_or(&name);
        if domain.is_empty() {
            continue;
        }

        let index = match groups.iter().position(|g| g.domain == domain) {
            Some(index) => index,
            None => {
                groups.push(AnswerGroup {
                    domain: domain.to_string(),
                    ..AnswerGroup::default()
                });
                groups.len() - 1
            }
        };

        let group = &mut groups[index];
        group.ipv4.extend(ipv4);
        group.ipv6.extend(ipv6);
    }

    groups
}

/// Resolves one inbound query against the configured upstreams.
pub struct QueryRouter {
    config: Arc<Config>,
    rules: SharedRules,
    dispatcher: Arc<Dispatcher>,
}

impl QueryRouter {
    /// Create a router bound to a config snapshot and a shared rule set.
    pub fn new(config: Arc<Config>, rules: SharedRules, dispatcher: Arc<Dispatcher>) -> Self {
        Self {
            config,
            rules,
            dispatcher,
        }
    }

    /// Handle one inbound datagram and return the datagram to send back.
    ///
    /// Returns `None` when the datagram is not a DNS message.
    pub async fn handle(&self, query: &[u8]) -> Option<Vec<u8>> {
        let timer = Timer::start();

        let request = match Message::from_vec(query) {
            Ok(request) => request,
            Err(e) => {
                debug!(error = %e, "Dropping malformed query");
                metrics::record_query(QueryResult::Malformed, timer.elapsed());
                return None;
            }
        };

        if self.config.verbose {
            for question in request.queries() {
                info!(
                    qtype = %question.query_type(),
                    class = %question.query_class(),
                    name = %question.name(),
                    "Query"
                );
            }
        }

        for upstream in &self.config.upstreams {
            let addr = upstream.addr();

            match exchange(&addr, query, request.id(), self.config.upstream_timeout).await {
                Ok((raw, response)) => {
                    trace!(upstream = %addr, answers = response.answers().len(), "Upstream answered");
                    self.dispatch_matches(&response).await;
                    metrics::record_query(QueryResult::Forwarded, timer.elapsed());
                    return Some(raw);
                }
                Err(e) => {
                    warn!(upstream = %addr, error = %e, "Upstream not available");
                    metrics::record_upstream_failure(&addr);
                }
            }
        }

        warn!(id = request.id(), "No upstream available");
        metrics::record_query(QueryResult::ServFail, timer.elapsed());
        servfail(&request)
    }

    async fn dispatch_matches(&self, response: &Message) {
        let rules = self.rules.load();
        if rules.is_empty() {
            return;
        }

        for group in group_answers(response.answers()) {
            let Some(rule) = rules.find(&group.domain) else {
                continue;
            };

            metrics::record_rule_match(&rule.tag);
            let event = MatchEvent {
                tag: rule.tag.clone(),
                domain: group.domain,
                client_ip: None,
                ipv4: group.ipv4,
                ipv6: group.ipv6,
            };
            self.dispatcher.dispatch_event(&self.config, event).await;
        }
    }
}

/// Send the raw query to one upstream and wait for the response with the same ID.
async fn exchange(
    addr: &str,
    query: &[u8],
    id: u16,
    timeout: Duration,
) -> Result<(Vec<u8>, Message), UpstreamError> {
    let peer = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or(UpstreamError::NoAddress)?;

    let local = if peer.is_ipv4() {
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))
    } else {
        SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0))
    };
    let socket = UdpSocket::bind(local).await?;
    socket.connect(peer).await?;
    socket.send(query).await?;

    let mut buf = vec![0u8; MAX_DATAGRAM];
    let received = tokio::time::timeout(timeout, async {
        loop {
            let len = socket.recv(&mut buf).await?;
            let response = Message::from_vec(&buf[..len])?;
            if response.id() == id {
                return Ok::<_, UpstreamError>((buf[..len].to_vec(), response));
            }
            trace!(expected = id, got = response.id(), "Ignoring response with stale ID");
        }
    })
    .await;

    received.map_err(|_| UpstreamError::Timeout)?
}

/// SERVFAIL response echoing the request's ID and questions.
fn servfail(request: &Message) -> Option<Vec<u8>> {
    let mut response = Message::new();
    response.set_id(request.id());
    response.set_message_type(MessageType::Response);
    response.set_op_code(request.op_code());
    response.set_recursion_desired(request.recursion_desired());
    response.set_response_code(ResponseCode::ServFail);
    response.add_queries(request.queries().to_vec());

    match response.to_vec() {
        Ok(bytes) => Some(bytes),
        Err(e) => {
            warn!(error = %e, "Failed to encode SERVFAIL response");
            None
        }
    }
}
