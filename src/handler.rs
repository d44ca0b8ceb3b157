use crate::blocklist::Blocklist;
use crate::config::{Config, Nameserver};
use crate::resolver::Resolver;
use crate::store::RecordStore;
use crate::upstream::Exchange;
use hickory_proto::op::{Message, MessageType, Query, ResponseCode};
use hickory_proto::rr::rdata::{A, NS};
use hickory_proto::rr::{Name, RData, Record};
use std::net::{Ipv4Addr, SocketAddr};
use std::str::FromStr;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// TTL for answers synthesized from the record table. Short on purpose so
/// live edits through the management API take effect quickly at clients.
const RECORD_TTL: u32 = 5;

/// TTL for the synthesized authority NS record.
const AUTHORITY_TTL: u32 = 3600;

/// Routes an inbound query to the authoritative dispatcher or the
/// recursion gate based on whether its first question falls under the
/// owned zone.
pub struct QueryRouter {
    zone_fqdn: String,
    dispatcher: QueryDispatcher,
    gate: RecursionGate,
}

impl QueryRouter {
    pub fn new(config: &Config, store: RecordStore, client: Arc<dyn Exchange>) -> Self {
        let blocklist = Blocklist::new(config.blocks.clone());
        Self {
            zone_fqdn: ensure_trailing_dot(&config.name).to_lowercase(),
            dispatcher: QueryDispatcher::new(config, store, client.clone()),
            gate: RecursionGate::new(config, blocklist, client),
        }
    }

    /// Produce the reply for one inbound query.
    pub async fn handle(&self, request: &Message, client: SocketAddr) -> Message {
        if self.owns(request) {
            self.dispatcher.handle(request, client).await
        } else {
            self.gate.handle(request, client).await
        }
    }

    /// Whether the query's first question is bound to the owned zone.
    fn owns(&self, request: &Message) -> bool {
        let Some(question) = request.queries().first() else {
            return false;
        };
        let name = question.name().to_string().to_lowercase();
        name == self.zone_fqdn || name.ends_with(&format!(".{}", self.zone_fqdn))
    }
}

/// Authoritative path: answers from the record table, forwarding what the
/// table does not own, and never failing the query outright.
pub struct QueryDispatcher {
    zone: String,
    store: RecordStore,
    resolver: Resolver,
    /// Synthesized NS record naming this server, built once at startup.
    authority: Option<Record>,
}

impl QueryDispatcher {
    pub fn new(config: &Config, store: RecordStore, client: Arc<dyn Exchange>) -> Self {
        let authority = build_authority_record(&config.name, &config.listen_host);
        if authority.is_none() {
            warn!(
                "cannot synthesize NS record for zone {:?} and host {:?}",
                config.name, config.listen_host
            );
        }
        Self {
            zone: config.name.clone(),
            store,
            resolver: Resolver::new(config.nameservers.clone(), client),
            authority,
        }
    }

    pub async fn handle(&self, request: &Message, client: SocketAddr) -> Message {
        let mut answers: Vec<Record> = Vec::new();
        let mut unknown: Vec<Query> = Vec::new();

        for question in request.queries() {
            let qname = question.name().to_string();

            match self.lookup(&qname) {
                Some(address) => match synthesize_a(question.name(), &address) {
                    Some(answer) => {
                        info!(
                            "{} ({}? {}) => {}",
                            client,
                            question.query_type(),
                            qname,
                            address
                        );
                        answers.push(answer);
                    }
                    None => {
                        warn!(
                            "stored address {:?} for {} is not a valid IPv4 address",
                            address, qname
                        );
                        unknown.push(question.clone());
                    }
                },
                None => {
                    info!("{} ({}? {}) => ??", client, question.query_type(), qname);
                    unknown.push(question.clone());
                }
            }
        }

        if !unknown.is_empty() {
            debug!("{} question(s) not in the record table, recursing", unknown.len());
            answers.extend(self.resolver.resolve(&unknown).await);
        }

        let mut reply = reply_skeleton(request);
        reply.set_authoritative(true);
        for answer in answers {
            reply.add_answer(answer);
        }
        if let Some(authority) = &self.authority {
            reply.add_name_server(authority.clone());
        }
        reply
    }

    /// Consult the store under the zone-suffix-stripped key first, then
    /// under the full question name. The canonical table is keyed by full
    /// matched hostname; the stripped key serves bare-host entries created
    /// through the management API.
    fn lookup(&self, qname: &str) -> Option<String> {
        let stripped = qname
            .strip_suffix(&format!(".{}", self.zone))
            .unwrap_or(qname);
        self.store
            .get(stripped)
            .or_else(|| self.store.get(qname))
    }
}

/// Wildcard path: blocklist validation, then whole-query forwarding with
/// verbatim relay of the first upstream success.
pub struct RecursionGate {
    blocklist: Blocklist,
    nameservers: Vec<Nameserver>,
    client: Arc<dyn Exchange>,
}

impl RecursionGate {
    pub fn new(config: &Config, blocklist: Blocklist, client: Arc<dyn Exchange>) -> Self {
        Self {
            blocklist,
            nameservers: config.nameservers.clone(),
            client,
        }
    }

    pub async fn handle(&self, request: &Message, client: SocketAddr) -> Message {
        for question in request.queries() {
            let qname = question.name().to_string();
            if self.blocklist.is_blocked(&qname) {
                info!(
                    "{} ({}? {}) blocked",
                    client,
                    question.query_type(),
                    qname
                );
                return servfail_reply(request);
            }
        }

        for nameserver in &self.nameservers {
            // The whole original query is forwarded unmodified; the
            // upstream's response carries the client's transaction id.
            match self.client.exchange(request, nameserver).await {
                Ok(response) => {
                    for question in request.queries() {
                        info!(
                            "{} ({}? {}) => {}",
                            client,
                            question.query_type(),
                            question.name(),
                            nameserver.address
                        );
                    }
                    return response;
                }
                Err(e) => {
                    warn!("recurse via {} failed: {}", nameserver.address, e);
                }
            }
        }

        warn!(
            "all nameservers failed for {:?} from {}",
            request
                .queries()
                .iter()
                .map(|q| q.name().to_string())
                .collect::<Vec<_>>(),
            client
        );
        servfail_reply(request)
    }
}

/// A SERVFAIL reply correlated to the request.
pub fn servfail_reply(request: &Message) -> Message {
    let mut reply = reply_skeleton(request);
    reply.set_response_code(ResponseCode::ServFail);
    reply
}

/// Response correlated to the request: id, opcode, questions and RD copied,
/// recursion available flagged.
fn reply_skeleton(request: &Message) -> Message {
    let mut reply = Message::new();
    reply.set_id(request.id());
    reply.set_message_type(MessageType::Response);
    reply.set_op_code(request.op_code());
    reply.set_recursion_desired(request.recursion_desired());
    reply.set_recursion_available(true);
    reply.add_queries(request.queries().iter().cloned());
    reply
}

/// Synthesize the A answer for a question name from the stored address.
fn synthesize_a(name: &Name, address: &str) -> Option<Record> {
    let address: Ipv4Addr = address.parse().ok()?;
    Some(Record::from_rdata(
        name.clone(),
        RECORD_TTL,
        RData::A(A(address)),
    ))
}

/// Synthesize the zone's authority record, `{zone} 3600 IN NS {host}.`.
fn build_authority_record(zone: &str, listen_host: &str) -> Option<Record> {
    let zone = Name::from_str(&ensure_trailing_dot(zone)).ok()?;
    let host = Name::from_str(&ensure_trailing_dot(listen_host)).ok()?;
    Some(Record::from_rdata(zone, AUTHORITY_TTL, RData::NS(NS(host))))
}

fn ensure_trailing_dot(name: &str) -> String {
    if name.ends_with('.') {
        name.to_string()
    } else {
        format!("{name}.")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Nameserver, Transport};
    use crate::error::ExchangeError;
    use async_trait::async_trait;
    use hickory_proto::rr::RecordType;
    use parking_lot::Mutex;
    use std::collections::HashMap;
    use std::time::Duration;

    const CLIENT: &str = "192.0.2.10:40000";

    fn nameserver(port: u16) -> Nameserver {
        Nameserver {
            address: format!("127.0.0.1:{port}").parse().unwrap(),
            timeout: Duration::from_secs(1),
            transport: Transport::Udp,
        }
    }

    fn config(nameservers: Vec<Nameserver>, blocks: Vec<&str>) -> Config {
        Config {
            name: "example.test.".to_string(),
            listen_host: "ns.example.test".to_string(),
            nameservers,
            blocks: blocks.into_iter().map(String::from).collect(),
            ..Default::default()
        }
    }

    fn request(names: &[&str]) -> Message {
        let mut message = Message::new();
        message.set_id(4321);
        message.set_recursion_desired(true);
        for name in names {
            message.add_query(Query::query(
                Name::from_str(name).unwrap(),
                RecordType::A,
            ));
        }
        message
    }

    fn a_record(name: &str, octet: u8) -> Record {
        Record::from_rdata(
            Name::from_str(name).unwrap(),
            300,
            RData::A(A::new(10, 9, 9, octet)),
        )
    }

    fn rdata_a_string(record: &Record) -> String {
        match record.data() {
            Some(RData::A(a)) => a.0.to_string(),
            other => panic!("expected A rdata, got {other:?}"),
        }
    }

    /// Scripted upstream shared by the dispatcher and gate tests.
    #[derive(Default)]
    struct ScriptedUpstream {
        answers: HashMap<std::net::SocketAddr, Vec<Record>>,
        failures: Vec<std::net::SocketAddr>,
        log: Mutex<Vec<std::net::SocketAddr>>,
    }

    impl ScriptedUpstream {
        fn answering(mut self, nameserver: &Nameserver, records: Vec<Record>) -> Self {
            self.answers.insert(nameserver.address, records);
            self
        }

        fn failing(mut self, nameserver: &Nameserver) -> Self {
            self.failures.push(nameserver.address);
            self
        }

        fn exchange_count(&self) -> usize {
            self.log.lock().len()
        }
    }

    #[async_trait]
    impl Exchange for ScriptedUpstream {
        async fn exchange(
            &self,
            message: &Message,
            nameserver: &Nameserver,
        ) -> Result<Message, ExchangeError> {
            self.log.lock().push(nameserver.address);

            if self.failures.contains(&nameserver.address) {
                return Err(ExchangeError::Timeout {
                    nameserver: nameserver.address,
                    wait: Duration::from_millis(1),
                });
            }

            let mut response = Message::new();
            response.set_id(message.id());
            response.set_message_type(MessageType::Response);
            response.add_queries(message.queries().iter().cloned());
            for record in self
                .answers
                .get(&nameserver.address)
                .into_iter()
                .flatten()
            {
                response.add_answer(record.clone());
            }
            Ok(response)
        }
    }

    fn router(config: &Config, store: RecordStore, upstream: Arc<ScriptedUpstream>) -> QueryRouter {
        QueryRouter::new(config, store, upstream)
    }

    #[tokio::test]
    async fn test_authoritative_full_hit() {
        let ns = nameserver(5301);
        let upstream = Arc::new(ScriptedUpstream::default());
        let store = RecordStore::new();
        store.put("a.example.test.", "10.0.0.1");
        let router = router(&config(vec![ns], vec![]), store, upstream.clone());

        let reply = router
            .handle(&request(&["a.example.test."]), CLIENT.parse().unwrap())
            .await;

        assert_eq!(reply.id(), 4321);
        assert!(reply.authoritative());
        assert!(reply.recursion_available());
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
        assert_eq!(reply.answers()[0].name().to_string(), "a.example.test.");
        assert_eq!(reply.answers()[0].ttl(), 5);
        assert_eq!(rdata_a_string(&reply.answers()[0]), "10.0.0.1");

        // One synthesized NS record in the authority section
        assert_eq!(reply.name_servers().len(), 1);
        assert_eq!(reply.name_servers()[0].name().to_string(), "example.test.");
        assert_eq!(reply.name_servers()[0].ttl(), 3600);

        // Fully answered from the table, no upstream traffic
        assert_eq!(upstream.exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_authoritative_miss_is_forwarded() {
        let ns = nameserver(5301);
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .answering(&ns, vec![a_record("b.example.test.", 7)]),
        );
        let store = RecordStore::new();
        store.put("a.example.test.", "10.0.0.1");
        let router = router(&config(vec![ns], vec![]), store, upstream.clone());

        let reply = router
            .handle(
                &request(&["a.example.test.", "b.example.test."]),
                CLIENT.parse().unwrap(),
            )
            .await;

        assert_eq!(reply.answers().len(), 2);
        assert_eq!(rdata_a_string(&reply.answers()[0]), "10.0.0.1");
        assert_eq!(rdata_a_string(&reply.answers()[1]), "10.9.9.7");
        assert_eq!(upstream.exchange_count(), 1);
    }

    #[tokio::test]
    async fn test_authoritative_unresolved_degrades_to_noerror() {
        let ns = nameserver(5301);
        let upstream = Arc::new(ScriptedUpstream::default().failing(&ns));
        let router = router(
            &config(vec![ns], vec![]),
            RecordStore::new(),
            upstream.clone(),
        );

        let reply = router
            .handle(&request(&["b.example.test."]), CLIENT.parse().unwrap())
            .await;

        // Never SERVFAIL on the authoritative path
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert!(reply.answers().is_empty());
        assert_eq!(reply.name_servers().len(), 1);
    }

    #[tokio::test]
    async fn test_bare_key_lookup_via_stripped_suffix() {
        // Entries created through the management API may be keyed by the
        // bare host; the dispatcher strips the zone suffix to find them.
        let ns = nameserver(5301);
        let upstream = Arc::new(ScriptedUpstream::default());
        let store = RecordStore::new();
        store.put("a", "10.0.0.3");
        let router = router(&config(vec![ns], vec![]), store, upstream.clone());

        let reply = router
            .handle(&request(&["a.example.test."]), CLIENT.parse().unwrap())
            .await;

        assert_eq!(reply.answers().len(), 1);
        assert_eq!(rdata_a_string(&reply.answers()[0]), "10.0.0.3");
        assert_eq!(upstream.exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_wildcard_query_is_relayed_verbatim() {
        let first = nameserver(5301);
        let second = nameserver(5302);
        let upstream = Arc::new(
            ScriptedUpstream::default()
                .failing(&first)
                .answering(&second, vec![a_record("ok.other.test.", 4)]),
        );
        let router = router(
            &config(vec![first, second], vec![]),
            RecordStore::new(),
            upstream.clone(),
        );

        let reply = router
            .handle(&request(&["ok.other.test."]), CLIENT.parse().unwrap())
            .await;

        assert_eq!(reply.id(), 4321);
        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
        // Relay carries the upstream response untouched, so no authority
        // record is synthesized on this path
        assert!(reply.name_servers().is_empty());
        assert_eq!(upstream.exchange_count(), 2);
    }

    #[tokio::test]
    async fn test_blocked_query_servfails_without_upstream_traffic() {
        let ns = nameserver(5301);
        let upstream = Arc::new(ScriptedUpstream::default());
        let router = router(
            &config(vec![ns], vec!["ads."]),
            RecordStore::new(),
            upstream.clone(),
        );

        let reply = router
            .handle(&request(&["evil.ads.test."]), CLIENT.parse().unwrap())
            .await;

        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(reply.id(), 4321);
        assert!(reply.recursion_available());
        assert_eq!(upstream.exchange_count(), 0);
    }

    #[tokio::test]
    async fn test_blocklist_does_not_gate_the_owned_zone() {
        // Blocklist only applies on the wildcard path
        let ns = nameserver(5301);
        let upstream = Arc::new(ScriptedUpstream::default());
        let store = RecordStore::new();
        store.put("ads.example.test.", "10.0.0.9");
        let router = router(&config(vec![ns], vec!["ads."]), store, upstream.clone());

        let reply = router
            .handle(&request(&["ads.example.test."]), CLIENT.parse().unwrap())
            .await;

        assert_eq!(reply.response_code(), ResponseCode::NoError);
        assert_eq!(reply.answers().len(), 1);
    }

    #[tokio::test]
    async fn test_exhausted_gate_servfails() {
        let first = nameserver(5301);
        let second = nameserver(5302);
        let upstream = Arc::new(
            ScriptedUpstream::default().failing(&first).failing(&second),
        );
        let router = router(
            &config(vec![first, second], vec![]),
            RecordStore::new(),
            upstream.clone(),
        );

        let reply = router
            .handle(&request(&["ok.other.test."]), CLIENT.parse().unwrap())
            .await;

        assert_eq!(reply.response_code(), ResponseCode::ServFail);
        assert_eq!(upstream.exchange_count(), 2);
    }

    #[tokio::test]
    async fn test_idempotent_replies() {
        let ns = nameserver(5301);
        let upstream = Arc::new(ScriptedUpstream::default());
        let store = RecordStore::new();
        store.put("a.example.test.", "10.0.0.1");
        let router = router(&config(vec![ns], vec![]), store, upstream);

        let query = request(&["a.example.test."]);
        let first = router.handle(&query, CLIENT.parse().unwrap()).await;
        let second = router.handle(&query, CLIENT.parse().unwrap()).await;

        assert_eq!(first.to_vec().unwrap(), second.to_vec().unwrap());
    }

    #[test]
    fn test_zone_routing() {
        let ns = nameserver(5301);
        let upstream = Arc::new(ScriptedUpstream::default());
        let router = router(&config(vec![ns], vec![]), RecordStore::new(), upstream);

        assert!(router.owns(&request(&["a.example.test."])));
        assert!(router.owns(&request(&["A.Example.Test."])));
        assert!(router.owns(&request(&["example.test."])));
        assert!(!router.owns(&request(&["other.test."])));
        assert!(!router.owns(&request(&["notexample.test."])));
        assert!(!router.owns(&Message::new()));
    }
}
