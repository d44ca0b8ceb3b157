use crate::config::Nameserver;
use crate::upstream::Exchange;
use hickory_proto::op::{Message, Query};
use hickory_proto::rr::Record;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};
use tracing::{debug, warn};

static QUERY_ID_COUNTER: AtomicU16 = AtomicU16::new(1);

fn next_query_id() -> u16 {
    QUERY_ID_COUNTER.fetch_add(1, Ordering::Relaxed)
}

/// Batch forwarder for questions the owned zone cannot answer.
///
/// Walks the configured nameservers in priority order, issuing at most one
/// combined exchange per nameserver per resolution pass, and harvests
/// answers for names still outstanding. Partial results merge across
/// nameservers; names nobody answered are simply absent from the result.
pub struct Resolver {
    nameservers: Vec<Nameserver>,
    client: Arc<dyn Exchange>,
}

impl Resolver {
    pub fn new(nameservers: Vec<Nameserver>, client: Arc<dyn Exchange>) -> Self {
        Self {
            nameservers,
            client,
        }
    }

    /// Resolve a batch of questions against the fallback chain.
    pub async fn resolve(&self, questions: &[Query]) -> Vec<Record> {
        // Duplicate names collapse to one outstanding entry. This is load
        // reduction, not a protocol requirement.
        let mut outstanding: HashMap<String, Query> = questions
            .iter()
            .map(|question| (question.name().to_string(), question.clone()))
            .collect();
        let mut answers = Vec::new();

        for nameserver in &self.nameservers {
            if outstanding.is_empty() {
                break;
            }

            // The upstream sees the original full batch, not the unresolved
            // subset; only the harvest below is keyed on what is still open.
            let mut query = Message::new();
            query.set_id(next_query_id());
            query.set_recursion_desired(true);
            query.add_queries(questions.iter().cloned());

            match self.client.exchange(&query, nameserver).await {
                Ok(response) => {
                    for answer in response.answers() {
                        // Exact string match on the owner name, no case folding.
                        let owner = answer.name().to_string();
                        if outstanding.remove(&owner).is_some() {
                            debug!("{} answered by {}", owner, nameserver.address);
                        }
                        answers.push(answer.clone());
                    }
                }
                Err(e) => {
                    warn!("resolve via {} failed: {}", nameserver.address, e);
                }
            }
        }

        if !outstanding.is_empty() {
            debug!(
                "{} name(s) unresolved after exhausting nameservers",
                outstanding.len()
            );
        }

        answers
    }
}
