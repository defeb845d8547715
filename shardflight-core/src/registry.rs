//! Stream registry
//!
//! Maps tickets to the producers registered by the query layer. Entries are
//! single-use: the delivery handler removes an entry at the end of its one
//! consumption attempt, after which the ticket is indistinguishable from one
//! that never existed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{StreamError, StreamResult};
use crate::listener::CallContext;
use crate::producer::StreamProducer;
use crate::relay::{ProxyStreamProducer, RemoteStreamConnector};
use crate::ticket::StreamTicket;

struct StreamEntry {
    producer: Arc<dyn StreamProducer>,
    registered_at: Instant,
    /// Set while a consumer is streaming this entry.
    consumer: Option<CallContext>,
}

pub struct StreamManager {
    node_id: String,
    streams: DashMap<StreamTicket, StreamEntry>,
    connector: Option<Arc<dyn RemoteStreamConnector>>,
    closed: AtomicBool,
}

impl StreamManager {
    /// Create a registry for `node_id`. Without a connector, tickets owned by
    /// other nodes resolve to not-found.
    #[must_use]
    pub fn new(node_id: impl Into<String>, connector: Option<Arc<dyn RemoteStreamConnector>>) -> Self {
        Self {
            node_id: node_id.into(),
            streams: DashMap::new(),
            connector,
            closed: AtomicBool::new(false),
        }
    }

    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.node_id
    }

    /// Register `producer` and return the ticket that fetches it.
    pub fn register_stream(&self, producer: Arc<dyn StreamProducer>) -> StreamResult<StreamTicket> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Unavailable("stream registry is closed".to_string()));
        }

        loop {
            let ticket = StreamTicket::new(Uuid::new_v4().to_string(), self.node_id.clone())?;
            match self.streams.entry(ticket.clone()) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(slot) => {
                    debug!(
                        ticket = %ticket,
                        action = producer.action_name(),
                        "Registered stream"
                    );
                    slot.insert(StreamEntry {
                        producer,
                        registered_at: Instant::now(),
                        consumer: None,
                    });
                    return Ok(ticket);
                }
            }
        }
    }

    fn is_local(&self, ticket: &StreamTicket) -> bool {
        ticket.node_id() == self.node_id
    }

    fn relay_for(&self, ticket: &StreamTicket) -> StreamResult<Arc<dyn StreamProducer>> {
        let connector = self.connector.clone().ok_or_else(|| {
            StreamError::NotFound(format!(
                "{ticket} is owned by node {} and relaying is not configured",
                ticket.node_id()
            ))
        })?;
        Ok(Arc::new(ProxyStreamProducer::new(ticket.clone(), connector)))
    }

    /// Resolve `ticket` to a producer. Tickets owned by another node resolve
    /// to a relay producer forwarding from that node.
    pub fn get_stream(&self, ticket: &StreamTicket) -> StreamResult<Arc<dyn StreamProducer>> {
        if !self.is_local(ticket) {
            return self.relay_for(ticket);
        }
        self.streams
            .get(ticket)
            .map(|entry| entry.producer.clone())
            .ok_or_else(|| StreamError::NotFound(ticket.to_string()))
    }

    /// Resolve `ticket` for consumption by `ctx`. A local entry can be held
    /// by one consumer at a time; a second concurrent consumer is refused.
    pub fn acquire_stream(
        &self,
        ticket: &StreamTicket,
        ctx: &CallContext,
    ) -> StreamResult<Arc<dyn StreamProducer>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(StreamError::Unavailable("stream registry is closed".to_string()));
        }
        if !self.is_local(ticket) {
            return self.relay_for(ticket);
        }

        let mut entry = self
            .streams
            .get_mut(ticket)
            .ok_or_else(|| StreamError::NotFound(ticket.to_string()))?;
        if entry.consumer.is_some() {
            return Err(StreamError::SecondConsumer(ticket.to_string()));
        }
        entry.consumer = Some(ctx.clone());
        debug!(
            ticket = %ticket,
            waited_ms = entry.registered_at.elapsed().as_millis() as u64,
            "Stream acquired"
        );
        Ok(entry.producer.clone())
    }

    /// Forget `ticket`. Removing an absent ticket is a no-op.
    pub fn remove_stream(&self, ticket: &StreamTicket) {
        if self.streams.remove(ticket).is_some() {
            debug!(ticket = %ticket, "Removed stream");
        }
    }

    #[must_use]
    pub fn contains(&self, ticket: &StreamTicket) -> bool {
        self.streams.contains_key(ticket)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.streams.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.streams.is_empty()
    }

    /// Refuse new registrations, cancel in-flight consumers and drop every
    /// entry. Consumers finish their own cleanup; their removals become no-ops.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        // One pass under each shard's write lock, so a concurrent acquire
        // either lands before the drain or finds nothing.
        let mut in_flight: Vec<CallContext> = Vec::new();
        let mut total = 0usize;
        self.streams.retain(|_, entry| {
            total += 1;
            if let Some(ctx) = entry.consumer.take() {
                in_flight.push(ctx);
            }
            false
        });

        if !in_flight.is_empty() {
            warn!(count = in_flight.len(), "Cancelling in-flight streams on close");
        }
        // Cancel outside the map: handlers may call back into the registry.
        for ctx in in_flight {
            ctx.cancel();
        }
        info!(streams = total, node_id = %self.node_id, "Stream registry closed");
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::thread;
    use std::time::Duration;

    use arrow::datatypes::{DataType, Field, Schema};

    use super::*;
    use crate::producer::MemoryStreamProducer;
    use crate::relay::MockRemoteStreamConnector;

    fn producer() -> Arc<dyn StreamProducer> {
        let schema = Arc::new(Schema::new(vec![Field::new("id", DataType::Int64, false)]));
        Arc::new(MemoryStreamProducer::try_new(schema, Vec::new(), Duration::from_secs(1)).unwrap())
    }

    #[test]
    fn test_register_get_remove() {
        let manager = StreamManager::new("node-a", None);
        let ticket = manager.register_stream(producer()).unwrap();
        assert_eq!(ticket.node_id(), "node-a");
        assert!(manager.get_stream(&ticket).is_ok());
        assert_eq!(manager.len(), 1);

        manager.remove_stream(&ticket);
        manager.remove_stream(&ticket);
        assert!(matches!(manager.get_stream(&ticket), Err(StreamError::NotFound(_))));
        assert!(manager.is_empty());
    }

    #[test]
    fn test_tickets_are_unique() {
        let manager = StreamManager::new("node-a", None);
        let p = producer();
        let a = manager.register_stream(p.clone()).unwrap();
        let b = manager.register_stream(p).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_concurrent_registration() {
        let manager = Arc::new(StreamManager::new("node-a", None));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let manager = manager.clone();
                thread::spawn(move || {
                    (0..100)
                        .map(|_| manager.register_stream(producer()).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut all = HashSet::new();
        for handle in handles {
            for ticket in handle.join().unwrap() {
                assert!(all.insert(ticket));
            }
        }
        assert_eq!(manager.len(), 800);
    }

    #[test]
    fn test_second_consumer_refused() {
        let manager = StreamManager::new("node-a", None);
        let ticket = manager.register_stream(producer()).unwrap();

        manager.acquire_stream(&ticket, &CallContext::new()).unwrap();
        assert!(matches!(
            manager.acquire_stream(&ticket, &CallContext::new()),
            Err(StreamError::SecondConsumer(_))
        ));
        // Plain lookups are unaffected.
        assert!(manager.get_stream(&ticket).is_ok());
    }

    #[test]
    fn test_remote_ticket_resolves_to_relay() {
        let manager = StreamManager::new("node-a", Some(Arc::new(MockRemoteStreamConnector::new())));
        let remote = StreamTicket::new("abc", "node-b").unwrap();
        let relay = manager.get_stream(&remote).unwrap();
        assert_eq!(relay.action_name(), "relay");
        assert!(!manager.contains(&remote));

        let isolated = StreamManager::new("node-a", None);
        assert!(matches!(isolated.get_stream(&remote), Err(StreamError::NotFound(_))));
    }

    #[test]
    fn test_close_cancels_in_flight_and_refuses_new() {
        let manager = StreamManager::new("node-a", None);
        let idle = manager.register_stream(producer()).unwrap();
        let busy = manager.register_stream(producer()).unwrap();
        let ctx = CallContext::new();
        manager.acquire_stream(&busy, &ctx).unwrap();

        manager.close();
        assert!(ctx.is_cancelled());
        assert!(!manager.contains(&idle));
        assert!(matches!(
            manager.register_stream(producer()),
            Err(StreamError::Unavailable(_))
        ));
        manager.remove_stream(&busy);
        manager.close();
    }

    #[test]
    fn test_close_racing_acquires_cancels_every_consumer() {
        let manager = Arc::new(StreamManager::new("node-a", None));
        let tickets: Vec<_> = (0..400)
            .map(|_| manager.register_stream(producer()).unwrap())
            .collect();

        let workers: Vec<_> = tickets
            .chunks(100)
            .map(|chunk| {
                let manager = manager.clone();
                let chunk = chunk.to_vec();
                thread::spawn(move || {
                    chunk
                        .iter()
                        .filter_map(|ticket| {
                            let ctx = CallContext::new();
                            manager.acquire_stream(ticket, &ctx).ok().map(|_| ctx)
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();
        thread::sleep(Duration::from_millis(1));
        manager.close();

        for worker in workers {
            for ctx in worker.join().unwrap() {
                assert!(ctx.is_cancelled());
            }
        }
        assert!(manager.is_empty());
    }
}
