//! Scripted in-memory transport for tests

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::future::BoxFuture;
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::{KeeperError, Result};
use crate::network::{Connection, Transport};
use crate::types::{PeerId, Presence};

/// One call made by the core on the transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Connect,
    Keepalive,
    Presence(Presence),
    Disco(PeerId),
    Join(PeerId, String),
    Ping(PeerId),
    Close,
}

/// Failure injection; counters fail the next N calls, flags fail every call
#[derive(Debug, Default)]
pub(crate) struct Faults {
    pub connect: AtomicUsize,
    pub keepalive: AtomicUsize,
    /// Keepalives that never complete
    pub hung_keepalive: AtomicUsize,
    pub presence: AtomicBool,
    pub disco: AtomicBool,
    pub join: AtomicBool,
    pub ping: AtomicBool,
    pub close: AtomicBool,
}

fn take_one(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

type Responder = Arc<dyn Fn(&Call) + Send + Sync>;

#[derive(Default)]
struct MockInner {
    calls: Mutex<Vec<(Instant, Call)>>,
    faults: Faults,
    responder: Mutex<Option<Responder>>,
    connections: AtomicUsize,
}

/// Transport that records calls and answers through an optional responder
#[derive(Clone, Default)]
pub(crate) struct MockTransport {
    inner: Arc<MockInner>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn faults(&self) -> &Faults {
        &self.inner.faults
    }

    /// Called after every recorded call, typically to deliver inbound events
    pub fn set_responder(&self, responder: impl Fn(&Call) + Send + Sync + 'static) {
        *self.inner.responder.lock().unwrap() = Some(Arc::new(responder));
    }

    pub fn calls(&self) -> Vec<Call> {
        self.timed_calls().into_iter().map(|(_, call)| call).collect()
    }

    pub fn timed_calls(&self) -> Vec<(Instant, Call)> {
        self.inner.calls.lock().unwrap().clone()
    }

    pub fn count(&self, pred: impl Fn(&Call) -> bool) -> usize {
        self.calls().iter().filter(|call| pred(call)).count()
    }

    fn record(&self, call: Call) {
        self.inner
            .calls
            .lock()
            .unwrap()
            .push((Instant::now(), call.clone()));

        let responder = self.inner.responder.lock().unwrap().clone();
        if let Some(responder) = responder {
            responder(&call);
        }
    }
}

impl Transport for MockTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            self.record(Call::Connect);
            if take_one(&self.inner.faults.connect) {
                return Err(KeeperError::transport("connection refused"));
            }

            let n = self.inner.connections.fetch_add(1, Ordering::SeqCst) + 1;
            let connection = MockConnection {
                transport: self.clone(),
                identity: PeerId::parse(format!("echo@example.org/{}", n))?,
                closed: AtomicBool::new(false),
            };
            Ok(Arc::new(connection) as Arc<dyn Connection>)
        })
    }
}

pub(crate) struct MockConnection {
    transport: MockTransport,
    identity: PeerId,
    closed: AtomicBool,
}

impl MockConnection {
    fn call(&self, call: Call, fail: bool) -> Result<()> {
        self.transport.record(call.clone());
        if self.closed.load(Ordering::SeqCst) {
            return Err(KeeperError::transport("connection closed"));
        }
        if fail {
            return Err(KeeperError::transport(format!("{:?} failed", call)));
        }
        Ok(())
    }
}

impl Connection for MockConnection {
    fn identity(&self) -> &PeerId {
        &self.identity
    }

    fn keepalive(&self) -> BoxFuture<'_, Result<()>> {
        let hang = take_one(&self.transport.faults().hung_keepalive);
        let fail = take_one(&self.transport.faults().keepalive);
        Box::pin(async move {
            if hang {
                self.transport.record(Call::Keepalive);
                return futures::future::pending().await;
            }
            self.call(Call::Keepalive, fail)
        })
    }

    fn send_presence(&self, presence: Presence) -> BoxFuture<'_, Result<()>> {
        let fail = self.transport.faults().presence.load(Ordering::SeqCst);
        Box::pin(async move { self.call(Call::Presence(presence), fail) })
    }

    fn discover_info<'a>(&'a self, target: &'a PeerId) -> BoxFuture<'a, Result<()>> {
        let fail = self.transport.faults().disco.load(Ordering::SeqCst);
        Box::pin(async move { self.call(Call::Disco(target.clone()), fail) })
    }

    fn join_room<'a>(&'a self, room: &'a PeerId, nickname: &'a str) -> BoxFuture<'a, Result<()>> {
        let fail = self.transport.faults().join.load(Ordering::SeqCst);
        Box::pin(async move { self.call(Call::Join(room.clone(), nickname.to_string()), fail) })
    }

    fn ping_peer<'a>(&'a self, target: &'a PeerId) -> BoxFuture<'a, Result<()>> {
        let fail = self.transport.faults().ping.load(Ordering::SeqCst);
        Box::pin(async move { self.call(Call::Ping(target.clone()), fail) })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        let fail = self.transport.faults().close.load(Ordering::SeqCst);
        Box::pin(async move {
            let result = self.call(Call::Close, fail);
            self.closed.store(true, Ordering::SeqCst);
            result
        })
    }
}

pub(crate) fn room(name: &str) -> PeerId {
    PeerId::parse(format!("{}@conference.example.org", name)).unwrap()
}

/// Default tunables, server example.org, nick "echo"
pub(crate) fn config(rooms: &[&str]) -> SessionConfig {
    SessionConfig::new("example.org", "echo").with_rooms(rooms.iter().map(|r| room(r)).collect())
}
