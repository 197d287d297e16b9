//! In-process stand-in for an XMPP server
//!
//! Answers discovery, confirms joins and returns pongs a little later,
//! through the same event channel a stanza router would use. Every call can
//! be made to fail at random to watch the keeper recover.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use jabber_keeper::{
    features, Connection, FeatureSet, InboundEvent, KeeperError, PeerId, Presence, Result,
    SessionConfig, Transport,
};
use rand::Rng;

/// Settings shared by the transport and its connections
struct Server {
    jid: PeerId,
    user: String,
    resource: String,
    protected: Vec<PeerId>,
    fail_rate: f64,
    events: flume::Sender<InboundEvent>,
    connections: AtomicUsize,
}

impl Server {
    /// Fail with probability `fail_rate`
    fn roll(&self, what: &str) -> Result<()> {
        if self.fail_rate > 0.0 && rand::rng().random_bool(self.fail_rate) {
            return Err(KeeperError::transport(format!("injected failure on {}", what)));
        }
        Ok(())
    }

    /// Deliver `event` after a short random latency
    fn reply(&self, event: InboundEvent) {
        let events = self.events.clone();
        let latency = Duration::from_millis(rand::rng().random_range(5..150));
        tokio::spawn(async move {
            tokio::time::sleep(latency).await;
            // Router gone means we are shutting down
            let _ = events.send(event);
        });
    }

    fn features_of(&self, target: &PeerId) -> FeatureSet {
        if *target == self.jid {
            return FeatureSet::from([(features::PING.to_string(), true)]);
        }

        let protected = self.protected.contains(&target.bare());
        FeatureSet::from([
            (features::MUC_UNSECURED.to_string(), !protected),
            (features::MUC_PASSWORD_PROTECTED.to_string(), protected),
            (features::MUC_SELF_PING_OPTIMIZATION.to_string(), true),
        ])
    }
}

/// Transport whose connections never leave the process
#[derive(Clone)]
pub struct LoopbackTransport {
    server: Arc<Server>,
}

impl LoopbackTransport {
    pub fn new(
        config: &SessionConfig,
        events: flume::Sender<InboundEvent>,
        fail_rate: f64,
        protected: Vec<PeerId>,
    ) -> Result<Self> {
        Ok(Self {
            server: Arc::new(Server {
                jid: config.server_jid()?,
                user: config.user.clone(),
                resource: config
                    .resource
                    .clone()
                    .unwrap_or_else(|| "jabber_echo".to_string()),
                protected,
                fail_rate,
                events,
                connections: AtomicUsize::new(0),
            }),
        })
    }
}

impl Transport for LoopbackTransport {
    fn connect(&self) -> BoxFuture<'_, Result<Arc<dyn Connection>>> {
        Box::pin(async move {
            self.server.roll("connect")?;

            let n = self.server.connections.fetch_add(1, Ordering::SeqCst) + 1;
            let identity = PeerId::parse(format!("{}/{}-{}", self.server.user, self.server.resource, n))?;
            tracing::debug!("Loopback connection {} opened", identity);

            Ok(Arc::new(LoopbackConnection {
                server: self.server.clone(),
                identity,
                closed: AtomicBool::new(false),
            }) as Arc<dyn Connection>)
        })
    }
}

struct LoopbackConnection {
    server: Arc<Server>,
    identity: PeerId,
    closed: AtomicBool,
}

impl LoopbackConnection {
    fn check(&self, what: &str) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(KeeperError::transport("connection closed"));
        }
        self.server.roll(what)
    }
}

impl Connection for LoopbackConnection {
    fn identity(&self) -> &PeerId {
        &self.identity
    }

    fn keepalive(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move { self.check("keepalive") })
    }

    fn send_presence(&self, presence: Presence) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.check("presence")?;
            match &presence.to {
                Some(to) => tracing::debug!("Loopback presence to {}: {}", to, presence.status),
                None => tracing::debug!("Loopback presence: {}", presence.status),
            }
            Ok(())
        })
    }

    fn discover_info<'a>(&'a self, target: &'a PeerId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check("disco#info")?;
            self.server.reply(InboundEvent::DiscoInfo {
                from: target.clone(),
                features: self.server.features_of(target),
            });
            Ok(())
        })
    }

    fn join_room<'a>(&'a self, room: &'a PeerId, nickname: &'a str) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check("join")?;
            self.server.reply(InboundEvent::RoomJoined {
                room: room.with_resource(nickname)?,
            });
            Ok(())
        })
    }

    fn ping_peer<'a>(&'a self, target: &'a PeerId) -> BoxFuture<'a, Result<()>> {
        Box::pin(async move {
            self.check("ping")?;
            self.server.reply(InboundEvent::Pong {
                from: target.clone(),
            });
            Ok(())
        })
    }

    fn close(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            self.closed.store(true, Ordering::SeqCst);
            tracing::debug!("Loopback connection {} closed", self.identity);
            Ok(())
        })
    }
}
