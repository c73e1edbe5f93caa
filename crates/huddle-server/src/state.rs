use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use huddle_store::Database;

use crate::broadcast::{Broadcaster, ClusterRelay, LocalOnly};
use crate::config::ServerConfig;
use crate::identity::IdentityProvider;
use crate::ledger::EventLedger;
use crate::membership::MembershipService;
use crate::registry::SessionRegistry;
use crate::store::Store;
use crate::typing::TypingNotifier;
use crate::users::UserService;

/// Every component, wired once at startup and shared by all connections.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub store: Store,
    pub registry: SessionRegistry,
    pub broadcaster: Broadcaster,
    pub ledger: EventLedger,
    pub membership: MembershipService,
    pub typing: TypingNotifier,
    pub users: UserService,
    pub started_at: Instant,
    open_sockets: Arc<AtomicUsize>,
}

impl AppState {
    pub fn new(config: ServerConfig, db: Database, identity: Arc<dyn IdentityProvider>) -> Self {
        Self::with_relay(config, db, identity, Arc::new(LocalOnly))
    }

    pub fn with_relay(
        config: ServerConfig,
        db: Database,
        identity: Arc<dyn IdentityProvider>,
        relay: Arc<dyn ClusterRelay>,
    ) -> Self {
        let store = Store::new(db);
        let registry = SessionRegistry::new();
        let broadcaster = Broadcaster::with_relay(registry.clone(), store.clone(), relay);
        let ledger = EventLedger::new(store.clone(), broadcaster.clone());
        let membership =
            MembershipService::new(store.clone(), broadcaster.clone(), ledger.clone());
        let typing = TypingNotifier::new(store.clone(), broadcaster.clone());
        let users = UserService::new(store.clone(), ledger.clone(), identity);

        Self {
            config: Arc::new(config),
            store,
            registry,
            broadcaster,
            ledger,
            membership,
            typing,
            users,
            started_at: Instant::now(),
            open_sockets: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Reserve a socket slot, honouring `max_connections`. The slot is
    /// released when the returned guard drops.
    pub fn try_open_socket(&self) -> Option<SocketSlot> {
        let max = self.config.max_connections;
        let mut current = self.open_sockets.load(Ordering::Relaxed);
        loop {
            if max != 0 && current >= max {
                return None;
            }
            match self.open_sockets.compare_exchange_weak(
                current,
                current + 1,
                Ordering::AcqRel,
                Ordering::Relaxed,
            ) {
                Ok(_) => {
                    return Some(SocketSlot {
                        counter: self.open_sockets.clone(),
                    })
                }
                Err(actual) => current = actual,
            }
        }
    }

    pub fn open_sockets(&self) -> usize {
        self.open_sockets.load(Ordering::Relaxed)
    }
}

pub struct SocketSlot {
    counter: Arc<AtomicUsize>,
}

impl Drop for SocketSlot {
    fn drop(&mut self) {
        self.counter.fetch_sub(1, Ordering::AcqRel);
    }
}
