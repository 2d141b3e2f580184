// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Single-threaded reactor and dispatcher.
//!
//! One `mio::Poll` multiplexes every socket the resolver owns: client
//! listeners, upstream searchers and per-IOC heartbeat guards, each a
//! variant of the closed [`Conn`] set keyed by its poll token. Every
//! iteration services all readable sockets first, then runs the outgoing
//! pass over the connections in registration order (search ticks and
//! heartbeats), then the time-driven purge. All table mutations happen
//! here, so effects of one callback are visible to the next within the
//! same iteration.
//!
//! Connection-level errors never escape the loop: a failing socket takes
//! down its own connection (and, for guards, the cached PVs behind it) and
//! nothing else.

use crate::access::AccessControl;
use crate::config::Config;
use crate::directory::{Directory, IocEndpoint, Resolution};
use crate::ioc_guard::{GuardState, IocGuard};
use crate::listener::{ClientQuery, Listener};
use crate::searcher::{FoundPv, Searcher};
use mio::{Events, Interest, Poll, Token};
use std::collections::HashMap;
use std::io;
use std::net::SocketAddrV4;
use std::time::{Duration, Instant};

/// Default per-iteration poll timeout; also the scheduler tick period.
pub const POLL_TIMEOUT: Duration = Duration::from_millis(100);

/// Maximum readiness events drained per iteration.
const MAX_EVENTS: usize = 128;

/// Fatal conditions detected before the loop starts.
#[derive(Debug, thiserror::Error)]
pub enum SetupError {
    #[error("no usable listener address")]
    NoListener,

    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The closed set of connection kinds the reactor drives.
enum Conn {
    Listener(Listener),
    Searcher(Searcher),
    Guard(IocGuard),
}

/// Work extracted from a readiness event, applied after the connection
/// borrow is released.
enum Ready {
    Queries(Vec<ClientQuery>),
    Found(Vec<FoundPv>),
    GuardLost(IocEndpoint),
    Nothing,
}

pub struct Engine {
    poll: Poll,
    events: Events,
    conns: HashMap<Token, Conn>,
    /// Registration order; drives the outgoing pass.
    order: Vec<Token>,
    searcher_tokens: Vec<Token>,
    next_token: usize,
    directory: Directory,
    access: AccessControl,
    heartbeat_interval: Duration,
    connect_timeout: Duration,
    purge_delay: Duration,
    last_purge: Instant,
}

impl Engine {
    /// Build the reactor from a configuration. Individual interfaces that
    /// fail to set up are logged and skipped; ending up without any
    /// listener is fatal.
    pub fn new(config: Config) -> Result<Self, SetupError> {
        let mut engine = Self {
            poll: Poll::new()?,
            events: Events::with_capacity(MAX_EVENTS),
            conns: HashMap::new(),
            order: Vec::new(),
            searcher_tokens: Vec::new(),
            next_token: 0,
            directory: Directory::default(),
            access: config.access,
            heartbeat_interval: config.heartbeat_interval,
            connect_timeout: config.connect_timeout,
            purge_delay: config.purge_delay,
            last_purge: Instant::now(),
        };

        let mut listeners = 0;
        for addr in &config.listen_addresses {
            match Listener::bind(*addr) {
                Ok(listener) => {
                    log::info!("listening for client searches on {}", listener.local_addr());
                    engine.register(Conn::Listener(listener))?;
                    listeners += 1;
                }
                Err(err) => log::error!("failed to initialize listener {}: {}", addr, err),
            }
        }
        if listeners == 0 {
            return Err(SetupError::NoListener);
        }

        for addr in &config.search_addresses {
            match Searcher::new(*addr, &config.search_intervals) {
                Ok(searcher) => {
                    log::info!("searching upstream domain {}", addr);
                    let token = engine.register(Conn::Searcher(searcher))?;
                    engine.searcher_tokens.push(token);
                }
                Err(err) => log::error!("failed to initialize searcher {}: {}", addr, err),
            }
        }
        if engine.searcher_tokens.is_empty() {
            log::warn!("no usable upstream search address, serving from cache only");
        }

        Ok(engine)
    }

    /// One reactor iteration: poll, incoming pass, outgoing pass, sweep,
    /// purge tick. The timeout is clamped to at least 1 ms.
    pub fn run_once(&mut self, timeout: Duration) -> io::Result<()> {
        let timeout = timeout.max(Duration::from_millis(1));
        if let Err(err) = self.poll.poll(&mut self.events, Some(timeout)) {
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        let ready: Vec<(Token, bool, bool)> = self
            .events
            .iter()
            .map(|event| (event.token(), event.is_readable(), event.is_writable()))
            .collect();
        for (token, readable, writable) in ready {
            self.handle_ready(token, readable, writable);
        }

        // outgoing pass in registration order
        for token in self.order.clone() {
            let lost = match self.conns.get_mut(&token) {
                Some(Conn::Searcher(searcher)) => {
                    searcher.process_outgoing();
                    None
                }
                Some(Conn::Guard(guard)) => guard.process_outgoing().then(|| guard.endpoint()),
                _ => None,
            };
            if let Some(endpoint) = lost {
                self.on_ioc_lost(endpoint);
            }
        }

        self.sweep_closed();
        self.tick();
        Ok(())
    }

    /// Addresses the listeners actually bound to.
    pub fn listener_addrs(&self) -> Vec<SocketAddrV4> {
        self.order
            .iter()
            .filter_map(|token| match self.conns.get(token) {
                Some(Conn::Listener(listener)) => Some(listener.local_addr()),
                _ => None,
            })
            .collect()
    }

    pub fn cached_pv_count(&self) -> usize {
        self.directory.cached_count()
    }

    pub fn guarded_ioc_count(&self) -> usize {
        self.directory.ioc_count()
    }

    fn register(&mut self, mut conn: Conn) -> io::Result<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        let registry = self.poll.registry();
        match &mut conn {
            Conn::Listener(listener) => {
                registry.register(listener.socket_mut(), token, Interest::READABLE)?
            }
            Conn::Searcher(searcher) => {
                registry.register(searcher.socket_mut(), token, Interest::READABLE)?
            }
            Conn::Guard(guard) => registry.register(
                guard.stream_mut(),
                token,
                Interest::READABLE | Interest::WRITABLE,
            )?,
        }
        self.conns.insert(token, conn);
        self.order.push(token);
        Ok(token)
    }

    fn deregister(&mut self, token: Token) {
        if let Some(mut conn) = self.conns.remove(&token) {
            let registry = self.poll.registry();
            let result = match &mut conn {
                Conn::Listener(listener) => registry.deregister(listener.socket_mut()),
                Conn::Searcher(searcher) => registry.deregister(searcher.socket_mut()),
                Conn::Guard(guard) => registry.deregister(guard.stream_mut()),
            };
            if let Err(err) = result {
                log::trace!("deregister of token {:?} failed: {}", token, err);
            }
            self.order.retain(|t| *t != token);
            self.searcher_tokens.retain(|t| *t != token);
        }
    }

    fn handle_ready(&mut self, token: Token, readable: bool, writable: bool) {
        let ready = match self.conns.get_mut(&token) {
            Some(Conn::Listener(listener)) if readable => Ready::Queries(listener.process_incoming()),
            Some(Conn::Searcher(searcher)) if readable => Ready::Found(searcher.process_incoming()),
            Some(Conn::Guard(guard)) => {
                let mut lost = false;
                if writable {
                    lost = guard.on_writable();
                }
                if readable && !lost {
                    lost = guard.on_readable();
                }
                if lost {
                    Ready::GuardLost(guard.endpoint())
                } else {
                    Ready::Nothing
                }
            }
            _ => Ready::Nothing,
        };

        match ready {
            Ready::Queries(queries) => {
                for query in queries {
                    self.on_client_query(token, query);
                }
            }
            Ready::Found(found) => {
                for pv in found {
                    self.on_search_reply(pv);
                }
            }
            Ready::GuardLost(endpoint) => self.on_ioc_lost(endpoint),
            Ready::Nothing => {}
        }
    }

    /// Request path: ACL, cache lookup, then either a unicast reply or a
    /// freshly scheduled search.
    fn on_client_query(&mut self, listener_token: Token, query: ClientQuery) {
        let client_ip = query.client.ip().to_string();
        log::debug!("{} searching for {}", query.client, query.name);

        match self.resolve(&query.name, &client_ip) {
            Resolution::Denied => {}
            Resolution::Hit(reply) => {
                log::info!(
                    "client {} searched for {}, found in cache",
                    query.client,
                    query.name
                );
                if let Some(Conn::Listener(listener)) = self.conns.get_mut(&listener_token) {
                    listener.send_reply(&reply, query.chan_id, query.client);
                }
            }
            Resolution::Miss => {
                log::info!(
                    "client {} searched for {}, not in cache, starting the search",
                    query.client,
                    query.name
                );
                self.schedule_search(&query.name);
            }
        }
    }

    fn resolve(&mut self, name: &str, client_ip: &str) -> Resolution {
        if let Err(rule) = self.access.check(name, client_ip) {
            log::debug!(
                "rejected request from {} searching for {} due to '{}' rule",
                client_ip,
                name,
                rule
            );
            return Resolution::Denied;
        }
        match self.directory.lookup(name) {
            Some(reply) => Resolution::Hit(reply),
            None => Resolution::Miss,
        }
    }

    fn schedule_search(&mut self, name: &str) {
        for token in self.searcher_tokens.clone() {
            if let Some(Conn::Searcher(searcher)) = self.conns.get_mut(&token) {
                searcher.add_pv(name);
            }
        }
    }

    /// A searcher matched a reply: make sure the IOC has a guard, then
    /// cache the rewritten reply. If the guard cannot be set up the reply
    /// is dropped and the name goes back into search so the backoff
    /// retries.
    fn on_search_reply(&mut self, pv: FoundPv) {
        if self.directory.guard_token(&pv.ioc).is_none() {
            let guard = match IocGuard::connect(pv.ioc, self.heartbeat_interval, self.connect_timeout)
            {
                Ok(guard) => guard,
                Err(err) => {
                    log::info!("failed to connect to IOC {}: {}", pv.ioc, err);
                    self.schedule_search(&pv.name);
                    return;
                }
            };
            match self.register(Conn::Guard(guard)) {
                Ok(token) => {
                    log::debug!("monitoring IOC {}", pv.ioc);
                    self.directory.register_ioc(pv.ioc, token);
                }
                Err(err) => {
                    log::info!("failed to register IOC {} with the reactor: {}", pv.ioc, err);
                    self.schedule_search(&pv.name);
                    return;
                }
            }
        }
        // other upstream domains may still be searching this name
        self.cancel_search(&pv.name);
        self.directory.insert_pv(pv.name, pv.ioc, pv.reply);
    }

    fn cancel_search(&mut self, name: &str) {
        for token in self.searcher_tokens.clone() {
            if let Some(Conn::Searcher(searcher)) = self.conns.get_mut(&token) {
                searcher.remove_pv(name);
            }
        }
    }

    /// Heartbeat loss: retire the guard connection and evict every cached
    /// PV hosted on that IOC. Clients re-trigger the search on their next
    /// query.
    fn on_ioc_lost(&mut self, endpoint: IocEndpoint) {
        log::info!("lost IOC {}", endpoint);
        if let Some(token) = self.directory.remove_ioc(&endpoint) {
            self.deregister(token);
        }
    }

    /// Drop any guard that reached its terminal state outside the normal
    /// loss path.
    fn sweep_closed(&mut self) {
        let stale: Vec<Token> = self
            .conns
            .iter()
            .filter_map(|(token, conn)| match conn {
                Conn::Guard(guard) if guard.state() == GuardState::Lost => Some(*token),
                _ => None,
            })
            .collect();
        for token in stale {
            self.deregister(token);
        }
    }

    /// Time-driven cleanup: when the purge delay has elapsed, age out
    /// scheduler entries and cached records with the same threshold.
    fn tick(&mut self) {
        if self.last_purge.elapsed() < self.purge_delay {
            return;
        }
        self.last_purge = Instant::now();
        let max_age = self.purge_delay;
        log::trace!(
            "flushing entries not requested for more than {}s",
            max_age.as_secs()
        );
        for token in self.searcher_tokens.clone() {
            if let Some(Conn::Searcher(searcher)) = self.conns.get_mut(&token) {
                let (purged, remaining) = searcher.purge(max_age);
                log::trace!("purged {} searched PV(s), {} remain", purged, remaining);
            }
        }
        let (purged, remaining) = self.directory.purge(max_age);
        log::trace!("purged {} cached PV(s), {} remain", purged, remaining);
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("connections", &self.conns.len())
            .field("cached_pvs", &self.directory.cached_count())
            .field("iocs", &self.directory.ioc_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn local_config() -> Config {
        Config {
            listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
            search_addresses: vec!["127.0.0.1:15064".parse().unwrap()],
            search_intervals: vec![1],
            ..Config::default()
        }
    }

    #[test]
    fn test_engine_requires_a_listener() {
        let config = Config {
            // TEST-NET-3 address, never assigned to a local interface
            listen_addresses: vec!["203.0.113.1:5053".parse().unwrap()],
            ..Config::default()
        };
        match Engine::new(config) {
            Err(SetupError::NoListener) => {}
            other => panic!("expected NoListener, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_engine_setup_and_idle_iteration() {
        let mut engine = Engine::new(local_config()).unwrap();
        assert_eq!(engine.listener_addrs().len(), 1);
        assert_ne!(engine.listener_addrs()[0].port(), 0);
        engine.run_once(Duration::from_millis(1)).unwrap();
        assert_eq!(engine.cached_pv_count(), 0);
    }

    #[test]
    fn test_searcherless_engine_is_allowed() {
        let config = Config {
            listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
            ..Config::default()
        };
        let mut engine = Engine::new(config).unwrap();
        engine.run_once(Duration::from_millis(1)).unwrap();
    }

    fn searching_counts(engine: &Engine) -> Vec<usize> {
        engine
            .searcher_tokens
            .iter()
            .map(|token| match engine.conns.get(token) {
                Some(Conn::Searcher(searcher)) => searcher.searching(),
                _ => 0,
            })
            .collect()
    }

    #[test]
    fn test_miss_schedules_on_every_searcher() {
        let config = Config {
            listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
            search_addresses: vec![
                "127.0.0.1:15064".parse().unwrap(),
                "127.0.0.1:15065".parse().unwrap(),
            ],
            search_intervals: vec![1],
            ..Config::default()
        };
        let mut engine = Engine::new(config).unwrap();

        assert!(matches!(engine.resolve("NEW:PV", "10.0.0.1"), Resolution::Miss));
        engine.schedule_search("NEW:PV");
        assert_eq!(searching_counts(&engine), vec![1, 1]);
    }

    #[test]
    fn test_reply_from_one_domain_cancels_the_other_searches() {
        use crate::searcher::FoundPv;
        use std::net::Ipv4Addr;

        let config = Config {
            listen_addresses: vec!["127.0.0.1:0".parse().unwrap()],
            search_addresses: vec![
                "127.0.0.1:15064".parse().unwrap(),
                "127.0.0.1:15065".parse().unwrap(),
            ],
            search_intervals: vec![1],
            connect_timeout: Duration::from_millis(50),
            ..Config::default()
        };
        let mut engine = Engine::new(config).unwrap();
        engine.schedule_search("NEW:PV");

        // a guard target that accepts, so the reply is cacheable
        let ioc_peer = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let ioc = IocEndpoint::new(Ipv4Addr::LOCALHOST, ioc_peer.local_addr().unwrap().port());
        engine.on_search_reply(FoundPv {
            name: "NEW:PV".to_string(),
            ioc,
            reply: vec![0; 40],
        });

        assert_eq!(engine.cached_pv_count(), 1);
        assert_eq!(engine.guarded_ioc_count(), 1);
        // neither domain keeps searching a resolved name
        assert_eq!(searching_counts(&engine), vec![0, 0]);
    }

    #[test]
    fn test_denied_resolution_short_circuits_the_cache() {
        let mut config = local_config();
        config
            .access
            .add_pv_rule(crate::access::Action::Deny, ".*", "DENY_PV .*")
            .unwrap();
        let mut engine = Engine::new(config).unwrap();

        assert!(matches!(
            engine.resolve("ANY:PV", "10.0.0.1"),
            Resolution::Denied
        ));
        // nothing was scheduled as a side effect
        assert_eq!(searching_counts(&engine), vec![0]);
    }

    #[test]
    fn test_guard_failure_puts_name_back_into_search() {
        use crate::searcher::FoundPv;
        use std::net::Ipv4Addr;

        let mut engine = Engine::new(local_config()).unwrap();
        // TEST-NET-3: connect cannot even be initiated to a routable local
        // socket, or at worst never completes; either way the reply must
        // not be cached against an unguarded IOC
        let ioc = IocEndpoint::new(Ipv4Addr::new(203, 0, 113, 9), 5064);
        let before = engine.guarded_ioc_count();
        engine.on_search_reply(FoundPv {
            name: "FLAKY:PV".to_string(),
            ioc,
            reply: vec![0; 40],
        });

        if engine.guarded_ioc_count() == before {
            // connect refused outright: the name went back into search
            assert_eq!(engine.cached_pv_count(), 0);
            assert_eq!(searching_counts(&engine), vec![1]);
        }
    }
}
