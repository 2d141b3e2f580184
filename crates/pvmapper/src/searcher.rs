// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Upstream search scheduler.
//!
//! Unresolved PV names are rebroadcast into one upstream domain on a
//! backoff schedule. The scheduler runs at 10 Hz: configured backoff steps
//! (seconds) become tick counts, and the names are filed into a ring of
//! bins, one bin per tick. Processing a tick drains the current bin,
//! broadcasts everything in it, and re-files each entry `interval` bins
//! ahead; an entry down to its last interval stays put and recurs every
//! ring revolution. Two one-tick steps are prepended to the configured
//! schedule so a fresh name goes out on three consecutive ticks before the
//! backoff takes over.
//!
//! Replies are matched by channel id, newest bins first, and reported with
//! the IOC's real address already patched into the reply bytes.

use crate::directory::IocEndpoint;
use crate::protocol::ca;
use socket2::{Domain, Protocol, Socket, Type};
use std::collections::VecDeque;
use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::time::{Duration, Instant};

/// Scheduler ticks per second.
const TICKS_PER_SECOND: u32 = 10;

/// Minimum spacing between outgoing ticks, with a little tolerance below
/// the nominal 100 ms so a reactor iteration arriving marginally early is
/// not skipped.
const TICK_GATE: Duration = Duration::from_millis(99);

/// When re-balancing after a purge, pack at least this many names per
/// non-empty bin so one datagram amortizes the UDP overhead.
const MIN_PVS_PER_BIN: usize = 10;

/// A resolved PV as reported by [`Searcher::process_incoming`].
#[derive(Debug)]
pub struct FoundPv {
    pub name: String,
    pub ioc: IocEndpoint,
    /// Search reply frame with the IOC address already substituted,
    /// suitable for caching and forwarding.
    pub reply: Vec<u8>,
}

struct SearchEntry {
    chan_id: u32,
    name: String,
    /// Refreshed whenever a client asks for this name again; the purge
    /// clock.
    last_hit: Instant,
    /// Remaining backoff steps in ticks; the last one repeats forever.
    intervals: VecDeque<u32>,
}

/// One upstream search endpoint with its retry schedule.
pub struct Searcher {
    socket: mio::net::UdpSocket,
    target: SocketAddrV4,
    bins: Vec<VecDeque<SearchEntry>>,
    current_bin: usize,
    /// Full schedule template in ticks, two immediate steps prepended.
    tick_intervals: Vec<u32>,
    next_id: u32,
    last_tick: Instant,
}

impl Searcher {
    /// Create a searcher broadcasting to `target` with backoff steps in
    /// seconds.
    pub fn new(target: SocketAddrV4, interval_secs: &[u32]) -> io::Result<Self> {
        let ticks: Vec<u32> = interval_secs
            .iter()
            .map(|s| s.saturating_mul(TICKS_PER_SECOND))
            .collect();
        Self::with_tick_intervals(target, &ticks)
    }

    fn with_tick_intervals(target: SocketAddrV4, ticks: &[u32]) -> io::Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))?;
        socket.set_broadcast(true)?;
        socket.set_nonblocking(true)?;
        // ephemeral source port; replies come back to it
        socket.bind(&SocketAddr::from(([0, 0, 0, 0], 0)).into())?;
        let socket = mio::net::UdpSocket::from_std(socket.into());

        let mut tick_intervals = Vec::with_capacity(ticks.len() + 2);
        tick_intervals.extend_from_slice(&[1, 1]);
        tick_intervals.extend_from_slice(ticks);

        let n_bins = tick_intervals.iter().copied().max().unwrap_or(1).max(1) as usize;

        Ok(Self {
            socket,
            target,
            bins: (0..n_bins).map(|_| VecDeque::new()).collect(),
            current_bin: 0,
            tick_intervals,
            next_id: 0,
            last_tick: Instant::now(),
        })
    }

    pub fn socket_mut(&mut self) -> &mut mio::net::UdpSocket {
        &mut self.socket
    }

    pub fn target(&self) -> SocketAddrV4 {
        self.target
    }

    /// Number of names currently being searched.
    pub fn searching(&self) -> usize {
        self.bins.iter().map(VecDeque::len).sum()
    }

    /// Start searching for a name. If it is already scheduled only its
    /// purge clock is refreshed; returns whether the name was new.
    pub fn add_pv(&mut self, name: &str) -> bool {
        for bin in &mut self.bins {
            for entry in bin.iter_mut() {
                if entry.name == name {
                    entry.last_hit = Instant::now();
                    return false;
                }
            }
        }

        let chan_id = self.next_chan_id();
        let entry = SearchEntry {
            chan_id,
            name: name.to_string(),
            last_hit: Instant::now(),
            intervals: self.tick_intervals.iter().copied().collect(),
        };
        // front of the current bin: broadcast on the very next tick
        self.bins[self.current_bin].push_front(entry);
        true
    }

    /// Stop searching for a name (first occurrence only).
    pub fn remove_pv(&mut self, name: &str) {
        for bin in &mut self.bins {
            if let Some(pos) = bin.iter().position(|entry| entry.name == name) {
                bin.remove(pos);
                return;
            }
        }
    }

    /// Drain the upstream socket and match replies against scheduled
    /// entries. Matched entries leave the schedule.
    pub fn process_incoming(&mut self) -> Vec<FoundPv> {
        let mut found = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            let (len, sender) = match self.socket.recv_from(&mut buf) {
                Ok(received) => received,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) => {
                    log::debug!("search socket recv error: {}", err);
                    break;
                }
            };
            let SocketAddr::V4(sender) = sender else {
                continue;
            };
            let datagram = &buf[..len];
            let Some(ioc_port) = ca::decode_ioc_port(datagram) else {
                continue;
            };
            log::trace!(
                "received {} byte datagram from {}, potential search reply",
                len,
                sender
            );

            for (chan_id, mut reply) in ca::decode_search_reply(datagram) {
                // The IOC may have answered with the 255.255.255.255
                // placeholder, expecting clients to use the datagram source
                // address; substitute the real one before the reply is
                // cached or forwarded.
                ca::rewrite_reply_ioc_addr(&mut reply, *sender.ip(), ioc_port);

                let ioc = IocEndpoint::new(*sender.ip(), ioc_port);
                if let Some(name) = self.take_entry(chan_id) {
                    log::debug!("found {} on {}", name, ioc);
                    found.push(FoundPv { name, ioc, reply });
                }
            }
        }
        found
    }

    /// Remove and return the entry with the given channel id, scanning the
    /// most recently processed bins first.
    fn take_entry(&mut self, chan_id: u32) -> Option<String> {
        let n_bins = self.bins.len();
        for i in 0..n_bins {
            let idx = (self.current_bin + n_bins + i - 1) % n_bins;
            if let Some(pos) = self.bins[idx].iter().position(|e| e.chan_id == chan_id) {
                return self.bins[idx].remove(pos).map(|e| e.name);
            }
        }
        None
    }

    /// One scheduler tick: broadcast the current bin and rotate. Rate-gated
    /// so the reactor can call this every iteration.
    pub fn process_outgoing(&mut self) {
        if self.last_tick.elapsed() < TICK_GATE {
            return;
        }
        self.last_tick = Instant::now();

        let mut pvs = self.take_due();
        while !pvs.is_empty() {
            let (datagram, consumed) = ca::encode_search_request(&pvs);
            if consumed == 0 {
                let (_, name) = pvs.remove(0);
                log::warn!("dropping {}: name does not fit a search datagram", name);
                self.remove_pv(&name);
                continue;
            }
            log::debug!(
                "sending search request for {} PV(s) to {}",
                consumed,
                self.target
            );
            if let Err(err) = self.socket.send_to(&datagram, SocketAddr::V4(self.target)) {
                log::debug!("search send to {} failed: {}", self.target, err);
                break;
            }
            pvs.drain(..consumed);
        }
    }

    /// Collect the entries due this tick, re-file them for their next try
    /// and advance the bin cursor.
    fn take_due(&mut self) -> Vec<(u32, String)> {
        let n_bins = self.bins.len();
        let due = std::mem::take(&mut self.bins[self.current_bin]);
        let mut out = Vec::with_capacity(due.len());
        let mut keep = VecDeque::new();

        for mut entry in due {
            out.push((entry.chan_id, entry.name.clone()));
            if entry.intervals.len() > 1 {
                if let Some(step) = entry.intervals.pop_front() {
                    let dest = (self.current_bin + step as usize) % n_bins;
                    if dest == self.current_bin {
                        keep.push_front(entry);
                    } else {
                        self.bins[dest].push_front(entry);
                    }
                }
            } else {
                // last interval: stays here, recurs every ring revolution
                keep.push_back(entry);
            }
        }

        self.bins[self.current_bin] = keep;
        self.current_bin = (self.current_bin + 1) % n_bins;
        out
    }

    /// Drop entries whose purge clock exceeds `max_age`, then spread the
    /// survivors over the ring so broadcasts stay evenly paced. Returns
    /// `(purged, remaining)`.
    pub fn purge(&mut self, max_age: Duration) -> (usize, usize) {
        let mut purged = 0;
        let mut pool: VecDeque<SearchEntry> = VecDeque::new();
        for bin in &mut self.bins {
            for entry in bin.drain(..) {
                if entry.last_hit.elapsed() > max_age {
                    log::debug!(
                        "purged {}, last requested {}s ago",
                        entry.name,
                        entry.last_hit.elapsed().as_secs()
                    );
                    purged += 1;
                } else {
                    pool.push_back(entry);
                }
            }
        }

        let remaining = pool.len();
        let n_bins = self.bins.len();
        let per_bin = remaining.div_ceil(n_bins).max(1);

        let mut i = 0;
        while i < n_bins && !pool.is_empty() {
            let dest = i;
            let mut take = per_bin.min(pool.len());
            if take < MIN_PVS_PER_BIN {
                // skip ahead so small chunks still fill a whole datagram
                i += MIN_PVS_PER_BIN - take - 1;
                take = pool.len().min(MIN_PVS_PER_BIN);
            }
            for entry in pool.drain(..take) {
                self.bins[dest].push_back(entry);
            }
            i += 1;
        }
        for entry in pool.drain(..) {
            self.bins[n_bins - 1].push_back(entry);
        }

        self.current_bin = 0;
        (purged, remaining)
    }

    fn next_chan_id(&mut self) -> u32 {
        if self.next_id >= i32::MAX as u32 {
            // wraparound: renumber every live entry from zero
            self.next_id = 0;
            for bin in &mut self.bins {
                for entry in bin.iter_mut() {
                    entry.chan_id = self.next_id;
                    self.next_id += 1;
                }
            }
        }
        let id = self.next_id;
        self.next_id += 1;
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    fn test_searcher(ticks: &[u32]) -> Searcher {
        let target = "127.0.0.1:15064".parse().unwrap();
        Searcher::with_tick_intervals(target, ticks).unwrap()
    }

    fn bins_holding(searcher: &Searcher, name: &str) -> Vec<usize> {
        searcher
            .bins
            .iter()
            .enumerate()
            .filter(|(_, bin)| bin.iter().any(|e| e.name == name))
            .map(|(i, _)| i)
            .collect()
    }

    #[test]
    fn test_seconds_become_ticks() {
        let searcher = Searcher::new("127.0.0.1:15064".parse().unwrap(), &[1, 5, 10]).unwrap();
        assert_eq!(searcher.tick_intervals, vec![1, 1, 10, 50, 100]);
        assert_eq!(searcher.bins.len(), 100);
    }

    #[test]
    fn test_add_pv_lands_in_exactly_one_bin() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        assert!(searcher.add_pv("X"));
        assert_eq!(bins_holding(&searcher, "X"), vec![searcher.current_bin]);
        let entry = &searcher.bins[searcher.current_bin][0];
        assert_eq!(entry.intervals.len(), 3 + 2);
    }

    #[test]
    fn test_add_pv_twice_only_refreshes() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        assert!(searcher.add_pv("X"));
        assert!(!searcher.add_pv("X"));
        assert_eq!(searcher.searching(), 1);
    }

    #[test]
    fn test_backoff_broadcast_schedule() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.add_pv("X");

        let mut broadcast_ticks = Vec::new();
        for tick in 0..40 {
            let due = searcher.take_due();
            if due.iter().any(|(_, name)| name == "X") {
                broadcast_ticks.push(tick);
            }
        }
        // three consecutive shots, then the configured backoff, the last
        // step repeating every ring revolution
        assert_eq!(broadcast_ticks, vec![0, 1, 2, 3, 8, 18, 28, 38]);
    }

    #[test]
    fn test_entry_with_max_interval_recurs() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.add_pv("X");
        // run the schedule down to the last interval
        for _ in 0..=18 {
            searcher.take_due();
        }
        assert_eq!(searcher.searching(), 1);
        let entry_intervals: Vec<u32> = searcher
            .bins
            .iter()
            .flat_map(|bin| bin.iter())
            .flat_map(|e| e.intervals.iter().copied())
            .collect();
        assert_eq!(entry_intervals, vec![10]);
    }

    #[test]
    fn test_remove_pv() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.add_pv("X");
        searcher.add_pv("Y");
        searcher.remove_pv("X");
        assert_eq!(searcher.searching(), 1);
        assert!(bins_holding(&searcher, "X").is_empty());
    }

    #[test]
    fn test_take_entry_unknown_chan_id_is_none() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.add_pv("X");
        assert_eq!(searcher.take_entry(0xdead), None);
        assert_eq!(searcher.searching(), 1);
    }

    #[test]
    fn test_take_entry_removes_exactly_one() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.add_pv("X");
        searcher.add_pv("Y");
        let cid = searcher.bins[searcher.current_bin]
            .iter()
            .find(|e| e.name == "Y")
            .map(|e| e.chan_id)
            .unwrap();
        assert_eq!(searcher.take_entry(cid).as_deref(), Some("Y"));
        assert_eq!(searcher.take_entry(cid), None);
        assert_eq!(searcher.searching(), 1);
    }

    #[test]
    fn test_chan_id_wraparound_renumbers_live_entries() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.next_id = i32::MAX as u32 - 2;
        searcher.add_pv("A");
        searcher.add_pv("B");
        // next allocation would reach INT32_MAX: everything is renumbered
        searcher.add_pv("C");

        let ids: HashSet<u32> = searcher
            .bins
            .iter()
            .flat_map(|bin| bin.iter())
            .map(|e| e.chan_id)
            .collect();
        assert_eq!(ids.len(), 3);
        assert!(ids.iter().all(|&id| id < 3));
    }

    #[test]
    fn test_tick_rate_gate() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.last_tick = Instant::now() - Duration::from_millis(200);
        let bin_before = searcher.current_bin;
        searcher.process_outgoing();
        assert_eq!(searcher.current_bin, bin_before + 1);
        // a second call inside the gate window is a no-op
        searcher.process_outgoing();
        assert_eq!(searcher.current_bin, bin_before + 1);
    }

    #[test]
    fn test_purge_drops_stale_keeps_fresh() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        searcher.add_pv("OLD");
        std::thread::sleep(Duration::from_millis(40));
        searcher.add_pv("FRESH");
        let (purged, remaining) = searcher.purge(Duration::from_millis(20));
        assert_eq!((purged, remaining), (1, 1));
        assert_eq!(searcher.current_bin, 0);
        assert!(bins_holding(&searcher, "OLD").is_empty());
        assert_eq!(bins_holding(&searcher, "FRESH").len(), 1);
    }

    #[test]
    fn test_purge_packs_small_sets_into_one_bin() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        for i in 0..5 {
            searcher.add_pv(&format!("PV{}", i));
            searcher.take_due();
        }
        let (_, remaining) = searcher.purge(Duration::from_secs(600));
        assert_eq!(remaining, 5);
        let occupied: Vec<usize> = searcher
            .bins
            .iter()
            .enumerate()
            .filter(|(_, b)| !b.is_empty())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(occupied, vec![0]);
    }

    #[test]
    fn test_purge_spreads_large_sets() {
        let mut searcher = test_searcher(&[1, 5, 10]);
        for i in 0..300 {
            searcher.add_pv(&format!("PV{:03}", i));
            searcher.take_due();
        }
        let (_, remaining) = searcher.purge(Duration::from_secs(600));
        assert_eq!(remaining, 300);
        assert_eq!(searcher.searching(), 300);
        let occupied = searcher.bins.iter().filter(|b| !b.is_empty()).count();
        assert!(occupied > 1, "large sets should span multiple bins");
    }
}
