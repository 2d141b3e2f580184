// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! pvmapper - a Channel Access name server.
//!
//! Channel Access clients locate process variables (PVs) by broadcasting
//! UDP search requests; the hosting IOC answers directly. That breaks down
//! when clients and IOCs live in different broadcast domains. pvmapper sits
//! in between: it accepts client searches on one interface, repeats
//! unresolved searches into the upstream domains on a backoff schedule,
//! rewrites the first reply with the IOC's real address, unicasts it back to
//! the client, and caches the mapping for later queries. Each discovered
//! IOC is watched with a long-lived TCP echo heartbeat so its cached PVs can
//! be evicted the moment it goes away.
//!
//! Everything runs on a single thread: one [`engine::Engine`] multiplexes
//! the listener/searcher UDP sockets and the per-IOC TCP sockets with a
//! `mio` poll loop and drives the periodic work (search retransmission,
//! heartbeats, cache purge) after every readiness pass.

pub mod access;
pub mod config;
pub mod directory;
pub mod engine;
pub mod ioc_guard;
pub mod listener;
pub mod logging;
pub mod protocol;
pub mod searcher;
pub mod signals;
