//! Host-side address:port reservation for the forwarded guest ssh port.
//!
//! A candidate is "free" when a TCP listener can bind it. The listener is dropped
//! right away, so a concurrent allocator may still race for the same pair before
//! the emulator binds it. The window is small and accepted.

use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, TcpListener};
use std::time::{Duration, Instant};

use rand::Rng;

use crate::errors::AllocationError;
use crate::runtime::constants::{ports, timing};

// ============================================================================
// PROBE
// ============================================================================

/// Checks whether an address can be bound right now.
pub trait PortProbe: Send + Sync {
    fn probe(&self, addr: SocketAddr) -> io::Result<()>;
}

/// Bind-then-release TCP probe.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpProbe;

impl PortProbe for TcpProbe {
    fn probe(&self, addr: SocketAddr) -> io::Result<()> {
        TcpListener::bind(addr).map(drop)
    }
}

// ============================================================================
// ADDRESS STRATEGY
// ============================================================================

/// How candidate addresses are synthesized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressStrategy {
    /// Any address in 127.0.0.0/8 (Linux routes the whole block to loopback).
    RandomLoopback,
    /// Only 127.0.0.1 with a random unprivileged port.
    CanonicalLoopback,
}

impl AddressStrategy {
    pub fn for_host() -> Self {
        if cfg!(target_os = "linux") {
            AddressStrategy::RandomLoopback
        } else {
            AddressStrategy::CanonicalLoopback
        }
    }

    /// Synthesize one candidate.
    pub fn candidate<R: Rng + ?Sized>(&self, rng: &mut R) -> SocketAddrV4 {
        match self {
            AddressStrategy::RandomLoopback => {
                let ip = Ipv4Addr::new(
                    127,
                    rng.random_range(1..=254),
                    rng.random_range(0..=254),
                    rng.random_range(1..=254),
                );
                let port = rng.random_range(ports::LOOPBACK_PORT_MIN..=ports::LOOPBACK_PORT_MAX);
                SocketAddrV4::new(ip, port)
            }
            AddressStrategy::CanonicalLoopback => {
                let port =
                    rng.random_range(ports::CANONICAL_PORT_MIN..=ports::CANONICAL_PORT_MAX);
                SocketAddrV4::new(ports::CANONICAL_LOOPBACK, port)
            }
        }
    }
}

// ============================================================================
// ALLOCATOR
// ============================================================================

/// Finds an unused local address:port within a time budget.
pub struct PortAllocator<P: PortProbe = TcpProbe> {
    probe: P,
    strategy: AddressStrategy,
    budget: Duration,
}

impl PortAllocator<TcpProbe> {
    pub fn new() -> Self {
        Self::with_probe(TcpProbe)
    }
}

impl Default for PortAllocator<TcpProbe> {
    fn default() -> Self {
        Self::new()
    }
}

impl<P: PortProbe> PortAllocator<P> {
    pub fn with_probe(probe: P) -> Self {
        Self {
            probe,
            strategy: AddressStrategy::for_host(),
            budget: timing::PORT_ALLOCATION_BUDGET,
        }
    }

    pub fn strategy(mut self, strategy: AddressStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    pub fn budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    /// Reserve an address:port using the thread-local generator.
    pub fn allocate(&self) -> Result<SocketAddrV4, AllocationError> {
        self.allocate_with(&mut rand::rng())
    }

    /// Reserve an address:port drawing candidates from `rng`.
    ///
    /// Retries on every bind failure until the budget is spent.
    pub fn allocate_with<R: Rng + ?Sized>(
        &self,
        rng: &mut R,
    ) -> Result<SocketAddrV4, AllocationError> {
        let deadline = Instant::now() + self.budget;
        let mut attempts: u64 = 0;

        loop {
            let addr = self.strategy.candidate(rng);
            attempts += 1;

            match self.probe.probe(SocketAddr::V4(addr)) {
                Ok(()) => {
                    tracing::debug!(%addr, attempts, "Reserved forwarding address");
                    return Ok(addr);
                }
                Err(e) => {
                    tracing::trace!(%addr, error = %e, "Candidate address busy");
                }
            }

            if Instant::now() >= deadline {
                tracing::error!(
                    attempts,
                    budget_ms = self.budget.as_millis(),
                    "No free address:port on loopback"
                );
                return Err(AllocationError::Exhausted {
                    budget: self.budget,
                    attempts,
                });
            }
        }
    }
}
