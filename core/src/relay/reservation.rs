//! Relay-side reservation and circuit bookkeeping
//!
//! The libp2p relay behaviour enforces the wire protocol and its own limits;
//! this table mirrors its decisions so the relay can report what it is
//! serving and advertise reserved peers.

use crate::transport::address::circuit_listen_address;
use libp2p::multiaddr::Protocol;
use libp2p::{Multiaddr, PeerId};
use serde::Serialize;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RelayError {
    #[error("Reservation refused for {peer}: {reason}")]
    ReservationRefused { peer: PeerId, reason: String },
    #[error("No reservation for {0}")]
    NoReservation(PeerId),
    #[error("Circuit from {src} refused: {reason}")]
    CircuitRefused { src: PeerId, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reservation {
    pub peer: PeerId,
    pub expires_at: Instant,
    pub advertised: bool,
}

#[derive(Debug, Clone)]
pub struct TableLimits {
    /// `None` is unbounded
    pub max_reservations: Option<usize>,
    pub reservation_duration: Duration,
    pub max_circuits: usize,
    pub max_circuits_per_peer: usize,
}

impl Default for TableLimits {
    fn default() -> Self {
        Self {
            max_reservations: None,
            reservation_duration: Duration::from_secs(3600),
            max_circuits: 16,
            max_circuits_per_peer: 4,
        }
    }
}

/// Statistics about relay operations
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RelayStats {
    pub reservations_active: usize,
    pub reservations_accepted: u64,
    pub reservations_renewed: u64,
    pub reservations_refused: u64,
    pub circuits_active: usize,
    pub circuits_opened: u64,
}

#[derive(Debug)]
pub struct ReservationTable {
    limits: TableLimits,
    advertise: bool,
    reservations: HashMap<PeerId, Reservation>,
    /// (src, dst) -> open circuit count
    circuits: HashMap<(PeerId, PeerId), usize>,
    stats: RelayStats,
}

impl ReservationTable {
    pub fn new(limits: TableLimits, advertise: bool) -> Self {
        Self {
            limits,
            advertise,
            reservations: HashMap::new(),
            circuits: HashMap::new(),
            stats: RelayStats::default(),
        }
    }

    /// Create or renew the reservation of `peer`
    pub fn reserve(&mut self, peer: PeerId, now: Instant) -> Result<Reservation, RelayError> {
        let expires_at = now + self.limits.reservation_duration;

        if let Some(existing) = self.reservations.get_mut(&peer) {
            existing.expires_at = expires_at;
            self.stats.reservations_renewed += 1;
            return Ok(existing.clone());
        }

        if let Some(max) = self.limits.max_reservations {
            if self.reservations.len() >= max {
                self.stats.reservations_refused += 1;
                return Err(RelayError::ReservationRefused {
                    peer,
                    reason: format!("limit of {} reservations reached", max),
                });
            }
        }

        let reservation = Reservation {
            peer,
            expires_at,
            advertised: self.advertise,
        };
        self.reservations.insert(peer, reservation.clone());
        self.stats.reservations_accepted += 1;
        self.stats.reservations_active = self.reservations.len();
        Ok(reservation)
    }

    /// Drop the reservation of a peer that went away
    pub fn release(&mut self, peer: &PeerId) -> Option<Reservation> {
        let removed = self.reservations.remove(peer);
        self.stats.reservations_active = self.reservations.len();
        removed
    }

    /// Remove every reservation that expired at `now`
    pub fn expire(&mut self, now: Instant) -> Vec<PeerId> {
        let expired: Vec<PeerId> = self
            .reservations
            .values()
            .filter(|r| r.expires_at <= now)
            .map(|r| r.peer)
            .collect();
        for peer in &expired {
            self.reservations.remove(peer);
        }
        self.stats.reservations_active = self.reservations.len();
        expired
    }

    /// Count a reservation the relay behaviour refused on its own limits
    pub fn record_refusal(&mut self) {
        self.stats.reservations_refused += 1;
    }

    pub fn has_reservation(&self, peer: &PeerId) -> bool {
        self.reservations.contains_key(peer)
    }

    /// Record a circuit `src -> dst`. Forwarding needs a reservation for `dst`.
    pub fn open_circuit(&mut self, src: PeerId, dst: PeerId) -> Result<(), RelayError> {
        if !self.reservations.contains_key(&dst) {
            return Err(RelayError::NoReservation(dst));
        }
        if self.stats.circuits_active >= self.limits.max_circuits {
            return Err(RelayError::CircuitRefused {
                src,
                reason: format!("limit of {} circuits reached", self.limits.max_circuits),
            });
        }
        let from_src: usize = self
            .circuits
            .iter()
            .filter(|((s, _), _)| *s == src)
            .map(|(_, n)| *n)
            .sum();
        if from_src >= self.limits.max_circuits_per_peer {
            return Err(RelayError::CircuitRefused {
                src,
                reason: format!(
                    "limit of {} circuits per peer reached",
                    self.limits.max_circuits_per_peer
                ),
            });
        }

        *self.circuits.entry((src, dst)).or_default() += 1;
        self.stats.circuits_active += 1;
        self.stats.circuits_opened += 1;
        Ok(())
    }

    pub fn close_circuit(&mut self, src: &PeerId, dst: &PeerId) -> bool {
        let key = (*src, *dst);
        match self.circuits.get_mut(&key) {
            Some(count) => {
                *count -= 1;
                if *count == 0 {
                    self.circuits.remove(&key);
                }
                self.stats.circuits_active = self.stats.circuits_active.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    /// Circuit addresses of advertised reservations, one per relay address
    pub fn advertised_addresses(&self, relay_addrs: &[Multiaddr]) -> Vec<Multiaddr> {
        if !self.advertise {
            return Vec::new();
        }
        self.reservations
            .values()
            .filter(|r| r.advertised)
            .flat_map(|r| {
                relay_addrs
                    .iter()
                    .map(move |relay| circuit_listen_address(relay).with(Protocol::P2p(r.peer)))
            })
            .collect()
    }

    pub fn stats(&self) -> RelayStats {
        self.stats.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(max: Option<usize>) -> ReservationTable {
        ReservationTable::new(
            TableLimits {
                max_reservations: max,
                ..TableLimits::default()
            },
            false,
        )
    }

    #[test]
    fn test_cap_refuses_extra_reservation() {
        let mut table = table(Some(1));
        let now = Instant::now();
        table.reserve(PeerId::random(), now).unwrap();

        let late = PeerId::random();
        let err = table.reserve(late, now).unwrap_err();
        assert!(matches!(err, RelayError::ReservationRefused { peer, .. } if peer == late));
        assert_eq!(table.stats().reservations_refused, 1);
        assert_eq!(table.stats().reservations_active, 1);
    }

    #[test]
    fn test_renewal_does_not_count_against_cap() {
        let mut table = table(Some(1));
        let peer = PeerId::random();
        let now = Instant::now();
        let first = table.reserve(peer, now).unwrap();
        let renewed = table.reserve(peer, now + Duration::from_secs(10)).unwrap();
        assert!(renewed.expires_at > first.expires_at);
        assert_eq!(table.stats().reservations_renewed, 1);
    }

    #[test]
    fn test_unbounded_by_default() {
        let mut table = table(None);
        let now = Instant::now();
        for _ in 0..500 {
            table.reserve(PeerId::random(), now).unwrap();
        }
        assert_eq!(table.stats().reservations_active, 500);
    }

    #[test]
    fn test_expire_and_release() {
        let mut table = table(None);
        let now = Instant::now();
        let a = PeerId::random();
        let b = PeerId::random();
        table.reserve(a, now).unwrap();
        table.reserve(b, now + Duration::from_secs(1800)).unwrap();

        let expired = table.expire(now + Duration::from_secs(3600));
        assert_eq!(expired, vec![a]);
        assert!(table.has_reservation(&b));
        assert!(table.release(&b).is_some());
        assert!(table.release(&b).is_none());
    }

    #[test]
    fn test_circuit_requires_destination_reservation() {
        let mut table = table(None);
        let src = PeerId::random();
        let dst = PeerId::random();
        assert_eq!(table.open_circuit(src, dst), Err(RelayError::NoReservation(dst)));

        table.reserve(dst, Instant::now()).unwrap();
        table.open_circuit(src, dst).unwrap();
        assert_eq!(table.stats().circuits_active, 1);
        assert!(table.close_circuit(&src, &dst));
        assert!(!table.close_circuit(&src, &dst));
        assert_eq!(table.stats().circuits_active, 0);
    }

    #[test]
    fn test_per_peer_circuit_limit() {
        let mut table = ReservationTable::new(
            TableLimits {
                max_circuits_per_peer: 1,
                ..TableLimits::default()
            },
            false,
        );
        let src = PeerId::random();
        let dst = PeerId::random();
        table.reserve(dst, Instant::now()).unwrap();
        table.open_circuit(src, dst).unwrap();
        assert!(matches!(
            table.open_circuit(src, dst),
            Err(RelayError::CircuitRefused { .. })
        ));
    }

    #[test]
    fn test_advertised_only_when_enabled() {
        let relay: Multiaddr = format!("/ip4/13.60.15.36/tcp/3001/ws/p2p/{}", PeerId::random())
            .parse()
            .unwrap();
        let peer = PeerId::random();

        let mut quiet = table(None);
        quiet.reserve(peer, Instant::now()).unwrap();
        assert!(quiet.advertised_addresses(&[relay.clone()]).is_empty());

        let mut loud = ReservationTable::new(TableLimits::default(), true);
        loud.reserve(peer, Instant::now()).unwrap();
        let expected: Multiaddr = format!("{relay}/p2p-circuit/p2p/{peer}").parse().unwrap();
        assert_eq!(loud.advertised_addresses(&[relay]), vec![expected]);
    }
}
