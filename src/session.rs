//! Client-side lifecycle tracking
//!
//! The control plane is the source of truth, but the client mirrors enough
//! state to refuse out-of-order operations locally instead of bouncing them
//! off the server. Two independent machines: one for the balancer
//! reservation, one for this client's worker membership.

use crate::{Error, Result};

/// Lifecycle of a balancer reservation as seen by this client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReservationState {
    /// No balancer instance attached yet
    Unreserved,
    /// Reserved and usable; instance token held
    Reserved,
    /// Released by this client
    Freed,
    /// Lease ran out server-side
    Expired,
}

/// Lifecycle of this client's worker registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipState {
    /// Not part of any worker pool
    Unregistered,
    /// Register call in flight
    Registering,
    /// Registered and expected to send state reports
    Active,
    /// Deregister call in flight
    Deregistering,
    /// Dropped by the control plane for missing heartbeats or auth failure
    AutoDeregistered,
}

/// Both machines plus the transition rules between their states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionState {
    reservation: ReservationState,
    membership: MembershipState,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            reservation: ReservationState::Unreserved,
            membership: MembershipState::Unregistered,
        }
    }
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn reservation(&self) -> ReservationState {
        self.reservation
    }

    pub fn membership(&self) -> MembershipState {
        self.membership
    }

    pub fn is_reserved(&self) -> bool {
        self.reservation == ReservationState::Reserved
    }

    pub fn is_active(&self) -> bool {
        self.membership == MembershipState::Active
    }

    pub fn mark_reserved(&mut self) -> Result<()> {
        match self.reservation {
            ReservationState::Unreserved => {
                self.reservation = ReservationState::Reserved;
                Ok(())
            }
            other => Err(transition_err("reserve", format!("{:?}", other))),
        }
    }

    pub fn mark_freed(&mut self) -> Result<()> {
        match self.reservation {
            ReservationState::Reserved => {
                self.reservation = ReservationState::Freed;
                Ok(())
            }
            other => Err(transition_err("free", format!("{:?}", other))),
        }
    }

    pub fn mark_expired(&mut self) -> Result<()> {
        match self.reservation {
            ReservationState::Reserved => {
                self.reservation = ReservationState::Expired;
                Ok(())
            }
            other => Err(transition_err("expire", format!("{:?}", other))),
        }
    }

    /// Retrying after an automatic drop is allowed; a fresh session results.
    pub fn begin_register(&mut self) -> Result<()> {
        match self.membership {
            MembershipState::Unregistered | MembershipState::AutoDeregistered => {
                self.membership = MembershipState::Registering;
                Ok(())
            }
            other => Err(transition_err("register", format!("{:?}", other))),
        }
    }

    pub fn complete_register(&mut self) -> Result<()> {
        match self.membership {
            MembershipState::Registering => {
                self.membership = MembershipState::Active;
                Ok(())
            }
            other => Err(transition_err("activate", format!("{:?}", other))),
        }
    }

    pub fn fail_register(&mut self) -> Result<()> {
        match self.membership {
            MembershipState::Registering => {
                self.membership = MembershipState::Unregistered;
                Ok(())
            }
            other => Err(transition_err("abandon register", format!("{:?}", other))),
        }
    }

    pub fn begin_deregister(&mut self) -> Result<()> {
        match self.membership {
            MembershipState::Active => {
                self.membership = MembershipState::Deregistering;
                Ok(())
            }
            other => Err(transition_err("deregister", format!("{:?}", other))),
        }
    }

    pub fn complete_deregister(&mut self) -> Result<()> {
        match self.membership {
            MembershipState::Deregistering => {
                self.membership = MembershipState::Unregistered;
                Ok(())
            }
            other => Err(transition_err("finish deregister", format!("{:?}", other))),
        }
    }

    /// The deregister call failed; as far as the server knows we are still
    /// registered.
    pub fn fail_deregister(&mut self) -> Result<()> {
        match self.membership {
            MembershipState::Deregistering => {
                self.membership = MembershipState::Active;
                Ok(())
            }
            other => Err(transition_err("abandon deregister", format!("{:?}", other))),
        }
    }

    /// The control plane stopped recognizing this session while we thought
    /// it was active.
    pub fn mark_auto_deregistered(&mut self) -> Result<()> {
        match self.membership {
            MembershipState::Active => {
                self.membership = MembershipState::AutoDeregistered;
                Ok(())
            }
            other => Err(transition_err("auto-deregister", format!("{:?}", other))),
        }
    }
}

fn transition_err(action: &str, state: String) -> Error {
    Error::Config(format!("cannot {} from state {}", action, state))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reservation_happy_path() {
        let mut s = SessionState::new();
        assert_eq!(s.reservation(), ReservationState::Unreserved);
        s.mark_reserved().unwrap();
        assert!(s.is_reserved());
        s.mark_freed().unwrap();
        assert_eq!(s.reservation(), ReservationState::Freed);
    }

    #[test]
    fn test_reservation_rejects_double_reserve_and_free() {
        let mut s = SessionState::new();
        s.mark_reserved().unwrap();
        assert!(matches!(s.mark_reserved(), Err(Error::Config(_))));

        s.mark_freed().unwrap();
        assert!(matches!(s.mark_freed(), Err(Error::Config(_))));
        assert!(matches!(s.mark_expired(), Err(Error::Config(_))));
    }

    #[test]
    fn test_membership_full_cycle() {
        let mut s = SessionState::new();
        s.begin_register().unwrap();
        assert_eq!(s.membership(), MembershipState::Registering);
        s.complete_register().unwrap();
        assert!(s.is_active());
        s.begin_deregister().unwrap();
        s.complete_deregister().unwrap();
        assert_eq!(s.membership(), MembershipState::Unregistered);
    }

    #[test]
    fn test_membership_failed_register_returns_to_start() {
        let mut s = SessionState::new();
        s.begin_register().unwrap();
        s.fail_register().unwrap();
        assert_eq!(s.membership(), MembershipState::Unregistered);
        // and we can try again
        s.begin_register().unwrap();
    }

    #[test]
    fn test_membership_failed_deregister_stays_active() {
        let mut s = SessionState::new();
        s.begin_register().unwrap();
        s.complete_register().unwrap();
        s.begin_deregister().unwrap();
        s.fail_deregister().unwrap();
        assert!(s.is_active());
    }

    #[test]
    fn test_membership_auto_deregister_allows_retry() {
        let mut s = SessionState::new();
        s.begin_register().unwrap();
        s.complete_register().unwrap();
        s.mark_auto_deregistered().unwrap();
        assert_eq!(s.membership(), MembershipState::AutoDeregistered);
        s.begin_register().unwrap();
    }

    #[test]
    fn test_membership_rejects_out_of_order_calls() {
        let mut s = SessionState::new();
        assert!(matches!(s.complete_register(), Err(Error::Config(_))));
        assert!(matches!(s.begin_deregister(), Err(Error::Config(_))));
        assert!(matches!(s.mark_auto_deregistered(), Err(Error::Config(_))));

        s.begin_register().unwrap();
        assert!(matches!(s.begin_register(), Err(Error::Config(_))));
    }
}
