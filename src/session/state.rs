//! Session lifecycle state, held in a single atomic.
//!
//! The atomic is the sole authority for lifecycle transitions. Guarded
//! transitions go through [`StateCell::transition`] (compare-and-swap) so
//! that two concurrent failure detectors cannot both drive a reconnect.

use std::sync::atomic::{AtomicU8, Ordering};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum SessionState {
    Disconnected = 0,
    Connecting = 1,
    Authenticating = 2,
    Connected = 3,
    Reconnecting = 4,
    /// Terminal. Set only by explicit shutdown; blocks all future connects.
    Closed = 5,
}

impl SessionState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => SessionState::Disconnected,
            1 => SessionState::Connecting,
            2 => SessionState::Authenticating,
            3 => SessionState::Connected,
            4 => SessionState::Reconnecting,
            _ => SessionState::Closed,
        }
    }
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SessionState::Disconnected => "disconnected",
            SessionState::Connecting => "connecting",
            SessionState::Authenticating => "authenticating",
            SessionState::Connected => "connected",
            SessionState::Reconnecting => "reconnecting",
            SessionState::Closed => "closed",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl Default for StateCell {
    fn default() -> Self {
        Self::new(SessionState::Disconnected)
    }
}

impl StateCell {
    pub fn new(initial: SessionState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> SessionState {
        SessionState::from_u8(self.0.load(Ordering::SeqCst))
    }

    /// Unconditional store; returns the previous state.
    pub fn set(&self, to: SessionState) -> SessionState {
        SessionState::from_u8(self.0.swap(to as u8, Ordering::SeqCst))
    }

    /// CAS-guarded transition: exactly one caller wins.
    pub fn transition(&self, from: SessionState, to: SessionState) -> bool {
        self.0
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn transition_is_exclusive() {
        let cell = StateCell::new(SessionState::Connected);
        assert!(cell.transition(SessionState::Connected, SessionState::Reconnecting));
        assert!(!cell.transition(SessionState::Connected, SessionState::Reconnecting));
        assert_eq!(cell.get(), SessionState::Reconnecting);
    }

    #[test]
    fn concurrent_detectors_produce_one_winner() {
        let cell = Arc::new(StateCell::new(SessionState::Connected));
        let winners: usize = std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    let cell = Arc::clone(&cell);
                    scope.spawn(move || {
                        cell.transition(SessionState::Connected, SessionState::Reconnecting)
                            as usize
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).sum()
        });
        assert_eq!(winners, 1);
    }

    #[test]
    fn set_returns_previous() {
        let cell = StateCell::default();
        assert_eq!(cell.set(SessionState::Closed), SessionState::Disconnected);
        assert_eq!(cell.set(SessionState::Closed), SessionState::Closed);
    }
}
