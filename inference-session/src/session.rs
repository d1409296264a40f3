//! Session state: identity, key and message counter.
//!
//! The counter hands out each value exactly once through [`CounterValue`],
//! an owned handle the encryption provider consumes. Reusing a counter under
//! the same key would break the cipher's nonce discipline.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use zeroize::{Zeroize, ZeroizeOnDrop};

/// Session key length in bytes.
pub const SESSION_KEY_LEN: usize = 32;

/// Symmetric secret shared with the host for one session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    pub fn new(bytes: [u8; SESSION_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build from a slice of exactly [`SESSION_KEY_LEN`] bytes.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let array: [u8; SESSION_KEY_LEN] = bytes.try_into().ok()?;
        Some(Self(array))
    }

    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SessionKey(<redacted>)")
    }
}

/// A counter value that can be read exactly once.
///
/// Neither `Clone` nor `Copy`: the only way to get the number out is
/// [`CounterValue::consume`], which takes `self`.
#[derive(Debug, PartialEq, Eq)]
pub struct CounterValue(u64);

impl CounterValue {
    pub fn consume(self) -> u64 {
        self.0
    }

    /// Peek for logging only.
    pub fn get(&self) -> u64 {
        self.0
    }
}

/// Monotonic per-session message counter.
#[derive(Debug)]
pub struct MessageCounter(AtomicU64);

impl MessageCounter {
    pub fn starting_at(initial: u64) -> Self {
        Self(AtomicU64::new(initial))
    }

    /// Reserve the next value. Increments even if the caller never sends.
    pub fn next(&self) -> CounterValue {
        CounterValue(self.0.fetch_add(1, Ordering::SeqCst))
    }

    /// The value the next call to [`MessageCounter::next`] will hand out.
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::SeqCst)
    }
}

/// An active binding to one remote host.
#[derive(Debug)]
pub struct Session {
    session_id: String,
    key: SessionKey,
    counter: MessageCounter,
    chain_id: u64,
}

impl Session {
    pub fn new(session_id: impl Into<String>, key: SessionKey, chain_id: u64) -> Self {
        Self {
            session_id: session_id.into(),
            key,
            counter: MessageCounter::starting_at(0),
            chain_id,
        }
    }

    /// Resume a session whose counter already advanced elsewhere.
    pub fn with_initial_counter(mut self, initial: u64) -> Self {
        self.counter = MessageCounter::starting_at(initial);
        self
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn chain_id(&self) -> u64 {
        self.chain_id
    }

    pub fn message_counter(&self) -> u64 {
        self.counter.current()
    }

    pub(crate) fn next_counter(&self) -> CounterValue {
        self.counter.next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_counter_hands_out_each_value_once() {
        let counter = MessageCounter::starting_at(10);
        assert_eq!(counter.next().consume(), 10);
        assert_eq!(counter.next().consume(), 11);
        assert_eq!(counter.current(), 12);
    }

    #[test]
    fn test_counter_unique_across_threads() {
        let counter = Arc::new(MessageCounter::starting_at(0));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    (0..250).map(|_| counter.next().consume()).collect::<Vec<_>>()
                })
            })
            .collect();

        let mut seen = HashSet::new();
        for handle in handles {
            for value in handle.join().unwrap() {
                assert!(seen.insert(value), "counter value {value} reused");
            }
        }
        assert_eq!(seen.len(), 1000);
        assert_eq!(counter.current(), 1000);
    }

    #[test]
    fn test_key_debug_redacted() {
        let key = SessionKey::new([7u8; SESSION_KEY_LEN]);
        assert_eq!(format!("{key:?}"), "SessionKey(<redacted>)");
        assert!(SessionKey::from_slice(&[1u8; 16]).is_none());
    }

    #[test]
    fn test_session_initial_counter() {
        let session = Session::new("s-1", SessionKey::new([0u8; 32]), 84532).with_initial_counter(5);
        assert_eq!(session.message_counter(), 5);
        assert_eq!(session.next_counter().consume(), 5);
        assert_eq!(session.message_counter(), 6);
    }
}
