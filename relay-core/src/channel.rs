//! Per-session encrypted channel.
//!
//! A [`SessionChannel`] owns exactly one active key. `encrypt`, `decrypt`
//! and `set_key` all run under the same lock, so at most one crypto
//! operation is in progress per session and nobody can observe a
//! half-replaced key.

use parking_lot::Mutex;

use crate::crypto::{CipherKind, CryptoError, SessionCipher, KEY_SIZE};

/// Symmetric channel for one connection.
#[derive(Debug)]
pub struct SessionChannel {
    kind: CipherKind,
    cipher: Mutex<Option<SessionCipher>>,
    #[cfg(test)]
    probe: probe::Probe,
}

impl SessionChannel {
    /// A channel without a key. Every operation fails until
    /// [`set_key`](Self::set_key) succeeds.
    pub fn new(kind: CipherKind) -> Self {
        Self {
            kind,
            cipher: Mutex::new(None),
            #[cfg(test)]
            probe: probe::Probe::default(),
        }
    }

    /// A channel keyed with `key`.
    pub fn with_key(kind: CipherKind, key: &[u8]) -> Result<Self, CryptoError> {
        let channel = Self::new(kind);
        channel.set_key(key)?;
        Ok(channel)
    }

    /// Replace the active key. Once this returns, operations use the new
    /// key only. A rejected key leaves the channel without a key.
    pub fn set_key(&self, key: &[u8]) -> Result<(), CryptoError> {
        let mut guard = self.cipher.lock();
        match SessionCipher::new(self.kind, key) {
            Ok(cipher) => {
                *guard = Some(cipher);
                Ok(())
            }
            Err(e) => {
                *guard = None;
                Err(e)
            }
        }
    }

    /// Forget the key.
    pub fn clear(&self) {
        *self.cipher.lock() = None;
    }

    /// Encrypt to `nonce || ciphertext`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let guard = self.cipher.lock();
        #[cfg(test)]
        let _inside = self.probe.enter();
        guard.as_ref().ok_or(CryptoError::NoKey)?.encrypt(plaintext)
    }

    /// Decrypt `nonce || ciphertext`.
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let guard = self.cipher.lock();
        #[cfg(test)]
        let _inside = self.probe.enter();
        guard.as_ref().ok_or(CryptoError::NoKey)?.decrypt(data)
    }

    /// A key is set.
    pub fn is_valid(&self) -> bool {
        self.cipher.lock().is_some()
    }

    /// Configured cipher.
    pub fn kind(&self) -> CipherKind {
        self.kind
    }

    /// Required key length.
    pub fn key_len(&self) -> usize {
        KEY_SIZE
    }
}

#[cfg(test)]
mod probe {
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Records how many callers were inside the critical section at once.
    #[derive(Debug, Default)]
    pub struct Probe {
        active: AtomicUsize,
        pub max: AtomicUsize,
        pub calls: AtomicUsize,
    }

    pub struct Inside<'a>(&'a Probe);

    impl Probe {
        pub fn enter(&self) -> Inside<'_> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.max.fetch_max(now, Ordering::SeqCst);
            self.calls.fetch_add(1, Ordering::SeqCst);
            // Widen the window an unserialized caller would slip into.
            std::thread::yield_now();
            Inside(self)
        }
    }

    impl Drop for Inside<'_> {
        fn drop(&mut self) {
            self.0.active.fetch_sub(1, Ordering::SeqCst);
        }
    }
}
