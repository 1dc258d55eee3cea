//! AEAD framing and key management.
//!
//! All unicast and broadcast payloads are sealed with XChaCha20-Poly1305
//! under a single pre-shared 32-byte network key. The 24-byte nonce is
//! `[node_addr LE (4) | counter BE (8) | zero (12)]`, which keeps nonces
//! unique across every device sharing the key as long as each node's counter
//! never repeats. The counter is persisted ahead of use in strides so a power
//! loss can never roll it back.
//!
//! Authentication failures are silent on the air (no oracle); they only
//! increment counters surfaced through the `crypto` console command.

use crate::storage::{KEY_NET_KEY, KEY_NONCE_COUNTER, KeyValueStore, StorageError};
use crate::types::NodeAddr;
use chacha20poly1305::aead::{Aead, Payload};
use chacha20poly1305::{Key, KeyInit, XChaCha20Poly1305, XNonce};
use rand::RngCore;
use rand::rngs::OsRng;
use sha3::{Digest, Sha3_256};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, info, warn};

/// Network key length (XChaCha20-Poly1305).
pub const NET_KEY_SIZE: usize = 32;

/// Nonce length on the wire.
pub const NONCE_SIZE: usize = 24;

/// Poly1305 tag length.
pub const TAG_SIZE: usize = 16;

/// Per-packet crypto overhead: explicit nonce plus tag.
pub const CRYPTO_OVERHEAD: usize = NONCE_SIZE + TAG_SIZE;

/// Sliding replay window per source, in nonce counters.
pub const REPLAY_WINDOW: u64 = 64;

/// The nonce counter is persisted every time it crosses a stride boundary,
/// and restored rounded up to the next stride. A crash skips at most
/// `NONCE_PERSIST_STRIDE - 1` counters and can never reuse one.
pub const NONCE_PERSIST_STRIDE: u64 = 32;

/// After `rotate_key`, the previous key keeps decrypting for this long —
/// one ACK-timeout cap, so in-flight retransmissions still authenticate.
pub const KEY_ROTATION_OVERLAP: Duration = Duration::from_secs(60);

/// Sources tracked by the replay filter. Matches the neighbor cap with
/// headroom for multi-hop originators.
const MAX_REPLAY_SOURCES: usize = 128;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("authentication failed")]
    AuthFailed,

    #[error("replayed nonce")]
    Replay,

    #[error("sealed payload truncated")]
    Truncated,

    #[error("nonce source mismatch")]
    SourceMismatch,

    #[error("nonce counter exhausted; node requires re-keying")]
    CounterExhausted,

    #[error("stored network key is invalid")]
    BadStoredKey,

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Seal/open counters surfaced via status.
#[derive(Debug, Default, Clone, Copy)]
pub struct CryptoStats {
    pub sealed: u64,
    pub opened: u64,
    pub auth_failures: u64,
    pub replays_rejected: u64,
}

/// Per-source sliding window over nonce counters.
///
/// `highest` is the largest counter accepted from the source; `bitmap` bit
/// `n` marks `highest - n` as seen. Counters ahead of the window slide it
/// forward, counters inside it are accepted once, anything older than
/// `REPLAY_WINDOW` is rejected outright.
#[derive(Debug, Clone, Copy, Default)]
struct ReplayWindow {
    highest: u64,
    bitmap: u64,
    seeded: bool,
}

impl ReplayWindow {
    /// Non-mutating check; runs before the expensive tag verification.
    fn would_accept(&self, counter: u64) -> bool {
        if !self.seeded {
            return true;
        }
        if counter > self.highest {
            return true;
        }
        let offset = self.highest - counter;
        if offset >= REPLAY_WINDOW {
            return false;
        }
        self.bitmap & (1 << offset) == 0
    }

    /// Commit an authenticated counter into the window.
    fn record(&mut self, counter: u64) {
        if !self.seeded {
            self.seeded = true;
            self.highest = counter;
            self.bitmap = 1;
            return;
        }
        if counter > self.highest {
            let shift = counter - self.highest;
            self.bitmap = if shift >= 64 { 0 } else { self.bitmap << shift };
            self.bitmap |= 1;
            self.highest = counter;
        } else {
            let offset = self.highest - counter;
            if offset < REPLAY_WINDOW {
                self.bitmap |= 1 << offset;
            }
        }
    }
}

/// Network key plus the nonce ledger and replay state.
///
/// Owned exclusively by the engine loop; every method takes `&mut self`.
pub struct CryptoContext {
    node_addr: NodeAddr,
    key: Key,
    /// Previous key during the rotation overlap, with its expiry.
    prev_key: Option<(Key, Instant)>,
    network_id: u16,
    /// Next counter to use for sealing.
    counter: u64,
    /// Persisted high-water mark: every counter below it is burned.
    persisted_hwm: u64,
    windows: HashMap<NodeAddr, ReplayWindow>,
    stats: CryptoStats,
}

impl CryptoContext {
    /// Load the network key and nonce ledger from storage, generating and
    /// persisting a fresh random key on first boot.
    pub fn load_or_generate(
        node_addr: NodeAddr,
        store: &dyn KeyValueStore,
    ) -> Result<Self, CryptoError> {
        let key_bytes = match store.load(KEY_NET_KEY)? {
            Some(bytes) => {
                let arr: [u8; NET_KEY_SIZE] =
                    bytes.try_into().map_err(|_| CryptoError::BadStoredKey)?;
                arr
            }
            None => {
                let mut fresh = [0u8; NET_KEY_SIZE];
                OsRng.fill_bytes(&mut fresh);
                store.store(KEY_NET_KEY, &fresh)?;
                store.flush()?;
                info!("generated new network key");
                fresh
            }
        };

        // Restore the counter one full stride past the persisted mark: the
        // on-disk value is always >= any counter ever used, so skipping a
        // stride guarantees no reuse even after an unclean shutdown.
        let stored = match store.load(KEY_NONCE_COUNTER)? {
            Some(bytes) => {
                let arr: [u8; 8] = bytes
                    .try_into()
                    .map_err(|_| StorageError::Corrupt { key: KEY_NONCE_COUNTER.into() })?;
                u64::from_le_bytes(arr)
            }
            None => 0,
        };
        let counter = stored.saturating_add(if stored == 0 { 0 } else { NONCE_PERSIST_STRIDE });

        let mut ctx = Self {
            node_addr,
            key: Key::from(key_bytes),
            prev_key: None,
            network_id: network_id_of(&key_bytes),
            counter,
            persisted_hwm: 0,
            windows: HashMap::new(),
            stats: CryptoStats::default(),
        };
        ctx.persist_hwm(store, counter)?;
        debug!(counter = ctx.counter, network_id = ctx.network_id, "crypto state loaded");
        Ok(ctx)
    }

    /// Derive a 32-byte network key from a passphrase (`psk set`).
    pub fn derive_key(passphrase: &str) -> [u8; NET_KEY_SIZE] {
        Sha3_256::digest(passphrase.as_bytes()).into()
    }

    /// Stable 16-bit network identifier, a truncation of the key hash.
    pub fn network_id(&self) -> u16 {
        self.network_id
    }

    pub fn key_bytes(&self) -> [u8; NET_KEY_SIZE] {
        self.key.into()
    }

    pub fn stats(&self) -> CryptoStats {
        self.stats
    }

    /// Counters remaining before the node refuses to transmit.
    pub fn nonces_remaining(&self) -> u64 {
        u64::MAX - self.counter
    }

    /// Seal a payload. `aad` is the stable portion of the packet header: it
    /// is authenticated but travels in clear.
    ///
    /// Returns `nonce || ciphertext || tag`. Fails only on counter
    /// exhaustion, after which every call fails until `rotate_key`.
    pub fn seal(
        &mut self,
        store: &dyn KeyValueStore,
        aad: &[u8],
        plaintext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if self.counter == u64::MAX {
            return Err(CryptoError::CounterExhausted);
        }
        let counter = self.counter;
        self.counter += 1;

        // Persist ahead of use so a crash can only skip counters.
        if self.counter > self.persisted_hwm {
            let hwm = self.counter + NONCE_PERSIST_STRIDE;
            self.persist_hwm(store, hwm)?;
        }

        let nonce = build_nonce(self.node_addr, counter);
        let cipher = XChaCha20Poly1305::new(&self.key);
        let mut sealed = cipher
            .encrypt(XNonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|_| CryptoError::AuthFailed)?;

        let mut out = Vec::with_capacity(NONCE_SIZE + sealed.len());
        out.extend_from_slice(&nonce);
        out.append(&mut sealed);
        self.stats.sealed += 1;
        Ok(out)
    }

    /// Open a sealed payload from `source`.
    ///
    /// The nonce's embedded address must match the claimed source, the tag
    /// must verify under the active key (or the previous key during a
    /// rotation overlap), and the counter must clear the per-source replay
    /// window. The window only advances after authentication succeeds, so
    /// forged frames cannot desynchronize it.
    pub fn open(
        &mut self,
        source: NodeAddr,
        aad: &[u8],
        sealed: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        if sealed.len() < CRYPTO_OVERHEAD {
            self.stats.auth_failures += 1;
            return Err(CryptoError::Truncated);
        }
        let (nonce, body) = sealed.split_at(NONCE_SIZE);

        let nonce_addr = u32::from_le_bytes([nonce[0], nonce[1], nonce[2], nonce[3]]);
        if nonce_addr != source.to_u32() {
            self.stats.auth_failures += 1;
            return Err(CryptoError::SourceMismatch);
        }
        let counter = u64::from_be_bytes([
            nonce[4], nonce[5], nonce[6], nonce[7], nonce[8], nonce[9], nonce[10], nonce[11],
        ]);

        if !self.windows.entry(source).or_default().would_accept(counter) {
            self.stats.replays_rejected += 1;
            return Err(CryptoError::Replay);
        }

        let xnonce = XNonce::from_slice(nonce);
        let plaintext = match XChaCha20Poly1305::new(&self.key)
            .decrypt(xnonce, Payload { msg: body, aad })
        {
            Ok(pt) => pt,
            Err(_) => {
                // Rotation overlap: frames sealed under the old key are
                // still in flight shortly after a re-key.
                let overlap = self
                    .prev_key
                    .as_ref()
                    .filter(|(_, expiry)| Instant::now() < *expiry)
                    .map(|(key, _)| *key);
                match overlap {
                    Some(old) => XChaCha20Poly1305::new(&old)
                        .decrypt(xnonce, Payload { msg: body, aad })
                        .map_err(|_| {
                            self.stats.auth_failures += 1;
                            CryptoError::AuthFailed
                        })?,
                    None => {
                        self.stats.auth_failures += 1;
                        return Err(CryptoError::AuthFailed);
                    }
                }
            }
        };

        if self.windows.len() > MAX_REPLAY_SOURCES {
            self.scavenge_windows(source);
        }
        if let Some(window) = self.windows.get_mut(&source) {
            window.record(counter);
        }
        self.stats.opened += 1;
        Ok(plaintext)
    }

    /// Atomically install a new network key. The old key keeps decrypting
    /// for [`KEY_ROTATION_OVERLAP`]; sealing switches immediately. The nonce
    /// counter deliberately keeps running: nonces must stay unique per node
    /// across keys anyway, and a monotonic ledger is simpler to audit.
    pub fn rotate_key(
        &mut self,
        store: &dyn KeyValueStore,
        new_key: [u8; NET_KEY_SIZE],
    ) -> Result<(), CryptoError> {
        let old = self.key;
        self.key = Key::from(new_key);
        self.prev_key = Some((old, Instant::now() + KEY_ROTATION_OVERLAP));
        self.network_id = network_id_of(&new_key);
        // Peer counters lose their meaning across a re-key; fresh windows
        // avoid false replay rejections.
        self.windows.clear();
        store.store(KEY_NET_KEY, &new_key)?;
        store.flush()?;
        info!(network_id = self.network_id, "network key rotated");
        Ok(())
    }

    /// Persist the counter high-water mark on graceful shutdown.
    pub fn persist_on_shutdown(&mut self, store: &dyn KeyValueStore) -> Result<(), CryptoError> {
        let hwm = self.counter.max(self.persisted_hwm);
        self.persist_hwm(store, hwm)
    }

    fn persist_hwm(&mut self, store: &dyn KeyValueStore, hwm: u64) -> Result<(), CryptoError> {
        store.store(KEY_NONCE_COUNTER, &hwm.to_le_bytes())?;
        store.flush()?;
        self.persisted_hwm = hwm;
        Ok(())
    }

    /// Drop the stalest replay window to make room. Keyed tables stay
    /// bounded even when many distant originators relay through us.
    fn scavenge_windows(&mut self, keep: NodeAddr) {
        let victim = self
            .windows
            .iter()
            .filter(|(addr, _)| **addr != keep)
            .min_by_key(|(_, w)| w.highest)
            .map(|(addr, _)| *addr);
        if let Some(addr) = victim {
            warn!(source = %addr, "replay window table full, evicting stalest source");
            self.windows.remove(&addr);
        }
    }
}

fn build_nonce(addr: NodeAddr, counter: u64) -> [u8; NONCE_SIZE] {
    let mut nonce = [0u8; NONCE_SIZE];
    nonce[..4].copy_from_slice(&addr.to_u32().to_le_bytes());
    nonce[4..12].copy_from_slice(&counter.to_be_bytes());
    nonce
}

/// First two bytes (little-endian) of the key hash: the cheap co-channel
/// isolation tag stamped into every header.
fn network_id_of(key: &[u8; NET_KEY_SIZE]) -> u16 {
    let digest = Sha3_256::digest(key);
    u16::from_le_bytes([digest[0], digest[1]])
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;

    const A: NodeAddr = NodeAddr(0x0000_0001);
    const B: NodeAddr = NodeAddr(0x0000_0002);

    fn ctx_pair(store_a: &MemoryStore, store_b: &MemoryStore) -> (CryptoContext, CryptoContext) {
        let a = CryptoContext::load_or_generate(A, store_a).unwrap();
        let key = a.key_bytes();
        store_b.store(KEY_NET_KEY, &key).unwrap();
        let b = CryptoContext::load_or_generate(B, store_b).unwrap();
        (a, b)
    }

    #[test]
    fn test_seal_open_roundtrip() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let sealed = a.seal(&sa, b"header", b"hello mesh").unwrap();
        assert_eq!(sealed.len(), b"hello mesh".len() + CRYPTO_OVERHEAD);
        let opened = b.open(A, b"header", &sealed).unwrap();
        assert_eq!(opened, b"hello mesh");
    }

    #[test]
    fn test_empty_plaintext_roundtrip() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let sealed = a.seal(&sa, b"h", b"").unwrap();
        assert_eq!(sealed.len(), CRYPTO_OVERHEAD);
        assert_eq!(b.open(A, b"h", &sealed).unwrap(), b"");
    }

    #[test]
    fn test_tampered_ciphertext_rejected() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let mut sealed = a.seal(&sa, b"header", b"payload").unwrap();
        let last = sealed.len() - 1;
        sealed[last] ^= 0x01;
        assert!(matches!(b.open(A, b"header", &sealed), Err(CryptoError::AuthFailed)));
        assert_eq!(b.stats().auth_failures, 1);
    }

    #[test]
    fn test_tampered_aad_rejected() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let sealed = a.seal(&sa, b"header", b"payload").unwrap();
        assert!(matches!(
            b.open(A, b"rewritten", &sealed),
            Err(CryptoError::AuthFailed)
        ));
    }

    #[test]
    fn test_replay_rejected() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let sealed = a.seal(&sa, b"h", b"once").unwrap();
        b.open(A, b"h", &sealed).unwrap();
        assert!(matches!(b.open(A, b"h", &sealed), Err(CryptoError::Replay)));
        assert_eq!(b.stats().replays_rejected, 1);
    }

    #[test]
    fn test_reordered_nonces_within_window_accepted() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let first = a.seal(&sa, b"h", b"1").unwrap();
        let second = a.seal(&sa, b"h", b"2").unwrap();
        let third = a.seal(&sa, b"h", b"3").unwrap();

        // Deliver out of order; all three must land exactly once.
        assert_eq!(b.open(A, b"h", &third).unwrap(), b"3");
        assert_eq!(b.open(A, b"h", &first).unwrap(), b"1");
        assert_eq!(b.open(A, b"h", &second).unwrap(), b"2");
        assert!(matches!(b.open(A, b"h", &second), Err(CryptoError::Replay)));
    }

    #[test]
    fn test_nonce_behind_window_rejected() {
        let mut w = ReplayWindow::default();
        w.record(1000);
        assert!(!w.would_accept(1000 - REPLAY_WINDOW));
        assert!(w.would_accept(1000 - REPLAY_WINDOW + 1));
    }

    #[test]
    fn test_nonce_source_binding() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let sealed = a.seal(&sa, b"h", b"x").unwrap();
        // Claiming the frame came from B contradicts the nonce prefix.
        assert!(matches!(
            b.open(B, b"h", &sealed),
            Err(CryptoError::SourceMismatch)
        ));
    }

    #[test]
    fn test_counter_survives_restart_without_reuse() {
        let store = MemoryStore::new();
        let used;
        {
            let mut ctx = CryptoContext::load_or_generate(A, &store).unwrap();
            for _ in 0..5 {
                ctx.seal(&store, b"h", b"x").unwrap();
            }
            used = ctx.counter;
        }
        // Simulated crash: no shutdown persist. The reloaded counter must
        // start past every counter the first life could have used.
        let ctx = CryptoContext::load_or_generate(A, &store).unwrap();
        assert!(ctx.counter >= used);
    }

    #[test]
    fn test_network_id_stable_and_key_dependent() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (a, b) = ctx_pair(&sa, &sb);
        assert_eq!(a.network_id(), b.network_id());

        let other_store = MemoryStore::new();
        let other = CryptoContext::load_or_generate(A, &other_store).unwrap();
        assert_ne!(a.network_id(), other.network_id());
    }

    #[test]
    fn test_rotation_overlap_decrypts_old_key() {
        let (sa, sb) = (MemoryStore::new(), MemoryStore::new());
        let (mut a, mut b) = ctx_pair(&sa, &sb);

        let sealed_old = a.seal(&sa, b"h", b"pre-rotation").unwrap();

        let mut new_key = [0u8; NET_KEY_SIZE];
        OsRng.fill_bytes(&mut new_key);
        b.rotate_key(&sb, new_key).unwrap();

        // Old-key traffic still opens during the overlap window.
        assert_eq!(b.open(A, b"h", &sealed_old).unwrap(), b"pre-rotation");

        // And new-key traffic flows once the sender rotates too.
        a.rotate_key(&sa, new_key).unwrap();
        let sealed_new = a.seal(&sa, b"h", b"post-rotation").unwrap();
        assert_eq!(b.open(A, b"h", &sealed_new).unwrap(), b"post-rotation");
    }

    #[test]
    fn test_passphrase_derivation_deterministic() {
        let k1 = CryptoContext::derive_key("correct horse battery staple");
        let k2 = CryptoContext::derive_key("correct horse battery staple");
        let k3 = CryptoContext::derive_key("wrong horse");
        assert_eq!(k1, k2);
        assert_ne!(k1, k3);
    }
}
