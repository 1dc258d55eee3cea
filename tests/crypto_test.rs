//! Crypto module through the public API.
//!
//! Covers the seal/open laws and the nonce ledger against a real (in-memory)
//! store; the replay-window internals are exercised by the module's unit
//! tests.

use chirpnet::storage::KEY_NET_KEY;
use chirpnet::{CryptoContext, CryptoError, KeyValueStore, MemoryStore, NodeAddr};

const A: NodeAddr = NodeAddr(0x0000_0001);
const B: NodeAddr = NodeAddr(0x0000_0002);

fn shared_pair() -> (MemoryStore, MemoryStore, CryptoContext, CryptoContext) {
    let store_a = MemoryStore::new();
    let store_b = MemoryStore::new();
    let a = CryptoContext::load_or_generate(A, &store_a).unwrap();
    store_b.store(KEY_NET_KEY, &a.key_bytes()).unwrap();
    let b = CryptoContext::load_or_generate(B, &store_b).unwrap();
    (store_a, store_b, a, b)
}

#[test]
fn test_seal_open_identity() {
    let (store_a, _store_b, mut a, mut b) = shared_pair();
    let sealed = a.seal(&store_a, b"aad", b"the payload").unwrap();
    assert_eq!(b.open(A, b"aad", &sealed).unwrap(), b"the payload");
}

#[test]
fn test_any_altered_bit_fails_authentication() {
    let (store_a, _store_b, mut a, mut b) = shared_pair();
    let sealed = a.seal(&store_a, b"aad", b"payload").unwrap();

    for bit in [0usize, sealed.len() / 2, sealed.len() - 1] {
        let mut tampered = sealed.clone();
        tampered[bit] ^= 0x80;
        assert!(
            b.open(A, b"aad", &tampered).is_err(),
            "flipping byte {bit} must fail authentication"
        );
    }
}

#[test]
fn test_nonces_strictly_increase_across_restart() {
    let store = MemoryStore::new();
    let mut highest = 0u64;

    for _ in 0..3 {
        // Each "boot" seals a few packets and dies without a clean shutdown.
        let mut ctx = CryptoContext::load_or_generate(A, &store).unwrap();
        for _ in 0..10 {
            let sealed = ctx.seal(&store, b"h", b"x").unwrap();
            // Counter lives at nonce bytes 4..12, big-endian.
            let counter = u64::from_be_bytes(sealed[4..12].try_into().unwrap());
            assert!(counter >= highest, "nonce went backwards: {counter} < {highest}");
            highest = counter + 1;
        }
    }
}

#[test]
fn test_network_ids_isolate_different_keys() {
    let (_sa, _sb, a, b) = shared_pair();
    assert_eq!(a.network_id(), b.network_id());

    let other = CryptoContext::load_or_generate(A, &MemoryStore::new()).unwrap();
    assert_ne!(a.network_id(), other.network_id());
}

#[test]
fn test_counter_exhaustion_refuses_to_send() {
    let store = MemoryStore::new();
    store
        .store(chirpnet::storage::KEY_NONCE_COUNTER, &u64::MAX.to_le_bytes())
        .unwrap();
    store.store(KEY_NET_KEY, &[9u8; 32]).unwrap();
    let mut ctx = CryptoContext::load_or_generate(A, &store).unwrap();
    assert!(matches!(
        ctx.seal(&store, b"h", b"x"),
        Err(CryptoError::CounterExhausted)
    ));
}
