//! Encrypted manager channel: Diffie–Hellman key agreement followed by
//! AES-256-CBC on every payload.
//!
//! # Handshake
//!
//! The exchange runs over an existing [`Framer`], in the clear, with both
//! messages tagged `EXH`:
//!
//! ```text
//! manager → server   EXH␟prime␟base␟manager_public      (decimal integers)
//! server  → manager  EXH␟server_public
//! ```
//!
//! Both sides compute `peer_public ^ private mod prime`, render the shared
//! secret in decimal and hash it with SHA-256; the digest is the AES-256 key.
//!
//! # Encrypted payloads
//!
//! ```text
//! [iv:16 random bytes][AES-256-CBC ciphertext, PKCS#7 padded]
//! ```
//!
//! The IV is drawn fresh from the OS RNG for every message.

use std::io::{Read, Write};

use cbc::cipher::block_padding::Pkcs7;
use cbc::cipher::{BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use num_bigint::{BigUint, RandBigInt};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::protocol::codec::{self, MessageBuilder};
use crate::protocol::framing::{Frame, Framer, FramingError};
use crate::protocol::link::{MessageLink, RecvOutcome};
use crate::protocol::messages::MessageType;

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// AES block and IV length.
pub const IV_LEN: usize = 16;

/// Smallest accepted prime, in bits.
pub const MIN_PRIME_BITS: u64 = 256;

/// Largest accepted prime, in bits.  The exchange runs before the manager
/// authenticates, so the cost of one `modpow` must stay bounded.
pub const MAX_PRIME_BITS: u64 = 4096;

/// Read timeouts tolerated while waiting for the peer's half of the exchange.
const MAX_HANDSHAKE_WAITS: u32 = 10;

/// RFC 2409 "First Oakley Default Group" (768-bit MODP safe prime).
const RFC2409_GROUP1_PRIME_HEX: &[u8] = b"FFFFFFFFFFFFFFFFC90FDAA22168C234C4C6628B80DC1CD1\
29024E088A67CC74020BBEA63B139B22514A08798E3404DD\
EF9519B3CD3A431B302B0A6DF25F14374FE1356D6D51C245\
E485B576625E7EC6F44C42E9A63A3620FFFFFFFFFFFFFFFF";

// ── Errors ───────────────────────────────────────────────────────────────────

/// Where a connection was in the key exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyExchangeState {
    /// Nothing exchanged yet.
    Unkeyed,
    /// Our public value is on the wire; waiting for the peer's.
    DhSent,
    /// The shared key is established.
    Keyed,
}

/// A failed key exchange.  The connection must be dropped; there is no retry.
#[derive(Debug, Error)]
#[error("key exchange failed while {stage:?}: {reason}")]
pub struct HandshakeError {
    pub stage: KeyExchangeState,
    pub reason: String,
}

impl HandshakeError {
    fn new(stage: KeyExchangeState, reason: impl Into<String>) -> Self {
        Self {
            stage,
            reason: reason.into(),
        }
    }
}

/// Errors from the symmetric layer.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CryptoError {
    #[error("ciphertext of {0} bytes is too short or not block aligned")]
    BadCiphertextLength(usize),

    #[error("decryption failed (bad key or corrupted padding)")]
    Decrypt,

    #[error("invalid key or IV length")]
    InvalidKeyLength,
}

// ── Diffie–Hellman ───────────────────────────────────────────────────────────

/// Public group parameters chosen by the initiator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DhParams {
    pub prime: BigUint,
    pub base: BigUint,
}

impl DhParams {
    pub fn new(prime: BigUint, base: BigUint) -> Self {
        Self { prime, base }
    }

    /// The 768-bit RFC 2409 group 1 prime with generator 2.
    pub fn rfc2409_group1() -> Self {
        let prime = BigUint::parse_bytes(RFC2409_GROUP1_PRIME_HEX, 16)
            .unwrap_or_else(|| BigUint::from(0u8));
        Self {
            prime,
            base: BigUint::from(2u8),
        }
    }

    /// Checks the size and parity of the prime and the range of the base.
    pub fn validate(&self) -> Result<(), String> {
        let bits = self.prime.bits();
        if bits < MIN_PRIME_BITS {
            return Err(format!(
                "prime has {bits} bits, at least {MIN_PRIME_BITS} required"
            ));
        }
        if bits > MAX_PRIME_BITS {
            return Err(format!(
                "prime has {bits} bits, at most {MAX_PRIME_BITS} allowed"
            ));
        }
        if !self.prime.bit(0) {
            return Err("prime must be odd".to_string());
        }
        if self.base < BigUint::from(2u8) || self.base >= self.prime {
            return Err("base must lie in 2..prime".to_string());
        }
        Ok(())
    }

    /// `true` if `public` lies in `2..=prime-2`.
    pub fn accepts_public(&self, public: &BigUint) -> bool {
        let two = BigUint::from(2u8);
        *public >= two && *public <= &self.prime - &two
    }
}

/// One side of a Diffie–Hellman exchange.
pub struct DiffieHellman {
    params: DhParams,
    private: BigUint,
    public: BigUint,
}

impl DiffieHellman {
    /// Draws a private exponent in `2..=prime-2` from the OS RNG.
    pub fn generate(params: DhParams) -> Self {
        let upper = &params.prime - BigUint::from(3u8);
        let private = OsRng.gen_biguint_below(&upper) + BigUint::from(2u8);
        let public = params.base.modpow(&private, &params.prime);
        Self {
            params,
            private,
            public,
        }
    }

    pub fn params(&self) -> &DhParams {
        &self.params
    }

    pub fn public_key(&self) -> &BigUint {
        &self.public
    }

    pub fn shared_secret(&self, peer_public: &BigUint) -> BigUint {
        peer_public.modpow(&self.private, &self.params.prime)
    }
}

impl std::fmt::Debug for DiffieHellman {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiffieHellman")
            .field("prime_bits", &self.params.prime.bits())
            .field("private", &"<redacted>")
            .finish()
    }
}

// ── Symmetric layer ──────────────────────────────────────────────────────────

/// AES-256 key derived from a shared secret.
#[derive(Clone, PartialEq, Eq)]
pub struct CipherKey([u8; 32]);

impl CipherKey {
    /// SHA-256 of the decimal rendering of `shared_secret`.
    pub fn derive(shared_secret: &BigUint) -> Self {
        let digest = Sha256::digest(shared_secret.to_str_radix(10).as_bytes());
        let mut key = [0u8; 32];
        key.copy_from_slice(&digest);
        Self(key)
    }

    /// Encrypts `plaintext` as `IV || ciphertext` with a fresh random IV.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let cipher =
            Aes256CbcEnc::new_from_slices(&self.0, &iv).map_err(|_| CryptoError::InvalidKeyLength)?;
        let ciphertext = cipher.encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    /// Reverses [`encrypt`](Self::encrypt).
    pub fn decrypt(&self, message: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if message.len() < 2 * IV_LEN || message.len() % IV_LEN != 0 {
            return Err(CryptoError::BadCiphertextLength(message.len()));
        }
        let (iv, ciphertext) = message.split_at(IV_LEN);
        let cipher =
            Aes256CbcDec::new_from_slices(&self.0, iv).map_err(|_| CryptoError::InvalidKeyLength)?;
        cipher
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| CryptoError::Decrypt)
    }
}

impl std::fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

/// Compares two byte strings without short-circuiting on the first mismatch.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.iter().zip(b).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

// ── Secure channel ───────────────────────────────────────────────────────────

/// A framed connection whose payloads are encrypted with a negotiated key.
#[derive(Debug)]
pub struct SecureChannel<S> {
    framer: Framer<S>,
    key: CipherKey,
}

impl<S: Read + Write> SecureChannel<S> {
    /// Server side: waits for the manager's `EXH␟p␟g␟A`, answers `EXH␟B`.
    ///
    /// # Errors
    ///
    /// Any unexpected tag, unparsable or out-of-range number, closed socket or
    /// repeated timeout fails the exchange.
    pub fn accept(mut framer: Framer<S>) -> Result<Self, HandshakeError> {
        let mut stage = KeyExchangeState::Unkeyed;
        let payload = recv_exchange(&mut framer, stage)?;
        let fields = exchange_fields(&payload, 3, stage)?;

        let params = DhParams::new(fields[0].clone(), fields[1].clone());
        params
            .validate()
            .map_err(|reason| HandshakeError::new(stage, reason))?;
        let peer_public = &fields[2];
        if !params.accepts_public(peer_public) {
            return Err(HandshakeError::new(stage, "peer public key out of range"));
        }

        let dh = DiffieHellman::generate(params);
        let reply = MessageBuilder::new(MessageType::KeyExchange.token())
            .field(dh.public_key().to_str_radix(10))
            .finish();
        framer
            .send(&reply)
            .map_err(|e| HandshakeError::new(stage, e.to_string()))?;
        stage = KeyExchangeState::DhSent;

        let key = CipherKey::derive(&dh.shared_secret(peer_public));
        debug!(state = ?KeyExchangeState::Keyed, from = ?stage, "manager channel keyed");
        Ok(Self { framer, key })
    }

    /// Manager side: sends `EXH␟p␟g␟A` and waits for `EXH␟B`.
    pub fn initiate(mut framer: Framer<S>, params: DhParams) -> Result<Self, HandshakeError> {
        let mut stage = KeyExchangeState::Unkeyed;
        params
            .validate()
            .map_err(|reason| HandshakeError::new(stage, reason))?;

        let dh = DiffieHellman::generate(params);
        let hello = MessageBuilder::new(MessageType::KeyExchange.token())
            .field(dh.params().prime.to_str_radix(10))
            .field(dh.params().base.to_str_radix(10))
            .field(dh.public_key().to_str_radix(10))
            .finish();
        framer
            .send(&hello)
            .map_err(|e| HandshakeError::new(stage, e.to_string()))?;
        stage = KeyExchangeState::DhSent;

        let payload = recv_exchange(&mut framer, stage)?;
        let fields = exchange_fields(&payload, 1, stage)?;
        let peer_public = &fields[0];
        if !dh.params().accepts_public(peer_public) {
            return Err(HandshakeError::new(stage, "peer public key out of range"));
        }

        let key = CipherKey::derive(&dh.shared_secret(peer_public));
        Ok(Self { framer, key })
    }

    pub fn framer(&self) -> &Framer<S> {
        &self.framer
    }

    pub fn into_framer(self) -> Framer<S> {
        self.framer
    }
}

impl<S: Read + Write> MessageLink for SecureChannel<S> {
    fn recv_payload(&mut self) -> RecvOutcome<Vec<u8>> {
        match self.framer.recv_payload() {
            RecvOutcome::Data(message) => match self.key.decrypt(&message) {
                Ok(plaintext) => RecvOutcome::Data(plaintext),
                Err(e) => RecvOutcome::Malformed(e.to_string()),
            },
            RecvOutcome::Closed => RecvOutcome::Closed,
            RecvOutcome::TimedOut => RecvOutcome::TimedOut,
            RecvOutcome::Malformed(reason) => RecvOutcome::Malformed(reason),
        }
    }

    fn send_payload(&mut self, payload: &[u8]) -> Result<(), FramingError> {
        if payload.is_empty() {
            return Ok(());
        }
        let message = self.key.encrypt(payload).map_err(|e| {
            FramingError::Io(std::io::Error::new(std::io::ErrorKind::InvalidInput, e))
        })?;
        self.framer.send(&message)
    }
}

fn recv_exchange<S: Read + Write>(
    framer: &mut Framer<S>,
    stage: KeyExchangeState,
) -> Result<Vec<u8>, HandshakeError> {
    let mut waits = 0;
    loop {
        match framer.recv() {
            Ok(Frame::Data(payload)) => return Ok(payload),
            Ok(Frame::Closed) => {
                return Err(HandshakeError::new(stage, "peer closed the connection"))
            }
            Ok(Frame::TimedOut) => {
                waits += 1;
                if waits >= MAX_HANDSHAKE_WAITS {
                    warn!(waits, "peer never completed the key exchange");
                    return Err(HandshakeError::new(stage, "timed out waiting for peer"));
                }
            }
            Err(e) => return Err(HandshakeError::new(stage, e.to_string())),
        }
    }
}

/// Parses `EXH␟n1␟…␟nk` into exactly `count` decimal integers.
fn exchange_fields(
    payload: &[u8],
    count: usize,
    stage: KeyExchangeState,
) -> Result<Vec<BigUint>, HandshakeError> {
    let fields = codec::decode(payload, None)
        .ok_or_else(|| HandshakeError::new(stage, "empty exchange message"))?;
    if fields[0] != MessageType::KeyExchange.token().as_bytes() {
        return Err(HandshakeError::new(
            stage,
            format!(
                "expected {}, got {:?}",
                MessageType::KeyExchange,
                String::from_utf8_lossy(fields[0])
            ),
        ));
    }
    if fields.len() != count + 1 {
        return Err(HandshakeError::new(
            stage,
            format!("expected {count} value(s), got {}", fields.len() - 1),
        ));
    }
    fields[1..]
        .iter()
        .map(|field| {
            if field.is_empty() || !field.iter().all(u8::is_ascii_digit) {
                return Err(HandshakeError::new(stage, "non-numeric exchange value"));
            }
            BigUint::parse_bytes(field, 10)
                .ok_or_else(|| HandshakeError::new(stage, "non-numeric exchange value"))
        })
        .collect()
}

// ── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;
    use std::net::{TcpListener, TcpStream};
    use std::thread;
    use std::time::Duration;

    fn loopback_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();
        for s in [&client, &server] {
            s.set_read_timeout(Some(Duration::from_millis(500))).unwrap();
        }
        (server, client)
    }

    fn key_from(n: u32) -> CipherKey {
        CipherKey::derive(&BigUint::from(n))
    }

    #[test]
    fn test_rfc2409_group_is_768_bits_and_valid() {
        let params = DhParams::rfc2409_group1();
        assert_eq!(params.prime.bits(), 768);
        assert!(params.validate().is_ok());
    }

    #[test]
    fn test_small_prime_is_rejected() {
        let params = DhParams::new(BigUint::from(23u8), BigUint::from(5u8));
        assert!(params.validate().is_err());
    }

    #[test]
    fn test_oversized_prime_is_rejected() {
        // Arrange
        let prime = (BigUint::from(1u8) << (MAX_PRIME_BITS as usize + 8)) + BigUint::from(1u8);
        let params = DhParams::new(prime, BigUint::from(2u8));

        // Act
        let result = params.validate();

        // Assert
        assert!(result.unwrap_err().contains("at most"));
    }

    #[test]
    fn test_even_prime_is_rejected() {
        let prime = BigUint::from(1u8) << 511usize;
        let params = DhParams::new(prime, BigUint::from(2u8));
        assert_eq!(params.validate(), Err("prime must be odd".to_string()));
    }

    #[test]
    fn test_public_key_range_excludes_trivial_values() {
        let params = DhParams::rfc2409_group1();
        let p_minus_one = &params.prime - BigUint::from(1u8);
        assert!(!params.accepts_public(&BigUint::from(1u8)));
        assert!(!params.accepts_public(&p_minus_one));
        assert!(params.accepts_public(&BigUint::from(2u8)));
    }

    #[test]
    fn test_both_sides_agree_on_shared_secret() {
        let params = DhParams::rfc2409_group1();
        let alice = DiffieHellman::generate(params.clone());
        let bob = DiffieHellman::generate(params);
        assert_eq!(
            alice.shared_secret(bob.public_key()),
            bob.shared_secret(alice.public_key())
        );
    }

    #[test]
    fn test_key_is_sha256_of_decimal_secret() {
        let expected = Sha256::digest(b"12345");
        assert_eq!(key_from(12345).0.as_slice(), expected.as_slice());
    }

    #[test]
    fn test_encrypt_decrypt_round_trip_with_fresh_iv() {
        let key = key_from(42);
        let first = key.encrypt(b"MMP\x1fitzik").unwrap();
        let second = key.encrypt(b"MMP\x1fitzik").unwrap();

        assert_ne!(first, second, "IV must differ per message");
        assert_eq!(first.len() % IV_LEN, 0);
        assert_eq!(key.decrypt(&first).unwrap(), b"MMP\x1fitzik");
    }

    #[test]
    fn test_decrypt_rejects_truncated_ciphertext() {
        let key = key_from(7);
        assert_eq!(
            key.decrypt(&[0u8; 20]),
            Err(CryptoError::BadCiphertextLength(20))
        );
        assert_eq!(key.decrypt(&[0u8; 16]), Err(CryptoError::BadCiphertextLength(16)));
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"itzik", b"itzik"));
        assert!(!constant_time_eq(b"itzik", b"itzib"));
        assert!(!constant_time_eq(b"itzik", b"itzi"));
    }

    #[test]
    fn test_handshake_over_loopback_then_exchange_messages() {
        // Arrange
        let (server_stream, client_stream) = loopback_pair();
        let server = thread::spawn(move || {
            let mut channel = SecureChannel::accept(Framer::new(server_stream)).unwrap();
            let received = channel.recv_payload();
            channel.send_payload(b"MVC").unwrap();
            received
        });

        // Act
        let mut manager =
            SecureChannel::initiate(Framer::new(client_stream), DhParams::rfc2409_group1()).unwrap();
        manager.send_payload(b"MMP\x1fitzik").unwrap();
        let reply = manager.recv_payload();
        let received = server.join().unwrap();

        // Assert
        assert_eq!(received, RecvOutcome::Data(b"MMP\x1fitzik".to_vec()));
        assert_eq!(reply, RecvOutcome::Data(b"MVC".to_vec()));
    }

    #[test]
    fn test_accept_rejects_wrong_tag() {
        let mut wire = Cursor::new(b"0003MGC".to_vec());
        let framer = Framer::new(&mut wire);
        let err = SecureChannel::accept(framer).unwrap_err();
        assert_eq!(err.stage, KeyExchangeState::Unkeyed);
    }

    #[test]
    fn test_accept_rejects_non_numeric_values() {
        let mut wire = Cursor::new(b"0009EXH\x1fa\x1fb\x1fc".to_vec());
        let err = SecureChannel::accept(Framer::new(&mut wire)).unwrap_err();
        assert!(err.reason.contains("non-numeric"));
    }

    #[test]
    fn test_accept_rejects_small_prime() {
        let mut wire = Cursor::new(b"0010EXH\x1f23\x1f5\x1f8".to_vec());
        let err = SecureChannel::accept(Framer::new(&mut wire)).unwrap_err();
        assert!(err.reason.contains("bits"));
    }

    #[test]
    fn test_accept_refuses_oversized_prime_before_any_modpow() {
        // Arrange: an 11k-bit odd modulus, as large as a frame comfortably holds.
        let prime = (BigUint::from(1u8) << 11_000usize) + BigUint::from(1u8);
        let payload = MessageBuilder::new(MessageType::KeyExchange.token())
            .field(prime.to_str_radix(10))
            .field("2")
            .field("4")
            .finish();
        let mut frame = format!("{:04}", payload.len()).into_bytes();
        frame.extend_from_slice(&payload);
        let frame_len = frame.len();
        let mut wire = Cursor::new(frame);

        // Act
        let started = std::time::Instant::now();
        let err = SecureChannel::accept(Framer::new(&mut wire)).unwrap_err();

        // Assert
        assert!(err.reason.contains("at most"));
        assert_eq!(err.stage, KeyExchangeState::Unkeyed);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(wire.get_ref().len(), frame_len, "no reply was written");
    }

    #[test]
    fn test_accept_fails_when_peer_closes() {
        let mut wire = Cursor::new(Vec::new());
        let err = SecureChannel::accept(Framer::new(&mut wire)).unwrap_err();
        assert!(err.reason.contains("closed"));
    }
}
