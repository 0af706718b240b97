use rand::rngs::OsRng;
use rand::RngCore;
use tracing::debug;
use x25519_dalek::{PublicKey, StaticSecret};
use zeroize::Zeroize;

use crate::aead::{AeadKey, Suite, KEY_SIZE};
use crate::kdf::derive_key;
use crate::{Error, Result};

/// Serialized public half: X25519 point plus one AES-capability byte.
pub const PUBLIC_SIZE: usize = 33;

/// Length of the key-exchange payload: our public half and the peer half we
/// have last seen, concatenated.
pub const EXCHANGE_SIZE: usize = 2 * PUBLIC_SIZE;

const DERIVE_SIZE: usize = KEY_SIZE + 2 * PUBLIC_SIZE;

/// One key generation: directional AEAD keys plus the negotiated suite flag.
#[derive(Clone)]
pub struct EpochKey {
    /// Key for outbound datagrams.
    pub encrypt: AeadKey,
    /// Key for inbound datagrams.
    pub decrypt: AeadKey,
    /// Both peers advertised AES-256-GCM for this generation.
    pub aes: bool,
}

impl EpochKey {
    // The long-term epoch is symmetric: both directions carry the PSK, and
    // the suite is fixed so either end can verify before any negotiation.
    fn symmetric(key: &[u8; KEY_SIZE]) -> Self {
        Self {
            encrypt: AeadKey::new(Suite::ChaCha20Poly1305, key),
            decrypt: AeadKey::new(Suite::ChaCha20Poly1305, key),
            aes: false,
        }
    }
}

/// Decryption epochs, in trial order for inbound data packets.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Epoch {
    /// The established generation.
    Current,
    /// The generation being handshaken; success here promotes it.
    Next,
    /// The generation before `Current`, kept for in-flight datagrams.
    Last,
    /// The long-term pre-shared key.
    Private,
}

impl Epoch {
    /// Trial order for inbound data packets.
    pub const TRIALS: [Epoch; 4] = [Epoch::Current, Epoch::Next, Epoch::Last, Epoch::Private];
}

/// The four concurrent key epochs and the in-flight X25519 handshake.
pub struct Keyring {
    private: EpochKey,
    current: EpochKey,
    next: EpochKey,
    last: EpochKey,
    secret: StaticSecret,
    public_send: [u8; PUBLIC_SIZE],
    public_recv: [u8; PUBLIC_SIZE],
    /// Encrypt under `next`: the peer has confirmed it can decrypt it.
    pub use_next: bool,
    /// Set when a data packet failed under every epoch; cleared by the next
    /// key-exchange sweep.
    pub bad_key: bool,
    /// Last key-exchange emission.
    pub send_time: u64,
    /// Last key-exchange ingest that completed a derivation.
    pub recv_time: u64,
    aes: bool,
    epoch: u64,
}

impl Keyring {
    /// Fresh keyring with a random pre-shared key.
    pub fn new(prefer_aes: bool) -> Self {
        let mut psk = [0u8; KEY_SIZE];
        OsRng.fill_bytes(&mut psk);
        let ring = Self::with_psk(&psk, prefer_aes);
        psk.zeroize();
        ring
    }

    fn with_psk(psk: &[u8; KEY_SIZE], prefer_aes: bool) -> Self {
        let base = EpochKey::symmetric(psk);
        let mut ring = Self {
            private: base.clone(),
            current: base.clone(),
            next: base.clone(),
            last: base,
            secret: StaticSecret::random_from_rng(OsRng),
            public_send: [0u8; PUBLIC_SIZE],
            public_recv: [0u8; PUBLIC_SIZE],
            use_next: false,
            bad_key: false,
            send_time: 0,
            recv_time: 0,
            aes: prefer_aes,
            epoch: 0,
        };
        ring.refresh_public();
        ring
    }

    /// Install `key` as the pre-shared key and collapse every epoch back to
    /// it, discarding any negotiated generations.
    pub fn set_psk(&mut self, key: &[u8]) -> Result<()> {
        if key.len() < KEY_SIZE {
            return Err(Error::KeyLength);
        }
        let mut psk = [0u8; KEY_SIZE];
        psk.copy_from_slice(&key[..KEY_SIZE]);
        let base = EpochKey::symmetric(&psk);
        psk.zeroize();
        self.private = base.clone();
        self.current = base.clone();
        self.next = base.clone();
        self.last = base;
        self.use_next = false;
        self.bad_key = false;
        self.reset_handshake();
        Ok(())
    }

    /// The pre-shared key.
    pub fn psk(&self) -> &[u8; KEY_SIZE] {
        self.private.encrypt.bytes()
    }

    /// Count of promotions since creation; observable rotation progress.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The long-term key, used to authenticate control packets.
    pub fn private_key(&self) -> &AeadKey {
        &self.private.encrypt
    }

    /// Key for outbound data packets.
    pub fn encrypt_key(&self) -> &AeadKey {
        if self.use_next {
            &self.next.encrypt
        } else {
            &self.current.encrypt
        }
    }

    /// Key for inbound data packets under the given epoch.
    pub fn decrypt_key(&self, epoch: Epoch) -> &AeadKey {
        match epoch {
            Epoch::Current => &self.current.decrypt,
            Epoch::Next => &self.next.decrypt,
            Epoch::Last => &self.last.decrypt,
            Epoch::Private => &self.private.decrypt,
        }
    }

    /// Key-exchange payload: our public half followed by the peer half we
    /// have last seen (zeros before the first ingest).
    pub fn exchange_payload(&self) -> [u8; EXCHANGE_SIZE] {
        let mut out = [0u8; EXCHANGE_SIZE];
        out[..PUBLIC_SIZE].copy_from_slice(&self.public_send);
        out[PUBLIC_SIZE..].copy_from_slice(&self.public_recv);
        out
    }

    /// Ingest a peer key-exchange payload.
    ///
    /// Returns `true` when the peer has not yet echoed our current public
    /// half, i.e. a key exchange must be emitted back on the ingest path.
    pub fn handle_exchange(&mut self, payload: &[u8; EXCHANGE_SIZE], now: u64) -> bool {
        let mut peer_send = [0u8; PUBLIC_SIZE];
        let mut peer_recv = [0u8; PUBLIC_SIZE];
        peer_send.copy_from_slice(&payload[..PUBLIC_SIZE]);
        peer_recv.copy_from_slice(&payload[PUBLIC_SIZE..]);

        // The peer echoing our public half back means it is ready to receive
        // under the generation we are about to derive.
        let echoed = peer_recv == self.public_send;
        self.public_recv = peer_send;
        self.use_next = echoed;

        let mut point = [0u8; 32];
        point.copy_from_slice(&peer_send[..32]);
        let shared = self.secret.diffie_hellman(&PublicKey::from(point));
        if !shared.was_contributory() {
            debug!("discarding key exchange with non-contributory public key");
            return !echoed;
        }

        // Directional keys: outbound binds (local, remote), inbound the
        // reverse, so the symmetric DH output still yields distinct keys.
        let mut material = [0u8; DERIVE_SIZE];
        material[..KEY_SIZE].copy_from_slice(shared.as_bytes());
        material[KEY_SIZE..KEY_SIZE + PUBLIC_SIZE].copy_from_slice(&self.public_send);
        material[KEY_SIZE + PUBLIC_SIZE..].copy_from_slice(&peer_send);
        let mut enc = derive_key(self.psk(), &material);
        material[KEY_SIZE..KEY_SIZE + PUBLIC_SIZE].copy_from_slice(&peer_send);
        material[KEY_SIZE + PUBLIC_SIZE..].copy_from_slice(&self.public_send);
        let mut dec = derive_key(self.psk(), &material);

        let aes = peer_send[PUBLIC_SIZE - 1] == 1 && self.public_send[PUBLIC_SIZE - 1] == 1;
        let suite = if aes { Suite::Aes256Gcm } else { Suite::ChaCha20Poly1305 };
        self.next = EpochKey {
            encrypt: AeadKey::new(suite, &enc),
            decrypt: AeadKey::new(suite, &dec),
            aes,
        };
        material.zeroize();
        enc.zeroize();
        dec.zeroize();
        self.recv_time = now;
        debug!(aes, ready = echoed, "derived next key generation");
        !echoed
    }

    /// Rotate after `next` proved itself on an inbound packet: `current`
    /// becomes `last`, `next` becomes `current`, and a fresh handshake half
    /// is generated for the following exchange.
    pub fn promote(&mut self) {
        self.last = std::mem::replace(&mut self.current, self.next.clone());
        self.use_next = false;
        self.epoch += 1;
        self.reset_handshake();
        debug!(epoch = self.epoch, aes = self.current.aes, "promoted key generation");
    }

    fn reset_handshake(&mut self) {
        self.secret = StaticSecret::random_from_rng(OsRng);
        self.refresh_public();
    }

    fn refresh_public(&mut self) {
        let public = PublicKey::from(&self.secret);
        self.public_send[..32].copy_from_slice(public.as_bytes());
        self.public_send[PUBLIC_SIZE - 1] = u8::from(self.aes);
    }
}

impl core::fmt::Debug for Keyring {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Keyring")
            .field("epoch", &self.epoch)
            .field("use_next", &self.use_next)
            .field("bad_key", &self.bad_key)
            .field("aes", &self.aes)
            .finish()
    }
}
