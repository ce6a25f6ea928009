//! Packet protection keys and the TLS engine contract.
//!
//! The TLS engine itself is an external collaborator: the connection feeds it
//! CRYPTO stream bytes and receives handshake output, key material and the
//! peer's transport parameters through the `TlsSession` trait. Initial keys
//! are the connection's own business and are derived here from the client's
//! first destination CID.

use aes_ctr::cipher::generic_array::GenericArray;
use aes_ctr::cipher::stream::{NewStreamCipher, SyncStreamCipher};
use aes_ctr::Aes128Ctr;
use bytes::Bytes;
use failure::Fail;
use ring::{aead, hkdf, hmac};

use crate::packet::{ConnectionId, EncryptLevel};
use crate::{Side, TransportError, RESET_TOKEN_SIZE};

/// Salt for Initial secrets, fixed by the wire draft.
const INITIAL_SALT: [u8; 20] = [
    0xc3, 0xee, 0xf7, 0x12, 0xc7, 0x2e, 0xbb, 0x5a, 0x11, 0xa7, 0xd2, 0x43, 0x2b, 0xb4, 0x63,
    0x65, 0xbe, 0xf9, 0xf5, 0x02,
];

pub const AEAD_TAG_SIZE: usize = 16;

/// Sample length for header-protection mask computation.
pub const HP_SAMPLE_SIZE: usize = 16;

#[derive(Debug, Fail)]
pub enum ConnectError {
    #[fail(display = "invalid DNS name: {}", _0)]
    InvalidDnsName(String),
    #[fail(display = "failed to configure TLS: {}", _0)]
    Tls(String),
}

/// Header-protection key; produces the 5-byte mask XORed onto the first byte
/// and packet-number bytes.
pub struct HeaderKey {
    key: [u8; 16],
}

impl HeaderKey {
    pub fn new(key: [u8; 16]) -> Self {
        HeaderKey { key }
    }

    pub fn mask(&self, sample: &[u8; HP_SAMPLE_SIZE]) -> [u8; 5] {
        // The first keystream block of AES-CTR keyed with the sample as IV is
        // the ECB encryption of the sample, which is exactly the mask source.
        let mut cipher = Aes128Ctr::new(
            GenericArray::from_slice(&self.key),
            GenericArray::from_slice(sample),
        );
        let mut mask = [0; 5];
        cipher.apply_keystream(&mut mask);
        mask
    }
}

/// Packet-protection key for one direction at one encryption level.
pub struct PacketKey {
    key: aead::LessSafeKey,
    iv: [u8; 12],
}

impl PacketKey {
    pub fn new(key: &[u8; 16], iv: [u8; 12]) -> Self {
        let unbound =
            aead::UnboundKey::new(&aead::AES_128_GCM, key).expect("key length mismatch");
        PacketKey {
            key: aead::LessSafeKey::new(unbound),
            iv,
        }
    }

    fn nonce(&self, packet_number: u64) -> aead::Nonce {
        let mut nonce = self.iv;
        for (i, byte) in packet_number.to_be_bytes().iter().enumerate() {
            nonce[4 + i] ^= byte;
        }
        aead::Nonce::assume_unique_for_key(nonce)
    }

    /// Seal `payload` in place, appending the authentication tag.
    pub fn seal(&self, packet_number: u64, header: &[u8], payload: &mut Vec<u8>) {
        self.key
            .seal_in_place_append_tag(
                self.nonce(packet_number),
                aead::Aad::from(header),
                payload,
            )
            .expect("packet sealing failed");
    }

    /// Open `payload` in place; returns the plaintext length.
    pub fn open(
        &self,
        packet_number: u64,
        header: &[u8],
        payload: &mut [u8],
    ) -> Result<usize, ()> {
        let plain = self
            .key
            .open_in_place(
                self.nonce(packet_number),
                aead::Aad::from(header),
                payload,
            )
            .map_err(|_| ())?;
        Ok(plain.len())
    }
}

/// Keys for one direction: header protection plus packet protection.
pub struct DirectionalKeys {
    pub header: HeaderKey,
    pub packet: PacketKey,
}

/// Both directions of key material at one encryption level.
pub struct Keys {
    pub write: DirectionalKeys,
    pub read: DirectionalKeys,
}

impl Keys {
    /// Derive Initial keys from the client's first destination CID. Both
    /// peers run this; `side` selects which secret is written with.
    pub fn new_initial(dst_cid: &ConnectionId, side: Side) -> Self {
        let salt = hkdf::Salt::new(hkdf::HKDF_SHA256, &INITIAL_SALT);
        let initial_secret = salt.extract(dst_cid);
        let client = expand_label_prk(&initial_secret, b"client in");
        let server = expand_label_prk(&initial_secret, b"server in");
        let (write, read) = match side {
            Side::Client => (client, server),
            Side::Server => (server, client),
        };
        Keys {
            write: directional_keys(&write),
            read: directional_keys(&read),
        }
    }

    /// Derive a full key set from a pair of raw traffic secrets. This is the
    /// path TLS engines and tests use to install handshake and 1-RTT keys.
    pub fn from_secrets(write_secret: &[u8], read_secret: &[u8]) -> Self {
        let write = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, write_secret);
        let read = hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, read_secret);
        Keys {
            write: directional_keys(&write),
            read: directional_keys(&read),
        }
    }
}

fn directional_keys(secret: &hkdf::Prk) -> DirectionalKeys {
    let mut key = [0; 16];
    let mut iv = [0; 12];
    let mut hp = [0; 16];
    expand_label(secret, b"quic key", &mut key);
    expand_label(secret, b"quic iv", &mut iv);
    expand_label(secret, b"quic hp", &mut hp);
    DirectionalKeys {
        header: HeaderKey::new(hp),
        packet: PacketKey::new(&key, iv),
    }
}

struct OkmLen(usize);

impl hkdf::KeyType for OkmLen {
    fn len(&self) -> usize {
        self.0
    }
}

fn expand_label(prk: &hkdf::Prk, label: &[u8], out: &mut [u8]) {
    let mut info = Vec::with_capacity(2 + 1 + 6 + label.len() + 1);
    info.extend_from_slice(&(out.len() as u16).to_be_bytes());
    info.push(6 + label.len() as u8);
    info.extend_from_slice(b"tls13 ");
    info.extend_from_slice(label);
    info.push(0);
    prk.expand(&[&info], OkmLen(out.len()))
        .expect("label expansion failed")
        .fill(out)
        .expect("label fill failed");
}

fn expand_label_prk(prk: &hkdf::Prk, label: &[u8]) -> hkdf::Prk {
    let mut secret = [0; 32];
    expand_label(prk, label, &mut secret);
    hkdf::Prk::new_less_safe(hkdf::HKDF_SHA256, &secret)
}

/// Stateless-reset token for a CID, bound to the binding's reset key.
pub fn reset_token_for(key: &hmac::Key, cid: &ConnectionId) -> [u8; RESET_TOKEN_SIZE] {
    let tag = hmac::sign(key, cid);
    let mut result = [0; RESET_TOKEN_SIZE];
    result.copy_from_slice(&tag.as_ref()[..RESET_TOKEN_SIZE]);
    result
}

/// Seal the original destination CID into an opaque Retry token.
pub fn seal_retry_token(key: &orion::aead::SecretKey, orig_dst_cid: &ConnectionId) -> Vec<u8> {
    let mut plain = Vec::with_capacity(1 + orig_dst_cid.len());
    plain.push(orig_dst_cid.len() as u8);
    plain.extend_from_slice(orig_dst_cid);
    orion::aead::seal(key, &plain).expect("token sealing failed")
}

/// Recover the original destination CID from a Retry token, if authentic.
pub fn open_retry_token(key: &orion::aead::SecretKey, token: &[u8]) -> Option<ConnectionId> {
    let plain = orion::aead::open(key, token).ok()?;
    let len = *plain.first()? as usize;
    if len > crate::MAX_CID_SIZE || plain.len() < 1 + len {
        return None;
    }
    Some(ConnectionId::new(&plain[1..1 + len]))
}

/// TLS configuration installed on a connection before the handshake drives.
#[derive(Clone)]
pub enum SecConfig {
    Client(std::sync::Arc<rustls::ClientConfig>),
    Server(std::sync::Arc<rustls::ServerConfig>),
}

impl SecConfig {
    pub fn side(&self) -> Side {
        match *self {
            SecConfig::Client(_) => Side::Client,
            SecConfig::Server(_) => Side::Server,
        }
    }
}

/// Output of one TLS engine step.
#[derive(Default)]
pub struct TlsOutput {
    /// Handshake bytes to transmit in CRYPTO frames, per level.
    pub handshake: Vec<(EncryptLevel, Vec<u8>)>,
    /// Key material that became available, in ascending level order.
    pub keys: Vec<(EncryptLevel, Keys)>,
    /// The handshake finished during this step.
    pub complete: bool,
    /// Raw peer transport-parameter extension, once seen.
    pub peer_params: Option<Bytes>,
}

/// Contract between the connection and the TLS engine.
///
/// The engine consumes ordered CRYPTO stream bytes per encryption level and
/// reports progress through `TlsOutput`. Implementations wrap an actual TLS
/// stack; tests use a scripted engine.
pub trait TlsSession: Send {
    /// Begin the handshake. Clients produce their first flight here.
    fn start(&mut self, local_params: &[u8]) -> Result<TlsOutput, TransportError>;

    /// Feed ordered handshake bytes received at `level`.
    fn read_handshake(
        &mut self,
        level: EncryptLevel,
        data: &[u8],
    ) -> Result<TlsOutput, TransportError>;

    /// Derive the next 1-RTT key generation for a key update. `None` when
    /// 1-RTT keys are not yet established.
    fn next_1rtt_keys(&mut self) -> Option<Keys>;

    /// Opaque resumption ticket, once the peer has issued one.
    fn ticket(&self) -> Option<&[u8]>;
}

#[cfg(test)]
pub(crate) mod testing {
    //! A scripted TLS engine: deterministic keys, fixed flights, no real TLS.

    use super::*;
    use crate::transport_parameters::TransportParameters;

    fn test_secret(level: EncryptLevel, side: Side, generation: u64) -> [u8; 32] {
        let mut secret = [0x42; 32];
        secret[0] = level as u8;
        secret[1] = match side {
            Side::Client => 1,
            Side::Server => 2,
        };
        secret[2] = generation as u8;
        secret
    }

    /// Keys as seen from `side`; the peer's call with the opposite side
    /// yields the mirrored set.
    pub fn test_keys(level: EncryptLevel, side: Side, generation: u64) -> Keys {
        let write = test_secret(level, side, generation);
        let read = test_secret(level, !side, generation);
        Keys::from_secrets(&write, &read)
    }

    pub struct TestTls {
        side: Side,
        pub peer_params: TransportParameters,
        generation: u64,
        started: bool,
        complete: bool,
        ticket: Option<Vec<u8>>,
    }

    impl TestTls {
        pub fn new(side: Side, peer_params: TransportParameters) -> Self {
            TestTls {
                side,
                peer_params,
                generation: 0,
                started: false,
                complete: false,
                ticket: Some(b"test-ticket".to_vec()),
            }
        }

        fn peer_params_bytes(&self) -> Bytes {
            let mut buf = Vec::new();
            self.peer_params.write(!self.side, &mut buf);
            buf.into()
        }
    }

    impl TlsSession for TestTls {
        fn start(&mut self, _local_params: &[u8]) -> Result<TlsOutput, TransportError> {
            self.started = true;
            let mut out = TlsOutput::default();
            if self.side == Side::Client {
                out.handshake
                    .push((EncryptLevel::Initial, b"client-hello".to_vec()));
            }
            Ok(out)
        }

        fn read_handshake(
            &mut self,
            level: EncryptLevel,
            data: &[u8],
        ) -> Result<TlsOutput, TransportError> {
            let mut out = TlsOutput::default();
            match (self.side, level, data) {
                (Side::Server, EncryptLevel::Initial, b"client-hello") => {
                    out.handshake
                        .push((EncryptLevel::Initial, b"server-hello".to_vec()));
                    out.handshake
                        .push((EncryptLevel::Handshake, b"server-finished".to_vec()));
                    out.keys.push((
                        EncryptLevel::Handshake,
                        test_keys(EncryptLevel::Handshake, self.side, 0),
                    ));
                    out.keys.push((
                        EncryptLevel::OneRtt,
                        test_keys(EncryptLevel::OneRtt, self.side, 0),
                    ));
                    out.peer_params = Some(self.peer_params_bytes());
                }
                (Side::Client, EncryptLevel::Initial, b"server-hello") => {
                    out.keys.push((
                        EncryptLevel::Handshake,
                        test_keys(EncryptLevel::Handshake, self.side, 0),
                    ));
                }
                (Side::Client, EncryptLevel::Handshake, b"server-finished") => {
                    out.handshake
                        .push((EncryptLevel::Handshake, b"client-finished".to_vec()));
                    out.keys.push((
                        EncryptLevel::OneRtt,
                        test_keys(EncryptLevel::OneRtt, self.side, 0),
                    ));
                    out.peer_params = Some(self.peer_params_bytes());
                    out.complete = true;
                    self.complete = true;
                }
                (Side::Server, EncryptLevel::Handshake, b"client-finished") => {
                    out.complete = true;
                    self.complete = true;
                }
                _ => return Err(TransportError::PROTOCOL_VIOLATION),
            }
            Ok(out)
        }

        fn next_1rtt_keys(&mut self) -> Option<Keys> {
            if !self.complete {
                return None;
            }
            self.generation += 1;
            Some(test_keys(EncryptLevel::OneRtt, self.side, self.generation))
        }

        fn ticket(&self) -> Option<&[u8]> {
            self.ticket.as_deref()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use rand::rngs::OsRng;

    #[test]
    fn initial_keys_protect_round_trip() {
        let cid = ConnectionId::random(&mut OsRng, 8);
        let client = Keys::new_initial(&cid, Side::Client);
        let server = Keys::new_initial(&cid, Side::Server);

        let header = b"example header";
        let mut payload = b"example payload".to_vec();
        client.write.packet.seal(1, header, &mut payload);
        let len = server.read.packet.open(1, header, &mut payload).unwrap();
        assert_eq!(&payload[..len], b"example payload");
    }

    #[test]
    fn tampered_packet_rejected() {
        let cid = ConnectionId::random(&mut OsRng, 8);
        let client = Keys::new_initial(&cid, Side::Client);
        let server = Keys::new_initial(&cid, Side::Server);
        let mut payload = b"payload".to_vec();
        client.write.packet.seal(7, b"hdr", &mut payload);
        payload[0] ^= 1;
        assert!(server.read.packet.open(7, b"hdr", &mut payload).is_err());
    }

    #[test]
    fn mask_is_deterministic() {
        let key = HeaderKey::new(hex!("0123456789abcdef0123456789abcdef"));
        let sample = hex!("000102030405060708090a0b0c0d0e0f");
        assert_eq!(key.mask(&sample), key.mask(&sample));
        let other = hex!("100102030405060708090a0b0c0d0e0f");
        assert_ne!(key.mask(&sample), key.mask(&other));
    }

    #[test]
    fn reset_token_stable_per_cid() {
        let key = hmac::Key::new(hmac::HMAC_SHA256, b"reset master key");
        let cid = ConnectionId::new(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(reset_token_for(&key, &cid), reset_token_for(&key, &cid));
        let other = ConnectionId::new(&[8, 7, 6, 5, 4, 3, 2, 1]);
        assert_ne!(reset_token_for(&key, &cid), reset_token_for(&key, &other));
    }

    #[test]
    fn retry_token_round_trip() {
        let key = orion::aead::SecretKey::default();
        let cid = ConnectionId::new(&[0xab; 8]);
        let token = seal_retry_token(&key, &cid);
        assert_eq!(open_retry_token(&key, &token), Some(cid));

        let mut tampered = token.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 1;
        assert_eq!(open_retry_token(&key, &tampered), None);
    }
}
