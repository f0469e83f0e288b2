//! Build records and their sealed frames.
//!
//! Each slot of a route-commit message is a fixed-size frame sealed to
//! one hop's encryption key: `hmac (32) ‖ ephemeral_pub (32) ‖
//! nonce (32) ‖ body`. The body is the bencoded build record, padded to
//! a constant size so a slot's position reveals nothing about its hop.

use std::time::Duration;

use veilnet_core::bencode::{DictBuilder, DictReader, Value};
use veilnet_core::constants::{
    DEFAULT_LIFETIME, PUB_KEY_SIZE, RECORD_FRAME_BODY_SIZE, RECORD_FRAME_OVERHEAD,
    RECORD_FRAME_SIZE, SHORT_HASH_SIZE, TUNNEL_NONCE_SIZE,
};
use veilnet_core::{PathId, Result, RouterId, SharedSecret, TunnelNonce, VeilnetError};
use veilnet_crypto::{Crypto, EncryptionKeypair, PqCipherBlock};

/// What one relay learns from its slot of a route-commit message.
#[derive(Clone, Debug)]
pub struct BuildRecord {
    pub tx_id: PathId,
    pub rx_id: PathId,
    /// Next hop; equal to the receiving relay's own id at the terminal.
    pub upstream: RouterId,
    /// Client's ephemeral commit key for the path DH.
    pub commit_pub: [u8; 32],
    /// Per-build tunnel nonce mixed into the path DH.
    pub tunnel_nonce: TunnelNonce,
    /// Requested hop lifetime; relays cap it at the policy maximum.
    pub lifetime: Duration,
    /// KEM-encapsulated session key masking the remaining slots.
    pub pq_cipher: PqCipherBlock,
}

impl BuildRecord {
    fn encode(&self) -> Vec<u8> {
        DictBuilder::new()
            .insert_bytes("c", self.commit_pub.to_vec())
            .insert_int("l", self.lifetime.as_millis() as i64)
            .insert_bytes("n", self.tunnel_nonce.as_bytes().to_vec())
            .insert_bytes("p", self.pq_cipher.as_bytes().to_vec())
            .insert_bytes("r", self.rx_id.as_bytes().to_vec())
            .insert_bytes("t", self.tx_id.as_bytes().to_vec())
            .insert_bytes("u", self.upstream.as_bytes().to_vec())
            .insert_int("v", 0)
            .build()
            .encode()
    }

    fn decode(bytes: &[u8]) -> Result<BuildRecord> {
        let (value, _) = Value::decode_prefix(bytes)?;
        let dict = DictReader::new(&value)?;
        let pq_cipher =
            PqCipherBlock::from_bytes(dict.require_bytes("p")?).map_err(VeilnetError::from)?;
        Ok(BuildRecord {
            tx_id: PathId(dict.require_array("t")?),
            rx_id: PathId(dict.require_array("r")?),
            upstream: RouterId(dict.require_array("u")?),
            commit_pub: dict.require_array("c")?,
            tunnel_nonce: TunnelNonce(dict.require_array("n")?),
            lifetime: Duration::from_millis(dict.require_int("l")?.max(0) as u64),
            pq_cipher,
        })
    }

    /// Lifetime after applying the relay-side policy cap.
    pub fn capped_lifetime(&self) -> Duration {
        self.lifetime.min(DEFAULT_LIFETIME)
    }
}

/// One sealed (or still-masked) slot of a route-commit message.
#[derive(Clone, PartialEq, Eq)]
pub struct RecordFrame(Vec<u8>);

impl RecordFrame {
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<RecordFrame> {
        if bytes.len() != RECORD_FRAME_SIZE {
            return Err(VeilnetError::InvalidMessage(format!(
                "record frame must be {RECORD_FRAME_SIZE} bytes, got {}",
                bytes.len()
            )));
        }
        Ok(RecordFrame(bytes.to_vec()))
    }

    /// A slot full of random bytes; indistinguishable from a sealed one.
    pub fn random(crypto: &Crypto) -> RecordFrame {
        let mut bytes = vec![0u8; RECORD_FRAME_SIZE];
        crypto.random_fill(&mut bytes);
        RecordFrame(bytes)
    }

    /// Seal `record` to a hop's advertised encryption key.
    pub fn seal(crypto: &Crypto, record: &BuildRecord, recipient_enc_key: &[u8; 32]) -> Result<RecordFrame> {
        let plain = record.encode();
        if plain.len() > RECORD_FRAME_BODY_SIZE {
            return Err(VeilnetError::InvalidInput(format!(
                "build record of {} bytes exceeds the {RECORD_FRAME_BODY_SIZE}-byte slot",
                plain.len()
            )));
        }
        let mut body = vec![0u8; RECORD_FRAME_BODY_SIZE];
        body[..plain.len()].copy_from_slice(&plain);

        let ephemeral = EncryptionKeypair::generate();
        let outer_nonce = crypto.random_nonce();
        let shared = crypto
            .transport_dh_client(recipient_enc_key, &ephemeral, &outer_nonce)
            .map_err(VeilnetError::from)?;
        crypto
            .xchacha20(&mut body, &shared, &outer_nonce)
            .map_err(VeilnetError::from)?;

        let mut sealed = Vec::with_capacity(RECORD_FRAME_SIZE);
        sealed.extend_from_slice(&[0u8; SHORT_HASH_SIZE]);
        sealed.extend_from_slice(&ephemeral.public_key_bytes());
        sealed.extend_from_slice(outer_nonce.as_bytes());
        sealed.extend_from_slice(&body);
        let mac = crypto
            .hmac(&sealed[SHORT_HASH_SIZE..], &shared)
            .map_err(VeilnetError::from)?;
        sealed[..SHORT_HASH_SIZE].copy_from_slice(mac.as_bytes());

        Ok(RecordFrame(sealed))
    }

    /// Open a frame sealed to our encryption key.
    pub fn open(&self, crypto: &Crypto, our_enc: &EncryptionKeypair) -> Result<BuildRecord> {
        let (mac, rest) = self.0.split_at(SHORT_HASH_SIZE);
        let mut ephemeral_pub = [0u8; PUB_KEY_SIZE];
        ephemeral_pub.copy_from_slice(&rest[..PUB_KEY_SIZE]);
        let mut nonce = [0u8; TUNNEL_NONCE_SIZE];
        nonce.copy_from_slice(&rest[PUB_KEY_SIZE..PUB_KEY_SIZE + TUNNEL_NONCE_SIZE]);
        let outer_nonce = TunnelNonce(nonce);

        let shared = crypto
            .transport_dh_server(&ephemeral_pub, our_enc, &outer_nonce)
            .map_err(VeilnetError::from)?;
        let expected = crypto.hmac(rest, &shared).map_err(VeilnetError::from)?;
        if expected.as_bytes() != mac {
            return Err(VeilnetError::DecryptFailure);
        }

        let mut body = rest[PUB_KEY_SIZE + TUNNEL_NONCE_SIZE..].to_vec();
        crypto
            .xchacha20(&mut body, &shared, &outer_nonce)
            .map_err(VeilnetError::from)?;
        BuildRecord::decode(&body)
    }

    /// XOR the whole frame with the keystream of a hop's KEM session
    /// key; its own inverse, used to mask/unmask remaining slots.
    pub fn apply_mask(
        &mut self,
        crypto: &Crypto,
        session: &SharedSecret,
        nonce: &TunnelNonce,
    ) -> Result<()> {
        crypto
            .xchacha20(&mut self.0, session, nonce)
            .map_err(VeilnetError::from)
    }
}

impl std::fmt::Debug for RecordFrame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "RecordFrame({} bytes)", self.0.len())
    }
}
