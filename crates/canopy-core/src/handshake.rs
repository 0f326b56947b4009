//! Tunnel handshake
//!
//! Two-message authenticated key agreement carrying certificates. The
//! initiator opens with an ephemeral key and its certificate; the
//! responder answers with its own ephemeral, certificate and chosen
//! index. Session keys mix three DH results:
//!
//! - `ee` (both ephemerals) for forward secrecy
//! - `se` (initiator static, responder ephemeral) authenticating the
//!   initiator
//! - `es` (responder static, initiator ephemeral) authenticating the
//!   responder, proven by the stage-2 MAC
//!
//! The stage-1 certificate is sealed under a key derived from the
//! ephemeral itself: opaque to passive middleboxes, while keeping the
//! exchange to two messages. Confidentiality of the stage-2 certificate
//! rests on `ee`+`se`.

use serde::{Deserialize, Serialize};

use canopy_cert::{CaPool, Certificate};
use canopy_crypto::tunnel::NONCE_DOMAIN_HANDSHAKE;
use canopy_crypto::{
    combine_secrets, Cipher, CryptoTunnel, KeyPair, PublicKey, SecretKey, SessionKey, SharedSecret,
};

use crate::error::{CoreError, CoreResult};

/// Accept stage-1 timestamps this far into the future
const TIMESTAMP_FUTURE_SLACK: u64 = 60;
/// Accept stage-1 timestamps this far into the past
const TIMESTAMP_PAST_SLACK: u64 = 120;

/// Handshake opening message
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage1 {
    /// Initiator's ephemeral public key
    pub ephemeral: Vec<u8>,
    /// Initiator's certificate, sealed
    pub encrypted_cert: Vec<u8>,
    /// Index the initiator will accept return traffic under
    pub initiator_index: u32,
    /// Unix seconds, bounds replayed openings
    pub timestamp: u64,
    /// Keyed BLAKE3 over the fields above
    pub mac: [u8; 16],
}

/// Handshake reply
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Stage2 {
    /// Responder's ephemeral public key
    pub ephemeral: Vec<u8>,
    /// Responder's certificate, sealed under the stage-2 key
    pub encrypted_cert: Vec<u8>,
    /// Index the responder will accept traffic under
    pub responder_index: u32,
    /// Keyed BLAKE3 over the transcript, under the final key
    pub mac: [u8; 16],
}

/// Initiator-side state kept while the reply is outstanding
pub struct InitiatorState {
    ephemeral: KeyPair,
    pub timestamp: u64,
    pub local_index: u32,
}

/// A verified stage-1, held between validation and reply construction
/// so the caller can place a HostInfo (it needs the peer's address from
/// the certificate) before committing to a responder index.
pub struct ValidatedStage1 {
    pub peer_cert: Certificate,
    pub initiator_index: u32,
    initiator_ephemeral: Vec<u8>,
    ee: SharedSecret,
    se: SharedSecret,
    es: SharedSecret,
    our_ephemeral: KeyPair,
}

/// What a completed stage-1 yields on the responder
pub struct Stage1Outcome {
    pub peer_cert: Certificate,
    pub initiator_index: u32,
    pub tunnel: CryptoTunnel,
    pub stage2_payload: Vec<u8>,
}

impl std::fmt::Debug for Stage1Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stage1Outcome")
            .field("peer_cert", &self.peer_cert)
            .field("initiator_index", &self.initiator_index)
            .finish_non_exhaustive()
    }
}

/// What a valid stage-2 yields on the initiator
pub struct Stage2Outcome {
    pub peer_cert: Certificate,
    pub responder_index: u32,
    pub tunnel: CryptoTunnel,
}

/// Everything a handshake needs from the node
pub struct HandshakeContext<'a> {
    pub cipher: Cipher,
    pub our_cert: &'a Certificate,
    pub our_key: &'a SecretKey,
    pub pool: &'a CaPool,
}

/// Key material derived from the ephemeral alone; shields the stage-1
/// certificate from passive observers
fn stage1_keys(ephemeral_pub: &[u8], cipher: Cipher) -> (SessionKey, [u8; 32]) {
    let digest = blake3::hash(ephemeral_pub);
    let secret = SharedSecret::from_bytes(*digest.as_bytes());
    let derived = secret.derive_keys(b"canopy:handshake:stage1");
    (
        SessionKey::new(cipher, &derived.forward_key),
        derived.backward_key,
    )
}

fn keyed_mac(key: &[u8; 32], parts: &[&[u8]]) -> [u8; 16] {
    let mut hasher = blake3::Hasher::new_keyed(key);
    for part in parts {
        hasher.update(part);
    }
    let hash = hasher.finalize();
    let mut mac = [0u8; 16];
    mac.copy_from_slice(&hash.as_bytes()[..16]);
    mac
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Build the opening message
pub fn create_stage1(
    ctx: &HandshakeContext<'_>,
    local_index: u32,
) -> CoreResult<(InitiatorState, Vec<u8>)> {
    let ephemeral = KeyPair::generate(ctx.our_cert.details.curve);
    let timestamp = now_secs();

    let (seal_key, mac_key) = stage1_keys(ephemeral.public.as_bytes(), ctx.cipher);
    let encrypted_cert = seal_key.seal(NONCE_DOMAIN_HANDSHAKE, 1, b"", &ctx.our_cert.encode())?;

    let mac = keyed_mac(
        &mac_key,
        &[
            ephemeral.public.as_bytes(),
            &encrypted_cert,
            &local_index.to_be_bytes(),
            &timestamp.to_be_bytes(),
        ],
    );

    let message = Stage1 {
        ephemeral: ephemeral.public.as_bytes().to_vec(),
        encrypted_cert,
        initiator_index: local_index,
        timestamp,
        mac,
    };
    let payload = bincode::serialize(&message)
        .map_err(|e| CoreError::Handshake(format!("stage1 encode: {e}")))?;

    Ok((
        InitiatorState {
            ephemeral,
            timestamp,
            local_index,
        },
        payload,
    ))
}

/// Validate an opening message: MAC, timestamp window, certificate
/// chain, and the three DH results. `now` is unix seconds.
pub fn validate_stage1(
    ctx: &HandshakeContext<'_>,
    payload: &[u8],
    now: u64,
) -> CoreResult<ValidatedStage1> {
    let message: Stage1 = bincode::deserialize(payload)
        .map_err(|e| CoreError::Handshake(format!("stage1 decode: {e}")))?;

    if message.timestamp > now + TIMESTAMP_FUTURE_SLACK
        || message.timestamp + TIMESTAMP_PAST_SLACK < now
    {
        return Err(CoreError::Handshake("stage1 timestamp out of range".into()));
    }

    let (seal_key, mac_key) = stage1_keys(&message.ephemeral, ctx.cipher);
    let expected = keyed_mac(
        &mac_key,
        &[
            &message.ephemeral,
            &message.encrypted_cert,
            &message.initiator_index.to_be_bytes(),
            &message.timestamp.to_be_bytes(),
        ],
    );
    if expected != message.mac {
        return Err(CoreError::Handshake("stage1 mac mismatch".into()));
    }

    let cert_bytes = seal_key
        .open(NONCE_DOMAIN_HANDSHAKE, 1, b"", &message.encrypted_cert)
        .map_err(|_| CoreError::Handshake("stage1 certificate did not open".into()))?;
    let peer_cert = Certificate::decode(&cert_bytes)?;
    peer_cert.verify(now, ctx.pool)?;

    let curve = ctx.our_cert.details.curve;
    let initiator_ephemeral = PublicKey::from_bytes(curve, &message.ephemeral)?;
    let initiator_static = peer_cert.public_key()?;

    let our_ephemeral = KeyPair::generate(curve);
    let ee = our_ephemeral.secret.diffie_hellman(&initiator_ephemeral)?;
    let se = our_ephemeral.secret.diffie_hellman(&initiator_static)?;
    let es = ctx.our_key.diffie_hellman(&initiator_ephemeral)?;

    Ok(ValidatedStage1 {
        peer_cert,
        initiator_index: message.initiator_index,
        initiator_ephemeral: message.ephemeral,
        ee,
        se,
        es,
        our_ephemeral,
    })
}

impl ValidatedStage1 {
    /// Commit to a responder index: derive the tunnel and build the
    /// stage-2 reply.
    pub fn finish(
        self,
        ctx: &HandshakeContext<'_>,
        responder_index: u32,
    ) -> CoreResult<Stage1Outcome> {
        let stage2_derived =
            combine_secrets(&self.ee, &self.se).derive_keys(b"canopy:handshake:stage2");
        let stage2_seal = SessionKey::new(ctx.cipher, &stage2_derived.forward_key);
        let encrypted_cert =
            stage2_seal.seal(NONCE_DOMAIN_HANDSHAKE, 2, b"", &ctx.our_cert.encode())?;

        let session = combine_secrets(&combine_secrets(&self.ee, &self.se), &self.es)
            .derive_keys(b"canopy:session");
        let mac = keyed_mac(
            &session.backward_key,
            &[
                self.our_ephemeral.public.as_bytes(),
                &encrypted_cert,
                &responder_index.to_be_bytes(),
                &self.initiator_ephemeral,
            ],
        );

        let reply = Stage2 {
            ephemeral: self.our_ephemeral.public.as_bytes().to_vec(),
            encrypted_cert,
            responder_index,
            mac,
        };
        let stage2_payload = bincode::serialize(&reply)
            .map_err(|e| CoreError::Handshake(format!("stage2 encode: {e}")))?;

        // Responder sends on the backward key, receives on the forward key.
        let tunnel = CryptoTunnel::new(ctx.cipher, &session.backward_key, &session.forward_key);

        Ok(Stage1Outcome {
            peer_cert: self.peer_cert,
            initiator_index: self.initiator_index,
            tunnel,
            stage2_payload,
        })
    }
}

/// Validate the reply and derive the initiator's tunnel
pub fn process_stage2(
    ctx: &HandshakeContext<'_>,
    state: &InitiatorState,
    payload: &[u8],
    now: u64,
) -> CoreResult<Stage2Outcome> {
    let message: Stage2 = bincode::deserialize(payload)
        .map_err(|e| CoreError::Handshake(format!("stage2 decode: {e}")))?;

    let curve = ctx.our_cert.details.curve;
    let responder_ephemeral = PublicKey::from_bytes(curve, &message.ephemeral)?;

    let ee = state.ephemeral.secret.diffie_hellman(&responder_ephemeral)?;
    let se = ctx.our_key.diffie_hellman(&responder_ephemeral)?;

    let stage2_derived = combine_secrets(&ee, &se).derive_keys(b"canopy:handshake:stage2");
    let stage2_seal = SessionKey::new(ctx.cipher, &stage2_derived.forward_key);
    let cert_bytes = stage2_seal
        .open(NONCE_DOMAIN_HANDSHAKE, 2, b"", &message.encrypted_cert)
        .map_err(|_| CoreError::Handshake("stage2 certificate did not open".into()))?;
    let peer_cert = Certificate::decode(&cert_bytes)?;
    peer_cert.verify(now, ctx.pool)?;

    let responder_static = peer_cert.public_key()?;
    let es = state.ephemeral.secret.diffie_hellman(&responder_static)?;

    let session = combine_secrets(&combine_secrets(&ee, &se), &es).derive_keys(b"canopy:session");
    let expected = keyed_mac(
        &session.backward_key,
        &[
            &message.ephemeral,
            &message.encrypted_cert,
            &message.responder_index.to_be_bytes(),
            state.ephemeral.public.as_bytes(),
        ],
    );
    if expected != message.mac {
        return Err(CoreError::Handshake("stage2 mac mismatch".into()));
    }

    // Initiator sends on the forward key, receives on the backward key.
    let tunnel = CryptoTunnel::new(ctx.cipher, &session.forward_key, &session.backward_key);

    Ok(Stage2Outcome {
        peer_cert,
        responder_index: message.responder_index,
        tunnel,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::*;

    struct Party {
        cert: Certificate,
        key: SecretKey,
        pool: CaPool,
    }

    fn two_parties() -> (Party, Party) {
        let t = now();
        let (ca, ca_key) = test_ca("hs ca", vec![], t - 10, t + 3600);
        let (cert_a, dh_a) = test_node_cert(
            "a",
            "10.0.0.1/24".parse().unwrap(),
            vec![],
            &ca,
            &ca_key,
            t,
            t + 1800,
        );
        let (cert_b, dh_b) = test_node_cert(
            "b",
            "10.0.0.2/24".parse().unwrap(),
            vec![],
            &ca,
            &ca_key,
            t,
            t + 1800,
        );

        let mut pool_a = CaPool::new();
        pool_a.add_ca(ca.clone()).unwrap();
        let mut pool_b = CaPool::new();
        pool_b.add_ca(ca).unwrap();

        (
            Party {
                cert: cert_a,
                key: dh_a.secret,
                pool: pool_a,
            },
            Party {
                cert: cert_b,
                key: dh_b.secret,
                pool: pool_b,
            },
        )
    }

    fn ctx(party: &Party) -> HandshakeContext<'_> {
        HandshakeContext {
            cipher: Cipher::ChaCha,
            our_cert: &party.cert,
            our_key: &party.key,
            pool: &party.pool,
        }
    }

    fn respond(
        ctx: &HandshakeContext<'_>,
        payload: &[u8],
        now: u64,
        responder_index: u32,
    ) -> CoreResult<Stage1Outcome> {
        validate_stage1(ctx, payload, now)?.finish(ctx, responder_index)
    }

    #[test]
    fn test_full_handshake_agrees_on_keys() {
        let (alice, bob) = two_parties();
        let t = now();

        let (state, stage1) = create_stage1(&ctx(&alice), 101).unwrap();
        let outcome1 = respond(&ctx(&bob), &stage1, t, 202).unwrap();
        assert_eq!(outcome1.initiator_index, 101);
        assert_eq!(outcome1.peer_cert.details.name, "a");

        let outcome2 = process_stage2(&ctx(&alice), &state, &outcome1.stage2_payload, t).unwrap();
        assert_eq!(outcome2.responder_index, 202);
        assert_eq!(outcome2.peer_cert.details.name, "b");

        // Traffic flows both ways through the derived tunnels.
        let header = [0u8; 16];
        let counter = outcome2.tunnel.next_counter().unwrap();
        let ct = outcome2.tunnel.encrypt(counter, &header, b"ping").unwrap();
        let pt = outcome1.tunnel.decrypt(counter, &header, &ct).unwrap();
        assert_eq!(pt, b"ping");

        let counter = outcome1.tunnel.next_counter().unwrap();
        let ct = outcome1.tunnel.encrypt(counter, &header, b"pong").unwrap();
        let pt = outcome2.tunnel.decrypt(counter, &header, &ct).unwrap();
        assert_eq!(pt, b"pong");
    }

    #[test]
    fn test_tampered_stage1_rejected() {
        let (alice, bob) = two_parties();
        let (_, mut stage1) = create_stage1(&ctx(&alice), 101).unwrap();
        let last = stage1.len() - 1;
        stage1[last] ^= 0xFF;

        assert!(respond(&ctx(&bob), &stage1, now(), 202).is_err());
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let (alice, bob) = two_parties();
        let (_, stage1) = create_stage1(&ctx(&alice), 101).unwrap();

        let far_future = now() + 3600;
        let err = respond(&ctx(&bob), &stage1, far_future, 202).unwrap_err();
        assert!(err.to_string().contains("timestamp"));
    }

    #[test]
    fn test_unknown_ca_rejected() {
        let (alice, _) = two_parties();
        let (_, stage1) = create_stage1(&ctx(&alice), 101).unwrap();

        // Bob trusts a different CA entirely.
        let t = now();
        let (other_ca, other_key) = test_ca("other ca", vec![], t - 10, t + 3600);
        let (cert_b, dh_b) = test_node_cert(
            "b",
            "10.0.0.2/24".parse().unwrap(),
            vec![],
            &other_ca,
            &other_key,
            t,
            t + 1800,
        );
        let mut pool = CaPool::new();
        pool.add_ca(other_ca).unwrap();
        let bob = Party {
            cert: cert_b,
            key: dh_b.secret,
            pool,
        };

        assert!(matches!(
            respond(&ctx(&bob), &stage1, t, 202),
            Err(CoreError::Certificate(_))
        ));
    }

    #[test]
    fn test_blocklisted_peer_rejected() {
        let (alice, mut bob) = two_parties();
        bob.pool.blocklist_fingerprint(&alice.cert.fingerprint());

        let (_, stage1) = create_stage1(&ctx(&alice), 101).unwrap();
        let err = respond(&ctx(&bob), &stage1, now(), 202).unwrap_err();
        assert!(err.to_string().contains("block list"));
    }

    #[test]
    fn test_stage2_from_wrong_responder_rejected() {
        let (alice, bob) = two_parties();
        let t = now();

        let (state_a, stage1_a) = create_stage1(&ctx(&alice), 101).unwrap();
        // A different initiator's stage1 gets bob's reply; alice must
        // refuse that reply since the ephemerals do not line up.
        let (_, stage1_m) = create_stage1(&ctx(&alice), 999).unwrap();
        let reply_for_m = respond(&ctx(&bob), &stage1_m, t, 202).unwrap();

        assert!(process_stage2(&ctx(&alice), &state_a, &reply_for_m.stage2_payload, t).is_err());
        // The matching reply still works.
        let reply_for_a = respond(&ctx(&bob), &stage1_a, t, 203).unwrap();
        process_stage2(&ctx(&alice), &state_a, &reply_for_a.stage2_payload, t).unwrap();
    }
}
