//! Per-key signing capability, layered on top of [`crate::key_provider::KeyProvider`].
//!
//! `KeyProvider` answers "which keypair backs this index/path/public key"; `Identity` is the
//! narrower object a caller already holding one such keypair hands to [`crate::Client`] so it can
//! sign PSBTs, sign arbitrary messages, and take part in the batch tree MuSig2 ceremony without
//! the caller ever seeing the secret key itself.

use crate::key_provider::KeyProvider;
use crate::Error;
use ark_core::bip322;
use ark_core::musig as core_musig;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine as _;
use bitcoin::consensus;
use bitcoin::hashes::Hash;
use bitcoin::key::Keypair;
use bitcoin::key::Secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::secp256k1::Message;
use bitcoin::secp256k1::PublicKey;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot;
use bitcoin::Address;
use bitcoin::NetworkKind;
use bitcoin::Psbt;
use bitcoin::TapSighashType;
use bitcoin::XOnlyPublicKey;

/// Which scheme [`Identity::sign_message`] should use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureKind {
    /// A raw BIP-340 Schnorr signature over the message.
    Schnorr,
    /// A BIP-322 "simple" signature for the identity's own P2TR key-spend address.
    Bip322,
}

/// The per-key capability surface handed to [`crate::Client`]: sign PSBTs, sign messages, and
/// open a MuSig2 [`SignerSession`] for the batch tree-signing ceremony.
///
/// `sign` returns the count of inputs it actually recognized and signed; it does not fail just
/// because some inputs belong to other keys, only when it can sign none of the requested ones.
pub trait Identity: Send + Sync {
    fn x_only_public_key(&self) -> XOnlyPublicKey;

    fn compressed_public_key(&self) -> PublicKey;

    /// Signs every taproot key-spend input in `psbt` whose `tap_internal_key` matches this
    /// identity, or only the inputs in `input_indexes` when given. Returns how many inputs were
    /// signed.
    fn sign(&self, psbt: &mut Psbt, input_indexes: Option<&[usize]>) -> Result<usize, Error>;

    fn sign_message(&self, msg: &Message, kind: SignatureKind) -> Result<Vec<u8>, Error>;

    fn signer_session(&self) -> Box<dyn SignerSession>;

    fn to_readonly(&self) -> ReadonlyIdentity;
}

/// Holds a MuSig2 secret nonce across the two rounds of the batch tree-signing ceremony (nonce
/// exchange, then partial-signature exchange), mirroring the single-use lifetime
/// [`ark_core::musig::NonceKeyPair`] already gives a raw keypair.
pub trait SignerSession: Send {
    fn public_key(&self) -> PublicKey;

    /// Generates this session's nonce for `msg` under `key_agg`, and returns its public half to
    /// submit to the other cosigners. Must be called exactly once before [`SignerSession::sign`].
    fn nonce(
        &mut self,
        key_agg: &core_musig::KeyAgg,
        msg: musig::Message,
    ) -> Result<musig::PublicNonce, Error>;

    /// Consumes the secret nonce generated by [`SignerSession::nonce`] to produce this cosigner's
    /// partial signature share. Fails if no nonce was generated, or if called twice.
    fn sign(
        &mut self,
        key_agg: &core_musig::KeyAgg,
        agg_nonce: musig::AggregatedNonce,
        msg: musig::Message,
    ) -> Result<musig::PartialSignature, Error>;
}

struct KeypairSignerSession {
    keypair: Keypair,
    nonce: Option<core_musig::NonceKeyPair>,
}

impl SignerSession for KeypairSignerSession {
    fn public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn nonce(
        &mut self,
        key_agg: &core_musig::KeyAgg,
        msg: musig::Message,
    ) -> Result<musig::PublicNonce, Error> {
        let nonce = core_musig::generate_nonce(
            &mut rand::thread_rng(),
            key_agg,
            self.keypair.public_key(),
            msg,
        );
        let public = nonce.public();
        self.nonce = Some(nonce);

        Ok(public)
    }

    fn sign(
        &mut self,
        key_agg: &core_musig::KeyAgg,
        agg_nonce: musig::AggregatedNonce,
        msg: musig::Message,
    ) -> Result<musig::PartialSignature, Error> {
        let secret = self
            .nonce
            .as_mut()
            .and_then(|n| n.take_secret())
            .ok_or_else(|| {
                Error::state("no nonce generated (or already consumed) for this signer session")
            })?;

        core_musig::partial_sign(key_agg, agg_nonce, secret, &self.keypair, msg).map_err(Error::from)
    }
}

/// A session that can never produce a signature, handed out by [`ReadonlyIdentity`].
struct ReadonlySignerSession {
    public_key: PublicKey,
}

impl SignerSession for ReadonlySignerSession {
    fn public_key(&self) -> PublicKey {
        self.public_key
    }

    fn nonce(
        &mut self,
        _key_agg: &core_musig::KeyAgg,
        _msg: musig::Message,
    ) -> Result<musig::PublicNonce, Error> {
        Err(Error::state(
            "cannot generate a signing nonce for a read-only identity",
        ))
    }

    fn sign(
        &mut self,
        _key_agg: &core_musig::KeyAgg,
        _agg_nonce: musig::AggregatedNonce,
        _msg: musig::Message,
    ) -> Result<musig::PartialSignature, Error> {
        Err(Error::state("cannot sign with a read-only identity"))
    }
}

/// Signs every taproot key-spend input in `psbt` belonging to `keypair`, honoring `input_indexes`
/// when given. Shared by [`SingleKeyIdentity`] and [`Bip32Identity`], which differ only in how
/// they obtain the keypair.
fn sign_psbt_with_keypair(
    keypair: &Keypair,
    psbt: &mut Psbt,
    input_indexes: Option<&[usize]>,
) -> Result<usize, Error> {
    let secp = Secp256k1::new();
    let own_x_only = keypair.x_only_public_key().0;

    let indexes: Vec<usize> = match input_indexes {
        Some(idxs) => idxs.to_vec(),
        None => (0..psbt.inputs.len()).collect(),
    };

    let prevouts: Vec<_> = psbt
        .inputs
        .iter()
        .filter_map(|input| input.witness_utxo.clone())
        .collect();

    let mut signed = 0usize;

    for i in indexes {
        let input = psbt
            .inputs
            .get(i)
            .ok_or_else(|| Error::ad_hoc(format!("no psbt input at index {i}")))?;

        let is_ours = match (&input.witness_utxo, input.tap_internal_key) {
            (Some(utxo), Some(internal_key))
                if utxo.script_pubkey.is_p2tr() && internal_key == own_x_only =>
            {
                true
            }
            _ => false,
        };

        if !is_ours {
            continue;
        }

        if prevouts.len() != psbt.inputs.len() {
            return Err(Error::ad_hoc(
                "psbt is missing a witness_utxo on at least one input, cannot build the taproot \
                 sighash for the others",
            ));
        }

        let sighash_type = match psbt.inputs[i].sighash_type {
            Some(ty) => ty
                .taproot_hash_ty()
                .map_err(|e| Error::ad_hoc(format!("invalid taproot sighash type: {e}")))?,
            None => TapSighashType::Default,
        };

        let sighash = SighashCache::new(&psbt.unsigned_tx)
            .taproot_key_spend_signature_hash(i, &Prevouts::All(&prevouts), sighash_type)
            .map_err(|e| Error::ad_hoc(format!("failed to build taproot sighash: {e}")))?;

        let msg = Message::from_digest(sighash.to_raw_hash().to_byte_array());
        let sig = secp.sign_schnorr_no_aux_rand(&msg, keypair);

        psbt.inputs[i].tap_key_sig = Some(taproot::Signature {
            signature: sig,
            sighash_type,
        });

        signed += 1;
    }

    if signed == 0 && !psbt.inputs.is_empty() {
        return Err(Error::state(
            "identity did not recognize any requested psbt input as its own",
        ));
    }

    Ok(signed)
}

/// Signs `msg` per `kind` with `keypair`, for [`SingleKeyIdentity`] and [`Bip32Identity`].
fn sign_message_with_keypair(
    keypair: &Keypair,
    network: NetworkKind,
    msg: &Message,
    kind: SignatureKind,
) -> Result<Vec<u8>, Error> {
    match kind {
        SignatureKind::Schnorr => {
            let secp = Secp256k1::new();
            let sig = secp.sign_schnorr_no_aux_rand(msg, keypair);
            Ok(sig.serialize().to_vec())
        }
        SignatureKind::Bip322 => {
            let output_key = keypair.x_only_public_key().0;
            let witness = bip322::sign_p2tr_key_spend(output_key, msg.as_ref(), keypair)?;
            let encoded = BASE64_STANDARD.encode(consensus::serialize(&witness));

            let address = Address::p2tr(&Secp256k1::new(), output_key, None, network);
            bip322::verify(msg.as_ref(), &encoded, &address)?;

            Ok(encoded.into_bytes())
        }
    }
}

/// An [`Identity`] backed by a single in-memory keypair.
///
/// No method exposes the secret key except [`SingleKeyIdentity::to_hex`], kept around for tests
/// and storage round-trips.
#[derive(Clone)]
pub struct SingleKeyIdentity {
    keypair: Keypair,
    network: NetworkKind,
}

impl SingleKeyIdentity {
    pub fn new(keypair: Keypair, network: NetworkKind) -> Self {
        Self { keypair, network }
    }

    /// The secret key as lowercase hex, for tests and storage round-trips.
    pub fn to_hex(&self) -> String {
        self.keypair.secret_key().display_secret().to_string()
    }
}

impl Identity for SingleKeyIdentity {
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    fn compressed_public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn sign(&self, psbt: &mut Psbt, input_indexes: Option<&[usize]>) -> Result<usize, Error> {
        sign_psbt_with_keypair(&self.keypair, psbt, input_indexes)
    }

    fn sign_message(&self, msg: &Message, kind: SignatureKind) -> Result<Vec<u8>, Error> {
        sign_message_with_keypair(&self.keypair, self.network, msg, kind)
    }

    fn signer_session(&self) -> Box<dyn SignerSession> {
        Box::new(KeypairSignerSession {
            keypair: self.keypair,
            nonce: None,
        })
    }

    fn to_readonly(&self) -> ReadonlyIdentity {
        ReadonlyIdentity::new(self.x_only_public_key(), self.compressed_public_key())
    }
}

/// An [`Identity`] backed by a [`KeyProvider`] and a fixed BIP32 derivation path.
///
/// The keypair at `path` is resolved once, at construction, so every trait method is infallible
/// after that point regardless of what kind of provider backs it.
pub struct Bip32Identity {
    keypair: Keypair,
    network: NetworkKind,
}

impl Bip32Identity {
    pub fn new<P: KeyProvider>(
        provider: &P,
        path: &[u32],
        network: NetworkKind,
    ) -> Result<Self, Error> {
        let keypair = provider.get_keypair_for_path(path)?;

        Ok(Self { keypair, network })
    }
}

impl Identity for Bip32Identity {
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.keypair.x_only_public_key().0
    }

    fn compressed_public_key(&self) -> PublicKey {
        self.keypair.public_key()
    }

    fn sign(&self, psbt: &mut Psbt, input_indexes: Option<&[usize]>) -> Result<usize, Error> {
        sign_psbt_with_keypair(&self.keypair, psbt, input_indexes)
    }

    fn sign_message(&self, msg: &Message, kind: SignatureKind) -> Result<Vec<u8>, Error> {
        sign_message_with_keypair(&self.keypair, self.network, msg, kind)
    }

    fn signer_session(&self) -> Box<dyn SignerSession> {
        Box::new(KeypairSignerSession {
            keypair: self.keypair,
            nonce: None,
        })
    }

    fn to_readonly(&self) -> ReadonlyIdentity {
        ReadonlyIdentity::new(self.x_only_public_key(), self.compressed_public_key())
    }
}

/// A pubkey-only [`Identity`]: every signing method fails with a `State` error. Useful for
/// watch-only setups and as the return type of [`Identity::to_readonly`].
#[derive(Clone, Copy)]
pub struct ReadonlyIdentity {
    x_only_public_key: XOnlyPublicKey,
    compressed_public_key: PublicKey,
}

impl ReadonlyIdentity {
    pub fn new(x_only_public_key: XOnlyPublicKey, compressed_public_key: PublicKey) -> Self {
        Self {
            x_only_public_key,
            compressed_public_key,
        }
    }
}

impl Identity for ReadonlyIdentity {
    fn x_only_public_key(&self) -> XOnlyPublicKey {
        self.x_only_public_key
    }

    fn compressed_public_key(&self) -> PublicKey {
        self.compressed_public_key
    }

    fn sign(&self, _psbt: &mut Psbt, _input_indexes: Option<&[usize]>) -> Result<usize, Error> {
        Err(Error::state("cannot sign a psbt with a read-only identity"))
    }

    fn sign_message(&self, _msg: &Message, _kind: SignatureKind) -> Result<Vec<u8>, Error> {
        Err(Error::state("cannot sign a message with a read-only identity"))
    }

    fn signer_session(&self) -> Box<dyn SignerSession> {
        Box::new(ReadonlySignerSession {
            public_key: self.compressed_public_key,
        })
    }

    fn to_readonly(&self) -> ReadonlyIdentity {
        *self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::sha256;
    use bitcoin::hashes::Hash;
    use bitcoin::secp256k1::SecretKey;
    use bitcoin::Network;

    fn test_keypair(seed: u8) -> Keypair {
        let secp = Secp256k1::new();
        let sk = SecretKey::from_slice(&[seed; 32]).unwrap();
        Keypair::from_secret_key(&secp, &sk)
    }

    #[test]
    fn single_key_identity_round_trips_schnorr_signature() {
        let keypair = test_keypair(1);
        let identity = SingleKeyIdentity::new(keypair, NetworkKind::Main);

        let digest = sha256::Hash::hash(b"hello ark").to_byte_array();
        let msg = Message::from_digest(digest);

        let sig_bytes = identity.sign_message(&msg, SignatureKind::Schnorr).unwrap();
        let sig = schnorr::Signature::from_slice(&sig_bytes).unwrap();

        let secp = Secp256k1::new();
        secp.verify_schnorr(&sig, &msg, &identity.x_only_public_key())
            .unwrap();
    }

    #[test]
    fn single_key_identity_bip322_signature_verifies() {
        let keypair = test_keypair(2);
        let identity = SingleKeyIdentity::new(keypair, NetworkKind::Main);

        let digest = sha256::Hash::hash(b"intent proof body").to_byte_array();
        let msg = Message::from_digest(digest);

        let sig_bytes = identity.sign_message(&msg, SignatureKind::Bip322).unwrap();
        let encoded = String::from_utf8(sig_bytes).unwrap();

        let address = Address::p2tr(
            &Secp256k1::new(),
            identity.x_only_public_key(),
            None,
            Network::Bitcoin.into(),
        );

        assert!(bip322::verify(digest.as_ref(), &encoded, &address).unwrap());
    }

    #[test]
    fn readonly_identity_refuses_to_sign() {
        let keypair = test_keypair(3);
        let identity = SingleKeyIdentity::new(keypair, NetworkKind::Main);
        let readonly = identity.to_readonly();

        assert_eq!(readonly.x_only_public_key(), identity.x_only_public_key());

        let digest = sha256::Hash::hash(b"anything").to_byte_array();
        let msg = Message::from_digest(digest);

        let err = readonly
            .sign_message(&msg, SignatureKind::Schnorr)
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);
    }

    #[test]
    fn readonly_signer_session_refuses_to_nonce() {
        let keypair = test_keypair(4);
        let identity = SingleKeyIdentity::new(keypair, NetworkKind::Main);
        let readonly = identity.to_readonly();

        let mut session = readonly.signer_session();
        let key_agg = core_musig::aggregate_keys(&[identity.compressed_public_key()]).unwrap();
        let msg = musig::Message::from_digest([7u8; 32]);

        assert!(session.nonce(&key_agg, msg).is_err());
    }

    #[test]
    fn signer_session_generates_then_consumes_nonce_once() {
        let keypair = test_keypair(5);
        let identity = SingleKeyIdentity::new(keypair, NetworkKind::Main);

        let key_agg = core_musig::aggregate_keys(&[identity.compressed_public_key()]).unwrap();
        let msg = musig::Message::from_digest([9u8; 32]);

        let mut session = identity.signer_session();
        let public_nonce = session.nonce(&key_agg, msg).unwrap();
        let agg_nonce = core_musig::aggregate_nonces(&[public_nonce]);

        let partial = session.sign(&key_agg, agg_nonce, msg).unwrap();
        let sig = core_musig::aggregate_signatures(&key_agg, agg_nonce, msg, &[partial]);

        let secp = Secp256k1::new();
        let schnorr_msg = Message::from_digest(msg.as_ref().try_into().unwrap());
        secp.verify_schnorr(&sig, &schnorr_msg, &key_agg.agg_pk())
            .unwrap();

        // The nonce was already consumed; signing again must fail rather than reuse it.
        assert!(session.sign(&key_agg, agg_nonce, msg).is_err());
    }
}
