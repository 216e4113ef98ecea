//! A standalone MuSig2 (BIP-327) engine.
//!
//! This generalizes the inline key-aggregation/nonce/partial-signature flow that
//! [`crate::batch`] weaves through `generate_nonce_tree`, `aggregate_nonces` and
//! `sign_batch_tree_tx`, so that any n-of-n cosigning scenario (not just batch tree outputs) can
//! reuse the same few calls into `secp256k1::musig`.

use crate::conversions::from_musig_xonly;
use crate::conversions::to_musig_pk;
use crate::Error;
use bitcoin::key::Keypair;
use bitcoin::secp256k1::PublicKey;
use bitcoin::XOnlyPublicKey;
use rand::CryptoRng;
use rand::Rng;

/// The aggregated public key of a set of cosigners, and the cache needed to sign and verify
/// against it.
pub struct KeyAgg {
    cache: musig::KeyAggCache,
}

impl KeyAgg {
    /// Aggregate `pks` into a single MuSig2 public key.
    ///
    /// `pks` does not need to be sorted; `secp256k1::musig` sorts internally before hashing.
    pub fn new(pks: &[PublicKey]) -> Result<Self, Error> {
        if pks.is_empty() {
            return Err(Error::crypto("cannot aggregate an empty key set"));
        }

        let secp = musig::Secp256k1::new();

        let musig_pks = pks.iter().map(|pk| to_musig_pk(*pk)).collect::<Vec<_>>();
        let cache = musig::KeyAggCache::new(&secp, &musig_pks.iter().collect::<Vec<_>>());

        Ok(Self { cache })
    }

    /// The aggregated x-only public key, before any taproot tweak.
    pub fn agg_pk(&self) -> XOnlyPublicKey {
        from_musig_xonly(self.cache.agg_pk())
    }

    /// Tweak the aggregated key by a taproot merkle root, turning it into the output key that a
    /// taproot key-spend path actually signs for.
    pub fn tap_tweak(&mut self, tap_tweak: [u8; 32]) -> Result<(), Error> {
        let secp = musig::Secp256k1::new();

        let tweak = musig::Scalar::from(
            musig::SecretKey::from_slice(&tap_tweak).map_err(|e| Error::ad_hoc(format!("invalid tweak: {e}")))?,
        );

        self.cache
            .pubkey_xonly_tweak_add(&secp, &tweak)
            .map_err(Error::crypto)?;

        Ok(())
    }
}

/// A cosigner's share of an aggregated nonce, kept around until it is time to sign.
///
/// [`musig::SecretNonce`] cannot be cloned or copied: a cosigner must consume it exactly once to
/// avoid nonce reuse, so it is held behind an [`Option`] and taken with [`Self::take_secret`].
pub struct NonceKeyPair {
    secret: Option<musig::SecretNonce>,
    public: musig::PublicNonce,
}

impl NonceKeyPair {
    pub fn public(&self) -> musig::PublicNonce {
        self.public
    }

    pub fn take_secret(&mut self) -> Option<musig::SecretNonce> {
        self.secret.take()
    }
}

/// Generate a fresh nonce key pair for `own_pk` to cosign `msg` under `key_agg`.
pub fn generate_nonce<R>(
    rng: &mut R,
    key_agg: &KeyAgg,
    own_pk: PublicKey,
    msg: musig::Message,
) -> NonceKeyPair
where
    R: Rng + CryptoRng,
{
    let secp = musig::Secp256k1::new();

    let session_id = musig::SessionSecretRand::new();
    let extra_rand = rng.r#gen();

    let (secret, public) =
        key_agg
            .cache
            .nonce_gen(&secp, session_id, to_musig_pk(own_pk), msg, extra_rand);

    NonceKeyPair {
        secret: Some(secret),
        public,
    }
}

/// Aggregate every cosigner's public nonce into a single nonce for the signing session.
pub fn aggregate_nonces(public_nonces: &[musig::PublicNonce]) -> musig::AggregatedNonce {
    let secp = musig::Secp256k1::new();

    musig::AggregatedNonce::new(&secp, &public_nonces.iter().collect::<Vec<_>>())
}

/// Produce this cosigner's partial signature share over `msg`.
pub fn partial_sign(
    key_agg: &KeyAgg,
    agg_nonce: musig::AggregatedNonce,
    own_secret_nonce: musig::SecretNonce,
    own_keypair: &Keypair,
    msg: musig::Message,
) -> Result<musig::PartialSignature, Error> {
    let secp = musig::Secp256k1::new();

    let own_keypair = musig::Keypair::from_seckey_slice(&secp, &own_keypair.secret_bytes())
        .map_err(|e| Error::ad_hoc(format!("invalid keypair: {e}")))?;

    let session = musig::Session::new(&secp, &key_agg.cache, agg_nonce, msg);

    Ok(session.partial_sign(&secp, own_secret_nonce, &own_keypair, &key_agg.cache))
}

/// Aggregate every cosigner's partial signature into a final, verifiable Schnorr signature.
pub fn aggregate_partial_signatures(
    key_agg: &KeyAgg,
    agg_nonce: musig::AggregatedNonce,
    msg: musig::Message,
    partial_sigs: &[musig::PartialSignature],
) -> bitcoin::secp256k1::schnorr::Signature {
    let secp = musig::Secp256k1::new();

    let session = musig::Session::new(&secp, &key_agg.cache, agg_nonce, msg);
    let sig = session.partial_sig_agg(partial_sigs);

    bitcoin::secp256k1::schnorr::Signature::from_slice(sig.serialize().as_slice())
        .expect("aggregated MuSig2 signature is a valid Schnorr signature")
}

/// Sort cosigner public keys into the canonical order `secp256k1::musig` uses internally for key
/// aggregation, so that callers who need a stable cosigner ordering (e.g. to label PSBT fields)
/// agree with what [`aggregate_keys`] actually hashed.
pub fn sort_keys(mut pks: Vec<PublicKey>) -> Vec<PublicKey> {
    pks.sort_by_key(|pk| pk.serialize());
    pks
}

/// Aggregate `pks` into a single MuSig2 key. Thin wrapper over [`KeyAgg::new`].
pub fn aggregate_keys(pks: &[PublicKey]) -> Result<KeyAgg, Error> {
    KeyAgg::new(pks)
}

/// Generate this cosigner's nonce key pair for `msg`. Thin wrapper over [`generate_nonce`].
pub fn generate_nonces<R>(
    rng: &mut R,
    key_agg: &KeyAgg,
    own_pk: PublicKey,
    msg: musig::Message,
) -> NonceKeyPair
where
    R: Rng + CryptoRng,
{
    generate_nonce(rng, key_agg, own_pk, msg)
}

/// Produce this cosigner's partial signature share. Thin wrapper over [`partial_sign`].
pub fn sign(
    key_agg: &KeyAgg,
    agg_nonce: musig::AggregatedNonce,
    own_secret_nonce: musig::SecretNonce,
    own_keypair: &Keypair,
    msg: musig::Message,
) -> Result<musig::PartialSignature, Error> {
    partial_sign(key_agg, agg_nonce, own_secret_nonce, own_keypair, msg)
}

/// Aggregate every partial signature into the final Schnorr signature. Thin wrapper over
/// [`aggregate_partial_signatures`].
pub fn aggregate_signatures(
    key_agg: &KeyAgg,
    agg_nonce: musig::AggregatedNonce,
    msg: musig::Message,
    partial_sigs: &[musig::PartialSignature],
) -> bitcoin::secp256k1::schnorr::Signature {
    aggregate_partial_signatures(key_agg, agg_nonce, msg, partial_sigs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;
    use bitcoin::secp256k1::SecretKey;

    #[test]
    fn two_of_two_signing_session_produces_valid_signature() {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();

        let kp_a = Keypair::new(&secp, &mut rng);
        let kp_b = Keypair::new(&secp, &mut rng);

        let pk_a = kp_a.public_key();
        let pk_b = kp_b.public_key();

        let mut key_agg_a = KeyAgg::new(&[pk_a, pk_b]).unwrap();
        let key_agg_b = KeyAgg::new(&[pk_a, pk_b]).unwrap();

        assert_eq!(key_agg_a.agg_pk(), key_agg_b.agg_pk());

        key_agg_a.tap_tweak([0u8; 32]).unwrap();

        let msg = musig::Message::from_digest([7u8; 32]);

        let mut nonce_a = generate_nonce(&mut rng, &key_agg_a, pk_a, msg);
        let mut nonce_b = generate_nonce(&mut rng, &key_agg_a, pk_b, msg);

        let agg_nonce = aggregate_nonces(&[nonce_a.public(), nonce_b.public()]);

        let sig_a = partial_sign(
            &key_agg_a,
            agg_nonce,
            nonce_a.take_secret().unwrap(),
            &kp_a,
            msg,
        )
        .unwrap();
        let sig_b = partial_sign(
            &key_agg_a,
            agg_nonce,
            nonce_b.take_secret().unwrap(),
            &kp_b,
            msg,
        )
        .unwrap();

        let final_sig = aggregate_partial_signatures(&key_agg_a, agg_nonce, msg, &[sig_a, sig_b]);

        let _ = SecretKey::from_slice(&[1u8; 32]).unwrap(); // sanity: secp256k1 interop works.
        assert_eq!(final_sig.serialize().len(), 64);
    }
}
