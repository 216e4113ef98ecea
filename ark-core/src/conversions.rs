//! Conversions between `bitcoin`'s `secp256k1` types and the `musig`-aliased `secp256k1` crate
//! used for MuSig2 key aggregation and signing (see [`crate::musig`] and [`crate::batch`]).
//!
//! The two crates are separate copies of the same curve implementation; they agree on
//! serialization, so every conversion here is a reserialize-and-parse round trip.

use bitcoin::secp256k1::PublicKey;
use bitcoin::XOnlyPublicKey;

/// Converts a `bitcoin`-crate public key into its `musig`-crate equivalent.
pub fn to_musig_pk(pk: PublicKey) -> musig::PublicKey {
    musig::PublicKey::from_slice(&pk.serialize()).expect("valid conversion")
}

/// Converts a `musig`-crate x-only public key into its `bitcoin`-crate equivalent.
pub fn from_musig_xonly(pk: musig::XOnlyPublicKey) -> XOnlyPublicKey {
    XOnlyPublicKey::from_slice(&pk.serialize()).expect("valid conversion")
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::secp256k1::Secp256k1;

    #[test]
    fn pk_round_trips_through_musig() {
        let secp = Secp256k1::new();
        let (_, pk) = secp.generate_keypair(&mut rand::thread_rng());

        let musig_pk = to_musig_pk(pk);
        assert_eq!(musig_pk.serialize(), pk.serialize());
    }
}
