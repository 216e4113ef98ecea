//! Ark off-chain addresses.
//!
//! An [`ArkAddress`] commits to both the Ark server's forfeit/cosigning key and the VTXO's
//! tweaked taproot output key, so that a payer can derive the correct `pkScript` without needing
//! out-of-band knowledge of which server the recipient uses. The wire encoding is bech32m, with a
//! network-dependent human-readable part.

use crate::Error;
use crate::ErrorContext;
use bech32::Bech32m;
use bitcoin::opcodes::all::OP_PUSHNUM_1;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;
use std::fmt;
use std::str::FromStr;

const HRP_MAINNET: &str = "ark";
const HRP_TESTNET: &str = "tark";

/// An Ark off-chain address: `server_pk (32 bytes) || vtxo_tap_key (32 bytes)`, bech32m-encoded
/// under a network-dependent human-readable part.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArkAddress {
    network: Network,
    server_pk: XOnlyPublicKey,
    vtxo_tap_key: XOnlyPublicKey,
}

impl ArkAddress {
    pub fn new(network: Network, server_pk: XOnlyPublicKey, vtxo_tap_key: XOnlyPublicKey) -> Self {
        Self {
            network,
            server_pk,
            vtxo_tap_key,
        }
    }

    pub fn network(&self) -> Network {
        self.network
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server_pk
    }

    pub fn vtxo_tap_key(&self) -> XOnlyPublicKey {
        self.vtxo_tap_key
    }

    /// The `OP_1 <32-byte x-only key>` pkScript corresponding to this address's VTXO key.
    pub fn to_p2tr_script_pubkey(&self) -> ScriptBuf {
        ScriptBuf::builder()
            .push_opcode(OP_PUSHNUM_1)
            .push_slice(self.vtxo_tap_key.serialize())
            .into_script()
    }

    /// Same pkScript as [`Self::to_p2tr_script_pubkey`]. Amounts below the server's configured
    /// dust threshold still resolve to this taproot output; the distinction lives in how the
    /// server accounts for them (see `VtxoList`), not in the script.
    pub fn to_sub_dust_script_pubkey(&self) -> ScriptBuf {
        self.to_p2tr_script_pubkey()
    }

    fn hrp(&self) -> &'static str {
        match self.network {
            Network::Bitcoin => HRP_MAINNET,
            _ => HRP_TESTNET,
        }
    }

    fn payload(&self) -> [u8; 64] {
        let mut bytes = [0u8; 64];
        bytes[..32].copy_from_slice(&self.server_pk.serialize());
        bytes[32..].copy_from_slice(&self.vtxo_tap_key.serialize());
        bytes
    }
}

impl fmt::Display for ArkAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let hrp = bech32::Hrp::parse(self.hrp()).map_err(|_| fmt::Error)?;
        let encoded =
            bech32::encode::<Bech32m>(hrp, &self.payload()).map_err(|_| fmt::Error)?;
        f.write_str(&encoded)
    }
}

impl FromStr for ArkAddress {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (hrp, data) =
            bech32::decode(s).map_err(|e| Error::invalid_input(format!("invalid address: {e}")))?;

        let network = match hrp.as_str() {
            HRP_MAINNET => Network::Bitcoin,
            HRP_TESTNET => Network::Testnet,
            other => return Err(Error::invalid_input(format!("unknown address HRP: {other}"))),
        };

        if data.len() != 64 {
            return Err(Error::invalid_input(format!(
                "invalid Ark address payload length: expected 64 bytes, got {}",
                data.len()
            )));
        }

        let server_pk = XOnlyPublicKey::from_slice(&data[..32])
            .context("invalid server public key in Ark address")?;
        let vtxo_tap_key = XOnlyPublicKey::from_slice(&data[32..])
            .context("invalid VTXO taproot key in Ark address")?;

        Ok(Self {
            network,
            server_pk,
            vtxo_tap_key,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn round_trips_through_bech32m() {
        let server_pk = XOnlyPublicKey::from_str(
            "f9308a019258c31049344f85f89d5229b531c845836f99b08601f113bce036f",
        )
        .unwrap();
        let vtxo_tap_key = XOnlyPublicKey::from_str(
            "dff1d77f2a671c5f36183726db2341be58feae1da2deced843240f7b502ba65",
        )
        .unwrap();

        let address = ArkAddress::new(Network::Signet, server_pk, vtxo_tap_key);
        let encoded = address.to_string();

        let decoded = ArkAddress::from_str(&encoded).unwrap();
        assert_eq!(decoded.server_pk(), server_pk);
        assert_eq!(decoded.vtxo_tap_key(), vtxo_tap_key);
        assert_eq!(decoded.network(), Network::Testnet);
    }

    #[test]
    fn rejects_wrong_length_payload() {
        let hrp = bech32::Hrp::parse(HRP_MAINNET).unwrap();
        let encoded = bech32::encode::<Bech32m>(hrp, &[0u8; 10]).unwrap();
        assert!(ArkAddress::from_str(&encoded).is_err());
    }
}
