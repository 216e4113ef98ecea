//! Boarding outputs: on-chain UTXOs locked under a script that lets the owner either have them
//! included in the next batch (forfeit path, server + owner) or, once `exit_delay` has elapsed
//! without that happening, reclaim them unilaterally.

use ark_script::script::csv_sig_script;
use ark_script::script::multisig_script;
use ark_script::script::tr_script_pubkey;
use ark_script::script::MultisigType;
use crate::Error;
use crate::ErrorContext;
use crate::UNSPENDABLE_KEY;
use bitcoin::key::PublicKey;
use bitcoin::key::Secp256k1;
use bitcoin::key::Verification;
use bitcoin::taproot;
use bitcoin::taproot::LeafVersion;
use bitcoin::taproot::TaprootBuilder;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::Address;
use bitcoin::Network;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;

/// All the information needed to spend a boarding UTXO.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BoardingOutput {
    server_pk: XOnlyPublicKey,
    owner: XOnlyPublicKey,
    spend_info: TaprootSpendInfo,
    exit_delay: bitcoin::Sequence,
    address: Address,
}

impl BoardingOutput {
    pub fn new<C: Verification>(
        secp: &Secp256k1<C>,
        server_pk: XOnlyPublicKey,
        owner: XOnlyPublicKey,
        exit_delay: bitcoin::Sequence,
        network: Network,
    ) -> Result<Self, Error> {
        let unspendable_key: PublicKey = UNSPENDABLE_KEY
            .parse()
            .map_err(|e| Error::ad_hoc(format!("invalid unspendable key: {e}")))?;
        let (unspendable_key, _) = unspendable_key.inner.x_only_public_key();

        let forfeit_script = multisig_script(&[server_pk, owner], MultisigType::Checksig, 2)
            .map_err(|e| Error::ad_hoc(e.to_string()))?;
        let exit_script = csv_sig_script(exit_delay, &[owner])
            .map_err(|e| Error::ad_hoc(e.to_string()))?;

        let spend_info = TaprootBuilder::new()
            .add_leaf(1, forfeit_script)
            .map_err(Error::ad_hoc)?
            .add_leaf(1, exit_script)
            .map_err(Error::ad_hoc)?
            .finalize(secp, unspendable_key)
            .map_err(|_| Error::ad_hoc("failed to finalize boarding output taproot tree"))?;

        let script_pubkey = tr_script_pubkey(&spend_info);
        let address = Address::from_script(&script_pubkey, network)
            .map_err(|e| Error::ad_hoc(format!("invalid script: {e}")))?;

        Ok(Self {
            server_pk,
            owner,
            spend_info,
            exit_delay,
            address,
        })
    }

    pub fn owner_pk(&self) -> XOnlyPublicKey {
        self.owner
    }

    pub fn server_pk(&self) -> XOnlyPublicKey {
        self.server_pk
    }

    pub fn address(&self) -> &Address {
        &self.address
    }

    pub fn script_pubkey(&self) -> ScriptBuf {
        self.address.script_pubkey()
    }

    pub fn exit_delay(&self) -> bitcoin::Sequence {
        self.exit_delay
    }

    /// The spend info for the forfeit branch (server + owner), used when the boarding UTXO is
    /// included in the next batch's commitment transaction.
    pub fn forfeit_spend_info(&self) -> (ScriptBuf, taproot::ControlBlock) {
        let forfeit_script = multisig_script(&[self.server_pk, self.owner], MultisigType::Checksig, 2)
            .expect("valid script");

        let control_block = self
            .spend_info
            .control_block(&(forfeit_script.clone(), LeafVersion::TapScript))
            .expect("forfeit script present at construction");

        (forfeit_script, control_block)
    }

    /// The spend info for the unilateral exit branch (owner alone, after `exit_delay`).
    pub fn exit_spend_info(&self) -> Result<(ScriptBuf, taproot::ControlBlock), Error> {
        let exit_script =
            csv_sig_script(self.exit_delay, &[self.owner]).map_err(|e| Error::ad_hoc(e.to_string()))?;

        let control_block = self
            .spend_info
            .control_block(&(exit_script.clone(), LeafVersion::TapScript))
            .context("missing exit script in boarding output tree")?;

        Ok((exit_script, control_block))
    }
}
