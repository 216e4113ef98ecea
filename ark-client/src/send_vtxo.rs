use crate::error::ErrorContext;
use crate::error::OptionContext;
use crate::utils::timeout_op;
use crate::wallet::BoardingWallet;
use crate::wallet::OnchainWallet;
use crate::Blockchain;
use crate::Client;
use crate::Error;
use crate::KeyProvider;
use ark_core::coin_select::select_vtxos;
use ark_core::providers::ArkProvider;
use ark_core::providers::IndexerProvider;
use ark_core::script::extract_checksig_pubkeys;
use ark_core::send;
use ark_core::send::build_offchain_transactions;
use ark_core::send::sign_ark_transaction;
use ark_core::send::sign_checkpoint_transaction;
use ark_core::send::OffchainTransactions;
use ark_core::ArkAddress;
use ark_core::ErrorContext as _;
use bitcoin::psbt;
use bitcoin::secp256k1;
use bitcoin::secp256k1::schnorr;
use bitcoin::Amount;
use bitcoin::Txid;
use bitcoin::XOnlyPublicKey;

impl<B, W, N, K> Client<B, W, N, K>
where
    B: Blockchain,
    W: BoardingWallet + OnchainWallet,
    N: ArkProvider + IndexerProvider + Clone,
    K: KeyProvider,
{
    /// Spend confirmed and pre-confimed VTXOs in an Ark transaction sending the given `amount` to
    /// the given `address`.
    ///
    /// The Ark transaction is built in collaboration with the Ark server. The outputs of said
    /// transaction will be pre-confirmed VTXOs.
    ///
    /// # Returns
    ///
    /// The [`Txid`] of the generated Ark transaction.
    pub async fn send_vtxo(&self, address: ArkAddress, amount: Amount) -> Result<Txid, Error> {
        let (vtxo_list, script_pubkey_to_vtxo) = self
            .list_vtxos()
            .await
            .context("failed to get spendable VTXOs")?;

        // Recoverable VTXOs cannot be sent; only settled and pre-confirmed ones are spendable.
        let spendable_virtual_tx_outpoints = vtxo_list
            .spendable_offchain()
            .map(|vtxo| ark_core::coin_select::VirtualTxOutPoint {
                outpoint: vtxo.outpoint,
                expire_at: vtxo.expires_at,
                amount: vtxo.amount,
            })
            .collect::<Vec<_>>();

        let selected_coins = select_vtxos(
            spendable_virtual_tx_outpoints,
            amount,
            self.server_info.dust,
            true,
        )
        .map_err(Error::from)
        .context("failed to select coins")?;

        let vtxo_inputs = selected_coins
            .into_iter()
            .map(|selected| {
                let virtual_tx_outpoint = vtxo_list
                    .all()
                    .find(|v| v.outpoint == selected.outpoint)
                    .context("failed to find matching VTXO outpoint")?;

                let vtxo = script_pubkey_to_vtxo
                    .get(&virtual_tx_outpoint.script)
                    .context("failed to find VTXO matching selected outpoint's script")?;

                let (forfeit_script, control_block) = vtxo
                    .forfeit_spend_info()
                    .context("failed to get forfeit spend info")?;

                Ok(send::VtxoInput::new(
                    forfeit_script,
                    None,
                    control_block,
                    vtxo.tapscripts(),
                    vtxo.script_pubkey(),
                    virtual_tx_outpoint.amount,
                    virtual_tx_outpoint.outpoint,
                ))
            })
            .collect::<Result<Vec<_>, Error>>()?;

        let (change_address, _) = self.get_offchain_address()?;

        let OffchainTransactions {
            mut ark_tx,
            checkpoint_txs,
        } = build_offchain_transactions(
            &[(&address, amount)],
            Some(&change_address),
            &vtxo_inputs,
            &self.server_info,
        )
        .map_err(Error::from)
        .context("failed to build offchain transactions")?;

        let sign_fn = |input: &mut psbt::Input,
                       msg: secp256k1::Message|
         -> Result<(schnorr::Signature, XOnlyPublicKey), ark_core::Error> {
            let script = input
                .witness_script
                .as_ref()
                .ok_or_else(|| ark_core::Error::ad_hoc("missing witness script to sign"))?;

            let secp = self.secp();

            for pk in extract_checksig_pubkeys(script) {
                if let Ok(keypair) = self.keypair_by_pk(&pk) {
                    let sig = secp.sign_schnorr_no_aux_rand(&msg, &keypair);
                    return Ok((sig, pk));
                }
            }

            Err(ark_core::Error::ad_hoc(
                "no owned key found for checkpoint/ark transaction input",
            ))
        };

        let checkpoint_outputs = checkpoint_txs
            .iter()
            .map(|(_, checkpoint_output, checkpoint_outpoint, _)| {
                (*checkpoint_output, *checkpoint_outpoint)
            })
            .collect::<Vec<_>>();

        for i in 0..checkpoint_txs.len() {
            sign_ark_transaction(sign_fn, &mut ark_tx, &checkpoint_outputs, i)?;
        }

        let ark_txid = ark_tx.unsigned_tx.compute_txid();

        let unsigned_checkpoint_txs = checkpoint_txs
            .iter()
            .map(|(psbt, _, _, _)| psbt.clone())
            .collect::<Vec<_>>();

        let mut res = timeout_op(
            self.inner.timeout,
            self.network_client()
                .submit_offchain_transaction_request(ark_tx, unsigned_checkpoint_txs),
        )
        .await
        .context("failed to submit offchain transaction request")?
        .map_err(Error::from)?;

        for (checkpoint_psbt, (_, _, _, vtxo_input)) in
            res.signed_checkpoint_txs.iter_mut().zip(checkpoint_txs.iter())
        {
            sign_checkpoint_transaction(sign_fn, checkpoint_psbt, vtxo_input)?;
        }

        timeout_op(
            self.inner.timeout,
            self.network_client()
                .finalize_offchain_transaction(ark_txid, res.signed_checkpoint_txs),
        )
        .await
        .context("failed to finalize offchain transaction")?
        .map_err(Error::from)?;

        Ok(ark_txid)
    }
}
