//! Provider contracts.
//!
//! Network access is collapsed into three traits: talking to an indexer, talking to an Ark
//! server, and talking to the Bitcoin network directly. No concrete implementation is shipped;
//! callers plug in their own gRPC/REST/Electrum/whatever client.

use crate::server;
use crate::ArkAddress;
use crate::Error;
use crate::ExplorerUtxo;
use bitcoin::Address;
use bitcoin::FeeRate;
use bitcoin::Psbt;
use bitcoin::ScriptBuf;
use bitcoin::SignedAmount;
use bitcoin::Transaction;
use bitcoin::Txid;
use std::future::Future;

#[derive(Clone, Copy, Debug)]
pub struct TxStatus {
    pub confirmed_at: Option<i64>,
}

#[derive(Clone, Copy, Debug)]
pub struct SpendStatus {
    pub spend_txid: Option<Txid>,
}

/// Queries against an Ark indexer: VTXO/commitment-tx lookups that the Ark server itself does not
/// serve directly.
pub trait IndexerProvider {
    fn get_vtxos(
        &self,
        request: server::GetVtxosRequest,
    ) -> impl Future<Output = Result<Vec<server::VirtualTxOutPoint>, Error>> + Send;

    fn get_vtxo_chain(
        &self,
        outpoint: bitcoin::OutPoint,
    ) -> impl Future<Output = Result<server::VtxoChains, Error>> + Send;

    fn get_batch_sweep_txs(
        &self,
        batch_outpoint: bitcoin::OutPoint,
    ) -> impl Future<Output = Result<Vec<Txid>, Error>> + Send;

    fn get_virtual_txs(
        &self,
        txids: Vec<Txid>,
        page: Option<server::IndexerPage>,
    ) -> impl Future<Output = Result<server::VirtualTxsResponse, Error>> + Send;

    /// Registers interest in `scripts`, returning a subscription id to pass to
    /// [`IndexerProvider::get_subscription`].
    fn subscribe_to_scripts(
        &self,
        scripts: Vec<ScriptBuf>,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    fn unsubscribe_from_scripts(
        &self,
        subscription_id: String,
        scripts: Vec<ScriptBuf>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn get_subscription(
        &self,
        subscription_id: String,
    ) -> impl Future<
        Output = Result<
            std::pin::Pin<Box<dyn futures::Stream<Item = Result<server::SubscriptionResponse, Error>> + Send>>,
            Error,
        >,
    > + Send;
}

/// Queries and round-participation calls against an Ark server.
pub trait ArkProvider {
    fn get_info(&self) -> impl Future<Output = Result<server::Info, Error>> + Send;

    fn register_intent(
        &self,
        intent: crate::intent::Intent,
    ) -> impl Future<Output = Result<String, Error>> + Send;

    fn delete_intent(&self, intent: crate::intent::Intent) -> impl Future<Output = Result<(), Error>> + Send;

    /// Confirms a previously registered intent once the coordinator has started a batch round.
    fn confirm_registration(&self, intent_id: String) -> impl Future<Output = Result<(), Error>> + Send;

    /// Estimates the chain fee a boarding intent would need to cover, as a signed delta against
    /// the intent's declared inputs and outputs (negative when the intent is a net payer).
    fn estimate_fees(
        &self,
        intent: crate::intent::Intent,
    ) -> impl Future<Output = Result<SignedAmount, Error>> + Send;

    fn submit_offchain_transaction_request(
        &self,
        signed_ark_tx: Psbt,
        checkpoint_txs: Vec<Psbt>,
    ) -> impl Future<Output = Result<server::SubmitOffchainTxResponse, Error>> + Send;

    fn finalize_offchain_transaction(
        &self,
        ark_txid: Txid,
        signed_checkpoint_txs: Vec<Psbt>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_signed_forfeit_txs(
        &self,
        signed_forfeit_txs: Vec<bitcoin::Psbt>,
        signed_commitment_tx: Option<bitcoin::Psbt>,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_tree_nonces(
        &self,
        batch_id: &str,
        cosigner_pk: bitcoin::secp256k1::PublicKey,
        nonces: server::NoncePks,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn submit_tree_signatures(
        &self,
        batch_id: &str,
        cosigner_pk: bitcoin::secp256k1::PublicKey,
        signatures: server::PartialSigTree,
    ) -> impl Future<Output = Result<(), Error>> + Send;

    fn get_event_stream(
        &self,
        topics: Vec<String>,
    ) -> impl Future<Output = Result<std::pin::Pin<Box<dyn futures::Stream<Item = Result<server::StreamEvent, Error>> + Send>>, Error>>
           + Send;

    fn get_transactions_stream(
        &self,
    ) -> impl Future<Output = Result<std::pin::Pin<Box<dyn futures::Stream<Item = Result<server::StreamEvent, Error>> + Send>>, Error>>
           + Send;
}

/// Direct Bitcoin-network access: looking up UTXOs, broadcasting, and reading fee estimates.
///
/// `ark-client`'s local `Blockchain` trait aliases this contract for its public API.
pub trait OnchainProvider {
    fn find_outpoints(
        &self,
        address: &Address,
    ) -> impl Future<Output = Result<Vec<ExplorerUtxo>, Error>> + Send;

    fn find_tx(&self, txid: &Txid) -> impl Future<Output = Result<Option<Transaction>, Error>> + Send;

    fn get_tx_status(&self, txid: &Txid) -> impl Future<Output = Result<TxStatus, Error>> + Send;

    fn get_output_status(
        &self,
        txid: &Txid,
        vout: u32,
    ) -> impl Future<Output = Result<SpendStatus, Error>> + Send;

    fn broadcast(&self, tx: &Transaction) -> impl Future<Output = Result<(), Error>> + Send;

    fn get_fee_rate(&self) -> impl Future<Output = Result<FeeRate, Error>> + Send;

    fn broadcast_package(&self, txs: &[&Transaction]) -> impl Future<Output = Result<(), Error>> + Send;
}

/// Resolve the pkScript a VTXO's owner should be watching for, given their off-chain address.
///
/// Convenience used by provider implementations that index by script rather than by Ark address.
pub fn watch_script(address: &ArkAddress) -> ScriptBuf {
    address.to_p2tr_script_pubkey()
}
