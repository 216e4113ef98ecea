//! Wallet abstractions a caller plugs in to operate a [`crate::Client`].
//!
//! This crate does not ship a concrete wallet: boarding outputs and on-chain coins are whatever
//! the host application already manages (bdk, a custodial ledger, a hardware signer, ...). These
//! traits describe the minimal surface a [`crate::Client`] needs from that wallet.

use crate::Error;
use ark_core::BoardingOutput;
use ark_core::UtxoCoinSelection;
use bitcoin::key::XOnlyPublicKey;
use bitcoin::secp256k1::schnorr::Signature;
use bitcoin::secp256k1::Message;
use bitcoin::secp256k1::SecretKey;
use bitcoin::Address;
use bitcoin::Amount;
use bitcoin::FeeRate;
use bitcoin::Network;
use bitcoin::Psbt;
use bitcoin::Sequence;

/// A snapshot of on-chain funds under the wallet's control.
#[derive(Debug, Clone, Copy, Default)]
pub struct Balance {
    pub confirmed: Amount,
    pub trusted_pending: Amount,
    pub untrusted_pending: Amount,
}

impl Balance {
    pub fn total(&self) -> Amount {
        self.confirmed + self.trusted_pending + self.untrusted_pending
    }
}

/// Management of boarding outputs, the on-chain side of an Ark round entry.
///
/// A boarding output is a taproot address combining the owner's key with the Ark server's, spent
/// either cooperatively (via a batch round) or unilaterally after `exit_delay` matures.
pub trait BoardingWallet {
    /// Derives (or returns, if already derived) the boarding output used to enter the next batch
    /// round.
    fn new_boarding_output(
        &self,
        server_pk: XOnlyPublicKey,
        exit_delay: Sequence,
        network: Network,
    ) -> Result<BoardingOutput, Error>;

    /// All boarding outputs this wallet has ever derived, spent or not.
    fn get_boarding_outputs(&self) -> Result<Vec<BoardingOutput>, Error>;

    /// Schnorr-signs `msg` with the secret key owning `pk`, for cooperative boarding-output spends
    /// (joining a batch round) where the Ark server supplies the sighash.
    fn sign_for_pk(&self, pk: &XOnlyPublicKey, msg: &Message) -> Result<Signature, Error>;
}

/// Day-to-day on-chain wallet operations: addresses, balance, sending, signing, coin selection.
pub trait OnchainWallet {
    /// A receiving address for on-chain payments and unilateral-exit change outputs.
    ///
    /// For HD wallets this is expected to rotate; for simpler wallets it may be static.
    fn get_onchain_address(&self) -> Result<Address, Error>;

    /// Refreshes the wallet's view of the chain (new blocks, mempool state) before balance or coin
    /// selection queries.
    fn sync(&self) -> impl std::future::Future<Output = Result<(), Error>> + Send;

    fn balance(&self) -> Result<Balance, Error>;

    /// Builds an unsigned PSBT paying `amount` to `address` at `fee_rate`, coin-selected and
    /// change-added by the wallet itself.
    fn prepare_send_to_address(
        &self,
        address: Address,
        amount: Amount,
        fee_rate: FeeRate,
    ) -> Result<Psbt, Error>;

    /// Signs every input of `psbt` the wallet recognizes as its own. Returns whether the PSBT is
    /// now fully finalized.
    fn sign(&self, psbt: &mut Psbt) -> Result<bool, Error>;

    /// Selects on-chain coins covering at least `target_amount`, for CPFP anchor bumps and
    /// unilateral-exit transactions.
    fn select_coins(&self, target_amount: Amount) -> Result<UtxoCoinSelection, Error>;
}

/// Persistence for boarding outputs and the secret keys backing them.
///
/// Kept separate from [`BoardingWallet`] so a caller can swap storage backends (in-memory, sqlite,
/// ...) without touching signing logic.
pub trait Persistence {
    fn save_boarding_output(
        &self,
        sk: SecretKey,
        boarding_output: BoardingOutput,
    ) -> Result<(), Error>;

    fn load_boarding_outputs(&self) -> Result<Vec<BoardingOutput>, Error>;

    /// Looks up the secret key owning `pk`, for signing a boarding output's unilateral exit leaf.
    fn sk_for_pk(&self, pk: &XOnlyPublicKey) -> Result<SecretKey, Error>;
}
