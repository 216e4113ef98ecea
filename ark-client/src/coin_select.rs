//! Coin selection over matured boarding outputs and exit-ready VTXOs, for building a unilateral
//! exit transaction straight to an on-chain address.
//!
//! This mirrors [`ark_core::unilateral_exit::select_anchor_utxos`]'s greedy largest-first
//! strategy, but first has to work out which boarding outputs and VTXOs are actually spendable
//! unilaterally right now (published on-chain, and past their CSV exit delay).

use crate::error::ErrorContext;
use crate::error::OptionContext;
use crate::wallet::BoardingWallet;
use crate::wallet::OnchainWallet;
use crate::wallet::Persistence;
use crate::Blockchain;
use crate::Client;
use crate::Error;
use crate::KeyProvider;
use ark_core::providers::ArkProvider;
use ark_core::providers::IndexerProvider;
use ark_core::unilateral_exit::OnChainInput;
use ark_core::unilateral_exit::VtxoInput;
use ark_core::ExplorerUtxo;
use bitcoin::Amount;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Selects matured boarding outputs and exit-ready VTXOs (largest first) until their combined
/// value covers `target_amount`.
pub async fn coin_select_for_onchain<B, W, N, K>(
    client: &Client<B, W, N, K>,
    target_amount: Amount,
) -> Result<(Vec<OnChainInput>, Vec<VtxoInput>), Error>
where
    B: Blockchain,
    W: BoardingWallet + OnchainWallet + Persistence,
    N: ArkProvider + IndexerProvider + Clone,
    K: KeyProvider,
{
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is after the Unix epoch");

    let mut onchain_inputs = boarding_inputs(client, now).await?;
    let mut vtxo_inputs = Vec::new();

    onchain_inputs.sort_by(|a, b| b.previous_output().value.cmp(&a.previous_output().value));

    let mut total: Amount = onchain_inputs.iter().map(|i| i.previous_output().value).sum();

    if total < target_amount {
        let mut exit_ready = vtxo_inputs_ready_now(client, now).await?;
        exit_ready.sort_by(|a, b| b.previous_output().value.cmp(&a.previous_output().value));

        for input in exit_ready {
            if total >= target_amount {
                break;
            }

            total += input.previous_output().value;
            vtxo_inputs.push(input);
        }
    } else {
        // Drop boarding inputs we don't actually need, largest-first already satisfies the target.
        let mut kept = Vec::new();
        let mut running = Amount::ZERO;
        for input in onchain_inputs {
            if running >= target_amount {
                break;
            }
            running += input.previous_output().value;
            kept.push(input);
        }
        onchain_inputs = kept;
        total = running;
    }

    if total < target_amount {
        return Err(Error::coin_select(format!(
            "insufficient matured boarding/VTXO funds: have {total}, need {target_amount}"
        )));
    }

    Ok((onchain_inputs, vtxo_inputs))
}

async fn boarding_inputs<B, W, N, K>(
    client: &Client<B, W, N, K>,
    now: Duration,
) -> Result<Vec<OnChainInput>, Error>
where
    B: Blockchain,
    W: BoardingWallet + OnchainWallet + Persistence,
    N: ArkProvider + IndexerProvider + Clone,
    K: KeyProvider,
{
    let exit_delay_seconds = client.boarding_exit_delay_seconds();

    let mut inputs = Vec::new();

    for boarding_output in client
        .inner
        .wallet
        .get_boarding_outputs()
        .context("failed to load boarding outputs")?
    {
        let explorer_utxos = client
            .blockchain()
            .find_outpoints(boarding_output.address())
            .await
            .context("failed to find boarding output on-chain")?;

        for ExplorerUtxo {
            outpoint,
            amount,
            is_spent,
            confirmation_blocktime,
        } in explorer_utxos
        {
            if is_spent {
                continue;
            }

            let Some(confirmation_blocktime) = confirmation_blocktime else {
                continue;
            };

            let matured_at = Duration::from_secs(confirmation_blocktime) + Duration::from_secs(exit_delay_seconds);
            if now < matured_at {
                continue;
            }

            let (exit_script, control_block) = boarding_output
                .exit_spend_info()
                .context("failed to build boarding output exit spend info")?;

            inputs.push(OnChainInput::new(
                outpoint,
                amount,
                boarding_output.script_pubkey(),
                exit_script,
                control_block,
                boarding_output.exit_delay(),
            ));
        }
    }

    Ok(inputs)
}

async fn vtxo_inputs_ready_now<B, W, N, K>(
    client: &Client<B, W, N, K>,
    now: Duration,
) -> Result<Vec<VtxoInput>, Error>
where
    B: Blockchain,
    W: BoardingWallet + OnchainWallet + Persistence,
    N: ArkProvider + IndexerProvider + Clone,
    K: KeyProvider,
{
    let (vtxo_list, script_pubkey_to_vtxo) = client
        .list_vtxos()
        .await
        .context("failed to list VTXOs for unilateral exit coin selection")?;

    let mut explorer_utxos = Vec::new();
    for vtxo in script_pubkey_to_vtxo.values() {
        let utxos = client
            .blockchain()
            .find_outpoints(vtxo.address())
            .await
            .context("failed to find published VTXO exit output on-chain")?;

        explorer_utxos.extend(utxos);
    }

    let mut inputs = Vec::new();
    for virtual_tx_outpoint in vtxo_list.exit_ready(now, explorer_utxos, script_pubkey_to_vtxo.clone()) {
        let vtxo = script_pubkey_to_vtxo
            .get(&virtual_tx_outpoint.script)
            .context("missing VTXO for exit-ready outpoint")?;

        let (exit_script, control_block) = vtxo
            .exit_spend_info()
            .context("failed to build VTXO exit spend info")?;

        inputs.push(VtxoInput::new(
            virtual_tx_outpoint.outpoint,
            virtual_tx_outpoint.amount,
            vtxo.script_pubkey(),
            exit_script,
            control_block,
            vtxo.exit_delay(),
        ));
    }

    Ok(inputs)
}
