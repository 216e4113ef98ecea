//! Tapscript leaf builders: n-of-k multisig, CSV/CLTV-gated multisig, conditional multisig, and
//! hashlock leaves, covering the script shapes an Ark VTXO's taproot tree is built from.

use crate::error::ScriptError;
use bitcoin::opcodes::all::*;
use bitcoin::script::Instruction;
use bitcoin::taproot::TaprootSpendInfo;
use bitcoin::ScriptBuf;
use bitcoin::Sequence;
use bitcoin::XOnlyPublicKey;
use std::fmt;

/// How a [`multisig_script`] threshold is enforced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MultisigType {
    /// `<pk0> OP_CHECKSIGVERIFY <pk1> OP_CHECKSIGVERIFY … <pkN> OP_CHECKSIG`: every key must sign
    /// (n-of-n).
    Checksig,
    /// `<pk0> OP_CHECKSIG <pk1> OP_CHECKSIGADD … <pkN> OP_CHECKSIGADD <threshold> OP_NUMEQUAL`: a
    /// true k-of-n threshold per BIP-342, where unused signature slots push an empty vector.
    ChecksigAdd,
}

/// A multisignature [`ScriptBuf`] over `pubkeys`.
///
/// `Checksig` ignores `threshold` (it is always n-of-n). `ChecksigAdd` enforces exactly
/// `threshold`-of-`pubkeys.len()`.
pub fn multisig_script(
    pubkeys: &[XOnlyPublicKey],
    kind: MultisigType,
    threshold: usize,
) -> Result<ScriptBuf, ScriptError> {
    if pubkeys.is_empty() {
        return Err(ScriptError::EmptyKeys);
    }

    match kind {
        MultisigType::Checksig => {
            let mut builder = bitcoin::blockdata::script::Builder::new();
            for (i, pk) in pubkeys.iter().enumerate() {
                builder = builder.push_x_only_key(pk);
                builder = if i + 1 == pubkeys.len() {
                    builder.push_opcode(OP_CHECKSIG)
                } else {
                    builder.push_opcode(OP_CHECKSIGVERIFY)
                };
            }
            Ok(builder.into_script())
        }
        MultisigType::ChecksigAdd => {
            if threshold == 0 || threshold > pubkeys.len() {
                return Err(ScriptError::InvalidThreshold {
                    threshold,
                    n: pubkeys.len(),
                });
            }

            let mut builder = bitcoin::blockdata::script::Builder::new();
            for (i, pk) in pubkeys.iter().enumerate() {
                builder = builder.push_x_only_key(pk);
                builder = if i == 0 {
                    builder.push_opcode(OP_CHECKSIG)
                } else {
                    builder.push_opcode(OP_CHECKSIGADD)
                };
            }
            builder = builder
                .push_int(threshold as i64)
                .push_opcode(OP_NUMEQUAL);
            Ok(builder.into_script())
        }
    }
}

/// A [`ScriptBuf`] allowing `pubkeys` (n-of-n, chained `CHECKSIGVERIFY`/`CHECKSIG`) to spend after
/// `locktime` has elapsed as a *relative* locktime (BIP-68/BIP-112).
pub fn csv_sig_script(
    locktime: Sequence,
    pubkeys: &[XOnlyPublicKey],
) -> Result<ScriptBuf, ScriptError> {
    let inner = multisig_script(pubkeys, MultisigType::Checksig, pubkeys.len())?;

    Ok(bitcoin::blockdata::script::Builder::new()
        .push_int(locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CSV)
        .push_opcode(OP_DROP)
        .into_script()
        .into_iter()
        .chain(inner.into_iter())
        .collect::<Vec<u8>>()
        .into())
}

/// A [`ScriptBuf`] allowing `pubkeys` (n-of-n) to spend after an *absolute* locktime (BIP-65) has
/// been reached.
pub fn cltv_sig_script(
    locktime: bitcoin::absolute::LockTime,
    pubkeys: &[XOnlyPublicKey],
) -> Result<ScriptBuf, ScriptError> {
    let inner = multisig_script(pubkeys, MultisigType::Checksig, pubkeys.len())?;

    Ok(bitcoin::blockdata::script::Builder::new()
        .push_int(locktime.to_consensus_u32() as i64)
        .push_opcode(OP_CLTV)
        .push_opcode(OP_DROP)
        .into_script()
        .into_iter()
        .chain(inner.into_iter())
        .collect::<Vec<u8>>()
        .into())
}

/// Wraps `inner` behind a SHA256 preimage condition: `OP_SHA256 <hash> OP_EQUALVERIFY <inner>`.
pub fn condition_script(hash: [u8; 32], inner: &ScriptBuf) -> ScriptBuf {
    bitcoin::blockdata::script::Builder::new()
        .push_opcode(OP_SHA256)
        .push_slice(hash)
        .push_opcode(OP_EQUALVERIFY)
        .into_script()
        .into_iter()
        .chain(inner.clone().into_iter())
        .collect::<Vec<u8>>()
        .into()
}

/// A single-key hashlock condition on a HASH160 preimage, as used by [`crate::decode`]'s
/// `Hashlock160` kind: `OP_HASH160 <hash> OP_EQUALVERIFY <pk> OP_CHECKSIG`.
pub fn hashlock160_script(hash: [u8; 20], pk: XOnlyPublicKey) -> ScriptBuf {
    bitcoin::blockdata::script::Builder::new()
        .push_opcode(OP_HASH160)
        .push_slice(hash)
        .push_opcode(OP_EQUALVERIFY)
        .push_x_only_key(&pk)
        .push_opcode(OP_CHECKSIG)
        .into_script()
}

/// The script pubkey for the Taproot output corresponding to the given [`TaprootSpendInfo`].
pub fn tr_script_pubkey(spend_info: &TaprootSpendInfo) -> ScriptBuf {
    let output_key = spend_info.output_key();
    bitcoin::blockdata::script::Builder::new()
        .push_opcode(OP_PUSHNUM_1)
        .push_slice(output_key.serialize())
        .into_script()
}

/// Extracts all [`XOnlyPublicKey`]s from checksig patterns in the script (both `Checksig` and
/// `ChecksigAdd` shapes): 32-byte data pushes immediately followed by `OP_CHECKSIG`,
/// `OP_CHECKSIGVERIFY` or `OP_CHECKSIGADD`.
pub fn extract_checksig_pubkeys(script: &ScriptBuf) -> Vec<XOnlyPublicKey> {
    let instructions: Vec<_> = script.instructions().filter_map(|inst| inst.ok()).collect();

    let mut pubkeys = Vec::new();

    for window in instructions.windows(2) {
        let (push, checksig) = (&window[0], &window[1]);

        if let Instruction::PushBytes(bytes) = push {
            if bytes.len() != 32 {
                continue;
            }

            let is_checksig = matches!(
                checksig,
                Instruction::Op(op)
                    if *op == OP_CHECKSIG || *op == OP_CHECKSIGVERIFY || *op == OP_CHECKSIGADD
            );

            if is_checksig {
                if let Ok(pk) = XOnlyPublicKey::from_slice(bytes.as_bytes()) {
                    pubkeys.push(pk);
                }
            }
        }
    }

    pubkeys
}

/// Locates the `OP_CSV OP_DROP` marker and decodes the locktime value pushed immediately before
/// it, as a relative [`Sequence`].
pub fn extract_sequence_from_csv_sig_script(
    script: &ScriptBuf,
) -> Result<Sequence, InvalidTimelockScriptError> {
    let value = extract_locktime_value(script, OP_CSV)?;
    Ok(Sequence::from_consensus(value))
}

/// Locates the `OP_CLTV OP_DROP` marker and decodes the locktime value pushed immediately before
/// it, as an absolute [`bitcoin::absolute::LockTime`].
pub fn extract_locktime_from_cltv_sig_script(
    script: &ScriptBuf,
) -> Result<bitcoin::absolute::LockTime, InvalidTimelockScriptError> {
    let value = extract_locktime_value(script, OP_CLTV)?;
    Ok(bitcoin::absolute::LockTime::from_consensus(value))
}

fn extract_locktime_value(
    script: &ScriptBuf,
    marker: bitcoin::opcodes::Opcode,
) -> Result<u32, InvalidTimelockScriptError> {
    let bytes = script.to_bytes();
    let index = bytes
        .windows(2)
        .position(|window| window == [marker.to_u8(), OP_DROP.to_u8()])
        .ok_or(InvalidTimelockScriptError)?;

    let before = &bytes[..index];

    // It is either `OP_PUSHNUM_X` (a single byte) or `OP_PUSH_BYTES_X BYTES` (more than one
    // byte).
    let value_bytes = if before.len() > 1 {
        &before[1..]
    } else {
        before
    };

    let mut reversed = value_bytes.to_vec();
    reversed.reverse();

    let mut buffer = [0u8; 4];
    let input_len = reversed.len();
    if input_len > 4 {
        return Err(InvalidTimelockScriptError);
    }
    let start_index = 4 - input_len;
    buffer[start_index..].copy_from_slice(&reversed);

    Ok(u32::from_be_bytes(buffer))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTimelockScriptError;

impl fmt::Display for InvalidTimelockScriptError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str("invalid timelock sig script")
    }
}

impl std::error::Error for InvalidTimelockScriptError {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn pk(hex: &str) -> XOnlyPublicKey {
        XOnlyPublicKey::from_str(hex).unwrap()
    }

    #[test]
    fn checksig_multisig_round_trips_pubkeys() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let pk1 = pk("28845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");

        let script = multisig_script(&[pk0, pk1], MultisigType::Checksig, 2).unwrap();
        let pubkeys = extract_checksig_pubkeys(&script);

        assert_eq!(pubkeys, vec![pk0, pk1]);
    }

    #[test]
    fn checksigadd_threshold_is_enforced() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let pk1 = pk("28845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let pk2 = pk("38845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");

        let script =
            multisig_script(&[pk0, pk1, pk2], MultisigType::ChecksigAdd, 2).unwrap();
        let pubkeys = extract_checksig_pubkeys(&script);
        assert_eq!(pubkeys, vec![pk0, pk1, pk2]);

        assert!(multisig_script(&[pk0, pk1, pk2], MultisigType::ChecksigAdd, 0).is_err());
        assert!(multisig_script(&[pk0, pk1, pk2], MultisigType::ChecksigAdd, 4).is_err());
    }

    #[test]
    fn csv_sequence_round_trips() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let sequence = Sequence::from_seconds_ceil(1024).unwrap();

        let script = csv_sig_script(sequence, &[pk0]).unwrap();
        let parsed = extract_sequence_from_csv_sig_script(&script).unwrap();

        assert_eq!(
            parsed.to_relative_lock_time(),
            bitcoin::relative::LockTime::from_512_second_intervals(2).into()
        );
    }

    #[test]
    fn cltv_locktime_round_trips() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let locktime = bitcoin::absolute::LockTime::from_consensus(700_000);

        let script = cltv_sig_script(locktime, &[pk0]).unwrap();
        let parsed = extract_locktime_from_cltv_sig_script(&script).unwrap();

        assert_eq!(parsed, locktime);
    }

    #[test]
    fn empty_script_yields_no_pubkeys() {
        let script = ScriptBuf::new();
        assert!(extract_checksig_pubkeys(&script).is_empty());
    }
}
