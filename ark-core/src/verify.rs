//! Tapscript signature verification.
//!
//! Reuses the sighash-reconstruction `ark-core::send`/`ark-core::batch` already do via
//! [`SighashCache`], and the leaf decoder from [`ark_script::decode`], to figure out which public
//! keys a given leaf script requires signatures from and check them independently of signing.

use ark_script::decode::decode_tapscript;
use ark_script::decode::TapscriptKind;
use ark_script::script::MultisigType;
use bitcoin::psbt;
use bitcoin::secp256k1::schnorr;
use bitcoin::secp256k1::Secp256k1;
use bitcoin::secp256k1::Verification;
use bitcoin::sighash::Prevouts;
use bitcoin::sighash::SighashCache;
use bitcoin::taproot::ControlBlock;
use bitcoin::taproot::LeafVersion;
use bitcoin::ScriptBuf;
use bitcoin::TapLeafHash;
use bitcoin::TapSighashType;
use bitcoin::Transaction;
use bitcoin::TxOut;
use bitcoin::XOnlyPublicKey;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum VerifyError {
    #[error("control block does not commit `leaf_script` under the previous output's key")]
    BadCommitment,
    #[error("failed to reconstruct sighash: {0}")]
    Sighash(String),
    #[error("leaf script is not a recognized tapscript: {0}")]
    UnknownScript(#[from] ark_script::error::ScriptError),
    #[error("expected {expected} signatures, found {found}")]
    WrongSignatureCount { expected: usize, found: usize },
    #[error("signature from {0} does not verify against the reconstructed sighash")]
    InvalidSignature(XOnlyPublicKey),
    #[error("only {found} of the {threshold} required signatures verified")]
    ThresholdNotMet { threshold: usize, found: usize },
    #[error("input {0} has no witness_utxo, cannot reconstruct a BIP-341 sighash")]
    MissingWitnessUtxo(usize),
    #[error("input carries no tap_script_sig entries to verify")]
    MissingTapScriptSig,
    #[error("signature's sighash type {0:?} is not in the allowed set")]
    UnallowedSighash(TapSighashType),
    #[error("no tap_script entry on the input matches the signature's leaf hash")]
    LeafHashMismatch,
    #[error("required signers did not all sign: missing {0:?}")]
    MissingSigners(Vec<XOnlyPublicKey>),
}

/// Verify that `control_block` correctly commits `leaf_script` into the taproot output key
/// found in `prevout`.
pub fn verify_commitment<C: Verification>(
    secp: &Secp256k1<C>,
    prevout: &TxOut,
    leaf_script: &ScriptBuf,
    control_block: &ControlBlock,
) -> Result<(), VerifyError> {
    let output_key = extract_output_key(prevout).ok_or(VerifyError::BadCommitment)?;

    if !control_block.verify_taproot_commitment(secp, output_key, leaf_script) {
        return Err(VerifyError::BadCommitment);
    }

    Ok(())
}

/// Verify a tapscript spend: that `control_block` commits `leaf_script` under the previous
/// output's key, and that `signatures` satisfy `leaf_script`'s multisig requirement over the
/// reconstructed sighash.
///
/// `signatures` must line up positionally with the public keys `leaf_script` names, in the order
/// a witness stack presents them (bottom to top becomes first to last here). A `None` entry marks
/// a cosigner slot for which no signature was provided, which is only valid under
/// [`MultisigType::ChecksigAdd`] once enough other slots are signed.
pub fn verify_tapscript_spend<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
    leaf_script: &ScriptBuf,
    control_block: &ControlBlock,
    sighash_type: TapSighashType,
    signatures: &[Option<schnorr::Signature>],
) -> Result<(), VerifyError> {
    let prevout = prevouts
        .get(input_index)
        .ok_or(VerifyError::BadCommitment)?;

    verify_commitment(secp, prevout, leaf_script, control_block)?;

    let leaf_hash = TapLeafHash::from_script(leaf_script, LeafVersion::TapScript);

    let prevouts = Prevouts::All(prevouts);
    let sighash = SighashCache::new(tx)
        .taproot_script_spend_signature_hash(input_index, &prevouts, leaf_hash, sighash_type)
        .map_err(|e| VerifyError::Sighash(e.to_string()))?;
    let msg = bitcoin::secp256k1::Message::from_digest(sighash.to_raw_hash().to_byte_array());

    let kind = decode_tapscript(leaf_script)?;

    let (pubkeys, multisig_kind, threshold) = match &kind {
        TapscriptKind::Multisig { pubkeys, kind } => (pubkeys, *kind, pubkeys.len()),
        TapscriptKind::CsvMultisig { pubkeys, .. } => {
            (pubkeys, MultisigType::Checksig, pubkeys.len())
        }
        TapscriptKind::CltvMultisig { pubkeys, .. } => {
            (pubkeys, MultisigType::Checksig, pubkeys.len())
        }
        TapscriptKind::ConditionMultisig { pubkeys, .. } => {
            (pubkeys, MultisigType::Checksig, pubkeys.len())
        }
        TapscriptKind::Hashlock160 { .. } => {
            // Hashlock leaves are spent by revealing a preimage, not a signature.
            return Ok(());
        }
    };

    if signatures.len() != pubkeys.len() {
        return Err(VerifyError::WrongSignatureCount {
            expected: pubkeys.len(),
            found: signatures.len(),
        });
    }

    let mut verified = 0;
    for (i, (pk, sig)) in pubkeys.iter().zip(signatures.iter()).enumerate() {
        match sig {
            Some(sig) => {
                verify_one(secp, *pk, sig, &msg)
                    .map_err(|_| VerifyError::InvalidSignature(pubkeys[i]))?;
                verified += 1;
            }
            None if matches!(multisig_kind, MultisigType::Checksig) => {
                return Err(VerifyError::InvalidSignature(pubkeys[i]));
            }
            None => {}
        }
    }

    if verified < threshold {
        return Err(VerifyError::ThresholdNotMet {
            threshold,
            found: verified,
        });
    }

    Ok(())
}

/// Verify that every `tap_script_sig` entry on `input` (keyed by `(pubkey, leaf_hash)` per
/// BIP-371) is a valid signature over the BIP-341 sighash for the tapscript leaf it names, and
/// that `required_signers` (minus `exclude_pubkeys`) all signed.
///
/// Implements the same check a counterparty-supplied forfeit PSBT needs before it is
/// countersigned and submitted: a flipped signature byte fails [`VerifyError::InvalidSignature`],
/// a disallowed trailing sighash byte fails [`VerifyError::UnallowedSighash`], and an absent
/// required cosigner fails [`VerifyError::MissingSigners`] instead of silently passing.
pub fn verify_tapscript_signatures<C: Verification>(
    secp: &Secp256k1<C>,
    tx: &Transaction,
    input_index: usize,
    prevouts: &[TxOut],
    input: &psbt::Input,
    required_signers: &[XOnlyPublicKey],
    exclude_pubkeys: &[XOnlyPublicKey],
    allowed_sighashes: &[TapSighashType],
) -> Result<(), VerifyError> {
    if input_index >= prevouts.len() {
        return Err(VerifyError::MissingWitnessUtxo(input_index));
    }

    if input.tap_script_sigs.is_empty() || input.tap_scripts.is_empty() {
        return Err(VerifyError::MissingTapScriptSig);
    }

    let prevouts = Prevouts::All(prevouts);
    let mut signed_pubkeys = Vec::new();

    for ((pubkey, leaf_hash), sig) in input.tap_script_sigs.iter() {
        if exclude_pubkeys.contains(pubkey) {
            continue;
        }

        if !allowed_sighashes.contains(&sig.sighash_type) {
            return Err(VerifyError::UnallowedSighash(sig.sighash_type));
        }

        let leaf_known = input
            .tap_scripts
            .values()
            .any(|(script, version)| TapLeafHash::from_script(script, *version) == *leaf_hash);
        if !leaf_known {
            return Err(VerifyError::LeafHashMismatch);
        }

        let sighash = SighashCache::new(tx)
            .taproot_script_spend_signature_hash(
                input_index,
                &prevouts,
                *leaf_hash,
                sig.sighash_type,
            )
            .map_err(|e| VerifyError::Sighash(e.to_string()))?;
        let msg = bitcoin::secp256k1::Message::from_digest(sighash.to_raw_hash().to_byte_array());

        verify_one(secp, *pubkey, &sig.signature, &msg)
            .map_err(|_| VerifyError::InvalidSignature(*pubkey))?;

        signed_pubkeys.push(*pubkey);
    }

    let missing: Vec<_> = required_signers
        .iter()
        .filter(|pk| !exclude_pubkeys.contains(pk) && !signed_pubkeys.contains(pk))
        .copied()
        .collect();

    if !missing.is_empty() {
        return Err(VerifyError::MissingSigners(missing));
    }

    Ok(())
}

fn verify_one<C: Verification>(
    secp: &Secp256k1<C>,
    pk: XOnlyPublicKey,
    sig: &schnorr::Signature,
    msg: &bitcoin::secp256k1::Message,
) -> Result<(), bitcoin::secp256k1::Error> {
    secp.verify_schnorr(sig, msg, &pk)
}

fn extract_output_key(prevout: &TxOut) -> Option<XOnlyPublicKey> {
    let bytes = prevout.script_pubkey.as_bytes();
    // `OP_1 <32-byte-key>`.
    if bytes.len() == 34 && bytes[0] == 0x51 && bytes[1] == 0x20 {
        return XOnlyPublicKey::from_slice(&bytes[2..]).ok();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use ark_script::script::multisig_script;
    use bitcoin::key::Keypair;
    use bitcoin::taproot::TaprootBuilder;

    #[test]
    fn verifies_two_of_two_checksig_leaf() {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();

        let kp_a = Keypair::new(&secp, &mut rng);
        let kp_b = Keypair::new(&secp, &mut rng);
        let (pk_a, _) = kp_a.x_only_public_key();
        let (pk_b, _) = kp_b.x_only_public_key();

        let leaf_script = multisig_script(&[pk_a, pk_b], MultisigType::Checksig, 2).unwrap();

        let unspendable = crate::UNSPENDABLE_KEY
            .parse::<bitcoin::PublicKey>()
            .unwrap()
            .inner
            .x_only_public_key()
            .0;

        let spend_info = TaprootBuilder::new()
            .add_leaf(0, leaf_script.clone())
            .unwrap()
            .finalize(&secp, unspendable)
            .unwrap();

        let control_block = spend_info
            .control_block(&(leaf_script.clone(), LeafVersion::TapScript))
            .unwrap();

        let prevout = TxOut {
            value: bitcoin::Amount::from_sat(1_000),
            script_pubkey: ark_script::script::tr_script_pubkey(&spend_info),
        };

        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::null(),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: bitcoin::Amount::from_sat(900),
                script_pubkey: ScriptBuf::new_op_return([]),
            }],
        };

        let prevouts = [prevout];
        let leaf_hash = bitcoin::TapLeafHash::from_script(&leaf_script, LeafVersion::TapScript);
        let binding = Prevouts::All(&prevouts);
        let sighash = SighashCache::new(&tx)
            .taproot_script_spend_signature_hash(0, &binding, leaf_hash, TapSighashType::Default)
            .unwrap();
        let msg = bitcoin::secp256k1::Message::from_digest(sighash.to_raw_hash().to_byte_array());

        let sig_a = secp.sign_schnorr(&msg, &kp_a);
        let sig_b = secp.sign_schnorr(&msg, &kp_b);

        verify_tapscript_spend(
            &secp,
            &tx,
            0,
            &prevouts,
            &leaf_script,
            &control_block,
            TapSighashType::Default,
            &[Some(sig_a), Some(sig_b)],
        )
        .unwrap();

        assert!(verify_tapscript_spend(
            &secp,
            &tx,
            0,
            &prevouts,
            &leaf_script,
            &control_block,
            TapSighashType::Default,
            &[Some(sig_a), None],
        )
        .is_err());
    }

    fn three_of_three_fixture() -> (
        Secp256k1<bitcoin::secp256k1::All>,
        [XOnlyPublicKey; 3],
        [Keypair; 3],
        Transaction,
        [TxOut; 1],
        ScriptBuf,
        LeafVersion,
        TapLeafHash,
        ControlBlock,
    ) {
        let secp = Secp256k1::new();
        let mut rng = rand::thread_rng();

        let kps = [
            Keypair::new(&secp, &mut rng),
            Keypair::new(&secp, &mut rng),
            Keypair::new(&secp, &mut rng),
        ];
        let pks = [
            kps[0].x_only_public_key().0,
            kps[1].x_only_public_key().0,
            kps[2].x_only_public_key().0,
        ];

        let leaf_script = multisig_script(&pks, MultisigType::Checksig, 3).unwrap();
        let leaf_version = LeafVersion::TapScript;

        let unspendable = crate::UNSPENDABLE_KEY
            .parse::<bitcoin::PublicKey>()
            .unwrap()
            .inner
            .x_only_public_key()
            .0;

        let spend_info = TaprootBuilder::new()
            .add_leaf(0, leaf_script.clone())
            .unwrap()
            .finalize(&secp, unspendable)
            .unwrap();

        let control_block = spend_info
            .control_block(&(leaf_script.clone(), leaf_version))
            .unwrap();

        let prevout = TxOut {
            value: bitcoin::Amount::from_sat(1_000),
            script_pubkey: ark_script::script::tr_script_pubkey(&spend_info),
        };

        let tx = Transaction {
            version: bitcoin::transaction::Version::TWO,
            lock_time: bitcoin::absolute::LockTime::ZERO,
            input: vec![bitcoin::TxIn {
                previous_output: bitcoin::OutPoint::null(),
                ..Default::default()
            }],
            output: vec![TxOut {
                value: bitcoin::Amount::from_sat(900),
                script_pubkey: ScriptBuf::new_op_return([]),
            }],
        };

        let leaf_hash = TapLeafHash::from_script(&leaf_script, leaf_version);

        (
            secp,
            pks,
            kps,
            tx,
            [prevout],
            leaf_script,
            leaf_version,
            leaf_hash,
            control_block,
        )
    }

    fn sign_all(
        secp: &Secp256k1<bitcoin::secp256k1::All>,
        tx: &Transaction,
        prevouts: &[TxOut; 1],
        kps: &[Keypair; 3],
        leaf_hash: TapLeafHash,
        sighash_type: TapSighashType,
    ) -> Vec<schnorr::Signature> {
        let sighash = SighashCache::new(tx)
            .taproot_script_spend_signature_hash(0, &Prevouts::All(prevouts), leaf_hash, sighash_type)
            .unwrap();
        let msg = bitcoin::secp256k1::Message::from_digest(sighash.to_raw_hash().to_byte_array());

        kps.iter().map(|kp| secp.sign_schnorr(&msg, kp)).collect()
    }

    fn psbt_input_with_sigs(
        leaf_script: &ScriptBuf,
        leaf_version: LeafVersion,
        control_block: ControlBlock,
        sigs: impl IntoIterator<Item = (XOnlyPublicKey, TapLeafHash, schnorr::Signature, TapSighashType)>,
    ) -> psbt::Input {
        let mut input = psbt::Input::default();
        input
            .tap_scripts
            .insert(control_block, (leaf_script.clone(), leaf_version));

        for (pk, leaf_hash, sig, sighash_type) in sigs {
            input.tap_script_sigs.insert(
                (pk, leaf_hash),
                bitcoin::taproot::Signature {
                    signature: sig,
                    sighash_type,
                },
            );
        }

        input
    }

    #[test]
    fn three_of_three_tapscript_signatures_pass_with_default_sighash() {
        let (secp, pks, kps, tx, prevouts, leaf_script, leaf_version, leaf_hash, control_block) =
            three_of_three_fixture();
        let sigs = sign_all(&secp, &tx, &prevouts, &kps, leaf_hash, TapSighashType::Default);

        let input = psbt_input_with_sigs(
            &leaf_script,
            leaf_version,
            control_block.clone(),
            pks.iter()
                .zip(sigs.iter())
                .map(|(pk, sig)| (*pk, leaf_hash, *sig, TapSighashType::Default)),
        );

        verify_tapscript_signatures(
            &secp,
            &tx,
            0,
            &prevouts,
            &input,
            &pks,
            &[],
            &[TapSighashType::Default],
        )
        .unwrap();
    }

    #[test]
    fn three_of_three_tapscript_signatures_missing_signer_fails() {
        let (secp, pks, kps, tx, prevouts, leaf_script, leaf_version, leaf_hash, control_block) =
            three_of_three_fixture();
        let sigs = sign_all(&secp, &tx, &prevouts, &kps, leaf_hash, TapSighashType::Default);

        let input = psbt_input_with_sigs(
            &leaf_script,
            leaf_version,
            control_block.clone(),
            pks.iter()
                .zip(sigs.iter())
                .take(2)
                .map(|(pk, sig)| (*pk, leaf_hash, *sig, TapSighashType::Default)),
        );

        let err = verify_tapscript_signatures(
            &secp,
            &tx,
            0,
            &prevouts,
            &input,
            &pks,
            &[],
            &[TapSighashType::Default],
        )
        .unwrap_err();

        assert!(matches!(err, VerifyError::MissingSigners(missing) if missing == [pks[2]]));
    }

    #[test]
    fn three_of_three_tapscript_signatures_flipped_byte_fails() {
        let (secp, pks, kps, tx, prevouts, leaf_script, leaf_version, leaf_hash, control_block) =
            three_of_three_fixture();
        let mut sigs = sign_all(&secp, &tx, &prevouts, &kps, leaf_hash, TapSighashType::Default);

        let mut bytes = sigs[0].serialize();
        bytes[0] ^= 0xff;
        sigs[0] = schnorr::Signature::from_slice(&bytes).unwrap();

        let input = psbt_input_with_sigs(
            &leaf_script,
            leaf_version,
            control_block.clone(),
            pks.iter()
                .zip(sigs.iter())
                .map(|(pk, sig)| (*pk, leaf_hash, *sig, TapSighashType::Default)),
        );

        let err = verify_tapscript_signatures(
            &secp,
            &tx,
            0,
            &prevouts,
            &input,
            &pks,
            &[],
            &[TapSighashType::Default],
        )
        .unwrap_err();

        assert!(matches!(err, VerifyError::InvalidSignature(pk) if pk == pks[0]));
    }

    #[test]
    fn three_of_three_tapscript_signatures_disallowed_sighash_fails() {
        let (secp, pks, kps, tx, prevouts, leaf_script, leaf_version, leaf_hash, control_block) =
            three_of_three_fixture();
        let sigs = sign_all(&secp, &tx, &prevouts, &kps, leaf_hash, TapSighashType::All);

        let input = psbt_input_with_sigs(
            &leaf_script,
            leaf_version,
            control_block.clone(),
            pks.iter()
                .zip(sigs.iter())
                .map(|(pk, sig)| (*pk, leaf_hash, *sig, TapSighashType::All)),
        );

        let err = verify_tapscript_signatures(
            &secp,
            &tx,
            0,
            &prevouts,
            &input,
            &pks,
            &[],
            &[TapSighashType::Default],
        )
        .unwrap_err();

        assert!(matches!(err, VerifyError::UnallowedSighash(TapSighashType::All)));
    }
}
