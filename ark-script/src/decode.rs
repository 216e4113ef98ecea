//! Tapscript leaf decoding: given a raw leaf script, recover the typed
//! [`TapscriptKind`] it was built from. The decoder is a pattern-matcher over the canonical
//! output of [`crate::script`]'s builders; ambiguous or unrecognized scripts are rejected rather
//! than guessed at.

use crate::error::ScriptError;
use crate::script;
use bitcoin::absolute::LockTime as AbsoluteLockTime;
use bitcoin::opcodes::all::*;
use bitcoin::relative::LockTime as RelativeLockTime;
use bitcoin::ScriptBuf;
use bitcoin::XOnlyPublicKey;

/// The unit a timelock value is expressed in, disambiguated the same way the underlying opcode
/// family (`OP_CSV` vs `OP_CLTV`) disambiguates it: BIP-112 for relative, BIP-65 for absolute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimelockUnit {
    Blocks,
    Seconds,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timelock {
    pub value: u64,
    pub unit: TimelockUnit,
}

/// A decoded tapscript leaf, tagged by which construction produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TapscriptKind {
    Multisig {
        pubkeys: Vec<XOnlyPublicKey>,
        kind: script::MultisigType,
    },
    CsvMultisig {
        timelock: Timelock,
        pubkeys: Vec<XOnlyPublicKey>,
    },
    CltvMultisig {
        absolute_timelock: Timelock,
        pubkeys: Vec<XOnlyPublicKey>,
    },
    ConditionMultisig {
        condition: ScriptBuf,
        pubkeys: Vec<XOnlyPublicKey>,
    },
    Hashlock160 {
        hash: Vec<u8>,
        inner: Box<TapscriptKind>,
    },
}

/// Decodes a raw leaf script into its [`TapscriptKind`].
pub fn decode_tapscript(script: &ScriptBuf) -> Result<TapscriptKind, ScriptError> {
    let bytes = script.to_bytes();

    // OP_HASH160 <20-byte> OP_EQUALVERIFY <rest>  or  OP_SHA256 <N-byte> OP_EQUALVERIFY <rest>
    if let Some(kind) = decode_hashlock(&bytes)? {
        return Ok(kind);
    }

    // <value> OP_CSV OP_DROP <multisig>
    if bytes
        .windows(2)
        .any(|w| w == [OP_CSV.to_u8(), OP_DROP.to_u8()])
    {
        let sequence = script::extract_sequence_from_csv_sig_script(script)
            .map_err(ScriptError::other)?;
        let pubkeys = script::extract_checksig_pubkeys(script);
        if pubkeys.is_empty() {
            return Err(ScriptError::UnrecognizedScript);
        }

        let (value, unit) = match sequence.to_relative_lock_time() {
            Some(RelativeLockTime::Blocks(height)) => (height.value() as u64, TimelockUnit::Blocks),
            Some(RelativeLockTime::Time(time)) => {
                (time.value() as u64 * 512, TimelockUnit::Seconds)
            }
            None => return Err(ScriptError::other("non-canonical relative locktime")),
        };

        return Ok(TapscriptKind::CsvMultisig {
            timelock: Timelock { value, unit },
            pubkeys,
        });
    }

    // <value> OP_CLTV OP_DROP <multisig>
    if bytes
        .windows(2)
        .any(|w| w == [OP_CLTV.to_u8(), OP_DROP.to_u8()])
    {
        let locktime = script::extract_locktime_from_cltv_sig_script(script)
            .map_err(ScriptError::other)?;
        let pubkeys = script::extract_checksig_pubkeys(script);
        if pubkeys.is_empty() {
            return Err(ScriptError::UnrecognizedScript);
        }

        let (value, unit) = match locktime {
            AbsoluteLockTime::Blocks(height) => (height.to_consensus_u32() as u64, TimelockUnit::Blocks),
            AbsoluteLockTime::Seconds(time) => {
                (time.to_consensus_u32() as u64, TimelockUnit::Seconds)
            }
        };

        return Ok(TapscriptKind::CltvMultisig {
            absolute_timelock: Timelock { value, unit },
            pubkeys,
        });
    }

    // Plain multisig: decide Checksig vs ChecksigAdd by whether a trailing OP_NUMEQUAL is present.
    let pubkeys = script::extract_checksig_pubkeys(script);
    if pubkeys.is_empty() {
        return Err(ScriptError::UnrecognizedScript);
    }

    let kind = if bytes.last() == Some(&OP_NUMEQUAL.to_u8()) {
        script::MultisigType::ChecksigAdd
    } else {
        script::MultisigType::Checksig
    };

    Ok(TapscriptKind::Multisig { pubkeys, kind })
}

/// Matches `OP_HASH160 <20> OP_EQUALVERIFY <rest>` or `OP_SHA256 <32> OP_EQUALVERIFY <rest>` at
/// the start of the script. When `rest` is empty the leaf is a bare reveal (no further spending
/// condition, e.g. an Arknote); otherwise `rest` is decoded recursively, or treated as an opaque
/// `ConditionMultisig` condition prefix when it does not itself decode as a known kind.
fn decode_hashlock(bytes: &[u8]) -> Result<Option<TapscriptKind>, ScriptError> {
    let hash_len = if bytes.first() == Some(&OP_HASH160.to_u8()) {
        20usize
    } else if bytes.first() == Some(&OP_SHA256.to_u8()) {
        32usize
    } else {
        return Ok(None);
    };

    // `OP_<hash op>` (1) + pushdata opcode (1) + hash bytes + `OP_EQUAL(VERIFY)` (1).
    let header_len = 2 + hash_len;
    if bytes.len() < header_len + 1 {
        return Ok(None);
    }

    let hash = bytes[2..header_len].to_vec();
    let terminator = bytes[header_len];

    if terminator == OP_EQUAL.to_u8() && bytes.len() == header_len + 1 {
        // Bare reveal: anyone with the preimage may spend. Modeled as a `Hashlock160` wrapping an
        // empty condition multisig (no signers required beyond the preimage).
        return Ok(Some(TapscriptKind::Hashlock160 {
            hash,
            inner: Box::new(TapscriptKind::ConditionMultisig {
                condition: ScriptBuf::new(),
                pubkeys: vec![],
            }),
        }));
    }

    if terminator != OP_EQUALVERIFY.to_u8() {
        return Ok(None);
    }

    let rest = ScriptBuf::from_bytes(bytes[header_len + 1..].to_vec());
    if rest.is_empty() {
        return Ok(None);
    }

    let inner = match decode_tapscript(&rest) {
        Ok(kind) => kind,
        Err(_) => {
            let pubkeys = script::extract_checksig_pubkeys(&rest);
            TapscriptKind::ConditionMultisig {
                condition: rest,
                pubkeys,
            }
        }
    };

    Ok(Some(TapscriptKind::Hashlock160 {
        hash,
        inner: Box::new(inner),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::hashes::Hash;
    use std::str::FromStr;

    fn pk(hex: &str) -> XOnlyPublicKey {
        XOnlyPublicKey::from_str(hex).unwrap()
    }

    #[test]
    fn decodes_checksig_multisig() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let pk1 = pk("28845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let script = script::multisig_script(&[pk0, pk1], script::MultisigType::Checksig, 2)
            .unwrap();

        let decoded = decode_tapscript(&script).unwrap();
        assert_eq!(
            decoded,
            TapscriptKind::Multisig {
                pubkeys: vec![pk0, pk1],
                kind: script::MultisigType::Checksig,
            }
        );
    }

    #[test]
    fn decodes_checksigadd_multisig() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let pk1 = pk("28845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let pk2 = pk("38845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let script =
            script::multisig_script(&[pk0, pk1, pk2], script::MultisigType::ChecksigAdd, 2)
                .unwrap();

        let decoded = decode_tapscript(&script).unwrap();
        assert_eq!(
            decoded,
            TapscriptKind::Multisig {
                pubkeys: vec![pk0, pk1, pk2],
                kind: script::MultisigType::ChecksigAdd,
            }
        );
    }

    #[test]
    fn decodes_csv_multisig_seconds() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let sequence = bitcoin::Sequence::from_seconds_ceil(1024).unwrap();
        let script = script::csv_sig_script(sequence, &[pk0]).unwrap();

        let decoded = decode_tapscript(&script).unwrap();
        assert_eq!(
            decoded,
            TapscriptKind::CsvMultisig {
                timelock: Timelock {
                    value: 1024,
                    unit: TimelockUnit::Seconds,
                },
                pubkeys: vec![pk0],
            }
        );
    }

    #[test]
    fn decodes_cltv_multisig_blocks() {
        let pk0 = pk("18845781f631c48f1c9709e23092067d06837f30aa0cd0544ac887fe91ddd166");
        let locktime = bitcoin::absolute::LockTime::from_consensus(700_000);
        let script = script::cltv_sig_script(locktime, &[pk0]).unwrap();

        let decoded = decode_tapscript(&script).unwrap();
        assert_eq!(
            decoded,
            TapscriptKind::CltvMultisig {
                absolute_timelock: Timelock {
                    value: 700_000,
                    unit: TimelockUnit::Blocks,
                },
                pubkeys: vec![pk0],
            }
        );
    }

    #[test]
    fn decodes_bare_hashlock() {
        let hash = bitcoin::hashes::sha256::Hash::hash(&[1u8; 32]);
        let script = bitcoin::blockdata::script::Builder::new()
            .push_opcode(OP_SHA256)
            .push_slice(hash.to_byte_array())
            .push_opcode(OP_EQUAL)
            .into_script();

        let decoded = decode_tapscript(&script).unwrap();
        match decoded {
            TapscriptKind::Hashlock160 { hash: h, .. } => {
                assert_eq!(h, hash.to_byte_array().to_vec())
            }
            other => panic!("unexpected decode: {other:?}"),
        }
    }

    #[test]
    fn rejects_empty_script() {
        let script = ScriptBuf::new();
        assert!(decode_tapscript(&script).is_err());
    }
}
