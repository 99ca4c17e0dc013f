use crate::{
    keys::{
        BackoutKeyPair, BackoutPublicKey, FundingKeyPair, FundingPublicKey, HashImage, Preimage,
    },
    signature::{verify_sig, InvalidSignature},
    traits::{SignInput, Utxo},
    DUST_THRESHOLD,
};
use bitcoin::{
    blockdata::{opcodes, script::Builder},
    secp256k1::Signature,
    util::bip143::SighashComponents,
    Address, Amount, Network, OutPoint, Script, SigHash, Transaction, TxIn, TxOut, Txid,
};
use serde::{Deserialize, Serialize};

/// Sequence signalling replaceability; used on every escrow spend without a
/// lock time so a stuck redeem can be fee-bumped.
const SEQUENCE_RBF: u32 = 0xFFFF_FFFD;
/// Non-final sequence required for OP_CHECKLOCKTIMEVERIFY to pass.
const SEQUENCE_LOCKTIME: u32 = 0xFFFF_FFFE;

/// Rough witness-inclusive sizes of the escrow spends, used for fee
/// estimation before the witness exists.
pub const COOP_SPEND_VBYTES: usize = 185;
pub const SECRET_SPEND_VBYTES: usize = 160;
pub const TIMEOUT_SPEND_VBYTES: usize = 150;

/// Per-input / per-output vbyte figures for a P2WPKH-funded transaction.
pub fn funding_vbytes(inputs: usize, outputs: usize) -> usize {
    11 + 68 * inputs + 43 * outputs
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("selected inputs ({available}) do not cover {required}")]
    InsufficientFunds {
        available: Amount,
        required: Amount,
    },
    #[error("output after fee would be dust")]
    OutputBelowDust,
    #[error("input is not P2WPKH")]
    NotSegwitInput,
}

/// One escrow output: who funds it, who can claim it with the secret, and
/// when the funder can take it back.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub struct Escrow {
    pub fund_funder: FundingPublicKey,
    pub fund_other: FundingPublicKey,
    /// Counterparty key for the secret branch.
    pub claim: BackoutPublicKey,
    /// Funder key for the timeout branch.
    pub refund: BackoutPublicKey,
    pub hash_image: HashImage,
    pub timeout: u32,
}

impl Escrow {
    /// The witness script. Purely a function of its inputs: the same escrow
    /// always yields the same bytes.
    ///
    /// Spending requires either the preimage (with both funding keys, or
    /// with the counterparty's claim key alone) or the funder's refund key
    /// once the chain passes `timeout`.
    pub fn script(&self) -> Script {
        Builder::new()
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_IF)
            .push_opcode(opcodes::all::OP_PUSHNUM_2)
            .push_key(&wrap(self.fund_funder.into()))
            .push_key(&wrap(self.fund_other.into()))
            .push_opcode(opcodes::all::OP_PUSHNUM_2)
            .push_opcode(opcodes::all::OP_CHECKMULTISIGVERIFY)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_key(&wrap(self.claim.into()))
            .push_opcode(opcodes::all::OP_CHECKSIGVERIFY)
            .push_opcode(opcodes::all::OP_ENDIF)
            .push_opcode(opcodes::all::OP_SIZE)
            .push_int(Preimage::LEN as i64)
            .push_opcode(opcodes::all::OP_EQUALVERIFY)
            .push_opcode(opcodes::all::OP_SHA256)
            .push_slice(self.hash_image.as_bytes())
            .push_opcode(opcodes::all::OP_EQUAL)
            .push_opcode(opcodes::all::OP_ELSE)
            .push_int(i64::from(self.timeout))
            // OP_CHECKLOCKTIMEVERIFY
            .push_opcode(opcodes::OP_NOP2)
            .push_opcode(opcodes::all::OP_DROP)
            .push_key(&wrap(self.refund.into()))
            .push_opcode(opcodes::all::OP_CHECKSIG)
            .push_opcode(opcodes::all::OP_ENDIF)
            .into_script()
    }

    pub fn address(&self, network: Network) -> Address {
        Address::p2wsh(&self.script(), network)
    }

    /// The P2WSH program is independent of the network.
    pub fn script_pubkey(&self) -> Script {
        Address::p2wsh(&self.script(), Network::Bitcoin).script_pubkey()
    }
}

/// TX0 / TX1: funds an escrow from wallet outputs. Output 0 is always the
/// escrow; output 1 is change, omitted when it would be dust.
#[derive(Clone, Debug)]
pub struct FundingTransaction {
    inner: Transaction,
    escrow_value: Amount,
    utxos: Vec<Utxo>,
}

impl FundingTransaction {
    pub fn new(
        utxos: Vec<Utxo>,
        escrow: &Escrow,
        escrow_value: Amount,
        change_address: &Address,
        fee: Amount,
    ) -> Result<Self, BuildError> {
        let available: Amount = utxos
            .iter()
            .fold(Amount::from_sat(0), |acc, utxo| acc + utxo.value);
        let required = escrow_value + fee;

        if available < required {
            return Err(BuildError::InsufficientFunds {
                available,
                required,
            });
        }

        let input = utxos
            .iter()
            .map(|utxo| TxIn {
                previous_output: utxo.outpoint,
                script_sig: Script::new(),
                sequence: SEQUENCE_RBF,
                witness: Vec::new(),
            })
            .collect();

        let mut output = vec![TxOut {
            value: escrow_value.as_sat(),
            script_pubkey: escrow.script_pubkey(),
        }];

        let change = available - required;
        if change.as_sat() > DUST_THRESHOLD {
            output.push(TxOut {
                value: change.as_sat(),
                script_pubkey: change_address.script_pubkey(),
            });
        }

        Ok(Self {
            inner: Transaction {
                version: 2,
                lock_time: 0,
                input,
                output,
            },
            escrow_value,
            utxos,
        })
    }

    /// Fill in the P2WPKH witnesses through the wallet. Input order matches
    /// the order of the selected outputs.
    pub async fn sign_inputs<W: SignInput>(&mut self, wallet: &W) -> anyhow::Result<()> {
        for (index, utxo) in self.utxos.iter().enumerate() {
            let script_code = p2wpkh_script_code(&utxo.script_pubkey)?;
            let digest = SighashComponents::new(&self.inner).sighash_all(
                &self.inner.input[index],
                &script_code,
                utxo.value.as_sat(),
            );

            let (public_key, signature) = wallet.sign_input(utxo, digest).await?;

            self.inner.input[index].witness = vec![
                encode_sig(&signature),
                public_key.serialize().to_vec(),
            ];
        }

        Ok(())
    }

    pub fn txid(&self) -> Txid {
        self.inner.txid()
    }

    pub fn escrow_outpoint(&self) -> OutPoint {
        OutPoint::new(self.inner.txid(), 0)
    }

    pub fn escrow_value(&self) -> Amount {
        self.escrow_value
    }

    pub fn transaction(&self) -> &Transaction {
        &self.inner
    }
}

impl From<FundingTransaction> for Transaction {
    fn from(from: FundingTransaction) -> Self {
        from.inner
    }
}

/// Checks that `transaction` funds `escrow` with exactly `value` at output 0.
/// Run against a counterparty-announced txid before anything is signed on
/// top of it.
pub fn check_funding(transaction: &Transaction, escrow: &Escrow, value: Amount) -> bool {
    transaction
        .output
        .get(0)
        .map(|output| {
            output.script_pubkey == escrow.script_pubkey() && output.value == value.as_sat()
        })
        .unwrap_or(false)
}

/// A single-input, single-output spend of an escrow. The same body backs the
/// cooperative redeems, the secret-branch claims and the timeout refunds;
/// the witness decides the branch.
#[derive(Clone, Debug)]
pub struct SpendTransaction {
    inner: Transaction,
    digest: SigHash,
    escrow: Escrow,
}

impl SpendTransaction {
    pub fn new(
        escrow: &Escrow,
        escrow_outpoint: OutPoint,
        escrow_value: Amount,
        destination: &Address,
        fee: Amount,
        lock_time: u32,
    ) -> Result<Self, BuildError> {
        let value = escrow_value
            .checked_sub(fee)
            .ok_or(BuildError::OutputBelowDust)?;
        if value.as_sat() <= crate::BITCOIN_DUST_THRESHOLD {
            return Err(BuildError::OutputBelowDust);
        }

        let sequence = if lock_time == 0 {
            SEQUENCE_RBF
        } else {
            SEQUENCE_LOCKTIME
        };

        let input = TxIn {
            previous_output: escrow_outpoint,
            script_sig: Script::new(),
            sequence,
            witness: Vec::new(),
        };

        let inner = Transaction {
            version: 2,
            lock_time,
            input: vec![input.clone()],
            output: vec![TxOut {
                value: value.as_sat(),
                script_pubkey: destination.script_pubkey(),
            }],
        };

        let digest = SighashComponents::new(&inner).sighash_all(
            &input,
            &escrow.script(),
            escrow_value.as_sat(),
        );

        Ok(Self {
            inner,
            digest,
            escrow: *escrow,
        })
    }

    pub fn digest(&self) -> SigHash {
        self.digest
    }

    pub fn txid(&self) -> Txid {
        self.inner.txid()
    }

    pub fn value(&self) -> Amount {
        Amount::from_sat(self.inner.output[0].value)
    }

    pub fn sign_cooperative(&self, key: &FundingKeyPair) -> Signature {
        key.sign(self.digest)
    }

    pub fn sign_backout(&self, key: &BackoutKeyPair) -> Signature {
        key.sign(self.digest)
    }

    pub fn verify_cooperative_sig(
        &self,
        key: FundingPublicKey,
        signature: &Signature,
    ) -> Result<(), InvalidSignature> {
        verify_sig(key.into(), &self.digest, signature)
    }

    /// Cooperative branch: both funding-key signatures plus the preimage.
    /// Signature order must match the key order of the script.
    pub fn add_cooperative_witness(
        self,
        sig_funder: &Signature,
        sig_other: &Signature,
        preimage: &Preimage,
    ) -> Transaction {
        let mut inner = self.inner;
        inner.input[0].witness = vec![
            preimage.as_bytes().to_vec(),
            // CHECKMULTISIG consumes one extra stack item
            Vec::new(),
            encode_sig(sig_funder),
            encode_sig(sig_other),
            vec![0x01],
            vec![0x01],
            self.escrow.script().to_bytes(),
        ];

        inner
    }

    /// Secret branch: the counterparty claims with its backout key and the
    /// revealed preimage.
    pub fn add_secret_witness(self, sig_claim: &Signature, preimage: &Preimage) -> Transaction {
        let mut inner = self.inner;
        inner.input[0].witness = vec![
            preimage.as_bytes().to_vec(),
            encode_sig(sig_claim),
            Vec::new(),
            vec![0x01],
            self.escrow.script().to_bytes(),
        ];

        inner
    }

    /// Timeout branch. The transaction was built with `lock_time` at or past
    /// the escrow timeout and a non-final sequence, which is what makes the
    /// lock-time check pass.
    pub fn add_timeout_witness(self, sig_refund: &Signature) -> Transaction {
        let mut inner = self.inner;
        inner.input[0].witness = vec![
            encode_sig(sig_refund),
            Vec::new(),
            self.escrow.script().to_bytes(),
        ];

        inner
    }
}

/// Scans a transaction's witnesses for a preimage of `hash_image`. This is
/// how a counterparty's secret-branch spend leaks the secret back to us.
pub fn extract_preimage(transaction: &Transaction, hash_image: &HashImage) -> Option<Preimage> {
    transaction
        .input
        .iter()
        .flat_map(|input| input.witness.iter())
        .filter_map(|item| Preimage::from_slice(item))
        .find(|candidate| candidate.hash() == *hash_image)
}

fn encode_sig(signature: &Signature) -> Vec<u8> {
    let mut bytes = signature.serialize_der().as_ref().to_vec();
    bytes.push(bitcoin::SigHashType::All.as_u32() as u8);

    bytes
}

fn wrap(key: bitcoin::secp256k1::PublicKey) -> bitcoin::PublicKey {
    bitcoin::PublicKey {
        compressed: true,
        key,
    }
}

fn p2wpkh_script_code(script_pubkey: &Script) -> Result<Script, BuildError> {
    let bytes = script_pubkey.as_bytes();
    if bytes.len() != 22 || bytes[0] != 0x00 || bytes[1] != 0x14 {
        return Err(BuildError::NotSegwitInput);
    }

    Ok(Builder::new()
        .push_opcode(opcodes::all::OP_DUP)
        .push_opcode(opcodes::all::OP_HASH160)
        .push_slice(&bytes[2..22])
        .push_opcode(opcodes::all::OP_EQUALVERIFY)
        .push_opcode(opcodes::all::OP_CHECKSIG)
        .into_script())
}
