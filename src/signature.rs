use crate::keys::SECP;
use bitcoin::{
    hashes::Hash,
    secp256k1::{Message, PublicKey, Signature},
    SigHash,
};

#[derive(Debug, thiserror::Error)]
#[error("signature is invalid")]
pub struct InvalidSignature;

pub fn verify_sig(
    verification_key: PublicKey,
    transaction_sighash: &SigHash,
    signature: &Signature,
) -> Result<(), InvalidSignature> {
    let message =
        Message::from_slice(&transaction_sighash.into_inner()).expect("digest is 32 bytes");

    SECP.verify(&message, signature, &verification_key)
        .map_err(|_| InvalidSignature)
}
