//! Behavior hooks: every outbound transition passes its payload through a
//! hook before it goes on the wire. The default implementation changes
//! nothing; tests exercising dishonest participants override exactly the
//! hook they want to corrupt instead of reimplementing a whole party.

use crate::{
    keys::{HashImage, Preimage},
    params::{AliceHalf, CarolHalf},
    rpc::{Handshake, HandshakeAck},
};
use bitcoin::{secp256k1::Signature, Txid};

pub trait Hooks {
    // Alice's outbound transitions.
    fn handshake(&self, _message: &mut Handshake) {}
    fn alice_half(&self, _half: &mut AliceHalf) {}
    fn funding_announcement(
        &self,
        _tx0_txid: &mut Txid,
        _hash_image: &mut HashImage,
        _sig_TX2: &mut Signature,
    ) {
    }
    fn tx3_counter_signature(&self, _sig_TX3: &mut Signature) {}
    fn secret(&self, _secret: &mut Preimage) {}

    // Carol's outbound transitions.
    fn handshake_ack(&self, _ack: &mut HandshakeAck) {}
    fn carol_half(&self, _half: &mut CarolHalf) {}
    fn funding_reply(&self, _tx1_txid: &mut Txid, _sig_TX3: &mut Signature) {}
    fn secret_reply(&self, _sig_TX2: &mut Signature) {}
}

/// Follows the protocol to the letter.
#[derive(Clone, Copy, Debug, Default)]
pub struct Honest;

impl Hooks for Honest {}
