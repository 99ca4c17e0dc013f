use crate::{
    carol::Carol,
    config::Config,
    error::{Error, ProtocolError},
    hooks::{Honest, Hooks},
    rpc::{Envelope, ReplyEnvelope, Request, Response, StatusInfo},
    session::SessionStore,
    traits::{
        BalanceByMixdepth, BlockHeight, BroadcastTransaction, EstimateFee,
        GetSpendingTransaction, GetTransaction, NewAddress, SelectUtxos, SignInput,
    },
    SessionId, PROTOCOL_VERSION,
};
use std::collections::HashMap;

/// The coinswap server: owns the wallet and chain handles and hosts one
/// `Carol` per live session, keyed by session id. All requests are handled
/// serially on the caller's loop; sessions never see each other.
#[derive(Debug)]
pub struct Server<W, C, H = Honest> {
    wallet: W,
    chain: C,
    config: Config,
    store: SessionStore,
    hooks: H,
    sessions: HashMap<SessionId, Carol<H>>,
}

impl<W, C> Server<W, C, Honest> {
    pub fn new(wallet: W, chain: C, config: Config, store: SessionStore) -> Self {
        Self {
            wallet,
            chain,
            config,
            store,
            hooks: Honest,
            sessions: HashMap::new(),
        }
    }
}

impl<W, C, H> Server<W, C, H>
where
    W: NewAddress + SelectUtxos + SignInput + BalanceByMixdepth,
    C: BlockHeight + GetTransaction + BroadcastTransaction + EstimateFee + GetSpendingTransaction,
    H: Hooks + Clone,
{
    pub fn with_hooks(wallet: W, chain: C, config: Config, store: SessionStore, hooks: H) -> Self {
        Self {
            wallet,
            chain,
            config,
            store,
            hooks,
            sessions: HashMap::new(),
        }
    }

    pub fn session(&self, id: &SessionId) -> Option<&Carol<H>> {
        self.sessions.get(id)
    }

    /// Handle one request. Protocol failures never escape as errors: the
    /// wire answer for all of them is `false`, with the reason logged
    /// against the session.
    pub async fn handle(&mut self, request: Request) -> Response {
        let session_id = request.session_id().cloned();

        match self.dispatch(request).await {
            Ok(response) => response,
            Err(error) => {
                tracing::warn!(
                    session_id = %session_id.map(|id| id.to_string()).unwrap_or_default(),
                    %error,
                    "request refused"
                );
                Response::refused()
            }
        }
    }

    /// JSON-RPC entry point: one request envelope in, one reply envelope
    /// out.
    pub async fn handle_json(&mut self, body: &str) -> String {
        let envelope: Envelope = match serde_json::from_str(body) {
            Ok(envelope) => envelope,
            Err(error) => {
                tracing::warn!(%error, "unparseable request");
                return serde_json::to_string(&ReplyEnvelope::new(0, Response::refused()))
                    .expect("refusal always serializes");
            }
        };

        let response = self.handle(envelope.request).await;

        serde_json::to_string(&ReplyEnvelope::new(envelope.id, response))
            .expect("responses always serialize")
    }

    /// Drive every live session's chain work one tick. The host calls this
    /// on the poll cadence.
    pub async fn poll(&mut self) {
        for carol in self.sessions.values_mut() {
            if let Err(error) = carol.poll(&self.wallet, &self.chain).await {
                tracing::error!(session_id = %carol.session_id(), %error, "session poll failed");
            }
        }
    }

    async fn dispatch(&mut self, request: Request) -> Result<Response, Error> {
        match request {
            Request::Status => Ok(Response::Status(self.status().await)),
            Request::Handshake(handshake) => {
                if let Some(existing) = self.sessions.get(&handshake.session_id) {
                    // A resent handshake for a session we already opened gets
                    // the original answer; a conflicting one gets refused.
                    return existing
                        .replay_handshake(&handshake)
                        .map(Response::Handshake)
                        .ok_or_else(|| {
                            ProtocolError::Malformed("session id already in use".into()).into()
                        });
                }

                let status = self.status().await;
                if status.busy {
                    tracing::info!("refusing handshake, server busy");
                    return Ok(Response::refused());
                }

                let (carol, ack) = Carol::new(
                    self.config.clone(),
                    self.store.clone(),
                    &handshake,
                    self.hooks.clone(),
                )?;
                self.sessions.insert(handshake.session_id.clone(), carol);

                Ok(Response::Handshake(ack))
            }
            Request::Negotiate { session_id, half } => {
                let chain = &self.chain;
                let carol = Self::session_mut(&mut self.sessions, &session_id)?;

                carol.negotiate(chain, half).await.map(Response::Negotiate)
            }
            Request::Tx0idHxTx2Sig {
                session_id,
                tx0_txid,
                hash_image,
                sig_TX2_alice,
            } => {
                let wallet = &self.wallet;
                let chain = &self.chain;
                let carol = Self::session_mut(&mut self.sessions, &session_id)?;

                carol
                    .on_funding(wallet, chain, tx0_txid, hash_image, sig_TX2_alice)
                    .await
                    .map(|(tx1_txid, sig_TX3_carol)| Response::Funding {
                        tx1_txid,
                        sig_TX3_carol,
                    })
            }
            Request::SigTx3 {
                session_id,
                sig_TX3_alice,
            } => {
                let carol = Self::session_mut(&mut self.sessions, &session_id)?;

                carol.on_sigtx3(sig_TX3_alice).map(|_| Response::Ack(true))
            }
            Request::Phase2Ready { session_id } => {
                let chain = &self.chain;
                let carol = Self::session_mut(&mut self.sessions, &session_id)?;

                carol.phase2_ready(chain).await.map(Response::Ack)
            }
            Request::Secret { session_id, secret } => {
                let chain = &self.chain;
                let carol = Self::session_mut(&mut self.sessions, &session_id)?;

                carol
                    .on_secret(chain, secret)
                    .await
                    .map(|sig_TX2_carol| Response::Secret { sig_TX2_carol })
            }
            Request::SigTx4 {
                session_id,
                sig_TX4_alice,
                tx5_txid,
            } => {
                let carol = Self::session_mut(&mut self.sessions, &session_id)?;

                carol
                    .on_sigtx4(sig_TX4_alice, tx5_txid)
                    .map(|_| Response::Ack(true))
            }
            Request::ConfirmTx4 { session_id } => {
                let chain = &self.chain;
                let carol = Self::session_mut(&mut self.sessions, &session_id)?;

                carol.confirm_tx4(chain).await.map(Response::Ack)
            }
        }
    }

    /// Status is pollable at any time: capacity and wallet funding decide
    /// whether we advertise ourselves as serviceable, and the advertised
    /// maximum is clamped to what the wallet can actually lock up.
    pub async fn status(&self) -> StatusInfo {
        let live = self.sessions.values().filter(|c| c.is_live()).count();
        let mut busy = live >= self.config.maximum_concurrent_coinswaps;

        let available = self
            .wallet
            .balance_by_mixdepth()
            .await
            .ok()
            .and_then(|balances| balances.get(0).copied())
            .unwrap_or_else(|| bitcoin::Amount::from_sat(0));

        let maximum_amount = if available < self.config.minimum_amount {
            busy = true;
            -1
        } else if available < self.config.maximum_amount {
            #[allow(clippy::cast_possible_wrap)]
            {
                available.as_sat() as i64
            }
        } else {
            #[allow(clippy::cast_possible_wrap)]
            {
                self.config.maximum_amount.as_sat() as i64
            }
        };

        StatusInfo {
            busy,
            minimum_amount: self.config.minimum_amount,
            maximum_amount,
            source_chain: self.config.source_chain.clone(),
            destination_chain: self.config.destination_chain.clone(),
            cscs_version: PROTOCOL_VERSION,
        }
    }

    fn session_mut<'s>(
        sessions: &'s mut HashMap<SessionId, Carol<H>>,
        session_id: &SessionId,
    ) -> Result<&'s mut Carol<H>, Error> {
        sessions
            .get_mut(session_id)
            .ok_or_else(|| ProtocolError::Malformed(format!("unknown session {}", session_id)).into())
    }
}
