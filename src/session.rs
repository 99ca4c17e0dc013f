use crate::{
    error::FatalError,
    keys::{HashImage, PartyKeyPairs, Preimage},
    params::{AliceHalf, PublicParameters},
    Role, SessionId,
};
use bitcoin::{secp256k1::Signature, Transaction, Txid};
use serde::{Deserialize, Serialize};
use std::{
    fs,
    io::Write,
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
pub enum Outcome {
    Completed,
    BackedOut,
}

/// Everything a participant must survive a crash with: negotiated values,
/// secrets, exchanged signatures, txids and the state index. One instance
/// per swap, flushed to its session file before any irreversible action.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub role: Role,
    pub state_index: u32,
    /// Unix seconds of the last transition.
    pub updated_at: u64,
    pub version: u32,
    pub secret: Option<Preimage>,
    pub hash_image: Option<HashImage>,
    /// Swap amount and fee in satoshi, known before negotiation fixes them
    /// inside `params`.
    pub amount_sat: Option<u64>,
    pub coinswap_fee_sat: Option<u64>,
    pub keys: Option<PartyKeyPairs>,
    pub alice_half: Option<AliceHalf>,
    pub params: Option<PublicParameters>,
    /// Our own funding transaction, fully signed, for idempotent rebroadcast.
    #[serde(with = "crate::serde::transaction::option")]
    pub funding: Option<Transaction>,
    #[serde(with = "crate::serde::txid::option")]
    pub tx0_txid: Option<Txid>,
    #[serde(with = "crate::serde::txid::option")]
    pub tx1_txid: Option<Txid>,
    #[serde(with = "crate::serde::signature::option")]
    pub sig_TX2_alice: Option<Signature>,
    #[serde(with = "crate::serde::signature::option")]
    pub sig_TX2_carol: Option<Signature>,
    #[serde(with = "crate::serde::signature::option")]
    pub sig_TX3_alice: Option<Signature>,
    #[serde(with = "crate::serde::signature::option")]
    pub sig_TX3_carol: Option<Signature>,
    #[serde(with = "crate::serde::signature::option")]
    pub sig_TX4_alice: Option<Signature>,
    /// Alice's announced secret-branch claim of Carol's escrow, whitelisted
    /// by Carol's spend monitor.
    #[serde(with = "crate::serde::txid::option")]
    pub tx5_txid: Option<Txid>,
    /// The redeem we broadcast ourselves.
    #[serde(with = "crate::serde::txid::option")]
    pub redeem_txid: Option<Txid>,
    pub outcome: Option<Outcome>,
    pub backout_reason: Option<String>,
}

impl Session {
    pub fn new(id: SessionId, role: Role, version: u32) -> Self {
        Self {
            id,
            role,
            state_index: 0,
            updated_at: now(),
            version,
            secret: None,
            hash_image: None,
            amount_sat: None,
            coinswap_fee_sat: None,
            keys: None,
            alice_half: None,
            params: None,
            funding: None,
            tx0_txid: None,
            tx1_txid: None,
            sig_TX2_alice: None,
            sig_TX2_carol: None,
            sig_TX3_alice: None,
            sig_TX3_carol: None,
            sig_TX4_alice: None,
            tx5_txid: None,
            redeem_txid: None,
            outcome: None,
            backout_reason: None,
        }
    }

    /// The state index never moves backwards; a stale write is a programming
    /// error that must not reach the log.
    pub fn advance(&mut self, state_index: u32) {
        debug_assert!(state_index >= self.state_index);
        self.state_index = self.state_index.max(state_index);
        self.updated_at = now();
    }

    pub fn params(&self) -> &PublicParameters {
        self.params
            .as_ref()
            .expect("params are set before any state that reads them")
    }
}

fn now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// One file per session under the sessions directory. Files are written
/// whole and atomically renamed into place; nothing ever edits them.
#[derive(Clone, Debug)]
pub struct SessionStore {
    dir: PathBuf,
}

impl SessionStore {
    pub fn new(dir: impl AsRef<Path>) -> Result<Self, FatalError> {
        fs::create_dir_all(dir.as_ref())?;

        Ok(Self {
            dir: dir.as_ref().to_path_buf(),
        })
    }

    pub fn persist(&self, session: &Session) -> Result<(), FatalError> {
        let body = serde_json::to_vec_pretty(session)
            .map_err(|e| FatalError::Persistence(std::io::Error::new(std::io::ErrorKind::Other, e)))?;

        let target = self.path(&session.id);
        let tmp = target.with_extension("tmp");

        let mut file = fs::File::create(&tmp)?;
        file.write_all(&body)?;
        file.sync_all()?;
        fs::rename(&tmp, &target)?;

        Ok(())
    }

    pub fn load(&self, id: &SessionId) -> Result<Session, FatalError> {
        let body = fs::read(self.path(id))?;

        serde_json::from_slice(&body)
            .map_err(|e| FatalError::Persistence(std::io::Error::new(std::io::ErrorKind::InvalidData, e)))
    }

    pub fn load_all(&self) -> Result<Vec<Session>, FatalError> {
        let mut sessions = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }

            let body = fs::read(&path)?;
            if let Ok(session) = serde_json::from_slice(&body) {
                sessions.push(session);
            }
        }

        Ok(sessions)
    }

    fn path(&self, id: &SessionId) -> PathBuf {
        self.dir.join(format!("{}.json", id))
    }
}
