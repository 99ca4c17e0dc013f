mod harness;

use bitcoin::{Amount, OutPoint};
use futures::future::{AbortHandle, Abortable};
use harness::{FailOn, MockChain, MockWallet, SharedServer, StallSpend, Transport};
use njord::{
    Alice, Config, Handshake, Honest, Hooks, Method, Preimage, Request, Response, Server,
    SessionId, SessionStore, SwapOutcome, PROTOCOL_VERSION,
};
use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

fn amount() -> Amount {
    Amount::from_sat(10_000_000)
}

fn swap_fee() -> Amount {
    Amount::from_sat(50_000)
}

// Carol's terminal state index.
const CAROL_DONE: u32 = 5;

struct TestNet {
    chain: MockChain,
    alice_wallet: MockWallet,
    carol_wallet: MockWallet,
    server: SharedServer,
    alice_store: SessionStore,
    config: Config,
    _alice_dir: tempfile::TempDir,
    _carol_dir: tempfile::TempDir,
}

fn config(sessions_dir: &Path) -> Config {
    let mut config = Config::regtest(sessions_dir.to_path_buf());
    config.poll_interval = Duration::from_millis(25);
    config.default_server_timeout = Duration::from_secs(2);
    config.minimum_coinswap_fee = Amount::from_sat(10_000);
    config.l0_offset = 30;
    config.l1_offset = 60;
    config.l2_offset = 90;
    config
}

fn setup() -> TestNet {
    let chain = MockChain::new();

    let alice_wallet = MockWallet::new(chain.clone());
    alice_wallet.fund(Amount::from_sat(8_000_000));
    alice_wallet.fund(Amount::from_sat(8_000_000));

    let carol_wallet = MockWallet::new(chain.clone());
    carol_wallet.fund(Amount::from_sat(8_000_000));
    carol_wallet.fund(Amount::from_sat(8_000_000));

    let alice_dir = tempfile::tempdir().unwrap();
    let carol_dir = tempfile::tempdir().unwrap();

    let alice_config = config(alice_dir.path());
    let carol_config = config(carol_dir.path());

    let alice_store = SessionStore::new(alice_dir.path()).unwrap();
    let carol_store = SessionStore::new(carol_dir.path()).unwrap();

    let server = Arc::new(tokio::sync::Mutex::new(Server::new(
        carol_wallet.clone(),
        chain.clone(),
        carol_config,
        carol_store,
    )));

    TestNet {
        chain,
        alice_wallet,
        carol_wallet,
        server,
        alice_store,
        config: alice_config,
        _alice_dir: alice_dir,
        _carol_dir: carol_dir,
    }
}

/// Mine a block and tick the server every `period_ms` until aborted.
fn spawn_miner(server: SharedServer, chain: MockChain, period_ms: u64) -> AbortHandle {
    let (handle, registration) = AbortHandle::new_pair();

    tokio::spawn(Abortable::new(
        async move {
            loop {
                tokio::time::delay_for(Duration::from_millis(period_ms)).await;
                chain.mine(1);
                server.lock().await.poll().await;
            }
        },
        registration,
    ));

    handle
}

async fn wait_for_carol(server: &SharedServer, id: &SessionId, state_index: u32) {
    for _ in 0..400u32 {
        let reached = server
            .lock()
            .await
            .session(id)
            .map(|carol| carol.state_index() >= state_index)
            .unwrap_or(false);
        if reached {
            return;
        }

        tokio::time::delay_for(Duration::from_millis(25)).await;
    }

    panic!("carol never reached state {}", state_index);
}

async fn wait_for_spend(chain: &MockChain, outpoint: OutPoint) -> bitcoin::Txid {
    for _ in 0..400u32 {
        if let Some(txid) = chain.spending_txid(outpoint) {
            if chain.confirmations(txid) >= 1 {
                return txid;
            }
        }

        tokio::time::delay_for(Duration::from_millis(25)).await;
    }

    panic!("{} was never spent", outpoint);
}

#[tokio::test(threaded_scheduler)]
async fn cooperative_swap_completes() {
    let net = setup();
    let miner = spawn_miner(net.server.clone(), net.chain.clone(), 40);

    let alice_before = net.alice_wallet.balance(0);
    let carol_before = net.carol_wallet.balance(0);

    let mut alice =
        Alice::new(net.config.clone(), net.alice_store.clone(), amount(), swap_fee()).unwrap();
    let id = alice.session_id().clone();
    let mut transport = Transport::new(net.server.clone());

    let outcome = alice
        .run(&mut transport, &net.alice_wallet, &net.chain)
        .await
        .unwrap();
    let redeem_txid = match outcome {
        SwapOutcome::Completed { redeem_txid } => redeem_txid,
        other => panic!("expected completion, got {:?}", other),
    };

    wait_for_carol(&net.server, &id, CAROL_DONE).await;
    miner.abort();

    let session = net.alice_store.load(&id).unwrap();
    assert_eq!(session.state_index, 13);
    let params = session.params.clone().unwrap();

    // Alice's escrow settled to Carol's payout through the redeem Alice
    // pushed herself.
    let escrow_a = OutPoint::new(session.tx0_txid.unwrap(), 0);
    assert_eq!(net.chain.spending_txid(escrow_a), Some(redeem_txid));
    let tx2 = net.chain.get_transaction(redeem_txid).unwrap();
    assert_eq!(
        tx2.output[0].value,
        (params.amount + params.coinswap_fee - params.fees.redeem_escrow_alice).as_sat()
    );
    assert_eq!(
        tx2.output[0].script_pubkey,
        params.carol_payout.script_pubkey()
    );

    // Carol's escrow settled to Alice's payout.
    let escrow_c = OutPoint::new(session.tx1_txid.unwrap(), 0);
    let tx3_txid = net.chain.spending_txid(escrow_c).expect("escrow_c settled");
    let tx3 = net.chain.get_transaction(tx3_txid).unwrap();
    assert_eq!(
        tx3.output[0].script_pubkey,
        params.alice_payout.script_pubkey()
    );
    assert_eq!(
        tx3.output[0].value,
        (params.amount - params.fees.redeem_escrow_carol).as_sat()
    );
    assert!(net.chain.confirmations(tx3_txid) >= 1);

    // Funding wallets paid out exactly the locked value plus the funding
    // fee; change came back.
    let alice_spent = alice_before - net.alice_wallet.balance(0);
    assert_eq!(
        alice_spent,
        params.amount + params.coinswap_fee + params.fees.funding_alice
    );
    let carol_spent = carol_before - net.carol_wallet.balance(0);
    assert_eq!(carol_spent, params.amount + params.fees.funding_carol);

    // Net cost to Alice stays inside the fee schedule.
    let alice_received = params.amount - params.fees.redeem_escrow_carol;
    let net_loss = alice_spent - alice_received;
    assert!(net_loss.as_sat() <= swap_fee().as_sat() + 4 * harness::FEE_RATE);
}

#[derive(Clone)]
struct WrongVersion;

impl Hooks for WrongVersion {
    fn handshake(&self, message: &mut Handshake) {
        message.cscs_version = 99;
    }
}

#[tokio::test(threaded_scheduler)]
async fn wrong_version_handshake_is_refused_without_chain_activity() {
    let net = setup();
    let txs_before = net.chain.tx_count();
    let alice_before = net.alice_wallet.balance(0);

    let mut alice = Alice::with_hooks(
        net.config.clone(),
        net.alice_store.clone(),
        amount(),
        swap_fee(),
        WrongVersion,
    )
    .unwrap();
    let mut transport = Transport::new(net.server.clone());

    let outcome = alice
        .run(&mut transport, &net.alice_wallet, &net.chain)
        .await
        .unwrap();

    match outcome {
        SwapOutcome::BackedOut {
            claim_txid,
            refund_txid,
            ..
        } => {
            assert!(claim_txid.is_none());
            assert!(refund_txid.is_none());
        }
        other => panic!("expected backout, got {:?}", other),
    }

    // Nothing was broadcast and no balance moved.
    assert_eq!(net.chain.tx_count(), txs_before);
    assert_eq!(net.alice_wallet.balance(0), alice_before);
    assert_eq!(alice.state_index(), 1);
}

#[tokio::test(threaded_scheduler)]
async fn vanishing_alice_times_out_and_both_sides_recover() {
    let net = setup();
    let miner = spawn_miner(net.server.clone(), net.chain.clone(), 40);

    let alice_before = net.alice_wallet.balance(0) + net.alice_wallet.balance(1);
    let carol_before = net.carol_wallet.balance(0);

    let mut alice =
        Alice::new(net.config.clone(), net.alice_store.clone(), amount(), swap_fee()).unwrap();
    let id = alice.session_id().clone();

    // The connection dies exactly when Alice announces her funding: she has
    // broadcast TX0 and must fall back to the timeout branch.
    let mut transport = FailOn {
        inner: Transport::new(net.server.clone()),
        method: Method::Tx0idHxTx2Sig,
    };

    let outcome = alice
        .run(&mut transport, &net.alice_wallet, &net.chain)
        .await
        .unwrap();

    let refund_txid = match outcome {
        SwapOutcome::BackedOut {
            refund_txid: Some(refund_txid),
            claim_txid: None,
            ..
        } => refund_txid,
        other => panic!("expected a refund backout, got {:?}", other),
    };

    miner.abort();

    let session = net.alice_store.load(&id).unwrap();
    let params = session.params.clone().unwrap();

    // The refund used the timeout branch: only valid from L1 on.
    let refund = net.chain.get_transaction(refund_txid).unwrap();
    assert_eq!(refund.lock_time, params.timeouts.L1);
    assert!(net.chain.height() >= params.timeouts.L1);
    assert!(net.chain.confirmations(refund_txid) >= 1);

    // Carol never funded and her wallet never moved.
    assert_eq!(net.carol_wallet.balance(0), carol_before);
    let carol_live = net
        .server
        .lock()
        .await
        .session(&id)
        .map(|carol| carol.is_live())
        .unwrap_or(false);
    assert!(!carol_live, "carol should have given up on the session");

    // Alice lost nothing but fees: funding fee plus the backout fee.
    let alice_after = net.alice_wallet.balance(0) + net.alice_wallet.balance(1);
    let lost = alice_before - alice_after;
    assert!(
        lost.as_sat() <= params.fees.funding_alice.as_sat() + 2 * harness::FEE_RATE,
        "lost {}",
        lost
    );
}

#[derive(Clone)]
struct WrongSecret;

impl Hooks for WrongSecret {
    fn secret(&self, secret: &mut Preimage) {
        *secret = Preimage::new_random();
    }
}

#[tokio::test(threaded_scheduler)]
async fn wrong_preimage_is_refused_and_both_funders_reclaim() {
    let net = setup();
    let miner = spawn_miner(net.server.clone(), net.chain.clone(), 40);

    let alice_before = net.alice_wallet.balance(0) + net.alice_wallet.balance(1);
    let carol_before = net.carol_wallet.balance(0) + net.carol_wallet.balance(1);

    let mut alice = Alice::with_hooks(
        net.config.clone(),
        net.alice_store.clone(),
        amount(),
        swap_fee(),
        WrongSecret,
    )
    .unwrap();
    let id = alice.session_id().clone();
    let mut transport = Transport::new(net.server.clone());

    let outcome = alice
        .run(&mut transport, &net.alice_wallet, &net.chain)
        .await
        .unwrap();

    // A refused reveal is no licence to touch Carol's escrow: Alice only
    // reclaims her own funding through the timeout branch.
    let refund_txid = match outcome {
        SwapOutcome::BackedOut {
            claim_txid: None,
            refund_txid: Some(refund_txid),
            ..
        } => refund_txid,
        other => panic!("expected a refund-only backout, got {:?}", other),
    };

    let session = net.alice_store.load(&id).unwrap();
    let params = session.params.clone().unwrap();

    let escrow_a = OutPoint::new(session.tx0_txid.unwrap(), 0);
    assert_eq!(net.chain.spending_txid(escrow_a), Some(refund_txid));
    let refund = net.chain.get_transaction(refund_txid).unwrap();
    assert_eq!(refund.lock_time, params.timeouts.L1);
    assert!(net.chain.confirmations(refund_txid) >= 1);
    assert_ne!(
        refund.output[0].script_pubkey,
        params.carol_payout.script_pubkey()
    );

    // Carol sits out her longer timeout and reclaims her own funding too.
    let escrow_c = OutPoint::new(session.tx1_txid.unwrap(), 0);
    let carol_refund_txid = wait_for_spend(&net.chain, escrow_c).await;
    let carol_refund = net.chain.get_transaction(carol_refund_txid).unwrap();
    assert_eq!(carol_refund.lock_time, params.timeouts.L2);
    assert_ne!(
        carol_refund.output[0].script_pubkey,
        params.alice_payout.script_pubkey()
    );

    miner.abort();

    // Neither payout leg ever paid out: the escrows went back to their
    // funders' wallets and each side lost fees only.
    assert!(net.alice_wallet.balance(1) > Amount::from_sat(0));
    assert!(net.carol_wallet.balance(1) > Amount::from_sat(0));

    let alice_after = net.alice_wallet.balance(0) + net.alice_wallet.balance(1);
    let alice_lost = alice_before - alice_after;
    assert!(
        alice_lost.as_sat() <= params.fees.funding_alice.as_sat() + 2 * harness::FEE_RATE,
        "alice lost {}",
        alice_lost
    );

    let carol_after = net.carol_wallet.balance(0) + net.carol_wallet.balance(1);
    let carol_lost = carol_before - carol_after;
    assert!(
        carol_lost.as_sat() <= params.fees.funding_carol.as_sat() + 2 * harness::FEE_RATE,
        "carol lost {}",
        carol_lost
    );
}

#[tokio::test(threaded_scheduler)]
async fn carol_claims_when_the_redeem_never_arrives() {
    let net = setup();
    let miner = spawn_miner(net.server.clone(), net.chain.clone(), 40);

    let alice = Alice::new(net.config.clone(), net.alice_store.clone(), amount(), swap_fee()).unwrap();
    let id = alice.session_id().clone();

    // Alice completes the reveal but her redeem broadcast hangs and she
    // dies there, never to return.
    let stall = StallSpend {
        inner: net.chain.clone(),
        outpoint: Arc::new(Mutex::new(None)),
    };

    let (abort, registration) = AbortHandle::new_pair();
    let task = {
        let mut alice = alice;
        let mut transport = Transport::new(net.server.clone());
        let wallet = net.alice_wallet.clone();
        let stall = stall.clone();
        tokio::spawn(Abortable::new(
            async move { alice.run(&mut transport, &wallet, &stall).await },
            registration,
        ))
    };

    for _ in 0..400u32 {
        if let Ok(session) = net.alice_store.load(&id) {
            if let Some(tx0_txid) = session.tx0_txid {
                *stall.outpoint.lock().unwrap() = Some(OutPoint::new(tx0_txid, 0));
            }
            if session.state_index >= 12 {
                break;
            }
        }

        tokio::time::delay_for(Duration::from_millis(10)).await;
    }

    abort.abort();
    let _ = task.await;

    let session = net.alice_store.load(&id).unwrap();
    let params = session.params.clone().unwrap();
    let escrow_a = OutPoint::new(session.tx0_txid.unwrap(), 0);
    assert!(net.chain.spending_txid(escrow_a).is_none());

    // With her refund window creeping closer, Carol stops waiting for the
    // redeem and sweeps the escrow through the secret branch herself.
    let sweep_txid = wait_for_spend(&net.chain, escrow_a).await;
    let sweep = net.chain.get_transaction(sweep_txid).unwrap();
    assert_eq!(
        sweep.output[0].script_pubkey,
        params.carol_payout.script_pubkey()
    );
    assert_ne!(Some(sweep_txid), session.redeem_txid);

    wait_for_carol(&net.server, &id, CAROL_DONE).await;
    miner.abort();
}

#[tokio::test(threaded_scheduler)]
async fn crash_after_cosignature_resumes_and_completes() {
    let net = setup();
    let miner = spawn_miner(net.server.clone(), net.chain.clone(), 40);

    let alice = Alice::new(net.config.clone(), net.alice_store.clone(), amount(), swap_fee()).unwrap();
    let id = alice.session_id().clone();

    // The first broadcast of the escrow spend hangs forever, pinning the
    // session in the window between the state-12 persist and the network
    // seeing the redeem. Aborting there is the crash.
    let stall = StallSpend {
        inner: net.chain.clone(),
        outpoint: Arc::new(Mutex::new(None)),
    };

    let (abort, registration) = AbortHandle::new_pair();
    let task = {
        let mut alice = alice;
        let mut transport = Transport::new(net.server.clone());
        let wallet = net.alice_wallet.clone();
        let stall = stall.clone();
        tokio::spawn(Abortable::new(
            async move { alice.run(&mut transport, &wallet, &stall).await },
            registration,
        ))
    };

    let mut escrow_a = None;
    for _ in 0..400u32 {
        if let Ok(session) = net.alice_store.load(&id) {
            if let Some(tx0_txid) = session.tx0_txid {
                let outpoint = OutPoint::new(tx0_txid, 0);
                escrow_a = Some(outpoint);
                *stall.outpoint.lock().unwrap() = Some(outpoint);
            }
            if session.state_index >= 12 {
                break;
            }
        }

        tokio::time::delay_for(Duration::from_millis(10)).await;
    }

    abort.abort();
    let _ = task.await;

    let escrow_a = escrow_a.expect("funding was broadcast before the crash");
    let persisted = net.alice_store.load(&id).unwrap();
    assert_eq!(persisted.state_index, 12);
    assert!(
        net.chain.spending_txid(escrow_a).is_none(),
        "the redeem must not have reached the chain before the crash"
    );

    // Restart: the resumed session re-broadcasts the redeem and finishes.
    let mut alice = Alice::resume(net.config.clone(), net.alice_store.clone(), &id, Honest).unwrap();
    assert_eq!(alice.state_index(), 12);

    let mut transport = Transport::new(net.server.clone());
    let outcome = alice
        .run(&mut transport, &net.alice_wallet, &net.chain)
        .await
        .unwrap();

    let redeem_txid = match outcome {
        SwapOutcome::Completed { redeem_txid } => redeem_txid,
        other => panic!("expected completion after resume, got {:?}", other),
    };

    wait_for_carol(&net.server, &id, CAROL_DONE).await;
    miner.abort();

    // Exactly one spend of the escrow; the replayed log agrees with the
    // live run.
    assert_eq!(net.chain.spending_txid(escrow_a), Some(redeem_txid));
    let replayed = net.alice_store.load(&id).unwrap();
    assert_eq!(replayed.state_index, 13);
}

#[tokio::test(threaded_scheduler)]
async fn server_enforces_session_and_state_discipline() {
    let net = setup();

    let status = net.server.lock().await.status().await;
    assert!(!status.busy);
    assert_eq!(status.minimum_amount, net.config.minimum_amount);
    assert_eq!(status.maximum_amount, 16_000_000);
    assert_eq!(status.cscs_version, PROTOCOL_VERSION);

    // Unknown sessions are refused.
    let response = net
        .server
        .lock()
        .await
        .handle(Request::Phase2Ready {
            session_id: SessionId::from("deadbeef"),
        })
        .await;
    assert!(response.is_refusal());

    // A method out of order kills the session it was aimed at.
    let session_id = SessionId::from("00aa");
    let handshake = Handshake {
        session_id: session_id.clone(),
        cscs_version: PROTOCOL_VERSION,
        source_chain: "BTC".to_string(),
        destination_chain: "BTC".to_string(),
        amount: amount(),
    };
    let response = net
        .server
        .lock()
        .await
        .handle(Request::Handshake(handshake.clone()))
        .await;
    assert!(matches!(response, Response::Handshake(_)));

    // A duplicate handshake replays the same ack instead of forking state.
    let replay = net
        .server
        .lock()
        .await
        .handle(Request::Handshake(handshake))
        .await;
    assert!(matches!(replay, Response::Handshake(_)));

    let response = net
        .server
        .lock()
        .await
        .handle(Request::Secret {
            session_id: session_id.clone(),
            secret: Preimage::new_random(),
        })
        .await;
    assert!(response.is_refusal());

    let live = net
        .server
        .lock()
        .await
        .session(&session_id)
        .map(|carol| carol.is_live())
        .unwrap();
    assert!(!live, "out-of-order traffic must kill the session");

    // A server at wrong-version handshakes refuses before creating state.
    let bad_version = Handshake {
        session_id: SessionId::from("00bb"),
        cscs_version: 99,
        source_chain: "BTC".to_string(),
        destination_chain: "BTC".to_string(),
        amount: amount(),
    };
    let response = net
        .server
        .lock()
        .await
        .handle(Request::Handshake(bad_version))
        .await;
    assert!(response.is_refusal());
    assert!(net
        .server
        .lock()
        .await
        .session(&SessionId::from("00bb"))
        .is_none());
}
