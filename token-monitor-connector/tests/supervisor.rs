use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::StreamExt;
use solana_sdk::{commitment_config::CommitmentLevel, pubkey::Pubkey};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};
use tokio::{sync::mpsc, time::Instant};
use tokio_stream::wrappers::ReceiverStream;
use token_monitor_connector::{
    balances::{BalanceMeta, TokenBalanceSnapshot},
    client::{FetchOptions, LedgerClient, LogStream, TransactionRecord},
    config::MonitorConfig,
    events::{Direction, LogContext, LogEvent, TransferEvent},
    handler::{ChannelHandler, TransferHandler},
    session::{MonitorSession, StopReason, SupervisorState},
    workers::{MonitorTarget, SubscriptionSupervisor, TokenMonitor},
    MonitorError,
};

const MINT_A: &str = "So11111111111111111111111111111111111111112";
const MINT_B: &str = "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v";

enum Fetch {
    Found(TransactionRecord),
    Missing,
    Broken,
}

/// An in-memory ledger. Each subscribe call pops the next scripted stream; once the
/// script is exhausted every call fails.
#[derive(Default)]
struct MockLedger {
    streams: Mutex<VecDeque<mpsc::Receiver<LogEvent>>>,
    transactions: Mutex<HashMap<String, Fetch>>,
    subscribe_attempts: AtomicUsize,
    fetches: AtomicUsize,
    fetch_delay: Option<Duration>,
}

impl MockLedger {
    fn with_fetch_delay(delay: Duration) -> Self {
        Self {
            fetch_delay: Some(delay),
            ..Self::default()
        }
    }

    fn add_stream(&self) -> mpsc::Sender<LogEvent> {
        let (tx, rx) = mpsc::channel(16);
        self.streams.lock().unwrap().push_back(rx);
        tx
    }

    fn add_transaction(&self, signature: &str, fetch: Fetch) {
        self.transactions
            .lock()
            .unwrap()
            .insert(signature.to_string(), fetch);
    }

    fn attempts(&self) -> usize {
        self.subscribe_attempts.load(Ordering::SeqCst)
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LedgerClient for MockLedger {
    async fn subscribe_program_logs(
        &self,
        _program_id: &Pubkey,
        _commitment: CommitmentLevel,
    ) -> Result<LogStream> {
        self.subscribe_attempts.fetch_add(1, Ordering::SeqCst);
        let next = self.streams.lock().unwrap().pop_front();
        match next {
            Some(rx) => Ok(ReceiverStream::new(rx).boxed()),
            None => Err(anyhow!("websocket unavailable")),
        }
    }

    async fn fetch_transaction(
        &self,
        signature: &str,
        _options: FetchOptions,
    ) -> Result<Option<TransactionRecord>> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        if let Some(delay) = self.fetch_delay {
            tokio::time::sleep(delay).await;
        }
        match self.transactions.lock().unwrap().get(signature) {
            Some(Fetch::Found(record)) => Ok(Some(record.clone())),
            Some(Fetch::Missing) | None => Ok(None),
            Some(Fetch::Broken) => Err(anyhow!("rpc node returned 503")),
        }
    }
}

fn config(max_retries: u32, retry_delay_ms: u64) -> MonitorConfig {
    let mut config = MonitorConfig::default();
    config.supervisor.max_retries = max_retries;
    config.supervisor.retry_delay_ms = retry_delay_ms;
    config
}

fn balance(account_index: u8, mint: &str, raw_amount: u64) -> TokenBalanceSnapshot {
    TokenBalanceSnapshot {
        account_index,
        mint: mint.to_string(),
        raw_amount,
        decimals: 6,
        ui_amount: None,
    }
}

fn record(signature: &str, pre: Vec<TokenBalanceSnapshot>, post: Vec<TokenBalanceSnapshot>) -> TransactionRecord {
    TransactionRecord {
        slot: 1_000,
        block_time: Some(1_700_000_000),
        signatures: vec![signature.to_string()],
        account_keys: (0..4).map(|_| Pubkey::new_unique()).collect(),
        balances: Some(BalanceMeta { pre, post }),
    }
}

fn log(signature: &str, failed: bool) -> LogEvent {
    LogEvent {
        signature: signature.to_string(),
        failed,
        slot: 999,
    }
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..1_000 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition was never reached");
}

fn spawn_supervisor(
    supervisor: SubscriptionSupervisor,
    session: Arc<MonitorSession>,
) -> tokio::task::JoinHandle<Result<(), MonitorError>> {
    tokio::spawn(async move { supervisor.run(&session).await })
}

#[tokio::test(start_paused = true)]
async fn gives_up_after_exactly_max_retries_attempts() {
    let ledger = Arc::new(MockLedger::default());
    let supervisor = SubscriptionSupervisor::new(&config(3, 1_000), ledger.clone());
    let session = MonitorSession::new(None);

    let started = Instant::now();
    let outcome = supervisor.run(&session).await;

    match outcome {
        Err(MonitorError::RetriesExhausted { attempts, last_error }) => {
            assert_eq!(attempts, 3);
            assert!(last_error.contains("websocket unavailable"));
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
    assert_eq!(ledger.attempts(), 3);
    assert_eq!(session.state(), SupervisorState::Stopped(StopReason::RetriesExhausted));
    assert!(!session.is_active());

    // Linear backoff between the three attempts: 1s + 2s.
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_secs(3), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(4), "elapsed {elapsed:?}");

    // Nothing retries after the terminal state.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(ledger.attempts(), 3);
}

#[tokio::test]
async fn delivers_transfers_with_subscription_context() {
    let ledger = Arc::new(MockLedger::default());
    let logs = ledger.add_stream();
    ledger.add_transaction(
        "sig-a",
        Fetch::Found(record("sig-a", vec![balance(0, "M", 100)], vec![balance(0, "M", 150)])),
    );
    let (handler, mut transfers) = ChannelHandler::new(8);
    let supervisor =
        SubscriptionSupervisor::new(&config(5, 10), ledger.clone()).with_handler(Arc::new(handler));
    let session = Arc::new(MonitorSession::new(None));
    let run = spawn_supervisor(supervisor, session.clone());

    logs.send(log("sig-a", false)).await.unwrap();
    let received = transfers.recv().await.unwrap();

    assert_eq!(received.transfer.amount, 50);
    assert_eq!(received.transfer.direction, Direction::Receive);
    assert_eq!(received.transfer.signature, "sig-a");
    assert_eq!(received.transfer.slot, 1_000);
    assert_eq!(received.context, LogContext { slot: 999 });
    assert_eq!(session.state(), SupervisorState::Active);

    session.stop();
    assert!(run.await.unwrap().is_ok());
    assert_eq!(session.state(), SupervisorState::Stopped(StopReason::Requested));
}

#[tokio::test]
async fn failed_missing_and_broken_transactions_are_dropped() {
    let ledger = Arc::new(MockLedger::default());
    let logs = ledger.add_stream();
    ledger.add_transaction("failed", Fetch::Found(record("failed", vec![], vec![balance(0, "M", 1)])));
    ledger.add_transaction("missing", Fetch::Missing);
    ledger.add_transaction("broken", Fetch::Broken);
    ledger.add_transaction(
        "good",
        Fetch::Found(record("good", vec![balance(1, "M", 10)], vec![])),
    );
    let (handler, mut transfers) = ChannelHandler::new(8);
    let supervisor =
        SubscriptionSupervisor::new(&config(5, 10), ledger.clone()).with_handler(Arc::new(handler));
    let session = Arc::new(MonitorSession::new(None));
    let run = spawn_supervisor(supervisor, session.clone());

    logs.send(log("failed", true)).await.unwrap();
    logs.send(log("missing", false)).await.unwrap();
    logs.send(log("broken", false)).await.unwrap();
    logs.send(log("good", false)).await.unwrap();

    let received = transfers.recv().await.unwrap();
    assert_eq!(received.transfer.signature, "good");
    assert_eq!(received.transfer.amount, -10);
    assert_eq!(received.transfer.direction, Direction::Send);

    session.stop();
    assert!(run.await.unwrap().is_ok());

    // The failed transaction was never fetched; the others did not touch the retry budget.
    assert_eq!(ledger.fetches(), 3);
    assert_eq!(ledger.attempts(), 1);
    assert_eq!(session.retry_count(), 0);
    assert!(transfers.try_recv().is_err());
}

#[tokio::test]
async fn mint_filter_comes_from_the_session() {
    let ledger = Arc::new(MockLedger::default());
    let logs = ledger.add_stream();
    ledger.add_transaction(
        "mixed",
        Fetch::Found(record(
            "mixed",
            vec![balance(0, MINT_A, 5), balance(1, MINT_B, 5)],
            vec![balance(0, MINT_A, 0), balance(1, MINT_B, 0)],
        )),
    );
    let (handler, mut transfers) = ChannelHandler::new(8);
    let supervisor =
        SubscriptionSupervisor::new(&config(5, 10), ledger.clone()).with_handler(Arc::new(handler));
    let session = Arc::new(MonitorSession::new(Some(MINT_B.to_string())));
    let run = spawn_supervisor(supervisor, session.clone());

    logs.send(log("mixed", false)).await.unwrap();
    let received = transfers.recv().await.unwrap();
    assert_eq!(received.transfer.mint, MINT_B);

    session.stop();
    run.await.unwrap().unwrap();
    assert!(transfers.try_recv().is_err());
}

#[tokio::test(start_paused = true)]
async fn closed_stream_resubscribes_and_healthy_stream_resets_counter() {
    let ledger = Arc::new(MockLedger::default());
    let first = ledger.add_stream();
    let supervisor = SubscriptionSupervisor::new(&config(3, 1_000), ledger.clone());
    let session = Arc::new(MonitorSession::new(None));
    let run = spawn_supervisor(supervisor, session.clone());

    eventually(|| session.state() == SupervisorState::Active).await;
    assert_eq!(ledger.attempts(), 1);

    // The stream dies; the next subscription is scripted to succeed.
    let second = ledger.add_stream();
    drop(first);
    eventually(|| ledger.attempts() == 2 && session.state() == SupervisorState::Active).await;
    assert_eq!(session.retry_count(), 0);

    // The stream dies again and nothing else is scripted. The counter restarted at zero,
    // so three more failures reach the ceiling.
    drop(second);
    let outcome = run.await.unwrap();
    assert!(matches!(
        outcome,
        Err(MonitorError::RetriesExhausted { attempts: 3, .. })
    ));
    // One failure was the closed stream itself, followed by two failed subscribes.
    assert_eq!(ledger.attempts(), 4);
}

#[tokio::test(start_paused = true)]
async fn stop_during_backoff_does_not_wait_for_the_sleep() {
    let ledger = Arc::new(MockLedger::default());
    let supervisor = SubscriptionSupervisor::new(&config(5, 60_000), ledger.clone());
    let session = Arc::new(MonitorSession::new(None));
    let run = spawn_supervisor(supervisor, session.clone());

    eventually(|| ledger.attempts() == 1).await;
    session.stop();

    let outcome = tokio::time::timeout(Duration::from_secs(1), run)
        .await
        .expect("backoff sleep is cancelled by stop")
        .unwrap();
    assert!(outcome.is_ok());
    assert_eq!(ledger.attempts(), 1);
    assert_eq!(session.state(), SupervisorState::Stopped(StopReason::Requested));
}

#[tokio::test(start_paused = true)]
async fn stop_while_active_lets_in_flight_dispatch_finish() {
    let ledger = Arc::new(MockLedger::with_fetch_delay(Duration::from_secs(5)));
    let logs = ledger.add_stream();
    ledger.add_transaction(
        "slow",
        Fetch::Found(record("slow", vec![], vec![balance(2, "M", 7)])),
    );
    let (handler, mut transfers) = ChannelHandler::new(8);
    let supervisor =
        SubscriptionSupervisor::new(&config(5, 10), ledger.clone()).with_handler(Arc::new(handler));
    let session = Arc::new(MonitorSession::new(None));
    let run = spawn_supervisor(supervisor, session.clone());

    logs.send(log("slow", false)).await.unwrap();
    eventually(|| ledger.fetches() == 1).await;

    session.stop();
    session.stop();
    run.await.unwrap().unwrap();

    // The fetch that was in flight completed and was delivered before `run` returned.
    let delivered = transfers.try_recv().expect("in-flight dispatch completed");
    assert_eq!(delivered.transfer.amount, 7);

    // The subscription is gone: nothing else is read or dispatched.
    assert!(logs.send(log("slow", false)).await.is_err());
    assert_eq!(ledger.fetches(), 1);
    assert_eq!(ledger.attempts(), 1);
}

#[tokio::test]
async fn a_session_runs_only_once() {
    let ledger = Arc::new(MockLedger::default());
    let supervisor = SubscriptionSupervisor::new(&config(1, 10), ledger.clone());
    let session = MonitorSession::new(None);

    assert!(supervisor.run(&session).await.is_err());
    assert!(matches!(
        supervisor.run(&session).await,
        Err(MonitorError::SessionAlreadyStarted)
    ));
    assert_eq!(ledger.attempts(), 1);
}

/// Records every transfer, fails on sends and panics on amount 7.
#[derive(Default)]
struct FlakyHandler {
    seen: Mutex<Vec<i128>>,
}

#[async_trait]
impl TransferHandler for FlakyHandler {
    async fn on_transfer(&self, transfer: &TransferEvent, _context: &LogContext) -> Result<()> {
        self.seen.lock().unwrap().push(transfer.amount);
        if transfer.amount == 7 {
            panic!("handler bug");
        }
        if transfer.amount < 0 {
            return Err(anyhow!("downstream rejected a send"));
        }
        Ok(())
    }
}

#[tokio::test]
async fn handler_failures_are_isolated_per_event() {
    let ledger = Arc::new(MockLedger::default());
    let logs = ledger.add_stream();
    ledger.add_transaction(
        "swap",
        Fetch::Found(record(
            "swap",
            vec![balance(0, "M", 100), balance(1, "M", 0)],
            vec![balance(0, "M", 0), balance(1, "M", 100)],
        )),
    );
    ledger.add_transaction("panic", Fetch::Found(record("panic", vec![], vec![balance(0, "M", 7)])));
    ledger.add_transaction("later", Fetch::Found(record("later", vec![], vec![balance(0, "M", 5)])));

    let handler = Arc::new(FlakyHandler::default());
    let supervisor =
        SubscriptionSupervisor::new(&config(5, 10), ledger.clone()).with_handler(handler.clone());
    let session = Arc::new(MonitorSession::new(None));
    let run = spawn_supervisor(supervisor, session.clone());

    logs.send(log("swap", false)).await.unwrap();
    logs.send(log("panic", false)).await.unwrap();
    logs.send(log("later", false)).await.unwrap();

    eventually(|| handler.seen.lock().unwrap().len() == 4).await;
    assert!(session.is_active());

    session.stop();
    run.await.unwrap().unwrap();

    let seen = handler.seen.lock().unwrap().clone();
    let swap: Vec<i128> = seen.iter().copied().filter(|a| a.abs() == 100).collect();
    assert_eq!(swap, vec![-100, 100]);
    assert_eq!(
        seen.iter().copied().collect::<HashSet<_>>(),
        HashSet::from([-100, 100, 7, 5])
    );
}

#[tokio::test]
async fn token_monitor_runs_independent_sessions_per_mint() {
    let ledger = Arc::new(MockLedger::default());
    let first = ledger.add_stream();
    let second = ledger.add_stream();
    ledger.add_transaction(
        "both",
        Fetch::Found(record(
            "both",
            vec![balance(0, MINT_A, 1), balance(1, MINT_B, 1)],
            vec![balance(0, MINT_A, 3), balance(1, MINT_B, 4)],
        )),
    );
    let (handler, mut transfers) = ChannelHandler::new(8);
    let monitor = TokenMonitor::new(Arc::new(config(5, 10)), ledger.clone(), Arc::new(handler));
    let handle = monitor.start([
        MonitorTarget::mint(MINT_A).unwrap(),
        MonitorTarget::mint(MINT_B).unwrap(),
    ]);

    let sessions: Vec<_> = handle.sessions().map(|(_, s)| s.clone()).collect();
    eventually(|| sessions.iter().all(|s| s.state() == SupervisorState::Active)).await;

    first.send(log("both", false)).await.unwrap();
    second.send(log("both", false)).await.unwrap();

    let mut by_mint = HashMap::new();
    for _ in 0..2 {
        let received = transfers.recv().await.unwrap();
        by_mint.insert(received.transfer.mint.clone(), received.transfer.amount);
    }
    assert_eq!(by_mint.get(MINT_A), Some(&2));
    assert_eq!(by_mint.get(MINT_B), Some(&3));

    handle.stop();
    let outcomes = handle.join().await;
    assert_eq!(outcomes.len(), 2);
    assert!(outcomes.iter().all(|(_, outcome)| outcome.is_ok()));
}

#[tokio::test(start_paused = true)]
async fn one_exhausted_target_leaves_the_other_running() {
    let ledger = Arc::new(MockLedger::default());
    let only = ledger.add_stream();
    ledger.add_transaction(
        "both",
        Fetch::Found(record(
            "both",
            vec![balance(0, MINT_A, 1), balance(1, MINT_B, 1)],
            vec![balance(0, MINT_A, 3), balance(1, MINT_B, 4)],
        )),
    );
    let (handler, mut transfers) = ChannelHandler::new(8);
    let monitor = TokenMonitor::new(Arc::new(config(2, 10)), ledger.clone(), Arc::new(handler));
    let handle = monitor.start([
        MonitorTarget::mint(MINT_A).unwrap(),
        MonitorTarget::mint(MINT_B).unwrap(),
    ]);

    let sessions: Vec<_> = handle
        .sessions()
        .map(|(target, session)| (target.clone(), session.clone()))
        .collect();
    let exhausted = SupervisorState::Stopped(StopReason::RetriesExhausted);
    eventually(|| {
        let states: Vec<_> = sessions.iter().map(|(_, s)| s.state()).collect();
        states.contains(&exhausted) && states.contains(&SupervisorState::Active)
    })
    .await;

    let (survivor, _) = sessions
        .iter()
        .find(|(_, s)| s.state() == SupervisorState::Active)
        .unwrap();
    only.send(log("both", false)).await.unwrap();
    let received = transfers.recv().await.unwrap();
    assert_eq!(Some(received.transfer.mint.as_str()), survivor.mint_filter());

    handle.stop();
    let outcomes = handle.join_within(Duration::from_secs(1)).await.unwrap();
    for (target, outcome) in outcomes {
        if &target == survivor {
            assert!(outcome.is_ok());
        } else {
            assert!(matches!(outcome, Err(MonitorError::RetriesExhausted { attempts: 2, .. })));
        }
    }
}

#[tokio::test(start_paused = true)]
async fn bounded_join_gives_up_on_a_hung_fetch() {
    let ledger = Arc::new(MockLedger::with_fetch_delay(Duration::from_secs(3_600)));
    let logs = ledger.add_stream();
    let monitor = TokenMonitor::new(
        Arc::new(config(5, 10)),
        ledger.clone(),
        Arc::new(ChannelHandler::new(1).0),
    );
    let handle = monitor.start([MonitorTarget::AllMints]);

    logs.send(log("hung", false)).await.unwrap();
    eventually(|| ledger.fetches() == 1).await;

    handle.stop();
    let started = Instant::now();
    assert!(handle.join_within(Duration::from_secs(5)).await.is_none());
    assert!(started.elapsed() < Duration::from_secs(6));
}

#[tokio::test(start_paused = true)]
async fn zero_max_retries_makes_no_attempt() {
    let ledger = Arc::new(MockLedger::default());
    ledger.add_stream();
    let supervisor = SubscriptionSupervisor::new(&config(0, 10), ledger.clone());
    let session = MonitorSession::new(None);

    assert!(matches!(
        supervisor.run(&session).await,
        Err(MonitorError::RetriesExhausted { attempts: 0, .. })
    ));
    assert_eq!(ledger.attempts(), 0);
    assert_eq!(session.state(), SupervisorState::Stopped(StopReason::RetriesExhausted));
}

#[test]
fn monitor_target_rejects_invalid_mint() {
    assert!(matches!(
        MonitorTarget::mint("definitely not base58!"),
        Err(MonitorError::InvalidMint(_))
    ));
    assert_eq!(MonitorTarget::mint(MINT_A).unwrap().mint_filter(), Some(MINT_A));
    assert_eq!(MonitorTarget::AllMints.mint_filter(), None);
}
