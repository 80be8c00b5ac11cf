//! Ledger scenarios against the in-memory store and broker
//!
//! Covers the cross-component behaviour unit tests cannot see on their own:
//! - transfers between two accounts and the entries they leave behind
//! - opposing concurrent transfers finishing without deadlock
//! - money conservation under concurrent load
//! - all-or-nothing transfers when a write fails midway
//! - registration, the verification task, the email and the final verification
//! - broker outages during registration
//! - retry exhaustion of the verification task

use async_trait::async_trait;
use bank_ledger::core::{
    execute_in_transaction, verify_email_tx, Registration, TransferEngine, TransferPolicy,
    INVALID_VERIFICATION,
};
use bank_ledger::mail::{Email, EmailSender, MailError};
use bank_ledger::store::{FaultPoint, MemoryStore, Queries, Store, StoreTx};
use bank_ledger::types::{
    AccountId, ErrorKind, LedgerError, NewAccount, NewUser, TransferTxParams,
    VerifyEmailTxParams,
};
use bank_ledger::worker::{
    ErrorObserver, Handlers, MemoryBroker, ProcessorConfig, QueueName, RetryPolicy,
    SendVerifyEmailHandler, Task, TaskDistributor, TaskError, TaskKind, TaskOptions,
    TaskProcessor, TaskState, VerifyEmailConfig, WeightedSchedule,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Default)]
struct RecordingMailer {
    fail_transport: bool,
    attempts: AtomicU32,
    sent: Mutex<Vec<Email>>,
}

#[async_trait]
impl EmailSender for RecordingMailer {
    async fn send_email(&self, email: Email) -> Result<(), MailError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.fail_transport {
            return Err(MailError::Transport("connection refused".to_string()));
        }
        self.sent.lock().unwrap().push(email);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingObserver {
    failures: Mutex<Vec<(Task, TaskError)>>,
}

impl ErrorObserver for RecordingObserver {
    fn on_failure(&self, task: &Task, error: &TaskError) {
        self.failures
            .lock()
            .unwrap()
            .push((task.clone(), error.clone()));
    }
}

fn params(from: AccountId, to: AccountId, amount: i64) -> TransferTxParams {
    TransferTxParams {
        from_account_id: from,
        to_account_id: to,
        amount,
    }
}

/// Open one USD account per balance, each with its own owner
async fn open_accounts(store: &MemoryStore, balances: &[i64]) -> Vec<AccountId> {
    let balances = balances.to_vec();
    execute_in_transaction(store, move |tx| {
        Box::pin(async move {
            let mut ids = Vec::new();
            for (i, balance) in balances.into_iter().enumerate() {
                let owner = format!("owner{}", i);
                tx.create_user(NewUser::depositor(
                    owner.as_str(),
                    "hash",
                    owner.as_str(),
                    format!("{}@example.com", owner),
                ))
                .await?;
                ids.push(tx.create_account(NewAccount::new(owner, "USD", balance)).await?.id);
            }
            Ok::<_, LedgerError>(ids)
        })
    })
    .await
    .unwrap()
}

async fn balance(store: &MemoryStore, id: AccountId) -> i64 {
    let mut tx = store.begin().await.unwrap();
    tx.get_account(id).await.unwrap().balance
}

#[tokio::test]
async fn test_transfer_moves_funds_and_records_entries() {
    let store = Arc::new(MemoryStore::new());
    let ids = open_accounts(&store, &[1000, 200]).await;
    let engine = TransferEngine::new(Arc::clone(&store), TransferPolicy::default());

    let result = engine.transfer(params(ids[0], ids[1], 300)).await.unwrap();

    assert_eq!(result.from_account.balance, 700);
    assert_eq!(result.to_account.balance, 500);
    assert_eq!(result.from_entry.amount, -300);
    assert_eq!(result.to_entry.amount, 300);
    assert_eq!(result.transfer.amount, 300);

    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.get_transfer(result.transfer.id).await.unwrap(), result.transfer);
    assert_eq!(tx.list_entries(ids[0]).await.unwrap(), vec![result.from_entry]);
    assert_eq!(tx.list_entries(ids[1]).await.unwrap(), vec![result.to_entry]);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_opposing_concurrent_transfers_complete() {
    let store = Arc::new(MemoryStore::new());
    let ids = open_accounts(&store, &[1000, 1000]).await;
    let engine = TransferEngine::new(Arc::clone(&store), TransferPolicy::default());

    let mut tasks = JoinSet::new();
    for i in 0..20 {
        let engine = engine.clone();
        let (from, to) = if i % 2 == 0 {
            (ids[0], ids[1])
        } else {
            (ids[1], ids[0])
        };
        tasks.spawn(async move { engine.transfer(params(from, to, 10)).await });
    }

    let all_done = tokio::time::timeout(Duration::from_secs(10), async {
        while let Some(joined) = tasks.join_next().await {
            joined.unwrap().unwrap();
        }
    })
    .await;
    assert!(all_done.is_ok(), "transfers did not finish");

    assert_eq!(balance(&store, ids[0]).await, 1000);
    assert_eq!(balance(&store, ids[1]).await, 1000);
    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.list_entries(ids[0]).await.unwrap().len(), 20);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_transfers_conserve_money() {
    let store = Arc::new(MemoryStore::new());
    let ids = open_accounts(&store, &[100, 100, 100, 100, 100]).await;
    let engine = TransferEngine::new(Arc::clone(&store), TransferPolicy::default());

    let mut tasks = JoinSet::new();
    for i in 0..200usize {
        let engine = engine.clone();
        let from = ids[(i * 7) % ids.len()];
        let to = ids[(i * 3 + 1) % ids.len()];
        let amount = (i % 50) as i64 + 1;
        tasks.spawn(async move { engine.transfer(params(from, to, amount)).await });
    }
    while let Some(joined) = tasks.join_next().await {
        if let Err(error) = joined.unwrap() {
            assert_eq!(error.kind(), ErrorKind::InvalidState, "unexpected failure: {}", error);
        }
    }

    let mut tx = store.begin().await.unwrap();
    let mut total = 0;
    for id in &ids {
        let account = tx.get_account(*id).await.unwrap();
        let entries: i64 = tx
            .list_entries(*id)
            .await
            .unwrap()
            .iter()
            .map(|e| e.amount)
            .sum();
        assert!(account.balance >= 0);
        assert_eq!(account.balance, 100 + entries);
        total += account.balance;
    }
    assert_eq!(total, 500);
}

#[tokio::test]
async fn test_failed_entry_write_leaves_no_trace() {
    let store = Arc::new(MemoryStore::new());
    let ids = open_accounts(&store, &[1000, 200]).await;
    let engine = TransferEngine::new(Arc::clone(&store), TransferPolicy::default());

    // The debit entry is written, the credit entry fails
    store.inject_fault(FaultPoint::CreateEntry, 1);
    let error = engine.transfer(params(ids[0], ids[1], 300)).await.unwrap_err();
    assert_eq!(error.kind(), ErrorKind::Transient);

    let mut tx = store.begin().await.unwrap();
    assert_eq!(
        tx.get_transfer(1).await.unwrap_err().kind(),
        ErrorKind::NotFound
    );
    assert!(tx.list_entries(ids[0]).await.unwrap().is_empty());
    assert!(tx.list_entries(ids[1]).await.unwrap().is_empty());
    drop(tx);
    assert_eq!(balance(&store, ids[0]).await, 1000);
    assert_eq!(balance(&store, ids[1]).await, 200);

    // Ids consumed by the failed attempt are not reused
    let retried = engine.transfer(params(ids[0], ids[1], 300)).await.unwrap();
    assert_eq!(retried.transfer.id, 2);
}

fn link_params(email: &Email) -> VerifyEmailTxParams {
    let query = email
        .html_body
        .split("?email_id=")
        .nth(1)
        .expect("verification link present");
    let email_id = query
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect::<String>()
        .parse()
        .unwrap();
    let secret_code = query
        .split("secret_code=")
        .nth(1)
        .unwrap()
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric())
        .collect();
    VerifyEmailTxParams {
        email_id,
        secret_code,
    }
}

#[tokio::test(start_paused = true)]
async fn test_registration_to_verified_user() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let registration = Registration::new(
        Arc::clone(&store),
        TaskDistributor::new(Arc::clone(&broker) as _),
    );
    let mailer = Arc::new(RecordingMailer::default());
    let processor = TaskProcessor::new(
        Arc::clone(&broker) as _,
        Handlers {
            send_verify_email: Arc::new(SendVerifyEmailHandler::new(
                Arc::clone(&store),
                Arc::clone(&mailer) as Arc<dyn EmailSender>,
                VerifyEmailConfig::default(),
            )),
        },
        ProcessorConfig::default(),
    );
    let mut schedule = WeightedSchedule::new(&ProcessorConfig::default().queues);
    let shutdown = CancellationToken::new();

    let user = registration
        .register(NewUser::depositor(
            "alice",
            "hash",
            "Alice Smith",
            "alice@example.com",
        ))
        .await
        .unwrap();
    assert!(!user.is_email_verified);

    let tasks = broker.tasks();
    assert_eq!(tasks.len(), 1);
    assert_eq!(tasks[0].kind, TaskKind::SendVerifyEmail);
    assert_eq!(tasks[0].queue, QueueName::Critical);
    assert_eq!(tasks[0].max_retry, 10);

    // Delivery waits for the enqueue delay
    assert!(!processor.process_next(&mut schedule, &shutdown).await.unwrap());
    tokio::time::advance(Duration::from_secs(10)).await;
    assert!(processor.process_next(&mut schedule, &shutdown).await.unwrap());
    assert_eq!(broker.task_state(tasks[0].id), None);

    let email = mailer.sent.lock().unwrap().pop().unwrap();
    assert_eq!(email.to, vec!["alice@example.com".to_string()]);
    let link = link_params(&email);

    let verified = verify_email_tx(store.as_ref(), link.clone()).await.unwrap();
    assert!(verified.user.is_email_verified);
    assert!(verified.verify_email.is_used);

    let replay = verify_email_tx(store.as_ref(), link).await.unwrap_err();
    assert_eq!(replay, LedgerError::InvalidState(INVALID_VERIFICATION.to_string()));

    // A second registration of the same username conflicts and enqueues nothing
    let duplicate = registration
        .register(NewUser::depositor("alice", "hash", "Alice", "other@example.com"))
        .await
        .unwrap_err();
    assert_eq!(duplicate.kind(), ErrorKind::Conflict);
    assert!(broker.tasks().is_empty());
}

#[tokio::test]
async fn test_registration_with_broker_down_creates_no_user() {
    let store = Arc::new(MemoryStore::new());
    let broker = Arc::new(MemoryBroker::new());
    let registration = Registration::new(
        Arc::clone(&store),
        TaskDistributor::new(Arc::clone(&broker) as _),
    );
    broker.set_available(false);

    let error = registration
        .register(NewUser::depositor("bob", "hash", "Bob", "bob@example.com"))
        .await
        .unwrap_err();

    assert_eq!(error.kind(), ErrorKind::Transient);
    let mut tx = store.begin().await.unwrap();
    assert_eq!(tx.get_user("bob").await.unwrap_err().kind(), ErrorKind::NotFound);
    drop(tx);

    broker.set_available(true);
    assert!(broker.tasks().is_empty());
    registration
        .register(NewUser::depositor("bob", "hash", "Bob", "bob@example.com"))
        .await
        .unwrap();
    assert_eq!(broker.tasks().len(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_verification_task_archived_after_max_retry() {
    let store = Arc::new(MemoryStore::new());
    let mut tx = store.begin().await.unwrap();
    tx.create_user(NewUser::depositor("carol", "hash", "Carol", "carol@example.com"))
        .await
        .unwrap();
    tx.commit().await.unwrap();

    let broker = Arc::new(MemoryBroker::new());
    let mailer = Arc::new(RecordingMailer {
        fail_transport: true,
        ..Default::default()
    });
    let observer = Arc::new(RecordingObserver::default());
    let config = ProcessorConfig {
        retry: RetryPolicy {
            base_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(1),
        },
        ..Default::default()
    };
    let processor = TaskProcessor::new(
        Arc::clone(&broker) as _,
        Handlers {
            send_verify_email: Arc::new(SendVerifyEmailHandler::new(
                Arc::clone(&store),
                Arc::clone(&mailer),
                VerifyEmailConfig::default(),
            )),
        },
        config.clone(),
    )
    .with_observer(Arc::clone(&observer) as _);

    let info = TaskDistributor::new(Arc::clone(&broker) as _)
        .enqueue(
            TaskKind::SendVerifyEmail,
            &serde_json::json!({ "username": "carol" }),
            TaskOptions::default().max_retry(3),
        )
        .await
        .unwrap();

    let mut schedule = WeightedSchedule::new(&config.queues);
    let shutdown = CancellationToken::new();
    for _ in 0..50 {
        if broker.task_state(info.id) == Some(TaskState::Archived) {
            break;
        }
        if !processor.process_next(&mut schedule, &shutdown).await.unwrap() {
            tokio::time::advance(Duration::from_millis(5)).await;
        }
    }

    assert_eq!(broker.task_state(info.id), Some(TaskState::Archived));
    assert_eq!(mailer.attempts.load(Ordering::SeqCst), 4);
    let failures = observer.failures.lock().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0].0.retried, 3);
    assert!(failures[0].1.is_retryable());
    let archived = broker.archived();
    assert!(archived[0].error.contains("connection refused"));
}
