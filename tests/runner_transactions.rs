#![cfg(feature = "test-utils")]

use library_store::test_utils::{MemoryEvent, MemoryStore};
use library_store::{Isolation, Runner, SqlValue, Store, StoreError, TxOptions};
use tokio_util::sync::CancellationToken;

async fn open_store(mem: &MemoryStore) -> Store {
    let store = Store::initialize_memory("master", mem.clone())
        .await
        .expect("bootstrap against a UTC-scripted store succeeds");
    mem.clear_events();
    store
}

#[tokio::test]
async fn single_level_transact_commits_once() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.script_execute("UPDATE book SET Copies = Copies - 1", 1);
    let affected = runner
        .transact(TxOptions::default(), |run| {
            Box::pin(async move {
                assert!(run.in_transaction());
                run.execute("UPDATE book SET Copies = Copies - 1", &[]).await
            })
        })
        .await
        .unwrap();

    assert_eq!(affected, 1);
    assert!(!runner.in_transaction());
    assert_eq!(mem.begin_count(), 1);
    assert_eq!(mem.commit_count(), 1);
    assert_eq!(mem.rollback_count(), 0);
}

#[tokio::test]
async fn nested_levels_share_one_transaction_and_commit_once() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    let outer = TxOptions {
        isolation: Some(Isolation::RepeatableRead),
        read_only: false,
    };
    // Nested options are ignored; only the outer BEGIN reaches the store.
    let inner = TxOptions {
        isolation: Some(Isolation::Serializable),
        read_only: true,
    };

    runner
        .transact(outer, |run| {
            Box::pin(async move {
                run.transact(inner, |run| {
                    Box::pin(async move {
                        run.transact(TxOptions::default(), |run| {
                            Box::pin(async move {
                                assert!(run.in_transaction());
                                run.execute("INSERT INTO loan (BookID) VALUES ($1)", &[
                                    SqlValue::Text("b1".into()),
                                ])
                                .await
                                .map(|_| ())
                            })
                        })
                        .await
                    })
                })
                .await
            })
        })
        .await
        .unwrap();

    assert!(!runner.in_transaction());
    assert_eq!(mem.begin_count(), 1);
    assert_eq!(mem.commit_count(), 1);
    let begins: Vec<String> = mem
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MemoryEvent::Begin { sql, .. } => Some(sql),
            _ => None,
        })
        .collect();
    assert_eq!(begins, vec!["BEGIN ISOLATION LEVEL REPEATABLE READ"]);
}

#[tokio::test]
async fn inner_failure_rolls_back_the_whole_transaction_once() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.fail_statement(
        "INSERT INTO loan (BookID) VALUES ($1)",
        "duplicate key value violates unique constraint",
    );

    let err = runner
        .transact(TxOptions::default(), |run| {
            Box::pin(async move {
                run.transact(TxOptions::default(), |run| {
                    Box::pin(async move {
                        run.execute("INSERT INTO loan (BookID) VALUES ($1)", &[
                            SqlValue::Text("b1".into()),
                        ])
                        .await
                        .map(|_| ())
                    })
                })
                .await
            })
        })
        .await
        .unwrap_err();

    match err {
        StoreError::Execution(message) => {
            assert_eq!(message, "duplicate key value violates unique constraint");
        }
        other => panic!("expected the statement error, got {other:?}"),
    }
    assert!(!runner.in_transaction());
    assert_eq!(mem.rollback_count(), 1);
    assert_eq!(mem.commit_count(), 0);

    // The runner stays usable; the next statement routes back to the pool.
    let before = mem.lease_count();
    runner.execute("SELECT 1", &[]).await.unwrap();
    assert_eq!(mem.lease_count(), before + 1);
}

#[tokio::test]
async fn transaction_pins_all_statements_to_one_connection() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    runner
        .transact(TxOptions::default(), |run| {
            Box::pin(async move {
                run.execute("UPDATE a SET x = 1", &[]).await?;
                run.execute("UPDATE b SET y = 2", &[]).await?;
                Ok(())
            })
        })
        .await
        .unwrap();

    assert_eq!(mem.lease_count(), 1);
    let conns: Vec<usize> = mem
        .events()
        .into_iter()
        .filter_map(|e| match e {
            MemoryEvent::Begin { conn, .. }
            | MemoryEvent::Statement { conn, .. }
            | MemoryEvent::Commit { conn } => Some(conn),
            _ => None,
        })
        .collect();
    assert!(conns.windows(2).all(|w| w[0] == w[1]));
    assert!(matches!(
        mem.events().last(),
        Some(MemoryEvent::Release { .. })
    ));
}

#[tokio::test]
async fn commit_failure_surfaces_cancellation_when_the_token_fired() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let cancel = CancellationToken::new();
    let mut runner = Runner::new(&store, cancel.clone());

    mem.fail_next_commit("transaction already completed");
    let body_cancel = cancel.clone();
    let result: Result<(), StoreError> = runner
        .transact(TxOptions::default(), move |_run| {
            Box::pin(async move {
                // The request deadline fires while the body is still running;
                // the stale commit is then reported as a cancellation.
                body_cancel.cancel();
                Ok(())
            })
        })
        .await;

    assert!(matches!(result, Err(StoreError::Canceled)));
    assert!(!runner.in_transaction());
}

#[tokio::test]
async fn commit_failure_without_cancellation_keeps_the_store_error() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.fail_next_commit("server closed the connection unexpectedly");
    let result: Result<(), StoreError> = runner
        .transact(TxOptions::default(), |_run| Box::pin(async move { Ok(()) }))
        .await;

    match result {
        Err(StoreError::Execution(message)) => {
            assert_eq!(message, "server closed the connection unexpectedly");
        }
        other => panic!("expected the commit error, got {other:?}"),
    }
    // The connection's state is unknown after a failed commit; it must not
    // return to the pool.
    assert!(mem
        .events()
        .iter()
        .any(|e| matches!(e, MemoryEvent::Detach { .. })));
}
