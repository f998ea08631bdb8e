#![cfg(feature = "test-utils")]

use chrono::{TimeZone, Utc};
use library_store::test_utils::{MemoryEvent, MemoryStore};
use library_store::{Bind, Field, Record, Runner, SqlValue, Store, StoreError};
use tokio_util::sync::CancellationToken;

async fn open_store(mem: &MemoryStore) -> Store {
    let store = Store::initialize_memory("master", mem.clone())
        .await
        .expect("bootstrap against a UTC-scripted store succeeds");
    mem.clear_events();
    store
}

#[derive(Default, Debug, PartialEq)]
struct Book {
    book_id: String,
    book_name: String,
    copies: i64,
}

impl Record for Book {
    const FIELDS: &'static [Field<Self>] = &[
        Field {
            column: "BookID",
            bind: Bind::Text(|b, v| b.book_id = v),
        },
        Field {
            column: "BookName",
            bind: Bind::Text(|b, v| b.book_name = v),
        },
        Field {
            column: "Copies",
            bind: Bind::Int(|b, v| b.copies = v),
        },
    ];
}

#[tokio::test]
async fn reader_drains_rows_and_reads_typed_values() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    let borrowed = Utc.with_ymd_and_hms(2024, 3, 1, 9, 0, 0).unwrap();
    mem.script_query(
        "SELECT BookID, Copies, BorrowedAt FROM book",
        &["BookID", "Copies", "BorrowedAt"],
        vec![
            vec![
                SqlValue::Text("b1".into()),
                SqlValue::Int(3),
                SqlValue::Timestamp(borrowed),
            ],
            vec![
                SqlValue::Bytes(b"b2".to_vec()),
                SqlValue::Bytes(b"42".to_vec()),
                SqlValue::Text("2024-03-01T09:00:00Z".into()),
            ],
        ],
    );

    let mut reader = runner
        .query("SELECT BookID, Copies, BorrowedAt FROM book", &[])
        .await
        .unwrap();
    assert_eq!(reader.columns(), ["BookID", "Copies", "BorrowedAt"]);

    assert!(reader.scan_next().await);
    assert_eq!(reader.read_string_at(0).unwrap(), "b1");
    assert_eq!(reader.read_int64_at(1).unwrap(), 3);
    assert_eq!(reader.read_timestamp_at(2).unwrap(), borrowed);

    // Byte payloads coerce through the same accessors.
    assert!(reader.scan_next().await);
    assert_eq!(reader.read_string_at(0).unwrap(), "b2");
    assert_eq!(reader.read_int64_at(1).unwrap(), 42);
    assert_eq!(reader.read_timestamp_at(2).unwrap(), borrowed);

    assert!(!reader.scan_next().await);
    assert!(reader.take_error().is_none());
}

#[tokio::test]
async fn reader_accessor_failures_match_the_value_rules() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.script_query(
        "SELECT Copies, BookName FROM book WHERE BookID = $1",
        &["Copies", "BookName"],
        vec![vec![SqlValue::Null, SqlValue::Bytes(b"12x".to_vec())]],
    );

    let mut reader = runner
        .query("SELECT Copies, BookName FROM book WHERE BookID = $1", &[
            SqlValue::Text("b1".into()),
        ])
        .await
        .unwrap();

    assert!(reader.scan_next().await);
    assert!(matches!(
        reader.read_int64_at(0),
        Err(StoreError::NullValue { column: 0 })
    ));
    assert!(matches!(
        reader.read_int64_at(1),
        Err(StoreError::TypeMismatch { column: 1, .. })
    ));
    assert_eq!(reader.read_string_at(1).unwrap(), "12x");
}

#[tokio::test]
async fn mid_drain_failure_stops_the_scan_and_is_latched() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.script_query_failing(
        "SELECT BookID FROM book",
        &["BookID"],
        vec![vec![SqlValue::Text("b1".into())]],
        "connection reset during scan",
    );

    let mut reader = runner.query("SELECT BookID FROM book", &[]).await.unwrap();
    assert!(reader.scan_next().await);
    // The second advance hits the failure: it reports "no more rows" and the
    // error waits for the post-drain check.
    assert!(!reader.scan_next().await);
    assert!(reader.last_error().is_some());
    // Latched errors also keep later advances inert.
    assert!(!reader.scan_next().await);
    match reader.take_error() {
        Some(StoreError::Execution(message)) => {
            assert_eq!(message, "connection reset during scan");
        }
        other => panic!("expected the scan error, got {other:?}"),
    }
}

#[tokio::test]
async fn populate_fills_matching_fields_and_ignores_extra_columns() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.script_query(
        "SELECT * FROM book WHERE BookID = $1",
        &["BookID", "BookName", "Extra"],
        vec![vec![
            SqlValue::Text("b1".into()),
            SqlValue::Text("Go".into()),
            SqlValue::Text("x".into()),
        ]],
    );

    let mut reader = runner
        .query("SELECT * FROM book WHERE BookID = $1", &[SqlValue::Text(
            "b1".into(),
        )])
        .await
        .unwrap();
    assert!(reader.scan_next().await);

    let mut book = Book::default();
    reader.populate(&mut book).unwrap();
    assert_eq!(book, Book {
        book_id: "b1".into(),
        book_name: "Go".into(),
        copies: 0,
    });
}

#[tokio::test]
async fn query_row_returns_the_first_row_or_none() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.script_query(
        "SELECT BookID, BookName FROM book WHERE BookID = $1",
        &["BookID", "BookName"],
        vec![vec![
            SqlValue::Text("b1".into()),
            SqlValue::Text("Go".into()),
        ]],
    );

    let row = runner
        .query_row("SELECT BookID, BookName FROM book WHERE BookID = $1", &[
            SqlValue::Text("b1".into()),
        ])
        .await
        .unwrap()
        .expect("one row scripted");
    assert_eq!(row.read_string_at(1).unwrap(), "Go");
    assert_eq!(
        row.get("BookID"),
        Some(&SqlValue::Text("b1".into()))
    );

    let mut book = Book::default();
    row.populate(&mut book).unwrap();
    assert_eq!(book.book_name, "Go");

    let missing = runner
        .query_row("SELECT BookID FROM book WHERE BookID = $1", &[
            SqlValue::Text("nope".into()),
        ])
        .await
        .unwrap();
    assert!(missing.is_none());
}

#[tokio::test]
async fn single_value_helpers_read_the_first_column() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.script_query(
        "SELECT count(*) FROM loan WHERE UserID = $1",
        &["count"],
        vec![vec![SqlValue::Int(3)]],
    );
    let count = runner
        .query_int64_value("SELECT count(*) FROM loan WHERE UserID = $1", &[
            SqlValue::Text("u1".into()),
        ])
        .await
        .unwrap();
    assert_eq!(count, Some(3));

    mem.script_query(
        "SELECT BookName FROM book WHERE BookID = $1",
        &["BookName"],
        vec![vec![SqlValue::Text("Go".into())]],
    );
    let name = runner
        .query_string_value("SELECT BookName FROM book WHERE BookID = $1", &[
            SqlValue::Text("b1".into()),
        ])
        .await
        .unwrap();
    assert_eq!(name.as_deref(), Some("Go"));

    // No row matched.
    mem.script_query("SELECT Due FROM loan WHERE LoanID = $1", &["Due"], vec![]);
    let due = runner
        .query_timestamp_value("SELECT Due FROM loan WHERE LoanID = $1", &[
            SqlValue::Text("l1".into()),
        ])
        .await
        .unwrap();
    assert_eq!(due, None);
}

#[tokio::test]
async fn prepared_statements_replay_with_normal_routing() {
    let mem = MemoryStore::new();
    let store = open_store(&mem).await;
    let mut runner = Runner::new(&store, CancellationToken::new());

    mem.script_query(
        "SELECT BookName FROM book WHERE BookID = $1",
        &["BookName"],
        vec![vec![SqlValue::Text("Go".into())]],
    );

    let stmt = runner
        .prepare("SELECT BookName FROM book WHERE BookID = $1")
        .await
        .unwrap();
    assert!(mem
        .events()
        .iter()
        .any(|e| matches!(e, MemoryEvent::Prepare { .. })));

    let mut reader = runner
        .query_prepared(&stmt, &[SqlValue::Text("b1".into())])
        .await
        .unwrap();
    assert!(reader.scan_next().await);
    assert_eq!(reader.read_string_at(0).unwrap(), "Go");

    // Preparation failures surface early.
    mem.fail_statement("SELECT nonsense", "syntax error at or near \"nonsense\"");
    let err = runner.prepare("SELECT nonsense").await.unwrap_err();
    assert!(matches!(err, StoreError::Execution(_)));
}
