use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use futures_util::{stream, StreamExt};
use http::StatusCode;
use parking_lot::Mutex;
use tokio::io::AsyncReadExt;

use dog_transfer::{
    download_to_writer, ByteStream, HttpGetter, HttpGetterInfo, LiveResponse, MemoryBlobStore,
    NetworkError, OpContext, RetryReader, RetryReaderOptions, TransferAdapter, TransferError,
};

type Notes = Arc<Mutex<Vec<(usize, u64, bool)>>>;

fn body(parts: Vec<io::Result<Bytes>>) -> ByteStream {
    Box::pin(stream::iter(parts))
}

fn broken_body() -> ByteStream {
    body(vec![Err(NetworkError::temporary("connection reset by peer").into())])
}

/// Options that record `(failure_count, offset, will_retry)` for every failed read
fn recording_options(max_retry_requests: usize) -> (RetryReaderOptions, Notes) {
    let notes: Notes = Arc::new(Mutex::new(Vec::new()));
    let sink = notes.clone();
    let options = RetryReaderOptions::new(max_retry_requests).with_failed_read_notifier(move |failed| {
        sink.lock().push((failed.failure_count, failed.offset, failed.will_retry));
    });
    (options, notes)
}

type Respond = Box<dyn Fn() -> LiveResponse + Send + Sync>;

fn respond<F>(make: F) -> Respond
where
    F: Fn() -> LiveResponse + Send + Sync + 'static,
{
    Box::new(make)
}

/// Getter that serves `responses` in order and counts its calls
fn scripted_getter(
    responses: Vec<Respond>,
) -> (Arc<dyn HttpGetter>, Arc<AtomicUsize>, Arc<Mutex<Vec<HttpGetterInfo>>>) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = Arc::new(Mutex::new(Vec::new()));
    let (counter, log) = (calls.clone(), seen.clone());
    let responses = Arc::new(responses);
    let getter = move |_ctx: OpContext, info: HttpGetterInfo| {
        let n = counter.fetch_add(1, Ordering::SeqCst);
        log.lock().push(info);
        let responses = responses.clone();
        async move {
            let make = responses
                .get(n)
                .ok_or_else(|| TransferError::Internal(format!("unexpected GET #{}", n + 1)))?;
            Ok::<_, TransferError>(make())
        }
    };
    (Arc::new(getter), calls, seen)
}

/// R1. A temporary failure is retried once and the read succeeds
#[tokio::test]
async fn test_temporary_failure_is_resumed() {
    let (getter, calls, seen) = scripted_getter(vec![
        respond(|| LiveResponse::new(broken_body())),
        respond(|| LiveResponse::new(body(vec![Ok(Bytes::from_static(b"payload"))]))),
    ]);
    let (options, notes) = recording_options(3);
    let mut reader = RetryReader::new(OpContext::new(), None, HttpGetterInfo::to_end(), options, getter);

    let mut buf = [0u8; 16];
    let n = reader.read(&mut buf).await.unwrap();

    assert_eq!(&buf[..n], b"payload");
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(notes.lock().as_slice(), &[(1, 0, true)]);
    assert_eq!(seen.lock()[1].offset, 0);
}

/// R2. Persistent failures make N + 1 attempts and then surface the error
#[tokio::test]
async fn test_persistent_failures_exhaust_retries() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let getter: Arc<dyn HttpGetter> = Arc::new(move |_ctx: OpContext, _info: HttpGetterInfo| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Ok::<_, TransferError>(LiveResponse::new(broken_body())) }
    });
    let (options, notes) = recording_options(3);
    let mut reader = RetryReader::new(OpContext::new(), None, HttpGetterInfo::to_end(), options, getter);

    let err = reader.read(&mut [0u8; 8]).await.unwrap_err();

    assert!(matches!(err, TransferError::Io { .. }), "{err:?}");
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    let notes = notes.lock();
    let counts: Vec<usize> = notes.iter().map(|(count, _, _)| *count).collect();
    assert_eq!(counts, vec![1, 2, 3, 4]);
    assert!(notes[..3].iter().all(|(_, _, retry)| *retry));
    assert!(!notes[3].2);
}

/// R3. The try budget is per read call, not per reader
#[tokio::test]
async fn test_retry_budget_resets_between_reads() {
    let (getter, calls, seen) = scripted_getter(vec![
        respond(|| LiveResponse::new(body(vec![
            Ok(Bytes::from_static(b"ab")),
            Err(NetworkError::temporary("reset").into()),
        ]))),
        respond(|| LiveResponse::new(body(vec![
            Ok(Bytes::from_static(b"cd")),
            Err(NetworkError::timeout("stalled").into()),
        ]))),
        respond(|| LiveResponse::new(body(vec![Ok(Bytes::from_static(b"ef"))]))),
    ]);
    let (options, notes) = recording_options(1);
    let mut reader = RetryReader::new(
        OpContext::new(),
        None,
        HttpGetterInfo::new(0, Some(6)),
        options,
        getter,
    );

    let mut out = Vec::new();
    reader.copy_to(&mut out).await.unwrap();

    assert_eq!(out, b"abcdef");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert_eq!(notes.lock().as_slice(), &[(1, 2, true), (1, 4, true)]);
    let offsets: Vec<(u64, Option<u64>)> = seen.lock().iter().map(|i| (i.offset, i.count)).collect();
    assert_eq!(offsets, vec![(0, Some(6)), (2, Some(4)), (4, Some(2))]);
}

/// R4. A bounded range ends with EOF and no extra GET
#[tokio::test]
async fn test_bounded_range_ends_without_extra_request() {
    let (getter, calls, _) = scripted_getter(vec![respond(|| {
        LiveResponse::new(body(vec![Ok(Bytes::from_static(b"12345"))]))
    })]);
    let mut reader = RetryReader::new(
        OpContext::new(),
        None,
        HttpGetterInfo::new(10, Some(5)),
        RetryReaderOptions::new(2),
        getter,
    );

    let mut buf = [0u8; 5];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 5);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    assert_eq!(reader.read(&mut buf).await.unwrap(), 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// R5. Errors from the getter itself are returned without retrying
#[tokio::test]
async fn test_getter_errors_are_not_retried() {
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = calls.clone();
    let getter: Arc<dyn HttpGetter> = Arc::new(move |_ctx: OpContext, _info: HttpGetterInfo| {
        counter.fetch_add(1, Ordering::SeqCst);
        async { Err::<LiveResponse, _>(TransferError::status(StatusCode::NOT_FOUND)) }
    });
    let (options, notes) = recording_options(5);
    let mut reader = RetryReader::new(OpContext::new(), None, HttpGetterInfo::to_end(), options, getter);

    let err = reader.read(&mut [0u8; 4]).await.unwrap_err();

    assert!(matches!(err, TransferError::Status { status: StatusCode::NOT_FOUND, .. }));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(notes.lock().is_empty());
}

/// R6. A forced retry abandons the live response and resumes at the current offset
#[tokio::test]
async fn test_force_retry_resumes_at_offset() {
    let store = Arc::new(MemoryBlobStore::new().with_piece_size(4));
    let data: Vec<u8> = (0u8..64).collect();
    store.put_blob(Bytes::from(data.clone()));
    let (options, notes) = recording_options(2);
    let adapter = TransferAdapter::from_store(store.clone()).with_reader_options(options);
    let ctx = OpContext::new();

    let mut reader = adapter.open(&ctx, 0, None).await.unwrap();
    let mut head = [0u8; 4];
    assert_eq!(reader.read(&mut head).await.unwrap(), 4);

    let handle = reader.force_retry_handle().expect("memory responses are cancellable");
    handle.force_retry();

    let mut rest = Vec::new();
    reader.copy_to(&mut rest).await.unwrap();

    assert_eq!(&head[..], &data[..4]);
    assert_eq!(rest, &data[4..]);
    assert_eq!(store.get_calls(), 2);
    assert_eq!(notes.lock().as_slice(), &[(1, 4, true)]);
}

/// R7. The forced flag belongs to the cancelled response only
#[tokio::test]
async fn test_forced_flag_cleared_by_new_response() {
    let (getter, calls, _) = scripted_getter(vec![respond(|| {
        LiveResponse::cancellable(body(vec![
            Ok(Bytes::from_static(b"more")),
            Err(io::Error::other("checksum mismatch")),
        ]))
    })]);
    let initial = LiveResponse::cancellable(body(vec![
        Ok(Bytes::from_static(b"head")),
        Ok(Bytes::from_static(b"never read")),
    ]));
    let mut reader = RetryReader::new(
        OpContext::new(),
        Some(initial),
        HttpGetterInfo::to_end(),
        RetryReaderOptions::new(5),
        getter,
    );

    let mut buf = [0u8; 4];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
    reader.force_retry_handle().unwrap().force_retry();

    assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf, b"more");
    let err = reader.read(&mut buf).await.unwrap_err();
    assert!(err.to_string().contains("checksum mismatch"));
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

/// R8. A cancelled context stops a read that is waiting on the body
#[tokio::test]
async fn test_cancelled_context_interrupts_read() {
    let ctx = OpContext::new();
    let pending: ByteStream = Box::pin(stream::pending::<io::Result<Bytes>>());
    let (getter, _, _) = scripted_getter(vec![]);
    let mut reader = RetryReader::new(
        ctx.clone(),
        Some(LiveResponse::new(pending)),
        HttpGetterInfo::to_end(),
        RetryReaderOptions::new(3),
        getter,
    );

    let canceller = ctx.clone();
    tokio::spawn(async move {
        tokio::task::yield_now().await;
        canceller.cancel();
    });

    let err = reader.read(&mut [0u8; 4]).await.unwrap_err();
    assert!(matches!(err, TransferError::Canceled));
}

/// R9. The reader plugs into tokio I/O as an AsyncRead
#[tokio::test]
async fn test_async_read_adapter_delivers_range() {
    let store = Arc::new(MemoryBlobStore::new().with_piece_size(7));
    let data: Vec<u8> = (0..300u32).map(|i| (i % 256) as u8).collect();
    store.put_blob(Bytes::from(data.clone()));
    let adapter = TransferAdapter::from_store(store);
    let ctx = OpContext::new();

    let reader = adapter.open(&ctx, 100, Some(150)).await.unwrap();
    let mut out = Vec::new();
    reader.into_async_read().read_to_end(&mut out).await.unwrap();
    assert_eq!(out, &data[100..250]);

    let reader = adapter.open(&ctx, 250, None).await.unwrap();
    let mut tail = Vec::new();
    let copied = download_to_writer(reader, &mut tail).await.unwrap();
    assert_eq!(copied, 50);
    assert_eq!(tail, &data[250..]);
}

/// R10. Opening past the end fails on the first GET
#[tokio::test]
async fn test_open_out_of_range_fails_early() {
    let store = Arc::new(MemoryBlobStore::new());
    store.put_blob(Bytes::from_static(b"short"));
    let adapter = TransferAdapter::from_store(store);

    let err = adapter.open(&OpContext::new(), 5, None).await.unwrap_err();
    assert!(matches!(
        err,
        TransferError::Status { status: StatusCode::RANGE_NOT_SATISFIABLE, .. }
    ));
}

/// R11. Another task can force a retry while a read waits on a stalled body
#[tokio::test]
async fn test_force_retry_from_another_task_unblocks_read() {
    let (getter, calls, seen) = scripted_getter(vec![respond(|| {
        LiveResponse::cancellable(body(vec![Ok(Bytes::from_static(b"tail"))]))
    })]);
    let stalled: ByteStream = Box::pin(
        stream::iter(vec![Ok(Bytes::from_static(b"head"))]).chain(stream::pending::<io::Result<Bytes>>()),
    );
    let (options, notes) = recording_options(2);
    let mut reader = RetryReader::new(
        OpContext::new(),
        Some(LiveResponse::cancellable(stalled)),
        HttpGetterInfo::to_end(),
        options,
        getter,
    );

    let mut buf = [0u8; 8];
    assert_eq!(reader.read(&mut buf).await.unwrap(), 4);
    assert_eq!(&buf[..4], b"head");

    let handle = reader.force_retry_handle().expect("response is cancellable");
    let watchdog = tokio::spawn(async move {
        tokio::task::yield_now().await;
        handle.force_retry();
    });

    let n = reader.read(&mut buf).await.unwrap();
    watchdog.await.unwrap();

    assert_eq!(&buf[..n], b"tail");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(seen.lock()[0].offset, 4);
    assert_eq!(notes.lock().as_slice(), &[(1, 4, true)]);
}
