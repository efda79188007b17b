//! End-to-end session tests over an in-memory duplex transport.

use std::time::{Duration, Instant};

use skein::{Session, SessionError};
use tokio::io::{duplex, DuplexStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;

fn pair() -> (Session, Session) {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init();
    let (a, b) = duplex(64 * 1024);
    (Session::new(a), Session::new(b))
}

/// Sends `0..n` on net-chan `name`, then closes it.
fn spawn_producer(session: Session, name: String, n: u32) -> JoinHandle<()> {
    tokio::spawn(async move {
        let (tx, rx) = mpsc::channel(15);
        session.open_send(&name, rx).expect("open_send");
        for i in 0..n {
            tokio::select! {
                result = tx.send(i) => result.expect("net-chan closed under us"),
                _ = session.done() => panic!("session failed: {:?}", session.err()),
            }
        }
        // Dropping the sender closes the net-chan.
    })
}

/// Drains net-chan `name` into a vec until the peer closes it.
fn spawn_consumer(session: Session, name: String, buf_cap: usize) -> JoinHandle<Vec<u32>> {
    tokio::spawn(async move {
        let (tx, mut rx) = mpsc::channel(8);
        session.open_recv(&name, tx, buf_cap).expect("open_recv");
        let mut got = Vec::new();
        loop {
            tokio::select! {
                item = rx.recv() => match item {
                    Some(i) => got.push(i),
                    None => break,
                },
                _ = session.done() => panic!("session failed: {:?}", session.err()),
            }
        }
        got
    })
}

fn expect_sorted(got: &[u32], n: u32) {
    assert_eq!(got.len() as u32, n, "value count");
    for (i, v) in got.iter().enumerate() {
        assert_eq!(*v, i as u32, "values must arrive in order");
    }
}

#[tokio::test]
async fn send_then_recv() {
    let (a, b) = pair();
    let producer = spawn_producer(a.clone(), "integers".into(), 100);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let consumer = spawn_consumer(b.clone(), "integers".into(), 60);

    producer.await.unwrap();
    let got = timeout(Duration::from_secs(10), consumer)
        .await
        .unwrap()
        .unwrap();
    expect_sorted(&got, 100);
    assert!(a.err().is_none());
    assert!(b.err().is_none());
}

#[tokio::test]
async fn recv_then_send() {
    let (a, b) = pair();
    let consumer = spawn_consumer(b.clone(), "integers".into(), 60);
    tokio::time::sleep(Duration::from_millis(50)).await;
    let producer = spawn_producer(a.clone(), "integers".into(), 100);

    producer.await.unwrap();
    let got = timeout(Duration::from_secs(10), consumer)
        .await
        .unwrap()
        .unwrap();
    expect_sorted(&got, 100);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn many_chans_both_directions() {
    let (a, b) = pair();
    let mut producers = Vec::new();
    let mut consumers = Vec::new();
    for i in 0..100 {
        let name = format!("integers{i}");
        // Even chans flow a -> b, odd chans b -> a.
        let (producer_side, consumer_side) = if i % 2 == 0 {
            (a.clone(), b.clone())
        } else {
            (b.clone(), a.clone())
        };
        producers.push(spawn_producer(producer_side, name.clone(), 400));
        consumers.push(spawn_consumer(consumer_side, name, 60));
    }
    for producer in producers {
        producer.await.unwrap();
    }
    for consumer in consumers {
        let got = timeout(Duration::from_secs(30), consumer)
            .await
            .unwrap()
            .unwrap();
        expect_sorted(&got, 400);
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn tight_credit_window() {
    // A window of 8 against 1000 values: if the credit scheme is broken
    // this either deadlocks (stuck at zero) or trips a violation.
    let (a, b) = pair();
    let producer = spawn_producer(a.clone(), "integers".into(), 1000);
    let consumer = spawn_consumer(b.clone(), "integers".into(), 8);

    producer.await.unwrap();
    let got = timeout(Duration::from_secs(30), consumer)
        .await
        .expect("credit flow deadlocked")
        .unwrap();
    expect_sorted(&got, 1000);
    assert!(a.err().is_none());
    assert!(b.err().is_none());
}

#[tokio::test]
async fn same_name_opposite_directions_coexist() {
    let (a, b) = pair();
    let ab = spawn_producer(a.clone(), "both".into(), 50);
    let ba = spawn_producer(b.clone(), "both".into(), 70);
    let at_b = spawn_consumer(b.clone(), "both".into(), 16);
    let at_a = spawn_consumer(a.clone(), "both".into(), 16);

    ab.await.unwrap();
    ba.await.unwrap();
    expect_sorted(&timeout(Duration::from_secs(10), at_b).await.unwrap().unwrap(), 50);
    expect_sorted(&timeout(Duration::from_secs(10), at_a).await.unwrap().unwrap(), 70);
}

const SIZE_LIMIT: usize = 2000;
const NUM_SLICES: usize = 20;

#[tokio::test]
async fn oversized_message_kills_the_receiving_session() {
    let (conn_a, conn_b) = duplex(64 * 1024);
    let a = Session::new(conn_a);
    let b = Session::with_msg_size_limit(conn_b, SIZE_LIMIT);

    // Window of 1, so slices arrive one frame at a time and only the last
    // frame is oversized.
    let (sink, mut user_rx) = mpsc::channel::<Vec<u8>>(1);
    b.open_recv("slices", sink, 1).unwrap();

    let producer = {
        let a = a.clone();
        tokio::spawn(async move {
            let (tx, rx) = mpsc::channel::<Vec<u8>>(1);
            a.open_send("slices", rx).unwrap();
            let small = vec![0u8; SIZE_LIMIT - 30];
            let big = vec![0u8; SIZE_LIMIT + 5];
            for i in 1..=NUM_SLICES {
                let slice = if i == NUM_SLICES { big.clone() } else { small.clone() };
                tokio::select! {
                    result = tx.send(slice) => {
                        if result.is_err() {
                            return;
                        }
                    }
                    // The peer tears down when the big slice lands; that
                    // is the expected outcome here.
                    _ = a.done() => return,
                }
            }
        })
    };

    let mut received = 0;
    while let Some(slice) = user_rx.recv().await {
        assert_eq!(slice.len(), SIZE_LIMIT - 30);
        received += 1;
    }
    assert_eq!(received, NUM_SLICES - 1, "all but the oversized slice arrive");

    timeout(Duration::from_secs(2), b.done()).await.unwrap();
    let err = b.err().expect("error latched after done");
    assert!(
        err.to_string().contains("too big"),
        "unexpected error: {err}"
    );

    // The producing side is told why its peer went away.
    timeout(Duration::from_secs(2), a.done()).await.unwrap();
    let err = a.err().expect("error latched after done");
    assert!(matches!(err, SessionError::Peer(_)));
    assert!(err.to_string().contains("too big"));

    producer.await.unwrap();
}

#[tokio::test]
async fn peer_error_propagates() {
    let (a, b) = pair();
    timeout(Duration::from_secs(2), a.quit_with(SessionError::app("boom")))
        .await
        .unwrap();

    timeout(Duration::from_secs(2), b.done()).await.unwrap();
    match b.err() {
        Some(SessionError::Peer(msg)) => assert!(msg.contains("boom")),
        other => panic!("expected Peer, got {other:?}"),
    }
    match a.err() {
        Some(SessionError::App(msg)) => assert_eq!(msg, "boom"),
        other => panic!("expected App, got {other:?}"),
    }
}

#[tokio::test]
async fn orderly_quit_ends_both_sides() {
    let (a, b) = pair();
    timeout(Duration::from_secs(2), b.quit()).await.unwrap();

    timeout(Duration::from_secs(2), a.done()).await.unwrap();
    assert!(matches!(a.err(), Some(SessionError::EndOfSession)));
    assert!(matches!(b.err(), Some(SessionError::EndOfSession)));
    // The latched error is stable.
    assert!(matches!(b.err(), Some(SessionError::EndOfSession)));
    assert!(b.is_terminated());
}

#[tokio::test]
async fn quit_completes_against_an_unresponsive_peer() {
    // A peer that never reads: the goodbye cannot be flushed, so quit
    // must fall back to force-closing once the grace period expires.
    let (conn_a, conn_b) = duplex(16);
    let a = Session::new(conn_a);
    let _peer_refuses_to_read = conn_b;

    let started = Instant::now();
    timeout(Duration::from_secs(3), a.quit())
        .await
        .expect("quit must return within the grace period");
    let elapsed = started.elapsed();
    assert!(elapsed >= Duration::from_millis(900), "returned too early: {elapsed:?}");
    assert!(matches!(a.err(), Some(SessionError::EndOfSession)));
}

#[tokio::test]
async fn quit_is_idempotent_and_concurrent() {
    let (a, _b) = pair();
    let first = {
        let a = a.clone();
        tokio::spawn(async move { a.quit().await })
    };
    timeout(Duration::from_secs(2), a.quit()).await.unwrap();
    timeout(Duration::from_secs(2), first).await.unwrap().unwrap();
    assert!(matches!(a.err(), Some(SessionError::EndOfSession)));
}

#[tokio::test]
async fn no_error_before_termination() {
    let (a, b) = pair();
    assert!(a.err().is_none());
    assert!(!a.is_terminated());
    tokio::select! {
        _ = a.done() => panic!("done resolved on a healthy session"),
        _ = tokio::time::sleep(Duration::from_millis(50)) => {}
    }
    assert!(b.err().is_none());
}

#[tokio::test]
async fn double_open_fails_without_poisoning_the_session() {
    let (a, b) = pair();
    let (_tx1, rx1) = mpsc::channel::<u32>(1);
    let (_tx2, rx2) = mpsc::channel::<u32>(1);
    a.open_send("x", rx1).unwrap();
    let err = a.open_send("x", rx2).unwrap_err();
    assert!(err.to_string().contains("already open"));

    // The session keeps working and no error was latched.
    let producer = spawn_producer(a.clone(), "y".into(), 10);
    let consumer = spawn_consumer(b.clone(), "y".into(), 4);
    producer.await.unwrap();
    let got = timeout(Duration::from_secs(5), consumer)
        .await
        .unwrap()
        .unwrap();
    expect_sorted(&got, 10);
    assert!(a.err().is_none());
}

#[tokio::test]
async fn open_validation() {
    let (a, _b) = pair();
    let long_name = "n".repeat(501);

    let (_tx, rx) = mpsc::channel::<u32>(1);
    let err = a.open_send(&long_name, rx).unwrap_err();
    assert!(err.to_string().contains("name"));

    let (tx, _rx) = mpsc::channel::<u32>(1);
    let err = a.open_recv(&long_name, tx.clone(), 4).unwrap_err();
    assert!(err.to_string().contains("name"));

    let err = a.open_recv("ok", tx, 0).unwrap_err();
    assert!(err.to_string().contains("at least 1"));
    assert!(a.err().is_none());
}

#[tokio::test]
async fn values_survive_a_close_racing_the_drain() {
    // Close the sending queue while values are still in flight; every one
    // of them must be delivered before the receiving queue closes.
    let (a, b) = pair();
    let (tx, rx) = mpsc::channel::<u32>(500);
    a.open_send("burst", rx).unwrap();
    for i in 0..500 {
        tx.send(i).await.unwrap();
    }
    drop(tx);

    let consumer = spawn_consumer(b.clone(), "burst".into(), 7);
    let got = timeout(Duration::from_secs(10), consumer)
        .await
        .unwrap()
        .unwrap();
    expect_sorted(&got, 500);
}

fn transport_pair() -> (DuplexStream, DuplexStream) {
    duplex(64 * 1024)
}

#[tokio::test]
async fn sessions_are_independent_per_connection() {
    // Two unrelated connections, same names: no cross-talk.
    let (a1, b1) = transport_pair();
    let (a2, b2) = transport_pair();
    let (s1a, s1b) = (Session::new(a1), Session::new(b1));
    let (s2a, s2b) = (Session::new(a2), Session::new(b2));

    let p1 = spawn_producer(s1a, "shared-name".into(), 30);
    let p2 = spawn_producer(s2a, "shared-name".into(), 60);
    let c1 = spawn_consumer(s1b, "shared-name".into(), 8);
    let c2 = spawn_consumer(s2b, "shared-name".into(), 8);

    p1.await.unwrap();
    p2.await.unwrap();
    expect_sorted(&timeout(Duration::from_secs(5), c1).await.unwrap().unwrap(), 30);
    expect_sorted(&timeout(Duration::from_secs(5), c2).await.unwrap().unwrap(), 60);
}
