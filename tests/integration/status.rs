use crate::*;

use nimbus_core::wire::NoticeKind;
use nimbus_sync::{Operation, OperationKind, SyncStatus};

#[tokio::test]
async fn over_limit_notice_purges_pending_sends() {
    let pair = pair(32).unwrap();
    let spooler = &pair.client.context().spooler;

    for hash in 1..=5u64 {
        spooler.push(Operation::new(OperationKind::SendFile, hash, 1));
    }
    assert_eq!(spooler.pending(), 5);

    let mut status = pair.client.context().events.subscribe_status();
    pair.client
        .on_command(None, Command::Notice.into(), &[NoticeKind::RemoteDriveOverLimit.into()])
        .await;

    assert_eq!(spooler.pending(), 0, "queued sends were purged");
    assert_eq!(status.recv().await.unwrap(), SyncStatus::RemoteDriveOverLimit);

    // New sends are silently dropped; requests still queue.
    spooler.push(Operation::new(OperationKind::SendFile, 9, 1));
    assert_eq!(spooler.pending(), 0);
    spooler.push(Operation::new(OperationKind::RequestFile, 10, 1));
    assert_eq!(spooler.pending(), 1);
}

#[tokio::test]
async fn client_reports_pending_then_monitoring() {
    let pair = pair(32).unwrap();
    std::fs::write(pair.client_root.path().join("status.txt"), b"watch me").unwrap();

    let mut status = pair.client.context().events.subscribe_status();
    pair.client.synchronize().await.unwrap();
    wait_converged(&pair).await;
    // Let the completion callbacks drain before inspecting the stream.
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;

    let mut saw_pending = false;
    let mut saw_monitoring_after_pending = false;
    loop {
        match status.try_recv() {
            Ok(SyncStatus::Pending) => saw_pending = true,
            Ok(SyncStatus::Monitoring) if saw_pending => {
                saw_monitoring_after_pending = true;
            }
            Ok(_) => {}
            Err(_) => break,
        }
    }
    assert!(saw_pending, "spooling raises Pending");
    assert!(
        saw_monitoring_after_pending,
        "draining raises Monitoring after Pending"
    );
}

#[tokio::test]
async fn server_signals_ready_when_drained() {
    let pair = pair(32).unwrap();
    std::fs::write(pair.server_root.path().join("give.txt"), b"take this").unwrap();
    pair.server.rescan().await.unwrap();

    pair.client.synchronize().await.unwrap();
    wait_for("download lands", || {
        pair.client_root.path().join("give.txt").exists()
    })
    .await;

    // The server addressed its client, so its drained spool also sends a
    // Ready notice over the wire.
    wait_for("ready notice from the server", || {
        pair.server_transport
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|(code, payload)| {
                *code == u16::from(Command::Notice)
                    && payload.first() == Some(&u8::from(NoticeKind::Ready))
            })
    })
    .await;
}
