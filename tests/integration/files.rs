use crate::*;

#[tokio::test]
async fn small_file_reaches_the_server_in_three_chunks() {
    let pair = pair(8).unwrap();
    let content = b"hello world, hi!!!..";
    std::fs::write(pair.client_root.path().join("foo.txt"), content).unwrap();

    pair.client.synchronize().await.unwrap();

    let server_copy = pair.server_root.path().join("foo.txt");
    wait_for("foo.txt on the server", || server_copy.exists()).await;
    assert_eq!(std::fs::read(&server_copy).unwrap(), content);
    // 20 bytes at chunk size 8: parts of 8, 8, and 4.
    assert_eq!(pair.client_transport.sent(Command::SendFileChunk), 3);
    wait_converged(&pair).await;
}

#[tokio::test]
async fn mtime_is_carried_to_the_receiver() {
    let pair = pair(8).unwrap();
    let source = pair.client_root.path().join("stamp.txt");
    std::fs::write(&source, b"stamped").unwrap();

    pair.client.synchronize().await.unwrap();
    let server_copy = pair.server_root.path().join("stamp.txt");
    wait_for("stamp.txt on the server", || server_copy.exists()).await;
    wait_converged(&pair).await;

    let source_mtime = std::fs::metadata(&source)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    let copy_mtime = std::fs::metadata(&server_copy)
        .unwrap()
        .modified()
        .unwrap()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_secs();
    assert_eq!(source_mtime, copy_mtime);
}

#[tokio::test]
async fn empty_file_syncs() {
    let pair = pair(8).unwrap();
    std::fs::write(pair.client_root.path().join("empty"), b"").unwrap();

    pair.client.synchronize().await.unwrap();

    let server_copy = pair.server_root.path().join("empty");
    wait_for("empty file on the server", || server_copy.exists()).await;
    assert_eq!(std::fs::metadata(&server_copy).unwrap().len(), 0);
}

#[tokio::test]
async fn nested_directories_sync() {
    let pair = pair(64).unwrap();
    let root = pair.client_root.path();
    std::fs::create_dir_all(root.join("a/b")).unwrap();
    std::fs::write(root.join("a/b/deep.txt"), b"nested content").unwrap();

    pair.client.synchronize().await.unwrap();

    let server_copy = pair.server_root.path().join("a/b/deep.txt");
    wait_for("nested file on the server", || server_copy.exists()).await;
    assert_eq!(std::fs::read(&server_copy).unwrap(), b"nested content");
    wait_converged(&pair).await;
}

#[tokio::test]
async fn remote_only_file_is_downloaded() {
    let pair = pair(8).unwrap();
    std::fs::write(
        pair.server_root.path().join("served.bin"),
        b"from the server side",
    )
    .unwrap();
    pair.server.rescan().await.unwrap();

    pair.client.synchronize().await.unwrap();

    let client_copy = pair.client_root.path().join("served.bin");
    wait_for("served.bin on the client", || client_copy.exists()).await;
    assert_eq!(
        std::fs::read(&client_copy).unwrap(),
        b"from the server side"
    );
    wait_converged(&pair).await;
}

#[tokio::test]
async fn large_transfer_spans_many_chunks() {
    let pair = pair(64).unwrap();
    let content: Vec<u8> = (0..10_000u32).map(|i| (i % 251) as u8).collect();
    std::fs::write(pair.client_root.path().join("big.bin"), &content).unwrap();

    pair.client.synchronize().await.unwrap();

    let server_copy = pair.server_root.path().join("big.bin");
    wait_for("big.bin on the server", || {
        server_copy.exists()
            && std::fs::metadata(&server_copy).map(|m| m.len()).unwrap_or(0)
                == content.len() as u64
    })
    .await;
    assert_eq!(std::fs::read(&server_copy).unwrap(), content);
}

#[tokio::test]
async fn empty_directory_syncs() {
    let pair = pair(32).unwrap();
    std::fs::create_dir(pair.client_root.path().join("empty-dir")).unwrap();

    pair.client.synchronize().await.unwrap();

    let server_dir = pair.server_root.path().join("empty-dir");
    wait_for("empty directory on the server", || server_dir.is_dir()).await;
    wait_converged(&pair).await;
}

#[tokio::test]
async fn second_pass_reports_synchronized() {
    let pair = pair(32).unwrap();
    std::fs::write(pair.client_root.path().join("one.txt"), b"payload").unwrap();

    pair.client.synchronize().await.unwrap();
    wait_converged(&pair).await;

    let mut status = pair.client.context().events.subscribe_status();
    let notices_before = pair.client_transport.sent(Command::Notice);
    pair.client.synchronize().await.unwrap();
    wait_for("synchronized notice", || {
        pair.client_transport.sent(Command::Notice) > notices_before
    })
    .await;

    let mut saw_synchronized = false;
    while let Ok(event) = status.try_recv() {
        if event == nimbus_sync::SyncStatus::Synchronized {
            saw_synchronized = true;
        }
    }
    assert!(saw_synchronized, "client should report Synchronized");
}
