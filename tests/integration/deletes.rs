use crate::*;

#[tokio::test]
async fn local_file_delete_propagates() {
    let pair = pair(32).unwrap();
    let source = pair.client_root.path().join("doomed.txt");
    std::fs::write(&source, b"short lived").unwrap();

    pair.client.synchronize().await.unwrap();
    let server_copy = pair.server_root.path().join("doomed.txt");
    wait_for("file on the server", || server_copy.exists()).await;
    wait_converged(&pair).await;

    // The watcher reports the deletion, then the next tick forwards it.
    std::fs::remove_file(&source).unwrap();
    pair.client.notify_deleted("doomed.txt").await;
    pair.client.synchronize().await.unwrap();

    wait_for("file gone from the server", || !server_copy.exists()).await;
    wait_converged(&pair).await;
}

#[tokio::test]
async fn directory_delete_is_one_command() {
    let pair = pair(32).unwrap();
    let root = pair.client_root.path();
    std::fs::create_dir_all(root.join("dir")).unwrap();
    std::fs::write(root.join("dir/x"), b"xx").unwrap();
    std::fs::write(root.join("dir/y"), b"yy").unwrap();

    pair.client.synchronize().await.unwrap();
    wait_for("subtree on the server", || {
        pair.server_root.path().join("dir/x").exists()
            && pair.server_root.path().join("dir/y").exists()
    })
    .await;
    wait_converged(&pair).await;

    std::fs::remove_dir_all(root.join("dir")).unwrap();
    pair.client.notify_deleted("dir").await;
    pair.client.synchronize().await.unwrap();

    wait_for("subtree gone from the server", || {
        !pair.server_root.path().join("dir").exists()
    })
    .await;
    // One directory delete covers the subtree; no per-file commands.
    assert_eq!(pair.client_transport.sent(Command::DeleteDirectory), 1);
    assert_eq!(pair.client_transport.sent(Command::DeleteFile), 0);
    wait_converged(&pair).await;
}

#[tokio::test]
async fn deleted_file_is_not_resurrected() {
    let pair = pair(32).unwrap();
    let source = pair.client_root.path().join("memory.txt");
    std::fs::write(&source, b"remember me").unwrap();

    pair.client.synchronize().await.unwrap();
    wait_converged(&pair).await;

    std::fs::remove_file(&source).unwrap();
    pair.client.notify_deleted("memory.txt").await;

    // Two more passes: the delete goes out, and the follow-up pass must
    // not fetch the file back.
    pair.client.synchronize().await.unwrap();
    wait_for("file gone from the server", || {
        !pair.server_root.path().join("memory.txt").exists()
    })
    .await;
    pair.client.synchronize().await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(200)).await;
    assert!(!source.exists(), "deleted file must stay deleted");
}
