use crate::*;

use nimbus_sync::zero_knowledge::SENTINEL;

const MASTER_KEY: &[u8] = b"a perfectly adequate master key";

#[tokio::test]
async fn server_never_sees_plaintext() {
    let pair = pair_with(64, Some(MASTER_KEY)).unwrap();
    let content = b"the quick brown fox jumps over the lazy dog";
    std::fs::write(pair.client_root.path().join("secret.txt"), content).unwrap();

    pair.client.synchronize().await.unwrap();
    wait_converged(&pair).await;

    // Exactly one file landed on the server, under an obfuscated name.
    let entries: Vec<_> = std::fs::read_dir(pair.server_root.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy() != ".cloud_cache")
        .collect();
    assert_eq!(entries.len(), 1);
    let stored_name = entries[0].file_name().to_string_lossy().into_owned();
    assert_ne!(stored_name, "secret.txt");
    assert!(stored_name.ends_with(SENTINEL));

    let stored = std::fs::read(entries[0].path()).unwrap();
    assert_eq!(stored.len(), content.len());
    assert_ne!(stored, content, "content must be encrypted at rest");
}

#[tokio::test]
async fn lost_local_file_comes_back_decrypted() {
    let pair = pair_with(64, Some(MASTER_KEY)).unwrap();
    let source = pair.client_root.path().join("restore-me.txt");
    let content = b"round trip through an oblivious server";
    std::fs::write(&source, content).unwrap();

    pair.client.synchronize().await.unwrap();
    wait_converged(&pair).await;

    // The local copy vanishes without the deletion being recorded — the
    // next pass treats the server copy as a legitimate remote-only file.
    std::fs::remove_file(&source).unwrap();
    pair.client.synchronize().await.unwrap();

    wait_for("file restored on the client", || source.exists()).await;
    assert_eq!(std::fs::read(&source).unwrap(), content);
}

#[tokio::test]
async fn nested_paths_are_obfuscated_per_component() {
    let pair = pair_with(64, Some(MASTER_KEY)).unwrap();
    std::fs::create_dir(pair.client_root.path().join("docs")).unwrap();
    std::fs::write(pair.client_root.path().join("docs/report.txt"), b"contents").unwrap();

    pair.client.synchronize().await.unwrap();
    wait_converged(&pair).await;

    let top: Vec<_> = std::fs::read_dir(pair.server_root.path())
        .unwrap()
        .filter_map(|e| e.ok())
        .filter(|e| e.path().is_dir() && e.file_name().to_string_lossy() != ".cloud_cache")
        .collect();
    assert_eq!(top.len(), 1);
    let dir_name = top[0].file_name().to_string_lossy().into_owned();
    assert!(dir_name.ends_with(SENTINEL), "directory name obfuscated");

    let inner: Vec<_> = std::fs::read_dir(top[0].path())
        .unwrap()
        .filter_map(|e| e.ok())
        .collect();
    assert_eq!(inner.len(), 1);
    let file_name = inner[0].file_name().to_string_lossy().into_owned();
    assert!(file_name.ends_with(SENTINEL), "file name obfuscated");
    assert!(!file_name.contains("report"));
}
