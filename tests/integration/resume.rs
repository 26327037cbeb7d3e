use crate::*;

use nimbus_core::hash::{ulong_hash, START_CRC};

#[tokio::test]
async fn download_resumes_from_a_partial_file() {
    let pair = pair(8).unwrap();
    let content = b"hello world, hi!!!.."; // 20 bytes, chunks of 8/8/4
    std::fs::write(pair.server_root.path().join("foo.txt"), content).unwrap();
    pair.server.rescan().await.unwrap();

    // The first two chunks already landed in a previous run; no live
    // tracker state survived the restart.
    std::fs::write(
        pair.client_root.path().join("foo.txt.tmp"),
        &content[..16],
    )
    .unwrap();

    pair.client.synchronize().await.unwrap();

    let client_copy = pair.client_root.path().join("foo.txt");
    wait_for("resumed download completes", || client_copy.exists()).await;
    assert_eq!(std::fs::read(&client_copy).unwrap(), content);
    assert!(
        !pair.client_root.path().join("foo.txt.tmp").exists(),
        "staging file renamed away"
    );

    // The receiver reported its two on-disk chunks back to the sender.
    let resumes = pair
        .client_transport
        .log
        .lock()
        .unwrap()
        .iter()
        .filter(|(code, payload)| {
            *code == u16::from(Command::ResendFrom)
                && nimbus_core::wire::decode_resume(payload)
                    .map(|(_, part)| part == 2)
                    .unwrap_or(false)
        })
        .count();
    assert!(resumes >= 1, "expected a resume-at-2 reply");
}

#[tokio::test]
async fn sender_crc_matches_progressive_chunk_hash() {
    let pair = pair(8).unwrap();
    let content = b"hello world, hi!!!..";
    std::fs::write(pair.client_root.path().join("crc.txt"), content).unwrap();

    pair.client.synchronize().await.unwrap();
    wait_for("file on the server", || {
        pair.server_root.path().join("crc.txt").exists()
    })
    .await;

    // The final chunk carries the sender's whole-file CRC; recompute it
    // chunk by chunk and compare against the wire.
    let expected = content
        .chunks(8)
        .fold(START_CRC, |crc, chunk| ulong_hash(crc, chunk));

    let log = pair.client_transport.log.lock().unwrap();
    let final_crc = log
        .iter()
        .filter(|(code, _)| *code == u16::from(Command::SendFileChunk))
        .filter_map(|(_, payload)| nimbus_core::wire::decode_chunk(payload).ok())
        .filter(|(header, _, _)| {
            let part = header.part;
            let total = header.total;
            part == total
        })
        .map(|(header, _, _)| header.final_crc)
        .next_back()
        .expect("a final chunk was sent");
    assert_eq!(final_crc, expected);
}

#[tokio::test]
async fn stale_partial_with_foreign_content_is_discarded() {
    let pair = pair(8).unwrap();
    let content = b"hello world, hi!!!..";
    std::fs::write(pair.server_root.path().join("foo.txt"), content).unwrap();
    pair.server.rescan().await.unwrap();

    // A leftover from some other file: right length, wrong bytes.
    std::fs::write(pair.client_root.path().join("foo.txt.tmp"), [0xAAu8; 16]).unwrap();

    pair.client.synchronize().await.unwrap();

    let client_copy = pair.client_root.path().join("foo.txt");
    wait_for("download completes from scratch", || client_copy.exists()).await;
    assert_eq!(std::fs::read(&client_copy).unwrap(), content);
}
