use crate::*;

use nimbus_core::wire::NoticeKind;

#[tokio::test]
async fn correct_proof_is_accepted() {
    let pair = pair(32).unwrap();
    // Debug builds pin both endpoints to the same PIN.
    let proof = nimbus_core::hash::hash256(pair.server.pin().as_bytes());

    pair.client
        .context()
        .send_command(None, Command::LoginRequest, &proof);

    wait_for("login reply", || {
        pair.server_transport
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|(code, payload)| {
                *code == u16::from(Command::LoginReply) && payload == &[1u8]
            })
    })
    .await;
}

#[tokio::test]
async fn bad_proofs_hit_the_cool_down() {
    let pair = pair(32).unwrap();

    for _ in 0..3 {
        pair.client
            .context()
            .send_command(None, Command::LoginRequest, &[0u8; 32]);
    }
    wait_for("three rejections", || {
        pair.server_transport
            .log
            .lock()
            .unwrap()
            .iter()
            .filter(|(code, payload)| {
                *code == u16::from(Command::LoginReply) && payload == &[0u8]
            })
            .count()
            == 3
    })
    .await;

    // The fourth attempt is not even evaluated.
    pair.client
        .context()
        .send_command(None, Command::LoginRequest, &[0u8; 32]);
    wait_for("authentication-required notice", || {
        pair.server_transport
            .log
            .lock()
            .unwrap()
            .iter()
            .any(|(code, payload)| {
                *code == u16::from(Command::Notice)
                    && payload.first() == Some(&u8::from(NoticeKind::AuthenticationRequired))
            })
    })
    .await;
}
