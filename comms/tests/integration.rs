use std::io;

use tokio::io as tokio_io;

use comms::msg::{Command, Msg, Payload, Reply, VarId, VarValue};

#[tokio::test]
async fn control_and_reply_roundtrip() -> io::Result<()> {
    const BUF_SIZE: usize = 4096;

    let (sv_stream, wk_stream) = tokio_io::duplex(BUF_SIZE);
    let (sv_rx, sv_tx) = tokio_io::split(sv_stream);
    let (mut sv_rx, mut sv_tx) = comms::channel(sv_rx, sv_tx);
    let (wk_rx, wk_tx) = tokio_io::split(wk_stream);
    let (mut wk_rx, mut wk_tx) = comms::channel(wk_rx, wk_tx);

    let cmd = Msg::Control(Command::WriteVar(VarId::Position, VarValue::Int(16)));
    wk_tx.send(&cmd).await?;

    let got: Msg = sv_rx.recv().await?;
    assert_eq!(got, cmd);

    sv_tx
        .send(&Msg::Reply(Reply::Pushed { learning_rate: 0.5 }))
        .await?;

    let got: Msg = wk_rx.recv().await?;
    assert_eq!(got, Msg::Reply(Reply::Pushed { learning_rate: 0.5 }));

    Ok(())
}

#[tokio::test]
async fn numeric_payloads_roundtrip_zero_copy() -> io::Result<()> {
    const BUF_SIZE: usize = 4096;

    let (sv_stream, wk_stream) = tokio_io::duplex(BUF_SIZE);
    let (sv_rx, sv_tx) = tokio_io::split(sv_stream);
    let (mut sv_rx, _sv_tx) = comms::channel(sv_rx, sv_tx);
    let (wk_rx, wk_tx) = tokio_io::split(wk_stream);
    let (_wk_rx, mut wk_tx) = comms::channel(wk_rx, wk_tx);

    let grad = [0.25_f32, -1.0, 3.5];
    wk_tx.send(&Msg::Data(Payload::Gradient(&grad))).await?;

    match sv_rx.recv().await? {
        Msg::Data(Payload::Gradient(got)) => assert_eq!(got, grad),
        other => panic!("unexpected msg: {other:?}"),
    }

    Ok(())
}

#[tokio::test]
async fn error_strings_survive_the_wire() -> io::Result<()> {
    const BUF_SIZE: usize = 1024;

    let (sv_stream, wk_stream) = tokio_io::duplex(BUF_SIZE);
    let (sv_rx, sv_tx) = tokio_io::split(sv_stream);
    let (mut sv_rx, _sv_tx) = comms::channel(sv_rx, sv_tx);
    let (wk_rx, wk_tx) = tokio_io::split(wk_stream);
    let (_wk_rx, mut wk_tx) = comms::channel(wk_rx, wk_tx);

    wk_tx.send(&Msg::Err("shard length mismatch".into())).await?;

    match sv_rx.recv().await? {
        Msg::Err(detail) => assert_eq!(detail, "shard length mismatch"),
        other => panic!("unexpected msg: {other:?}"),
    }

    Ok(())
}
