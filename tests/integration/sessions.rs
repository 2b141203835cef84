use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use mesh_core::message::{ErrorNotice, UserLoginAck, ERR_CODE_SYSTEM_ERROR};
use mesh_core::wire::read_message;
use mesh_core::{Message, MessageId};
use mesh_services::{
    Connector, HandlerTable, Identity, MessageHandler, Session, SessionOptions, SessionState,
    SessionTable,
};

use crate::eventually;

// ── Game server fake ──────────────────────────────────────────────────────────

/// Read the ping + login handshake and return the account.
async fn accept_login(listener: &TcpListener) -> Result<(TcpStream, String)> {
    let (mut stream, _) = listener.accept().await?;
    assert_eq!(read_message(&mut stream).await?, Message::ClientPing);
    match read_message(&mut stream).await? {
        Message::UserLogin(login) => Ok((stream, login.account)),
        other => anyhow::bail!("expected login, got {other:?}"),
    }
}

async fn send(stream: &mut TcpStream, message: Message) -> Result<()> {
    stream.write_all(&message.encode()?).await?;
    Ok(())
}

fn system_error() -> Message {
    Message::ErrorNotice(ErrorNotice {
        error_code: ERR_CODE_SYSTEM_ERROR,
        detail: "service restarting".into(),
    })
}

struct StoreToken;

#[async_trait]
impl MessageHandler for StoreToken {
    async fn handle(&self, session: &Arc<Session>, message: Message) -> anyhow::Result<()> {
        if let Message::UserLoginAck(ack) = message {
            session.set_token(ack.token);
        }
        Ok(())
    }
}

fn handlers() -> Arc<HandlerTable> {
    let mut table = HandlerTable::new();
    table
        .register(MessageId::UserLoginS2C, Arc::new(StoreToken))
        .unwrap();
    Arc::new(table)
}

fn options(reconnect_delay: Duration) -> SessionOptions {
    SessionOptions {
        heartbeat: Duration::from_secs(60),
        reconnect_delay,
    }
}

async fn connector(
    listener: &TcpListener,
    account: &str,
    reconnect_delay: Duration,
    table: &SessionTable,
) -> Result<Connector> {
    Ok(Connector::new(
        listener.local_addr()?.to_string(),
        Identity::new(account),
        handlers(),
        options(reconnect_delay),
        table.clone(),
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[tokio::test]
async fn login_token_is_captured_over_tcp() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let table = SessionTable::new();
    let connector = connector(&listener, "ys100", Duration::from_secs(3), &table).await?;

    let server = tokio::spawn(async move {
        let (mut stream, account) = accept_login(&listener).await?;
        send(
            &mut stream,
            Message::UserLoginAck(UserLoginAck {
                token: format!("tok-{account}"),
            }),
        )
        .await?;
        anyhow::Ok(stream)
    });

    let session = connector.connect().await?;
    let _stream = server.await??;
    eventually(Duration::from_secs(2), || session.token().is_some()).await?;

    assert_eq!(session.token().as_deref(), Some("tok-ys100"));
    assert_eq!(session.state(), SessionState::Active);
    assert!(Arc::ptr_eq(&table.get("ys100").unwrap(), &session));
    Ok(())
}

#[tokio::test]
async fn system_error_reconnects_with_same_identity() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let table = SessionTable::new();
    let connector = connector(&listener, "ys200", Duration::from_millis(100), &table).await?;
    let (logins_tx, mut logins) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        let (mut first, account) = accept_login(&listener).await?;
        logins_tx.send((account, tokio::time::Instant::now()))?;
        send(&mut first, system_error()).await?;

        let (mut second, account) = accept_login(&listener).await?;
        logins_tx.send((account, tokio::time::Instant::now()))?;
        send(
            &mut second,
            Message::UserLoginAck(UserLoginAck {
                token: "second".into(),
            }),
        )
        .await?;
        // Keep the connection open until the test ends.
        tokio::time::sleep(Duration::from_secs(30)).await;
        anyhow::Ok(())
    });

    let first = connector.connect().await?;
    let (account, first_at) = logins.recv().await.unwrap();
    assert_eq!(account, "ys200");

    let (account, second_at) = tokio::time::timeout(Duration::from_secs(5), logins.recv())
        .await?
        .unwrap();
    assert_eq!(account, "ys200");
    assert!(second_at - first_at >= Duration::from_millis(100));
    assert!(first.is_closed());

    eventually(Duration::from_secs(2), || {
        table
            .get("ys200")
            .is_some_and(|s| !Arc::ptr_eq(&s, &first) && s.token().as_deref() == Some("second"))
    })
    .await?;

    table.close_all().await;
    Ok(())
}

#[tokio::test]
async fn close_all_cancels_pending_reconnect() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let table = SessionTable::new();
    let connector = connector(&listener, "ys300", Duration::from_millis(500), &table).await?;

    let connecting = tokio::spawn(async move { connector.connect().await });
    let (mut stream, _) = accept_login(&listener).await?;
    let session = connecting.await??;

    send(&mut stream, system_error()).await?;
    session.wait_closed().await;
    eventually(Duration::from_secs(2), || session.reconnect_pending()).await?;

    assert!(Arc::ptr_eq(&table.get("ys300").unwrap(), &session));
    table.close_all().await;
    assert!(!session.reconnect_pending());

    let second = tokio::time::timeout(Duration::from_secs(1), listener.accept()).await;
    assert!(second.is_err(), "reconnect fired after close_all");
    Ok(())
}

#[tokio::test]
async fn peer_hangup_closes_without_reconnect() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let table = SessionTable::new();
    let connector = connector(&listener, "ys400", Duration::from_millis(50), &table).await?;

    let connecting = tokio::spawn(async move { connector.connect().await });
    let (stream, _) = accept_login(&listener).await?;
    let session = connecting.await??;

    drop(stream);
    tokio::time::timeout(Duration::from_secs(2), session.wait_closed()).await?;
    eventually(Duration::from_secs(2), || table.get("ys400").is_none()).await?;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(!session.reconnect_pending());

    let second = tokio::time::timeout(Duration::from_millis(300), listener.accept()).await;
    assert!(second.is_err(), "transport errors must not reconnect");
    Ok(())
}

#[tokio::test]
async fn unreachable_endpoint_reports_connect_error() -> Result<()> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    drop(listener);

    let connector = Connector::new(
        addr.to_string(),
        Identity::new("ys500"),
        handlers(),
        SessionOptions::default(),
        SessionTable::new(),
    );
    let err = connector.connect().await.err().expect("connect should fail");
    assert!(matches!(err, mesh_services::SessionError::Connect { .. }));
    Ok(())
}
