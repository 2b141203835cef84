//! Session probe — scripted clients driving login → get-info → join-chat → chat.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::Rng;

use mesh_core::config::MeshConfig;
use mesh_core::message::{TokenRequest, UserChat};
use mesh_core::{Message, MessageId};
use mesh_services::{
    Connector, HandlerTable, Identity, MessageHandler, Session, SessionOptions, SessionTable,
};

const CHAT_MIN_SECS: u64 = 10;
const CHAT_MAX_SECS: u64 = 20;

pub async fn run(api: &str, kind: &str, clients: usize, config: &MeshConfig) -> Result<()> {
    let endpoints = crate::fetch_connectors(api, kind).await?;
    anyhow::ensure!(!endpoints.is_empty(), "no {} connectors available", kind);
    tracing::info!(count = endpoints.len(), kind, "connectors discovered");

    let handlers = Arc::new(handlers()?);
    let options = SessionOptions::from(&config.session);
    let table = SessionTable::new();

    for account in random_accounts(clients) {
        let endpoint = pick_endpoint(&endpoints, &account);
        let connector = Connector::new(
            endpoint,
            Identity::new(account.clone()),
            handlers.clone(),
            options,
            table.clone(),
        );
        if let Err(e) = connector.connect().await {
            tracing::warn!(account = %account, endpoint, error = %e, "client failed to connect");
        }
    }
    tracing::info!(sessions = table.active(), "probe running, Ctrl-C to stop");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for Ctrl-C")?;
    tracing::info!("probe stopping");
    table.close_all().await;
    Ok(())
}

/// `n` distinct accounts named `ys<number>`.
fn random_accounts(n: usize) -> Vec<String> {
    let mut rng = rand::thread_rng();
    let mut seen = HashSet::with_capacity(n);
    while seen.len() < n {
        seen.insert(format!("ys{}", rng.gen_range(0..100_000_000u32)));
    }
    seen.into_iter().collect()
}

/// Stable endpoint choice for an account: blake3 prefix modulo count.
fn pick_endpoint<'a>(endpoints: &'a [String], account: &str) -> &'a str {
    let hash = blake3::hash(account.as_bytes());
    let bytes = hash.as_bytes();
    let prefix = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    &endpoints[prefix as usize % endpoints.len()]
}

fn handlers() -> Result<HandlerTable> {
    let mut table = HandlerTable::new();
    table.register(MessageId::UserLoginS2C, Arc::new(LoginAck))?;
    table.register(MessageId::UserGetInfoS2C, Arc::new(InfoAck))?;
    table.register(MessageId::UserJoinChatS2C, Arc::new(JoinChatAck))?;
    table.register(MessageId::UserChatNoticeS2C, Arc::new(ChatNotice))?;
    table.register(MessageId::ErrorNotice, Arc::new(Notice))?;
    Ok(table)
}

// ── Handlers ──────────────────────────────────────────────────────────────────

struct LoginAck;

#[async_trait]
impl MessageHandler for LoginAck {
    async fn handle(&self, session: &Arc<Session>, message: Message) -> Result<()> {
        let id = message.id();
        let Message::UserLoginAck(ack) = message else {
            anyhow::bail!("expected login ack, got {:?}", id);
        };
        tracing::info!(account = %session.account(), "logged in");
        session.set_token(ack.token.clone());
        session
            .send(&Message::UserGetInfo(TokenRequest { token: ack.token }))
            .await?;
        Ok(())
    }
}

struct InfoAck;

#[async_trait]
impl MessageHandler for InfoAck {
    async fn handle(&self, session: &Arc<Session>, message: Message) -> Result<()> {
        let id = message.id();
        let Message::UserGetInfoAck(info) = message else {
            anyhow::bail!("expected user info, got {:?}", id);
        };
        tracing::info!(account = %session.account(), data = %info.data, "user info");
        let token = session.token().context("user info arrived before login")?;
        session
            .send(&Message::UserJoinChat(TokenRequest { token }))
            .await?;
        Ok(())
    }
}

struct JoinChatAck;

#[async_trait]
impl MessageHandler for JoinChatAck {
    async fn handle(&self, session: &Arc<Session>, _message: Message) -> Result<()> {
        let period = Duration::from_secs(rand::thread_rng().gen_range(CHAT_MIN_SECS..=CHAT_MAX_SECS));
        tracing::info!(account = %session.account(), period_secs = period.as_secs(), "joined chat");

        let account = session.account().to_string();
        let sent = AtomicU64::new(0);
        session.arm_periodic(period, move || {
            let n = sent.fetch_add(1, Ordering::Relaxed) + 1;
            Message::UserChat(UserChat {
                msg: format!("{account} says hello #{n}"),
            })
        });
        Ok(())
    }
}

struct ChatNotice;

#[async_trait]
impl MessageHandler for ChatNotice {
    async fn handle(&self, session: &Arc<Session>, message: Message) -> Result<()> {
        if let Message::UserChatNotice(notice) = message {
            tracing::info!(
                account = %session.account(),
                from = %notice.user_name,
                msg = %notice.msg,
                "chat"
            );
        }
        Ok(())
    }
}

/// Non-fatal error notices; the system error never reaches here.
struct Notice;

#[async_trait]
impl MessageHandler for Notice {
    async fn handle(&self, session: &Arc<Session>, message: Message) -> Result<()> {
        if let Message::ErrorNotice(notice) = message {
            tracing::warn!(
                account = %session.account(),
                code = notice.error_code,
                detail = %notice.detail,
                "server error notice"
            );
        }
        Ok(())
    }
}
