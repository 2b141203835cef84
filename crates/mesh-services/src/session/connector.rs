use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use super::{Identity, Session, SessionError, SessionOptions, SessionTable};
use crate::dispatch::HandlerTable;

/// Everything needed to (re)build a session to one endpoint for one identity.
///
/// Cheap to clone. Sessions built here carry the connector so a fatal peer
/// notice can schedule a fresh connection with the same credentials.
#[derive(Clone)]
pub struct Connector {
    inner: Arc<Inner>,
}

struct Inner {
    endpoint: String,
    identity: Identity,
    handlers: Arc<HandlerTable>,
    options: SessionOptions,
    table: SessionTable,
}

impl Connector {
    pub fn new(
        endpoint: impl Into<String>,
        identity: Identity,
        handlers: Arc<HandlerTable>,
        options: SessionOptions,
        table: SessionTable,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoint: endpoint.into(),
                identity,
                handlers,
                options,
                table,
            }),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn identity(&self) -> &Identity {
        &self.inner.identity
    }

    pub fn table(&self) -> &SessionTable {
        &self.inner.table
    }

    /// Dial the endpoint over TCP and run the handshake.
    pub async fn connect(&self) -> Result<Arc<Session>, SessionError> {
        let endpoint = &self.inner.endpoint;
        let stream = TcpStream::connect(endpoint.as_str())
            .await
            .map_err(|source| SessionError::Connect {
                endpoint: endpoint.clone(),
                source,
            })?;
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(endpoint = %endpoint, error = %e, "failed to set TCP_NODELAY");
        }
        self.start(stream).await
    }

    /// Run a session over `stream` and record it in the table, replacing
    /// any earlier session for the same account.
    pub async fn start<S>(&self, stream: S) -> Result<Arc<Session>, SessionError>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let inner = &self.inner;
        let session = Session::launch(
            stream,
            inner.endpoint.clone(),
            &inner.identity,
            inner.handlers.clone(),
            inner.options,
            Some(self.clone()),
        )
        .await?;

        if let Some(previous) = inner.table.insert(session.clone()) {
            previous.close().await;
        }
        if inner.table.is_shutting_down() {
            session.close().await;
        }
        Ok(session)
    }
}
