//! Janus WebSocket client
//!
//! One reader task routes replies to waiting requests by transaction id and
//! forwards everything else as [`HandleEvent`]s. One writer task owns the
//! sink. Requests that expect an asynchronous plugin event skip the
//! intermediate `ack`.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use super::protocol::{transaction_id, HandleEvent, PluginData, Reply, Request, JANUS_PROTOCOL};
use super::JanusError;
use crate::webrtc::SessionDescription;

struct Pending {
    tx: oneshot::Sender<Reply>,
    /// Ignore `ack` and complete on the following event
    wait_for_event: bool,
}

type PendingMap = Arc<Mutex<HashMap<String, Pending>>>;

/// Reply to a plugin message
#[derive(Debug, Clone, Default)]
pub struct PluginReply {
    pub plugindata: Option<PluginData>,
    pub jsep: Option<SessionDescription>,
}

/// Connection to a Janus gateway
#[derive(Clone)]
pub struct JanusClient {
    outgoing: mpsc::UnboundedSender<Message>,
    pending: PendingMap,
    request_timeout: Duration,
    shutdown: CancellationToken,
}

impl JanusClient {
    /// Connect to `url` and start the reader and writer tasks.
    ///
    /// The returned receiver yields asynchronous handle events and ends when
    /// the connection does.
    pub async fn connect(
        url: &str,
        request_timeout: Duration,
    ) -> Result<(Self, mpsc::UnboundedReceiver<HandleEvent>), JanusError> {
        let connect_error = |reason: String| JanusError::Connect {
            url: url.to_string(),
            reason,
        };

        let mut request = url
            .into_client_request()
            .map_err(|e| connect_error(e.to_string()))?;
        request.headers_mut().insert(
            SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_static(JANUS_PROTOCOL),
        );

        let (ws, _) = tokio::time::timeout(request_timeout, tokio_tungstenite::connect_async(request))
            .await
            .map_err(|_| connect_error("timed out".to_string()))?
            .map_err(|e| connect_error(e.to_string()))?;

        info!("Connected to Janus at {}", url);

        let (mut sink, mut stream) = ws.split();
        let (outgoing, mut outgoing_rx) = mpsc::unbounded_channel::<Message>();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let pending: PendingMap = Arc::new(Mutex::new(HashMap::new()));
        let shutdown = CancellationToken::new();

        let writer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = writer_shutdown.cancelled() => break,
                    msg = outgoing_rx.recv() => match msg {
                        Some(msg) => {
                            if let Err(e) = sink.send(msg).await {
                                warn!("Failed to send to Janus: {}", e);
                                break;
                            }
                        }
                        None => break,
                    },
                }
            }
            let _ = sink.send(Message::Close(None)).await;
            let _ = sink.close().await;
            debug!("Janus writer stopped");
        });

        let reader_pending = pending.clone();
        let reader_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let msg = tokio::select! {
                    _ = reader_shutdown.cancelled() => break,
                    msg = stream.next() => msg,
                };
                match msg {
                    Some(Ok(Message::Text(text))) => dispatch(&text, &reader_pending, &events_tx),
                    Some(Ok(Message::Close(frame))) => {
                        info!("Janus closed the connection: {:?}", frame);
                        break;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        warn!("Janus connection error: {}", e);
                        break;
                    }
                    None => break,
                }
            }

            // Dropping the senders fails every outstanding request
            reader_pending.lock().clear();
            reader_shutdown.cancel();
            debug!("Janus reader stopped");
        });

        Ok((
            Self {
                outgoing,
                pending,
                request_timeout,
                shutdown,
            },
            events_rx,
        ))
    }

    /// Send `request` and wait for its reply
    pub async fn request(&self, request: Request, wait_for_event: bool) -> Result<Reply, JanusError> {
        let name = request.name();
        let transaction = request.transaction().to_string();
        let text = serde_json::to_string(&request)?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .insert(transaction.clone(), Pending { tx, wait_for_event });

        trace!("Janus -> {}", text);
        if self.outgoing.send(Message::Text(text)).is_err() {
            self.pending.lock().remove(&transaction);
            return Err(JanusError::Disconnected);
        }

        let reply = match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(reply)) => reply,
            Ok(Err(_)) => return Err(JanusError::Disconnected),
            Err(_) => {
                self.pending.lock().remove(&transaction);
                return Err(JanusError::Timeout(name));
            }
        };

        match reply {
            Reply::Error { error, .. } => Err(JanusError::Server {
                code: error.code,
                reason: error.reason,
            }),
            reply => Ok(reply),
        }
    }

    /// Create a Janus session
    pub async fn create_session(&self) -> Result<u64, JanusError> {
        let reply = self
            .request(
                Request::Create {
                    transaction: transaction_id(),
                },
                false,
            )
            .await?;
        expect_id(reply)
    }

    /// Attach to `plugin`, returning the handle id
    pub async fn attach(&self, session_id: u64, plugin: &str) -> Result<u64, JanusError> {
        let reply = self
            .request(
                Request::Attach {
                    transaction: transaction_id(),
                    session_id,
                    plugin: plugin.to_string(),
                },
                false,
            )
            .await?;
        expect_id(reply)
    }

    /// Send a plugin message and wait for the plugin's answer
    pub async fn message(
        &self,
        session_id: u64,
        handle_id: u64,
        body: Value,
        jsep: Option<SessionDescription>,
    ) -> Result<PluginReply, JanusError> {
        let reply = self
            .request(
                Request::Message {
                    transaction: transaction_id(),
                    session_id,
                    handle_id,
                    body,
                    jsep,
                },
                true,
            )
            .await?;

        let reply = match reply {
            Reply::Event {
                plugindata, jsep, ..
            } => PluginReply { plugindata, jsep },
            Reply::Success { plugindata, .. } => PluginReply {
                plugindata,
                jsep: None,
            },
            other => return Err(JanusError::Protocol(format!("{:?}", other))),
        };

        if let Some((code, reason)) = reply.plugindata.as_ref().and_then(PluginData::error) {
            return Err(JanusError::Plugin { code, reason });
        }
        Ok(reply)
    }

    /// Keep the session alive
    pub async fn keepalive(&self, session_id: u64) -> Result<(), JanusError> {
        match self
            .request(
                Request::Keepalive {
                    transaction: transaction_id(),
                    session_id,
                },
                false,
            )
            .await?
        {
            Reply::Ack { .. } => Ok(()),
            other => Err(JanusError::Protocol(format!("{:?}", other))),
        }
    }

    /// Destroy the session, detaching every handle
    pub async fn destroy(&self, session_id: u64) -> Result<(), JanusError> {
        self.request(
            Request::Destroy {
                transaction: transaction_id(),
                session_id,
            },
            false,
        )
        .await
        .map(|_| ())
    }

    /// Close the WebSocket
    pub fn close(&self) {
        self.shutdown.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}

fn expect_id(reply: Reply) -> Result<u64, JanusError> {
    match reply {
        Reply::Success {
            data: Some(data), ..
        } => Ok(data.id),
        other => Err(JanusError::Protocol(format!("{:?}", other))),
    }
}

fn dispatch(text: &str, pending: &Mutex<HashMap<String, Pending>>, events: &mpsc::UnboundedSender<HandleEvent>) {
    trace!("Janus <- {}", text);

    let reply: Reply = match serde_json::from_str(text) {
        Ok(reply) => reply,
        Err(e) => {
            warn!("Unparseable Janus message ({}): {}", e, text);
            return;
        }
    };

    if let Some(transaction) = reply.transaction().map(str::to_owned) {
        let mut pending = pending.lock();
        let waiting_for_event = pending.get(&transaction).map(|p| p.wait_for_event);
        match waiting_for_event {
            Some(true) if matches!(reply, Reply::Ack { .. }) => {
                trace!("Janus acknowledged {}", transaction);
                return;
            }
            Some(_) => {
                if let Some(entry) = pending.remove(&transaction) {
                    let _ = entry.tx.send(reply);
                }
                return;
            }
            None => {}
        }
    }

    match reply.into_handle_event() {
        Some(event) => {
            let _ = events.send(event);
        }
        None => debug!("Ignoring Janus message: {}", text),
    }
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-process Janus server

    use futures::{SinkExt, StreamExt};
    use serde_json::Value;
    use tokio::net::TcpListener;
    use tokio_tungstenite::tungstenite::handshake::server::{
        ErrorResponse, Request as HandshakeRequest, Response,
    };
    use tokio_tungstenite::tungstenite::http::header::SEC_WEBSOCKET_PROTOCOL;
    use tokio_tungstenite::tungstenite::http::HeaderValue;
    use tokio_tungstenite::tungstenite::Message;

    use crate::janus::protocol::JANUS_PROTOCOL;

    /// Copy the request's transaction into `body`
    pub fn reply(request: &Value, mut body: Value) -> Value {
        body["transaction"] = request["transaction"].clone();
        body
    }

    /// Serve one connection, answering each request with `script(request)`
    pub async fn spawn<F>(script: F) -> String
    where
        F: Fn(&Value) -> Vec<Value> + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let callback =
                |_req: &HandshakeRequest, mut resp: Response| -> Result<Response, ErrorResponse> {
                    resp.headers_mut().insert(
                        SEC_WEBSOCKET_PROTOCOL,
                        HeaderValue::from_static(JANUS_PROTOCOL),
                    );
                    Ok(resp)
                };
            let mut ws = tokio_tungstenite::accept_hdr_async(stream, callback)
                .await
                .unwrap();

            while let Some(Ok(msg)) = ws.next().await {
                if let Message::Text(text) = msg {
                    let request: Value = serde_json::from_str(&text).unwrap();
                    for reply in script(&request) {
                        if ws.send(Message::Text(reply.to_string())).await.is_err() {
                            return;
                        }
                    }
                }
            }
        });

        format!("ws://{}/janus", addr)
    }
}
