//! VideoRoom subscriber bootstrap

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::JanusClient;
use super::protocol::{join_subscriber_body, start_body, HandleEvent, VIDEOROOM_PLUGIN};
use super::JanusError;
use crate::config::JanusConfig;
use crate::error::{AppError, Result};
use crate::events::SessionEvent;
use crate::webrtc::{SessionManager, SessionOrigin};

/// Subscribe to the configured feed and forward its media until Janus hangs
/// up, the peer session ends, or `shutdown` fires.
pub async fn run_subscriber(
    config: &JanusConfig,
    manager: Arc<SessionManager>,
    shutdown: CancellationToken,
) -> Result<()> {
    config.validate()?;
    let request_timeout = Duration::from_millis(config.request_timeout_ms);
    let (client, handle_events) = JanusClient::connect(&config.url, request_timeout).await?;

    let janus_session = client.create_session().await?;
    let handle = client.attach(janus_session, VIDEOROOM_PLUGIN).await?;
    info!(
        "Janus session {} attached to {} as handle {}",
        janus_session, VIDEOROOM_PLUGIN, handle
    );

    let keepalive_stop = CancellationToken::new();
    let keepalive = spawn_keepalive(
        client.clone(),
        janus_session,
        Duration::from_millis(config.keepalive_interval_ms),
        keepalive_stop.clone(),
    );

    let result = follow_feed(
        config,
        &client,
        Attached {
            session: janus_session,
            handle,
            events: handle_events,
            keepalive,
        },
        &manager,
        &shutdown,
    )
    .await;

    keepalive_stop.cancel();
    if !client.is_closed() {
        if let Err(e) = client.destroy(janus_session).await {
            debug!("Failed to destroy Janus session {}: {}", janus_session, e);
        }
    }
    client.close();

    result
}

/// A Janus session with one attached VideoRoom handle
struct Attached {
    session: u64,
    handle: u64,
    events: mpsc::UnboundedReceiver<HandleEvent>,
    keepalive: JoinHandle<std::result::Result<(), JanusError>>,
}

async fn follow_feed(
    config: &JanusConfig,
    client: &JanusClient,
    mut attached: Attached,
    manager: &SessionManager,
    shutdown: &CancellationToken,
) -> Result<()> {
    info!("Joining room {} as subscriber to feed {}", config.room, config.feed);
    let joined = client
        .message(
            attached.session,
            attached.handle,
            join_subscriber_body(config.room, config.feed),
            None,
        )
        .await?;
    let offer = joined
        .jsep
        .ok_or_else(|| JanusError::Protocol("join reply carried no offer".to_string()))?;

    let (peer, answer) = manager.negotiate(SessionOrigin::Janus, offer).await?;
    let session_id = peer.session_id().to_string();
    // Subscribe before starting so a fast teardown is not missed
    let mut bus = manager.events().subscribe();

    if let Err(e) = client
        .message(attached.session, attached.handle, start_body(), Some(answer))
        .await
    {
        let _ = manager.close_session(&session_id, "start rejected").await;
        return Err(e.into());
    }
    info!("Subscription started, peer session {}", session_id);

    let outcome = loop {
        tokio::select! {
            _ = shutdown.cancelled() => {
                info!("Shutting down Janus subscriber");
                break Ok(());
            }
            res = &mut attached.keepalive => {
                let reason = match res {
                    Ok(Err(e)) => e.to_string(),
                    Ok(Ok(())) => "keepalive stopped".to_string(),
                    Err(e) => e.to_string(),
                };
                break Err(AppError::Janus(JanusError::Keepalive(reason)));
            }
            event = attached.events.recv() => match event {
                Some(event) if event.is_terminal() => {
                    info!("Janus ended the subscription: {:?}", event);
                    break Ok(());
                }
                Some(event) => log_handle_event(&event),
                None => break Err(AppError::Janus(JanusError::Disconnected)),
            },
            event = bus.recv() => match event {
                Ok(SessionEvent::SessionClosed { session_id: closed, reason }) if closed == session_id => {
                    break Err(AppError::WebRtcError(format!("Peer session closed: {}", reason)));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => debug!("Subscriber missed {} session events", n),
                Err(RecvError::Closed) => {}
            },
        }
    };

    if let Err(e) = manager.close_session(&session_id, "subscription ended").await {
        debug!("Peer session already gone: {}", e);
    }
    outcome
}

fn spawn_keepalive(
    client: JanusClient,
    session_id: u64,
    period: Duration,
    stop: CancellationToken,
) -> JoinHandle<std::result::Result<(), JanusError>> {
    tokio::spawn(async move {
        let mut ticker = interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = stop.cancelled() => return Ok(()),
                _ = ticker.tick() => {
                    client.keepalive(session_id).await?;
                    debug!("Janus session {} keepalive", session_id);
                }
            }
        }
    })
}

fn log_handle_event(event: &HandleEvent) {
    match event {
        HandleEvent::WebRtcUp => info!("Janus reports WebRTC up"),
        HandleEvent::Media { kind, receiving } => {
            info!("Janus media event: {} receiving={}", kind, receiving)
        }
        HandleEvent::SlowLink { uplink, lost } => {
            warn!("Janus slow link (uplink={}, lost={})", uplink, lost)
        }
        HandleEvent::Plugin { data } => info!("Janus plugin event: {}", data),
        other => debug!("Janus handle event: {:?}", other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::events::EventBus;
    use crate::janus::client::mock::{reply, spawn};
    use crate::webrtc::test_util::offer_from_new_peer;
    use crate::webrtc::{CodecSet, MediaApi};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn manager() -> Arc<SessionManager> {
        let config = AppConfig::default();
        let api = Arc::new(MediaApi::new(&config.webrtc, CodecSet::Default).unwrap());
        SessionManager::new(api, &config, Arc::new(EventBus::new()))
    }

    fn config(url: String) -> JanusConfig {
        JanusConfig {
            url,
            request_timeout_ms: 5000,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_subscribe_until_hangup() {
        let (offerer, offer) = offer_from_new_peer().await;
        let starts = Arc::new(AtomicUsize::new(0));
        let started = starts.clone();

        let url = spawn(move |request: &Value| match request["janus"].as_str().unwrap() {
            "create" => vec![reply(request, json!({"janus": "success", "data": {"id": 42}}))],
            "attach" => vec![reply(request, json!({"janus": "success", "data": {"id": 77}}))],
            "keepalive" => vec![reply(request, json!({"janus": "ack"}))],
            "message" if request["body"]["request"] == "join" => {
                assert_eq!(request["body"]["ptype"], "subscriber");
                assert_eq!(request["body"]["room"], 1234);
                assert_eq!(request["body"]["feed"], 1);
                vec![
                    reply(request, json!({"janus": "ack"})),
                    reply(request, json!({"janus": "event", "sender": 77,
                        "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": {"videoroom": "attached"}},
                        "jsep": {"type": "offer", "sdp": offer.sdp}})),
                ]
            }
            "message" => {
                assert_eq!(request["body"]["request"], "start");
                assert_eq!(request["jsep"]["type"], "answer");
                assert!(request["jsep"]["sdp"].as_str().unwrap().contains("m=video"));
                started.fetch_add(1, Ordering::SeqCst);
                vec![
                    reply(request, json!({"janus": "ack"})),
                    reply(request, json!({"janus": "event", "sender": 77,
                        "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": {"videoroom": "event", "started": "ok"}}})),
                    json!({"janus": "webrtcup", "sender": 77}),
                    json!({"janus": "hangup", "sender": 77, "reason": "Close PC"}),
                ]
            }
            "destroy" => vec![reply(request, json!({"janus": "success"}))],
            other => panic!("unexpected request {}", other),
        })
        .await;

        let manager = manager();
        run_subscriber(&config(url), manager.clone(), CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(starts.load(Ordering::SeqCst), 1);
        assert_eq!(manager.session_count().await, 0);
        offerer.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_join_without_offer_fails() {
        let url = spawn(|request: &Value| match request["janus"].as_str().unwrap() {
            "create" => vec![reply(request, json!({"janus": "success", "data": {"id": 42}}))],
            "attach" => vec![reply(request, json!({"janus": "success", "data": {"id": 77}}))],
            "message" => vec![reply(request, json!({"janus": "event",
                "plugindata": {"plugin": VIDEOROOM_PLUGIN, "data": {"videoroom": "attached"}}}))],
            _ => vec![reply(request, json!({"janus": "ack"}))],
        })
        .await;

        let manager = manager();
        let err = run_subscriber(&config(url), manager.clone(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Janus(JanusError::Protocol(_))), "{}", err);
        assert_eq!(manager.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_zero_request_timeout_rejected_before_connecting() {
        let config = JanusConfig {
            // Nothing listens here; validation must fail first
            url: "ws://127.0.0.1:9/janus".to_string(),
            request_timeout_ms: 0,
            ..Default::default()
        };

        let err = run_subscriber(&config, manager(), CancellationToken::new())
            .await
            .unwrap_err();

        assert!(matches!(err, AppError::Config(_)), "{}", err);
    }

    #[tokio::test]
    async fn test_shutdown_ends_subscription() {
        let (offerer, offer) = offer_from_new_peer().await;
        let url = spawn(move |request: &Value| match request["janus"].as_str().unwrap() {
            "create" => vec![reply(request, json!({"janus": "success", "data": {"id": 42}}))],
            "attach" => vec![reply(request, json!({"janus": "success", "data": {"id": 77}}))],
            "message" if request["body"]["request"] == "join" => vec![reply(
                request,
                json!({"janus": "event", "jsep": {"type": "offer", "sdp": offer.sdp}}),
            )],
            "message" => vec![reply(request, json!({"janus": "event"}))],
            "destroy" => vec![reply(request, json!({"janus": "success"}))],
            _ => vec![reply(request, json!({"janus": "ack"}))],
        })
        .await;

        let manager = manager();
        let shutdown = CancellationToken::new();
        let mut events = manager.events().subscribe();
        let task = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            let config = config(url);
            tokio::spawn(async move { run_subscriber(&config, manager, shutdown).await })
        };

        // Wait for the peer session to exist, then stop
        loop {
            if let SessionEvent::SessionCreated { .. } = events.recv().await.unwrap() {
                break;
            }
        }
        shutdown.cancel();

        task.await.unwrap().unwrap();
        assert_eq!(manager.session_count().await, 0);
        offerer.close().await.unwrap();
    }
}
