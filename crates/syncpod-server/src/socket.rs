//! WebSocket session runtime.
//!
//! One connection = one session in one room. The URL query carries the
//! room id and the edge-issued session token; the pod re-checks the
//! token's HMAC and closes with `Unauthorized` before processing any
//! frame if it does not verify. After a successful attach the session
//! runs two logical flows in one select loop: ingress (decode, state
//! machine, dispatch to the coordinator) and egress (pump the bounded
//! queue onto the wire).

use futures_util::{SinkExt, StreamExt};
use syncpod_core::{
    egress::{EgressClass, EgressConfig},
    session::{CloseReason, DrainReason, Ingress, Session, SessionAction},
    token, Environment, RoomError, RoomId, SessionId,
};
use syncpod_proto::{ControlMsg, ErrorCode, ErrorPayload, FrameKind};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{
    handshake::server::{ErrorResponse, Request, Response},
    Message,
};

use crate::{
    coordinator::RoomMsg,
    hub::EgressHandle,
    registry::{AttachError, RoomHandle, RoomRegistry},
    store::OpStore,
    stream::StreamLog,
    PodShared,
};

/// Accept loop: one task per inbound connection.
pub async fn run_listener<S, L, E>(
    listener: TcpListener,
    registry: RoomRegistry<S, L, E>,
    shared: PodShared<S, L, E>,
) where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    let mut shutdown = shared.shutdown.clone();

    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, addr)) => {
                    tracing::debug!(%addr, "connection accepted");
                    let registry = registry.clone();
                    let shared = shared.clone();
                    tokio::spawn(async move {
                        if let Err(err) = handle_connection(stream, registry, shared).await {
                            tracing::debug!(%addr, error = %err, "connection ended");
                        }
                    });
                },
                Err(err) => {
                    tracing::warn!(error = %err, "accept failed");
                },
            },
            _ = shutdown.changed() => {
                tracing::info!("listener stopped: shutting down");
                break;
            },
        }
    }
}

/// Session attach parameters from the URL query.
struct SessionParams {
    room: String,
    token: String,
}

fn parse_query(query: &str) -> SessionParams {
    let mut room = String::new();
    let mut token = String::new();

    for pair in query.split('&') {
        match pair.split_once('=') {
            Some(("room", value)) => room = percent_decode(value),
            Some(("token", value)) => token = percent_decode(value),
            _ => {},
        }
    }

    SessionParams { room, token }
}

fn percent_decode(value: &str) -> String {
    let bytes = value.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;

    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3]).ok();
                match hex.and_then(|h| u8::from_str_radix(h, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    },
                    None => {
                        out.push(bytes[i]);
                        i += 1;
                    },
                }
            },
            b'+' => {
                out.push(b' ');
                i += 1;
            },
            byte => {
                out.push(byte);
                i += 1;
            },
        }
    }

    String::from_utf8_lossy(&out).into_owned()
}

async fn handle_connection<S, L, E>(
    stream: TcpStream,
    registry: RoomRegistry<S, L, E>,
    shared: PodShared<S, L, E>,
) -> Result<(), crate::PodError>
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    let mut query = String::new();
    let ws = tokio_tungstenite::accept_hdr_async(stream, |req: &Request, resp: Response| {
        query = req.uri().query().unwrap_or("").to_string();
        Ok::<Response, ErrorResponse>(resp)
    })
    .await?;

    let (mut ws_tx, mut ws_rx) = ws.split();
    let params = parse_query(&query);
    let metrics = &shared.metrics;

    // Token first: nothing is processed for an unauthenticated session.
    let claims = match token::verify(
        &params.token,
        &shared.config.token_secret,
        shared.env.wall_clock_ms(),
    ) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::info!(error = %err, "session rejected: bad token");
            metrics.session_closes.inc(CloseReason::Unauthorized.label());
            send_error(&mut ws_tx, ErrorCode::Unauthorized, "invalid session token").await;
            return Ok(());
        },
    };

    let room_id = match RoomId::new(params.room) {
        Ok(room_id) => room_id,
        Err(err) => {
            metrics.session_closes.inc(CloseReason::AttachFailed.label());
            send_error(&mut ws_tx, ErrorCode::ProtocolViolation, &err.to_string()).await;
            return Ok(());
        },
    };

    let session_id: SessionId = shared.env.random_u64();
    let egress = EgressHandle::new(EgressConfig {
        max_bytes: shared.config.egress_bytes,
        max_frames: shared.config.egress_frames,
        slow_client_timeout_ms: u64::try_from(shared.config.slow_client_timeout.as_millis())
            .unwrap_or(u64::MAX),
    });

    let room = match registry
        .attach(&room_id, session_id, &claims.user_id, egress.clone())
        .await
    {
        Ok(room) => room,
        Err(err) => {
            metrics.session_closes.inc(CloseReason::AttachFailed.label());
            let code = match &err {
                AttachError::TooManyRooms { .. } => ErrorCode::TooManyRooms,
                AttachError::Room(RoomError::CapacityExceeded { .. }) => {
                    ErrorCode::RoomCapacityExceeded
                },
                AttachError::Shutdown => ErrorCode::Shutdown,
                AttachError::Room(_) => ErrorCode::ProtocolViolation,
            };
            send_error(&mut ws_tx, code, &err.to_string()).await;
            return Ok(());
        },
    };

    tracing::info!(room = %room_id, session = session_id, user = %claims.user_id,
        "session attached");

    let mut session = Session::new(shared.env.now_ms(), shared.config.session_config());
    session.activate(shared.env.now_ms());

    let close_reason = drive_session(
        &mut session,
        session_id,
        &room,
        &egress,
        &mut ws_tx,
        &mut ws_rx,
        &shared,
    )
    .await;

    registry.detach(&room_id, session_id).await;
    metrics.session_closes.inc(close_reason);
    tracing::info!(room = %room_id, session = session_id, reason = close_reason,
        "session closed");

    let _ = ws_tx.send(Message::Close(None)).await;
    Ok(())
}

type WsSink = futures_util::stream::SplitSink<
    tokio_tungstenite::WebSocketStream<TcpStream>,
    Message,
>;
type WsSource =
    futures_util::stream::SplitStream<tokio_tungstenite::WebSocketStream<TcpStream>>;

/// The live phase: runs until the session closes, returns the close
/// reason label for metrics.
async fn drive_session<S, L, E>(
    session: &mut Session,
    session_id: SessionId,
    room: &RoomHandle,
    egress: &EgressHandle,
    ws_tx: &mut WsSink,
    ws_rx: &mut WsSource,
    shared: &PodShared<S, L, E>,
) -> &'static str
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    let mut tick = tokio::time::interval(std::time::Duration::from_secs(1));
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    let mut shutdown = shared.shutdown.clone();

    let mut drain_deadline: Option<tokio::time::Instant> = None;
    let mut close_reason: &'static str = CloseReason::TransportClosed.label();

    loop {
        let now = shared.env.now_ms();

        tokio::select! {
            message = ws_rx.next() => match message {
                Some(Ok(Message::Binary(data))) => {
                    count_frame_in(shared, &data);
                    let actions = session.on_message(&data, now);
                    match apply_actions(session_id, room, egress, actions, shared, now).await {
                        ControlFlow::Continue => {},
                        ControlFlow::Drain(reason) => {
                            drain_deadline.get_or_insert(drain_deadline_from(shared));
                            close_reason = reason;
                        },
                        ControlFlow::Close(reason) => {
                            close_reason = reason;
                            break;
                        },
                    }
                },
                Some(Ok(Message::Ping(payload))) => {
                    let _ = ws_tx.send(Message::Pong(payload)).await;
                },
                Some(Ok(Message::Close(_))) | None => {
                    close_reason = CloseReason::TransportClosed.label();
                    break;
                },
                Some(Ok(_)) => {
                    // Text and other message types are not part of the
                    // protocol.
                    let actions = session.on_message(&[], now);
                    match apply_actions(session_id, room, egress, actions, shared, now).await {
                        ControlFlow::Continue => {},
                        ControlFlow::Drain(reason) => {
                            drain_deadline.get_or_insert(drain_deadline_from(shared));
                            close_reason = reason;
                        },
                        ControlFlow::Close(reason) => {
                            close_reason = reason;
                            break;
                        },
                    }
                },
                Some(Err(err)) => {
                    tracing::debug!(session = session_id, error = %err, "websocket error");
                    close_reason = CloseReason::TransportClosed.label();
                    break;
                },
            },

            frame = egress.next() => match frame {
                Some(frame) => {
                    match frame.to_vec() {
                        Ok(wire) => {
                            if ws_tx.send(Message::Binary(wire)).await.is_err() {
                                close_reason = CloseReason::TransportClosed.label();
                                break;
                            }
                        },
                        Err(err) => {
                            tracing::error!(session = session_id, error = %err,
                                "outbound frame encode failed");
                        },
                    }
                },
                None => {
                    close_reason = CloseReason::Drained.label();
                    break;
                },
            },

            _ = tick.tick() => {
                let actions = session.on_tick(now);
                match apply_actions(session_id, room, egress, actions, shared, now).await {
                    ControlFlow::Continue => {},
                    ControlFlow::Drain(reason) => {
                        drain_deadline.get_or_insert(drain_deadline_from(shared));
                        close_reason = reason;
                    },
                    ControlFlow::Close(reason) => {
                        close_reason = reason;
                        break;
                    },
                }

                if egress.is_slow() && drain_deadline.is_none() {
                    session.begin_drain();
                    // The queue is full by definition; put the error on the
                    // wire directly instead of through it.
                    let error = ErrorPayload::new(ErrorCode::SlowConsumer, "egress queue full");
                    if let Ok(wire) = error.to_frame().to_vec() {
                        let _ = ws_tx.send(Message::Binary(wire)).await;
                    }
                    drain_deadline = Some(drain_deadline_from(shared));
                    close_reason = DrainReason::SlowConsumer.label();
                }
            },

            _ = shutdown.changed() => {
                if drain_deadline.is_none() {
                    session.begin_drain();
                    egress.push(ControlMsg::Drain.to_frame(), EgressClass::Reliable, now);
                    drain_deadline = Some(drain_deadline_from(shared));
                    close_reason = DrainReason::Shutdown.label();
                }
            },
        }

        if let Some(deadline) = drain_deadline {
            if egress.is_empty() || tokio::time::Instant::now() >= deadline {
                if close_reason == CloseReason::TransportClosed.label() {
                    close_reason = CloseReason::Drained.label();
                }
                break;
            }
        }
    }

    session.close();
    egress.close();
    close_reason
}

enum ControlFlow {
    Continue,
    /// Keep the loop running but start the drain clock.
    Drain(&'static str),
    Close(&'static str),
}

async fn apply_actions<S, L, E>(
    session_id: SessionId,
    room: &RoomHandle,
    egress: &EgressHandle,
    actions: Vec<SessionAction>,
    shared: &PodShared<S, L, E>,
    now: u64,
) -> ControlFlow
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    for action in actions {
        match action {
            SessionAction::Deliver(Ingress::Presence(update)) => {
                if !room.send(RoomMsg::Presence { session: session_id, update }).await {
                    return ControlFlow::Close(CloseReason::TransportClosed.label());
                }
            },
            SessionAction::Deliver(Ingress::Storage(bytes)) => {
                if !room.send(RoomMsg::Storage { session: session_id, bytes }).await {
                    return ControlFlow::Close(CloseReason::TransportClosed.label());
                }
            },
            SessionAction::Deliver(Ingress::Resync) => {
                if !room.send(RoomMsg::Resync { session: session_id }).await {
                    return ControlFlow::Close(CloseReason::TransportClosed.label());
                }
            },
            SessionAction::Send(frame) => {
                shared.metrics.frames_out.inc(kind_label(frame.kind));
                egress.push(frame, EgressClass::Reliable, now);
            },
            SessionAction::BeginDrain(reason) => {
                tracing::debug!(session = session_id, reason = reason.label(), "session draining");
                return ControlFlow::Drain(reason.label());
            },
            SessionAction::Close(reason) => {
                return ControlFlow::Close(reason.label());
            },
        }
    }

    ControlFlow::Continue
}

fn drain_deadline_from<S, L, E>(shared: &PodShared<S, L, E>) -> tokio::time::Instant
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    tokio::time::Instant::now() + shared.config.drain_timeout
}

fn count_frame_in<S, L, E>(shared: &PodShared<S, L, E>, data: &[u8])
where
    S: OpStore,
    L: StreamLog,
    E: Environment,
{
    let label = data
        .first()
        .and_then(|&tag| FrameKind::from_u8(tag))
        .map_or("unknown", kind_label);
    shared.metrics.frames_in.inc(label);
}

fn kind_label(kind: FrameKind) -> &'static str {
    match kind {
        FrameKind::PresenceDiff => "presence_diff",
        FrameKind::StorageUpdate => "storage_update",
        FrameKind::PresenceSync => "presence_sync",
        FrameKind::StorageSync => "storage_sync",
        FrameKind::Error => "error",
        FrameKind::Control => "control",
    }
}

async fn send_error(ws_tx: &mut WsSink, code: ErrorCode, message: &str) {
    let frame = ErrorPayload::new(code, message).to_frame();
    if let Ok(wire) = frame.to_vec() {
        let _ = ws_tx.send(Message::Binary(wire)).await;
    }
    let _ = ws_tx.send(Message::Close(None)).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn query_parsing_extracts_room_and_token() {
        let params = parse_query("room=design%2F42&token=u1.99.abcd&extra=1");
        assert_eq!(params.room, "design/42");
        assert_eq!(params.token, "u1.99.abcd");
    }

    #[test]
    fn query_parsing_tolerates_missing_fields() {
        let params = parse_query("");
        assert!(params.room.is_empty());
        assert!(params.token.is_empty());
    }

    #[test]
    fn percent_decoding() {
        assert_eq!(percent_decode("a%20b"), "a b");
        assert_eq!(percent_decode("a+b"), "a b");
        assert_eq!(percent_decode("plain"), "plain");
        // Truncated escapes pass through rather than panic.
        assert_eq!(percent_decode("x%2"), "x%2");
        assert_eq!(percent_decode("x%zz"), "x%zz");
    }
}
