//! WebSocket upgrade handler

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    response::Response,
};
use futures::stream::{SplitSink, SplitStream};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::game::ConnectionId;
use crate::rooms::{Assignment, JoinRequest, RoomError, RoomManager, RouteError};
use crate::util::coalesce::{slot, SnapshotSubscriber};
use crate::ws::protocol::{ClientMsg, ServerMsg};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JoinAction {
    Create,
    Join,
}

/// Query parameters for WebSocket connection
#[derive(Debug, Default, Deserialize)]
pub struct JoinQuery {
    pub action: Option<JoinAction>,
    pub room: Option<String>,
}

impl JoinQuery {
    /// Where this connection wants to be placed
    pub fn request(self) -> Result<JoinRequest, RoomError> {
        let room = self.room.filter(|r| !r.trim().is_empty());
        match (self.action, room) {
            (action, Some(token)) => Ok(JoinRequest::Token {
                token,
                create_if_missing: action != Some(JoinAction::Join),
            }),
            (Some(JoinAction::Create), None) => Ok(JoinRequest::Create),
            (Some(JoinAction::Join), None) => Err(RoomError::InvalidToken),
            (None, None) => Ok(JoinRequest::Auto),
        }
    }
}

/// WebSocket upgrade handler
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<JoinQuery>,
    State(state): State<AppState>,
) -> Response {
    let request = query.request();
    ws.on_upgrade(move |socket| handle_socket(socket, request, state.rooms))
}

/// Handle the upgraded WebSocket connection
async fn handle_socket(
    socket: WebSocket,
    request: Result<JoinRequest, RoomError>,
    rooms: Arc<RoomManager>,
) {
    let connection: ConnectionId = Uuid::new_v4();
    let (mut ws_sink, ws_stream) = socket.split();
    let (outbox, snapshots) = slot();

    let placed = match request {
        Ok(request) => rooms.place(connection, request, outbox).await,
        Err(e) => Err(e),
    };

    let assignment = match placed {
        Ok(assignment) => assignment,
        Err(e) => {
            info!(connection = %connection, code = e.code(), "Rejected connection: {}", e);
            let _ = send_msg(&mut ws_sink, &ServerMsg::error(e.code(), e.to_string())).await;
            let _ = ws_sink.send(Message::Close(None)).await;
            return;
        }
    };

    info!(
        connection = %connection,
        room_id = %assignment.room_id,
        created = assignment.created,
        "New WebSocket connection"
    );

    let welcome = ServerMsg::RoomAssignment {
        room_id: assignment.room_id.clone(),
        message: assignment_message(&assignment),
    };
    if let Err(e) = send_msg(&mut ws_sink, &welcome).await {
        debug!(connection = %connection, error = %e, "Failed to send room assignment");
    } else {
        run_session(connection, &rooms, ws_sink, ws_stream, snapshots).await;
    }

    rooms.remove(connection).await;
    info!(connection = %connection, room_id = %assignment.room_id, "WebSocket connection closed");
}

fn assignment_message(assignment: &Assignment) -> String {
    if assignment.created {
        format!("Created room {}", assignment.room_id)
    } else {
        format!("Joined room {}", assignment.room_id)
    }
}

/// Run the WebSocket session with read/write split
async fn run_session(
    connection: ConnectionId,
    rooms: &RoomManager,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    mut snapshots: SnapshotSubscriber<Arc<str>>,
) {
    // Writer task: latest room snapshot -> WebSocket
    let writer_handle = tokio::spawn(async move {
        while let Some(frame) = snapshots.next().await {
            if let Err(e) = ws_sink.send(Message::Text(frame.to_string())).await {
                debug!(connection = %connection, error = %e, "WebSocket send failed");
                break;
            }
        }
        debug!(connection = %connection, "Snapshot writer finished");
    });

    // Reader loop: WebSocket -> room
    while let Some(result) = ws_stream.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let msg = match serde_json::from_str::<ClientMsg>(&text) {
                    Ok(msg) => msg,
                    Err(e) => {
                        warn!(connection = %connection, error = %e, "Failed to parse client message");
                        continue;
                    }
                };

                match rooms.route_input(connection, msg) {
                    Ok(()) | Err(RouteError::RateLimited) => {}
                    Err(RouteError::Backlogged) => {
                        debug!(connection = %connection, "Room input queue full, dropping input");
                    }
                    Err(e @ (RouteError::RoomClosed | RouteError::NotAssigned)) => {
                        warn!(connection = %connection, "Ending session: {}", e);
                        break;
                    }
                }
            }
            Ok(Message::Binary(_)) => {
                warn!(connection = %connection, "Received binary message, ignoring");
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                debug!(connection = %connection, "Client initiated close");
                break;
            }
            Err(e) => {
                debug!(connection = %connection, error = %e, "WebSocket error");
                break;
            }
        }
    }

    writer_handle.abort();
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
