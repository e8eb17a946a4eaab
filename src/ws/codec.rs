use crate::models::{ClientFrame, ServerFrame};

/// Why an inbound frame did not become a [`ClientFrame`].
///
/// `Oversized` closes the session; `Malformed` only earns an error frame.
#[derive(Debug)]
pub enum DecodeError {
    Oversized { len: usize, limit: usize },
    Malformed(serde_json::Error),
}

impl std::fmt::Display for DecodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DecodeError::Oversized { len, limit } => {
                write!(f, "frame of {} bytes exceeds the {} byte limit", len, limit)
            }
            DecodeError::Malformed(e) => write!(f, "malformed frame: {}", e),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Parse one inbound text frame. A frame of exactly `max_bytes` is accepted.
pub fn decode_frame(text: &str, max_bytes: usize) -> Result<ClientFrame, DecodeError> {
    if text.len() > max_bytes {
        return Err(DecodeError::Oversized {
            len: text.len(),
            limit: max_bytes,
        });
    }
    serde_json::from_str(text).map_err(DecodeError::Malformed)
}

/// Serialize one outbound frame.
pub fn encode_frame(frame: &ServerFrame) -> String {
    // Our frame types serialize infallibly; a failure here is a programmer
    // error and the process should go down fast.
    serde_json::to_string(frame).expect("outbound frame serialization")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::*;
    use uuid::Uuid;

    const LIMIT: usize = 1024;

    #[test]
    fn decodes_connect() {
        let frame = decode_frame(
            r##"{"type":"connect","roomId":"r1","user":{"id":"u1","name":"A","color":"#f00"}}"##,
            LIMIT,
        )
        .unwrap();
        match frame {
            ClientFrame::Connect(c) => {
                assert_eq!(c.room_id, "r1");
                assert_eq!(c.user.name, "A");
                assert!(c.token.is_none());
            }
            other => panic!("unexpected frame: {other:?}"),
        }
    }

    #[test]
    fn decodes_update_delta_as_base64() {
        let frame = decode_frame(r#"{"type":"update","delta":"AAEC"}"#, LIMIT).unwrap();
        assert_eq!(
            frame,
            ClientFrame::Update(UpdateFrame {
                delta: vec![0, 1, 2]
            })
        );
    }

    #[test]
    fn decodes_bare_leave() {
        assert_eq!(decode_frame(r#"{"type":"leave"}"#, LIMIT).unwrap(), ClientFrame::Leave);
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = decode_frame(r#"{"type":"teleport"}"#, LIMIT).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn frame_at_limit_is_accepted_one_past_is_not() {
        let padding = LIMIT - r#"{"type":"chat","userName":"a","message":"","timestamp":1}"#.len();
        let exactly = format!(
            r#"{{"type":"chat","userName":"a","message":"{}","timestamp":1}}"#,
            "x".repeat(padding)
        );
        assert_eq!(exactly.len(), LIMIT);
        assert!(decode_frame(&exactly, LIMIT).is_ok());

        let over = format!(
            r#"{{"type":"chat","userName":"a","message":"{}","timestamp":1}}"#,
            "x".repeat(padding + 1)
        );
        assert!(matches!(
            decode_frame(&over, LIMIT),
            Err(DecodeError::Oversized { .. })
        ));
    }

    #[test]
    fn outbound_frames_round_trip() {
        let client = Uuid::new_v4();
        let user = UserInfo {
            id: "u1".into(),
            name: "A".into(),
            color: "#f00".into(),
        };
        let frames = vec![
            ServerFrame::SyncResponse(SyncResponseFrame {
                snapshot_data: vec![1, 2, 3],
                participants: vec![ParticipantEntry {
                    client_id: client,
                    user: user.clone(),
                    joined_at: chrono::Utc::now(),
                }],
            }),
            ServerFrame::Join(JoinFrame {
                user: user.clone(),
                client_id: client,
                room_id: "r1".into(),
            }),
            ServerFrame::Leave(LeaveFrame {
                client_id: client,
                user_id: "u1".into(),
            }),
            ServerFrame::Update(UpdateRelayFrame {
                delta: vec![9, 8],
                from: client,
            }),
            ServerFrame::Presence(PresenceFrame {
                client_id: client.to_string(),
                cursor: Some(Cursor { x: 10.0, y: 20.0 }),
                selection: None,
                viewport: Some(Viewport {
                    x: 0.0,
                    y: 0.0,
                    zoom: 1.5,
                }),
            }),
            ServerFrame::Chat(ChatRelayFrame {
                user_name: "A".into(),
                message: "hi".into(),
                timestamp: 123,
                client_id: client,
            }),
            ServerFrame::Heartbeat(HeartbeatFrame { timestamp: 42 }),
            ServerFrame::error(ErrorCode::Flood, "too fast"),
        ];

        for frame in frames {
            let text = encode_frame(&frame);
            let back: ServerFrame = serde_json::from_str(&text).unwrap();
            assert_eq!(back, frame);
        }
    }

    #[test]
    fn wire_tags_match_the_protocol() {
        let text = encode_frame(&ServerFrame::SyncResponse(SyncResponseFrame {
            snapshot_data: vec![],
            participants: vec![],
        }));
        assert!(text.contains(r#""type":"sync-response""#));
        assert!(text.contains(r#""snapshotData""#));

        let text = encode_frame(&ServerFrame::error(ErrorCode::InvalidMessage, "bad"));
        assert!(text.contains(r#""code":"INVALID_MESSAGE""#));
    }
}
