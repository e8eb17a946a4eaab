use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;

use boardhub::db::{MemStore, RoomStore};
use boardhub::models::{Room, SnapshotMeta, StatsResponse};
use boardhub::routes::build_router;
use boardhub::ws::{Hub, HubConfig};

async fn start_server() -> (SocketAddr, Arc<MemStore>) {
    let store = Arc::new(MemStore::new());
    let hub = Hub::new(HubConfig::default(), store.clone() as Arc<dyn RoomStore>);
    let app = build_router(hub, None);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    (addr, store)
}

#[tokio::test]
async fn room_crud_round_trip() -> Result<()> {
    let (addr, _store) = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let created = client
        .post(format!("{base}/api/rooms"))
        .json(&serde_json::json!({
            "id": "board-1",
            "name": "Design sync",
            "creator_id": "u1",
            "visibility": "private",
        }))
        .send()
        .await?;
    assert_eq!(created.status(), 201);
    let room: Room = created.json().await?;
    assert_eq!(room.id, "board-1");
    assert_eq!(room.name, "Design sync");

    let conflict = client
        .post(format!("{base}/api/rooms"))
        .json(&serde_json::json!({
            "id": "board-1",
            "name": "Other",
            "creator_id": "u2",
        }))
        .send()
        .await?;
    assert_eq!(conflict.status(), 409);

    let fetched: Room = client
        .get(format!("{base}/api/rooms/board-1"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(fetched, room);

    let exists: serde_json::Value = client
        .get(format!("{base}/api/rooms/board-1/exists"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(exists["exists"], true);

    let patched: Room = client
        .patch(format!("{base}/api/rooms/board-1"))
        .json(&serde_json::json!({"name": "Renamed"}))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(patched.name, "Renamed");
    assert_eq!(patched.visibility, room.visibility);

    let deleted = client
        .delete(format!("{base}/api/rooms/board-1"))
        .send()
        .await?;
    assert_eq!(deleted.status(), 204);

    let gone = client
        .get(format!("{base}/api/rooms/board-1"))
        .send()
        .await?;
    assert_eq!(gone.status(), 404);

    let exists: serde_json::Value = client
        .get(format!("{base}/api/rooms/board-1/exists"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(exists["exists"], false);
    Ok(())
}

#[tokio::test]
async fn snapshot_listing_respects_limit_and_order() -> Result<()> {
    let (addr, store) = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    store
        .create_room("board-2", "Board", "u1", Default::default())
        .await
        .unwrap();
    for i in 0..5u8 {
        store
            .write_snapshot("board-2", vec![i], vec![])
            .await
            .unwrap();
    }

    let metas: Vec<SnapshotMeta> = client
        .get(format!("{base}/api/rooms/board-2/snapshots?limit=3"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(metas.len(), 3);
    assert_eq!(metas[0].version, 5);
    assert_eq!(metas[2].version, 3);

    let missing = client
        .get(format!("{base}/api/rooms/nope/snapshots"))
        .send()
        .await?;
    assert_eq!(missing.status(), 404);
    Ok(())
}

#[tokio::test]
async fn health_ready_and_stats_respond() -> Result<()> {
    let (addr, _store) = start_server().await;
    let client = reqwest::Client::new();
    let base = format!("http://{addr}");

    let health: serde_json::Value = client
        .get(format!("{base}/health"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(health["status"], "ok");

    let ready: serde_json::Value = client
        .get(format!("{base}/ready"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(ready["status"], "ok");

    let stats: StatsResponse = client
        .get(format!("{base}/api/stats"))
        .send()
        .await?
        .json()
        .await?;
    assert_eq!(stats.active_sessions, 0);
    assert_eq!(stats.live_documents, 0);
    Ok(())
}
