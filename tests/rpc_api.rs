use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use layoutd::adapters::{SimPool, SimulatedPools, Simulator};
use layoutd::config::AppConfig;
use layoutd::context::AppContext;
use layoutd::core::device::{DeviceId, MDS_DEVICE_ID};
use layoutd::core::namespace::{FileId, FileKind, HandleNamespace};
use layoutd::core::orchestrator::run_events;
use layoutd::core::state::{StateHandler, StateId};
use layoutd::door::{DoorOptions, Layout, LayoutDoor, status};
use layoutd::rpc::{ClientError, NFS_ERROR, RpcClient, RpcServer};
use serde_json::{Value, json};
use tokio::sync::mpsc;

async fn start() -> (RpcClient, Arc<LayoutDoor>, Simulator) {
    let (tx, rx) = mpsc::channel(64);
    let (pools, sim) = SimulatedPools::new(vec![SimPool::new("pool-1", &["10.0.0.1:2049"], 7)], tx.clone());
    let pools = Arc::new(pools);

    let options = DoorOptions {
        reply_timeout: Duration::from_secs(2),
        ..DoorOptions::default()
    };
    let door = Arc::new(LayoutDoor::new(options, pools.clone(), pools, Arc::new(HandleNamespace)));
    tokio::spawn(run_events(door.clone(), rx));

    let config = AppConfig {
        rpc_bind: "127.0.0.1:0".parse().unwrap(),
        simulation: true,
        ..AppConfig::default()
    };
    let ctx = AppContext::with_door(config.clone(), door.clone(), tx);
    let server = Arc::new(RpcServer::bind(ctx, config.rpc_bind).await.unwrap());
    let addr: SocketAddr = server.local_addr().unwrap();
    tokio::spawn(async move { server.start().await });

    (RpcClient::new(addr), door, sim)
}

fn handle(id: &str) -> Value {
    serde_json::to_value(HandleNamespace::handle_for(&FileId(id.into()), FileKind::Regular)).unwrap()
}

#[tokio::test]
async fn layout_round_trip_over_rpc() {
    let (client, door, sim) = start().await;
    sim.set_auto_ready(false);

    let token: StateId = client.call_no_params("state.open").await.unwrap();

    // the pool reports through the same listener
    let report = {
        let client = client.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client
                .call::<bool>(
                    "pool.ready",
                    Some(json!({
                        "state_id": token,
                        "pool": "pool-1",
                        "addresses": ["10.0.0.1:2049"],
                        "verifier": 7
                    })),
                )
                .await
        })
    };

    let layout: Layout = client
        .call(
            "layout.get",
            Some(json!({ "handle": handle("0000F"), "iomode": 1, "state_id": token })),
        )
        .await
        .unwrap();
    assert!(report.await.unwrap().unwrap());

    let device_id = layout.segments[0].device_id;
    let info: Value = client
        .call("device.info", Some(json!({ "device_id": device_id })))
        .await
        .unwrap();
    assert_eq!(info["multipath"][0][0], "10.0.0.1:2049");

    let ids: Vec<DeviceId> = client.call_no_params("device.list").await.unwrap();
    assert_eq!(ids, vec![device_id]);

    // the id is the 16-byte wire form on the way out
    let raw: Value = client.call_no_params("device.list").await.unwrap();
    assert_eq!(raw[0], "00000001000000000000000000000000");

    let valid: bool = client
        .call("mover.validate", Some(json!({ "state_id": token })))
        .await
        .unwrap();
    assert!(valid);

    let returned: bool = client
        .call("layout.return", Some(json!({ "state_id": token })))
        .await
        .unwrap();
    assert!(returned);
    assert!(door.ledger().is_empty());
}

#[tokio::test]
async fn bad_state_carries_nfs_status() {
    let (client, _door, _sim) = start().await;
    let foreign = StateHandler::new().create_state();

    let err = client
        .call::<Layout>(
            "layout.get",
            Some(json!({ "handle": handle("0000F"), "iomode": 2, "state_id": foreign })),
        )
        .await
        .unwrap_err();

    let ClientError::Rpc(err) = err else {
        panic!("expected an RPC error");
    };
    assert_eq!(err.code, NFS_ERROR);
    let data = err.data.unwrap();
    assert_eq!(data["status"], status::NFS4ERR_BAD_STATEID);
    assert_eq!(data["transient"], false);
}

#[tokio::test]
async fn metadata_device_uses_connection_address() {
    let (client, _door, _sim) = start().await;

    let info: Value = client
        .call("device.info", Some(json!({ "device_id": MDS_DEVICE_ID })))
        .await
        .unwrap();
    assert_eq!(info["multipath"][0][0], client.addr().to_string());

    let missing = client
        .call::<Value>("device.info", Some(json!({ "device_id": DeviceId(42) })))
        .await;
    assert!(matches!(missing, Err(ClientError::Rpc(_))));
}

#[tokio::test]
async fn admin_methods() {
    let (client, _door, _sim) = start().await;
    let token: StateId = client.call_no_params("state.open").await.unwrap();
    let _: Layout = client
        .call(
            "layout.get",
            Some(json!({ "handle": handle("0000F"), "iomode": 1, "state_id": token })),
        )
        .await
        .unwrap();

    let status: Value = client.call_no_params("daemon.status").await.unwrap();
    assert_eq!(status["active_transfers"], 1);
    assert_eq!(status["simulation"], true);

    let pools: Vec<Value> = client
        .call("pools.list", Some(json!({ "pool": "pool-1" })))
        .await
        .unwrap();
    assert_eq!(pools.len(), 1);

    let transfers: Vec<Value> = client.call_no_params("transfers.list").await.unwrap();
    assert_eq!(transfers[0]["pool"], "pool-1");
    let mover_id = transfers[0]["mover_id"].clone();

    let outcome: String = client
        .call("mover.kill", Some(json!({ "pool": "pool-1", "mover_id": mover_id })))
        .await
        .unwrap();
    assert_eq!(outcome, "transfer");

    let reset: Value = client
        .call("pool.reset_id", Some(json!({ "pool": "pool-1" })))
        .await
        .unwrap();
    assert_eq!(reset["pool"], "pool-1");

    let released: Vec<StateId> = client
        .call("state.close", Some(json!({ "state_id": token })))
        .await
        .unwrap();
    assert_eq!(released.len(), 2);
}

#[tokio::test]
async fn unknown_method() {
    let (client, _door, _sim) = start().await;
    let err = client.call_no_params::<Value>("layout.commit").await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc(e) if e.code == -32601));
}

#[tokio::test]
async fn finished_report_must_name_the_current_mover() {
    let (client, door, sim) = start().await;
    let token: StateId = client.call_no_params("state.open").await.unwrap();
    let _: Layout = client
        .call(
            "layout.get",
            Some(json!({ "handle": handle("0000F"), "iomode": 1, "state_id": token })),
        )
        .await
        .unwrap();
    let mover_id = sim.started()[0].mover_id;

    let stale: bool = client
        .call(
            "transfer.finished",
            Some(json!({ "state_id": token, "pool": "pool-1", "mover_id": mover_id + 100, "return_code": 0 })),
        )
        .await
        .unwrap();
    assert!(stale);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(door.ledger().len(), 1);

    let _: bool = client
        .call(
            "transfer.finished",
            Some(json!({ "state_id": token, "pool": "pool-1", "mover_id": mover_id, "return_code": 0 })),
        )
        .await
        .unwrap();
    let drained = tokio::time::timeout(Duration::from_secs(2), async {
        while !door.ledger().is_empty() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(drained.is_ok(), "finished report not applied");
}
