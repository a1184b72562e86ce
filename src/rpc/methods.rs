//! Method dispatch.
//!
//! Three audiences share the listener: NFS clients (`layout.*`, `device.*`,
//! `state.*`), pools reporting on their movers (`pool.ready`,
//! `transfer.finished`, `mover.validate`) and admins.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tracing::debug;

use crate::context::AppContext;
use crate::core::device::{DeviceId, LayoutType};
use crate::core::messaging::{DoorEvent, PoolReady, TransferFinished};
use crate::core::namespace::FileHandle;
use crate::core::state::StateId;
use crate::core::transfer::{IoMode, Subject};
use crate::door::{CallContext, DoorInfo, NfsError};

use super::protocol::{NFS_ERROR, NOT_FOUND, Request, Response};
use super::transport::Peer;

pub struct MethodHandler {
    ctx: AppContext,
}

fn parse<T: DeserializeOwned>(id: &Value, params: Value) -> Result<T, Response> {
    serde_json::from_value(params).map_err(|e| Response::invalid_params(id.clone(), e.to_string()))
}

fn nfs_error(id: Value, err: NfsError) -> Response {
    Response::error_with_data(
        id,
        NFS_ERROR,
        err.to_string(),
        json!({ "status": err.status(), "transient": err.is_transient() }),
    )
}

#[derive(Deserialize)]
struct StateParams {
    state_id: StateId,
}

impl MethodHandler {
    pub fn new(ctx: AppContext) -> Self {
        Self { ctx }
    }

    pub async fn handle(&self, request: Request, peer: Peer) -> Response {
        let id = request.id.clone().unwrap_or(Value::Null);
        let params = request.params.unwrap_or(Value::Null);

        let result = match request.method.as_str() {
            "layout.get" => self.layout_get(&id, params, peer).await,
            "layout.return" => self.layout_return(&id, params).await,
            "device.info" => self.device_info(&id, params, peer),
            "device.list" => Ok(Response::success(id.clone(), self.ctx.door.get_device_list())),
            "state.open" => Ok(Response::success(id.clone(), self.ctx.door.open_state())),
            "state.close" => self.state_close(&id, params),
            "pool.ready" => self.pool_ready(&id, params).await,
            "transfer.finished" => self.transfer_finished(&id, params).await,
            "mover.validate" => self.mover_validate(&id, params),
            "daemon.status" => Ok(self.daemon_status(id.clone())),
            "pools.list" => self.pools_list(&id, params),
            "transfers.list" => Ok(Response::success(id.clone(), self.ctx.door.transfers())),
            "pool.reset_id" => self.pool_reset_id(&id, params),
            "mover.kill" => self.mover_kill(&id, params),
            _ => Ok(Response::method_not_found(id.clone(), &request.method)),
        };

        result.unwrap_or_else(|response| response)
    }

    async fn layout_get(&self, id: &Value, params: Value, peer: Peer) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            handle: FileHandle,
            #[serde(default = "files_layout")]
            layout_type: u32,
            iomode: u32,
            state_id: StateId,
            #[serde(default)]
            subject: Option<Subject>,
        }
        fn files_layout() -> u32 {
            1
        }

        let params: Params = parse(id, params)?;
        let mode = IoMode::from_wire(params.iomode).ok_or_else(|| {
            Response::invalid_params(id.clone(), format!("invalid iomode {}", params.iomode))
        })?;
        let Some(layout_type) = LayoutType::from_wire(params.layout_type) else {
            let err = NfsError::LayoutUnavailable(format!("layout type {}", params.layout_type));
            return Err(nfs_error(id.clone(), err));
        };

        let call = CallContext {
            subject: params.subject.unwrap_or(Subject::ROOT),
            remote: peer.remote,
            local: peer.local,
        };

        self.ctx
            .door
            .layout_get(&call, &params.handle, layout_type, mode, params.state_id)
            .await
            .map(|layout| Response::success(id.clone(), layout))
            .map_err(|e| nfs_error(id.clone(), e))
    }

    async fn layout_return(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: StateParams = parse(id, params)?;
        self.ctx
            .door
            .layout_return(params.state_id)
            .await
            .map(|()| Response::success(id.clone(), true))
            .map_err(|e| nfs_error(id.clone(), e))
    }

    fn device_info(&self, id: &Value, params: Value, peer: Peer) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            device_id: DeviceId,
        }

        let params: Params = parse(id, params)?;
        let call = CallContext {
            subject: Subject::ROOT,
            remote: peer.remote,
            local: peer.local,
        };

        match self.ctx.door.get_device_info(&call, params.device_id) {
            Some(addr) => Ok(Response::success(id.clone(), addr)),
            None => Err(Response::error(
                id.clone(),
                NOT_FOUND,
                format!("Unknown device id: {}", params.device_id),
            )),
        }
    }

    fn state_close(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: StateParams = parse(id, params)?;
        self.ctx
            .door
            .close_state(params.state_id)
            .map(|released| Response::success(id.clone(), released))
            .map_err(|e| nfs_error(id.clone(), e))
    }

    async fn pool_ready(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let report: PoolReady = parse(id, params)?;
        self.forward(id, DoorEvent::PoolReady(report)).await
    }

    async fn transfer_finished(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let report: TransferFinished = parse(id, params)?;
        self.forward(id, DoorEvent::TransferFinished(report)).await
    }

    async fn forward(&self, id: &Value, event: DoorEvent) -> Result<Response, Response> {
        debug!(?event, "Pool report received");
        self.ctx
            .events
            .send(event)
            .await
            .map_err(|_| Response::internal_error(id.clone(), "door is shutting down"))?;
        Ok(Response::success(id.clone(), true))
    }

    fn mover_validate(&self, id: &Value, params: Value) -> Result<Response, Response> {
        let params: StateParams = parse(id, params)?;
        let valid = self.ctx.door.validate_mover(&params.state_id);
        Ok(Response::success(id.clone(), valid))
    }

    fn daemon_status(&self, id: Value) -> Response {
        #[derive(Serialize)]
        struct DaemonStatus {
            version: &'static str,
            rpc_bind: String,
            simulation: bool,
            #[serde(flatten)]
            door: DoorInfo,
        }

        Response::success(
            id,
            DaemonStatus {
                version: env!("CARGO_PKG_VERSION"),
                rpc_bind: self.ctx.config.rpc_bind.to_string(),
                simulation: self.ctx.config.simulation,
                door: self.ctx.door.info(),
            },
        )
    }

    fn pools_list(&self, id: &Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize, Default)]
        struct Params {
            #[serde(default)]
            pool: Option<String>,
        }

        let params: Params = if params.is_null() {
            Params::default()
        } else {
            parse(id, params)?
        };
        let pools = self.ctx.door.pools(params.pool.as_deref());
        Ok(Response::success(id.clone(), pools))
    }

    fn pool_reset_id(&self, id: &Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            pool: String,
        }

        let params: Params = parse(id, params)?;
        match self.ctx.door.reset_pool(&params.pool) {
            Some(device) => Ok(Response::success(
                id.clone(),
                json!({ "pool": params.pool, "device_id": device.id }),
            )),
            None => Err(Response::error(
                id.clone(),
                NOT_FOUND,
                format!("Pool not known: {}", params.pool),
            )),
        }
    }

    fn mover_kill(&self, id: &Value, params: Value) -> Result<Response, Response> {
        #[derive(Deserialize)]
        struct Params {
            pool: String,
            mover_id: u32,
        }

        let params: Params = parse(id, params)?;
        let outcome = self.ctx.door.kill_mover(&params.pool, params.mover_id);
        Ok(Response::success(id.clone(), outcome))
    }
}
