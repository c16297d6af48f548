//! The shared context handed to every thread of the roster: global state,
//! the pool registry, the stratum session handle and the work I/O queue.

use std::sync::Arc;

use tokio::sync::{mpsc, oneshot};

use crate::pools::PoolManager;
use crate::state::SharedState;
use crate::stratum::StratumClient;
use crate::work::Work;
use crate::workio::WorkIoCmd;

pub struct Ctx {
    pub state: Arc<SharedState>,
    pub pools: PoolManager,
    pub stratum: StratumClient,
    pub workio_tx: mpsc::Sender<WorkIoCmd>,
    pub longpoll_tx: mpsc::UnboundedSender<String>,
}

impl Ctx {
    pub fn new(
        state: Arc<SharedState>,
        stratum_tx: mpsc::UnboundedSender<String>,
        longpoll_tx: mpsc::UnboundedSender<String>,
        workio_tx: mpsc::Sender<WorkIoCmd>,
    ) -> Self {
        let pools = PoolManager::new(state.clone(), stratum_tx, longpoll_tx.clone());
        Self {
            state,
            pools,
            stratum: StratumClient::new(),
            workio_tx,
            longpoll_tx,
        }
    }

    /// Ask the work I/O actor to wind down (time limit, fatal error).
    pub fn request_workio_abort(&self) {
        let _ = self.workio_tx.try_send(WorkIoCmd::Abort);
    }

    /// Worker-side synchronous work fetch through the actor.
    pub fn get_work_blocking(&self) -> Option<Work> {
        let (reply, rx) = oneshot::channel();
        self.workio_tx
            .blocking_send(WorkIoCmd::GetWork { reply })
            .ok()?;
        rx.blocking_recv().ok().flatten()
    }

    /// Worker-side solution hand-off to the actor (non-stratum pools).
    pub fn submit_blocking(&self, work: Work) -> bool {
        self.workio_tx
            .blocking_send(WorkIoCmd::Submit(Box::new(work)))
            .is_ok()
    }
}
