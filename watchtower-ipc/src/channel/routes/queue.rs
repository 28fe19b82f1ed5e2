// SPDX-License-Identifier: Apache-2.0

use std::sync::{Arc, Mutex};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::channel::{Route, RouteHandler};

/// Wire command for the `queue` route's AMP-style request/response records.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum QueueCommand {
    Enqueue { work_id: u64 },
    Claim { work_id: u64 },
    Ack { work_id: u64 },
    Nack { work_id: u64 },
}

/// Coordinator-side state: available and claimed work ids. A single
/// coordinator (the master) is shared across every worker connection on
/// this route.
#[derive(Default)]
pub struct QueueState {
    pub available: Vec<u64>,
    pub claimed: std::collections::HashSet<u64>,
}

pub struct QueueRouteHandler {
    state: Arc<Mutex<QueueState>>,
}

impl RouteHandler for QueueRouteHandler {
    fn on_frame(&mut self, payload: Bytes) -> anyhow::Result<()> {
        let command: QueueCommand = bincode::deserialize(&payload)?;
        #[allow(clippy::unwrap_used)]
        let mut state = self.state.lock().unwrap();
        match command {
            QueueCommand::Enqueue { work_id } => state.available.push(work_id),
            QueueCommand::Claim { work_id } => {
                state.available.retain(|id| *id != work_id);
                state.claimed.insert(work_id);
            }
            QueueCommand::Ack { work_id } | QueueCommand::Nack { work_id } => {
                state.claimed.remove(&work_id);
            }
        }
        Ok(())
    }
}

pub fn queue_route(state: Arc<Mutex<QueueState>>) -> Route {
    Route::new("queue", move || {
        Box::new(QueueRouteHandler {
            state: state.clone(),
        }) as Box<dyn RouteHandler>
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn claim_moves_work_from_available_to_claimed() {
        let state = Arc::new(Mutex::new(QueueState::default()));
        let mut handler = QueueRouteHandler {
            state: state.clone(),
        };
        let enqueue = bincode::serialize(&QueueCommand::Enqueue { work_id: 7 }).unwrap();
        handler.on_frame(Bytes::from(enqueue)).unwrap();
        let claim = bincode::serialize(&QueueCommand::Claim { work_id: 7 }).unwrap();
        handler.on_frame(Bytes::from(claim)).unwrap();

        #[allow(clippy::unwrap_used)]
        let state = state.lock().unwrap();
        assert!(state.available.is_empty());
        assert!(state.claimed.contains(&7));
    }
}
