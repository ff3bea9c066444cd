use std::sync::Arc;

use super::{ClusterTestUnit, SingleTestUnit, UnitContext, WholeBatchUnit};
use crate::orchestrator::Delayer;

/// Builds units sharing one tool context and one start-rate limiter.
///
/// Adaptive batches keep a copy to build the children of their failed
/// methods.
#[derive(Clone)]
pub struct UnitFactory {
    ctx: Arc<UnitContext>,
    delayer: Delayer,
}

impl UnitFactory {
    pub fn new(ctx: Arc<UnitContext>, delayer: Delayer) -> Self {
        Self { ctx, delayer }
    }

    pub fn context(&self) -> &Arc<UnitContext> {
        &self.ctx
    }

    pub fn delayer(&self) -> &Delayer {
        &self.delayer
    }

    pub fn single(&self, file: &str, method: &str) -> SingleTestUnit {
        SingleTestUnit::new(Arc::clone(&self.ctx), file, method, None)
    }

    /// A method unit remembering the adaptive batch it was split from.
    pub fn exploded_child(&self, parent_id: &str, file: &str, method: &str) -> SingleTestUnit {
        SingleTestUnit::new(
            Arc::clone(&self.ctx),
            file,
            method,
            Some(parent_id.to_string()),
        )
    }

    pub fn whole_batch(&self, file: &str) -> WholeBatchUnit {
        WholeBatchUnit::new(Arc::clone(&self.ctx), file)
    }

    pub fn adaptive_batch(&self, file: &str) -> ClusterTestUnit {
        ClusterTestUnit::new(self.clone(), self.whole_batch(file))
    }
}
