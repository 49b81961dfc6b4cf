use std::sync::Arc;

use log::debug;

use super::serializer::HostEnvelope;
use super::{TxPoolError, TxStatus, TxStatusProvider};

/// Phase of the host mempool in which a transaction is being validated.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExecMode {
    /// First admission into the host mempool.
    Check,
    /// Re-validation of entries after a block commits.
    ReCheck,
    Deliver,
}

/// Host mempool hook that ejects wrapped VM transactions once the VM pool reports them included.
/// Only re-checks eject: other nodes may not have seen the inclusion yet on first admission.
pub struct AdmissionFilter {
    pool: Arc<dyn TxStatusProvider>,
}

impl AdmissionFilter {
    pub fn new(pool: Arc<dyn TxStatusProvider>) -> Self {
        Self { pool }
    }

    /// `Err(TxPoolError::Eject)` tells the host to drop `raw` from its mempool; anything else is
    /// passed on.
    pub fn ante_handle(&self, mode: ExecMode, raw: &[u8]) -> Result<(), TxPoolError> {
        if mode != ExecMode::ReCheck {
            return Ok(())
        }
        let tx = match HostEnvelope::decode(raw).and_then(|e| e.unwrap_tx()) {
            Ok(tx) => tx,
            // not ours to judge
            Err(_) => return Ok(()),
        };
        if self.should_eject(&tx) {
            debug!("ejecting {} from host mempool", tx.hash());
            return Err(TxPoolError::Eject(*tx.hash()))
        }
        Ok(())
    }

    fn should_eject(&self, tx: &crate::tx::Transaction) -> bool {
        self.pool.status(tx.hash()) == TxStatus::Included
    }
}
