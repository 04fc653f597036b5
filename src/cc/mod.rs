//! Pluggable concurrency-control protocols.
//!
//! Each transaction owns one protocol instance. The transaction object
//! handles read-your-own-writes and repeatable-read lookups before an
//! operation ever reaches the protocol, so a protocol sees at most one read
//! and one write per data item.

pub mod pivot;
mod silo;
mod two_phase_locking;

use std::sync::Arc;

use crate::config::ConcurrencyControlProtocol;
use crate::data_item::{DataBuffer, DataItem};
use crate::snapshot::{ReadSet, WriteSet};
use crate::types::{EpochNumber, TransactionId, TxStatus};

pub(crate) use silo::SiloValidator;
pub(crate) use two_phase_locking::TwoPhaseLocking;

pub(crate) trait CcProtocol: Send {
    /// Produces a consistent snapshot of `leaf`. `None` means the protocol
    /// could not serialize the read (lock acquisition failed) and the
    /// transaction must abort.
    fn read(&mut self, leaf: &Arc<DataItem>) -> Option<(DataBuffer, TransactionId)>;

    /// Registers a write of `value` (`None` = tombstone). Optimistic
    /// protocols buffer only; the pessimistic protocol locks and applies
    /// immediately. Returns false when the transaction must abort.
    #[allow(clippy::too_many_arguments)]
    fn write(
        &mut self,
        key: &str,
        table_name: &str,
        index_name: Option<&str>,
        value: Option<&[u8]>,
        leaf: &Arc<DataItem>,
        read_set: &ReadSet,
        need_checkpoint: bool,
    ) -> bool;

    fn abort(&mut self);

    /// Validation and (for optimistic protocols) value installation.
    fn precommit(
        &mut self,
        read_set: &mut ReadSet,
        write_set: &mut WriteSet,
        epoch: EpochNumber,
        need_checkpoint: bool,
    ) -> bool;

    /// Runs after the commit/abort decision: version publication and lock
    /// release.
    fn post_processing(
        &mut self,
        read_set: &mut ReadSet,
        write_set: &mut WriteSet,
        status: TxStatus,
        epoch: EpochNumber,
    );
}

pub(crate) fn make_protocol(protocol: ConcurrencyControlProtocol) -> Box<dyn CcProtocol + Send> {
    match protocol {
        ConcurrencyControlProtocol::Silo => Box::new(SiloValidator::<false>::new()),
        ConcurrencyControlProtocol::SiloNwr => Box::new(SiloValidator::<true>::new()),
        ConcurrencyControlProtocol::TwoPhaseLocking => Box::new(TwoPhaseLocking::new()),
    }
}
