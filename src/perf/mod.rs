pub mod delay;
pub mod event;
pub mod merge;

use anyhow::Result;
use tokio_util::sync::CancellationToken;

use self::event::{PerfEvent, SourceId};

/// Channel feeding the merge loop; one sender per source reader.
pub type EventTx = tokio::sync::mpsc::Sender<(SourceId, PerfEvent)>;

/// A perf ring-buffer reader: one producer of timestamped events per
/// source. Opening `perf_event_open` descriptors and reading the mmap'd
/// ring buffers lives behind this trait.
pub trait PerfSource: Send {
    /// Begin reading and forwarding events until cancelled. Events from a
    /// single source must be sent in non-decreasing timestamp order.
    fn start(
        &mut self,
        cancel: CancellationToken,
        events: EventTx,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Stop reading and release the descriptors.
    fn stop(&mut self) -> impl std::future::Future<Output = Result<()>> + Send;
}
