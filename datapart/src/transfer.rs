//! Transfer of a single part to its pre-signed URL.
use crate::api::PartTransport;
use crate::Result;
use bytes::Bytes;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use url::Url;

/// Transfer `data` as part `part_number`, returning the ETag object storage assigned to it.
///
/// `on_progress` is invoked with the cumulative number of bytes of this part sent so far, as the
/// transport reports them.
///
/// If `cancel` fires before the transport finishes, the transfer future is dropped (which
/// abandons the request) and this fails with [`crate::UploadError::PartTransferAborted`].  An
/// already-cancelled token aborts the transfer before it starts.
pub(crate) async fn transfer_part(
    transport: &dyn PartTransport,
    part_number: u32,
    url: Url,
    data: Bytes,
    cancel: &CancellationToken,
    mut on_progress: impl FnMut(u64),
) -> Result<String> {
    if cancel.is_cancelled() {
        return crate::error::PartTransferAbortedSnafu { part_number }.fail();
    }

    let (progress_sender, mut progress_receiver) = mpsc::unbounded_channel();
    let put = transport.put_part(url, data, progress_sender);
    tokio::pin!(put);

    // Once the transport drops its sender there are no more progress updates to wait for
    let mut progress_open = true;

    loop {
        tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!(part_number, "Part transfer aborted");
                return crate::error::PartTransferAbortedSnafu { part_number }.fail();
            }

            result = &mut put => {
                return result;
            }

            update = progress_receiver.recv(), if progress_open => {
                match update {
                    Some(bytes) => on_progress(bytes),
                    None => progress_open = false,
                }
            }
        }
    }
}
