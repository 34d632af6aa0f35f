use tokio::select;
use tokio_util::sync::CancellationToken;

/// Detects signals sent to the process. The usual way the host ends is the
/// browser closing its end of the message stream; this covers manual runs
/// from a terminal.
pub async fn detect_shutdown(cancelation: CancellationToken) {
    select! {
        _ = tokio::signal::ctrl_c() => {
            cancelation.cancel();
        },
    };
}
