//! Deterministic scan host for demos and integration tests. Speaks the
//! real wire protocol on stdin/stdout; verdicts come from the filename
//! (`malware`, `suspect`, `scanfail`, `locked`).

use scanhost_proto::runtime;
use scanhost_proto::testhost::MockScanHost;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    runtime::run(MockScanHost::default()).await
}
