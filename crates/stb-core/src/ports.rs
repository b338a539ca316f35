use std::path::Path;

use async_trait::async_trait;

use crate::{
    domain::{KeyReference, RemoteTarget},
    Result,
};

/// Opens authenticated sessions to the remote host.
///
/// Failure here is fatal for the run and must be reported as `Error::Connection`.
#[async_trait]
pub trait RemoteConnector: Send + Sync {
    async fn connect(
        &self,
        target: &RemoteTarget,
        key: &KeyReference,
    ) -> Result<Box<dyn RemoteSession>>;
}

/// One live file-transfer channel. Used strictly sequentially by the pipeline.
#[async_trait]
pub trait RemoteSession: Send + Sync {
    /// `Ok(false)` when the path does not exist; any other stat failure is an error.
    async fn exists(&self, remote_path: &str) -> Result<bool>;

    /// Absolute paths of regular files under `remote_dir` whose name ends with
    /// one of `suffixes`, sorted. `max_depth` 1 lists `remote_dir` only.
    async fn list_files(
        &self,
        remote_dir: &str,
        suffixes: &[String],
        max_depth: usize,
    ) -> Result<Vec<String>>;

    /// Stream `remote_path` into `local_dest`, returning the number of bytes written.
    async fn fetch(&self, remote_path: &str, local_dest: &Path) -> Result<u64>;

    async fn close(self: Box<Self>) -> Result<()>;
}

/// Uploads one local file with a caption to the delivery endpoint.
///
/// No retries: a non-success response is returned as `Error::Delivery`.
#[async_trait]
pub trait DeliveryClient: Send + Sync {
    async fn deliver(&self, artifact: &Path, caption: &str) -> Result<()>;
}
