use anyhow::Result;
use object_store::{
    ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, path::Path,
};
use std::sync::Arc;
use url::Url;

use crate::config::StorageConfig;

/// An object store together with the key prefix partitions are listed under.
#[derive(Clone, Debug)]
pub struct PartitionStore {
    pub store: Arc<dyn ObjectStore>,
    pub prefix: Path,
}

impl PartitionStore {
    pub fn new(store: Arc<dyn ObjectStore>, prefix: &str) -> Self {
        Self {
            store,
            prefix: Path::from(prefix.trim_matches('/')),
        }
    }
}

/// Create the partition store described by the storage configuration
pub fn create_partition_store(storage_config: &StorageConfig) -> Result<PartitionStore> {
    let store = create_object_store_from_dsn(&storage_config.dsn)?;
    Ok(PartitionStore::new(store, &storage_config.prefix))
}

/// Create an object store from a DSN string
///
/// Supported schemes: `file:///path`, `memory://` and `s3://bucket` (the
/// latter optionally with `access:secret@host:port` for S3-compatible stores).
pub fn create_object_store_from_dsn(dsn: &str) -> Result<Arc<dyn ObjectStore>> {
    let url =
        Url::parse(dsn).map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                return Err(anyhow::anyhow!(
                    "File DSN must specify a path: file:///path/to/partitions"
                ));
            }
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let builder = s3_builder_from_dsn(&url)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// Build an S3 client from a DSN.
///
/// `s3://bucket` addresses AWS directly and takes credentials and region from
/// the environment. `s3://access:secret@host:port/bucket` addresses an
/// S3-compatible endpoint (MinIO and the like) with path-style requests.
pub fn s3_builder_from_dsn(dsn: &Url) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 bucket or host in DSN"))?;
    let path_bucket = dsn.path().trim_matches('/');

    let mut builder = AmazonS3Builder::from_env();

    if path_bucket.is_empty() {
        // s3://bucket
        builder = builder.with_bucket_name(host);
    } else {
        let scheme = if dsn.port() == Some(443) { "https" } else { "http" };
        let endpoint = match dsn.port() {
            Some(port) => format!("{scheme}://{host}:{port}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_bucket_name(path_bucket)
            .with_endpoint(endpoint)
            .with_allow_http(true)
            .with_virtual_hosted_style_request(false);
    }

    if !dsn.username().is_empty() {
        builder = builder
            .with_access_key_id(dsn.username())
            .with_secret_access_key(dsn.password().unwrap_or(""));
    }

    Ok(builder)
}
