use anyhow::Result;
use object_store::{ObjectStore, aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory};
use std::sync::Arc;
use url::Url;

use crate::config::StorageConfig;

const DEFAULT_REGION: &str = "us-east-1";

/// Open the blob bucket described by the storage configuration
pub fn create_blob_store(storage_config: &StorageConfig) -> Result<Arc<dyn ObjectStore>> {
    let url = Url::parse(&storage_config.dsn)
        .map_err(|e| anyhow::anyhow!("Invalid storage DSN '{}': {}", storage_config.dsn, e))?;

    match url.scheme() {
        "file" => {
            let path = url.path();
            if path.is_empty() || path == "/" {
                anyhow::bail!("File DSN must specify a path: file:///path/to/blobs");
            }
            Ok(Arc::new(LocalFileSystem::new_with_prefix(path)?))
        }
        "memory" => Ok(Arc::new(InMemory::new())),
        "s3" => {
            let region = storage_config.region.as_deref().unwrap_or(DEFAULT_REGION);
            let builder = s3_builder_from_dsn(&url, region)?;
            Ok(Arc::new(builder.build()?))
        }
        scheme => Err(anyhow::anyhow!(
            "Unsupported storage scheme: {}. Supported: file, memory, s3",
            scheme
        )),
    }
}

/// DSN format: s3://[access_key:secret_key@]host[:port]/bucket
///
/// Blob keys are the bare blob hashes, so any path below the bucket is
/// rejected rather than silently ignored.
fn s3_builder_from_dsn(dsn: &Url, region: &str) -> Result<AmazonS3Builder> {
    let host = dsn
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("Missing S3 host in DSN"))?;
    let port = dsn.port();
    let bucket = dsn.path().trim_matches('/');

    if bucket.is_empty() {
        anyhow::bail!("S3 DSN must specify a bucket: s3://host/bucket");
    }
    if bucket.contains('/') {
        anyhow::bail!("S3 DSN must name only the bucket, got path '{bucket}'");
    }

    let mut builder = AmazonS3Builder::new()
        .with_bucket_name(bucket)
        .with_region(region);

    let access_key = dsn.username();
    let secret_key = dsn.password().unwrap_or("");

    if !access_key.is_empty() {
        builder = builder
            .with_access_key_id(access_key)
            .with_secret_access_key(secret_key);
    } else {
        if let Ok(env_key) = std::env::var("AWS_ACCESS_KEY_ID") {
            builder = builder.with_access_key_id(env_key);
        }
        if let Ok(env_secret) = std::env::var("AWS_SECRET_ACCESS_KEY") {
            builder = builder.with_secret_access_key(env_secret);
        }
    }

    // Anything that is not AWS proper (Wasabi, MinIO...) needs an explicit endpoint
    if !host.contains("amazonaws.com") {
        let scheme = match port {
            Some(443) | None => "https",
            Some(_) => "http",
        };
        let endpoint = match port {
            Some(p) => format!("{scheme}://{host}:{p}"),
            None => format!("{scheme}://{host}"),
        };
        builder = builder
            .with_endpoint(endpoint)
            .with_allow_http(scheme == "http")
            .with_virtual_hosted_style_request(false);
    }

    Ok(builder)
}
