//! S3 bucket source

use anyhow::{Context, Result};
use async_trait::async_trait;
use aws_config::timeout::TimeoutConfig;
use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument};

use super::{KeyFilter, RemoteObject, RemoteSource, SourceKind};
use crate::config::S3SourceConfig;

/// TCP connect timeout for S3 requests
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

pub struct S3Source {
    client: Client,
    bucket: String,
    threads: usize,
    filter: KeyFilter,
}

impl S3Source {
    /// Build a client from configuration
    ///
    /// Static credentials are used when a key id is configured; otherwise the
    /// default provider chain (environment, profile, instance role) applies.
    pub async fn new(config: &S3SourceConfig, pattern: Option<Regex>) -> Result<Self> {
        debug!("Initializing S3 source with config: {:?}", config);

        let timeouts = TimeoutConfig::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .operation_attempt_timeout(Duration::from_secs(config.timeout_secs.max(1)))
            .build();

        let mut loader = aws_config::defaults(BehaviorVersion::latest()).timeout_config(timeouts);
        if !config.region.is_empty() {
            loader = loader.region(Region::new(config.region.clone()));
        }
        if !config.key_id.is_empty() {
            loader = loader.credentials_provider(Credentials::new(
                &config.key_id,
                &config.secret_key,
                None,
                None,
                "agi-ingest",
            ));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_s3::config::Builder::from(&shared);
        if let Some(endpoint) = config.endpoint.as_deref().filter(|e| !e.is_empty()) {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }
        let client = Client::from_conf(builder.build());

        info!("S3 source initialized for bucket: {}", config.bucket_name);

        Ok(Self {
            client,
            bucket: config.bucket_name.clone(),
            threads: config.threads,
            filter: KeyFilter::new(config.path_prefix.clone(), pattern),
        })
    }
}

#[async_trait]
impl RemoteSource for S3Source {
    fn kind(&self) -> SourceKind {
        SourceKind::S3
    }

    fn concurrency(&self) -> usize {
        self.threads
    }

    fn key_filter(&self) -> &KeyFilter {
        &self.filter
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn list(&self) -> Result<Vec<RemoteObject>> {
        let prefix = Some(self.filter.prefix().to_string()).filter(|p| !p.is_empty());
        let mut pages = self
            .client
            .list_objects_v2()
            .bucket(&self.bucket)
            .set_prefix(prefix)
            .into_paginator()
            .send();

        let mut objects = Vec::new();
        while let Some(page) = pages.next().await {
            let page = page.context("Failed to list bucket objects")?;
            for object in page.contents() {
                let Some(key) = object.key() else {
                    continue;
                };
                objects.push(RemoteObject {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|t| DateTime::<Utc>::from_timestamp(t.secs(), t.subsec_nanos())),
                });
            }
        }
        debug!("Listed {} objects in s3://{}", objects.len(), self.bucket);
        Ok(objects)
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<()> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .with_context(|| format!("Failed to get s3://{}/{}", self.bucket, key))?;

        let mut file = tokio::fs::File::create(dest)
            .await
            .with_context(|| format!("Failed to create {}", dest.display()))?;
        let mut body = response.body;
        while let Some(chunk) = body
            .try_next()
            .await
            .with_context(|| format!("Failed reading body of s3://{}/{}", self.bucket, key))?
        {
            file.write_all(&chunk)
                .await
                .with_context(|| format!("Failed to write {}", dest.display()))?;
        }
        file.flush().await?;
        Ok(())
    }
}
