//! SFTP source
//!
//! `ssh2` is blocking, so every remote call runs inside `spawn_blocking`.
//! One authenticated session is shared by all transfers and re-established
//! after a failure. Host keys are not verified.

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use ssh2::{Session, Sftp};
use std::fs::File;
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tracing::{debug, info};

use super::{KeyFilter, RemoteObject, RemoteSource, SourceKind};
use crate::config::SftpSourceConfig;

/// TCP dial timeout
pub const DIAL_TIMEOUT: Duration = Duration::from_secs(5);

pub struct SftpSource {
    config: Arc<SftpSourceConfig>,
    filter: KeyFilter,
    session: Arc<Mutex<Option<Session>>>,
}

impl SftpSource {
    pub fn new(config: SftpSourceConfig, pattern: Option<Regex>) -> Self {
        let filter = KeyFilter::new(config.path_prefix.clone(), pattern).trim_leading_slash();
        Self {
            config: Arc::new(config),
            filter,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Run `op` against an SFTP channel on the shared session
    async fn with_sftp<T, F>(&self, op: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Sftp) -> Result<T> + Send + 'static,
    {
        let config = self.config.clone();
        let cached = self.session.clone();

        tokio::task::spawn_blocking(move || {
            let session = {
                let mut slot = cached.lock().unwrap_or_else(PoisonError::into_inner);
                match slot.as_ref() {
                    Some(session) => session.clone(),
                    None => {
                        let session = connect(&config)?;
                        *slot = Some(session.clone());
                        session
                    },
                }
            };

            let result = session
                .sftp()
                .context("Failed to open SFTP channel")
                .and_then(|sftp| op(&sftp));
            if result.is_err() {
                // Force a fresh connection for the next attempt.
                cached.lock().unwrap_or_else(PoisonError::into_inner).take();
            }
            result
        })
        .await
        .map_err(|e| anyhow!("SFTP task panicked: {}", e))?
    }
}

fn connect(config: &SftpSourceConfig) -> Result<Session> {
    let address = (config.host.as_str(), config.port)
        .to_socket_addrs()
        .with_context(|| format!("Failed to resolve {}:{}", config.host, config.port))?
        .next()
        .ok_or_else(|| anyhow!("No address found for {}", config.host))?;
    let tcp = TcpStream::connect_timeout(&address, DIAL_TIMEOUT)
        .with_context(|| format!("Failed to connect to {}", address))?;

    let mut session = Session::new().context("Failed to create SSH session")?;
    let timeout_ms = config.timeout_secs.saturating_mul(1000).min(u32::MAX as u64) as u32;
    session.set_timeout(timeout_ms);
    session.set_tcp_stream(tcp);
    session.handshake().context("SSH handshake failed")?;

    if !config.password.is_empty() {
        session
            .userauth_password(&config.username, &config.password)
            .context("SSH password authentication failed")?;
    } else if let Some(key_file) = &config.key_file {
        session
            .userauth_pubkey_file(&config.username, None, key_file, None)
            .context("SSH key authentication failed")?;
    }
    if !session.authenticated() {
        bail!("SSH session for {} is not authenticated", config.username);
    }

    info!("Connected to SFTP server {}:{}", config.host, config.port);
    Ok(session)
}

fn walk(sftp: &Sftp, dir: &Path, root_is_cwd: bool, out: &mut Vec<RemoteObject>) -> Result<()> {
    let entries = sftp
        .readdir(dir)
        .with_context(|| format!("Failed to read remote directory {}", dir.display()))?;
    for (path, stat) in entries {
        if stat.is_dir() {
            walk(sftp, &path, root_is_cwd, out)?;
        } else if stat.is_file() {
            let path = if root_is_cwd {
                path.strip_prefix(".").map(Path::to_path_buf).unwrap_or(path)
            } else {
                path
            };
            out.push(RemoteObject {
                key: path.to_string_lossy().into_owned(),
                size: stat.size.unwrap_or(0),
                last_modified: stat
                    .mtime
                    .and_then(|secs| DateTime::<Utc>::from_timestamp(secs as i64, 0)),
            });
        }
    }
    Ok(())
}

#[async_trait]
impl RemoteSource for SftpSource {
    fn kind(&self) -> SourceKind {
        SourceKind::Sftp
    }

    fn concurrency(&self) -> usize {
        self.config.threads
    }

    fn key_filter(&self) -> &KeyFilter {
        &self.filter
    }

    async fn list(&self) -> Result<Vec<RemoteObject>> {
        let prefix = self.filter.prefix().to_string();
        let objects = self
            .with_sftp(move |sftp| {
                let root_is_cwd = prefix.is_empty();
                let root = if root_is_cwd {
                    PathBuf::from(".")
                } else {
                    PathBuf::from(&prefix)
                };
                let mut objects = Vec::new();
                walk(sftp, &root, root_is_cwd, &mut objects)?;
                Ok(objects)
            })
            .await?;
        debug!("Listed {} remote files over SFTP", objects.len());
        Ok(objects)
    }

    async fn fetch(&self, key: &str, dest: &Path) -> Result<()> {
        let remote = PathBuf::from(key);
        let dest = dest.to_path_buf();
        self.with_sftp(move |sftp| {
            let mut source = sftp
                .open(&remote)
                .with_context(|| format!("Failed to open remote {}", remote.display()))?;
            let mut target = File::create(&dest)
                .with_context(|| format!("Failed to create {}", dest.display()))?;
            std::io::copy(&mut source, &mut target)
                .with_context(|| format!("Failed to copy {}", remote.display()))?;
            target.sync_all()?;
            Ok(())
        })
        .await
    }
}
