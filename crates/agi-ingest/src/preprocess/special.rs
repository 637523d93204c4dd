//! Splitting of multiplexed log exports
//!
//! Some exports interleave the logs of many nodes in one file. These are split
//! into one file per identity, named `<base>_special-split_<ident>`:
//!
//! - **tab-4**: `timestamp \t pod_name \t cluster \t payload`, ident `cluster-pod_name`
//! - **tab-3**: `timestamp \t ident \t payload`
//! - **JSON / NDJSON** records, tried in order: `log`, `jsonPayload.log`,
//!   `textPayload` (ident from `resource.labels.pod_name`), then a structured
//!   `jsonPayload` with an RFC 3339 `timestamp` rendered as a server log line
//!
//! The format is decided from the first line of the first 16 KiB.

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveDateTime;
use serde::Deserialize;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use crate::detect::{self, TextKind};

pub const SPLIT_MARKER: &str = "_special-split_";
pub const HEAD_LEN: usize = 16 * 1024;
pub const MAX_JSON_ERRORS: usize = 1000;

const DEFAULT_IDENT: &str = "noident";
const JSON_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%SZ";
const LOG_TIMESTAMP_FORMAT: &str = "%b %d %Y %H:%M:%S UTC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SplitOutcome {
    /// Not a multiplexed export; process the file as is
    Standard,
    /// Outputs in first-seen identity order
    Split(Vec<PathBuf>),
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct JsonRecord {
    log: String,
    json_payload: JsonPayload,
    text_payload: String,
    resource: Resource,
    timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct JsonPayload {
    log: String,
    level: String,
    module: String,
    module_detail: String,
    message: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Resource {
    labels: Labels,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Labels {
    pod_name: String,
}

impl JsonRecord {
    /// The log line and identity this record carries, if any
    fn line(&self) -> Option<(String, &str)> {
        if !self.log.is_empty() {
            return Some((self.log.clone(), DEFAULT_IDENT));
        }
        if !self.json_payload.log.is_empty() {
            return Some((self.json_payload.log.clone(), DEFAULT_IDENT));
        }
        if !self.text_payload.is_empty() {
            let pod = self.resource.labels.pod_name.as_str();
            let ident = if pod.is_empty() { DEFAULT_IDENT } else { pod };
            return Some((self.text_payload.clone(), ident));
        }
        let ts = NaiveDateTime::parse_from_str(&self.timestamp, JSON_TIMESTAMP_FORMAT).ok()?;
        let p = &self.json_payload;
        Some((
            format!(
                "{}: {} ({}): ({}) {}",
                ts.format(LOG_TIMESTAMP_FORMAT),
                p.level,
                p.module,
                p.module_detail,
                p.message
            ),
            DEFAULT_IDENT,
        ))
    }
}

/// One output file per identity, created on first use
struct SplitWriter {
    base: OsString,
    outputs: Vec<PathBuf>,
    writers: HashMap<String, BufWriter<File>>,
}

impl SplitWriter {
    fn new(base: &Path) -> Self {
        Self {
            base: base.as_os_str().to_owned(),
            outputs: Vec::new(),
            writers: HashMap::new(),
        }
    }

    fn write(&mut self, ident: &str, line: &str) -> Result<()> {
        if !self.writers.contains_key(ident) {
            let mut name = self.base.clone();
            name.push(SPLIT_MARKER);
            name.push(sanitize_ident(ident));
            let path = PathBuf::from(name);
            let file = File::create(&path)
                .with_context(|| format!("Failed to create {}", path.display()))?;
            self.writers.insert(ident.to_string(), BufWriter::new(file));
            self.outputs.push(path);
        }
        let Some(writer) = self.writers.get_mut(ident) else {
            bail!("no writer for identity {}", ident);
        };
        writer.write_all(line.as_bytes())?;
        if !line.ends_with('\n') {
            writer.write_all(b"\n")?;
        }
        Ok(())
    }

    fn finish(mut self) -> Result<Vec<PathBuf>> {
        for (_, mut writer) in self.writers.drain() {
            writer.flush()?;
        }
        Ok(self.outputs)
    }
}

fn sanitize_ident(ident: &str) -> String {
    ident
        .chars()
        .map(|c| if c == '/' || c == '\\' || c == '\0' { '_' } else { c })
        .collect()
}

/// Split `path` if it is a multiplexed export; outputs are written at `out_base` plus suffix
pub fn split(path: &Path, content_type: &str, out_base: &Path) -> Result<SplitOutcome> {
    let mut head = vec![0u8; HEAD_LEN];
    let read = {
        let mut file =
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
        detect::read_full(&mut file, &mut head)?
    };
    let head = String::from_utf8_lossy(&head[..read]);
    let first_line = head.split('\n').next().unwrap_or_default();
    let columns = first_line.split('\t').count();

    let kind = TextKind::from_content_type(content_type);
    let ndjson = kind == Some(TextKind::NdJson);
    if columns != 3 && columns != 4 && !kind.is_some_and(TextKind::is_json) {
        return Ok(SplitOutcome::Standard);
    }

    if let Some(parent) = out_base.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("Failed to create {}", parent.display()))?;
    }
    let reader = BufReader::new(
        File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
    );
    let mut writer = SplitWriter::new(out_base);

    match columns {
        4 => {
            debug!(path = %path.display(), "tab-4 export");
            split_tabbed(reader, &mut writer, 4)?
        },
        3 => {
            debug!(path = %path.display(), "tab-3 export");
            split_tabbed(reader, &mut writer, 3)?
        },
        _ if ndjson => {
            debug!(path = %path.display(), "ndjson export");
            split_json_lines(reader, &mut writer)?
        },
        _ => {
            debug!(path = %path.display(), "json export");
            split_json_stream(reader, &mut writer)?
        },
    }

    let outputs = writer.finish()?;
    debug!(path = %path.display(), outputs = outputs.len(), "Split export");
    Ok(SplitOutcome::Split(outputs))
}

fn trim(field: &str) -> &str {
    field.trim_matches(|c| matches!(c, '\r' | '\n' | '\t' | ' '))
}

fn split_tabbed<R: BufRead>(mut reader: R, writer: &mut SplitWriter, columns: usize) -> Result<()> {
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&raw);
        let line = text.strip_suffix('\n').unwrap_or(&text);
        let fields: Vec<&str> = line.split('\t').collect();
        if fields.len() < columns {
            trace!(line, "Line without enough columns, skipping");
            continue;
        }
        let payload_col = columns - 1;
        if fields[1] == "pod_name" && fields[payload_col] == "text_payload" {
            continue;
        }
        let ident = if columns == 4 {
            format!("{}-{}", trim(fields[2]), trim(fields[1]))
        } else {
            trim(fields[1]).to_string()
        };
        writer.write(&ident, trim(fields[payload_col]))?;
    }
}

fn emit(record: &JsonRecord, writer: &mut SplitWriter) -> Result<()> {
    match record.line() {
        Some((line, ident)) => writer.write(ident, &line),
        None => {
            trace!("JSON record matched no known shape, skipping");
            Ok(())
        },
    }
}

fn count_error(errors: &mut usize, error: impl std::fmt::Display) -> Result<()> {
    *errors += 1;
    trace!(error = %error, "JSON decode error");
    if *errors > MAX_JSON_ERRORS {
        return Err(anyhow!(
            "encountered >{} errors processing json; last error: {}",
            MAX_JSON_ERRORS,
            error
        ));
    }
    Ok(())
}

fn split_json_lines<R: BufRead>(mut reader: R, writer: &mut SplitWriter) -> Result<()> {
    let mut errors = 0;
    let mut raw = Vec::new();
    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Ok(());
        }
        let text = String::from_utf8_lossy(&raw);
        if text.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JsonRecord>(&text) {
            Ok(record) => emit(&record, writer)?,
            Err(e) => count_error(&mut errors, e)?,
        }
    }
}

fn split_json_stream<R: BufRead>(reader: R, writer: &mut SplitWriter) -> Result<()> {
    let mut errors = 0;
    let stream = serde_json::Deserializer::from_reader(reader).into_iter::<serde_json::Value>();
    for value in stream {
        // A syntax error ends the stream; there is no resynchronising after it.
        let value = value.context("invalid json")?;
        let records = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        for item in records {
            match serde_json::from_value::<JsonRecord>(item) {
                Ok(record) => emit(&record, writer)?,
                Err(e) => count_error(&mut errors, e)?,
            }
        }
    }
    Ok(())
}
