//! Durable progress documents
//!
//! Each stage is one JSON document, optionally gzipped, in the configured
//! directory. Writes go to `<name>.tmp`, are fsynced, then renamed over the
//! real file so a reader sees either the old or the new document.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, trace};

use super::{
    CollectinfoProgress, DownloaderProgress, LogProcessorProgress, PreProcessorProgress, Progress,
    Stage, UnpackerProgress,
};
use crate::config::ProgressFileConfig;
use crate::error::{IngestError, Result};

#[derive(Debug, Clone)]
pub struct ProgressStore {
    dir: PathBuf,
    compress: bool,
}

impl ProgressStore {
    pub fn new(config: &ProgressFileConfig) -> Self {
        Self {
            dir: config.output_file_path.clone(),
            compress: config.compress,
        }
    }

    pub fn path_for(&self, document: &str) -> PathBuf {
        if self.compress {
            self.dir.join(format!("{}.gz", document))
        } else {
            self.dir.join(document)
        }
    }

    /// Read every stage document that exists; missing ones start empty
    pub fn load(&self) -> Result<Progress> {
        Ok(Progress {
            downloader: self.load_stage::<DownloaderProgress>()?,
            unpacker: self.load_stage::<UnpackerProgress>()?,
            pre_processor: self.load_stage::<PreProcessorProgress>()?,
            log_processor: self.load_stage::<LogProcessorProgress>()?,
            collectinfo_processor: self.load_stage::<CollectinfoProgress>()?,
        })
    }

    /// Write every stage whose changed flag is set
    ///
    /// Returns how many documents were written.
    pub fn save(&self, progress: &Progress) -> Result<usize> {
        let written = [
            self.save_stage(&progress.downloader)?,
            self.save_stage(&progress.unpacker)?,
            self.save_stage(&progress.pre_processor)?,
            self.save_stage(&progress.log_processor)?,
            self.save_stage(&progress.collectinfo_processor)?,
        ];
        Ok(written.into_iter().filter(|w| *w).count())
    }

    fn load_stage<S: Stage>(&self) -> Result<S> {
        let path = self.path_for(S::DOCUMENT);
        let file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                trace!(document = S::DOCUMENT, "No progress document, starting empty");
                return Ok(S::default());
            },
            Err(e) => return Err(IngestError::io(&path, e)),
        };

        let reader: Box<dyn Read> = if self.compress {
            Box::new(GzDecoder::new(BufReader::new(file)))
        } else {
            Box::new(BufReader::new(file))
        };
        let stage: S = serde_json::from_reader(reader).map_err(|e| IngestError::Progress {
            name: S::DOCUMENT.to_string(),
            message: e.to_string(),
        })?;
        debug!(document = S::DOCUMENT, "Loaded progress document");
        Ok(stage)
    }

    fn save_stage<S: Stage>(&self, stage: &S) -> Result<bool> {
        if !stage.flags().is_changed() {
            return Ok(false);
        }

        fs::create_dir_all(&self.dir).map_err(|e| IngestError::io(&self.dir, e))?;
        let path = self.path_for(S::DOCUMENT);
        let tmp = tmp_path(&path);

        write_document(&tmp, stage, self.compress)?;
        fs::rename(&tmp, &path).map_err(|e| IngestError::io(&path, e))?;
        stage.flags().clear_changed();

        trace!(document = S::DOCUMENT, "Saved progress document");
        Ok(true)
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".tmp");
    PathBuf::from(name)
}

fn write_document<S: Stage>(tmp: &Path, stage: &S, compress: bool) -> Result<()> {
    let io_err = |e| IngestError::io(tmp, e);
    let encode_err = |e: serde_json::Error| IngestError::Progress {
        name: S::DOCUMENT.to_string(),
        message: e.to_string(),
    };

    let file = File::create(tmp).map_err(io_err)?;
    let mut writer = BufWriter::new(file);
    if compress {
        let mut encoder = GzEncoder::new(&mut writer, Compression::default());
        serde_json::to_writer(&mut encoder, stage).map_err(encode_err)?;
        encoder.finish().map_err(io_err)?;
    } else {
        serde_json::to_writer(&mut writer, stage).map_err(encode_err)?;
    }
    writer.flush().map_err(io_err)?;
    let file = writer.into_inner().map_err(|e| io_err(e.into_error()))?;
    file.sync_all().map_err(io_err)?;
    Ok(())
}
