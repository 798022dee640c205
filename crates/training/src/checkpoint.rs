//! Single-file training checkpoints: `iter_{N}.ckpt`.
//!
//! Layout (little-endian):
//! `b"SSDC"`, u32 format version, u64 metadata length, u64 student length, u64 teacher
//! length, u64 optimizer length, then the JSON metadata followed by the three
//! `BinBytesRecorder` sections. The metadata carries a SHA-256 over the three sections.

use burn::module::{AutodiffModule, Module};
use burn::optim::Optimizer;
use burn::record::{BinBytesRecorder, FullPrecisionSettings, Recorder};
use burn::tensor::backend::{AutodiffBackend, Backend};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{TrainError, TrainResult};
use crate::pair::ModelPair;
use crate::progress::TrainingProgress;
use models::Detector;

const MAGIC: &[u8; 4] = b"SSDC";
pub const FORMAT_VERSION: u32 = 1;
const HEADER_LEN: usize = 40;
const COMPONENT: &str = "CheckpointManager";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CheckpointMeta {
    pub iteration: usize,
    pub progress: TrainingProgress,
    pub num_classes: usize,
    pub num_queries: usize,
    pub payload_sha256: String,
}

#[derive(Debug, Clone)]
pub struct CheckpointPayload {
    pub meta: CheckpointMeta,
    pub student: Vec<u8>,
    pub teacher: Vec<u8>,
    pub optimizer: Vec<u8>,
}

fn payload_digest(student: &[u8], teacher: &[u8], optimizer: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(student);
    hasher.update(teacher);
    hasher.update(optimizer);
    format!("{:x}", hasher.finalize())
}

fn read_u32_le(bytes: &[u8]) -> u32 {
    let mut buf = [0u8; 4];
    buf.copy_from_slice(&bytes[..4]);
    u32::from_le_bytes(buf)
}

fn read_u64_le(bytes: &[u8]) -> u64 {
    let mut buf = [0u8; 8];
    buf.copy_from_slice(&bytes[..8]);
    u64::from_le_bytes(buf)
}

impl CheckpointPayload {
    pub fn encode(&self) -> TrainResult<Vec<u8>> {
        let meta = serde_json::to_vec(&self.meta).map_err(|e| TrainError::Checkpoint {
            path: PathBuf::new(),
            message: format!("metadata encode failed: {e}"),
        })?;
        let body = self.student.len() + self.teacher.len() + self.optimizer.len();
        let mut out = Vec::with_capacity(HEADER_LEN + meta.len() + body);
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
        for len in [
            meta.len(),
            self.student.len(),
            self.teacher.len(),
            self.optimizer.len(),
        ] {
            out.extend_from_slice(&(len as u64).to_le_bytes());
        }
        out.extend_from_slice(&meta);
        out.extend_from_slice(&self.student);
        out.extend_from_slice(&self.teacher);
        out.extend_from_slice(&self.optimizer);
        Ok(out)
    }

    /// Verifies magic, version, section lengths and the payload checksum.
    pub fn decode(data: &[u8], path: &Path) -> TrainResult<Self> {
        let fail = |message: String| TrainError::Checkpoint {
            path: path.to_path_buf(),
            message,
        };
        if data.len() < HEADER_LEN {
            return Err(fail(format!("file too small ({} bytes)", data.len())));
        }
        if &data[0..4] != MAGIC {
            return Err(fail("bad magic".to_string()));
        }
        let version = read_u32_le(&data[4..8]);
        if version != FORMAT_VERSION {
            return Err(fail(format!(
                "format version mismatch {version} vs {FORMAT_VERSION}"
            )));
        }
        let lens: Vec<usize> = (0..4)
            .map(|i| read_u64_le(&data[8 + i * 8..16 + i * 8]) as usize)
            .collect();
        let expected = lens
            .iter()
            .try_fold(HEADER_LEN, |acc, len| acc.checked_add(*len))
            .ok_or_else(|| fail("section lengths overflow".to_string()))?;
        if expected != data.len() {
            return Err(fail(format!(
                "section lengths add up to {expected} bytes, file has {}",
                data.len()
            )));
        }
        let mut offset = HEADER_LEN;
        let mut sections = Vec::with_capacity(4);
        for len in lens {
            sections.push(&data[offset..offset + len]);
            offset += len;
        }
        let meta: CheckpointMeta = serde_json::from_slice(sections[0])
            .map_err(|e| fail(format!("metadata decode failed: {e}")))?;
        let digest = payload_digest(sections[1], sections[2], sections[3]);
        if digest != meta.payload_sha256 {
            return Err(fail("payload checksum mismatch".to_string()));
        }
        Ok(Self {
            meta,
            student: sections[1].to_vec(),
            teacher: sections[2].to_vec(),
            optimizer: sections[3].to_vec(),
        })
    }
}

/// Parses `N` out of `iter_N.ckpt` (or any `iter_N` stem).
pub fn parse_iteration(path: &Path) -> Option<usize> {
    path.file_stem()?
        .to_str()?
        .strip_prefix("iter_")?
        .parse()
        .ok()
}

pub fn load_checkpoint(path: &Path) -> TrainResult<CheckpointPayload> {
    let data = fs::read(path).map_err(|e| TrainError::io(COMPONENT, path, e))?;
    CheckpointPayload::decode(&data, path)
}

fn recorder() -> BinBytesRecorder<FullPrecisionSettings> {
    BinBytesRecorder::<FullPrecisionSettings>::default()
}

fn recorder_err(e: impl std::fmt::Display) -> TrainError {
    TrainError::Recorder(e.to_string())
}

/// Encodes the pair, optimizer state and progress into a payload.
pub fn capture<B, M, O>(
    pair: &ModelPair<B, M>,
    optim: &O,
    progress: &TrainingProgress,
) -> TrainResult<CheckpointPayload>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
    M::InnerModule: Detector<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    let rec = recorder();
    let student = Recorder::<B>::record(&rec, pair.student().clone().into_record(), ())
        .map_err(recorder_err)?;
    let teacher =
        Recorder::<B::InnerBackend>::record(&rec, pair.teacher().clone().into_record(), ())
            .map_err(recorder_err)?;
    let optimizer = Recorder::<B>::record(&rec, optim.to_record(), ()).map_err(recorder_err)?;
    let meta = CheckpointMeta {
        iteration: progress.iteration,
        progress: progress.clone(),
        num_classes: pair.student().num_classes(),
        num_queries: pair.student().num_queries(),
        payload_sha256: payload_digest(&student, &teacher, &optimizer),
    };
    Ok(CheckpointPayload {
        meta,
        student,
        teacher,
        optimizer,
    })
}

fn check_shape<B: Backend, D: Detector<B>>(
    payload: &CheckpointPayload,
    model: &D,
) -> TrainResult<()> {
    if model.num_classes() != payload.meta.num_classes
        || model.num_queries() != payload.meta.num_queries
    {
        return Err(TrainError::config(
            COMPONENT,
            format!(
                "checkpoint holds a {}-class/{}-query model, config builds {}/{}",
                payload.meta.num_classes,
                payload.meta.num_queries,
                model.num_classes(),
                model.num_queries()
            ),
        ));
    }
    Ok(())
}

/// Loads only the teacher section into `template`.
pub fn restore_teacher<B, D>(
    payload: &CheckpointPayload,
    template: D,
    device: &B::Device,
) -> TrainResult<D>
where
    B: Backend,
    D: Module<B> + Detector<B>,
{
    check_shape::<B, _>(payload, &template)?;
    let record = Recorder::<B>::load(&recorder(), payload.teacher.clone(), device)
        .map_err(recorder_err)?;
    Ok(template.load_record(record))
}

/// Loads student and teacher sections into the pair's models.
pub fn restore_pair<B, M>(
    payload: &CheckpointPayload,
    pair: ModelPair<B, M>,
    device: &B::Device,
) -> TrainResult<ModelPair<B, M>>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
    M::InnerModule: Detector<B::InnerBackend>,
{
    let (student, teacher) = pair.into_parts();
    check_shape::<B, _>(payload, &student)?;
    let record = Recorder::<B>::load(&recorder(), payload.student.clone(), device)
        .map_err(recorder_err)?;
    let student = student.load_record(record);
    let teacher = restore_teacher::<B::InnerBackend, _>(payload, teacher, device)?;
    Ok(ModelPair::new(student, teacher))
}

/// Loads models, optimizer state and progress.
pub fn restore<B, M, O>(
    payload: &CheckpointPayload,
    pair: ModelPair<B, M>,
    optim: O,
    device: &B::Device,
) -> TrainResult<(ModelPair<B, M>, O, TrainingProgress)>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Detector<B>,
    M::InnerModule: Detector<B::InnerBackend>,
    O: Optimizer<M, B>,
{
    let pair = restore_pair(payload, pair, device)?;
    let record = Recorder::<B>::load(&recorder(), payload.optimizer.clone(), device)
        .map_err(recorder_err)?;
    Ok((
        pair,
        optim.load_record(record),
        payload.meta.progress.clone(),
    ))
}

/// Writes `iter_{N}.ckpt` files into a directory and prunes the oldest beyond `max_keep`.
#[derive(Debug, Clone)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_keep: Option<usize>,
}

impl CheckpointManager {
    pub fn new(dir: impl Into<PathBuf>, max_keep: Option<usize>) -> Self {
        Self {
            dir: dir.into(),
            max_keep,
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, iteration: usize) -> PathBuf {
        self.dir.join(format!("iter_{iteration}.ckpt"))
    }

    /// Writes to a temporary file, then renames over the final name.
    pub fn write(&self, payload: &CheckpointPayload) -> TrainResult<PathBuf> {
        fs::create_dir_all(&self.dir).map_err(|e| TrainError::io(COMPONENT, &self.dir, e))?;
        let path = self.path_for(payload.meta.iteration);
        let tmp = path.with_extension("ckpt.tmp");
        let bytes = payload.encode()?;
        fs::write(&tmp, bytes).map_err(|e| TrainError::io(COMPONENT, &tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| TrainError::io(COMPONENT, &path, e))?;
        Ok(path)
    }

    /// Existing checkpoints, oldest first.
    pub fn list(&self) -> TrainResult<Vec<(usize, PathBuf)>> {
        if !self.dir.exists() {
            return Ok(Vec::new());
        }
        let entries =
            fs::read_dir(&self.dir).map_err(|e| TrainError::io(COMPONENT, &self.dir, e))?;
        let mut found = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TrainError::io(COMPONENT, &self.dir, e))?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("ckpt") {
                continue;
            }
            if let Some(iteration) = parse_iteration(&path) {
                found.push((iteration, path));
            }
        }
        found.sort_by_key(|(iteration, _)| *iteration);
        Ok(found)
    }

    pub fn latest(&self) -> TrainResult<Option<PathBuf>> {
        Ok(self.list()?.pop().map(|(_, path)| path))
    }

    /// Removes the oldest checkpoints so at most `max_keep` remain.
    pub fn prune(&self) -> TrainResult<Vec<PathBuf>> {
        let Some(keep) = self.max_keep else {
            return Ok(Vec::new());
        };
        let existing = self.list()?;
        let excess = existing.len().saturating_sub(keep);
        let mut removed = Vec::with_capacity(excess);
        for (_, path) in existing.into_iter().take(excess) {
            fs::remove_file(&path).map_err(|e| TrainError::io(COMPONENT, &path, e))?;
            tracing::debug!(path = %path.display(), "pruned checkpoint");
            removed.push(path);
        }
        Ok(removed)
    }
}
