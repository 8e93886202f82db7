//! The knowledge store: a flat vector index and a metadata sequence kept in
//! positional lockstep.
//!
//! On disk the store is a directory with two artifacts:
//!
//! * `index.vec` - header (`DRVX`, format version, dimensions, count) followed
//!   by `count * dimensions` little-endian f32 values in insertion order.
//! * `meta.bin` - bincode-encoded `Vec<Chunk>`, same length and order.
//!
//! Both are replaced together. New contents go to `*.tmp`, a `COMMIT` marker
//! is written once both are synced, then the temporaries are renamed into
//! place. A marker found at load time means a commit was interrupted after
//! its data was durable, so the renames are finished before reading.

use memmap2::Mmap;
use rayon::prelude::*;
use serde::Serialize;
use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::config::Number;
use crate::error::{KbError, Result};
use crate::models::{Chunk, RetrievalResult, ScoredChunk};
use crate::vector_ops::squared_l2_distance_simd;

const INDEX_MAGIC: &[u8; 4] = b"DRVX";
const INDEX_VERSION: u32 = 1;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8;

const INDEX_FILE: &str = "index.vec";
const META_FILE: &str = "meta.bin";
const COMMIT_MARKER: &str = "COMMIT";

/// Location of a store on disk plus the lock that keeps readers from
/// observing a half-renamed pair. Clones share the lock.
#[derive(Debug, Clone)]
pub struct StoreFiles {
    dir: PathBuf,
    commit_lock: Arc<RwLock<()>>,
}

impl StoreFiles {
    pub fn new<P: AsRef<Path>>(dir: P) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
            commit_lock: Arc::new(RwLock::new(())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.dir.join(INDEX_FILE)
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.dir.join(META_FILE)
    }

    fn staged(path: &Path) -> PathBuf {
        let mut name = path.as_os_str().to_owned();
        name.push(".tmp");
        PathBuf::from(name)
    }

    fn marker_path(&self) -> PathBuf {
        self.dir.join(COMMIT_MARKER)
    }

    fn recover_interrupted_commit(&self) -> Result<()> {
        if !self.marker_path().exists() {
            return Ok(());
        }
        let _guard = self.commit_lock.write().unwrap_or_else(|e| e.into_inner());
        if !self.marker_path().exists() {
            return Ok(());
        }

        self.finish_commit()?;
        warn!(
            "Rolled forward an interrupted commit in '{}'",
            self.dir.display()
        );
        Ok(())
    }

    /// Moves staged artifacts into place and clears the marker. Callers hold
    /// the commit lock and have made the marker durable.
    fn finish_commit(&self) -> Result<()> {
        for path in [self.index_path(), self.metadata_path()] {
            let staged = Self::staged(&path);
            if staged.exists() {
                fs::rename(&staged, &path)?;
            }
        }
        File::open(&self.dir)?.sync_all()?;
        fs::remove_file(self.marker_path())?;
        Ok(())
    }

    /// Undoes a commit that failed before its marker became durable. The
    /// marker goes first so a crash here never rolls a partial stage forward.
    fn discard_staged(&self) {
        let staged = [
            self.marker_path(),
            Self::staged(&self.index_path()),
            Self::staged(&self.metadata_path()),
        ];
        for path in staged.iter().filter(|p| p.is_file()) {
            if let Err(e) = fs::remove_file(path) {
                warn!("Could not remove '{}': {}", path.display(), e);
            }
        }
    }

    fn read(&self) -> Result<Option<(usize, Vec<Number>, Vec<Chunk>)>> {
        self.recover_interrupted_commit()?;
        let _guard = self.commit_lock.read().unwrap_or_else(|e| e.into_inner());

        let index_path = self.index_path();
        let metadata_path = self.metadata_path();
        match (index_path.exists(), metadata_path.exists()) {
            (false, false) => return Ok(None),
            (true, false) => {
                return Err(KbError::CorruptStore(format!(
                    "'{}' exists without '{}'",
                    index_path.display(),
                    metadata_path.display()
                )))
            }
            (false, true) => {
                return Err(KbError::CorruptStore(format!(
                    "'{}' exists without '{}'",
                    metadata_path.display(),
                    index_path.display()
                )))
            }
            (true, true) => {}
        }

        let (dimensions, vectors) = read_index(&index_path)?;
        let chunks = read_metadata(&metadata_path)?;
        let count = if dimensions == 0 { 0 } else { vectors.len() / dimensions };
        if chunks.len() != count {
            return Err(KbError::CorruptStore(format!(
                "metadata has {} entries but the vector index has {}",
                chunks.len(),
                count
            )));
        }
        Ok(Some((dimensions, vectors, chunks)))
    }

    fn read_metadata_only(&self) -> Result<Vec<Chunk>> {
        self.recover_interrupted_commit()?;
        let _guard = self.commit_lock.read().unwrap_or_else(|e| e.into_inner());
        let path = self.metadata_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        read_metadata(&path)
    }

    /// Replaces both artifacts. An error means nothing changed on disk.
    /// Once the marker is durable the commit counts as done; a failure after
    /// that point is left for the next load to roll forward.
    fn write(&self, dimensions: usize, vectors: &[Number], chunks: &[Chunk]) -> Result<()> {
        let _guard = self.commit_lock.write().unwrap_or_else(|e| e.into_inner());
        if let Err(e) = self.stage_commit(dimensions, vectors, chunks) {
            self.discard_staged();
            return Err(e);
        }

        if let Err(e) = self.finish_commit() {
            warn!(
                "Commit in '{}' is durable but not yet in place ({}); the next load finishes it",
                self.dir.display(),
                e
            );
        }
        Ok(())
    }

    fn stage_commit(&self, dimensions: usize, vectors: &[Number], chunks: &[Chunk]) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        write_index(&Self::staged(&self.index_path()), dimensions, vectors)?;
        write_metadata(&Self::staged(&self.metadata_path()), chunks)?;

        let marker = File::create(self.marker_path())?;
        marker.sync_all()?;
        File::open(&self.dir)?.sync_all()?;
        Ok(())
    }
}

fn read_index(path: &Path) -> Result<(usize, Vec<Number>)> {
    let file = File::open(path)?;
    let len = file.metadata()?.len() as usize;
    if len < HEADER_SIZE {
        return Err(KbError::CorruptStore(format!(
            "'{}' is too short to hold an index header",
            path.display()
        )));
    }
    let mmap = unsafe { Mmap::map(&file)? };

    if &mmap[..4] != INDEX_MAGIC {
        return Err(KbError::CorruptStore(format!(
            "'{}' is not a vector index",
            path.display()
        )));
    }
    let version = u32::from_le_bytes(le_array(&mmap[4..8]));
    if version != INDEX_VERSION {
        return Err(KbError::CorruptStore(format!(
            "unsupported index format version {}",
            version
        )));
    }
    let corrupt_header = || {
        KbError::CorruptStore(format!("'{}' has an impossible header", path.display()))
    };
    let dimensions = usize::try_from(u32::from_le_bytes(le_array(&mmap[8..12])))
        .map_err(|_| corrupt_header())?;
    let count = usize::try_from(u64::from_le_bytes(le_array(&mmap[12..20])))
        .map_err(|_| corrupt_header())?;

    let expected = count
        .checked_mul(dimensions)
        .and_then(|n| n.checked_mul(size_of::<Number>()))
        .and_then(|n| n.checked_add(HEADER_SIZE))
        .ok_or_else(corrupt_header)?;
    if mmap.len() != expected {
        return Err(KbError::CorruptStore(format!(
            "index holds {} bytes, header promises {}",
            mmap.len(),
            expected
        )));
    }

    let vectors = mmap[HEADER_SIZE..]
        .chunks_exact(size_of::<Number>())
        .map(|b| Number::from_le_bytes(le_array(b)))
        .collect();
    Ok((dimensions, vectors))
}

fn le_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(&bytes[..N]);
    out
}

fn write_index(path: &Path, dimensions: usize, vectors: &[Number]) -> Result<()> {
    let count = if dimensions == 0 { 0 } else { vectors.len() / dimensions };
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(INDEX_MAGIC)?;
    writer.write_all(&INDEX_VERSION.to_le_bytes())?;
    writer.write_all(&(dimensions as u32).to_le_bytes())?;
    writer.write_all(&(count as u64).to_le_bytes())?;
    for value in vectors {
        writer.write_all(&value.to_le_bytes())?;
    }
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

fn read_metadata(path: &Path) -> Result<Vec<Chunk>> {
    let reader = BufReader::new(File::open(path)?);
    bincode::deserialize_from(reader).map_err(|e| {
        KbError::CorruptStore(format!("unreadable metadata '{}': {}", path.display(), e))
    })
}

fn write_metadata(path: &Path, chunks: &[Chunk]) -> Result<()> {
    let mut writer = BufWriter::new(File::create(path)?);
    bincode::serialize_into(&mut writer, chunks)?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(())
}

/// Summary derived purely from the metadata sequence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct KnowledgeStats {
    pub total_chunks: usize,
    pub total_pdfs: usize,
    pub pdf_files: Vec<String>,
    pub chunks_per_pdf: BTreeMap<String, usize>,
}

impl KnowledgeStats {
    fn from_chunks(chunks: &[Chunk]) -> Self {
        let mut chunks_per_pdf = BTreeMap::new();
        for chunk in chunks {
            *chunks_per_pdf.entry(chunk.source.clone()).or_insert(0) += 1;
        }
        let pdf_files: Vec<String> = chunks_per_pdf.keys().cloned().collect();
        Self {
            total_chunks: chunks.len(),
            total_pdfs: pdf_files.len(),
            pdf_files,
            chunks_per_pdf,
        }
    }
}

pub struct KnowledgeStore {
    files: StoreFiles,
    dimensions: Option<usize>,
    vectors: Vec<Number>,
    chunks: Vec<Chunk>,
}

impl KnowledgeStore {
    pub fn empty(files: StoreFiles) -> Self {
        Self {
            files,
            dimensions: None,
            vectors: Vec::new(),
            chunks: Vec::new(),
        }
    }

    /// Loads the persisted pair, or an empty store when nothing has been
    /// written yet.
    pub fn load(files: StoreFiles) -> Result<Self> {
        let start = Instant::now();
        let store = match files.read()? {
            None => {
                debug!("No store at '{}', starting empty", files.dir().display());
                Self::empty(files)
            }
            Some((dimensions, vectors, chunks)) => Self {
                dimensions: (dimensions > 0).then_some(dimensions),
                files,
                vectors,
                chunks,
            },
        };
        debug!(
            "Loaded {} entries from '{}' in {:?}",
            store.len(),
            store.files.dir().display(),
            start.elapsed()
        );
        Ok(store)
    }

    pub fn files(&self) -> &StoreFiles {
        &self.files
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn dimensions(&self) -> Option<usize> {
        self.dimensions
    }

    pub fn vector_count(&self) -> usize {
        self.dimensions.map_or(0, |d| self.vectors.len() / d)
    }

    pub fn chunks(&self) -> &[Chunk] {
        &self.chunks
    }

    pub fn vector(&self, index: usize) -> Option<&[Number]> {
        let d = self.dimensions?;
        self.vectors.get(index * d..(index + 1) * d)
    }

    pub fn contains_document(&self, name: &str) -> bool {
        self.chunks.iter().any(|c| c.source == name)
    }

    /// Adds entries in memory only. Used directly by rebuild, which persists
    /// once at the end.
    pub fn stage(&mut self, vectors: Vec<Vec<Number>>, chunks: Vec<Chunk>) -> Result<usize> {
        if vectors.len() != chunks.len() {
            return Err(KbError::InvalidInput(format!(
                "{} vectors supplied for {} chunks",
                vectors.len(),
                chunks.len()
            )));
        }
        if vectors.is_empty() {
            return Err(KbError::InvalidInput("append requires at least one entry".into()));
        }
        if chunks.iter().any(|c| c.text.trim().is_empty()) {
            return Err(KbError::InvalidInput("chunk text must not be empty".into()));
        }

        let expected = self.dimensions.unwrap_or(vectors[0].len());
        if expected == 0 {
            return Err(KbError::InvalidInput("vectors must not be empty".into()));
        }
        if let Some(bad) = vectors.iter().find(|v| v.len() != expected) {
            return Err(KbError::DimensionMismatch {
                expected,
                actual: bad.len(),
            });
        }

        let added = chunks.len();
        self.dimensions = Some(expected);
        self.vectors.reserve(added * expected);
        for vector in vectors {
            self.vectors.extend(vector);
        }
        self.chunks.extend(chunks);
        Ok(added)
    }

    pub fn persist(&self) -> Result<()> {
        let start = Instant::now();
        self.files
            .write(self.dimensions.unwrap_or(0), &self.vectors, &self.chunks)?;
        info!(
            "Persisted {} entries to '{}' in {:?}",
            self.len(),
            self.files.dir().display(),
            start.elapsed()
        );
        Ok(())
    }

    /// Appends entries and persists both artifacts. On any failure the store
    /// is left exactly as it was, in memory and on disk.
    pub fn append(&mut self, vectors: Vec<Vec<Number>>, chunks: Vec<Chunk>) -> Result<usize> {
        let previous_dimensions = self.dimensions;
        let previous_vectors = self.vectors.len();
        let previous_chunks = self.chunks.len();

        let added = self.stage(vectors, chunks)?;
        if let Err(e) = self.persist() {
            self.dimensions = previous_dimensions;
            self.vectors.truncate(previous_vectors);
            self.chunks.truncate(previous_chunks);
            return Err(e);
        }
        Ok(added)
    }

    /// Exact nearest-neighbour search by squared Euclidean distance. Ties go
    /// to the earlier insertion.
    pub fn search(&self, query_vector: &[Number], k: usize) -> Result<RetrievalResult> {
        if k == 0 {
            return Err(KbError::InvalidInput("k must be greater than 0".into()));
        }
        let dimensions = match self.dimensions {
            Some(d) if !self.is_empty() => d,
            _ => return Ok(Vec::new()),
        };
        if query_vector.len() != dimensions {
            return Err(KbError::DimensionMismatch {
                expected: dimensions,
                actual: query_vector.len(),
            });
        }

        let start = Instant::now();
        let mut distances: Vec<(Number, usize)> = self
            .vectors
            .par_chunks_exact(dimensions)
            .enumerate()
            .map(|(i, vector)| {
                let distance =
                    squared_l2_distance_simd(query_vector, vector).unwrap_or(Number::INFINITY);
                (distance, i)
            })
            .collect();

        distances.sort_unstable_by(|a, b| a.0.total_cmp(&b.0).then(a.1.cmp(&b.1)));
        distances.truncate(k);
        debug!(
            "Exact search over {} entries took {:?}",
            self.len(),
            start.elapsed()
        );

        Ok(distances
            .into_iter()
            .map(|(distance, i)| ScoredChunk {
                chunk: self.chunks[i].clone(),
                distance,
            })
            .collect())
    }

    pub fn stats(&self) -> KnowledgeStats {
        KnowledgeStats::from_chunks(&self.chunks)
    }

    /// Stats straight from the metadata artifact, without touching the index.
    pub fn read_stats(files: &StoreFiles) -> Result<KnowledgeStats> {
        Ok(KnowledgeStats::from_chunks(&files.read_metadata_only()?))
    }
}
