//! Writer of new TSSP files

use super::bloom::BloomFilter;
use super::chunk_meta::{encode_block, ChunkMeta, ColumnMeta, Segment, SegmentRange};
use super::file::TsspFile;
use super::file_name::TsspFileName;
use super::meta_index::{encode_section, MetaIndex};
use super::trailer::Trailer;
use super::{put_crc_block, FILE_HEADER_SIZE, FILE_MAGIC, FORMAT_VERSION};
use crate::compression::encode_column;
use crate::options::Config;
use crate::record::{ColMeta, Record};
use crate::{Result, SeriesId, TsspError};
use bytes::BufMut;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

struct FileWriter {
    tmp_path: PathBuf,
    out: BufWriter<File>,
    offset: u64,
    metas: Vec<ChunkMeta>,
    rows: u64,
}

impl FileWriter {
    fn create(tmp_path: PathBuf) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)
            .map_err(|e| TsspError::io_with_path("create", &tmp_path, e))?;
        let mut writer = Self {
            out: BufWriter::with_capacity(256 * 1024, file),
            tmp_path,
            offset: 0,
            metas: Vec::new(),
            rows: 0,
        };
        let mut header = Vec::with_capacity(FILE_HEADER_SIZE);
        header.put_slice(FILE_MAGIC);
        header.put_u32(FORMAT_VERSION);
        header.put_u64(0);
        writer.write(&header)?;
        Ok(writer)
    }

    fn write(&mut self, data: &[u8]) -> Result<u64> {
        let at = self.offset;
        self.out
            .write_all(data)
            .map_err(|e| TsspError::io_with_path("write", &self.tmp_path, e))?;
        self.offset += data.len() as u64;
        Ok(at)
    }
}

/// Builds the files of one measurement from records written in ascending series order.
///
/// Output goes to `<name>.tssp.init` and is renamed once sealed. When a file grows past
/// `file_size_limit` the builder seals it and continues in the next extent.
pub struct MsBuilder {
    conf: Arc<Config>,
    mst_dir: PathBuf,
    name: String,
    file_name: TsspFileName,
    writer: Option<FileWriter>,
    last_sid: Option<SeriesId>,
    files: Vec<Arc<TsspFile>>,
    block: Vec<u8>,
    framed: Vec<u8>,
}

impl MsBuilder {
    pub fn new(
        mst_dir: impl Into<PathBuf>,
        name: impl Into<String>,
        file_name: TsspFileName,
        conf: Arc<Config>,
    ) -> Self {
        Self {
            conf,
            mst_dir: mst_dir.into(),
            name: name.into(),
            file_name,
            writer: None,
            last_sid: None,
            files: Vec::new(),
            block: Vec::new(),
            framed: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Name of the extent currently being written
    pub fn file_name(&self) -> TsspFileName {
        self.file_name
    }

    pub fn mst_dir(&self) -> &Path {
        &self.mst_dir
    }

    /// Append all rows of series `sid`.
    ///
    /// Series ids must strictly increase between calls and the record must be sorted by
    /// time. Empty records are ignored.
    pub fn write_record(&mut self, sid: SeriesId, rec: &Record) -> Result<()> {
        if rec.is_empty() {
            return Ok(());
        }
        if let Some(last) = self.last_sid {
            if sid <= last {
                return Err(TsspError::InvalidFormat(format!(
                    "series {} written after series {}",
                    sid, last
                )));
            }
        }
        if self.name.len() > u16::MAX as usize {
            return Err(TsspError::InvalidFormat(format!(
                "measurement name of {} bytes exceeds {}",
                self.name.len(),
                u16::MAX
            )));
        }
        if let Some(f) = rec.schema.iter().find(|f| f.name.len() > u16::MAX as usize) {
            return Err(TsspError::InvalidFormat(format!(
                "column name of {} bytes exceeds {}",
                f.name.len(),
                u16::MAX
            )));
        }
        if rec.times().windows(2).any(|w| w[0] > w[1]) {
            return Err(TsspError::InvalidFormat(format!(
                "rows of series {} are not sorted by time",
                sid
            )));
        }

        if self
            .writer
            .as_ref()
            .map_or(false, |w| w.offset >= self.conf.file_size_limit)
        {
            self.seal()?;
            self.file_name = self.file_name.next_extent();
        }
        if self.writer.is_none() {
            let dir = self.file_name.path(&self.mst_dir, true);
            if let Some(parent) = dir.parent() {
                fs::create_dir_all(parent)
                    .map_err(|e| TsspError::io_with_path("mkdir", parent, e))?;
            }
            self.writer = Some(FileWriter::create(dir)?);
        }
        let Some(writer) = self.writer.as_mut() else {
            return Err(TsspError::Internal("builder has no open file".into()));
        };

        let segments = rec.split(self.conf.max_rows_per_segment);
        let times = rec.times();
        let start = writer.offset;
        let mut columns = Vec::with_capacity(rec.col_nums());
        for (ci, field) in rec.schema.iter().enumerate() {
            let mut locs = Vec::with_capacity(segments.len());
            for seg in &segments {
                self.block.clear();
                self.framed.clear();
                encode_column(seg.column(ci), 0, seg.row_nums(), &mut self.block)?;
                put_crc_block(&mut self.framed, &self.block);
                let offset = writer.write(&self.framed)?;
                locs.push(Segment {
                    offset: offset as i64,
                    size: self.framed.len() as u32,
                });
            }
            columns.push(ColumnMeta {
                name: field.name.clone(),
                ty: field.ty,
                pre_agg: ColMeta::compute(rec.column(ci), times),
                segments: locs,
            });
        }

        let time_ranges = segments
            .iter()
            .map(|s| SegmentRange {
                min_time: s.min_time(true).unwrap_or_default(),
                max_time: s.max_time(true).unwrap_or_default(),
                rows: s.row_nums() as u32,
            })
            .collect();
        writer.metas.push(ChunkMeta {
            sid,
            offset: start as i64,
            size: (writer.offset - start) as u32,
            time_ranges,
            columns,
        });
        writer.rows += rec.row_nums() as u64;
        self.last_sid = Some(sid);
        Ok(())
    }

    /// Seal the current extent and return every file produced
    pub fn finish(mut self) -> Result<Vec<Arc<TsspFile>>> {
        self.seal()?;
        Ok(std::mem::take(&mut self.files))
    }

    fn seal(&mut self) -> Result<()> {
        let Some(mut w) = self.writer.take() else {
            return Ok(());
        };
        if w.metas.is_empty() {
            drop(w.out);
            match fs::remove_file(&w.tmp_path) {
                Ok(()) => debug!(path = %w.tmp_path.display(), "removed empty tssp file"),
                Err(e) => warn!(path = %w.tmp_path.display(), error = %e, "failed to remove empty tssp file"),
            }
            return Ok(());
        }

        let metas = std::mem::take(&mut w.metas);
        let data_size = w.offset - FILE_HEADER_SIZE as u64;
        let chunk_meta_offset = w.offset;
        let mut items = Vec::new();
        let mut buf = Vec::new();
        for group in metas.chunks(self.conf.max_chunk_metas_per_index) {
            buf.clear();
            encode_block(group, &mut buf)?;
            let offset = w.write(&buf)?;
            items.push(MetaIndex {
                id: group[0].sid,
                min_time: group.iter().map(ChunkMeta::min_time).min().unwrap_or_default(),
                max_time: group.iter().map(ChunkMeta::max_time).max().unwrap_or_default(),
                offset: offset as i64,
                size: buf.len() as u32,
            });
        }
        let chunk_meta_size = w.offset - chunk_meta_offset;

        buf.clear();
        encode_section(&items, &mut buf);
        let meta_index_offset = w.write(&buf)?;

        let mut bloom = BloomFilter::new(metas.len(), self.conf.bloom_bits_per_key);
        metas.iter().for_each(|m| bloom.add(m.sid));
        let bloom_offset = w.write(bloom.as_bytes())?;

        let trailer = Trailer {
            name: self.name.clone(),
            series_count: metas.len() as u64,
            rows: w.rows,
            min_id: metas[0].sid,
            max_id: metas[metas.len() - 1].sid,
            min_time: items.iter().map(|m| m.min_time).min().unwrap_or_default(),
            max_time: items.iter().map(|m| m.max_time).max().unwrap_or_default(),
            data_offset: FILE_HEADER_SIZE as u64,
            data_size,
            chunk_meta_offset,
            chunk_meta_size,
            meta_index_offset,
            meta_index_size: buf.len() as u64,
            meta_index_items: items.len() as u64,
            bloom_offset,
            bloom_size: bloom.as_bytes().len() as u64,
            bloom_hashes: bloom.num_hashes(),
        };
        buf.clear();
        trailer.encode(&mut buf)?;
        let trailer_size = buf.len() as u32;
        buf.put_u32(trailer_size);
        buf.put_slice(FILE_MAGIC);
        w.write(&buf)?;

        let tmp_path = w.tmp_path.clone();
        let file = w
            .out
            .into_inner()
            .map_err(|e| TsspError::io_with_path("flush", &tmp_path, e.into_error()))?;
        file.sync_all()
            .map_err(|e| TsspError::io_with_path("sync", &tmp_path, e))?;
        drop(file);

        let path = self.file_name.path(&self.mst_dir, false);
        fs::rename(&tmp_path, &path).map_err(|e| TsspError::io_with_path("rename", &tmp_path, e))?;
        info!(
            measurement = %self.name,
            path = %path.display(),
            series = trailer.series_count,
            rows = trailer.rows,
            "sealed tssp file"
        );
        let file = TsspFile::open(&path, self.file_name.order, &self.conf)?;
        self.files.push(file);
        Ok(())
    }
}

impl Drop for MsBuilder {
    fn drop(&mut self) {
        if let Some(w) = self.writer.take() {
            let tmp = w.tmp_path.clone();
            drop(w);
            match fs::remove_file(&tmp) {
                Ok(()) => debug!(path = %tmp.display(), "removed unfinished tssp file"),
                Err(e) => warn!(path = %tmp.display(), error = %e, "failed to remove unfinished tssp file"),
            }
        }
        // extents sealed by an abandoned build never reach a file set
        for file in self.files.drain(..) {
            file.mark_remove();
            file.unref_file();
        }
    }
}
