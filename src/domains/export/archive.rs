use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use zip::{write::FileOptions, CompressionMethod, ZipArchive, ZipWriter};

use crate::domains::export::types::{Archive, ArchiveMember, ExportFormat, ExportId, OutputFile};
use crate::domains::export::writer::PartialFile;
use crate::errors::{ExportError, ExportResult};

/// Name of shard `shard_index` (0-based) out of `total` inside an archive.
pub fn member_name(base_name: &str, shard_index: u32, total: usize, format: ExportFormat) -> String {
    format!("{}_part{}of{}.{}", base_name, shard_index + 1, total, format.file_extension())
}

/// Packages the shards of a multi-file export into one zip archive.
///
/// Members are written in shard order with fixed timestamps and permissions,
/// so identical inputs give identical archives.
pub struct ArchiveBuilder {
    base_name: String,
}

impl ArchiveBuilder {
    pub fn new(base_name: impl Into<String>) -> Self {
        Self {
            base_name: base_name.into(),
        }
    }

    pub fn archive_file_name(&self) -> String {
        format!("{}.zip", self.base_name)
    }

    /// Blocking; run it off the async executor.
    pub fn build(&self, export_id: ExportId, files: &[OutputFile], destination: &Path) -> ExportResult<Archive> {
        if files.is_empty() {
            return Err(ExportError::ArchiveBuild("no output files to archive".to_string()));
        }

        let mut ordered: Vec<&OutputFile> = files.iter().collect();
        ordered.sort_by_key(|f| f.shard_index);
        for (expected, file) in ordered.iter().enumerate() {
            if file.shard_index as usize != expected {
                return Err(ExportError::ArchiveBuild(format!(
                    "shard {} is missing (found shard {} in its place)",
                    expected, file.shard_index
                )));
            }
            verify_input(file)?;
        }

        let partial = PartialFile::new(destination);
        let total = ordered.len();
        let mut members = Vec::with_capacity(total);
        {
            let out = File::create(partial.path())?;
            let mut zip = ZipWriter::new(out);

            for file in &ordered {
                let name = member_name(&self.base_name, file.shard_index, total, file.format);
                zip.start_file(name.as_str(), member_options(file.format))?;
                let mut reader = BufReader::new(File::open(&file.path).map_err(|e| {
                    ExportError::ArchiveBuild(format!("cannot open shard {}: {}", file.path.display(), e))
                })?);
                let copied = std::io::copy(&mut reader, &mut zip)
                    .map_err(|e| ExportError::ArchiveBuild(format!("cannot copy shard {}: {}", file.shard_index, e)))?;
                if copied != file.size_bytes {
                    return Err(ExportError::ArchiveBuild(format!(
                        "shard {} changed while archiving ({} bytes expected, {} copied)",
                        file.shard_index, file.size_bytes, copied
                    )));
                }

                members.push(ArchiveMember {
                    name,
                    shard_index: file.shard_index,
                    size_bytes: file.size_bytes,
                    row_count: file.row_count,
                    checksum: file.checksum.clone(),
                });
            }

            let out = zip.finish()?;
            out.sync_all()?;
        }

        let path = partial.commit_blocking()?;
        let size_bytes = std::fs::metadata(&path)?.len();

        log::info!(
            "Built archive for export {}: {} members, {} bytes",
            export_id,
            members.len(),
            size_bytes
        );

        Ok(Archive {
            export_id,
            path,
            file_name: self.archive_file_name(),
            size_bytes,
            members,
        })
    }

    /// Bytes of one shard (0-based) of a built archive.
    pub fn extract(archive: &Archive, part_index: u32) -> ExportResult<Vec<u8>> {
        let member = archive
            .members
            .iter()
            .find(|m| m.shard_index == part_index)
            .ok_or(ExportError::NotFound)?;

        let file = File::open(&archive.path).map_err(|_| ExportError::NotFound)?;
        let mut zip = ZipArchive::new(BufReader::new(file))?;
        let mut entry = zip.by_name(&member.name)?;
        let mut bytes = Vec::with_capacity(member.size_bytes as usize);
        entry.read_to_end(&mut bytes)?;
        Ok(bytes)
    }
}

fn member_options(format: ExportFormat) -> FileOptions {
    // Spreadsheets are zip containers already.
    let method = match format {
        ExportFormat::Csv => CompressionMethod::Deflated,
        ExportFormat::Excel => CompressionMethod::Stored,
    };
    FileOptions::default()
        .compression_method(method)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644)
}

fn verify_input(file: &OutputFile) -> ExportResult<()> {
    let metadata = std::fs::metadata(&file.path).map_err(|_| {
        ExportError::ArchiveBuild(format!("shard {} is missing at {}", file.shard_index, file.path.display()))
    })?;
    let on_disk = metadata.len();
    if on_disk == 0 && (file.row_count > 0 || file.size_bytes > 0) {
        return Err(ExportError::ArchiveBuild(format!(
            "shard {} is empty but should hold {} rows",
            file.shard_index, file.row_count
        )));
    }
    if on_disk != file.size_bytes {
        return Err(ExportError::ArchiveBuild(format!(
            "shard {} is {} bytes on disk, expected {}",
            file.shard_index, on_disk, file.size_bytes
        )));
    }
    Ok(())
}
