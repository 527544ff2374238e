use async_trait::async_trait;
use sha2::{Digest, Sha256};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use tokio::fs::File;
use tokio::io::{AsyncWriteExt, BufWriter};
use zip::{write::FileOptions, CompressionMethod, ZipWriter};

use crate::config::ExportConfig;
use crate::domains::export::schema::{Cell, RowSchema};
use crate::domains::export::types::{ExportFormat, OutputFile, RowRecord};
use crate::domains::export::writer::{FormatWriter, PartialFile};
use crate::errors::{ExportError, ExportResult};

const CONTENT_TYPES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#;

const ROOT_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="Export" sheetId="1" r:id="rId1"/></sheets></workbook>"#;

const WORKBOOK_RELS_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

const STYLES_XML: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="1"><fill><patternFill patternType="none"/></fill></fills><borders count="1"><border/></borders><cellStyleXfs count="1"><xf/></cellStyleXfs><cellXfs count="1"><xf xfId="0"/></cellXfs></styleSheet>"#;

const SHEET_PREFIX: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#;

const SHEET_SUFFIX: &str = "</sheetData></worksheet>";

/// Streaming spreadsheet writer. Worksheet rows are staged as XML in a
/// temporary file next to the destination; `close` packages the workbook.
pub struct StreamingXlsxWriter {
    sheet: BufWriter<File>,
    staging: NamedTempFile,
    partial: PartialFile,
    shard_index: u32,
    schema: RowSchema,
    flush_bytes: usize,
    buffer: Vec<u8>,
    bytes_encoded: u64,
    rows_written: u64,
}

impl StreamingXlsxWriter {
    pub async fn create(
        destination: &Path,
        shard_index: u32,
        schema: RowSchema,
        config: &ExportConfig,
    ) -> ExportResult<Self> {
        let parent = destination
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        let staging = tempfile::Builder::new()
            .prefix(".sheet-")
            .suffix(".xml")
            .tempfile_in(&parent)
            .map_err(|e| ExportError::Write(format!("Failed to create sheet staging file: {}", e)))?;
        let file = File::from_std(staging.reopen()?);

        let mut writer = Self {
            sheet: BufWriter::new(file),
            staging,
            partial: PartialFile::new(destination),
            shard_index,
            schema,
            flush_bytes: config.writer_flush_bytes,
            buffer: Vec::with_capacity(config.writer_flush_bytes),
            bytes_encoded: 0,
            rows_written: 0,
        };

        if !writer.schema.is_empty() {
            let header: Vec<String> = writer.schema.columns().to_vec();
            let cells: Vec<Cell<'_>> = header.iter().map(|h| Cell::Text(h)).collect();
            let start = writer.buffer.len();
            encode_row(&mut writer.buffer, &cells);
            writer.bytes_encoded += (writer.buffer.len() - start) as u64;
        }

        Ok(writer)
    }

    async fn drain_buffer(&mut self) -> ExportResult<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }
        self.sheet
            .write_all(&self.buffer)
            .await
            .map_err(|e| ExportError::Write(format!("Sheet staging write failed: {}", e)))?;
        self.buffer.clear();
        Ok(())
    }
}

#[async_trait]
impl FormatWriter for StreamingXlsxWriter {
    async fn append(&mut self, rows: &[RowRecord]) -> ExportResult<u64> {
        if let Some(ceiling) = ExportFormat::Excel.row_ceiling() {
            if self.rows_written + rows.len() as u64 > ceiling {
                return Err(ExportError::Write(format!(
                    "Spreadsheet shard {} would exceed {} rows",
                    self.shard_index, ceiling
                )));
            }
        }

        for row in rows {
            let cells = self
                .schema
                .project(row)
                .map_err(|e| ExportError::Write(format!("Row does not fit the sheet header: {}", e)))?;
            let start = self.buffer.len();
            encode_row(&mut self.buffer, &cells);
            self.bytes_encoded += (self.buffer.len() - start) as u64;
            self.rows_written += 1;

            if self.buffer.len() >= self.flush_bytes {
                self.drain_buffer().await?;
            }
        }

        Ok(self.bytes_encoded)
    }

    async fn flush(&mut self) -> ExportResult<()> {
        self.drain_buffer().await?;
        self.sheet
            .flush()
            .await
            .map_err(|e| ExportError::Write(format!("Sheet staging flush failed: {}", e)))?;
        Ok(())
    }

    async fn close(mut self: Box<Self>) -> ExportResult<OutputFile> {
        self.flush().await?;

        let StreamingXlsxWriter {
            sheet,
            staging,
            partial,
            shard_index,
            rows_written,
            ..
        } = *self;
        drop(sheet);

        let (path, size_bytes, checksum) =
            tokio::task::spawn_blocking(move || package_workbook(staging, partial)).await??;

        log::debug!("Spreadsheet shard {} closed: {} rows, {} bytes", shard_index, rows_written, size_bytes);

        Ok(OutputFile {
            shard_index,
            path,
            format: ExportFormat::Excel,
            size_bytes,
            row_count: rows_written,
            checksum: Some(checksum),
        })
    }

    async fn abort(self: Box<Self>) {
        log::debug!("Aborting spreadsheet shard {} at {}", self.shard_index, self.partial.destination().display());
    }

    fn format(&self) -> ExportFormat {
        ExportFormat::Excel
    }

    fn rows_written(&self) -> u64 {
        self.rows_written
    }
}

/// Write the OOXML container around the staged sheet data.
fn package_workbook(staging: NamedTempFile, partial: PartialFile) -> ExportResult<(PathBuf, u64, String)> {
    let file = std::fs::File::create(partial.path())?;
    let mut zip = ZipWriter::new(file);
    let options = FileOptions::default()
        .compression_method(CompressionMethod::Deflated)
        .last_modified_time(zip::DateTime::default())
        .unix_permissions(0o644);

    let parts: [(&str, &str); 5] = [
        ("[Content_Types].xml", CONTENT_TYPES_XML),
        ("_rels/.rels", ROOT_RELS_XML),
        ("xl/workbook.xml", WORKBOOK_XML),
        ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS_XML),
        ("xl/styles.xml", STYLES_XML),
    ];
    for (name, body) in parts {
        zip.start_file(name, options).map_err(ExportError::write)?;
        zip.write_all(body.as_bytes())?;
    }

    zip.start_file("xl/worksheets/sheet1.xml", options).map_err(ExportError::write)?;
    zip.write_all(SHEET_PREFIX.as_bytes())?;
    let mut rows = staging.reopen()?;
    std::io::copy(&mut rows, &mut zip)?;
    zip.write_all(SHEET_SUFFIX.as_bytes())?;

    let mut file = zip.finish().map_err(ExportError::write)?;
    file.sync_all()?;
    drop(file);
    drop(staging);

    let mut hasher = Sha256::new();
    let mut reader = std::fs::File::open(partial.path())?;
    let mut chunk = [0u8; 8192];
    loop {
        let n = reader.read(&mut chunk)?;
        if n == 0 {
            break;
        }
        hasher.update(&chunk[..n]);
    }

    let path = partial.commit_blocking()?;
    let size_bytes = std::fs::metadata(&path)?.len();
    Ok((path, size_bytes, hex::encode(hasher.finalize())))
}

fn encode_row(out: &mut Vec<u8>, cells: &[Cell<'_>]) {
    out.extend_from_slice(b"<row>");
    for cell in cells {
        match cell {
            Cell::Empty => out.extend_from_slice(b"<c/>"),
            Cell::Bool(b) => {
                out.extend_from_slice(if *b { b"<c t=\"b\"><v>1</v></c>" } else { b"<c t=\"b\"><v>0</v></c>" });
            }
            Cell::Number(n) => {
                out.extend_from_slice(b"<c><v>");
                out.extend_from_slice(n.to_string().as_bytes());
                out.extend_from_slice(b"</v></c>");
            }
            Cell::Text(s) => {
                out.extend_from_slice(b"<c t=\"inlineStr\"><is><t xml:space=\"preserve\">");
                push_escaped(out, s);
                out.extend_from_slice(b"</t></is></c>");
            }
        }
    }
    out.extend_from_slice(b"</row>");
}

fn push_escaped(out: &mut Vec<u8>, text: &str) {
    for c in text.chars() {
        match c {
            '&' => out.extend_from_slice(b"&amp;"),
            '<' => out.extend_from_slice(b"&lt;"),
            '>' => out.extend_from_slice(b"&gt;"),
            '"' => out.extend_from_slice(b"&quot;"),
            // XML 1.0 has no representation for other control characters
            c if (c as u32) < 0x20 && !matches!(c, '\t' | '\n' | '\r') => {}
            '\u{FFFE}' | '\u{FFFF}' => {}
            c => {
                let mut buf = [0u8; 4];
                out.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            }
        }
    }
}
