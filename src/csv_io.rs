use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use csv::{ReaderBuilder, Trim, WriterBuilder};
use tracing::{debug, warn};

use crate::address::InputRow;
use crate::errors::{AppError, AppResult};

pub const ADDRESS_COLUMN: &str = "address";
const OUTPUT_PREFIX: &str = "geocoded-";

#[derive(Debug, Clone)]
pub struct InputTable {
    pub headers: Vec<String>,
    pub rows: Vec<InputRow>,
}

pub fn read_input<P: AsRef<Path>>(path: P) -> AppResult<InputTable> {
    let path = path.as_ref();
    let file = File::open(path)?;
    let table = read_input_from(file)?;
    debug!(path = %path.display(), rows = table.rows.len(), "read input file");
    Ok(table)
}

pub fn read_input_from<R: Read>(reader: R) -> AppResult<InputTable> {
    let mut reader = ReaderBuilder::new()
        .flexible(true)
        .trim(Trim::Headers)
        .from_reader(reader);

    let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
    let address_idx = headers
        .iter()
        .position(|header| header.trim().eq_ignore_ascii_case(ADDRESS_COLUMN))
        .ok_or_else(|| {
            AppError::Input(format!(
                "missing required '{ADDRESS_COLUMN}' column (found: {})",
                headers.join(", ")
            ))
        })?;

    let mut rows = Vec::new();
    for (index, record) in reader.records().enumerate() {
        let record = record?;
        let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
        if fields.len() > headers.len() {
            warn!(
                row = index,
                fields = fields.len(),
                columns = headers.len(),
                "dropping fields beyond the header"
            );
        }
        // Output columns are appended after the header's width.
        fields.resize(headers.len(), String::new());
        let address = fields[address_idx].clone();
        rows.push(InputRow::new(index, fields, address));
    }

    Ok(InputTable { headers, rows })
}

/// `dir/input.csv` becomes `dir/geocoded-input.csv`.
pub fn output_path_for(input: &Path) -> AppResult<PathBuf> {
    let file_name = input
        .file_name()
        .ok_or_else(|| AppError::Input(format!("not a file path: {}", input.display())))?;
    let output_name = format!("{OUTPUT_PREFIX}{}", file_name.to_string_lossy());
    Ok(input.with_file_name(output_name))
}

pub fn write_output<P: AsRef<Path>>(
    path: P,
    headers: &[String],
    rows: &[Vec<String>],
) -> AppResult<()> {
    let file = File::create(path.as_ref())?;
    write_output_to(file, headers, rows)
}

pub fn write_output_to<W: Write>(
    writer: W,
    headers: &[String],
    rows: &[Vec<String>],
) -> AppResult<()> {
    let mut writer = WriterBuilder::new().flexible(true).from_writer(writer);
    writer.write_record(headers)?;
    for row in rows {
        writer.write_record(row)?;
    }
    writer.flush()?;
    Ok(())
}
