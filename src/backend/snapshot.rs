//! NDJSON persistence for driver state: one relaxed extended-JSON document per line.

use bson::{Bson, Document as BsonDocument};
use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::Path;
use tempfile::NamedTempFile;

use crate::errors::DbError;

/// Load every document from `path`. A missing file is an empty collection.
///
/// # Errors
/// Returns an error when the file cannot be read or a line is not a JSON object.
pub fn load(path: &Path) -> Result<Vec<BsonDocument>, DbError> {
    let file = match File::open(path) {
        Ok(f) => f,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };
    let mut out = Vec::new();
    for (line_no, line) in BufReader::new(file).lines().enumerate() {
        let line = line?;
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<serde_json::Value>(line)? {
            serde_json::Value::Object(map) => {
                out.push(BsonDocument::try_from(map).map_err(|e| DbError::Decode(e.to_string()))?);
            }
            _ => {
                return Err(DbError::Decode(format!("{}:{}: expected a JSON object", path.display(), line_no + 1)));
            }
        }
    }
    log::debug!("snapshot: loaded {} documents from {}", out.len(), path.display());
    Ok(out)
}

/// Rewrite `path` atomically: write a sibling temp file, then rename it over the destination.
///
/// # Errors
/// Returns an error if the directory cannot be created or the write/persist fails.
pub fn save<'a>(path: &Path, docs: impl IntoIterator<Item = &'a BsonDocument>) -> Result<(), DbError> {
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    if !parent.exists() {
        std::fs::create_dir_all(parent)?;
    }
    let mut tmp = NamedTempFile::new_in(parent)?;
    {
        let mut w = BufWriter::new(tmp.as_file_mut());
        for d in docs {
            let v = Bson::Document(d.clone()).into_relaxed_extjson();
            writeln!(w, "{}", serde_json::to_string(&v)?)?;
        }
        w.flush()?;
    }
    tmp.persist(path).map_err(|e| DbError::Io(e.error.to_string()))?;
    Ok(())
}
