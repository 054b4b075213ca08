//! TOML interest table loader.
//!
//! ```toml
//! [[interest]]
//! service_uuid = "6e400001-b5a3-f393-e0a9-e50e24dcca9e"
//! characteristic_uuid = "6e400003-b5a3-f393-e0a9-e50e24dcca9e"
//! decoder = "uart_packet"
//! ```
//!
//! Entries keep their file order; an entry's position is its handler id.

use std::path::Path;

use blehub_core::domain::decoder_by_name;
use blehub_core::{InterestEntry, InterestTable};
use serde::Deserialize;
use thiserror::Error;
use uuid::Uuid;

/// Errors loading an interest file.
#[derive(Debug, Error)]
pub enum InterestConfigError {
    #[error("cannot read interest file {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid interest file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("entry {index}: unknown decoder {name:?}")]
    UnknownDecoder { index: usize, name: String },

    #[error("entry {index}: invalid UUID {value:?}")]
    InvalidUuid { index: usize, value: String },

    #[error("interest file has no [[interest]] entries")]
    Empty,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InterestFile {
    #[serde(default)]
    interest: Vec<InterestSpec>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct InterestSpec {
    service_uuid: String,
    characteristic_uuid: String,
    decoder: String,
}

/// Reads and validates the interest file at `path`.
pub fn load_interest_file(path: &Path) -> Result<InterestTable, InterestConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| InterestConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    parse_interest_table(&text)
}

/// Parses interest file contents.
pub fn parse_interest_table(text: &str) -> Result<InterestTable, InterestConfigError> {
    let file: InterestFile = toml::from_str(text)?;
    if file.interest.is_empty() {
        return Err(InterestConfigError::Empty);
    }

    let entries = file
        .interest
        .into_iter()
        .enumerate()
        .map(|(index, spec)| -> Result<InterestEntry, InterestConfigError> {
            let parse = |value: &str| {
                Uuid::parse_str(value).map_err(|_| InterestConfigError::InvalidUuid {
                    index,
                    value: value.to_string(),
                })
            };
            Ok(InterestEntry {
                service_uuid: parse(&spec.service_uuid)?,
                characteristic_uuid: parse(&spec.characteristic_uuid)?,
                decoder: decoder_by_name(&spec.decoder).ok_or_else(|| {
                    InterestConfigError::UnknownDecoder {
                        index,
                        name: spec.decoder.clone(),
                    }
                })?,
            })
        })
        .collect::<Result<Vec<_>, _>>()?;

    Ok(InterestTable::new(entries))
}
