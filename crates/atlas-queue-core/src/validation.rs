//! Sanity checks on generated model files

use crate::error::Result;
use crate::models::RequestKind;
use serde::{Deserialize, Serialize};
use std::path::Path;
use tokio::io::AsyncReadExt;

/// Smallest output the worker produces for a real model
pub const MIN_OUTPUT_BYTES: u64 = 1024;

/// How much of the file is scanned for the format signature
const SIGNATURE_WINDOW: usize = 1024;

/// Verdict on a generated output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutputValidation {
    Valid,
    Missing,
    TooSmall { size: u64 },
    MissingSignature,
}

impl OutputValidation {
    pub fn is_valid(&self) -> bool {
        matches!(self, OutputValidation::Valid)
    }

    pub fn describe(&self) -> String {
        match self {
            OutputValidation::Valid => "valid".to_string(),
            OutputValidation::Missing => "file does not exist".to_string(),
            OutputValidation::TooSmall { size } => {
                format!("file is {} bytes, expected at least {}", size, MIN_OUTPUT_BYTES)
            }
            OutputValidation::MissingSignature => "format signature not found".to_string(),
        }
    }
}

/// Check that `path` looks like a complete model of the requested kind
pub async fn validate_output(path: &Path, kind: RequestKind) -> Result<OutputValidation> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(metadata) => metadata,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(OutputValidation::Missing)
        }
        Err(e) => return Err(e.into()),
    };

    if metadata.len() < MIN_OUTPUT_BYTES {
        return Ok(OutputValidation::TooSmall {
            size: metadata.len(),
        });
    }

    let Some(signature) = kind.signature() else {
        return Ok(OutputValidation::Valid);
    };

    let mut file = tokio::fs::File::open(path).await?;
    let mut head = Vec::with_capacity(SIGNATURE_WINDOW);
    (&mut file)
        .take(SIGNATURE_WINDOW as u64)
        .read_to_end(&mut head)
        .await?;

    if has_signature(&head, signature) {
        Ok(OutputValidation::Valid)
    } else {
        Ok(OutputValidation::MissingSignature)
    }
}

/// Whether the first line of `head` mentions `signature`
fn has_signature(head: &[u8], signature: &str) -> bool {
    let text = String::from_utf8_lossy(head);
    text.lines()
        .next()
        .map(|line| line.contains(signature))
        .unwrap_or(false)
}
