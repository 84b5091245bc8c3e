use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::path::Path;

use anyhow::{Context, Result};
use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

/// Applied to downloaded bytes before hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decompressor {
    Gzip,
    Zstd,
}

impl Decompressor {
    pub fn decompress(&self, source: &Path, destination: &Path) -> Result<()> {
        let input = BufReader::new(
            File::open(source).with_context(|| format!("Failed to open {}", source.display()))?,
        );
        let mut output = BufWriter::new(
            File::create(destination)
                .with_context(|| format!("Failed to create {}", destination.display()))?,
        );
        match self {
            Decompressor::Gzip => {
                let mut decoder = GzDecoder::new(input);
                io::copy(&mut decoder, &mut output)
                    .with_context(|| format!("Failed to gunzip {}", source.display()))?;
            }
            Decompressor::Zstd => {
                zstd::stream::copy_decode(input, &mut output)
                    .with_context(|| format!("Failed to zstd-decode {}", source.display()))?;
            }
        }
        output.flush()?;
        Ok(())
    }
}

/// Expands a (decompressed) archive into the version directory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Unpacker {
    Tar,
    TarGz,
}

impl Unpacker {
    pub fn unpack(&self, archive: &Path, destination: &Path) -> Result<()> {
        let file = BufReader::new(
            File::open(archive).with_context(|| format!("Failed to open {}", archive.display()))?,
        );
        match self {
            Unpacker::Tar => tar::Archive::new(file).unpack(destination),
            Unpacker::TarGz => tar::Archive::new(GzDecoder::new(file)).unpack(destination),
        }
        .with_context(|| {
            format!(
                "Failed to unpack {} into {}",
                archive.display(),
                destination.display()
            )
        })
    }
}
