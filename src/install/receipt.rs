//! On-disk installation record, authoritative over the catalog when the two
//! disagree. Stored gzipped at `<install_folder>/.cave/receipt.json.gz`.

use std::fs::File;
use std::io::{Read, Write};
use std::path::Path;

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};

use crate::errors::Result;
use crate::launch::Manifest;

pub const RECEIPT_RELATIVE_PATH: &str = ".cave/receipt.json.gz";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Receipt {
    pub installer_name: String,
    pub game_id: String,
    pub upload_id: String,
    pub build_id: String,
    pub files: Vec<String>,
    #[serde(default)]
    pub manifest: Option<Manifest>,
}

impl Receipt {
    pub fn path_under(install_folder: &Path) -> std::path::PathBuf {
        install_folder.join(RECEIPT_RELATIVE_PATH)
    }

    pub fn write(&self, install_folder: &Path) -> Result<()> {
        let path = Self::path_under(install_folder);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec(self)?;
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(&body)?;
        let gzipped = encoder.finish()?;
        crate::utils::file::write_atomic(&path, &gzipped)?;
        Ok(())
    }

    pub fn read(install_folder: &Path) -> Result<Option<Self>> {
        let path = Self::path_under(install_folder);
        if !path.exists() {
            return Ok(None);
        }
        let mut gzipped = Vec::new();
        File::open(&path)?.read_to_end(&mut gzipped)?;
        let mut decoder = GzDecoder::new(&gzipped[..]);
        let mut body = Vec::new();
        decoder.read_to_end(&mut body)?;
        let receipt = serde_json::from_slice(&body)?;
        Ok(Some(receipt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let receipt = Receipt {
            installer_name: "archive".into(),
            game_id: "g1".into(),
            upload_id: "u1".into(),
            build_id: "b1".into(),
            files: vec!["game.bin".into()],
            manifest: None,
        };
        receipt.write(dir.path()).unwrap();
        let read_back = Receipt::read(dir.path()).unwrap().unwrap();
        assert_eq!(read_back.game_id, "g1");
        assert_eq!(read_back.files, vec!["game.bin".to_string()]);
    }

    #[test]
    fn missing_receipt_reads_as_none() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Receipt::read(dir.path()).unwrap().is_none());
    }
}
