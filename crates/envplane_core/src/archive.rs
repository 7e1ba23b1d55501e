//! Extração do arquivo de probes recebido do coletor.
//!
//! O coletor envia a árvore de diretórios compactada como zip.

use std::io::{Read, Seek};
use std::path::Path;

use tracing::debug;
use zip::ZipArchive;

use crate::error::Result;

/// Extrai o arquivo em `destination`, criando o diretório se necessário.
/// Retorna o número de entradas extraídas.
pub fn extract_archive<R: Read + Seek>(reader: R, destination: &Path) -> Result<usize> {
    std::fs::create_dir_all(destination)?;

    let mut archive = ZipArchive::new(reader)?;
    // `extract` recusa caminhos que escapam do destino
    archive.extract(destination)?;

    debug!(entries = archive.len(), "Arquivo extraído em {}", destination.display());
    Ok(archive.len())
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::io::{Cursor, Write};

    use zip::CompressionMethod;
    use zip::write::{SimpleFileOptions, ZipWriter};

    /// Zip em memória com os arquivos dados, sem compressão.
    pub(crate) fn zip_bytes(files: &[(&str, &[u8])]) -> Vec<u8> {
        let mut writer = ZipWriter::new(Cursor::new(Vec::new()));
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Stored);
        for (name, contents) in files {
            writer.start_file(*name, options).unwrap();
            writer.write_all(contents).unwrap();
        }
        writer.finish().unwrap().into_inner()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PlaneError;
    use std::io::Cursor;

    #[test]
    fn extracts_nested_tree() {
        let dir = tempfile::tempdir().unwrap();
        let data = fixtures::zip_bytes(&[("st1/cwnd.log", b"1 2 3"), ("gw/rate.log", b"4")]);

        let count = extract_archive(Cursor::new(data), dir.path()).unwrap();

        assert_eq!(count, 2);
        assert_eq!(std::fs::read(dir.path().join("st1/cwnd.log")).unwrap(), b"1 2 3");
        assert_eq!(std::fs::read(dir.path().join("gw/rate.log")).unwrap(), b"4");
    }

    #[test]
    fn creates_missing_destination() {
        let dir = tempfile::tempdir().unwrap();
        let dest = dir.path().join("a/b");
        let data = fixtures::zip_bytes(&[("x", b"y")]);

        extract_archive(Cursor::new(data), &dest).unwrap();
        assert!(dest.join("x").is_file());
    }

    #[test]
    fn corrupt_archive_is_an_archive_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_archive(Cursor::new(vec![b'x'; 64]), dir.path());
        assert!(matches!(result, Err(PlaneError::Archive(_))));
    }
}
