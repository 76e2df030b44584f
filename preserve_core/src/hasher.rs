use preserve_common::ChecksumAlgorithm;
use sha2::{Digest, Sha256};
use std::io::{self, Read};

const BUFFER_SIZE: usize = 64 * 1024; // 64KB buffer

/// Pluggable digest function used by the inventory builder
pub trait FileHasher: Send + Sync {
    /// Name recorded in checkpoints so a resume cannot mix algorithms
    fn algorithm(&self) -> String;

    /// Hex digest of everything the reader yields
    fn digest(&self, reader: &mut dyn Read) -> io::Result<String>;
}

fn stream(reader: &mut dyn Read, mut update: impl FnMut(&[u8])) -> io::Result<()> {
    let mut buffer = vec![0; BUFFER_SIZE];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        update(&buffer[..n]);
    }
    Ok(())
}

impl FileHasher for ChecksumAlgorithm {
    fn algorithm(&self) -> String {
        self.to_string()
    }

    fn digest(&self, reader: &mut dyn Read) -> io::Result<String> {
        match self {
            ChecksumAlgorithm::Md5 => {
                let mut context = md5::Context::new();
                stream(reader, |chunk| context.consume(chunk))?;
                Ok(format!("{:x}", context.compute()))
            }
            ChecksumAlgorithm::Sha256 => {
                let mut hasher = Sha256::new();
                stream(reader, |chunk| hasher.update(chunk))?;
                Ok(hex::encode(hasher.finalize()))
            }
            ChecksumAlgorithm::Blake3 => {
                let mut hasher = blake3::Hasher::new();
                stream(reader, |chunk| {
                    hasher.update(chunk);
                })?;
                Ok(hasher.finalize().to_hex().to_string())
            }
        }
    }
}
