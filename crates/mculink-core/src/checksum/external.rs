//! Checksum computed by an out-of-process helper.
//!
//! Helper protocol:
//! - `<path> -size` prints the checksum width; the first 4 characters of the
//!   first line are read as a decimal number.
//! - `<path> <data-hex> <length> <seed-hex>` prints the checksum as hex on its
//!   first line.

use std::path::{Path, PathBuf};
use std::process::Command;

use tracing::{debug, instrument};

use super::ChecksumError;

/// Width of the size token printed by `<path> -size`.
const SIZE_TOKEN_LEN: usize = 4;

/// Checksum provider backed by an external executable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalChecksum {
    path: PathBuf,
    size: usize,
}

impl ExternalChecksum {
    /// Query the helper at `path` for its checksum width.
    #[instrument(level = "debug", skip(path), fields(path = %path.as_ref().display()))]
    pub fn new(path: impl AsRef<Path>) -> Result<Self, ChecksumError> {
        let path = path.as_ref().to_path_buf();
        let line = run_helper(&path, &["-size"])?;
        let size = parse_size(&line)?;
        debug!(size, "External checksum helper ready");
        Ok(Self { path, size })
    }

    /// Checksum width reported by the helper.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn compute(&self, data: &[u8], seed: &[u8]) -> Result<Vec<u8>, ChecksumError> {
        let data_hex = encode_hex(data);
        let len = data.len().to_string();
        let seed_hex = encode_hex(seed);
        let line = run_helper(&self.path, &[&data_hex, &len, &seed_hex])?;

        let bytes = decode_hex(line.trim()).ok_or_else(|| ChecksumError::Malformed(line.clone()))?;
        if bytes.len() != self.size {
            return Err(ChecksumError::WrongLength {
                expected: self.size,
                actual: bytes.len(),
            });
        }
        Ok(bytes)
    }
}

fn run_helper(path: &Path, args: &[&str]) -> Result<String, ChecksumError> {
    let output = Command::new(path)
        .args(args)
        .output()
        .map_err(|source| ChecksumError::Spawn {
            path: path.display().to_string(),
            source,
        })?;

    if !output.status.success() {
        return Err(ChecksumError::HelperFailed {
            path: path.display().to_string(),
            status: output.status.to_string(),
        });
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    stdout
        .lines()
        .next()
        .map(str::to_owned)
        .ok_or_else(|| ChecksumError::Malformed(String::new()))
}

fn parse_size(line: &str) -> Result<usize, ChecksumError> {
    let token: String = line.trim().chars().take(SIZE_TOKEN_LEN).collect();
    match token.trim().parse::<usize>() {
        Ok(size) if size > 0 => Ok(size),
        _ => Err(ChecksumError::Malformed(line.to_owned())),
    }
}

/// Lowercase hex, two characters per byte.
pub fn encode_hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Parse an even-length hex string. Returns `None` on any non-hex character.
pub fn decode_hex(text: &str) -> Option<Vec<u8>> {
    if text.len() % 2 != 0 || !text.is_ascii() {
        return None;
    }
    (0..text.len())
        .step_by(2)
        .map(|i| u8::from_str_radix(&text[i..i + 2], 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_size_token() {
        assert_eq!(parse_size("0002").unwrap(), 2);
        assert_eq!(parse_size("4\n").unwrap(), 4);
        assert_eq!(parse_size("0016trailing").unwrap(), 16);
        assert!(parse_size("").is_err());
        assert!(parse_size("0000").is_err());
        assert!(parse_size("ab").is_err());
    }

    #[test]
    fn test_hex_helpers() {
        assert_eq!(encode_hex(&[0x00, 0xAB, 0x7F]), "00ab7f");
        assert_eq!(decode_hex("00ab7f"), Some(vec![0x00, 0xAB, 0x7F]));
        assert_eq!(decode_hex("00AB"), Some(vec![0x00, 0xAB]));
        assert_eq!(decode_hex(""), Some(vec![]));
        assert_eq!(decode_hex("abc"), None);
        assert_eq!(decode_hex("zz"), None);
    }

    #[test]
    fn test_missing_helper_is_an_error() {
        let err = ExternalChecksum::new("/nonexistent/checksum-helper").unwrap_err();
        assert!(matches!(err, ChecksumError::Spawn { .. }));
    }

    #[cfg(unix)]
    mod helper {
        use super::*;
        use std::fs;
        use std::os::unix::fs::PermissionsExt;

        fn write_helper(dir: &Path, body: &str) -> PathBuf {
            let path = dir.join("helper.sh");
            fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
            fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
            path
        }

        #[test]
        fn test_helper_roundtrip() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_helper(
                dir.path(),
                r#"if [ "$1" = "-size" ]; then echo 0002; elif [ "$1 $2 $3" = "0102 2 0010" ]; then echo beef; else echo 0000; fi"#,
            );
            let ext = ExternalChecksum::new(&path).unwrap();
            assert_eq!(ext.size(), 2);
            assert_eq!(ext.compute(&[0x01, 0x02], &[0x00, 0x10]).unwrap(), vec![0xBE, 0xEF]);
        }

        #[test]
        fn test_short_output_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_helper(
                dir.path(),
                r#"if [ "$1" = "-size" ]; then echo 0004; else echo ab; fi"#,
            );
            let ext = ExternalChecksum::new(&path).unwrap();
            let err = ext.compute(b"data", &[0; 4]).unwrap_err();
            assert!(matches!(err, ChecksumError::WrongLength { expected: 4, actual: 1 }));
        }

        #[test]
        fn test_garbage_output_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_helper(
                dir.path(),
                r#"if [ "$1" = "-size" ]; then echo 0001; else echo "not hex"; fi"#,
            );
            let ext = ExternalChecksum::new(&path).unwrap();
            assert!(matches!(
                ext.compute(b"x", &[0]).unwrap_err(),
                ChecksumError::Malformed(_)
            ));
        }

        #[test]
        fn test_failing_helper_is_rejected() {
            let dir = tempfile::tempdir().unwrap();
            let path = write_helper(
                dir.path(),
                r#"if [ "$1" = "-size" ]; then echo 0001; else exit 3; fi"#,
            );
            let ext = ExternalChecksum::new(&path).unwrap();
            assert!(matches!(
                ext.compute(b"x", &[0]).unwrap_err(),
                ChecksumError::HelperFailed { .. }
            ));
        }
    }
}
