//! Display previews captured with the monitor `screendump` command.
//!
//! The engine writes a binary PPM (`P6`) file; only the header is parsed here
//! so observers know the dimensions without decoding pixels.

use std::io::Read;
use std::path::{Path, PathBuf};

/// Well-known screendump target for a VM, keyed by its main image file name.
///
/// `"/images/My Disk.img"` → `<tmp>/My_Disk.img_screen.ppm`
pub fn screendump_path(main_image: &Path) -> PathBuf {
    let file_name = main_image
        .file_name()
        .map(|n| n.to_string_lossy().replace(' ', "_"))
        .unwrap_or_else(|| "vm".to_string());
    std::env::temp_dir().join(format!("{file_name}_screen.ppm"))
}

/// A screendump that is ready to display.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewImage {
    pub path: PathBuf,
    pub width: u32,
    pub height: u32,
    pub max_value: u32,
}

impl PreviewImage {
    /// Read and validate the PPM header at `path`.
    pub fn load(path: &Path) -> std::io::Result<Self> {
        let mut header = Vec::with_capacity(256);
        std::fs::File::open(path)?
            .take(256)
            .read_to_end(&mut header)?;
        let (width, height, max_value) = parse_ppm_header(&header).ok_or_else(|| {
            std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                format!("{} is not a P6 image", path.display()),
            )
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            width,
            height,
            max_value,
        })
    }
}

/// Parse `P6 <width> <height> <maxval>`, skipping `#` comments.
fn parse_ppm_header(bytes: &[u8]) -> Option<(u32, u32, u32)> {
    let mut tokens = Vec::with_capacity(4);
    let mut current = String::new();
    let mut in_comment = false;

    for &b in bytes {
        if tokens.len() == 4 {
            break;
        }
        if in_comment {
            in_comment = b != b'\n';
            continue;
        }
        match b {
            b'#' => in_comment = true,
            b if b.is_ascii_whitespace() => {
                if !current.is_empty() {
                    tokens.push(std::mem::take(&mut current));
                }
            }
            b => current.push(b as char),
        }
    }

    if tokens.len() < 4 || tokens[0] != "P6" {
        return None;
    }
    let width = tokens[1].parse().ok()?;
    let height = tokens[2].parse().ok()?;
    let max_value = tokens[3].parse().ok()?;
    (width > 0 && height > 0).then_some((width, height, max_value))
}
