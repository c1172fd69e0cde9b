// src/snapshot.rs
//
// Crash snapshot: the confirming frame as a JPEG, attached to the alert
// (base64) and optionally written next to the archive.

use crate::types::{FrameImage, IncidentId};
use base64::Engine;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Alerts go over mobile links; anything bigger is not attached.
const MAX_JPEG_BYTES: usize = 400_000;

#[derive(Debug, Clone)]
pub struct Snapshot {
    pub incident_id: IncidentId,
    pub sequence: u64,
    pub jpeg: Vec<u8>,
}

impl Snapshot {
    /// Encodes the frame. Returns None if the buffer is malformed or the
    /// encoded image is too large to send.
    pub fn capture(
        incident_id: IncidentId,
        sequence: u64,
        image: &FrameImage,
        quality: u8,
    ) -> Option<Self> {
        if !image.is_well_formed() {
            debug!("Snapshot skipped for {}: malformed frame", incident_id);
            return None;
        }
        let jpeg = encode_rgb_to_jpeg(&image.rgb, image.width, image.height, quality)?;
        if jpeg.len() > MAX_JPEG_BYTES {
            warn!(
                "Snapshot for {} is {} bytes, not attaching",
                incident_id,
                jpeg.len()
            );
            return None;
        }
        Some(Self {
            incident_id,
            sequence,
            jpeg,
        })
    }

    pub fn to_base64(&self) -> String {
        base64::engine::general_purpose::STANDARD.encode(&self.jpeg)
    }

    /// Writes `<dir>/<incident>_<sequence>.jpg`.
    pub fn write_to(&self, dir: &Path) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(dir)?;
        let path = dir.join(format!("{}_{}.jpg", self.incident_id, self.sequence));
        std::fs::write(&path, &self.jpeg)?;
        Ok(path)
    }
}

/// Encode raw RGB bytes into a JPEG. Returns None on failure.
fn encode_rgb_to_jpeg(rgb_data: &[u8], width: usize, height: usize, quality: u8) -> Option<Vec<u8>> {
    use image::{ImageBuffer, RgbImage};

    let img: RgbImage = ImageBuffer::from_raw(width as u32, height as u32, rgb_data.to_vec())?;

    let mut buf = std::io::Cursor::new(Vec::new());
    let encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100));
    img.write_with_encoder(encoder).ok()?;

    Some(buf.into_inner())
}
