//! Backing grid image and cluster I/O.
//!
//! [`GridImage`] owns the `N × N` cell array. Cell `(x, y)` holds the 4
//! bytes at Hilbert-linear offset `t = xy_to_linear(x, y)`; byte `k` of the
//! cell at linear index `i` holds payload byte `4·(i − start) + k`, so a
//! contiguous curve range reads back as a contiguous byte range.
//!
//! Persistence wraps the cell array as an RGBA8 PNG with textual key/value
//! records plus a `<image>.meta.json` sidecar duplicating them.

use crate::cluster::{ClusterLocation, CELLS_PER_CLUSTER, CELL_BYTES, CLUSTER_BYTES};
use crate::error::{Error, Result};
use crate::hilbert::HilbertCurve;

use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::Path;
use tracing::debug;

/// The in-memory `N × N` grid of 4-byte cells.
#[derive(Debug, Clone)]
pub struct GridImage {
    curve: HilbertCurve,
    /// Row-major RGBA bytes, `N·N·4` long.
    cells: Vec<u8>,
}

impl GridImage {
    /// Creates a zeroed grid of side `grid_size` (a power of two).
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for unsupported grid sizes.
    pub fn new(grid_size: u32) -> Result<Self> {
        let curve = HilbertCurve::for_grid(grid_size)?;
        let len = (grid_size as usize) * (grid_size as usize) * CELL_BYTES;
        Ok(Self {
            curve,
            cells: vec![0u8; len],
        })
    }

    /// Grid side length `N`.
    #[must_use]
    pub fn grid_size(&self) -> u32 {
        self.curve.grid_size()
    }

    /// Total byte capacity `N² · 4`.
    #[must_use]
    pub fn byte_capacity(&self) -> u64 {
        self.curve.cell_count() * CELL_BYTES as u64
    }

    /// The curve used to linearize this grid.
    #[must_use]
    pub fn curve(&self) -> &HilbertCurve {
        &self.curve
    }

    /// Raw row-major cell bytes.
    #[must_use]
    pub fn cells(&self) -> &[u8] {
        &self.cells
    }

    fn cell_offset(&self, x: u32, y: u32) -> usize {
        ((y as usize) * (self.grid_size() as usize) + x as usize) * CELL_BYTES
    }

    /// Hilbert-linear cell index of a cluster anchor, verifying alignment.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when the anchor is off-grid or its
    /// linear offset is not a multiple of the cluster length.
    pub fn cluster_start(&self, anchor: ClusterLocation) -> Result<u64> {
        let t = self
            .curve
            .to_linear(u32::from(anchor.x), u32::from(anchor.y))?;
        if t % CELLS_PER_CLUSTER != 0 {
            return Err(Error::OutOfBounds(format!(
                "{anchor} (linear {t}) is not a cluster start"
            )));
        }
        Ok(t)
    }

    /// Reads `len` bytes from consecutive Hilbert cells starting at cell
    /// index `t_start`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when the range leaves the grid.
    pub fn read_linear(&self, t_start: u64, len: usize) -> Result<Vec<u8>> {
        let cells_needed = (len as u64).div_ceil(CELL_BYTES as u64);
        if t_start + cells_needed > self.curve.cell_count() {
            return Err(Error::OutOfBounds(format!(
                "linear read of {len} bytes at cell {t_start} leaves the grid"
            )));
        }
        let mut out = vec![0u8; len];
        for i in 0..cells_needed {
            let (x, y) = self.curve.to_xy(t_start + i)?;
            let src = self.cell_offset(x, y);
            let dst = (i as usize) * CELL_BYTES;
            let take = CELL_BYTES.min(len - dst);
            out[dst..dst + take].copy_from_slice(&self.cells[src..src + take]);
        }
        Ok(out)
    }

    /// Writes bytes to consecutive Hilbert cells starting at cell index
    /// `t_start`. A trailing partial cell is zero-padded.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] when the range leaves the grid.
    pub fn write_linear(&mut self, t_start: u64, data: &[u8]) -> Result<()> {
        let cells_needed = (data.len() as u64).div_ceil(CELL_BYTES as u64);
        if t_start + cells_needed > self.curve.cell_count() {
            return Err(Error::OutOfBounds(format!(
                "linear write of {} bytes at cell {t_start} leaves the grid",
                data.len()
            )));
        }
        for i in 0..cells_needed {
            let (x, y) = self.curve.to_xy(t_start + i)?;
            let dst = self.cell_offset(x, y);
            let src = (i as usize) * CELL_BYTES;
            let take = CELL_BYTES.min(data.len() - src);
            self.cells[dst..dst + take].copy_from_slice(&data[src..src + take]);
            if take < CELL_BYTES {
                for b in &mut self.cells[dst + take..dst + CELL_BYTES] {
                    *b = 0;
                }
            }
        }
        Ok(())
    }

    /// Materializes the 4096-byte cluster anchored at `anchor`.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for an invalid or misaligned anchor.
    pub fn read_cluster(&self, anchor: ClusterLocation) -> Result<Vec<u8>> {
        let t = self.cluster_start(anchor)?;
        self.read_linear(t, CLUSTER_BYTES)
    }

    /// Writes up to 4096 bytes into the cluster anchored at `anchor`,
    /// zero-padding the remainder.
    ///
    /// # Errors
    ///
    /// Returns [`Error::OutOfBounds`] for an invalid or misaligned anchor,
    /// or a payload longer than one cluster.
    pub fn write_cluster(&mut self, anchor: ClusterLocation, data: &[u8]) -> Result<()> {
        if data.len() > CLUSTER_BYTES {
            return Err(Error::OutOfBounds(format!(
                "cluster payload of {} bytes exceeds {CLUSTER_BYTES}",
                data.len()
            )));
        }
        let t = self.cluster_start(anchor)?;
        let mut padded = vec![0u8; CLUSTER_BYTES];
        padded[..data.len()].copy_from_slice(data);
        self.write_linear(t, &padded)
    }

    /// Saves the grid as an RGBA8 PNG at `path` with the given textual
    /// key/value records, then writes the `<path>.meta.json` sidecar
    /// duplicating them.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures and [`Error::Corrupt`] when
    /// the encoder rejects a record.
    pub fn save(&self, path: &Path, records: &[(String, String)]) -> Result<()> {
        let file = File::create(path)?;
        let writer = BufWriter::new(file);
        let n = self.grid_size();
        let mut encoder = png::Encoder::new(writer, n, n);
        encoder.set_color(png::ColorType::Rgba);
        encoder.set_depth(png::BitDepth::Eight);
        for (key, value) in records {
            encoder
                .add_text_chunk(key.clone(), value.clone())
                .map_err(|e| Error::Corrupt(format!("PNG text record {key}: {e}")))?;
        }
        let mut writer = encoder
            .write_header()
            .map_err(|e| Error::Corrupt(format!("PNG header: {e}")))?;
        writer
            .write_image_data(&self.cells)
            .map_err(|e| Error::Corrupt(format!("PNG image data: {e}")))?;
        writer
            .finish()
            .map_err(|e| Error::Corrupt(format!("PNG finish: {e}")))?;

        let sidecar: serde_json::Map<String, serde_json::Value> = records
            .iter()
            .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
            .collect();
        let sidecar_path = sidecar_path(path);
        let body = serde_json::to_vec_pretty(&sidecar)
            .map_err(|e| Error::Corrupt(format!("sidecar metadata: {e}")))?;
        write_atomic(&sidecar_path, &body)?;
        debug!(path = %path.display(), records = records.len(), "image saved");
        Ok(())
    }

    /// Loads a grid image and its embedded textual records.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Io`] on file failures and [`Error::Corrupt`] for a
    /// non-RGBA8, non-square or non-power-of-two raster.
    pub fn open(path: &Path) -> Result<(Self, Vec<(String, String)>)> {
        let decoder = png::Decoder::new(BufReader::new(File::open(path)?));
        let mut reader = decoder
            .read_info()
            .map_err(|e| Error::Corrupt(format!("PNG info: {e}")))?;
        let mut buf = vec![0u8; reader.output_buffer_size()];
        let frame = reader
            .next_frame(&mut buf)
            .map_err(|e| Error::Corrupt(format!("PNG frame: {e}")))?;
        let info = reader.info();
        if frame.color_type != png::ColorType::Rgba || frame.bit_depth != png::BitDepth::Eight {
            return Err(Error::Corrupt(format!(
                "expected RGBA8 raster, got {:?}/{:?}",
                frame.color_type, frame.bit_depth
            )));
        }
        if frame.width != frame.height || !frame.width.is_power_of_two() {
            return Err(Error::Corrupt(format!(
                "grid must be a square power of two, got {}x{}",
                frame.width, frame.height
            )));
        }
        let records = info
            .uncompressed_latin1_text
            .iter()
            .map(|chunk| (chunk.keyword.clone(), chunk.text.clone()))
            .collect();
        buf.truncate(frame.buffer_size());
        let curve = HilbertCurve::for_grid(frame.width)?;
        Ok((Self { curve, cells: buf }, records))
    }
}

/// Sidecar metadata path for an image: `<image>.meta.json`.
#[must_use]
pub fn sidecar_path(image_path: &Path) -> std::path::PathBuf {
    let mut name = image_path.as_os_str().to_os_string();
    name.push(".meta.json");
    std::path::PathBuf::from(name)
}

/// Write-to-temp plus atomic rename, so an interrupted process leaves prior
/// durable state intact.
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cluster_round_trip() {
        let mut image = GridImage::new(64).unwrap();
        let (x, y) = image.curve().to_xy(CELLS_PER_CLUSTER).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let anchor = ClusterLocation::new(x as u16, y as u16);
        let payload: Vec<u8> = (0..CLUSTER_BYTES).map(|i| (i % 251) as u8).collect();
        image.write_cluster(anchor, &payload).unwrap();
        assert_eq!(image.read_cluster(anchor).unwrap(), payload);
    }

    #[test]
    fn test_short_payload_zero_padded() {
        let mut image = GridImage::new(64).unwrap();
        let (x, y) = image.curve().to_xy(0).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let anchor = ClusterLocation::new(x as u16, y as u16);
        image.write_cluster(anchor, b"hello").unwrap();
        let back = image.read_cluster(anchor).unwrap();
        assert_eq!(&back[..5], b"hello");
        assert!(back[5..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_misaligned_anchor_rejected() {
        let image = GridImage::new(64).unwrap();
        let (x, y) = image.curve().to_xy(1).unwrap();
        #[allow(clippy::cast_possible_truncation)]
        let anchor = ClusterLocation::new(x as u16, y as u16);
        assert!(matches!(
            image.read_cluster(anchor),
            Err(Error::OutOfBounds(_))
        ));
    }

    #[test]
    fn test_byte_order_is_little_endian_natural() {
        // Byte k of the cell at linear index i holds payload byte 4i + k.
        let mut image = GridImage::new(64).unwrap();
        let data = [0xAA, 0xBB, 0xCC, 0xDD, 0x11, 0x22];
        image.write_linear(0, &data).unwrap();
        let (x0, y0) = image.curve().to_xy(0).unwrap();
        let off0 = image.cell_offset(x0, y0);
        assert_eq!(&image.cells[off0..off0 + 4], &[0xAA, 0xBB, 0xCC, 0xDD]);
        let (x1, y1) = image.curve().to_xy(1).unwrap();
        let off1 = image.cell_offset(x1, y1);
        assert_eq!(&image.cells[off1..off1 + 4], &[0x11, 0x22, 0x00, 0x00]);
    }

    #[test]
    fn test_linear_range_bounds() {
        let image = GridImage::new(64).unwrap();
        let cells = image.curve().cell_count();
        assert!(image.read_linear(cells - 1, CELL_BYTES).is_ok());
        assert!(image.read_linear(cells - 1, CELL_BYTES * 2).is_err());
    }

    #[test]
    fn test_png_save_open_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("map.rts.png");
        let mut image = GridImage::new(64).unwrap();
        image.write_linear(0, b"superblock-ish bytes").unwrap();
        let records = vec![
            ("type".to_string(), "infinite-map-v2".to_string()),
            ("grid_size".to_string(), "64".to_string()),
        ];
        image.save(&path, &records).unwrap();

        let (reopened, back_records) = GridImage::open(&path).unwrap();
        assert_eq!(reopened.grid_size(), 64);
        assert_eq!(reopened.cells(), image.cells());
        assert!(back_records
            .iter()
            .any(|(k, v)| k == "type" && v == "infinite-map-v2"));
        assert!(sidecar_path(&path).exists());
    }
}
