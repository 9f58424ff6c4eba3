//! Tile geometry: reflect padding, tile extraction, compositing and crop.
//!
//! Everything here is a pure function over [`ImageBuffer`] / [`RgbCanvas`].
//! Two paddings are kept apart on purpose:
//!
//! - the *aligned* image (right/bottom reflect padding up to a multiple of
//!   `tile_size`) fixes the canvas size and the final crop target;
//! - the *haloed* image (aligned + `halo` on every side) only supplies
//!   context pixels around each tile and never affects output dimensions.

use serde::{Deserialize, Serialize};

use crate::error::{Result, UpscaleError};
use crate::types::{sample_to_u8, ImageBuffer, RgbCanvas, CHANNELS};

pub const DEFAULT_SCALE: u32 = 4;
pub const DEFAULT_TILE_SIZE: u32 = 256;
pub const DEFAULT_HALO: u32 = 16;

/// Tiling parameters. Only `scale`, `tile_size` and `halo` are stored; every
/// other size is derived so the relations cannot drift apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TileProfile {
    scale: u32,
    tile_size: u32,
    halo: u32,
}

impl TileProfile {
    /// Reference profile: x4, 256px tiles, 16px halo (288px model input).
    pub const REFERENCE: Self = Self {
        scale: DEFAULT_SCALE,
        tile_size: DEFAULT_TILE_SIZE,
        halo: DEFAULT_HALO,
    };

    pub fn new(scale: u32, tile_size: u32, halo: u32) -> Result<Self> {
        if scale == 0 {
            return Err(UpscaleError::InvalidProfile(
                "scale must be at least 1".to_string(),
            ));
        }
        if tile_size == 0 {
            return Err(UpscaleError::InvalidProfile(
                "tile_size must be at least 1".to_string(),
            ));
        }
        Ok(Self {
            scale,
            tile_size,
            halo,
        })
    }

    pub fn scale(&self) -> u32 {
        self.scale
    }

    pub fn tile_size(&self) -> u32 {
        self.tile_size
    }

    pub fn halo(&self) -> u32 {
        self.halo
    }

    /// Side of the square model input: `tile_size + 2 * halo`.
    pub fn context_size(&self) -> u32 {
        self.tile_size + 2 * self.halo
    }

    pub fn out_halo(&self) -> u32 {
        self.halo * self.scale
    }

    /// Side of the square model output.
    pub fn out_context(&self) -> u32 {
        self.context_size() * self.scale
    }

    pub fn out_tile(&self) -> u32 {
        self.tile_size * self.scale
    }

    /// Number of f32 values in one input tensor.
    pub fn input_len(&self) -> usize {
        let side = self.context_size() as usize;
        side * side * CHANNELS
    }

    /// Number of f32 values in one output tensor.
    pub fn output_len(&self) -> usize {
        let side = self.out_context() as usize;
        side * side * CHANNELS
    }
}

impl Default for TileProfile {
    fn default() -> Self {
        Self::REFERENCE
    }
}

/// Map a possibly out-of-range index back into `[0, size)` by reflection
/// without repeating the edge sample (`-1 → 1`, `size → size - 2`).
///
/// Sizes of 0 or 1 map everything to 0.
pub fn reflect_index(index: i64, size: usize) -> usize {
    if size <= 1 {
        return 0;
    }
    let size = size as i64;
    let mut idx = index;
    while idx < 0 || idx >= size {
        idx = if idx < 0 { -idx } else { 2 * size - idx - 2 };
    }
    idx as usize
}

/// Reflect-pad `image` by the given margins.
pub fn reflect_pad(
    image: &ImageBuffer,
    left: u32,
    top: u32,
    right: u32,
    bottom: u32,
) -> Result<ImageBuffer> {
    let src_w = image.width() as usize;
    let src_h = image.height() as usize;
    if src_w == 0 || src_h == 0 {
        return Err(UpscaleError::InvalidInput(format!(
            "cannot pad an empty {src_w}x{src_h} image"
        )));
    }

    let dst_w = src_w + left as usize + right as usize;
    let dst_h = src_h + top as usize + bottom as usize;
    let src = image.data();
    let mut dst = vec![0.0f32; dst_w * dst_h * CHANNELS];

    let x_map: Vec<usize> = (0..dst_w)
        .map(|x| reflect_index(x as i64 - left as i64, src_w))
        .collect();

    for (y, row) in dst.chunks_exact_mut(dst_w * CHANNELS).enumerate() {
        let sy = reflect_index(y as i64 - top as i64, src_h);
        let src_row = &src[sy * src_w * CHANNELS..(sy + 1) * src_w * CHANNELS];
        for (px, &sx) in row.chunks_exact_mut(CHANNELS).zip(&x_map) {
            px.copy_from_slice(&src_row[sx * CHANNELS..(sx + 1) * CHANNELS]);
        }
    }

    ImageBuffer::new(dst_w as u32, dst_h as u32, dst)
}

/// Right/bottom padding needed to reach the next multiple of `tile`.
pub fn pad_amount(dim: u32, tile: u32) -> u32 {
    (tile - (dim % tile)) % tile
}

/// One unit of inference work.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileCoord {
    pub tx: u32,
    pub ty: u32,
    /// Origin in aligned-image pixels.
    pub x: u32,
    pub y: u32,
}

/// Tile grid for one source image under a given profile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    pub profile: TileProfile,
    pub source_width: u32,
    pub source_height: u32,
    pub pad_right: u32,
    pub pad_bottom: u32,
}

impl TilePlan {
    pub fn new(source_width: u32, source_height: u32, profile: TileProfile) -> Result<Self> {
        if source_width == 0 || source_height == 0 {
            return Err(UpscaleError::InvalidInput(format!(
                "image has no pixels ({source_width}x{source_height})"
            )));
        }
        Ok(Self {
            profile,
            source_width,
            source_height,
            pad_right: pad_amount(source_width, profile.tile_size()),
            pad_bottom: pad_amount(source_height, profile.tile_size()),
        })
    }

    pub fn aligned_width(&self) -> u32 {
        self.source_width + self.pad_right
    }

    pub fn aligned_height(&self) -> u32 {
        self.source_height + self.pad_bottom
    }

    pub fn tiles_x(&self) -> u32 {
        self.aligned_width() / self.profile.tile_size()
    }

    pub fn tiles_y(&self) -> u32 {
        self.aligned_height() / self.profile.tile_size()
    }

    pub fn total_tiles(&self) -> u32 {
        self.tiles_x() * self.tiles_y()
    }

    /// Canvas size before the final crop.
    pub fn canvas_size(&self) -> (u32, u32) {
        let scale = self.profile.scale();
        (self.aligned_width() * scale, self.aligned_height() * scale)
    }

    /// Final output size.
    pub fn output_size(&self) -> (u32, u32) {
        let scale = self.profile.scale();
        (self.source_width * scale, self.source_height * scale)
    }

    /// Tiles in row-major `(ty, tx)` order.
    pub fn tiles(&self) -> impl Iterator<Item = TileCoord> + '_ {
        let tile = self.profile.tile_size();
        let tiles_x = self.tiles_x();
        (0..self.tiles_y()).flat_map(move |ty| {
            (0..tiles_x).map(move |tx| TileCoord {
                tx,
                ty,
                x: tx * tile,
                y: ty * tile,
            })
        })
    }
}

/// Haloed context source plus the plan it was built for.
#[derive(Debug, Clone)]
pub struct TiledSource {
    pub plan: TilePlan,
    pub haloed: ImageBuffer,
}

/// Pad a decoded image for tiling: align to the tile grid, then add the halo.
pub fn prepare_tiles(image: &ImageBuffer, profile: TileProfile) -> Result<TiledSource> {
    let plan = TilePlan::new(image.width(), image.height(), profile)?;
    let aligned = reflect_pad(image, 0, 0, plan.pad_right, plan.pad_bottom)?;
    let halo = profile.halo();
    let haloed = reflect_pad(&aligned, halo, halo, halo, halo)?;
    Ok(TiledSource { plan, haloed })
}

/// Copy the `context × context` window at `(x, y)` of the haloed image into
/// `out` (interleaved, row-major).
///
/// `(x, y)` is given in aligned-image coordinates; the halo offset is already
/// part of the haloed buffer's frame, so the window starts at the same numbers.
pub fn extract_tile(
    haloed: &ImageBuffer,
    x: u32,
    y: u32,
    context: u32,
    out: &mut [f32],
) -> Result<()> {
    let ctx = context as usize;
    let row_len = ctx * CHANNELS;
    if out.len() != ctx * row_len {
        return Err(UpscaleError::ShapeMismatch {
            expected: ctx * row_len,
            actual: out.len(),
        });
    }
    if x + context > haloed.width() || y + context > haloed.height() {
        return Err(UpscaleError::InvalidInput(format!(
            "tile window {context}px at ({x}, {y}) exceeds {}x{} source",
            haloed.width(),
            haloed.height()
        )));
    }

    let src_w = haloed.width() as usize;
    let src = haloed.data();
    for (row, dst) in out.chunks_exact_mut(row_len).enumerate() {
        let start = ((y as usize + row) * src_w + x as usize) * CHANNELS;
        dst.copy_from_slice(&src[start..start + row_len]);
    }
    Ok(())
}

/// Paste the centre `out_tile` square of a model output onto the canvas at
/// `(x * scale, y * scale)`, discarding `out_halo` pixels on every side.
pub fn composite_tile(
    canvas: &mut RgbCanvas,
    tile_output: &[f32],
    profile: &TileProfile,
    x: u32,
    y: u32,
) -> Result<()> {
    if tile_output.len() != profile.output_len() {
        return Err(UpscaleError::ShapeMismatch {
            expected: profile.output_len(),
            actual: tile_output.len(),
        });
    }

    let out_context = profile.out_context() as usize;
    let out_halo = profile.out_halo() as usize;
    let out_tile = profile.out_tile() as usize;
    let out_x = (x * profile.scale()) as usize;
    let out_y = (y * profile.scale()) as usize;
    let canvas_w = canvas.width() as usize;

    if out_x + out_tile > canvas_w || out_y + out_tile > canvas.height() as usize {
        return Err(UpscaleError::InvalidInput(format!(
            "tile at ({x}, {y}) falls outside the {}x{} canvas",
            canvas.width(),
            canvas.height()
        )));
    }

    let dst = canvas.data_mut();
    for row in 0..out_tile {
        let src_start = ((row + out_halo) * out_context + out_halo) * CHANNELS;
        let dst_start = ((out_y + row) * canvas_w + out_x) * CHANNELS;
        let src_row = &tile_output[src_start..src_start + out_tile * CHANNELS];
        let dst_row = &mut dst[dst_start..dst_start + out_tile * CHANNELS];
        for (d, &s) in dst_row.iter_mut().zip(src_row) {
            *d = sample_to_u8(s);
        }
    }
    Ok(())
}

/// Top-left `width × height` region of `canvas`. Sizes larger than the
/// canvas are clamped to it.
pub fn crop(canvas: &RgbCanvas, width: u32, height: u32) -> RgbCanvas {
    let width = width.min(canvas.width());
    let height = height.min(canvas.height());
    if width == canvas.width() && height == canvas.height() {
        return canvas.clone();
    }

    let src_w = canvas.width() as usize;
    let row_len = width as usize * CHANNELS;
    let mut data = Vec::with_capacity(row_len * height as usize);
    for row in 0..height as usize {
        let start = row * src_w * CHANNELS;
        data.extend_from_slice(&canvas.data()[start..start + row_len]);
    }
    RgbCanvas::from_raw(width, height, data).unwrap_or_else(|_| RgbCanvas::new(width, height))
}
