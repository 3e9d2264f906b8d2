use cutout_core::{CoreError, Mask, RasterBuffer};
use image::codecs::png::PngEncoder;
use image::{imageops::FilterType, ExtendedColorType, ImageEncoder, RgbImage, RgbaImage};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageSize {
    pub width: u32,
    pub height: u32,
}

/// Scales so the longer edge equals `budget`; sizes already within budget are
/// returned unchanged. Never yields a zero dimension.
pub fn fit_within_budget(size: ImageSize, budget: u32) -> ImageSize {
    let longest = size.width.max(size.height);
    if longest <= budget || size.width == 0 || size.height == 0 {
        return size;
    }
    let scale = budget as f64 / longest as f64;
    ImageSize {
        width: ((size.width as f64 * scale).round() as u32).clamp(1, budget),
        height: ((size.height as f64 * scale).round() as u32).clamp(1, budget),
    }
}

pub fn decode(bytes: &[u8]) -> Result<RasterBuffer, CoreError> {
    let image = image::load_from_memory(bytes).map_err(|e| CoreError::Decode(e.to_string()))?;
    let rgba = image.to_rgba8();
    let (width, height) = rgba.dimensions();
    RasterBuffer::from_rgba(width, height, rgba.into_raw())
}

/// Returns a downscaled copy bounded by `budget`; the input is left untouched.
pub fn resize_to_budget(raster: &RasterBuffer, budget: u32) -> Result<RasterBuffer, CoreError> {
    let target = fit_within_budget(
        ImageSize {
            width: raster.width(),
            height: raster.height(),
        },
        budget,
    );
    if (target.width, target.height) == raster.dimensions() {
        return Ok(raster.clone());
    }
    tracing::debug!(
        from = ?raster.dimensions(),
        to = ?(target.width, target.height),
        "resizing raster to budget"
    );
    let source = to_rgba_image(raster)?;
    let resized = image::imageops::resize(&source, target.width, target.height, FilterType::Lanczos3);
    RasterBuffer::from_rgba(target.width, target.height, resized.into_raw())
}

pub fn to_rgba_image(raster: &RasterBuffer) -> Result<RgbaImage, CoreError> {
    RgbaImage::from_raw(raster.width(), raster.height(), raster.as_raw().to_vec()).ok_or_else(|| {
        CoreError::CanvasUnavailable(format!(
            "could not allocate {}x{} rgba canvas",
            raster.width(),
            raster.height()
        ))
    })
}

pub fn to_rgb_image(raster: &RasterBuffer) -> RgbImage {
    let raw = raster.as_raw();
    RgbImage::from_fn(raster.width(), raster.height(), |x, y| {
        let i = (y as usize * raster.width() as usize + x as usize) * 4;
        image::Rgb([raw[i], raw[i + 1], raw[i + 2]])
    })
}

/// Bilinear resample into `out`, which is resized to `dst_w * dst_h`.
/// Source coordinates are `x * src_w / dst_w`, so equal sizes copy exactly.
pub fn resample_mask_into(mask: &Mask, dst_w: u32, dst_h: u32, out: &mut Vec<f32>) -> Result<(), CoreError> {
    if dst_w == 0 || dst_h == 0 {
        return Err(CoreError::InvalidDimensions {
            width: dst_w,
            height: dst_h,
        });
    }
    let (src_w, src_h) = mask.dimensions();
    let src = mask.values();
    out.clear();
    out.resize(dst_w as usize * dst_h as usize, 0.0);

    let max_x = (src_w - 1) as usize;
    let max_y = (src_h - 1) as usize;
    let sx_scale = src_w as f32 / dst_w as f32;
    let sy_scale = src_h as f32 / dst_h as f32;
    let stride = src_w as usize;

    for y in 0..dst_h as usize {
        let sy = y as f32 * sy_scale;
        let y0 = (sy.floor() as usize).min(max_y);
        let y1 = (sy.ceil() as usize).min(max_y);
        let fy = sy - sy.floor();
        let row = y * dst_w as usize;
        for x in 0..dst_w as usize {
            let sx = x as f32 * sx_scale;
            let x0 = (sx.floor() as usize).min(max_x);
            let x1 = (sx.ceil() as usize).min(max_x);
            let fx = sx - sx.floor();

            let a = src[y0 * stride + x0];
            let b = src[y0 * stride + x1];
            let c = src[y1 * stride + x0];
            let d = src[y1 * stride + x1];
            out[row + x] = a * (1.0 - fx) * (1.0 - fy) + b * fx * (1.0 - fy) + c * (1.0 - fx) * fy + d * fx * fy;
        }
    }
    Ok(())
}

pub fn resample_mask(mask: &Mask, dst_w: u32, dst_h: u32) -> Result<Mask, CoreError> {
    let mut out = Vec::new();
    resample_mask_into(mask, dst_w, dst_h, &mut out)?;
    Mask::from_values(dst_w, dst_h, out)
}

pub fn alpha_byte(value: f32) -> u8 {
    (value * 255.0).round().clamp(0.0, 255.0) as u8
}

/// Copies RGB from `raster` and writes `alpha` into the fourth channel.
pub fn apply_alpha(raster: &RasterBuffer, alpha: &[f32]) -> Result<RasterBuffer, CoreError> {
    if alpha.len() != raster.pixel_count() {
        return Err(CoreError::InvalidDimensions {
            width: raster.width(),
            height: raster.height(),
        });
    }
    let mut out = raster.clone();
    for (px, value) in out.as_raw_mut().chunks_exact_mut(4).zip(alpha) {
        px[3] = alpha_byte(*value);
    }
    Ok(out)
}

pub fn encode_png(raster: &RasterBuffer) -> Result<Vec<u8>, CoreError> {
    let mut encoded = Vec::new();
    PngEncoder::new(&mut encoded)
        .write_image(raster.as_raw(), raster.width(), raster.height(), ExtendedColorType::Rgba8)
        .map_err(|e| CoreError::Encode(e.to_string()))?;
    if encoded.is_empty() {
        return Err(CoreError::Encode("png encoder produced no output".to_string()));
    }
    Ok(encoded)
}

pub fn encode_mask_png(mask: &Mask) -> Result<Vec<u8>, CoreError> {
    let luma: Vec<u8> = mask.values().iter().map(|v| alpha_byte(*v)).collect();
    let mut encoded = Vec::new();
    PngEncoder::new(&mut encoded)
        .write_image(&luma, mask.width(), mask.height(), ExtendedColorType::L8)
        .map_err(|e| CoreError::Encode(e.to_string()))?;
    Ok(encoded)
}

/// Applies the refined mask and encodes the cutout as PNG.
pub fn composite(raster: &RasterBuffer, mask: &Mask) -> Result<(RasterBuffer, Vec<u8>), CoreError> {
    if mask.dimensions() != raster.dimensions() {
        return Err(CoreError::InvalidDimensions {
            width: mask.width(),
            height: mask.height(),
        });
    }
    let cutout = apply_alpha(raster, mask.values())?;
    let encoded = encode_png(&cutout)?;
    Ok((cutout, encoded))
}
