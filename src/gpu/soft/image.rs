//! CPU pixel storage and raster operations.

use super::super::{fallback_color, ColorControls, TextureDesc, Viewport};

/// Pack normalized RGBA into a BGRA8 pixel (little-endian `u32`).
pub fn pack_color(c: [f32; 4]) -> u32 {
    let q = |v: f32| (v.clamp(0.0, 1.0) * 255.0).round() as u32;
    (q(c[3]) << 24) | (q(c[0]) << 16) | (q(c[1]) << 8) | q(c[2])
}

/// Unpack a BGRA8 pixel into normalized RGBA.
pub fn unpack_color(p: u32) -> [f32; 4] {
    let f = |shift: u32| ((p >> shift) & 0xFF) as f32 / 255.0;
    [f(16), f(8), f(0), f(24)]
}

/// A texture's contents.
#[derive(Debug, Clone)]
pub struct SoftImage {
    pub desc: TextureDesc,
    pub pixels: Vec<u32>,
}

impl SoftImage {
    pub fn new(desc: TextureDesc) -> Self {
        Self {
            desc,
            pixels: vec![0; desc.width as usize * desc.height as usize],
        }
    }

    pub fn pixel(&self, x: u32, y: u32) -> u32 {
        self.pixels[(y * self.desc.width + x) as usize]
    }

    pub fn fill(&mut self, color: [f32; 4]) {
        let p = pack_color(color);
        self.pixels.iter_mut().for_each(|px| *px = p);
    }

    /// Load tightly packed 4-byte pixels. Short input leaves the tail untouched.
    pub fn upload(&mut self, bytes: &[u8]) {
        for (dst, chunk) in self.pixels.iter_mut().zip(bytes.chunks_exact(4)) {
            *dst = u32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]);
        }
    }

    /// Whole-resource copy. Sizes must match, as with `CopyResource`.
    pub fn copy_from(&mut self, src: &SoftImage) {
        if self.pixels.len() == src.pixels.len() {
            self.pixels.copy_from_slice(&src.pixels);
        }
    }

    /// Pixels whose centers fall inside `viewport`, clipped to the image.
    fn covered(&self, viewport: Viewport) -> (std::ops::Range<u32>, std::ops::Range<u32>) {
        let span = |start: f32, len: f32, limit: u32| {
            let first = (start - 0.5).ceil().max(0.0) as u32;
            let end = ((start + len - 0.5).ceil().max(0.0) as u32).min(limit);
            first..end.max(first)
        };
        (
            span(viewport.x, viewport.width, self.desc.width),
            span(viewport.y, viewport.height, self.desc.height),
        )
    }

    /// Nearest-sample `src` into `viewport`, applying `controls`.
    pub fn draw(&mut self, src: &SoftImage, viewport: Viewport, controls: &ColorControls) {
        if src.desc.width == 0
            || src.desc.height == 0
            || viewport.width <= 0.0
            || viewport.height <= 0.0
        {
            return;
        }
        let (xs, ys) = self.covered(viewport);
        let identity = controls.is_identity();

        for y in ys {
            let v = (y as f32 + 0.5 - viewport.y) / viewport.height;
            let sy = ((v * src.desc.height as f32) as u32).min(src.desc.height - 1);
            for x in xs.clone() {
                let u = (x as f32 + 0.5 - viewport.x) / viewport.width;
                let sx = ((u * src.desc.width as f32) as u32).min(src.desc.width - 1);
                let sample = src.pixel(sx, sy);
                let out = if identity {
                    sample
                } else {
                    let c = unpack_color(sample);
                    let rgb = controls.apply([c[0], c[1], c[2]]);
                    pack_color([rgb[0], rgb[1], rgb[2], c[3]])
                };
                self.pixels[(y * self.desc.width + x) as usize] = out;
            }
        }
    }

    pub fn draw_fallback(&mut self, viewport: Viewport, time: f32) {
        if viewport.width <= 0.0 || viewport.height <= 0.0 {
            return;
        }
        let (xs, ys) = self.covered(viewport);
        for y in ys {
            let v = (y as f32 + 0.5 - viewport.y) / viewport.height;
            for x in xs.clone() {
                let u = (x as f32 + 0.5 - viewport.x) / viewport.width;
                self.pixels[(y * self.desc.width + x) as usize] =
                    pack_color(fallback_color(u, v, time));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pack_matches_bgra_bytes() {
        let p = pack_color([1.0, 0.0, 0.0, 1.0]);
        assert_eq!(p.to_le_bytes(), [0, 0, 255, 255]);
        assert_eq!(unpack_color(p), [1.0, 0.0, 0.0, 1.0]);
    }

    #[test]
    fn test_draw_covers_exact_viewport() {
        let mut target = SoftImage::new(TextureDesc::bgra(8, 8));
        let mut src = SoftImage::new(TextureDesc::bgra(2, 2));
        src.fill([0.0, 1.0, 0.0, 1.0]);

        let viewport = Viewport::new(2.0, 4.0, 4.0, 2.0);
        target.draw(&src, viewport, &ColorControls::IDENTITY);

        let green = pack_color([0.0, 1.0, 0.0, 1.0]);
        for y in 0..8 {
            for x in 0..8 {
                let inside = (2..6).contains(&x) && (4..6).contains(&y);
                assert_eq!(target.pixel(x, y) == green, inside, "pixel {},{}", x, y);
            }
        }
    }

    #[test]
    fn test_draw_scales_source() {
        let mut target = SoftImage::new(TextureDesc::bgra(4, 4));
        let mut src = SoftImage::new(TextureDesc::bgra(2, 1));
        src.pixels[0] = pack_color([1.0, 0.0, 0.0, 1.0]);
        src.pixels[1] = pack_color([0.0, 0.0, 1.0, 1.0]);

        target.draw(&src, Viewport::full(4, 4), &ColorControls::IDENTITY);
        assert_eq!(target.pixel(0, 3), src.pixels[0]);
        assert_eq!(target.pixel(1, 0), src.pixels[0]);
        assert_eq!(target.pixel(2, 0), src.pixels[1]);
        assert_eq!(target.pixel(3, 3), src.pixels[1]);
    }

    #[test]
    fn test_viewport_is_clipped() {
        let mut target = SoftImage::new(TextureDesc::bgra(4, 4));
        let mut src = SoftImage::new(TextureDesc::bgra(1, 1));
        src.fill([1.0, 1.0, 1.0, 1.0]);
        let overhang = Viewport::new(2.0, 2.0, 10.0, 10.0);
        target.draw(&src, overhang, &ColorControls::IDENTITY);
        assert_eq!(target.pixel(3, 3), src.pixels[0]);
        assert_eq!(target.pixel(1, 1), 0);
    }

    #[test]
    fn test_upload_reads_bgra() {
        let mut img = SoftImage::new(TextureDesc::bgra(2, 1));
        img.upload(&[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(img.pixels, vec![0x0403_0201, 0x0807_0605]);
    }
}
