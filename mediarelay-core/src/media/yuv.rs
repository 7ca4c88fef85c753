//! RGBA to planar YUV 4:2:0 (I420) conversion, BT.601 limited range

use crate::error::{Error, Result};

use super::frame::{rgba_len, RgbaImage};

/// Reusable converter for one frame size
pub struct YuvConverter {
    width: usize,
    height: usize,
    buf: Vec<u8>,
}

impl YuvConverter {
    #[must_use]
    pub fn new(width: u32, height: u32) -> Self {
        let width = width as usize;
        let height = height as usize;
        Self {
            width,
            height,
            buf: vec![0; i420_len(width, height)],
        }
    }

    /// Convert `image` into the internal buffer and return it.
    ///
    /// The buffer holds the Y plane followed by the U and V planes; chroma
    /// planes are `ceil(w/2) x ceil(h/2)`.
    pub fn process(&mut self, image: &RgbaImage) -> Result<&[u8]> {
        if image.width as usize != self.width || image.height as usize != self.height {
            return Err(Error::InvalidFrame(format!(
                "expected {}x{}, got {}x{}",
                self.width, self.height, image.width, image.height
            )));
        }
        debug_assert_eq!(image.data.len(), rgba_len(image.width, image.height));

        let (w, h) = (self.width, self.height);
        let (cw, ch) = (w.div_ceil(2), h.div_ceil(2));
        let rgba = &image.data;
        let (y_plane, chroma) = self.buf.split_at_mut(w * h);
        let (u_plane, v_plane) = chroma.split_at_mut(cw * ch);

        for row in 0..h {
            for col in 0..w {
                let px = (row * w + col) * 4;
                let (r, g, b) = (i32::from(rgba[px]), i32::from(rgba[px + 1]), i32::from(rgba[px + 2]));
                y_plane[row * w + col] = clamp(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
            }
        }

        // chroma from the average of each 2x2 block
        for crow in 0..ch {
            for ccol in 0..cw {
                let (mut r, mut g, mut b, mut n) = (0i32, 0i32, 0i32, 0i32);
                for row in (crow * 2)..((crow * 2 + 2).min(h)) {
                    for col in (ccol * 2)..((ccol * 2 + 2).min(w)) {
                        let px = (row * w + col) * 4;
                        r += i32::from(rgba[px]);
                        g += i32::from(rgba[px + 1]);
                        b += i32::from(rgba[px + 2]);
                        n += 1;
                    }
                }
                let (r, g, b) = (r / n, g / n, b / n);
                u_plane[crow * cw + ccol] = clamp(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
                v_plane[crow * cw + ccol] = clamp(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
            }
        }

        Ok(&self.buf)
    }
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

#[must_use]
pub const fn i420_len(width: usize, height: usize) -> usize {
    width * height + 2 * (width.div_ceil(2) * height.div_ceil(2))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn solid(width: u32, height: u32, rgb: [u8; 3]) -> RgbaImage {
        let data: Vec<u8> = (0..width * height)
            .flat_map(|_| [rgb[0], rgb[1], rgb[2], 255])
            .collect();
        RgbaImage::new(width, height, data).unwrap()
    }

    #[test]
    fn test_black_and_white() {
        let mut conv = YuvConverter::new(4, 2);

        let out = conv.process(&solid(4, 2, [0, 0, 0])).unwrap().to_vec();
        assert_eq!(out.len(), 4 * 2 + 2 * 2);
        assert!(out[..8].iter().all(|&y| y == 16));
        assert!(out[8..].iter().all(|&c| c == 128));

        let out = conv.process(&solid(4, 2, [255, 255, 255])).unwrap();
        assert!(out[..8].iter().all(|&y| y == 235));
        assert!(out[8..].iter().all(|&c| c == 128));
    }

    #[test]
    fn test_odd_dimensions_round_up_chroma() {
        let mut conv = YuvConverter::new(3, 3);
        let out = conv.process(&solid(3, 3, [255, 0, 0])).unwrap();
        assert_eq!(out.len(), i420_len(3, 3));
        assert_eq!(out.len(), 9 + 2 * 4);
        // red has V well above neutral
        assert!(out[9 + 4..].iter().all(|&v| v > 200));
    }

    #[test]
    fn test_size_mismatch() {
        let mut conv = YuvConverter::new(4, 4);
        assert!(conv.process(&solid(2, 2, [0, 0, 0])).is_err());
    }
}
