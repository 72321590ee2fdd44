//! Tile grid planning and edge-reflection padding.
//!
//! Grid coordinates: source rectangles live in the buffer produced by
//! [`pad_for_grid`], which carries `pad` pixels of reflection on the top and
//! left edges and enough on the bottom and right edges to complete the last
//! grid cell plus `pad`. Destination rectangles live in the scaled output
//! canvas and partition it exactly.

use ndarray::{Array3, ArrayView3};

use crate::types::Rect;

/// Tile overlap in pixels per side.
pub const DEFAULT_TILE_PAD: usize = 16;

/// Model requires spatial dimensions to be multiples of this.
pub const PAD_ALIGN: usize = 4;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Tile {
    pub row: usize,
    pub col: usize,
    /// Region handed to the engine, including the overlap border.
    pub source: Rect,
    /// Region of the output canvas this tile owns.
    pub dest: Rect,
}

/// Whether an image fits in one tile without any grid padding.
pub fn is_single_tile(width: usize, height: usize, tile_size: usize) -> bool {
    width <= tile_size && height <= tile_size
}

/// Number of grid rows and columns needed to cover the image.
pub fn grid_dims(width: usize, height: usize, tile_size: usize) -> (usize, usize) {
    (height.div_ceil(tile_size), width.div_ceil(tile_size))
}

/// Plan the tiles for an image in raster order (rows outer, columns inner).
pub fn plan(width: usize, height: usize, tile_size: usize, pad: usize, scale: usize) -> Vec<Tile> {
    if width == 0 || height == 0 || tile_size == 0 {
        return Vec::new();
    }

    if is_single_tile(width, height, tile_size) {
        return vec![Tile {
            row: 0,
            col: 0,
            source: Rect::new(0, 0, width, height),
            dest: Rect::new(0, 0, width * scale, height * scale),
        }];
    }

    let (rows, cols) = grid_dims(width, height, tile_size);
    let out_w = width * scale;
    let out_h = height * scale;
    let cell = tile_size * scale;
    let side = tile_size + 2 * pad;

    let mut tiles = Vec::with_capacity(rows * cols);
    for row in 0..rows {
        for col in 0..cols {
            let dest_x = col * cell;
            let dest_y = row * cell;
            tiles.push(Tile {
                row,
                col,
                source: Rect::new(col * tile_size, row * tile_size, side, side),
                dest: Rect::new(
                    dest_x,
                    dest_y,
                    cell.min(out_w - dest_x),
                    cell.min(out_h - dest_y),
                ),
            });
        }
    }
    tiles
}

/// Map a possibly out-of-range coordinate into `0..len` by "reflect 101"
/// mirroring (edge sample not repeated). Periodic, so any offset is valid.
pub fn reflect_index(index: isize, len: usize) -> usize {
    if len <= 1 {
        return 0;
    }
    let period = 2 * (len as isize - 1);
    let m = index.rem_euclid(period);
    if m < len as isize {
        m as usize
    } else {
        (period - m) as usize
    }
}

/// Reflection-pad an `(H, W, C)` image by the given amount on each side.
pub fn pad_reflect(
    image: ArrayView3<'_, u8>,
    top: usize,
    bottom: usize,
    left: usize,
    right: usize,
) -> Array3<u8> {
    let (h, w, c) = image.dim();
    if top == 0 && bottom == 0 && left == 0 && right == 0 {
        return image.to_owned();
    }

    let rows: Vec<usize> = (0..top + h + bottom)
        .map(|y| reflect_index(y as isize - top as isize, h))
        .collect();
    let cols: Vec<usize> = (0..left + w + right)
        .map(|x| reflect_index(x as isize - left as isize, w))
        .collect();

    Array3::from_shape_fn((rows.len(), cols.len(), c), |(y, x, ch)| {
        image[[rows[y], cols[x], ch]]
    })
}

/// Pad an image so every tile's source rectangle from [`plan`] is in bounds.
pub fn pad_for_grid(image: ArrayView3<'_, u8>, tile_size: usize, pad: usize) -> Array3<u8> {
    let (h, w, _) = image.dim();
    let (rows, cols) = grid_dims(w, h, tile_size);
    let bottom = rows * tile_size - h + pad;
    let right = cols * tile_size - w + pad;
    pad_reflect(image, pad, bottom, pad, right)
}

/// Extra rows/columns needed to bring `dim` up to a multiple of [`PAD_ALIGN`].
pub fn align_pad(dim: usize) -> usize {
    (PAD_ALIGN - (dim % PAD_ALIGN)) % PAD_ALIGN
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_tile_when_image_fits() {
        let tiles = plan(300, 200, 512, 16, 4);
        assert_eq!(tiles.len(), 1);
        assert_eq!(tiles[0].source, Rect::new(0, 0, 300, 200));
        assert_eq!(tiles[0].dest, Rect::new(0, 0, 1200, 800));
    }

    #[test]
    fn test_grid_is_raster_order() {
        let tiles = plan(1000, 800, 512, 16, 4);
        let order: Vec<(usize, usize)> = tiles.iter().map(|t| (t.row, t.col)).collect();
        assert_eq!(order, vec![(0, 0), (0, 1), (1, 0), (1, 1)]);
        assert_eq!(tiles[1].source, Rect::new(512, 0, 544, 544));
        assert_eq!(tiles[3].dest, Rect::new(2048, 2048, 1952, 1152));
    }

    #[test]
    fn test_grid_tile_at_exact_multiple() {
        let tiles = plan(1024, 300, 512, 8, 2);
        assert_eq!(tiles.len(), 2);
        assert_eq!(tiles[1].dest, Rect::new(1024, 0, 1024, 600));
    }

    #[test]
    fn test_reflect_index_is_reflect_101() {
        // Signal: a b c d  ->  ... c b | a b c d | c b ...
        let expected_left: Vec<usize> = (-3..0).map(|i| reflect_index(i, 4)).collect();
        assert_eq!(expected_left, vec![3, 2, 1]);
        assert_eq!(reflect_index(4, 4), 2);
        assert_eq!(reflect_index(5, 4), 1);
        assert_eq!(reflect_index(6, 4), 0);
        assert_eq!(reflect_index(7, 4), 1);
        assert_eq!(reflect_index(100, 1), 0);
        assert_eq!(reflect_index(-9, 2), 1);
    }

    #[test]
    fn test_pad_reflect_shape_and_values() {
        let image = Array3::from_shape_fn((2, 3, 1), |(y, x, _)| (y * 3 + x) as u8);
        let padded = pad_reflect(image.view(), 1, 2, 2, 1);
        assert_eq!(padded.dim(), (5, 6, 1));
        // Interior copied verbatim.
        assert_eq!(padded[[1, 2, 0]], 0);
        assert_eq!(padded[[2, 4, 0]], 5);
        // Top row mirrors row 1, left cols mirror cols 2 and 1.
        assert_eq!(padded[[0, 2, 0]], 3);
        assert_eq!(padded[[1, 0, 0]], 2);
        assert_eq!(padded[[1, 1, 0]], 1);
    }

    #[test]
    fn test_pad_reflect_one_pixel_image() {
        let image = Array3::from_elem((1, 1, 3), 7u8);
        let padded = pad_reflect(image.view(), 10, 10, 10, 10);
        assert_eq!(padded.dim(), (21, 21, 3));
        assert!(padded.iter().all(|&v| v == 7));
    }

    #[test]
    fn test_pad_for_grid_covers_all_sources() {
        let image = Array3::<u8>::zeros((800, 1000, 3));
        let padded = pad_for_grid(image.view(), 512, 16);
        let (ph, pw, _) = padded.dim();
        assert_eq!((ph, pw), (1024 + 32, 1024 + 32));
        for tile in plan(1000, 800, 512, 16, 4) {
            assert!(tile.source.right() <= pw);
            assert!(tile.source.bottom() <= ph);
        }
    }

    #[test]
    fn test_align_pad() {
        assert_eq!(align_pad(8), 0);
        assert_eq!(align_pad(9), 3);
        assert_eq!(align_pad(11), 1);
    }
}
