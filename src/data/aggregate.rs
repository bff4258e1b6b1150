//! In-place repeat aggregation over a processed frame.
//!
//! A frame is `n_blines` B-lines of `bline_len` A-lines, each A-line holding
//! `roi` complex voxels, row-major. Aggregation compacts the frame into its
//! own prefix; every function returns the new A-line count. Reads at each
//! voxel happen before the write to the compacted position, which is never
//! past the source rows it consumes.

use num_complex::Complex;

/// Average each group of `repeat` consecutive A-lines within every B-line.
pub fn aline_mean(
    frame: &mut [Complex<f32>],
    roi: usize,
    bline_len: usize,
    n_blines: usize,
    repeat: usize,
) -> usize {
    debug_assert!(repeat > 1 && bline_len % repeat == 0);
    let out_per_bline = bline_len / repeat;
    let scale = 1.0 / repeat as f32;
    let mut dst_row = 0usize;
    for b in 0..n_blines {
        for g in 0..out_per_bline {
            let src_row = b * bline_len + g * repeat;
            for v in 0..roi {
                let mut acc = Complex::new(0.0f32, 0.0);
                for rep in 0..repeat {
                    acc += frame[(src_row + rep) * roi + v];
                }
                frame[dst_row * roi + v] = acc * scale;
            }
            dst_row += 1;
        }
    }
    dst_row
}

/// Fold each B-line of two back-to-back repeats into their component-wise
/// absolute difference, halving the B-line.
pub fn bline_diff(
    frame: &mut [Complex<f32>],
    roi: usize,
    bline_len: usize,
    n_blines: usize,
) -> usize {
    debug_assert!(bline_len % 2 == 0);
    let half = bline_len / 2;
    let mut dst_row = 0usize;
    for b in 0..n_blines {
        let src_base = b * bline_len;
        for x in 0..half {
            for v in 0..roi {
                let a = frame[(src_base + x) * roi + v];
                let c = frame[(src_base + x + half) * roi + v];
                frame[dst_row * roi + v] = Complex::new((a.re - c.re).abs(), (a.im - c.im).abs());
            }
            dst_row += 1;
        }
    }
    dst_row
}

/// Average corresponding positions across the `repeat` back-to-back copies
/// inside each B-line.
pub fn bline_mean(
    frame: &mut [Complex<f32>],
    roi: usize,
    bline_len: usize,
    n_blines: usize,
    repeat: usize,
) -> usize {
    debug_assert!(repeat > 1 && bline_len % repeat == 0);
    let seg = bline_len / repeat;
    let scale = 1.0 / repeat as f32;
    let mut dst_row = 0usize;
    for b in 0..n_blines {
        let src_base = b * bline_len;
        for x in 0..seg {
            for v in 0..roi {
                let mut acc = Complex::new(0.0f32, 0.0);
                for rep in 0..repeat {
                    acc += frame[(src_base + rep * seg + x) * roi + v];
                }
                frame[dst_row * roi + v] = acc * scale;
            }
            dst_row += 1;
        }
    }
    dst_row
}

#[cfg(test)]
mod tests {
    use super::*;

    fn voxel(re: f32, im: f32) -> Complex<f32> {
        Complex::new(re, im)
    }

    /// Frame whose A-line `i` is filled with the voxel value `f(i)`.
    fn frame_of(rows: usize, roi: usize, f: impl Fn(usize) -> Complex<f32>) -> Vec<Complex<f32>> {
        (0..rows)
            .flat_map(|i| std::iter::repeat(f(i)).take(roi))
            .collect()
    }

    #[test]
    fn test_aline_mean_of_identical_repeats_is_identity() {
        // Two copies of each pattern value; averaging returns one copy.
        let roi = 3;
        let pattern = [2.0f32, 5.0, 8.0, 11.0];
        let mut frame = frame_of(8, roi, |i| voxel(pattern[i / 2], -pattern[i / 2]));
        let rows = aline_mean(&mut frame, roi, 8, 1, 2);
        assert_eq!(rows, 4);
        for (i, &p) in pattern.iter().enumerate() {
            for v in 0..roi {
                assert_eq!(frame[i * roi + v], voxel(p, -p));
            }
        }
    }

    #[test]
    fn test_aline_mean_averages_within_groups() {
        let roi = 2;
        let mut frame = frame_of(4, roi, |i| voxel(i as f32, 0.0));
        let rows = aline_mean(&mut frame, roi, 4, 1, 2);
        assert_eq!(rows, 2);
        assert_eq!(frame[0], voxel(0.5, 0.0));
        assert_eq!(frame[roi], voxel(2.5, 0.0));
    }

    #[test]
    fn test_bline_diff_of_identical_halves_is_zero() {
        // B-line of 8 where rows 0..4 equal rows 4..8.
        let roi = 4;
        let mut frame = frame_of(8, roi, |i| voxel((i % 4) as f32, (i % 4) as f32 * 2.0));
        let rows = bline_diff(&mut frame, roi, 8, 1);
        assert_eq!(rows, 4);
        for v in &frame[..rows * roi] {
            assert_eq!(*v, voxel(0.0, 0.0));
        }
    }

    #[test]
    fn test_bline_diff_takes_componentwise_magnitude() {
        let roi = 1;
        let mut frame = vec![voxel(1.0, -3.0), voxel(4.0, 2.0)];
        let rows = bline_diff(&mut frame, roi, 2, 1);
        assert_eq!(rows, 1);
        assert_eq!(frame[0], voxel(3.0, 5.0));
    }

    #[test]
    fn test_bline_mean_across_repeats() {
        // Three repeats of a two-A-line segment.
        let roi = 1;
        let mut frame = vec![
            voxel(1.0, 0.0),
            voxel(2.0, 0.0),
            voxel(3.0, 0.0),
            voxel(4.0, 0.0),
            voxel(5.0, 0.0),
            voxel(6.0, 0.0),
        ];
        let rows = bline_mean(&mut frame, roi, 6, 1, 3);
        assert_eq!(rows, 2);
        assert_eq!(frame[0], voxel(3.0, 0.0));
        assert_eq!(frame[1], voxel(4.0, 0.0));
    }

    #[test]
    fn test_multiple_blines_compact_contiguously() {
        let roi = 1;
        // Two B-lines of 4, values 0..8.
        let mut frame = frame_of(8, roi, |i| voxel(i as f32, 0.0));
        let rows = bline_mean(&mut frame, roi, 4, 2, 2);
        assert_eq!(rows, 4);
        assert_eq!(frame[0], voxel(1.0, 0.0)); // mean(0, 2)
        assert_eq!(frame[1], voxel(2.0, 0.0)); // mean(1, 3)
        assert_eq!(frame[2], voxel(5.0, 0.0)); // mean(4, 6)
        assert_eq!(frame[3], voxel(6.0, 0.0)); // mean(5, 7)
    }
}
