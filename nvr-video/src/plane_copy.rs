//! Stride-aware plane copies between frame buffers and mapped staging memory

/// Copy `rows` rows of a plane from `src` to `dst`.
///
/// Each row copies `min(row_bytes, src_stride, dst_stride)` bytes. Copying
/// stops early at the first row that would read or write out of bounds.
/// Returns the number of rows copied.
pub fn copy_plane(
    src: &[u8],
    src_stride: usize,
    dst: &mut [u8],
    dst_stride: usize,
    row_bytes: usize,
    rows: usize,
) -> usize {
    let row_len = row_bytes.min(src_stride).min(dst_stride);
    if row_len == 0 || rows == 0 {
        return 0;
    }

    // Identical tight layouts collapse into a single copy
    if src_stride == dst_stride && src_stride == row_len {
        let len = (row_len * rows).min(src.len()).min(dst.len());
        let whole_rows = len / row_len;
        let len = whole_rows * row_len;
        dst[..len].copy_from_slice(&src[..len]);
        return whole_rows;
    }

    let mut copied = 0;
    for row in 0..rows {
        let s = row * src_stride;
        let d = row * dst_stride;
        let (Some(src_row), Some(dst_row)) = (src.get(s..s + row_len), dst.get_mut(d..d + row_len))
        else {
            break;
        };
        dst_row.copy_from_slice(src_row);
        copied += 1;
    }
    copied
}
