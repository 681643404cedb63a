//! PRP (Physical Region Page) mapping.

use crate::error::{NvmeError, Result};
use crate::wire::Sqe;

fn page_aligned_down(addr: u64, page_size: u64) -> u64 {
    addr & !(page_size - 1)
}

/// Encodes `(iova, len)` into `sqe.prp1`/`sqe.prp2`, building a PRP list in
/// `scratch` when the transfer spans more than two pages.
///
/// `scratch` is `(buffer, iova_of_buffer)` — the request context's dedicated
/// scratch page. It is only touched (and only required) when `len` exceeds
/// two pages.
pub fn build_prp(
    sqe: &mut Sqe,
    iova: u64,
    len: usize,
    page_size: usize,
    scratch: Option<(&mut [u8], u64)>,
) -> Result<()> {
    let page_size64 = page_size as u64;
    // Classify by where the transfer actually ends, not `len` alone — a
    // buffer that starts mid-page crosses into the next page well before
    // `len` reaches a full `page_size`.
    let offset_in_page = iova as usize % page_size;
    let end_offset = offset_in_page + len;

    if end_offset <= page_size {
        sqe.prp1 = iova;
        sqe.prp2 = 0;
        return Ok(());
    }

    let next_page_iova = page_aligned_down(iova, page_size64) + page_size64;

    if end_offset <= 2 * page_size {
        sqe.prp1 = iova;
        sqe.prp2 = next_page_iova;
        return Ok(());
    }

    let (scratch_buf, scratch_iova) =
        scratch.ok_or(NvmeError::InvalidArgument("PRP list requires a scratch page"))?;

    let first_page_bytes = page_size - offset_in_page;
    let remaining = len - first_page_bytes;
    let list_entries = remaining.div_ceil(page_size);
    let list_bytes = list_entries * 8;

    if list_bytes > scratch_buf.len() {
        return Err(NvmeError::InvalidArgument(
            "transfer exceeds PRP list scratch page capacity",
        ));
    }

    for i in 0..list_entries {
        let entry_iova = next_page_iova + (i as u64) * page_size64;
        let offset = i * 8;
        scratch_buf[offset..offset + 8].copy_from_slice(&entry_iova.to_le_bytes());
    }

    sqe.prp1 = iova;
    sqe.prp2 = scratch_iova;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: usize = 4096;

    #[test]
    fn single_page_transfer() {
        let mut sqe = Sqe::new(0);
        build_prp(&mut sqe, 0x1000, PAGE, PAGE, None).unwrap();
        assert_eq!(sqe.prp1, 0x1000);
        assert_eq!(sqe.prp2, 0);
    }

    #[test]
    fn two_page_transfer() {
        let mut sqe = Sqe::new(0);
        build_prp(&mut sqe, 0x1000, PAGE + 1, PAGE, None).unwrap();
        assert_eq!(sqe.prp1, 0x1000);
        assert_eq!(sqe.prp2, 0x2000);
    }

    #[test]
    fn two_page_transfer_unaligned_start() {
        let mut sqe = Sqe::new(0);
        // Buffer starts 16 bytes into a page but still spans exactly two pages.
        build_prp(&mut sqe, 0x1010, PAGE, PAGE, None).unwrap();
        assert_eq!(sqe.prp1, 0x1010);
        assert_eq!(sqe.prp2, 0x2000);
    }

    #[test]
    fn list_transfer_reconstructs_iova_sequence() {
        let mut sqe = Sqe::new(0);
        let mut scratch = [0u8; PAGE];
        let len = 5 * PAGE; // first page + 4 more pages, needs 4 list entries
        build_prp(&mut sqe, 0x4000, len, PAGE, Some((&mut scratch, 0x9000))).unwrap();
        assert_eq!(sqe.prp1, 0x4000);
        assert_eq!(sqe.prp2, 0x9000);
        for i in 0..4u64 {
            let off = (i as usize) * 8;
            let entry = u64::from_le_bytes(scratch[off..off + 8].try_into().unwrap());
            assert_eq!(entry, 0x5000 + i * PAGE as u64);
        }
    }

    #[test]
    fn list_transfer_without_scratch_errs() {
        let mut sqe = Sqe::new(0);
        let err = build_prp(&mut sqe, 0x4000, 5 * PAGE, PAGE, None).unwrap_err();
        assert_eq!(err, NvmeError::InvalidArgument("PRP list requires a scratch page"));
    }
}
