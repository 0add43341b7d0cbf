//! AMD64 relocation application. Every relocation adds its computed value to the bytes already
//! in the buffer, so addends encoded by the compiler are preserved.

use crate::error::Result;
use anyhow::bail;
use object::pe;

pub(crate) struct RelocationContext {
    /// RVA of the relocated location.
    pub(crate) p: u64,

    /// RVA of the referenced symbol.
    pub(crate) s: u64,

    /// 1-based index of the output section holding the relocated chunk.
    pub(crate) section_index: u16,

    /// RVA of that output section.
    pub(crate) section_rva: u64,

    pub(crate) image_base: u64,
}

pub(crate) fn apply_relocation(
    buffer: &mut [u8],
    offset: u64,
    r_type: u16,
    ctx: &RelocationContext,
) -> Result<()> {
    let s = ctx.s;
    let p = ctx.p;
    match r_type {
        pe::IMAGE_REL_AMD64_ADDR32 => add32(buffer, offset, ctx.image_base.wrapping_add(s) as u32),
        pe::IMAGE_REL_AMD64_ADDR64 => add64(buffer, offset, ctx.image_base.wrapping_add(s)),
        pe::IMAGE_REL_AMD64_ADDR32NB => add32(buffer, offset, s as u32),
        pe::IMAGE_REL_AMD64_REL32 => add32(buffer, offset, rel32(s, p, 4)),
        pe::IMAGE_REL_AMD64_REL32_1 => add32(buffer, offset, rel32(s, p, 5)),
        pe::IMAGE_REL_AMD64_REL32_2 => add32(buffer, offset, rel32(s, p, 6)),
        pe::IMAGE_REL_AMD64_REL32_3 => add32(buffer, offset, rel32(s, p, 7)),
        pe::IMAGE_REL_AMD64_REL32_4 => add32(buffer, offset, rel32(s, p, 8)),
        pe::IMAGE_REL_AMD64_REL32_5 => add32(buffer, offset, rel32(s, p, 9)),
        pe::IMAGE_REL_AMD64_SECTION => add16(buffer, offset, ctx.section_index),
        pe::IMAGE_REL_AMD64_SECREL => add32(buffer, offset, s.wrapping_sub(ctx.section_rva) as u32),
        _ => bail!("Unsupported relocation type 0x{r_type:x}"),
    }
}

fn rel32(s: u64, p: u64, skip: u64) -> u32 {
    s.wrapping_sub(p).wrapping_sub(skip) as u32
}

fn add16(buffer: &mut [u8], offset: u64, value: u16) -> Result<()> {
    let bytes = checked_range::<2>(buffer, offset)?;
    let current = u16::from_le_bytes(*bytes);
    *bytes = current.wrapping_add(value).to_le_bytes();
    Ok(())
}

fn add32(buffer: &mut [u8], offset: u64, value: u32) -> Result<()> {
    let bytes = checked_range::<4>(buffer, offset)?;
    let current = u32::from_le_bytes(*bytes);
    *bytes = current.wrapping_add(value).to_le_bytes();
    Ok(())
}

pub(crate) fn add64(buffer: &mut [u8], offset: u64, value: u64) -> Result<()> {
    let bytes = checked_range::<8>(buffer, offset)?;
    let current = u64::from_le_bytes(*bytes);
    *bytes = current.wrapping_add(value).to_le_bytes();
    Ok(())
}

/// Stores a 32-bit value without regard to previous contents. Used by the synthetic import
/// chunks, whose slots start out zeroed.
pub(crate) fn write32(buffer: &mut [u8], offset: u64, value: u32) -> Result<()> {
    let bytes = checked_range::<4>(buffer, offset)?;
    *bytes = value.to_le_bytes();
    Ok(())
}

fn checked_range<const N: usize>(buffer: &mut [u8], offset: u64) -> Result<&mut [u8; N]> {
    let offset = usize::try_from(offset).map_err(|_| anyhow::anyhow!("Relocation offset overflow"))?;
    let end = offset
        .checked_add(N)
        .ok_or_else(|| anyhow::anyhow!("Relocation offset overflow"))?;
    let bytes: &mut [u8] = buffer
        .get_mut(offset..end)
        .ok_or_else(|| anyhow::anyhow!("Relocation out of bounds at offset 0x{offset:x}"))?;
    Ok(bytes.try_into().expect("length checked above"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> RelocationContext {
        RelocationContext {
            p: 0x1011,
            s: 0x1040,
            section_index: 1,
            section_rva: 0x1000,
            image_base: 0x1_4000_0000,
        }
    }

    #[test]
    fn rel32_arithmetic() {
        let mut buffer = vec![0u8; 8];
        apply_relocation(&mut buffer, 0, pe::IMAGE_REL_AMD64_REL32, &ctx()).unwrap();
        // 0x1040 - 0x1011 - 4 == 0x2b.
        assert_eq!(u32::from_le_bytes(buffer[..4].try_into().unwrap()), 0x2b);
    }

    #[test]
    fn relocations_add_to_existing_bytes() {
        let mut buffer = 7u32.to_le_bytes().to_vec();
        apply_relocation(&mut buffer, 0, pe::IMAGE_REL_AMD64_ADDR32NB, &ctx()).unwrap();
        assert_eq!(u32::from_le_bytes(buffer[..4].try_into().unwrap()), 0x1040 + 7);
        // Applying twice keeps adding; relocation application is not idempotent.
        apply_relocation(&mut buffer, 0, pe::IMAGE_REL_AMD64_ADDR32NB, &ctx()).unwrap();
        assert_eq!(
            u32::from_le_bytes(buffer[..4].try_into().unwrap()),
            2 * 0x1040 + 7
        );
    }

    #[test]
    fn addr64_includes_image_base() {
        let mut buffer = vec![0u8; 8];
        apply_relocation(&mut buffer, 0, pe::IMAGE_REL_AMD64_ADDR64, &ctx()).unwrap();
        assert_eq!(
            u64::from_le_bytes(buffer.as_slice().try_into().unwrap()),
            0x1_4000_1040
        );
    }

    #[test]
    fn secrel_is_relative_to_section() {
        let mut buffer = vec![0u8; 4];
        apply_relocation(&mut buffer, 0, pe::IMAGE_REL_AMD64_SECREL, &ctx()).unwrap();
        assert_eq!(u32::from_le_bytes(buffer[..4].try_into().unwrap()), 0x40);
    }

    #[test]
    fn unsupported_type_is_fatal() {
        let mut buffer = vec![0u8; 4];
        assert!(apply_relocation(&mut buffer, 0, 0xff, &ctx()).is_err());
    }

    #[test]
    fn application_order_is_immaterial() {
        // Two relocations at disjoint offsets produce the same image in either order.
        let mut a = vec![0u8; 12];
        let mut b = vec![0u8; 12];
        apply_relocation(&mut a, 0, pe::IMAGE_REL_AMD64_REL32, &ctx()).unwrap();
        apply_relocation(&mut a, 8, pe::IMAGE_REL_AMD64_ADDR32NB, &ctx()).unwrap();
        apply_relocation(&mut b, 8, pe::IMAGE_REL_AMD64_ADDR32NB, &ctx()).unwrap();
        apply_relocation(&mut b, 0, pe::IMAGE_REL_AMD64_REL32, &ctx()).unwrap();
        assert_eq!(a, b);
    }
}
