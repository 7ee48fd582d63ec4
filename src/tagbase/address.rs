//! Textual tag address resolution.
//!
//! An address names a region of a tag by walking the type schema:
//! `Dummy`, `Dummy[5]`, `foo[2].bar[3]`, `Dummy.2` (bit 2 of an integer
//! scalar). Resolution yields the canonical `TagHandle`; the server
//! re-validates offset and size against the live tag on every access.

use crate::error::{DaxResult, ErrorCode};
use crate::types::{
    base_type_bits, cdt_index, element_type, is_base_type, is_custom, TypeCode, TypeRegistry,
    DAX_BOOL, DAX_LREAL, DAX_REAL,
};

use super::{TagBase, TagHandle};

/// Bits occupied by one element of `t`.
fn stride_bits(registry: &TypeRegistry, t: TypeCode) -> DaxResult<u64> {
    if element_type(t) == DAX_BOOL {
        Ok(1)
    } else {
        Ok(registry.element_size(t)? as u64 * 8)
    }
}

/// Whether bit selection (`.N`) applies to `t`.
fn bit_addressable(t: TypeCode) -> bool {
    let t = element_type(t);
    is_base_type(t) && !matches!(t, DAX_BOOL | DAX_REAL | DAX_LREAL)
}

/// Split `name[idx]` into the name and the optional index.
fn split_index(seg: &str) -> DaxResult<(&str, Option<u32>)> {
    match seg.find('[') {
        None => Ok((seg, None)),
        Some(open) => {
            if !seg.ends_with(']') || open + 1 >= seg.len() - 1 {
                return Err(ErrorCode::Parse);
            }
            let idx = seg[open + 1..seg.len() - 1]
                .parse::<u32>()
                .map_err(|_| ErrorCode::Parse)?;
            Ok((&seg[..open], Some(idx)))
        }
    }
}

/// The tag name an address starts with.
pub fn leading_name(addr: &str) -> DaxResult<&str> {
    let addr = addr.trim();
    let name = addr
        .split(['.', '['])
        .next()
        .filter(|n| !n.is_empty())
        .ok_or(ErrorCode::Parse)?;
    Ok(name)
}

/// Resolve an address string against the live database.
///
/// `count` of 0 requests the whole remainder of the resolved member.
pub fn parse_address(
    registry: &TypeRegistry,
    tags: &TagBase,
    addr: &str,
    count: u32,
) -> DaxResult<TagHandle> {
    let desc = tags.desc_by_name(leading_name(addr)?)?;
    resolve_address(registry, &desc, addr, count)
}

/// Resolve an address against an already-fetched tag descriptor and a
/// type registry holding every CDT the walk can reach. The client library
/// uses this with its mirrored schema; the server resolves against the
/// live one.
pub fn resolve_address(
    registry: &TypeRegistry,
    desc: &crate::tagbase::TagDesc,
    addr: &str,
    count: u32,
) -> DaxResult<TagHandle> {
    let addr = addr.trim();
    if addr.is_empty() {
        return Err(ErrorCode::Parse);
    }
    let mut parts = addr.split('.');
    let first = parts.next().ok_or(ErrorCode::Parse)?;
    let (name, first_idx) = split_index(first)?;
    if name != desc.name {
        return Err(ErrorCode::Arg);
    }

    let mut cur_type = element_type(desc.type_code);
    let mut remaining = desc.count;
    let mut bitpos: u64 = 0;
    let mut indexed = first_idx.is_some();

    if let Some(i) = first_idx {
        if i >= remaining {
            return Err(ErrorCode::TooBig);
        }
        bitpos += stride_bits(registry, cur_type)? * i as u64;
        remaining -= i;
    }

    for seg in parts {
        if seg.is_empty() {
            return Err(ErrorCode::Parse);
        }
        if seg.chars().all(|c| c.is_ascii_digit()) {
            // bit selection on an integer scalar
            if !bit_addressable(cur_type) {
                return Err(ErrorCode::Arg);
            }
            if remaining > 1 && !indexed {
                return Err(ErrorCode::Arg);
            }
            let n: u32 = seg.parse().map_err(|_| ErrorCode::Parse)?;
            let bits = base_type_bits(cur_type);
            if n >= bits {
                return Err(ErrorCode::TooBig);
            }
            bitpos += n as u64;
            cur_type = DAX_BOOL;
            remaining = bits - n;
            indexed = true;
            continue;
        }

        // member access requires a single CDT element
        if !is_custom(cur_type) {
            return Err(ErrorCode::Arg);
        }
        if remaining > 1 && !indexed {
            return Err(ErrorCode::Arg);
        }
        let cdt = registry
            .get(cdt_index(cur_type).ok_or(ErrorCode::BadType)?)
            .ok_or(ErrorCode::BadType)?;
        let (mname, midx) = split_index(seg)?;
        let member = cdt
            .members
            .iter()
            .find(|m| m.name == mname)
            .ok_or(ErrorCode::NotFound)?;
        bitpos += member.byte as u64 * 8 + member.bit as u64;
        cur_type = member.type_code;
        remaining = member.count;
        indexed = midx.is_some();
        if let Some(i) = midx {
            if i >= remaining {
                return Err(ErrorCode::TooBig);
            }
            bitpos += stride_bits(registry, cur_type)? * i as u64;
            remaining -= i;
        }
    }

    let c = if count == 0 { remaining } else { count };
    if c > remaining {
        return Err(ErrorCode::TooBig);
    }

    let handle = if element_type(cur_type) == DAX_BOOL {
        let byte = (bitpos / 8) as u32;
        let bit = (bitpos % 8) as u8;
        TagHandle {
            index: desc.index,
            type_code: DAX_BOOL,
            byte,
            bit,
            count: c,
            size: (bit as u32 + c + 7) / 8,
        }
    } else {
        let esize = registry.element_size(cur_type)?;
        TagHandle {
            index: desc.index,
            type_code: cur_type,
            byte: (bitpos / 8) as u32,
            bit: 0,
            count: c,
            size: esize * c,
        }
    };
    Ok(handle)
}
