use crate::*;

// ============================================================================
//  SCALARS
// ============================================================================

#[test]
fn test_scalars_roundtrip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.bool(true)?;
    enc.bool(false)?;
    enc.u8(255)?;
    enc.u32(u32::MAX)?;
    enc.u64(u64::MAX)?;
    enc.s64(i64::MIN)?;
    enc.f64(2.5)?;
    enc.unit()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);

    assert!(dec.bool()?);
    assert!(!dec.bool()?);
    assert_eq!(dec.u8()?, 255);
    assert_eq!(dec.u32()?, u32::MAX);
    assert_eq!(dec.u64()?, u64::MAX);
    assert_eq!(dec.s64()?, i64::MIN);
    assert_eq!(dec.f64()?, 2.5);
    dec.unit()?;
    assert_eq!(dec.remaining(), 0);
    Ok(())
}

#[test]
fn test_blobs_are_zero_copy_views() -> Result<()> {
    let mut enc = Encoder::new();
    enc.str("AddValues")?;
    enc.bytes(&[1, 2, 3])?;
    enc.str("")?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    assert_eq!(dec.str()?, "AddValues");
    assert_eq!(dec.bytes()?, &[1, 2, 3]);
    assert_eq!(dec.str()?, "");
    Ok(())
}

#[test]
fn test_wrong_tag_is_reported() -> Result<()> {
    let mut enc = Encoder::new();
    enc.u32(7)?;
    let bytes = enc.into_bytes()?;

    let mut dec = Decoder::new(&bytes);
    match dec.u64() {
        Err(Error::UnexpectedTag { expected: Tag::U64, found: Tag::U32 }) => {}
        other => panic!("expected tag mismatch, got {:?}", other),
    }
    Ok(())
}

#[test]
fn test_invalid_tag_byte() {
    let dec = Decoder::new(&[0xEE]);
    assert_eq!(dec.peek_tag(), Err(Error::InvalidTag(0xEE)));
}

#[test]
fn test_truncated_input() {
    let mut dec = Decoder::new(&[Tag::U64 as u8, 1, 2]);
    assert_eq!(dec.u64(), Err(Error::UnexpectedEnd));
}

// ============================================================================
//  CONTAINERS
// ============================================================================

#[test]
fn test_list_iteration() -> Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.u32(1)?;
    enc.str("two")?;
    enc.list_begin()?;
    enc.u32(3)?;
    enc.list_end()?;
    enc.list_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut items = dec.list()?;

    assert_eq!(items.next()?.ok_or(Error::UnexpectedEnd)?.u32()?, 1);
    assert_eq!(items.next()?.ok_or(Error::UnexpectedEnd)?.str()?, "two");
    let mut nested = items.next()?.ok_or(Error::UnexpectedEnd)?;
    let mut inner = nested.list()?;
    assert_eq!(inner.next()?.ok_or(Error::UnexpectedEnd)?.u32()?, 3);
    assert!(inner.next()?.is_none());
    assert!(items.next()?.is_none());
    Ok(())
}

#[test]
fn test_map_entries_and_skip() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    enc.entry_u64("seq", 42)?;
    enc.variant_begin("future-field")?;
    enc.list_begin()?;
    enc.str("ignored")?;
    enc.list_end()?;
    enc.variant_end()?;
    enc.entry_str("target", "abc")?;
    enc.map_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut map = dec.map()?;
    let mut seq = None;
    let mut target = None;
    while let Some((key, mut val)) = map.next()? {
        match key {
            "seq" => seq = Some(val.u64()?),
            "target" => target = Some(val.str()?),
            _ => val.skip()?,
        }
    }
    assert_eq!(seq, Some(42));
    assert_eq!(target, Some("abc"));
    Ok(())
}

#[test]
fn test_option_and_result() -> Result<()> {
    let mut enc = Encoder::new();
    enc.option_none()?;
    enc.option_some_begin()?;
    enc.u32(9)?;
    enc.option_some_end()?;
    enc.result_err_begin()?;
    enc.str("boom")?;
    enc.result_err_end()?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    assert!(dec.option()?.is_none());
    assert_eq!(dec.option()?.ok_or(Error::UnexpectedEnd)?.u32()?, 9);
    match dec.result()? {
        Err(mut body) => assert_eq!(body.str()?, "boom"),
        Ok(_) => panic!("expected error side"),
    }
    Ok(())
}

// ============================================================================
//  STRUCTURAL VIOLATIONS
// ============================================================================

#[test]
fn test_map_rejects_non_variant() -> Result<()> {
    let mut enc = Encoder::new();
    enc.map_begin()?;
    assert_eq!(enc.u32(1), Err(Error::InvalidMapEntry));
    Ok(())
}

#[test]
fn test_variant_requires_exactly_one_item() -> Result<()> {
    let mut enc = Encoder::new();
    enc.variant_begin("v")?;
    assert_eq!(enc.variant_end(), Err(Error::EmptyAdt(Scope::Variant)));

    let mut enc = Encoder::new();
    enc.variant_begin("v")?;
    enc.u32(1)?;
    assert_eq!(enc.u32(2), Err(Error::TooManyItems(Scope::Variant)));
    Ok(())
}

#[test]
fn test_open_scope_cannot_finalize() -> Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    assert_eq!(enc.into_bytes().err(), Some(Error::ScopeStillOpen));
    Ok(())
}

#[test]
fn test_scope_mismatch_and_underflow() -> Result<()> {
    let mut enc = Encoder::new();
    assert_eq!(enc.list_end(), Err(Error::ScopeUnderflow));
    enc.list_begin()?;
    assert_eq!(
        enc.map_end(),
        Err(Error::ScopeMismatch { expected: Scope::Map, actual: Scope::List })
    );
    Ok(())
}

// ============================================================================
//  RAW SEGMENTS
// ============================================================================

#[test]
fn test_raw_segments_follow_structure() -> Result<()> {
    let mut enc = Encoder::new();
    enc.list_begin()?;
    enc.u32(3)?;
    enc.u32(2)?;
    assert_eq!(enc.raw(b"x"), Err(Error::RawOutsideRoot));
    enc.list_end()?;
    enc.raw(b"abc")?;
    enc.raw(b"de")?;

    let bytes = enc.into_bytes()?;
    let mut dec = Decoder::new(&bytes);
    let mut lens = dec.list()?;
    let first = lens.next()?.ok_or(Error::UnexpectedEnd)?.u32()? as usize;
    let second = lens.next()?.ok_or(Error::UnexpectedEnd)?.u32()? as usize;
    assert_eq!(dec.raw(first)?, b"abc");
    assert_eq!(dec.raw(second)?, b"de");
    assert_eq!(dec.raw(1), Err(Error::UnexpectedEnd));
    Ok(())
}

#[test]
fn test_recycled_buffer_is_cleared() -> Result<()> {
    let mut enc = Encoder::with_buffer(vec![9, 9, 9]);
    assert!(enc.is_empty());
    enc.unit()?;
    assert_eq!(enc.into_bytes()?, vec![Tag::Unit as u8]);
    Ok(())
}
