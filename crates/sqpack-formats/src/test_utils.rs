//! Test utilities for format round-trip testing
//!
//! Shared helpers so each header and table test module checks round trips
//! the same way.

use crate::{FormatError, FormatResult, SqPackFormat};
use std::fmt::Debug;

/// Build `original`, parse it back and compare
pub fn test_round_trip<T>(original: &T) -> FormatResult<()>
where
    T: SqPackFormat + PartialEq + Debug,
{
    let data = original.build()?;
    let parsed = T::parse(&data)?;

    if original != &parsed {
        return Err(FormatError::corrupt(format!(
            "Round-trip verification failed:\nOriginal: {:?}\nParsed: {:?}",
            original, parsed
        )));
    }

    Ok(())
}

/// Parse `data`, rebuild it and require identical bytes
///
/// Works for formats without `PartialEq`.
pub fn test_round_trip_with_data<T>(data: &[u8]) -> FormatResult<()>
where
    T: SqPackFormat,
{
    let parsed = T::parse(data)?;
    let rebuilt = parsed.build()?;

    if data != rebuilt.as_slice() {
        let first_difference = data
            .iter()
            .zip(&rebuilt)
            .position(|(a, b)| a != b)
            .unwrap_or(data.len().min(rebuilt.len()));
        return Err(FormatError::corrupt(format!(
            "Round-trip with data failed: {} bytes in, {} bytes out, first difference at {:#x}",
            data.len(),
            rebuilt.len(),
            first_difference
        )));
    }

    Ok(())
}

/// Require that parsing `data` fails with a corruption error
pub fn test_invalid_data_rejected<T>(data: &[u8])
where
    T: SqPackFormat + Debug,
{
    match T::parse(data) {
        Ok(parsed) => panic!("invalid data parsed as {parsed:?}"),
        Err(e) => assert!(e.is_corruption(), "unexpected error kind: {e}"),
    }
}
